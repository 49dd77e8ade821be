//! Agent error taxonomy.
//!
//! Every failure an agent tick can produce maps onto one of these variants,
//! and each variant has a fixed handling policy:
//! - `TransientData`: retried with bounded backoff, then the tick is skipped.
//! - `Validation`: governor rejection; logged, the candidate is discarded.
//! - `Execution`: venue submission failed; logged, no position is created.
//! - `Fatal`: escalates to the scheduler, which isolates the account.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transient data error: {0}")]
    TransientData(String),

    #[error("rejected: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("fatal agent error: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientData(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    /// Fatal errors terminate the agent loop; everything else is absorbed
    /// within the tick.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientData(_))
    }
}
