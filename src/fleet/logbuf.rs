//! Bounded fleet log.
//!
//! Append-only ring of `LogEvent`s; observers only ever see a bounded tail.
//! Every record is mirrored to `tracing` so operators get the same stream.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{error, info, warn};

use crate::models::{LogEvent, Severity};

pub const DEFAULT_LOG_CAPACITY: usize = 256;

pub struct LogBuffer {
    events: Mutex<VecDeque<LogEvent>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, severity: Severity, account_id: Option<&str>, message: impl Into<String>) {
        let message = message.into();
        let scope = account_id.unwrap_or("fleet");
        match severity {
            Severity::Info => info!(account = scope, "{message}"),
            Severity::Warning => warn!(account = scope, "{message}"),
            Severity::Critical => error!(account = scope, "{message}"),
        }

        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(LogEvent {
            at: Utc::now(),
            account_id: account_id.map(|s| s.to_string()),
            severity,
            message,
        });
    }

    pub fn info(&self, account_id: Option<&str>, message: impl Into<String>) {
        self.record(Severity::Info, account_id, message);
    }

    pub fn warning(&self, account_id: Option<&str>, message: impl Into<String>) {
        self.record(Severity::Warning, account_id, message);
    }

    pub fn critical(&self, account_id: Option<&str>, message: impl Into<String>) {
        self.record(Severity::Critical, account_id, message);
    }

    /// Last `n` events, oldest first.
    pub fn tail(&self, n: usize) -> Vec<LogEvent> {
        let events = self.events.lock();
        let skip = events.len().saturating_sub(n);
        events.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Number of stored events matching `needle`, for tests and audits.
    pub fn count_matching(&self, needle: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.message.contains(needle))
            .count()
    }
}
