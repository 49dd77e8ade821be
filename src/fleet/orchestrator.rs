//! Fleet scheduler.
//!
//! Owns the set of running agent tasks: one tokio task per account. Starting,
//! stopping, the fleet-wide kill switch and the manual execute action all go
//! through here. Faults inside an agent tick never escape their task; the
//! offending account is isolated and every other loop keeps running.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::execution::ExecutionVenue;
use crate::fleet::account::{AccountHandle, AccountRegistry};
use crate::fleet::agent::{run_agent_loop, AgentCommand, AgentContext};
use crate::fleet::governor::RiskGovernor;
use crate::fleet::logbuf::LogBuffer;
use crate::market::MarketData;
use crate::models::AccountStatus;
use crate::strategy::{build_strategy, Strategy};

/// Bounded wait for agents to acknowledge a stop or kill signal.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);
const COMMAND_QUEUE_DEPTH: usize = 16;

/// Explicit success/failure outcome of a state-changing call.
#[derive(Debug, Clone)]
pub struct OpOutcome {
    pub success: bool,
    pub reason: String,
}

impl OpOutcome {
    pub fn ok(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            reason: reason.into(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

struct AgentTask {
    stop_tx: watch::Sender<bool>,
    commands: mpsc::Sender<AgentCommand>,
    handle: JoinHandle<()>,
}

pub struct Orchestrator {
    registry: Arc<AccountRegistry>,
    governor: Arc<RiskGovernor>,
    logs: Arc<LogBuffer>,
    market: Arc<dyn MarketData>,
    venue: Arc<dyn ExecutionVenue>,
    tick_interval: Duration,
    strategy_overrides: HashMap<String, Arc<dyn Strategy>>,
    tasks: Mutex<HashMap<String, AgentTask>>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<AccountRegistry>,
        governor: Arc<RiskGovernor>,
        logs: Arc<LogBuffer>,
        market: Arc<dyn MarketData>,
        venue: Arc<dyn ExecutionVenue>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            registry,
            governor,
            logs,
            market,
            venue,
            tick_interval,
            strategy_overrides: HashMap::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Swap in a specific strategy instance for one account. Must be called
    /// before the orchestrator is shared; the test suites use this to inject
    /// scripted strategies.
    pub fn set_strategy_override(&mut self, account_id: impl Into<String>, strategy: Arc<dyn Strategy>) {
        self.strategy_overrides.insert(account_id.into(), strategy);
    }

    fn context_for(&self, account: &AccountHandle) -> AgentContext {
        let strategy = self
            .strategy_overrides
            .get(&account.id)
            .cloned()
            .unwrap_or_else(|| build_strategy(account.strategy));
        AgentContext {
            account: account.clone(),
            strategy,
            market: self.market.clone(),
            venue: self.venue.clone(),
            governor: self.governor.clone(),
            logs: self.logs.clone(),
            tick_interval: self.tick_interval,
        }
    }

    /// Transition idle/stopped -> active and launch the agent loop. No-op if
    /// already active.
    pub async fn start(&self, account_id: &str) -> OpOutcome {
        if self.governor.kill_switch().is_engaged() {
            return OpOutcome::fail("kill switch engaged; resume first");
        }
        let Some(account) = self.registry.get(account_id) else {
            return OpOutcome::fail(format!("unknown account: {account_id}"));
        };

        let mut tasks = self.tasks.lock().await;
        {
            let mut state = account.state.lock();
            match state.status {
                AccountStatus::Active => return OpOutcome::ok("already active"),
                AccountStatus::Idle | AccountStatus::Stopped => {
                    state.status = AccountStatus::Active;
                }
                AccountStatus::Error => {
                    return OpOutcome::fail("account in error state; reset first")
                }
            }
        }
        // Reap any finished task left over from a previous run.
        tasks.remove(account_id);

        let (stop_tx, stop_rx) = watch::channel(false);
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let kill_rx = self.governor.kill_switch().watch();
        let ctx = self.context_for(account);
        let handle = tokio::spawn(run_agent_loop(ctx, stop_rx, kill_rx, cmd_rx));
        tasks.insert(
            account_id.to_string(),
            AgentTask {
                stop_tx,
                commands: cmd_tx,
                handle,
            },
        );

        self.logs.info(Some(account_id), "account started");
        OpOutcome::ok("started")
    }

    /// Transition active -> stopped and wait (bounded) for the agent loop to
    /// exit. The loop finishes or abandons its current tick; no trade is
    /// left partially applied.
    pub async fn stop(&self, account_id: &str) -> OpOutcome {
        let Some(account) = self.registry.get(account_id) else {
            return OpOutcome::fail(format!("unknown account: {account_id}"));
        };

        let mut tasks = self.tasks.lock().await;
        {
            let mut state = account.state.lock();
            match state.status {
                AccountStatus::Active | AccountStatus::Stopped => {
                    state.status = AccountStatus::Stopped;
                }
                AccountStatus::Idle => return OpOutcome::ok("account idle"),
                AccountStatus::Error => {
                    return OpOutcome::fail("account in error state; reset instead")
                }
            }
        }

        if let Some(task) = tasks.remove(account_id) {
            let _ = task.stop_tx.send(true);
            let mut handle = task.handle;
            if timeout(ACK_TIMEOUT, &mut handle).await.is_err() {
                handle.abort();
                self.logs.warning(
                    Some(account_id),
                    "agent did not acknowledge stop in time; aborted",
                );
            }
        }

        self.logs.info(Some(account_id), "account stopped");
        OpOutcome::ok("stopped")
    }

    /// Manual recovery: error -> idle only.
    pub async fn reset(&self, account_id: &str) -> OpOutcome {
        let Some(account) = self.registry.get(account_id) else {
            return OpOutcome::fail(format!("unknown account: {account_id}"));
        };
        let mut tasks = self.tasks.lock().await;
        tasks.remove(account_id);
        let mut state = account.state.lock();
        if state.status != AccountStatus::Error {
            return OpOutcome::fail("account not in error state");
        }
        state.status = AccountStatus::Idle;
        drop(state);
        self.logs.info(Some(account_id), "account reset to idle");
        OpOutcome::ok("reset")
    }

    /// Fleet-wide unconditional stop. Engages the governor's kill flag first
    /// (no authorization passes from this instant), marks every account
    /// stopped, then waits up to `ACK_TIMEOUT` for all agent loops to exit.
    /// Stragglers are aborted and logged. Idempotent; always succeeds.
    pub async fn kill_switch(&self) -> OpOutcome {
        if self.governor.engage_kill() {
            self.logs
                .critical(None, "kill switch engaged; all accounts stopped");
        }

        let drained: Vec<(String, AgentTask)> = {
            let mut tasks = self.tasks.lock().await;
            tasks.drain().collect()
        };

        let deadline = Instant::now() + ACK_TIMEOUT;
        for (account_id, task) in drained {
            let _ = task.stop_tx.send(true);
            let mut handle = task.handle;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut handle).await.is_err() {
                handle.abort();
                self.logs.critical(
                    Some(&account_id),
                    "agent did not acknowledge kill in time; force-marked stopped",
                );
            }
        }

        OpOutcome::ok("kill switch engaged")
    }

    /// Explicit external action clearing the kill flag. Accounts stay
    /// stopped until started individually.
    pub async fn resume_all(&self) -> OpOutcome {
        self.governor.resume_trading();
        self.logs
            .info(None, "kill switch cleared; accounts may be started");
        OpOutcome::ok("resumed")
    }

    pub async fn start_all(&self) -> OpOutcome {
        let mut failures = Vec::new();
        for account_id in self.registry.ids() {
            let outcome = self.start(&account_id).await;
            if !outcome.success {
                failures.push(format!("{account_id}: {}", outcome.reason));
            }
        }
        if failures.is_empty() {
            OpOutcome::ok("all accounts started")
        } else {
            OpOutcome::fail(failures.join("; "))
        }
    }

    /// Route a manual execute action to the owning account's agent.
    pub async fn execute_opportunity(&self, opportunity_id: &str) -> OpOutcome {
        let Some(owner) = self.registry.owner_of_opportunity(opportunity_id) else {
            return OpOutcome::fail("unknown opportunity");
        };

        let commands = {
            let tasks = self.tasks.lock().await;
            tasks.get(&owner.id).map(|t| t.commands.clone())
        };
        let Some(commands) = commands else {
            return OpOutcome::fail("account not running");
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = AgentCommand::Execute {
            opportunity_id: opportunity_id.to_string(),
            reply: reply_tx,
        };
        if commands.send(command).await.is_err() {
            return OpOutcome::fail("agent unavailable");
        }

        match timeout(ACK_TIMEOUT, reply_rx).await {
            Ok(Ok(outcome)) => OpOutcome {
                success: outcome.success,
                reason: outcome.reason,
            },
            _ => OpOutcome::fail("execute timed out"),
        }
    }

    /// Number of agent loops currently tracked (test/diagnostic aid).
    pub async fn running_tasks(&self) -> usize {
        self.tasks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{PaperVenue, PaperVenueConfig};
    use crate::fleet::account::{AccountShared, RiskLimits};
    use crate::fleet::governor::PortfolioLimits;
    use crate::market::{MarketQuote, SimMarketConfig, SimulatedMarketData};
    use crate::models::StrategyKind;
    use crate::models::Urgency;
    use async_trait::async_trait;
    use chrono::Utc;

    /// Strategy that panics during scan; used to inject faults.
    struct PanicStrategy;

    #[async_trait]
    impl Strategy for PanicStrategy {
        fn kind(&self) -> StrategyKind {
            StrategyKind::NegRisk
        }

        fn scan(
            &self,
            _account_id: &str,
            _quotes: &[MarketQuote],
            _now: chrono::DateTime<Utc>,
        ) -> Vec<crate::models::Opportunity> {
            panic!("injected fault");
        }

        fn evaluate(&self, _opp: &crate::models::Opportunity) -> bool {
            false
        }
    }

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_pct: 0.20,
            max_daily_loss_pct: 0.50,
            max_concurrent_positions: 3,
        }
    }

    fn quiet_market() -> Arc<SimulatedMarketData> {
        Arc::new(SimulatedMarketData::new(SimMarketConfig {
            walk_step: 0.0,
            mispricing_prob: 0.0,
            market_lifetime: chrono::Duration::minutes(10),
            markets_per_strategy: 0,
        }))
    }

    fn build(accounts: Vec<std::sync::Arc<AccountShared>>) -> (Orchestrator, Arc<LogBuffer>) {
        let registry = Arc::new(AccountRegistry::new(accounts));
        let logs = Arc::new(LogBuffer::default());
        let governor = Arc::new(RiskGovernor::new(
            registry.clone(),
            PortfolioLimits {
                max_total_loss_usd: 10_000.0,
                daily_profit_target_usd: 100.0,
            },
            logs.clone(),
        ));
        let orchestrator = Orchestrator::new(
            registry,
            governor,
            logs.clone(),
            quiet_market(),
            Arc::new(PaperVenue::new(PaperVenueConfig::frictionless())),
            Duration::from_millis(10),
        );
        (orchestrator, logs)
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, limits());
        let (orchestrator, _) = build(vec![account.clone()]);

        assert!(orchestrator.start("a1").await.success);
        assert_eq!(account.status(), AccountStatus::Active);
        let again = orchestrator.start("a1").await;
        assert!(again.success);
        assert_eq!(again.reason, "already active");
        assert_eq!(orchestrator.running_tasks().await, 1);

        orchestrator.kill_switch().await;
    }

    #[tokio::test]
    async fn test_stop_and_manual_resume() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, limits());
        let (orchestrator, _) = build(vec![account.clone()]);

        orchestrator.start("a1").await;
        let outcome = orchestrator.stop("a1").await;
        assert!(outcome.success);
        assert_eq!(account.status(), AccountStatus::Stopped);
        assert_eq!(orchestrator.running_tasks().await, 0);

        // Stopped accounts resume only via an explicit start.
        assert!(orchestrator.start("a1").await.success);
        assert_eq!(account.status(), AccountStatus::Active);
        orchestrator.kill_switch().await;
    }

    #[tokio::test]
    async fn test_unknown_account_fails_with_reason() {
        let (orchestrator, _) = build(vec![AccountShared::new(
            "a1",
            StrategyKind::NegRisk,
            100.0,
            limits(),
        )]);
        let outcome = orchestrator.start("ghost").await;
        assert!(!outcome.success);
        assert!(outcome.reason.contains("unknown account"));
    }

    #[tokio::test]
    async fn test_kill_switch_stops_everything_and_is_idempotent() {
        let accounts: Vec<_> = (0..4)
            .map(|i| AccountShared::new(format!("a{i}"), StrategyKind::NegRisk, 100.0, limits()))
            .collect();
        let (orchestrator, _) = build(accounts.clone());
        orchestrator.start_all().await;
        assert_eq!(orchestrator.running_tasks().await, 4);

        assert!(orchestrator.kill_switch().await.success);
        for account in &accounts {
            assert_eq!(account.status(), AccountStatus::Stopped);
        }
        assert_eq!(orchestrator.running_tasks().await, 0);

        // Second engage is a quiet no-op.
        assert!(orchestrator.kill_switch().await.success);

        // Starting while engaged is refused until resume.
        let refused = orchestrator.start("a0").await;
        assert!(!refused.success);
        orchestrator.resume_all().await;
        assert!(orchestrator.start("a0").await.success);
        orchestrator.kill_switch().await;
    }

    #[tokio::test]
    async fn test_fault_is_isolated_to_one_account() {
        let accounts: Vec<_> = (0..10)
            .map(|i| AccountShared::new(format!("a{i}"), StrategyKind::NegRisk, 100.0, limits()))
            .collect();
        let (mut orchestrator, logs) = build(accounts.clone());
        orchestrator.set_strategy_override("a5", Arc::new(PanicStrategy));
        let orchestrator = Arc::new(orchestrator);

        orchestrator.start_all().await;
        tokio::time::sleep(Duration::from_millis(150)).await;

        for (i, account) in accounts.iter().enumerate() {
            if i == 5 {
                assert_eq!(account.status(), AccountStatus::Error, "a5 must be isolated");
            } else {
                assert_eq!(
                    account.status(),
                    AccountStatus::Active,
                    "a{i} must keep running"
                );
                assert_eq!(account.state.lock().pnl.total, 0.0);
            }
        }
        // The transition happened exactly once.
        assert_eq!(logs.count_matching("unhandled fault isolated"), 1);

        // Reset brings the account back to idle, from which it can start.
        assert!(orchestrator.reset("a5").await.success);
        assert_eq!(accounts[5].status(), AccountStatus::Idle);

        orchestrator.kill_switch().await;
    }
}
