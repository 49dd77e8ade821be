//! Periodic capital rebalancing.
//!
//! On its configured cadence the engine reads each account's cumulative PnL
//! and adjusts capital: profits beyond a multiple of the configured target
//! are withdrawn back toward target (removed from the managed total and
//! logged as audit events), and accounts past the drawdown threshold are
//! paused pending strategy review, optionally topped back up to a floor.
//! Each account is adjusted under its own lock, so a concurrent snapshot
//! sees it entirely pre- or entirely post-rebalance, never a mix.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::fleet::account::AccountRegistry;
use crate::fleet::logbuf::LogBuffer;
use crate::models::AccountStatus;

fn default_interval_secs() -> u64 {
    7 * 24 * 3600
}

fn default_withdraw_multiple() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct RebalanceSettings {
    /// Seconds between passes. Weekly by default.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Withdrawals start once net profit exceeds target times this multiple.
    #[serde(default = "default_withdraw_multiple")]
    pub withdraw_multiple: f64,
    /// Drawdown (USD) at which an account is paused. 0 disables pausing.
    #[serde(default)]
    pub loss_pause_threshold_usd: f64,
    /// Capital floor restored on pause. 0 disables top-ups.
    #[serde(default)]
    pub floor_capital_usd: f64,
}

impl Default for RebalanceSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            withdraw_multiple: default_withdraw_multiple(),
            loss_pause_threshold_usd: 0.0,
            floor_capital_usd: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RebalanceReport {
    pub withdrawn_usd: f64,
    pub topped_up_usd: f64,
    pub paused_accounts: usize,
}

pub struct RebalancingEngine {
    registry: Arc<AccountRegistry>,
    logs: Arc<LogBuffer>,
    /// Per-account profit target the withdrawal rule reduces back toward.
    profit_target_usd: f64,
    settings: RebalanceSettings,
}

impl RebalancingEngine {
    pub fn new(
        registry: Arc<AccountRegistry>,
        logs: Arc<LogBuffer>,
        profit_target_usd: f64,
        settings: RebalanceSettings,
    ) -> Self {
        Self {
            registry,
            logs,
            profit_target_usd,
            settings,
        }
    }

    /// One full pass over the fleet.
    pub fn run_pass(&self) -> RebalanceReport {
        let mut report = RebalanceReport::default();

        for account in self.registry.iter() {
            let mut state = account.state.lock();
            if state.status == AccountStatus::Error {
                continue;
            }

            // Profit side: reduce back toward target, withdrawing the excess.
            let net_profit = state.pnl.total - state.withdrawn_usd;
            if self.profit_target_usd > 0.0
                && net_profit > self.profit_target_usd * self.settings.withdraw_multiple
            {
                let excess = net_profit - self.profit_target_usd;
                let amount = excess.min(state.capital_usd);
                if amount > 0.0 {
                    state.capital_usd -= amount;
                    state.withdrawn_usd += amount;
                    report.withdrawn_usd += amount;
                    drop(state);
                    self.logs.info(
                        Some(&account.id),
                        format!("rebalance: withdrew ${amount:.2} of realized profit"),
                    );
                    continue;
                }
            }

            // Loss side: pause for review, optionally restore floor capital.
            let drawdown = -state.pnl.total;
            if self.settings.loss_pause_threshold_usd > 0.0
                && drawdown >= self.settings.loss_pause_threshold_usd
                && state.status == AccountStatus::Active
            {
                state.status = AccountStatus::Stopped;
                report.paused_accounts += 1;

                let mut topped = 0.0;
                if self.settings.floor_capital_usd > 0.0
                    && state.capital_usd < self.settings.floor_capital_usd
                {
                    topped = self.settings.floor_capital_usd - state.capital_usd;
                    state.capital_usd = self.settings.floor_capital_usd;
                    report.topped_up_usd += topped;
                }
                drop(state);

                self.logs.warning(
                    Some(&account.id),
                    format!("rebalance: paused for strategy review (drawdown ${drawdown:.2})"),
                );
                if topped > 0.0 {
                    self.logs.info(
                        Some(&account.id),
                        format!("rebalance: capital topped up ${topped:.2} to floor"),
                    );
                }
            }
        }

        debug!(
            withdrawn = report.withdrawn_usd,
            topped_up = report.topped_up_usd,
            paused = report.paused_accounts,
            "rebalance pass complete"
        );
        report
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so a fresh boot does not
        // rebalance before any trading happened.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.run_pass();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::account::{AccountShared, RiskLimits};
    use crate::models::StrategyKind;

    fn limits() -> RiskLimits {
        RiskLimits {
            max_position_pct: 0.2,
            max_daily_loss_pct: 0.1,
            max_concurrent_positions: 3,
        }
    }

    fn engine(
        accounts: Vec<std::sync::Arc<AccountShared>>,
        profit_target: f64,
        settings: RebalanceSettings,
    ) -> (RebalancingEngine, Arc<LogBuffer>) {
        let registry = Arc::new(AccountRegistry::new(accounts));
        let logs = Arc::new(LogBuffer::default());
        (
            RebalancingEngine::new(registry, logs.clone(), profit_target, settings),
            logs,
        )
    }

    #[test]
    fn test_withdraws_excess_profit_once() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, limits());
        account.state.lock().status = AccountStatus::Active;
        account.state.lock().pnl.total = 30.0;
        let (engine, logs) = engine(
            vec![account.clone()],
            10.0,
            RebalanceSettings::default(),
        );

        let report = engine.run_pass();
        assert!((report.withdrawn_usd - 20.0).abs() < 1e-9);
        assert!((account.state.lock().capital_usd - 80.0).abs() < 1e-9);
        assert_eq!(logs.count_matching("rebalance: withdrew"), 1);

        // Net profit is back at target; a second pass is a no-op.
        let report = engine.run_pass();
        assert_eq!(report.withdrawn_usd, 0.0);
        assert!((account.state.lock().capital_usd - 80.0).abs() < 1e-9);
    }

    #[test]
    fn test_pauses_and_tops_up_losing_account() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 40.0, limits());
        account.state.lock().status = AccountStatus::Active;
        account.state.lock().pnl.total = -25.0;
        let settings = RebalanceSettings {
            loss_pause_threshold_usd: 20.0,
            floor_capital_usd: 50.0,
            ..RebalanceSettings::default()
        };
        let (engine, logs) = engine(vec![account.clone()], 10.0, settings);

        let report = engine.run_pass();
        assert_eq!(report.paused_accounts, 1);
        assert!((report.topped_up_usd - 10.0).abs() < 1e-9);
        assert_eq!(account.status(), AccountStatus::Stopped);
        assert!((account.state.lock().capital_usd - 50.0).abs() < 1e-9);
        assert_eq!(logs.count_matching("paused for strategy review"), 1);

        // Already paused: no repeat events.
        let report = engine.run_pass();
        assert_eq!(report.paused_accounts, 0);
        assert_eq!(logs.count_matching("paused for strategy review"), 1);
    }

    #[test]
    fn test_capital_sum_changes_equal_logged_amounts() {
        let winner = AccountShared::new("w", StrategyKind::NegRisk, 100.0, limits());
        winner.state.lock().status = AccountStatus::Active;
        winner.state.lock().pnl.total = 50.0;
        let loser = AccountShared::new("l", StrategyKind::Weather, 30.0, limits());
        loser.state.lock().status = AccountStatus::Active;
        loser.state.lock().pnl.total = -40.0;
        let steady = AccountShared::new("s", StrategyKind::Temporal, 70.0, limits());
        steady.state.lock().status = AccountStatus::Active;

        let settings = RebalanceSettings {
            loss_pause_threshold_usd: 25.0,
            floor_capital_usd: 35.0,
            ..RebalanceSettings::default()
        };
        let accounts = vec![winner, loser, steady];
        let before: f64 = accounts
            .iter()
            .map(|a| a.state.lock().capital_usd)
            .sum();
        let (engine, _) = engine(accounts.clone(), 10.0, settings);

        let report = engine.run_pass();
        let after: f64 = accounts.iter().map(|a| a.state.lock().capital_usd).sum();

        // Every capital movement is accounted for by the report.
        let expected = before - report.withdrawn_usd + report.topped_up_usd;
        assert!((after - expected).abs() < 1e-9);
        assert!(report.withdrawn_usd > 0.0);
        assert!(report.topped_up_usd > 0.0);
    }
}
