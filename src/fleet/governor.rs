//! Risk governance.
//!
//! The governor is the only gate between a proposed trade and execution, and
//! the only writer of account counters. `authorize` runs check-then-reserve
//! under a single per-account lock, so two concurrent proposals can never
//! both pass against stale counters. The kill switch lives here as the
//! ultimate risk action: once engaged, no authorization succeeds until an
//! explicit resume.

use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::execution::Fill;
use crate::fleet::account::AccountRegistry;
use crate::fleet::logbuf::LogBuffer;
use crate::market::MarketData;
use crate::models::{AccountStatus, Opportunity, Position, PositionStatus, TradeProposal};
use serde::{Deserialize, Serialize};

/// Consecutive venue failures after which an account is stopped for review.
const EXEC_FAILURE_STOP_THRESHOLD: u32 = 5;

/// Float slack for capital comparisons.
const EPS: f64 = 1e-9;

/// Fleet-wide limits from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioLimits {
    pub max_total_loss_usd: f64,
    pub daily_profit_target_usd: f64,
}

/// Fleet-wide halt flag. Setting it requires no locks, so it is reachable
/// from any error depth; agents watch it for prompt shutdown.
pub struct KillSwitch {
    tx: watch::Sender<bool>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSwitch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Returns true if this call newly engaged the switch.
    pub fn engage(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn resume(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_engaged(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Capacity held for an approved trade until its fill or release.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub account_id: String,
    pub opportunity_id: String,
    pub size_usd: f64,
}

#[derive(Debug)]
pub enum Authorization {
    Approved(Reservation),
    Rejected { reason: String },
}

impl Authorization {
    pub fn is_approved(&self) -> bool {
        matches!(self, Authorization::Approved(_))
    }

    pub fn rejection_reason(&self) -> Option<&str> {
        match self {
            Authorization::Rejected { reason } => Some(reason),
            Authorization::Approved(_) => None,
        }
    }
}

pub struct RiskGovernor {
    registry: Arc<AccountRegistry>,
    limits: PortfolioLimits,
    kill: KillSwitch,
    logs: Arc<LogBuffer>,
}

impl RiskGovernor {
    pub fn new(registry: Arc<AccountRegistry>, limits: PortfolioLimits, logs: Arc<LogBuffer>) -> Self {
        Self {
            registry,
            limits,
            kill: KillSwitch::new(),
            logs,
        }
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill
    }

    /// Engage the fleet-wide kill switch and mark every account stopped.
    /// Idempotent; returns true when this call flipped the switch.
    pub fn engage_kill(&self) -> bool {
        let newly = self.kill.engage();
        self.stop_all_accounts();
        newly
    }

    /// Explicit external action: authorizations may succeed again. Accounts
    /// stay stopped until started individually.
    pub fn resume_trading(&self) {
        self.kill.resume();
    }

    fn stop_all_accounts(&self) {
        for account in self.registry.iter() {
            let mut state = account.state.lock();
            if state.status != AccountStatus::Error {
                state.status = AccountStatus::Stopped;
            }
        }
    }

    /// Validate a proposal and reserve its capacity. Checks run in fixed
    /// order under the account lock; the lock is never held across an await.
    pub fn authorize(&self, account_id: &str, proposal: &TradeProposal) -> Authorization {
        if self.kill.is_engaged() {
            return Authorization::Rejected {
                reason: "kill switch engaged".to_string(),
            };
        }

        let Some(account) = self.registry.get(account_id) else {
            return Authorization::Rejected {
                reason: format!("unknown account: {account_id}"),
            };
        };

        {
            let mut state = account.state.lock();

            if state.status != AccountStatus::Active {
                return Authorization::Rejected {
                    reason: "account inactive".to_string(),
                };
            }

            let max_position = account.limits.max_position_pct * state.capital_usd;
            if proposal.size_usd > max_position + EPS {
                return Authorization::Rejected {
                    reason: "position exceeds limit".to_string(),
                };
            }

            let committed = state.open_position_total() + state.reserved_usd;
            if committed + proposal.size_usd > state.capital_usd + EPS {
                return Authorization::Rejected {
                    reason: "insufficient free capital".to_string(),
                };
            }

            if state.open_position_count() + 1 > account.limits.max_concurrent_positions {
                return Authorization::Rejected {
                    reason: "too many concurrent positions".to_string(),
                };
            }

            let daily_loss = (-state.pnl.daily).max(0.0);
            let max_daily = account.limits.max_daily_loss_pct * state.capital_usd;
            if daily_loss + proposal.worst_case_loss_usd > max_daily + EPS {
                state.status = AccountStatus::Stopped;
                drop(state);
                self.logs.warning(
                    Some(account_id),
                    "daily loss limit would be breached; account stopped",
                );
                return Authorization::Rejected {
                    reason: "daily loss limit".to_string(),
                };
            }

            state.reserved_usd += proposal.size_usd;
        }

        // Portfolio-wide cumulative loss, read across accounts one lock at a
        // time after the reservation is in place.
        if self.registry.total_pnl() <= -self.limits.max_total_loss_usd {
            {
                let mut state = account.state.lock();
                state.reserved_usd = (state.reserved_usd - proposal.size_usd).max(0.0);
            }
            self.trip_portfolio_stop();
            return Authorization::Rejected {
                reason: "portfolio loss limit reached".to_string(),
            };
        }

        debug!(
            account = account_id,
            opportunity = %proposal.opportunity_id,
            size_usd = proposal.size_usd,
            "trade authorized"
        );

        Authorization::Approved(Reservation {
            account_id: account_id.to_string(),
            opportunity_id: proposal.opportunity_id.clone(),
            size_usd: proposal.size_usd,
        })
    }

    fn trip_portfolio_stop(&self) {
        if self.kill.engage() {
            self.logs.critical(None, "portfolio loss limit reached");
            self.stop_all_accounts();
        }
    }

    /// Convert a reservation into an open position after the venue fill.
    pub fn apply_fill(&self, reservation: &Reservation, opp: &Opportunity, fill: &Fill) {
        let Some(account) = self.registry.get(&reservation.account_id) else {
            return;
        };
        let mut state = account.state.lock();
        state.reserved_usd = (state.reserved_usd - reservation.size_usd).max(0.0);
        state.consecutive_exec_failures = 0;
        state.positions.push(Position {
            id: fill.order_id.clone(),
            account_id: reservation.account_id.clone(),
            market_id: opp.market_id.clone(),
            side: opp.side,
            size_usd: fill.filled_notional_usd,
            entry_price: fill.filled_price,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
        });
        state.remove_opportunity(&opp.id);
    }

    /// Return reserved capacity after a failed venue submission. The account
    /// is not penalized unless failures repeat beyond the threshold.
    pub fn release(&self, reservation: &Reservation, reason: &str) {
        let Some(account) = self.registry.get(&reservation.account_id) else {
            return;
        };
        let stopped = {
            let mut state = account.state.lock();
            state.reserved_usd = (state.reserved_usd - reservation.size_usd).max(0.0);
            state.consecutive_exec_failures += 1;
            if state.consecutive_exec_failures >= EXEC_FAILURE_STOP_THRESHOLD
                && state.status == AccountStatus::Active
            {
                state.status = AccountStatus::Stopped;
                true
            } else {
                false
            }
        };
        debug!(account = %reservation.account_id, reason, "reservation released");
        if stopped {
            self.logs.warning(
                Some(&reservation.account_id),
                format!("stopped after {EXEC_FAILURE_STOP_THRESHOLD} consecutive execution failures"),
            );
        }
    }

    /// Apply resolutions and marks for an account, then re-derive its PnL.
    /// Market reads happen before the lock is taken.
    pub fn sync_market_state(&self, account_id: &str, market: &dyn MarketData) {
        let Some(account) = self.registry.get(account_id) else {
            return;
        };

        let open_markets: Vec<String> = {
            let state = account.state.lock();
            state
                .positions
                .iter()
                .filter(|p| p.is_open())
                .map(|p| p.market_id.clone())
                .collect()
        };

        let mut marks = BTreeMap::new();
        let mut resolutions = Vec::new();
        for market_id in open_markets {
            if let Some(res) = market.resolution(&market_id) {
                resolutions.push(res);
            } else if let Some(mark) = market.mark_price(&market_id) {
                marks.insert(market_id, mark);
            }
        }

        let now = Utc::now();
        let mut state = account.state.lock();
        for res in &resolutions {
            for position in state.positions.iter_mut() {
                if position.is_open() && position.market_id == res.market_id {
                    let realized = position.close(res.outcome_price, res.resolved_at);
                    debug!(
                        account = account_id,
                        market = %res.market_id,
                        realized_usd = realized,
                        "position closed on resolution"
                    );
                }
            }
        }
        state.prune_expired_opportunities(now);
        state.rederive_pnl(&marks, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::account::{AccountShared, RiskLimits};
    use crate::models::{Side, StrategyKind};

    fn limits(max_position_pct: f64, max_daily_loss_pct: f64, max_concurrent: usize) -> RiskLimits {
        RiskLimits {
            max_position_pct,
            max_daily_loss_pct,
            max_concurrent_positions: max_concurrent,
        }
    }

    fn proposal(size: f64) -> TradeProposal {
        TradeProposal {
            opportunity_id: "o1".to_string(),
            market_id: "m1".to_string(),
            side: Side::Buy,
            size_usd: size,
            limit_price: 0.5,
            worst_case_loss_usd: size,
        }
    }

    fn governor_for(
        accounts: Vec<std::sync::Arc<AccountShared>>,
        max_total_loss: f64,
    ) -> (RiskGovernor, Arc<LogBuffer>) {
        let registry = Arc::new(AccountRegistry::new(accounts));
        let logs = Arc::new(LogBuffer::default());
        let governor = RiskGovernor::new(
            registry,
            PortfolioLimits {
                max_total_loss_usd: max_total_loss,
                daily_profit_target_usd: 100.0,
            },
            logs.clone(),
        );
        (governor, logs)
    }

    fn activate(account: &AccountShared) {
        account.state.lock().status = AccountStatus::Active;
    }

    #[test]
    fn test_rejects_inactive_account() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 50.0, limits(0.2, 0.5, 3));
        let (governor, _) = governor_for(vec![account], 1000.0);
        let auth = governor.authorize("a1", &proposal(5.0));
        assert_eq!(auth.rejection_reason(), Some("account inactive"));
    }

    #[test]
    fn test_position_exceeds_limit() {
        // $50 capital at 20% caps a single position at $10; $15 must bounce.
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 50.0, limits(0.2, 0.5, 3));
        activate(&account);
        let (governor, _) = governor_for(vec![account.clone()], 1000.0);

        let auth = governor.authorize("a1", &proposal(15.0));
        assert_eq!(auth.rejection_reason(), Some("position exceeds limit"));
        assert_eq!(account.state.lock().positions.len(), 0);

        let auth = governor.authorize("a1", &proposal(10.0));
        assert!(auth.is_approved());
    }

    #[test]
    fn test_reserve_prevents_oversubscription() {
        // Two sequential approvals cannot jointly exceed capital even though
        // each passes the per-position cap alone.
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 30.0, limits(1.0, 10.0, 10));
        activate(&account);
        let (governor, _) = governor_for(vec![account.clone()], 10_000.0);

        assert!(governor.authorize("a1", &proposal(20.0)).is_approved());
        let second = governor.authorize("a1", &proposal(20.0));
        assert_eq!(second.rejection_reason(), Some("insufficient free capital"));
    }

    #[test]
    fn test_too_many_concurrent_positions() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, limits(0.5, 10.0, 1));
        activate(&account);
        let (governor, _) = governor_for(vec![account.clone()], 10_000.0);

        let auth = governor.authorize("a1", &proposal(10.0));
        let Authorization::Approved(reservation) = auth else {
            panic!("expected approval");
        };
        let opp = Opportunity {
            id: "o1".to_string(),
            account_id: "a1".to_string(),
            strategy: StrategyKind::NegRisk,
            market_id: "m1".to_string(),
            side: Side::Buy,
            entry_price: 0.5,
            expected_profit_usd: 1.0,
            roi_pct: 2.0,
            urgency: crate::models::Urgency::Low,
            discovered_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(1),
        };
        let fill = Fill {
            order_id: "f1".to_string(),
            filled_notional_usd: 10.0,
            filled_price: 0.5,
            filled_at: Utc::now().timestamp(),
            fees_usd: 0.0,
            slippage_bps: 0.0,
            latency_ms: 0,
        };
        governor.apply_fill(&reservation, &opp, &fill);

        let auth = governor.authorize("a1", &proposal(10.0));
        assert_eq!(
            auth.rejection_reason(),
            Some("too many concurrent positions")
        );
    }

    #[test]
    fn test_daily_loss_breach_stops_account() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, limits(0.5, 0.05, 5));
        activate(&account);
        account.state.lock().pnl.daily = -3.0;
        let (governor, logs) = governor_for(vec![account.clone()], 10_000.0);

        // Max daily loss $5; $3 already lost, worst case $4 more => breach.
        let auth = governor.authorize("a1", &proposal(4.0));
        assert_eq!(auth.rejection_reason(), Some("daily loss limit"));
        assert_eq!(account.status(), AccountStatus::Stopped);
        assert_eq!(logs.count_matching("daily loss limit"), 1);
    }

    #[test]
    fn test_portfolio_loss_trips_kill_switch_once() {
        let a1 = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, limits(0.5, 1.0, 5));
        let a2 = AccountShared::new("a2", StrategyKind::Weather, 100.0, limits(0.5, 1.0, 5));
        activate(&a1);
        activate(&a2);
        a1.state.lock().pnl.daily = 0.0;
        a1.state.lock().pnl.total = -60.0;
        let (governor, logs) = governor_for(vec![a1.clone(), a2.clone()], 50.0);

        let auth = governor.authorize("a2", &proposal(5.0));
        assert_eq!(auth.rejection_reason(), Some("portfolio loss limit reached"));
        assert_eq!(a1.status(), AccountStatus::Stopped);
        assert_eq!(a2.status(), AccountStatus::Stopped);
        assert_eq!(logs.count_matching("portfolio loss limit reached"), 1);
        // Reservation was returned before the stop.
        assert!(a2.state.lock().reserved_usd.abs() < 1e-9);

        // Subsequent proposals bounce on the engaged switch and do not log a
        // second fleet-wide event.
        let auth = governor.authorize("a2", &proposal(5.0));
        assert_eq!(auth.rejection_reason(), Some("kill switch engaged"));
        assert_eq!(logs.count_matching("portfolio loss limit reached"), 1);
    }

    #[test]
    fn test_resume_allows_authorization_again() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, limits(0.5, 1.0, 5));
        activate(&account);
        let (governor, _) = governor_for(vec![account.clone()], 10_000.0);

        governor.engage_kill();
        assert_eq!(
            governor
                .authorize("a1", &proposal(5.0))
                .rejection_reason(),
            Some("kill switch engaged")
        );

        governor.resume_trading();
        // The account is still stopped until started again.
        assert_eq!(
            governor
                .authorize("a1", &proposal(5.0))
                .rejection_reason(),
            Some("account inactive")
        );
        activate(&account);
        assert!(governor.authorize("a1", &proposal(5.0)).is_approved());
    }

    #[test]
    fn test_release_restores_capacity_and_counts_failures() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, limits(0.5, 10.0, 10));
        activate(&account);
        let (governor, logs) = governor_for(vec![account.clone()], 10_000.0);

        for i in 0..EXEC_FAILURE_STOP_THRESHOLD {
            let auth = governor.authorize("a1", &proposal(10.0));
            let Authorization::Approved(reservation) = auth else {
                panic!("approval expected on attempt {i}");
            };
            assert!(account.state.lock().reserved_usd > 0.0);
            governor.release(&reservation, "venue unavailable");
            assert!(account.state.lock().reserved_usd.abs() < 1e-9);
        }

        assert_eq!(account.status(), AccountStatus::Stopped);
        assert_eq!(logs.count_matching("consecutive execution failures"), 1);
    }
}
