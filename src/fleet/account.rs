//! Accounts: per-account owned state plus the fleet registry.
//!
//! Each account's mutable counters live behind its own lock. Writes go
//! through the governor's critical section (fills, releases, resolutions) or
//! the rebalancer (capital); everyone else takes value copies.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::models::{
    AccountSnapshot, AccountStatus, Opportunity, PnlRecord, Position, StrategyKind,
};

/// Bounded per-account window of recently discovered opportunities.
pub const RECENT_OPPORTUNITY_WINDOW: usize = 32;

/// Per-account limits, immutable at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Max single position as a fraction of capital.
    pub max_position_pct: f64,
    /// Max daily loss as a fraction of capital.
    pub max_daily_loss_pct: f64,
    pub max_concurrent_positions: usize,
}

/// Mutable trading state for one account.
pub struct AccountState {
    pub status: AccountStatus,
    pub capital_usd: f64,
    /// Capacity held for authorized-but-not-yet-filled trades.
    pub reserved_usd: f64,
    pub positions: Vec<Position>,
    pub opportunities: VecDeque<Opportunity>,
    pub pnl: PnlRecord,
    /// Cumulative capital withdrawn by rebalancing.
    pub withdrawn_usd: f64,
    pub consecutive_exec_failures: u32,
}

impl AccountState {
    fn new(capital_usd: f64) -> Self {
        Self {
            status: AccountStatus::Idle,
            capital_usd,
            reserved_usd: 0.0,
            positions: Vec::new(),
            opportunities: VecDeque::new(),
            pnl: PnlRecord::default(),
            withdrawn_usd: 0.0,
            consecutive_exec_failures: 0,
        }
    }

    pub fn open_position_total(&self) -> f64 {
        self.positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.size_usd)
            .sum()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.iter().filter(|p| p.is_open()).count()
    }

    /// Record a freshly scanned opportunity, keeping the window bounded.
    pub fn record_opportunity(&mut self, opp: Opportunity) {
        if self.opportunities.len() >= RECENT_OPPORTUNITY_WINDOW {
            self.opportunities.pop_front();
        }
        self.opportunities.push_back(opp);
    }

    pub fn prune_expired_opportunities(&mut self, now: DateTime<Utc>) {
        self.opportunities.retain(|o| !o.is_expired(now));
    }

    pub fn remove_opportunity(&mut self, opportunity_id: &str) {
        self.opportunities.retain(|o| o.id != opportunity_id);
    }

    pub fn find_opportunity(&self, opportunity_id: &str) -> Option<Opportunity> {
        self.opportunities
            .iter()
            .find(|o| o.id == opportunity_id)
            .cloned()
    }

    /// Re-derive the PnL record from current positions and marks.
    pub fn rederive_pnl(&mut self, marks: &BTreeMap<String, f64>, now: DateTime<Utc>) {
        self.pnl = PnlRecord::derive(&self.positions, marks, now);
    }
}

/// One account: immutable identity plus its locked state.
pub struct AccountShared {
    pub id: String,
    pub strategy: StrategyKind,
    pub limits: RiskLimits,
    pub initial_capital_usd: f64,
    pub state: Mutex<AccountState>,
}

pub type AccountHandle = Arc<AccountShared>;

impl AccountShared {
    pub fn new(
        id: impl Into<String>,
        strategy: StrategyKind,
        capital_usd: f64,
        limits: RiskLimits,
    ) -> AccountHandle {
        Arc::new(Self {
            id: id.into(),
            strategy,
            limits,
            initial_capital_usd: capital_usd,
            state: Mutex::new(AccountState::new(capital_usd)),
        })
    }

    pub fn status(&self) -> AccountStatus {
        self.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == AccountStatus::Active
    }

    /// Value copy of this account for observers; the lock is held only long
    /// enough to clone.
    pub fn snapshot(&self, now: DateTime<Utc>) -> AccountSnapshot {
        let state = self.state.lock();
        AccountSnapshot {
            account_id: self.id.clone(),
            strategy: self.strategy,
            status: state.status,
            capital_usd: state.capital_usd,
            open_positions: state.open_position_count(),
            pnl: state.pnl,
            opportunity_count: state
                .opportunities
                .iter()
                .filter(|o| !o.is_expired(now))
                .count(),
        }
    }

    /// Open (unexpired) opportunities held by this account.
    pub fn live_opportunities(&self, now: DateTime<Utc>) -> Vec<Opportunity> {
        self.state
            .lock()
            .opportunities
            .iter()
            .filter(|o| !o.is_expired(now))
            .cloned()
            .collect()
    }
}

/// The fleet's account set. Fixed after configuration load; accounts are
/// never destroyed at runtime.
pub struct AccountRegistry {
    accounts: BTreeMap<String, AccountHandle>,
}

impl AccountRegistry {
    pub fn new(accounts: impl IntoIterator<Item = AccountHandle>) -> Self {
        Self {
            accounts: accounts
                .into_iter()
                .map(|a| (a.id.clone(), a))
                .collect(),
        }
    }

    pub fn get(&self, account_id: &str) -> Option<&AccountHandle> {
        self.accounts.get(account_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AccountHandle> {
        self.accounts.values()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Total capital currently allocated across the fleet.
    pub fn total_capital(&self) -> f64 {
        self.accounts
            .values()
            .map(|a| a.state.lock().capital_usd)
            .sum()
    }

    /// Fleet-wide cumulative PnL, from each account's last derived record.
    pub fn total_pnl(&self) -> f64 {
        self.accounts
            .values()
            .map(|a| a.state.lock().pnl.total)
            .sum()
    }

    /// Which account holds a given opportunity.
    pub fn owner_of_opportunity(&self, opportunity_id: &str) -> Option<AccountHandle> {
        self.accounts
            .values()
            .find(|a| {
                a.state
                    .lock()
                    .opportunities
                    .iter()
                    .any(|o| o.id == opportunity_id)
            })
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PositionStatus, Side};

    fn test_limits() -> RiskLimits {
        RiskLimits {
            max_position_pct: 0.20,
            max_daily_loss_pct: 0.10,
            max_concurrent_positions: 3,
        }
    }

    fn opportunity(id: &str, expires_in_secs: i64) -> Opportunity {
        Opportunity {
            id: id.to_string(),
            account_id: "a1".to_string(),
            strategy: StrategyKind::NegRisk,
            market_id: "m1".to_string(),
            side: Side::Buy,
            entry_price: 0.5,
            expected_profit_usd: 5.0,
            roi_pct: 10.0,
            urgency: crate::models::Urgency::Medium,
            discovered_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in_secs),
        }
    }

    #[test]
    fn test_opportunity_window_bounded() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, test_limits());
        {
            let mut state = account.state.lock();
            for i in 0..(RECENT_OPPORTUNITY_WINDOW + 10) {
                state.record_opportunity(opportunity(&format!("o{i}"), 60));
            }
            assert_eq!(state.opportunities.len(), RECENT_OPPORTUNITY_WINDOW);
        }
    }

    #[test]
    fn test_prune_expired() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, test_limits());
        let mut state = account.state.lock();
        state.record_opportunity(opportunity("live", 60));
        state.record_opportunity(opportunity("dead", -1));
        state.prune_expired_opportunities(Utc::now());
        assert_eq!(state.opportunities.len(), 1);
        assert_eq!(state.opportunities[0].id, "live");
    }

    #[test]
    fn test_open_position_accounting() {
        let account = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, test_limits());
        let mut state = account.state.lock();
        state.positions.push(Position {
            id: "p1".to_string(),
            account_id: "a1".to_string(),
            market_id: "m1".to_string(),
            side: Side::Buy,
            size_usd: 10.0,
            entry_price: 0.5,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
        });
        let mut closed = state.positions[0].clone();
        closed.id = "p2".to_string();
        closed.close(1.0, Utc::now());
        state.positions.push(closed);

        assert_eq!(state.open_position_count(), 1);
        assert!((state.open_position_total() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_registry_owner_lookup() {
        let a1 = AccountShared::new("a1", StrategyKind::NegRisk, 100.0, test_limits());
        let a2 = AccountShared::new("a2", StrategyKind::Weather, 100.0, test_limits());
        a2.state.lock().record_opportunity(opportunity("target", 60));
        let registry = AccountRegistry::new([a1, a2]);

        let owner = registry.owner_of_opportunity("target").unwrap();
        assert_eq!(owner.id, "a2");
        assert!(registry.owner_of_opportunity("missing").is_none());
    }
}
