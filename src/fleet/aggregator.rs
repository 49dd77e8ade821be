//! Fleet snapshot assembly.
//!
//! Builds value copies of all account state by taking each account's lock
//! just long enough to clone. Strict cross-account consistency would mean
//! serializing every agent, so a snapshot is only approximately simultaneous;
//! each account reflects the instant it was copied. The latest snapshot sits
//! in an `ArcSwap` cell so observers never touch a writer's lock.

use arc_swap::ArcSwap;
use chrono::Utc;
use std::sync::Arc;

use crate::fleet::account::AccountRegistry;
use crate::fleet::governor::RiskGovernor;
use crate::fleet::logbuf::{LogBuffer, DEFAULT_LOG_CAPACITY};
use crate::models::{FleetSnapshot, PnlRecord};

pub struct StateAggregator {
    registry: Arc<AccountRegistry>,
    governor: Arc<RiskGovernor>,
    logs: Arc<LogBuffer>,
    latest: ArcSwap<FleetSnapshot>,
}

impl StateAggregator {
    pub fn new(
        registry: Arc<AccountRegistry>,
        governor: Arc<RiskGovernor>,
        logs: Arc<LogBuffer>,
    ) -> Self {
        Self {
            registry,
            governor,
            logs,
            latest: ArcSwap::from_pointee(FleetSnapshot::empty()),
        }
    }

    /// Build a fresh snapshot, store it as the latest, and return it.
    pub fn capture(&self) -> Arc<FleetSnapshot> {
        let now = Utc::now();
        let mut accounts = Vec::with_capacity(self.registry.len());
        let mut open_opportunities = Vec::new();
        let mut portfolio_pnl = PnlRecord::default();
        let mut position_count = 0;

        for account in self.registry.iter() {
            let snap = account.snapshot(now);
            portfolio_pnl.accumulate(&snap.pnl);
            position_count += snap.open_positions;
            open_opportunities.extend(account.live_opportunities(now));
            accounts.push(snap);
        }

        // Most recently discovered first.
        open_opportunities.sort_by(|a, b| b.discovered_at.cmp(&a.discovered_at));

        let snapshot = Arc::new(FleetSnapshot {
            taken_at: now,
            accounts,
            open_opportunities,
            recent_logs: self.logs.tail(DEFAULT_LOG_CAPACITY),
            portfolio_pnl,
            position_count,
            kill_engaged: self.governor.kill_switch().is_engaged(),
        });
        self.latest.store(snapshot.clone());
        snapshot
    }

    /// Most recently captured snapshot, without touching any account lock.
    pub fn latest(&self) -> Arc<FleetSnapshot> {
        self.latest.load_full()
    }
}
