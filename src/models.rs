//! Core domain types shared across the fleet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Lifecycle state of a trading account.
///
/// `idle -> active` (start), `active -> stopped` (stop / kill switch),
/// `stopped -> active` (manual resume), `active -> error` (unhandled fault),
/// `error -> idle` (manual reset only).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Idle,
    Active,
    Stopped,
    Error,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Idle => "idle",
            AccountStatus::Active => "active",
            AccountStatus::Stopped => "stopped",
            AccountStatus::Error => "error",
        }
    }
}

/// Closed set of strategy variants. New strategies implement the `Strategy`
/// trait and get a variant here; orchestration code never matches on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[serde(rename = "negrisk")]
    NegRisk,
    SingleCondition,
    CrossPlatform,
    Weather,
    Temporal,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::NegRisk => "negrisk",
            StrategyKind::SingleCondition => "single_condition",
            StrategyKind::CrossPlatform => "cross_platform",
            StrategyKind::Weather => "weather",
            StrategyKind::Temporal => "temporal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

/// A candidate trade identified by an agent's scan.
///
/// Opportunities are account-scoped: two accounts that independently discover
/// the same market each hold their own copy and are never reconciled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub account_id: String,
    pub strategy: StrategyKind,
    pub market_id: String,
    pub side: Side,
    /// Entry price (0..1) at discovery time.
    pub entry_price: f64,
    pub expected_profit_usd: f64,
    pub roi_pct: f64,
    pub urgency: Urgency,
    pub discovered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum PositionStatus {
    Open,
    Closed {
        closed_at: DateTime<Utc>,
        exit_price: f64,
        realized_pnl_usd: f64,
    },
}

/// An open or closed stake taken against an opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub account_id: String,
    pub market_id: String,
    pub side: Side,
    /// Notional committed at entry, in USD.
    pub size_usd: f64,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
}

impl Position {
    pub fn is_open(&self) -> bool {
        matches!(self.status, PositionStatus::Open)
    }

    /// Shares implied by the entry notional.
    pub fn shares(&self) -> f64 {
        if self.entry_price > 0.0 {
            self.size_usd / self.entry_price
        } else {
            0.0
        }
    }

    /// Mark-to-market profit for an open position at `mark`.
    pub fn unrealized_pnl(&self, mark: f64) -> f64 {
        let per_share = match self.side {
            Side::Buy => mark - self.entry_price,
            Side::Sell => self.entry_price - mark,
        };
        per_share * self.shares()
    }

    /// Close the position at `exit_price`, realizing its PnL.
    pub fn close(&mut self, exit_price: f64, now: DateTime<Utc>) -> f64 {
        let realized = self.unrealized_pnl(exit_price);
        self.status = PositionStatus::Closed {
            closed_at: now,
            exit_price,
            realized_pnl_usd: realized,
        };
        realized
    }
}

/// Realized + unrealized PnL over rolling windows, re-derived from positions
/// each tick rather than mutated incrementally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PnlRecord {
    pub daily: f64,
    pub weekly: f64,
    pub monthly: f64,
    /// Cumulative since start; drives the portfolio loss limit.
    pub total: f64,
}

impl PnlRecord {
    pub fn accumulate(&mut self, other: &PnlRecord) {
        self.daily += other.daily;
        self.weekly += other.weekly;
        self.monthly += other.monthly;
        self.total += other.total;
    }

    /// Derive a fresh record from a position set. Open positions are marked
    /// against `marks` (falling back to entry price when no mark is known).
    pub fn derive(
        positions: &[Position],
        marks: &BTreeMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut rec = PnlRecord::default();
        for position in positions {
            match &position.status {
                PositionStatus::Open => {
                    let mark = marks
                        .get(&position.market_id)
                        .copied()
                        .unwrap_or(position.entry_price);
                    let unrealized = position.unrealized_pnl(mark);
                    rec.daily += unrealized;
                    rec.weekly += unrealized;
                    rec.monthly += unrealized;
                    rec.total += unrealized;
                }
                PositionStatus::Closed {
                    closed_at,
                    realized_pnl_usd,
                    ..
                } => {
                    let age = now.signed_duration_since(*closed_at);
                    if age <= chrono::Duration::days(1) {
                        rec.daily += realized_pnl_usd;
                    }
                    if age <= chrono::Duration::days(7) {
                        rec.weekly += realized_pnl_usd;
                    }
                    if age <= chrono::Duration::days(30) {
                        rec.monthly += realized_pnl_usd;
                    }
                    rec.total += realized_pnl_usd;
                }
            }
        }
        rec
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Append-only fleet log entry. `account_id` is None for fleet-wide events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub at: DateTime<Utc>,
    pub account_id: Option<String>,
    pub severity: Severity,
    pub message: String,
}

/// A trade the agent asks the governor to authorize.
#[derive(Debug, Clone)]
pub struct TradeProposal {
    pub opportunity_id: String,
    pub market_id: String,
    pub side: Side,
    pub size_usd: f64,
    pub limit_price: f64,
    /// Loss if the market settles fully against this trade.
    pub worst_case_loss_usd: f64,
}

/// Loss if a binary-outcome stake settles against us: a buy loses its full
/// notional at 0, a short loses the payout gap at 1.
pub fn worst_case_loss(side: Side, size_usd: f64, price: f64) -> f64 {
    match side {
        Side::Buy => size_usd,
        Side::Sell => {
            let p = price.clamp(0.01, 0.99);
            size_usd * (1.0 - p) / p
        }
    }
}

// ===== Snapshot types =====

/// Value copy of one account's state at the moment it was read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub strategy: StrategyKind,
    pub status: AccountStatus,
    pub capital_usd: f64,
    pub open_positions: usize,
    pub pnl: PnlRecord,
    pub opportunity_count: usize,
}

/// Point-in-time copy of fleet state for observers. Cross-account consistency
/// is approximately simultaneous: each account reflects the instant its lock
/// was taken, not a global instant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub taken_at: DateTime<Utc>,
    pub accounts: Vec<AccountSnapshot>,
    /// All currently open (unexpired) opportunities, most recent first.
    pub open_opportunities: Vec<Opportunity>,
    pub recent_logs: Vec<LogEvent>,
    pub portfolio_pnl: PnlRecord,
    pub position_count: usize,
    pub kill_engaged: bool,
}

impl FleetSnapshot {
    pub fn empty() -> Self {
        Self {
            taken_at: Utc::now(),
            accounts: Vec::new(),
            open_opportunities: Vec::new(),
            recent_logs: Vec::new(),
            portfolio_pnl: PnlRecord::default(),
            position_count: 0,
            kill_engaged: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusEntry {
    pub status: AccountStatus,
    pub opportunity_count: usize,
}

/// The bounded per-interval payload pushed to stream subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamPayload {
    pub timestamp: DateTime<Utc>,
    /// Most recently discovered first, at most 5.
    pub opportunities: Vec<Opportunity>,
    /// Tail of the fleet log, at most 10.
    pub logs: Vec<LogEvent>,
    pub accounts: BTreeMap<String, AgentStatusEntry>,
    pub portfolio_pnl: PnlRecord,
}

/// Events pushed over the streaming subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsServerEvent {
    Snapshot(StreamPayload),
}
