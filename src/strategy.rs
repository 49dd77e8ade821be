//! Strategy capability set.
//!
//! Each account runs one strategy behind the `Strategy` trait: `scan` turns
//! raw quotes into candidates, `evaluate` applies the variant's thresholds,
//! `execute` hands an authorized trade to the venue. Orchestration code only
//! sees the trait; adding a strategy means adding an impl here.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::AgentError;
use crate::execution::{ExecutionVenue, Fill, OrderRequest, TimeInForce};
use crate::market::MarketQuote;
use crate::models::{Opportunity, Side, StrategyKind, Urgency};

/// How long a discovered opportunity stays actionable before it expires.
const OPPORTUNITY_TTL_SECS: i64 = 120;

#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Turn this tick's quotes into zero or more candidates.
    fn scan(
        &self,
        account_id: &str,
        quotes: &[MarketQuote],
        now: DateTime<Utc>,
    ) -> Vec<Opportunity>;

    /// Threshold filter. Candidates failing it are discarded, not retried.
    fn evaluate(&self, opp: &Opportunity) -> bool;

    /// Submit the authorized trade. The default is a taker IOC at the
    /// discovery price.
    async fn execute(
        &self,
        venue: &dyn ExecutionVenue,
        opp: &Opportunity,
        size_usd: f64,
    ) -> Result<Fill, AgentError> {
        venue
            .place_order(OrderRequest {
                client_order_id: format!("{}:{}", opp.account_id, opp.id),
                market_id: opp.market_id.clone(),
                side: opp.side,
                price: opp.entry_price,
                notional_usd: size_usd,
                tif: TimeInForce::Ioc,
            })
            .await
    }
}

pub fn build_strategy(kind: StrategyKind) -> Arc<dyn Strategy> {
    match kind {
        StrategyKind::NegRisk => Arc::new(NegRiskStrategy::default()),
        StrategyKind::SingleCondition => Arc::new(SingleConditionStrategy::default()),
        StrategyKind::CrossPlatform => Arc::new(CrossPlatformStrategy::default()),
        StrategyKind::Weather => Arc::new(WeatherStrategy::default()),
        StrategyKind::Temporal => Arc::new(TemporalStrategy::default()),
    }
}

// ===== Position sizing =====

/// Fractional-Kelly sizing inputs.
#[derive(Debug, Clone)]
pub struct SizingParams {
    pub capital_usd: f64,
    /// Fractional Kelly multiplier (0.25 = quarter Kelly).
    pub kelly_fraction: f64,
    /// Hard cap as a fraction of capital.
    pub max_position_pct: f64,
    pub min_position_usd: f64,
}

/// Optimal stake for a binary outcome priced at `market_price` when our
/// estimate of the true probability is `confidence`. Returns 0.0 when there
/// is no edge or the capped stake falls below the minimum.
pub fn kelly_stake(confidence: f64, market_price: f64, params: &SizingParams) -> f64 {
    if !(0.0..=1.0).contains(&confidence) || market_price <= 0.0 || market_price >= 1.0 {
        return 0.0;
    }
    let edge = confidence - market_price;
    if edge <= 0.0 {
        return 0.0;
    }

    // f* = (p*b - q) / b with b = decimal odds - 1.
    let odds = (1.0 / market_price) - 1.0;
    let p = confidence;
    let q = 1.0 - p;
    let full_kelly = ((p * odds - q) / odds).clamp(0.0, 1.0);

    let fraction = (full_kelly * params.kelly_fraction).min(params.max_position_pct);
    let stake = params.capital_usd * fraction;
    if stake < params.min_position_usd {
        0.0
    } else {
        stake
    }
}

/// Implied win probability behind an opportunity's quoted edge, used for
/// sizing the stake.
pub fn implied_confidence(opp: &Opportunity) -> f64 {
    let entry = match opp.side {
        Side::Buy => opp.entry_price,
        Side::Sell => 1.0 - opp.entry_price,
    };
    (entry * (1.0 + opp.roi_pct / 100.0)).clamp(0.01, 0.99)
}

// ===== Shared scan helpers =====

fn urgency_for(roi_pct: f64, time_left: Duration) -> Urgency {
    if roi_pct >= 8.0 || time_left <= Duration::minutes(2) {
        Urgency::High
    } else if roi_pct >= 4.0 {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

fn candidate(
    account_id: &str,
    kind: StrategyKind,
    quote: &MarketQuote,
    side: Side,
    entry_price: f64,
    edge: f64,
    now: DateTime<Utc>,
) -> Opportunity {
    // Profit on a baseline 100-share clip; observers see USD figures.
    let shares = 100.0;
    let expected_profit_usd = edge * shares;
    let roi_pct = if entry_price > 0.0 {
        (edge / entry_price) * 100.0
    } else {
        0.0
    };
    let expires_at = quote
        .expires_at
        .min(now + Duration::seconds(OPPORTUNITY_TTL_SECS));

    Opportunity {
        id: Uuid::new_v4().to_string(),
        account_id: account_id.to_string(),
        strategy: kind,
        market_id: quote.market_id.clone(),
        side,
        entry_price,
        expected_profit_usd,
        roi_pct,
        urgency: urgency_for(roi_pct, expires_at.signed_duration_since(now)),
        discovered_at: now,
        expires_at,
    }
}

// ===== Variants =====

/// Buys underpriced YES/NO bundles: when yes + no sums below 1, the bundle
/// pays $1 at settlement whichever way the market resolves.
pub struct NegRiskStrategy {
    pub min_gap: f64,
    pub min_liquidity_usd: f64,
}

impl Default for NegRiskStrategy {
    fn default() -> Self {
        Self {
            min_gap: 0.02,
            min_liquidity_usd: 25_000.0,
        }
    }
}

#[async_trait]
impl Strategy for NegRiskStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::NegRisk
    }

    fn scan(
        &self,
        account_id: &str,
        quotes: &[MarketQuote],
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        quotes
            .iter()
            .filter(|q| q.liquidity_usd >= self.min_liquidity_usd)
            .filter_map(|q| {
                let gap = 1.0 - q.yes_price - q.no_price;
                if gap <= 0.0 {
                    return None;
                }
                // Enter through the cheaper leg.
                let (side, entry) = if q.yes_price <= q.no_price {
                    (Side::Buy, q.yes_price)
                } else {
                    (Side::Sell, q.yes_price)
                };
                Some(candidate(
                    account_id,
                    self.kind(),
                    q,
                    side,
                    entry,
                    gap,
                    now,
                ))
            })
            .collect()
    }

    fn evaluate(&self, opp: &Opportunity) -> bool {
        opp.expected_profit_usd >= self.min_gap * 100.0
    }
}

/// Fades divergence between one market's price and its modeled fair value.
pub struct SingleConditionStrategy {
    pub min_divergence: f64,
}

impl Default for SingleConditionStrategy {
    fn default() -> Self {
        Self {
            min_divergence: 0.03,
        }
    }
}

#[async_trait]
impl Strategy for SingleConditionStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::SingleCondition
    }

    fn scan(
        &self,
        account_id: &str,
        quotes: &[MarketQuote],
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        quotes
            .iter()
            .filter_map(|q| {
                let fair = q.model_fair_price?;
                let divergence = fair - q.yes_price;
                if divergence.abs() <= 0.0 {
                    return None;
                }
                let side = if divergence > 0.0 {
                    Side::Buy
                } else {
                    Side::Sell
                };
                Some(candidate(
                    account_id,
                    self.kind(),
                    q,
                    side,
                    q.yes_price,
                    divergence.abs(),
                    now,
                ))
            })
            .collect()
    }

    fn evaluate(&self, opp: &Opportunity) -> bool {
        opp.expected_profit_usd >= self.min_divergence * 100.0
    }
}

/// Classic cross-venue spread: the same outcome priced differently elsewhere.
pub struct CrossPlatformStrategy {
    pub min_spread: f64,
    pub min_liquidity_usd: f64,
}

impl Default for CrossPlatformStrategy {
    fn default() -> Self {
        Self {
            min_spread: 0.03,
            min_liquidity_usd: 50_000.0,
        }
    }
}

#[async_trait]
impl Strategy for CrossPlatformStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::CrossPlatform
    }

    fn scan(
        &self,
        account_id: &str,
        quotes: &[MarketQuote],
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        quotes
            .iter()
            .filter(|q| q.liquidity_usd >= self.min_liquidity_usd)
            .filter_map(|q| {
                let external = q.external_yes_price?;
                let spread = external - q.yes_price;
                if spread.abs() <= 0.0 {
                    return None;
                }
                // Buy where it is cheap relative to the other venue.
                let side = if spread > 0.0 { Side::Buy } else { Side::Sell };
                Some(candidate(
                    account_id,
                    self.kind(),
                    q,
                    side,
                    q.yes_price,
                    spread.abs(),
                    now,
                ))
            })
            .collect()
    }

    fn evaluate(&self, opp: &Opportunity) -> bool {
        opp.roi_pct >= self.min_spread * 100.0
    }
}

/// Weather derivative markets lean on a forecast model; bigger divergence is
/// required because the model itself is noisy.
pub struct WeatherStrategy {
    pub min_divergence: f64,
}

impl Default for WeatherStrategy {
    fn default() -> Self {
        Self {
            min_divergence: 0.05,
        }
    }
}

#[async_trait]
impl Strategy for WeatherStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Weather
    }

    fn scan(
        &self,
        account_id: &str,
        quotes: &[MarketQuote],
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        quotes
            .iter()
            .filter_map(|q| {
                let fair = q.model_fair_price?;
                let divergence = fair - q.yes_price;
                if divergence.abs() < self.min_divergence {
                    return None;
                }
                let side = if divergence > 0.0 {
                    Side::Buy
                } else {
                    Side::Sell
                };
                Some(candidate(
                    account_id,
                    self.kind(),
                    q,
                    side,
                    q.yes_price,
                    divergence.abs(),
                    now,
                ))
            })
            .collect()
    }

    fn evaluate(&self, opp: &Opportunity) -> bool {
        opp.expected_profit_usd >= self.min_divergence * 100.0
    }
}

/// Trades stale prices close to resolution, where probability should have
/// collapsed toward 0 or 1 but the quote has not caught up.
pub struct TemporalStrategy {
    pub max_time_to_expiry: Duration,
    pub min_edge: f64,
}

impl Default for TemporalStrategy {
    fn default() -> Self {
        Self {
            max_time_to_expiry: Duration::minutes(30),
            min_edge: 0.04,
        }
    }
}

#[async_trait]
impl Strategy for TemporalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Temporal
    }

    fn scan(
        &self,
        account_id: &str,
        quotes: &[MarketQuote],
        now: DateTime<Utc>,
    ) -> Vec<Opportunity> {
        quotes
            .iter()
            .filter(|q| q.expires_at.signed_duration_since(now) <= self.max_time_to_expiry)
            .filter_map(|q| {
                let fair = q.model_fair_price?;
                let edge = fair - q.yes_price;
                if edge.abs() < self.min_edge {
                    return None;
                }
                let side = if edge > 0.0 { Side::Buy } else { Side::Sell };
                Some(candidate(
                    account_id,
                    self.kind(),
                    q,
                    side,
                    q.yes_price,
                    edge.abs(),
                    now,
                ))
            })
            .collect()
    }

    fn evaluate(&self, opp: &Opportunity) -> bool {
        opp.roi_pct >= self.min_edge * 100.0
    }

    /// Near expiry a partial fill leaves an unhedgeable stub, so insist on
    /// fill-or-kill.
    async fn execute(
        &self,
        venue: &dyn ExecutionVenue,
        opp: &Opportunity,
        size_usd: f64,
    ) -> Result<Fill, AgentError> {
        venue
            .place_order(OrderRequest {
                client_order_id: format!("{}:{}", opp.account_id, opp.id),
                market_id: opp.market_id.clone(),
                side: opp.side,
                price: opp.entry_price,
                notional_usd: size_usd,
                tif: TimeInForce::Fok,
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(yes: f64, no: f64) -> MarketQuote {
        MarketQuote {
            market_id: "m1".to_string(),
            strategy: StrategyKind::NegRisk,
            yes_price: yes,
            no_price: no,
            external_yes_price: None,
            model_fair_price: None,
            liquidity_usd: 100_000.0,
            expires_at: Utc::now() + Duration::minutes(10),
        }
    }

    #[test]
    fn test_negrisk_finds_underpriced_bundle() {
        let strategy = NegRiskStrategy::default();
        let now = Utc::now();
        let found = strategy.scan("a1", &[quote(0.45, 0.50)], now);
        assert_eq!(found.len(), 1);
        assert!((found[0].expected_profit_usd - 5.0).abs() < 1e-9);
        assert!(strategy.evaluate(&found[0]));
    }

    #[test]
    fn test_negrisk_ignores_fair_book() {
        let strategy = NegRiskStrategy::default();
        let found = strategy.scan("a1", &[quote(0.48, 0.53)], Utc::now());
        assert!(found.is_empty());
    }

    #[test]
    fn test_negrisk_evaluate_discards_thin_gap() {
        let strategy = NegRiskStrategy::default();
        let found = strategy.scan("a1", &[quote(0.495, 0.50)], Utc::now());
        assert_eq!(found.len(), 1);
        assert!(!strategy.evaluate(&found[0]));
    }

    #[test]
    fn test_cross_platform_direction() {
        let strategy = CrossPlatformStrategy::default();
        let mut q = quote(0.40, 0.61);
        q.external_yes_price = Some(0.48);
        let found = strategy.scan("a1", &[q], Utc::now());
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].side, Side::Buy);
        assert!(strategy.evaluate(&found[0]));
    }

    #[test]
    fn test_kelly_stake_caps_and_floors() {
        let params = SizingParams {
            capital_usd: 1000.0,
            kelly_fraction: 0.25,
            max_position_pct: 0.10,
            min_position_usd: 1.0,
        };
        // Strong edge: capped at 10% of capital.
        let stake = kelly_stake(0.90, 0.50, &params);
        assert!(stake > 0.0 && stake <= 100.0 + 1e-9);
        // No edge: zero.
        assert_eq!(kelly_stake(0.40, 0.50, &params), 0.0);
    }

    #[test]
    fn test_urgency_tiers() {
        assert_eq!(urgency_for(9.0, Duration::minutes(10)), Urgency::High);
        assert_eq!(urgency_for(5.0, Duration::minutes(10)), Urgency::Medium);
        assert_eq!(urgency_for(1.0, Duration::minutes(10)), Urgency::Low);
        assert_eq!(urgency_for(1.0, Duration::seconds(30)), Urgency::High);
    }
}
