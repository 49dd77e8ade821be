//! Market data collaborator.
//!
//! The orchestration core never talks to a venue's data API directly; agents
//! consume this trait. `poll_quotes` models the remote fetch that feeds
//! `scan()` (and may fail transiently); marks and resolutions are cache-backed
//! reads safe to call from anywhere.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rand::Rng;
use tracing::debug;

use crate::errors::AgentError;
use crate::models::StrategyKind;

/// A tradable binary market as one strategy's scan sees it.
#[derive(Debug, Clone)]
pub struct MarketQuote {
    pub market_id: String,
    pub strategy: StrategyKind,
    /// YES price, 0..1.
    pub yes_price: f64,
    /// NO price, 0..1. On a well-made book yes + no >= 1; a sum below 1 is
    /// the negrisk arb.
    pub no_price: f64,
    /// Same outcome quoted on another venue, when the strategy tracks one.
    pub external_yes_price: Option<f64>,
    /// Model fair value (weather/temporal models), when available.
    pub model_fair_price: Option<f64>,
    pub liquidity_usd: f64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MarketResolution {
    pub market_id: String,
    /// Settlement price of the YES outcome: 1.0 or 0.0.
    pub outcome_price: f64,
    pub resolved_at: DateTime<Utc>,
}

#[async_trait]
pub trait MarketData: Send + Sync {
    /// Quotes currently relevant to `strategy`. Bounded by the data source.
    async fn poll_quotes(&self, strategy: StrategyKind) -> Result<Vec<MarketQuote>, AgentError>;

    /// Latest mark for an open market, from the local cache.
    fn mark_price(&self, market_id: &str) -> Option<f64>;

    /// Settlement for a market, if it has resolved.
    fn resolution(&self, market_id: &str) -> Option<MarketResolution>;
}

// ===== Simulated implementation =====

/// Knobs for the simulated feed. Zeroing the walk and mispricing jitter makes
/// the simulation deterministic, which the tests rely on.
#[derive(Debug, Clone)]
pub struct SimMarketConfig {
    /// Max absolute random-walk step applied to each quote per poll.
    pub walk_step: f64,
    /// Probability per poll that a market is quoted with an exploitable edge.
    pub mispricing_prob: f64,
    /// How long a simulated market lives before resolving.
    pub market_lifetime: Duration,
    /// Markets quoted per strategy per poll.
    pub markets_per_strategy: usize,
}

impl Default for SimMarketConfig {
    fn default() -> Self {
        Self {
            walk_step: 0.02,
            mispricing_prob: 0.25,
            market_lifetime: Duration::minutes(10),
            markets_per_strategy: 4,
        }
    }
}

struct SimMarket {
    quote: MarketQuote,
    resolution: Option<MarketResolution>,
}

struct SimState {
    markets: Vec<SimMarket>,
    next_id: u64,
}

/// In-process market simulation so the whole fleet runs offline. Quotes take
/// a bounded random walk; expired markets settle at 0 or 1 with probability
/// equal to their last YES price.
pub struct SimulatedMarketData {
    config: SimMarketConfig,
    state: RwLock<SimState>,
}

impl SimulatedMarketData {
    pub fn new(config: SimMarketConfig) -> Self {
        Self {
            config,
            state: RwLock::new(SimState {
                markets: Vec::new(),
                next_id: 1,
            }),
        }
    }

    /// Seed with fixed quotes instead of generated ones. Markets seeded this
    /// way still resolve on expiry but do not random-walk unless configured.
    pub fn with_quotes(config: SimMarketConfig, quotes: Vec<MarketQuote>) -> Self {
        let sim = Self::new(config);
        {
            let mut state = sim.state.write();
            for quote in quotes {
                state.markets.push(SimMarket {
                    quote,
                    resolution: None,
                });
            }
        }
        sim
    }

    fn spawn_market(state: &mut SimState, config: &SimMarketConfig, strategy: StrategyKind) {
        let mut rng = rand::thread_rng();
        let id = state.next_id;
        state.next_id += 1;

        let yes: f64 = rng.gen_range(0.15..0.85);
        let mispriced = rng.gen::<f64>() < config.mispricing_prob;
        // A fair book sums slightly above 1 (the vig); a mispriced one dips under.
        let no = if mispriced {
            (1.0 - yes - rng.gen_range(0.03..0.08)).clamp(0.01, 0.99)
        } else {
            (1.0 - yes + rng.gen_range(0.005..0.02)).clamp(0.01, 0.99)
        };

        let external = if mispriced {
            Some((yes + rng.gen_range(0.04..0.10)).clamp(0.01, 0.99))
        } else {
            Some((yes + rng.gen_range(-0.01..0.01)).clamp(0.01, 0.99))
        };
        let fair = if mispriced {
            Some((yes + rng.gen_range(0.05..0.12)).clamp(0.01, 0.99))
        } else {
            Some(yes)
        };

        state.markets.push(SimMarket {
            quote: MarketQuote {
                market_id: format!("sim-{}-{}", strategy.as_str(), id),
                strategy,
                yes_price: yes,
                no_price: no,
                external_yes_price: external,
                model_fair_price: fair,
                liquidity_usd: rng.gen_range(10_000.0..250_000.0),
                expires_at: Utc::now() + config.market_lifetime,
            },
            resolution: None,
        });
    }

    /// Force a settlement, bypassing expiry. Lets harnesses script loss and
    /// profit outcomes deterministically.
    pub fn resolve_market(&self, market_id: &str, outcome_price: f64) {
        let mut state = self.state.write();
        if let Some(market) = state
            .markets
            .iter_mut()
            .find(|m| m.quote.market_id == market_id)
        {
            market.resolution = Some(MarketResolution {
                market_id: market_id.to_string(),
                outcome_price,
                resolved_at: Utc::now(),
            });
        }
    }

    fn step(&self, strategy: StrategyKind) {
        let mut state = self.state.write();
        let now = Utc::now();
        let mut rng = rand::thread_rng();

        // Settle anything past expiry.
        for market in state.markets.iter_mut() {
            if market.resolution.is_none() && now >= market.quote.expires_at {
                let settles_yes = rng.gen::<f64>() < market.quote.yes_price;
                market.resolution = Some(MarketResolution {
                    market_id: market.quote.market_id.clone(),
                    outcome_price: if settles_yes { 1.0 } else { 0.0 },
                    resolved_at: now,
                });
                debug!(market = %market.quote.market_id, settles_yes, "simulated market resolved");
            }
        }

        // Walk live quotes.
        if self.config.walk_step > 0.0 {
            for market in state.markets.iter_mut() {
                if market.resolution.is_some() {
                    continue;
                }
                let step = rng.gen_range(-self.config.walk_step..self.config.walk_step);
                market.quote.yes_price = (market.quote.yes_price + step).clamp(0.01, 0.99);
                market.quote.no_price = (market.quote.no_price - step).clamp(0.01, 0.99);
            }
        }

        // Keep the per-strategy universe topped up.
        let live = state
            .markets
            .iter()
            .filter(|m| m.resolution.is_none() && m.quote.strategy == strategy)
            .count();
        for _ in live..self.config.markets_per_strategy {
            Self::spawn_market(&mut state, &self.config, strategy);
        }
    }
}

#[async_trait]
impl MarketData for SimulatedMarketData {
    async fn poll_quotes(&self, strategy: StrategyKind) -> Result<Vec<MarketQuote>, AgentError> {
        self.step(strategy);
        let state = self.state.read();
        Ok(state
            .markets
            .iter()
            .filter(|m| m.resolution.is_none() && m.quote.strategy == strategy)
            .map(|m| m.quote.clone())
            .collect())
    }

    fn mark_price(&self, market_id: &str) -> Option<f64> {
        let state = self.state.read();
        state
            .markets
            .iter()
            .find(|m| m.quote.market_id == market_id)
            .map(|m| {
                m.resolution
                    .as_ref()
                    .map(|r| r.outcome_price)
                    .unwrap_or(m.quote.yes_price)
            })
    }

    fn resolution(&self, market_id: &str) -> Option<MarketResolution> {
        let state = self.state.read();
        state
            .markets
            .iter()
            .find(|m| m.quote.market_id == market_id)
            .and_then(|m| m.resolution.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet_config() -> SimMarketConfig {
        SimMarketConfig {
            walk_step: 0.0,
            mispricing_prob: 0.0,
            market_lifetime: Duration::minutes(10),
            markets_per_strategy: 3,
        }
    }

    #[tokio::test]
    async fn test_poll_tops_up_universe() {
        let sim = SimulatedMarketData::new(quiet_config());
        let quotes = sim.poll_quotes(StrategyKind::NegRisk).await.unwrap();
        assert_eq!(quotes.len(), 3);
        // Other strategies get their own universe.
        let quotes = sim.poll_quotes(StrategyKind::Weather).await.unwrap();
        assert_eq!(quotes.len(), 3);
    }

    #[tokio::test]
    async fn test_expired_market_resolves() {
        let config = SimMarketConfig {
            market_lifetime: Duration::zero(),
            ..quiet_config()
        };
        let quote = MarketQuote {
            market_id: "m-exp".to_string(),
            strategy: StrategyKind::NegRisk,
            yes_price: 0.5,
            no_price: 0.5,
            external_yes_price: None,
            model_fair_price: None,
            liquidity_usd: 1000.0,
            expires_at: Utc::now() - Duration::seconds(1),
        };
        let sim = SimulatedMarketData::with_quotes(config, vec![quote]);
        let _ = sim.poll_quotes(StrategyKind::NegRisk).await.unwrap();

        let res = sim.resolution("m-exp").expect("resolved");
        assert!(res.outcome_price == 0.0 || res.outcome_price == 1.0);
        assert_eq!(sim.mark_price("m-exp"), Some(res.outcome_price));
    }
}
