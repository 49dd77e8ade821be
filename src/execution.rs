//! Trade execution collaborator.
//!
//! The core hands authorized trades to an `ExecutionVenue`; venue
//! connectivity itself lives outside this repo. The paper venue simulates
//! latency, slippage, partial fills and rejections so the fleet is fully
//! exercisable offline.

use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Duration};

use crate::errors::AgentError;
use crate::models::Side;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Ioc,
    Fok,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub client_order_id: String,
    pub market_id: String,
    pub side: Side,
    /// Limit price (0..1) for binary outcome shares.
    pub price: f64,
    /// Notional USD to commit.
    pub notional_usd: f64,
    pub tif: TimeInForce,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub filled_notional_usd: f64,
    pub filled_price: f64,
    pub filled_at: i64,
    #[serde(default)]
    pub fees_usd: f64,
    #[serde(default)]
    pub slippage_bps: f64,
    #[serde(default)]
    pub latency_ms: u64,
}

#[async_trait]
pub trait ExecutionVenue: Send + Sync {
    async fn place_order(&self, req: OrderRequest) -> Result<Fill, AgentError>;
}

/// Paper execution configuration for realistic simulation.
#[derive(Debug, Clone)]
pub struct PaperVenueConfig {
    /// Base latency in ms (random jitter is added on top).
    pub base_latency_ms: u64,
    /// Max additional random latency in ms.
    pub latency_jitter_ms: u64,
    /// Slippage in bps per $1000 notional (market impact).
    pub slippage_bps_per_1k: f64,
    /// Base slippage in bps (spread crossing).
    pub base_slippage_bps: f64,
    /// Taker fee rate.
    pub fee_rate: f64,
    /// Probability of partial fill (0.0 to 1.0).
    pub partial_fill_prob: f64,
    /// Min fill ratio when a partial fill occurs.
    pub min_fill_ratio: f64,
    /// Probability of order rejection (0.0 to 1.0).
    pub reject_prob: f64,
}

impl Default for PaperVenueConfig {
    fn default() -> Self {
        Self {
            base_latency_ms: 150,
            latency_jitter_ms: 200,
            slippage_bps_per_1k: 15.0,
            base_slippage_bps: 10.0,
            fee_rate: 0.005,
            partial_fill_prob: 0.15,
            min_fill_ratio: 0.4,
            reject_prob: 0.02,
        }
    }
}

impl PaperVenueConfig {
    /// Everything deterministic and instant; used by the test suites.
    pub fn frictionless() -> Self {
        Self {
            base_latency_ms: 0,
            latency_jitter_ms: 0,
            slippage_bps_per_1k: 0.0,
            base_slippage_bps: 0.0,
            fee_rate: 0.0,
            partial_fill_prob: 0.0,
            min_fill_ratio: 1.0,
            reject_prob: 0.0,
        }
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("PAPER_BASE_LATENCY_MS") {
            if let Ok(ms) = v.parse() {
                config.base_latency_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PAPER_LATENCY_JITTER_MS") {
            if let Ok(ms) = v.parse() {
                config.latency_jitter_ms = ms;
            }
        }
        if let Ok(v) = std::env::var("PAPER_SLIPPAGE_BPS_PER_1K") {
            if let Ok(bps) = v.parse() {
                config.slippage_bps_per_1k = bps;
            }
        }
        if let Ok(v) = std::env::var("PAPER_BASE_SLIPPAGE_BPS") {
            if let Ok(bps) = v.parse() {
                config.base_slippage_bps = bps;
            }
        }
        if let Ok(v) = std::env::var("PAPER_FEE_RATE") {
            if let Ok(rate) = v.parse() {
                config.fee_rate = rate;
            }
        }
        if let Ok(v) = std::env::var("PAPER_PARTIAL_FILL_PROB") {
            if let Ok(prob) = v.parse() {
                config.partial_fill_prob = prob;
            }
        }
        if let Ok(v) = std::env::var("PAPER_REJECT_PROB") {
            if let Ok(prob) = v.parse() {
                config.reject_prob = prob;
            }
        }

        config
    }
}

#[derive(Debug, Clone, Default)]
pub struct PaperVenue {
    pub config: PaperVenueConfig,
}

impl PaperVenue {
    pub fn new(config: PaperVenueConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ExecutionVenue for PaperVenue {
    async fn place_order(&self, req: OrderRequest) -> Result<Fill, AgentError> {
        let mut rng = StdRng::from_entropy();

        if !(req.price.is_finite() && req.price > 0.0 && req.price < 1.0) {
            return Err(AgentError::execution(format!(
                "invalid price: {}",
                req.price
            )));
        }
        if !(req.notional_usd.is_finite() && req.notional_usd > 0.0) {
            return Err(AgentError::execution(format!(
                "invalid notional: {}",
                req.notional_usd
            )));
        }

        // Simulate network + matching latency.
        let jitter: u64 = if self.config.latency_jitter_ms > 0 {
            rng.gen_range(0..=self.config.latency_jitter_ms)
        } else {
            0
        };
        let total_latency_ms = self.config.base_latency_ms + jitter;
        if total_latency_ms > 0 {
            sleep(Duration::from_millis(total_latency_ms)).await;
        }

        if self.config.reject_prob > 0.0 && rng.gen::<f64>() < self.config.reject_prob {
            return Err(AgentError::execution("order rejected (simulated)"));
        }

        // Slippage: base + market impact, adverse for the trader.
        let size_factor = req.notional_usd / 1000.0;
        let total_slippage_bps =
            self.config.base_slippage_bps + self.config.slippage_bps_per_1k * size_factor;
        let slippage_multiplier = total_slippage_bps / 10_000.0;
        let filled_price = match req.side {
            Side::Buy => (req.price * (1.0 + slippage_multiplier)).min(0.99),
            Side::Sell => (req.price * (1.0 - slippage_multiplier)).max(0.01),
        };

        let fill_ratio = if self.config.partial_fill_prob > 0.0
            && rng.gen::<f64>() < self.config.partial_fill_prob
        {
            rng.gen_range(self.config.min_fill_ratio..1.0)
        } else {
            1.0
        };

        if req.tif == TimeInForce::Fok && fill_ratio < 1.0 {
            return Err(AgentError::execution("FOK order could not be fully filled"));
        }

        let filled_notional = req.notional_usd * fill_ratio;
        let fees_usd = filled_notional * self.config.fee_rate;

        Ok(Fill {
            order_id: format!("paper:{}", req.client_order_id),
            filled_notional_usd: filled_notional,
            filled_price,
            filled_at: Utc::now().timestamp(),
            fees_usd,
            slippage_bps: total_slippage_bps,
            latency_ms: total_latency_ms,
        })
    }
}
