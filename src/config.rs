//! Fleet configuration.
//!
//! Loaded once at startup from a TOML file, then overridden by environment
//! variables. The account list is fixed for the life of the process; removing
//! an account is a config change, not a runtime operation.

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;
use std::path::Path;

use crate::fleet::account::RiskLimits;
use crate::fleet::governor::PortfolioLimits;
use crate::fleet::publisher::DEFAULT_STREAM_CAPACITY;
use crate::fleet::rebalancer::RebalanceSettings;
use crate::models::StrategyKind;

#[derive(Debug, Parser)]
#[command(name = "fleetbot", about = "Multi-account prediction market trading fleet")]
pub struct Cli {
    /// Path to the fleet configuration file.
    #[arg(long, default_value = "fleet.toml")]
    pub config: String,
    /// Override the configured HTTP port.
    #[arg(long)]
    pub port: Option<u16>,
}

fn default_port() -> u16 {
    8080
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_publish_interval_ms() -> u64 {
    1000
}

fn default_stream_capacity() -> usize {
    DEFAULT_STREAM_CAPACITY
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    pub strategy: StrategyKind,
    pub capital_usd: f64,
    pub limits: RiskLimits,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    /// Start every account as soon as the process boots.
    #[serde(default)]
    pub auto_start: bool,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
    /// Ring size of each subscriber's delivery queue.
    #[serde(default = "default_stream_capacity")]
    pub stream_capacity: usize,
    pub portfolio: PortfolioLimits,
    #[serde(default)]
    pub rebalance: RebalanceSettings,
    pub accounts: Vec<AccountConfig>,
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("failed to parse fleet config")
    }

    fn apply_env_overrides(&mut self) {
        if let Some(port) = env_parsed::<u16>("PORT") {
            self.port = port;
        }
        if let Some(ms) = env_parsed::<u64>("FLEET_TICK_MS").filter(|v| *v >= 10) {
            self.tick_interval_ms = ms;
        }
        if let Some(ms) = env_parsed::<u64>("FLEET_PUBLISH_MS").filter(|v| *v >= 50) {
            self.publish_interval_ms = ms;
        }
        if let Ok(v) = std::env::var("FLEET_AUTO_START") {
            self.auto_start = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.accounts.is_empty() {
            bail!("no accounts configured");
        }
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                bail!("account id must not be empty");
            }
            if !seen.insert(account.id.as_str()) {
                bail!("duplicate account id: {}", account.id);
            }
            if !(account.capital_usd.is_finite() && account.capital_usd > 0.0) {
                bail!("account {}: capital must be positive", account.id);
            }
            let limits = &account.limits;
            if !(limits.max_position_pct > 0.0 && limits.max_position_pct <= 1.0) {
                bail!("account {}: max_position_pct must be in (0, 1]", account.id);
            }
            if !(limits.max_daily_loss_pct > 0.0 && limits.max_daily_loss_pct <= 1.0) {
                bail!(
                    "account {}: max_daily_loss_pct must be in (0, 1]",
                    account.id
                );
            }
            if limits.max_concurrent_positions == 0 {
                bail!(
                    "account {}: max_concurrent_positions must be at least 1",
                    account.id
                );
            }
        }
        if !(self.portfolio.max_total_loss_usd.is_finite()
            && self.portfolio.max_total_loss_usd > 0.0)
        {
            bail!("portfolio.max_total_loss_usd must be positive");
        }
        Ok(())
    }

    /// Configured total deployed capital.
    pub fn total_capital(&self) -> f64 {
        self.accounts.iter().map(|a| a.capital_usd).sum()
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        port = 9100
        auto_start = true
        tick_interval_ms = 250

        [portfolio]
        max_total_loss_usd = 500.0
        daily_profit_target_usd = 50.0

        [rebalance]
        interval_secs = 3600
        loss_pause_threshold_usd = 100.0

        [[accounts]]
        id = "negrisk-1"
        strategy = "negrisk"
        capital_usd = 250.0
        limits = { max_position_pct = 0.2, max_daily_loss_pct = 0.1, max_concurrent_positions = 4 }

        [[accounts]]
        id = "weather-1"
        strategy = "weather"
        capital_usd = 100.0
        limits = { max_position_pct = 0.1, max_daily_loss_pct = 0.05, max_concurrent_positions = 2 }
    "#;

    #[test]
    fn test_parse_sample_config() {
        let config = AppConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port, 9100);
        assert!(config.auto_start);
        assert_eq!(config.tick_interval_ms, 250);
        assert_eq!(config.publish_interval_ms, 1000); // default
        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].strategy, StrategyKind::NegRisk);
        assert_eq!(config.rebalance.interval_secs, 3600);
        assert!((config.total_capital() - 350.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AppConfig::load(&path).unwrap();
        assert_eq!(config.accounts.len(), 2);
    }

    #[test]
    fn test_rejects_duplicate_ids() {
        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.accounts[1].id = "negrisk-1".to_string();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate account id"));
    }

    #[test]
    fn test_rejects_bad_limits() {
        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.accounts[0].limits.max_position_pct = 1.5;
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.accounts[0].capital_usd = 0.0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::from_toml(SAMPLE).unwrap();
        config.accounts.clear();
        assert!(config.validate().is_err());
    }
}
