// Bus configuration: defaults, environment variables, optional YAML override.
use anyhow::{Context, Result};
use lynx_broker::DeliveryMode;
use serde::Deserialize;
use std::fs;

pub const DEFAULT_MAXIMUM_RELATION_SIZE: usize = 10_000;
pub const DEFAULT_STATS_PERIOD_MINUTES: u64 = 10;
pub const DEFAULT_STATS_LOG_MAX_THRESHOLD_MS: u64 = 10;

#[derive(Debug, Clone)]
pub struct BusConfig {
    // Relation bulk events above this size collapse into a reset.
    pub maximum_relation_size: usize,
    // Broker delivery mode for outgoing events.
    pub delivery_mode: DeliveryMode,
    // Length of the statistics reporting window. Zero flushes after every
    // recorded event.
    pub stats_period_minutes: u64,
    // A new per-key maximum above this many milliseconds logs immediately.
    pub stats_log_max_threshold_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            maximum_relation_size: DEFAULT_MAXIMUM_RELATION_SIZE,
            delivery_mode: DeliveryMode::Persistent,
            stats_period_minutes: DEFAULT_STATS_PERIOD_MINUTES,
            stats_log_max_threshold_ms: DEFAULT_STATS_LOG_MAX_THRESHOLD_MS,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct BusConfigOverride {
    maximum_relation_size: Option<usize>,
    delivery_mode: Option<DeliveryMode>,
    stats_period_minutes: Option<u64>,
    stats_log_max_threshold_ms: Option<u64>,
}

impl BusConfig {
    /// Defaults, then environment variables, then an optional YAML override
    /// file (explicit path or `LYNX_BUS_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self> {
        let mut config = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("LYNX_BUS_CONFIG").ok());
        let contents = match override_path.as_deref() {
            Some(path) => Some(
                fs::read_to_string(path).with_context(|| format!("read bus config: {path}"))?,
            ),
            None => None,
        };
        if let Some(contents) = contents {
            let override_cfg: BusConfigOverride =
                serde_yaml::from_str(&contents).context("parse bus config yaml")?;
            override_cfg.apply(&mut config);
        }
        Ok(config)
    }

    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(value) = read_usize_env("LYNX_BUS_MAX_RELATION_SIZE") {
            config.maximum_relation_size = value;
        }
        if let Some(value) = std::env::var("LYNX_BUS_DELIVERY_MODE")
            .ok()
            .and_then(|value| parse_delivery_mode(&value))
        {
            config.delivery_mode = value;
        }
        if let Some(value) = read_u64_env("LYNX_BUS_STATS_PERIOD_MINUTES") {
            config.stats_period_minutes = value;
        }
        if let Some(value) = read_u64_env("LYNX_BUS_STATS_LOG_MAX_THRESHOLD_MS") {
            config.stats_log_max_threshold_ms = value;
        }
        config
    }
}

impl BusConfigOverride {
    fn apply(&self, config: &mut BusConfig) {
        if let Some(value) = self.maximum_relation_size
            && value > 0
        {
            config.maximum_relation_size = value;
        }
        if let Some(value) = self.delivery_mode {
            config.delivery_mode = value;
        }
        if let Some(value) = self.stats_period_minutes {
            config.stats_period_minutes = value;
        }
        if let Some(value) = self.stats_log_max_threshold_ms {
            config.stats_log_max_threshold_ms = value;
        }
    }
}

fn parse_delivery_mode(value: &str) -> Option<DeliveryMode> {
    match value {
        "persistent" => Some(DeliveryMode::Persistent),
        "non_persistent" => Some(DeliveryMode::NonPersistent),
        _ => None,
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = BusConfig::default();
        assert_eq!(config.maximum_relation_size, 10_000);
        assert_eq!(config.delivery_mode, DeliveryMode::Persistent);
        assert_eq!(config.stats_period_minutes, 10);
        assert_eq!(config.stats_log_max_threshold_ms, 10);
    }

    #[test]
    fn yaml_override_applies_known_keys() {
        let mut config = BusConfig::default();
        let override_cfg: BusConfigOverride = serde_yaml::from_str(
            "maximum_relation_size: 5\ndelivery_mode: non_persistent\nstats_period_minutes: 0\n",
        )
        .expect("parse");
        override_cfg.apply(&mut config);
        assert_eq!(config.maximum_relation_size, 5);
        assert_eq!(config.delivery_mode, DeliveryMode::NonPersistent);
        assert_eq!(config.stats_period_minutes, 0);
        assert_eq!(config.stats_log_max_threshold_ms, 10);
    }

    #[test]
    fn zero_relation_size_override_is_ignored() {
        let mut config = BusConfig::default();
        let override_cfg: BusConfigOverride =
            serde_yaml::from_str("maximum_relation_size: 0\n").expect("parse");
        override_cfg.apply(&mut config);
        assert_eq!(config.maximum_relation_size, 10_000);
    }

    #[test]
    fn delivery_mode_parsing() {
        assert_eq!(
            parse_delivery_mode("persistent"),
            Some(DeliveryMode::Persistent)
        );
        assert_eq!(
            parse_delivery_mode("non_persistent"),
            Some(DeliveryMode::NonPersistent)
        );
        assert_eq!(parse_delivery_mode("exactly_once"), None);
    }
}
