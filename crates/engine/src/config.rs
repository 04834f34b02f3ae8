//! Engine tunables.

use std::time::Duration;

use queue::PoolConfig;
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Everything the composition root needs to size and time the engine.
///
/// Durations are (de)serialised as integer milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// How long a delivery's idempotency key suppresses duplicates.
    #[serde(with = "millis")]
    pub idempotency_ttl: Duration,
    /// Upper bound on concurrently running paths of one split.
    pub max_fan_out: usize,
    pub retry: RetryPolicy,
    /// Per-attempt ceiling, unless the action overrides it.
    #[serde(with = "millis")]
    pub action_timeout: Duration,
    /// Whole-run ceiling; the run is cancelled and ends `failed` past it.
    #[serde(with = "millis")]
    pub run_timeout: Duration,
    /// Cron adapter tick interval.
    #[serde(with = "millis")]
    pub cron_resolution: Duration,
    /// Interval of the expired idempotency key sweeper.
    #[serde(with = "millis")]
    pub sweep_interval: Duration,
    /// Capacity of the inbound trigger event channel.
    pub inbound_capacity: usize,
    pub pool: PoolConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idempotency_ttl: Duration::from_secs(24 * 60 * 60),
            max_fan_out: 32,
            retry: RetryPolicy::default(),
            action_timeout: Duration::from_secs(30),
            run_timeout: Duration::from_secs(15 * 60),
            cron_resolution: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10 * 60),
            inbound_capacity: 1024,
            pool: PoolConfig::default(),
        }
    }
}

pub(crate) mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_conservative() {
        let config = EngineConfig::default();
        assert_eq!(config.idempotency_ttl, Duration::from_secs(86_400));
        assert_eq!(config.max_fan_out, 32);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn partial_config_fills_defaults() {
        let config: EngineConfig = serde_json::from_value(json!({
            "max_fan_out": 4,
            "action_timeout": 1500,
            "retry": { "max_retries": 5 }
        }))
        .unwrap();

        assert_eq!(config.max_fan_out, 4);
        assert_eq!(config.action_timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.multiplier, 2);
        assert_eq!(config.run_timeout, Duration::from_secs(900));
    }
}
