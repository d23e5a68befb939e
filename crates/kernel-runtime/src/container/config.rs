//! # Kernel Configuration
//!
//! One flat set of named, typed options for every kernel component, with
//! defaults and `KG_*` environment overrides.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `KG_QUEUE_SIZE` | `bus.max_queue_size` |
//! | `KG_PUBLISH_TIMEOUT_MS` | `bus.publish_timeout` |
//! | `KG_MAX_RETRIES` | `bus.max_retries` |
//! | `KG_RETRY_DELAY_MS` | `bus.retry_delay` |
//! | `KG_DELIVERY_TIMEOUT_MS` | `bus.delivery_timeout` |
//! | `KG_CIRCUIT_THRESHOLD` | `manager.failure_threshold` |
//! | `KG_CIRCUIT_TIMEOUT_SECS` | `manager.circuit_timeout` |
//! | `KG_EXECUTION_HISTORY` | `manager.history_capacity` |
//! | `KG_PHASE_TIMEOUT_MS` | timeout of every pipeline phase |
//! | `KG_PIPELINE_HISTORY` | `pipeline.history_capacity` |
//! | `KG_MAX_PAUSE_SECS` | `pipeline.max_pause` |
//! | `KG_DEFAULT_FUEL` | `sandbox.default_fuel` |
//! | `KG_DEFAULT_MEMORY_MB` | `sandbox.default_memory_mb` |
//! | `KG_SANDBOX_TIMEOUT_MS` | `sandbox.default_timeout` |
//! | `KG_FUEL_PER_MS` | `sandbox.fuel_per_ms` |
//! | `KG_HOST_CALL_COST` | `sandbox.host_call_cost` |
//! | `KG_SHUTDOWN_TIMEOUT_SECS` | `shutdown_timeout` |

use kg_02_overlay_manager::OverlayManagerConfig;
use kg_03_sandbox_runtime::SandboxConfig;
use kg_04_pipeline::{PipelineConfig, PipelinePhase};
use serde::{Deserialize, Serialize};
use shared_bus::EventBusConfig;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Complete kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelConfig {
    pub bus: EventBusConfig,
    pub manager: OverlayManagerConfig,
    pub pipeline: PipelineConfig,
    pub sandbox: SandboxConfig,
    /// Bound on each stage of a graceful shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            bus: EventBusConfig::default(),
            manager: OverlayManagerConfig::default(),
            pipeline: PipelineConfig::default(),
            sandbox: SandboxConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable did not parse.
    #[error("{key}={value}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    /// A value parsed but is unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl KernelConfig {
    /// Defaults overridden by `KG_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `KG_*` key.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Overrides { lookup };
        let mut config = Self::default();

        env.apply("KG_QUEUE_SIZE", &mut config.bus.max_queue_size)?;
        env.apply_millis("KG_PUBLISH_TIMEOUT_MS", &mut config.bus.publish_timeout)?;
        env.apply("KG_MAX_RETRIES", &mut config.bus.max_retries)?;
        env.apply_millis("KG_RETRY_DELAY_MS", &mut config.bus.retry_delay)?;
        env.apply_millis("KG_DELIVERY_TIMEOUT_MS", &mut config.bus.delivery_timeout)?;

        env.apply("KG_CIRCUIT_THRESHOLD", &mut config.manager.failure_threshold)?;
        env.apply_secs("KG_CIRCUIT_TIMEOUT_SECS", &mut config.manager.circuit_timeout)?;
        env.apply("KG_EXECUTION_HISTORY", &mut config.manager.history_capacity)?;

        if let Some(ms) = env.parse::<u64>("KG_PHASE_TIMEOUT_MS")? {
            for phase in PipelinePhase::ALL {
                let entry = config
                    .pipeline
                    .phases
                    .entry(phase)
                    .or_insert_with(|| phase.default_config());
                entry.timeout = Duration::from_millis(ms);
            }
        }
        env.apply("KG_PIPELINE_HISTORY", &mut config.pipeline.history_capacity)?;
        env.apply_secs("KG_MAX_PAUSE_SECS", &mut config.pipeline.max_pause)?;

        env.apply("KG_DEFAULT_FUEL", &mut config.sandbox.default_fuel)?;
        env.apply("KG_DEFAULT_MEMORY_MB", &mut config.sandbox.default_memory_mb)?;
        env.apply_millis("KG_SANDBOX_TIMEOUT_MS", &mut config.sandbox.default_timeout)?;
        env.apply("KG_FUEL_PER_MS", &mut config.sandbox.fuel_per_ms)?;
        env.apply("KG_HOST_CALL_COST", &mut config.sandbox.host_call_cost)?;

        env.apply_secs("KG_SHUTDOWN_TIMEOUT_SECS", &mut config.shutdown_timeout)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (
                self.bus.max_queue_size == 0,
                "event queue size must be positive",
            ),
            (
                self.bus.publish_timeout.is_zero(),
                "publish timeout must be positive",
            ),
            (
                self.bus.max_retries == 0,
                "delivery attempts must be at least 1",
            ),
            (
                self.bus.delivery_timeout.is_zero(),
                "delivery timeout must be positive",
            ),
            (
                self.manager.failure_threshold == 0,
                "circuit failure threshold must be at least 1",
            ),
            (
                self.manager.history_capacity == 0,
                "execution history must hold at least 1 entry",
            ),
            (
                self.pipeline.history_capacity == 0,
                "pipeline history must hold at least 1 entry",
            ),
            (
                self.sandbox.default_fuel == 0,
                "default fuel must be positive",
            ),
            (
                self.sandbox.default_timeout.is_zero(),
                "sandbox timeout must be positive",
            ),
        ];
        if let Some((_, reason)) = checks.iter().find(|(failed, _)| *failed) {
            return Err(ConfigError::Invalid((*reason).to_string()));
        }
        if let Some(phase) = PipelinePhase::ALL
            .iter()
            .find(|p| self.pipeline.phase(**p).timeout.is_zero())
        {
            return Err(ConfigError::Invalid(format!(
                "{phase} phase timeout must be positive"
            )));
        }
        Ok(())
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F> Overrides<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = (self.lookup)(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
    }

    fn apply<T>(&self, key: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(value) = self.parse::<T>(key)? {
            *target = value;
        }
        Ok(())
    }

    fn apply_millis(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(ms) = self.parse::<u64>(key)? {
            *target = Duration::from_millis(ms);
        }
        Ok(())
    }

    fn apply_secs(&self, key: &str, target: &mut Duration) -> Result<(), ConfigError> {
        if let Some(secs) = self.parse::<u64>(key)? {
            *target = Duration::from_secs(secs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_overrides() {
        let config = KernelConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.bus.max_queue_size, 10_000);
        assert_eq!(config.manager.failure_threshold, 5);
        assert_eq!(config.pipeline.history_capacity, 100);
        assert_eq!(config.sandbox.default_fuel, 1_000_000);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_overrides_apply() {
        let config = KernelConfig::from_lookup(lookup(&[
            ("KG_QUEUE_SIZE", "64"),
            ("KG_CIRCUIT_THRESHOLD", " 2 "),
            ("KG_RETRY_DELAY_MS", "250"),
            ("KG_PHASE_TIMEOUT_MS", "1500"),
            ("KG_HOST_CALL_COST", "0"),
            ("KG_PUBLISH_TIMEOUT_MS", "750"),
        ]))
        .unwrap();
        assert_eq!(config.bus.publish_timeout, Duration::from_millis(750));
        assert_eq!(config.bus.max_queue_size, 64);
        assert_eq!(config.manager.failure_threshold, 2);
        assert_eq!(config.bus.retry_delay, Duration::from_millis(250));
        assert_eq!(config.sandbox.host_call_cost, 0);
        for phase in PipelinePhase::ALL {
            assert_eq!(config.pipeline.phase(phase).timeout, Duration::from_millis(1500));
        }
        // Other phase settings keep their defaults.
        assert!(!config.pipeline.phase(PipelinePhase::Analysis).required);
    }

    #[test]
    fn test_unparseable_value_names_the_key() {
        let err = KernelConfig::from_lookup(lookup(&[("KG_DEFAULT_FUEL", "lots")])).unwrap_err();
        match err {
            ConfigError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "KG_DEFAULT_FUEL");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_validate_rejects_unusable_values() {
        let err = KernelConfig::from_lookup(lookup(&[("KG_MAX_RETRIES", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = KernelConfig::from_lookup(lookup(&[("KG_PHASE_TIMEOUT_MS", "0")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid("ingestion phase timeout must be positive".into())
        );
    }
}
