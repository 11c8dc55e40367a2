//! Layered configuration: defaults → YAML file → environment overrides, loaded via `figment`.
//!
//! Mirrors `dwctl::config`'s `Args`/`Config` split: a thin `clap::Parser` surface for the config
//! path and log level, and a `serde`-derived `Config` with every field defaulted so a bare
//! `hookrelay` invocation with no file on disk still starts.

use std::collections::HashMap;

use clap::Parser;
use figment::providers::{Env, Format, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::change_stream::{ChangeStreamConfig, ReconnectPolicy};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::delivery::RetrySchedule;
use crate::dispatcher::DispatcherConfig;
use crate::supervisor::SupervisorConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Tails a change feed and delivers matching events to registered webhooks", long_about = None)]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(short = 'f', long, env = "HOOKRELAY_CONFIG", default_value = "config.yaml")]
    pub config: String,

    /// Override the log level (e.g. `debug`, `hookrelay=trace,info`).
    #[arg(long, env = "HOOKRELAY_LOG")]
    pub log_level: Option<String>,

    /// Load and validate configuration, then exit without starting the service.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
    pub collection: Option<String>,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: "platform".to_string(),
            collection: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_ms: u64,
    pub cap_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let d = RetrySchedule::default();
        Self {
            base_ms: d.base_ms,
            cap_ms: d.cap_ms,
            max_attempts: d.max_attempts,
        }
    }
}

impl From<RetryConfig> for RetrySchedule {
    fn from(c: RetryConfig) -> Self {
        Self {
            base_ms: c.base_ms,
            cap_ms: c.cap_ms,
            max_attempts: c.max_attempts,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub failure_threshold: u32,
    pub timeout_ms: u64,
    pub reset_timeout_ms: u64,
    pub success_threshold: u32,
    pub volume_threshold: u32,
    pub error_threshold_pct: u8,
    pub slow_call_ms: u64,
    pub slow_call_rate_pct: u8,
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let d = CircuitBreakerConfig::default();
        Self {
            failure_threshold: d.failure_threshold,
            timeout_ms: d.timeout_ms,
            reset_timeout_ms: d.reset_timeout_ms,
            success_threshold: d.success_threshold,
            volume_threshold: d.volume_threshold,
            error_threshold_pct: d.error_threshold_pct,
            slow_call_ms: d.slow_call_ms,
            slow_call_rate_pct: d.slow_call_rate_pct,
            monitoring_period_ms: d.monitoring_period_ms,
        }
    }
}

impl From<CircuitBreakerSettings> for CircuitBreakerConfig {
    fn from(c: CircuitBreakerSettings) -> Self {
        Self {
            failure_threshold: c.failure_threshold,
            timeout_ms: c.timeout_ms,
            reset_timeout_ms: c.reset_timeout_ms,
            success_threshold: c.success_threshold,
            volume_threshold: c.volume_threshold,
            error_threshold_pct: c.error_threshold_pct,
            slow_call_ms: c.slow_call_ms,
            slow_call_rate_pct: c.slow_call_rate_pct,
            monitoring_period_ms: c.monitoring_period_ms,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChangeStreamSettings {
    pub partition_id: String,
    pub batch_size: usize,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
}

impl Default for ChangeStreamSettings {
    fn default() -> Self {
        Self {
            partition_id: "default".to_string(),
            batch_size: 100,
            reconnect_base_ms: 500,
            reconnect_cap_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub workers: usize,
    pub per_request_timeout_ms: u64,
    pub lease_ms: u64,
    pub grace_period_sec: u64,
    pub claim_batch_size: usize,
    pub claim_interval_ms: u64,
    pub max_concurrent_sends: usize,
    pub channel_capacity: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        let d = DispatcherConfig::default();
        Self {
            workers: d.workers,
            per_request_timeout_ms: d.per_request_timeout_ms,
            lease_ms: d.lease_ms,
            grace_period_sec: d.grace_period_sec,
            claim_batch_size: d.claim_batch_size,
            claim_interval_ms: d.claim_interval_ms,
            max_concurrent_sends: d.max_concurrent_sends,
            channel_capacity: d.channel_capacity,
        }
    }
}

/// `maps` overrides/additions to the detector's default collection and field name tables.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MapsConfig {
    pub collection: HashMap<String, String>,
    pub field: HashMap<String, String>,
}

/// Root configuration structure, loaded from YAML with environment variable overrides. Every
/// field carries a sensible default, so a bare invocation with no config file still starts up.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mongo: MongoConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerSettings,
    pub change_stream: ChangeStreamSettings,
    pub dispatcher: DispatcherSettings,
    pub maps: MapsConfig,
    pub lease_reap_interval_ms: u64,
    pub breaker_stats_interval_ms: u64,
    pub change_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        let supervisor = SupervisorConfig::default();
        Self {
            mongo: MongoConfig::default(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            change_stream: ChangeStreamSettings::default(),
            dispatcher: DispatcherSettings::default(),
            maps: MapsConfig::default(),
            lease_reap_interval_ms: supervisor.lease_reap_interval_ms,
            breaker_stats_interval_ms: supervisor.breaker_stats_interval_ms,
            change_channel_capacity: supervisor.change_channel_capacity,
        }
    }
}

impl Config {
    pub fn load(args: &Args) -> Result<Self, figment::Error> {
        Self::figment(args).extract()
    }

    pub fn figment(args: &Args) -> Figment {
        Figment::new()
            .merge(Yaml::file(&args.config))
            .merge(Env::prefixed("HOOKRELAY_").split("__"))
    }

    pub fn change_stream_config(&self) -> ChangeStreamConfig {
        ChangeStreamConfig {
            database: self.mongo.database.clone(),
            collection: self.mongo.collection.clone(),
            partition_id: self.change_stream.partition_id.clone(),
            batch_size: self.change_stream.batch_size,
            reconnect: ReconnectPolicy {
                base_ms: self.change_stream.reconnect_base_ms,
                cap_ms: self.change_stream.reconnect_cap_ms,
            },
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            workers: self.dispatcher.workers,
            claim_batch_size: self.dispatcher.claim_batch_size,
            claim_interval_ms: self.dispatcher.claim_interval_ms,
            per_request_timeout_ms: self.dispatcher.per_request_timeout_ms,
            lease_ms: self.dispatcher.lease_ms,
            grace_period_sec: self.dispatcher.grace_period_sec,
            max_concurrent_sends: self.dispatcher.max_concurrent_sends,
            channel_capacity: self.dispatcher.channel_capacity,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            partition_id: self.change_stream.partition_id.clone(),
            change_channel_capacity: self.change_channel_capacity,
            lease_reap_interval_ms: self.lease_reap_interval_ms,
            breaker_stats_interval_ms: self.breaker_stats_interval_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_round_trip_into_component_configs() {
        let config = Config::default();
        assert_eq!(RetrySchedule::from(config.retry.clone()).max_attempts, 8);
        assert_eq!(CircuitBreakerConfig::from(config.circuit_breaker.clone()).failure_threshold, 5);
        assert_eq!(config.dispatcher_config().workers, 16);
        assert_eq!(config.change_stream_config().partition_id, "default");
    }

    #[test]
    fn maps_config_defaults_to_empty_overrides() {
        let maps = MapsConfig::default();
        assert!(maps.collection.is_empty());
        assert!(maps.field.is_empty());
    }
}
