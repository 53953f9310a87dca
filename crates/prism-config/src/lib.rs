//! # Prism Config - Configuration Management
//!
//! Layered configuration: hardcoded defaults, then an optional config
//! file, then `PRISM__`-prefixed environment variables. Each layer only
//! overrides what it explicitly sets.

use std::path::Path;

use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use prism_types::limits::{
    DEFAULT_DISJUNCTION_CAP, DEFAULT_FANOUT_WIDTH, DEFAULT_OPERATION_BUDGET,
    DEFAULT_TXN_ATTEMPTS,
};
use prism_types::EngineLimits;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage backend: currently only `memory`.
    #[serde(default = "default_backend")]
    pub backend: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { backend: default_backend() }
    }
}

fn default_backend() -> String {
    "memory".to_string()
}

/// Engine limits, mirroring the target store class's operator budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_disjunction_cap")]
    pub disjunction_cap: usize,

    #[serde(default = "default_operation_budget")]
    pub operation_budget: usize,

    #[serde(default = "default_txn_attempts")]
    pub txn_attempts: usize,

    #[serde(default = "default_fanout_width")]
    pub fanout_width: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            disjunction_cap: default_disjunction_cap(),
            operation_budget: default_operation_budget(),
            txn_attempts: default_txn_attempts(),
            fanout_width: default_fanout_width(),
        }
    }
}

impl EngineConfig {
    pub fn limits(&self) -> EngineLimits {
        EngineLimits {
            disjunction_cap: self.disjunction_cap,
            operation_budget: self.operation_budget,
            txn_attempts: self.txn_attempts,
            fanout_width: self.fanout_width,
        }
    }
}

fn default_disjunction_cap() -> usize {
    DEFAULT_DISJUNCTION_CAP
}

fn default_operation_budget() -> usize {
    DEFAULT_OPERATION_BUDGET
}

fn default_txn_attempts() -> usize {
    DEFAULT_TXN_ATTEMPTS
}

fn default_fanout_width() -> usize {
    DEFAULT_FANOUT_WIDTH
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { log_level: default_log_level(), metrics_enabled: default_metrics_enabled() }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

/// Load configuration in layers: serde defaults, then the file at `path`
/// (skipped when absent), then `PRISM__`-prefixed environment variables
/// with `__` as the section separator.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let builder = ConfigBuilder::builder()
        .add_source(File::from(path.as_ref()).required(false))
        .add_source(Environment::with_prefix("PRISM").separator("__").try_parsing(true));

    let config = builder.build()?;
    config.try_deserialize()
}

/// Convenience wrapper around [`load`] that logs instead of failing and
/// always hands back a usable configuration.
pub fn load_or_default<P: AsRef<Path>>(path: P) -> Config {
    match load(path.as_ref()) {
        Ok(config) => {
            tracing::info!("Configuration loaded from {:?}", path.as_ref());
            config
        }
        Err(e) => {
            tracing::warn!(
                "Failed to load config from {:?}: {}. Using defaults.",
                path.as_ref(),
                e
            );
            Config::default()
        }
    }
}
