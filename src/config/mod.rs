//! Configuration module for Tollgate
//!
//! Provides layered configuration loading from files, environment variables, and defaults,
//! the same three-step shape as the host project's configuration layer.

pub mod error;
pub mod logging;

pub use error::ConfigError;
pub use logging::{LogFormat, LoggingConfig};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// What to do when the durable `BudgetStore` is unreachable or times out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Proceed against in-memory state, with a warning.
    #[default]
    FailOpen,
    /// Reject the operation.
    FailClosed,
}

impl FromStr for FailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fail_open" | "fail-open" => Ok(FailureMode::FailOpen),
            "fail_closed" | "fail-closed" => Ok(FailureMode::FailClosed),
            _ => Err(format!("invalid failure mode: {}", s)),
        }
    }
}

/// Metrics emission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Attach `run_id` as a metric dimension (high-cardinality, opt-in).
    pub emit_run_id: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { emit_run_id: false }
    }
}

/// Top-level configuration for the control plane.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TollgateConfig {
    /// Master switch for admission/constraint enforcement.
    pub enable_budget_enforcement: bool,

    /// Master switch for adaptive routing.
    pub enable_routing: bool,

    /// Policy reload interval, in seconds.
    pub policy_reload_interval_secs: u64,

    /// Behavior when the durable store is unavailable.
    pub failure_mode: FailureMode,

    pub metrics: MetricsConfig,
    pub logging: LoggingConfig,
}

impl TollgateConfig {
    /// Create the baseline configuration (enforcement and routing both on,
    /// 300s reload interval, fail-open).
    pub fn new() -> Self {
        Self {
            enable_budget_enforcement: true,
            enable_routing: true,
            policy_reload_interval_secs: 300,
            failure_mode: FailureMode::FailOpen,
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// If `path` is `None`, returns the baseline configuration.
    /// If `path` doesn't exist, returns `NotFound`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(p) => {
                if !p.exists() {
                    return Err(ConfigError::NotFound(p.to_path_buf()));
                }
                let content = std::fs::read_to_string(p)?;
                toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            None => Ok(Self::new()),
        }
    }

    /// Apply `TOLLGATE_*` environment variable overrides.
    ///
    /// Invalid values are silently ignored (previous value is kept).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("TOLLGATE_ENABLE_BUDGET_ENFORCEMENT") {
            if let Ok(b) = v.parse() {
                self.enable_budget_enforcement = b;
            }
        }
        if let Ok(v) = std::env::var("TOLLGATE_ENABLE_ROUTING") {
            if let Ok(b) = v.parse() {
                self.enable_routing = b;
            }
        }
        if let Ok(v) = std::env::var("TOLLGATE_POLICY_RELOAD_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.policy_reload_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("TOLLGATE_FAILURE_MODE") {
            if let Ok(m) = v.parse() {
                self.failure_mode = m;
            }
        }
        if let Ok(v) = std::env::var("TOLLGATE_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Ok(v) = std::env::var("TOLLGATE_LOG_FORMAT") {
            if let Ok(f) = v.parse() {
                self.logging.format = f;
            }
        }

        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy_reload_interval_secs == 0 {
            return Err(ConfigError::Validation {
                field: "policy_reload_interval_secs".to_string(),
                message: "must be non-zero".to_string(),
            });
        }

        Ok(())
    }
}
