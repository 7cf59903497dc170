//! Configuration system for ClauseGate.
//!
//! Uses `figment` for layered configuration: defaults -> user config file ->
//! workspace config file -> environment -> explicit overrides.
//! Configuration is loaded from `~/.config/clausegate/config.toml` and/or
//! `.clausegate/config.toml` in the workspace directory.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Top-level configuration for the resource governor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    #[serde(default)]
    pub resources: ResourceConfig,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Limits and thresholds enforced by the resource manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Memory budget in megabytes shared by all registered models.
    pub memory_limit_mb: f64,
    /// Maximum number of work units processing at once.
    pub max_concurrent: usize,
    /// Expected upper bound for a single request, in milliseconds.
    /// Observational only unless `request_timeout_ms` is set.
    pub max_processing_time_ms: u64,
    /// Utilization above which an optimization pass runs.
    pub optimization_threshold: f64,
    /// Utilization above which graceful degradation is entered.
    pub degradation_threshold: f64,
    /// Delay between recovery checks while degraded, in milliseconds.
    pub recovery_check_interval_ms: u64,
    /// Hard deadline per dispatched work unit. Unset means no deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_ms: Option<u64>,
    /// Maximum number of waiting items. Unset means unbounded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_queue_size: Option<usize>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_limit_mb: 4096.0,
            max_concurrent: 4,
            max_processing_time_ms: 30_000,
            optimization_threshold: 0.8,
            degradation_threshold: 0.9,
            recovery_check_interval_ms: 30_000,
            request_timeout_ms: None,
            max_queue_size: None,
        }
    }
}

impl ResourceConfig {
    pub fn max_processing_time(&self) -> Duration {
        Duration::from_millis(self.max_processing_time_ms)
    }

    pub fn recovery_check_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_check_interval_ms)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Validate the resource section, returning a list of problems.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if !(self.memory_limit_mb.is_finite() && self.memory_limit_mb > 0.0) {
            problems.push(format!(
                "resources.memory_limit_mb must be positive (got {})",
                self.memory_limit_mb
            ));
        }
        if self.max_concurrent == 0 {
            problems.push("resources.max_concurrent must be at least 1".to_string());
        }
        if self.max_processing_time_ms == 0 {
            problems.push("resources.max_processing_time_ms must be positive".to_string());
        }
        for (name, value) in [
            ("optimization_threshold", self.optimization_threshold),
            ("degradation_threshold", self.degradation_threshold),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                problems.push(format!("resources.{name} must be in (0, 1] (got {value})"));
            }
        }
        if self.degradation_threshold <= self.optimization_threshold {
            problems.push(format!(
                "resources.degradation_threshold ({}) must exceed optimization_threshold ({})",
                self.degradation_threshold, self.optimization_threshold
            ));
        }
        if self.recovery_check_interval_ms == 0 {
            problems.push("resources.recovery_check_interval_ms must be positive".to_string());
        }
        if self.request_timeout_ms == Some(0) {
            problems.push("resources.request_timeout_ms must be positive when set".to_string());
        }
        problems
    }
}

/// Settings for the performance monitor and its alerting tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Tick interval in milliseconds.
    pub interval_ms: u64,
    /// Error rate above which the system is unhealthy.
    pub error_rate_threshold: f64,
    /// Fraction of `max_processing_time_ms` the average response time may reach.
    pub response_time_ratio: f64,
    /// Number of latency samples kept for percentile computation.
    pub sample_window: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            error_rate_threshold: 0.1,
            response_time_ratio: 0.8,
            sample_window: 1_000,
        }
    }
}

impl MonitoringConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if self.interval_ms == 0 {
            problems.push("monitoring.interval_ms must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.error_rate_threshold) {
            problems.push(format!(
                "monitoring.error_rate_threshold must be in [0, 1] (got {})",
                self.error_rate_threshold
            ));
        }
        if !(self.response_time_ratio.is_finite() && self.response_time_ratio > 0.0) {
            problems.push(format!(
                "monitoring.response_time_ratio must be positive (got {})",
                self.response_time_ratio
            ));
        }
        if self.sample_window == 0 {
            problems.push("monitoring.sample_window must be at least 1".to_string());
        }
        problems
    }
}

impl GovernorConfig {
    /// Validate the whole configuration, returning every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = self.resources.validate();
        problems.extend(self.monitoring.validate());
        problems
    }

    /// Like [`validate`](Self::validate), but as a `Result`.
    pub fn ensure_valid(&self) -> Result<(), ConfigError> {
        let problems = self.validate();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid { problems })
        }
    }
}

/// Path of the user-level config file, if the platform has a config dir.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "clausegate", "clausegate")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Path of the workspace-level config file.
pub fn workspace_config_path(workspace: &Path) -> PathBuf {
    workspace.join(".clausegate").join("config.toml")
}

/// Load configuration with layered merging.
pub fn load_config(
    workspace: Option<&Path>,
    overrides: Option<&GovernorConfig>,
) -> Result<GovernorConfig, Box<figment::Error>> {
    let mut figment = Figment::from(Serialized::defaults(GovernorConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(ws) = workspace {
        let ws_config = workspace_config_path(ws);
        if ws_config.exists() {
            figment = figment.merge(Toml::file(&ws_config));
        }
    }

    // CLAUSEGATE_RESOURCES__MAX_CONCURRENT, CLAUSEGATE_MONITORING__INTERVAL_MS, ...
    figment = figment.merge(Env::prefixed("CLAUSEGATE_").split("__"));

    if let Some(overrides) = overrides {
        figment = figment.merge(Serialized::defaults(overrides));
    }

    figment.extract().map_err(Box::new)
}

/// Load a single TOML file on top of the defaults, without env or user layers.
pub fn load_config_file(path: &Path) -> Result<GovernorConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        });
    }
    Figment::from(Serialized::defaults(GovernorConfig::default()))
        .merge(Toml::file(path))
        .extract()
        .map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })
}

/// Check whether a workspace or user config file exists.
pub fn config_exists(workspace: Option<&Path>) -> bool {
    if let Some(ws) = workspace {
        if workspace_config_path(ws).exists() {
            return true;
        }
    }
    user_config_path().is_some_and(|p| p.exists())
}
