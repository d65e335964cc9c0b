//! Configuration system for pullwatch
//!
//! Supports loading configuration from:
//! 1. CLI --config argument
//! 2. ~/.config/pullwatch/config.{PULLWATCH_ENV}.json
//! 3. Default values
//!
//! Where PULLWATCH_ENV can be: production (default), development, test
//!
//! # Examples
//!
//! ```no_run
//! use pullwatch::config::AppConfig;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = AppConfig::load(None)?;
//! println!("Polling every {:?}", config.monitor.poll_interval());
//! # Ok(())
//! # }
//! ```
//!
//! ## Environment Variables
//!
//! Environment variables override config file values:
//! - PULLWATCH_POLL_INTERVAL_MS
//! - PULLWATCH_STALENESS_MS
//! - PULLWATCH_TIMEOUT_SECS
//! - PULLWATCH_GRACE_MS

use crate::monitor::handle::TaskSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config JSON: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Timing and budget knobs for one monitoring session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll cadence in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How long push may stay silent before polls resume
    #[serde(default = "default_staleness_threshold_ms")]
    pub staleness_threshold_ms: u64,

    /// Overall deadline in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Wait for a remote cancel acknowledgement before forcing `cancelled`
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    /// Consecutive failed reads tolerated while push is unavailable
    #[serde(default = "default_max_read_failures")]
    pub max_read_failures: u32,

    #[serde(default = "default_resource_prefix")]
    pub resource_prefix: String,

    /// Remote operation started by `pull`
    #[serde(default = "default_tool_name")]
    pub tool_name: String,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_staleness_threshold_ms() -> u64 {
    5000
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_grace_period_ms() -> u64 {
    3000
}

fn default_max_read_failures() -> u32 {
    5
}

fn default_resource_prefix() -> String {
    crate::mcp::resource::DOWNLOADS_PREFIX.to_string()
}

fn default_tool_name() -> String {
    "pull_model".to_string()
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            staleness_threshold_ms: default_staleness_threshold_ms(),
            timeout_secs: default_timeout_secs(),
            grace_period_ms: default_grace_period_ms(),
            max_read_failures: default_max_read_failures(),
            resource_prefix: default_resource_prefix(),
            tool_name: default_tool_name(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn staleness_threshold(&self) -> Duration {
        Duration::from_millis(self.staleness_threshold_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    /// Spec for pulling `model` with the configured tool and resource prefix
    pub fn pull_spec(&self, model: &str, alias: Option<&str>, hf_token: Option<&str>) -> TaskSpec {
        let mut spec = TaskSpec::pull_model(model, alias, hf_token);
        spec.call = self.tool_name.clone();
        spec.resource_id = format!("{}{}", self.resource_prefix, model);
        spec
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "poll_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.staleness_threshold_ms == 0 {
            return Err(ConfigError::ValidationError(
                "staleness_threshold_ms must be greater than 0".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.grace_period_ms == 0 {
            return Err(ConfigError::ValidationError(
                "grace_period_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_read_failures == 0 {
            return Err(ConfigError::ValidationError(
                "max_read_failures must be greater than 0".to_string(),
            ));
        }
        if self.resource_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "resource_prefix cannot be empty".to_string(),
            ));
        }
        if self.tool_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "tool_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// In-process download server used by the CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopbackConfig {
    /// Time between progress steps in milliseconds
    #[serde(default = "default_step_ms")]
    pub step_ms: u64,

    /// Percent gained per step
    #[serde(default = "default_step_percent")]
    pub step_percent: u8,

    /// Models available in the registry
    #[serde(default = "default_models")]
    pub models: Vec<String>,
}

fn default_step_ms() -> u64 {
    3000
}

fn default_step_percent() -> u8 {
    10
}

fn default_models() -> Vec<String> {
    ["gemma3-1b", "gemma-3n-E2B", "gemma-3n-E4B", "phi-4-mini", "qwen2.5-1.5b"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            step_ms: default_step_ms(),
            step_percent: default_step_percent(),
            models: default_models(),
        }
    }
}

impl LoopbackConfig {
    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.step_ms == 0 {
            return Err(ConfigError::ValidationError(
                "step_ms must be greater than 0".to_string(),
            ));
        }
        if !(1..=100).contains(&self.step_percent) {
            return Err(ConfigError::ValidationError(format!(
                "step_percent must be between 1 and 100, got {}",
                self.step_percent
            )));
        }
        Ok(())
    }
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub loopback: LoopbackConfig,

    /// Enable debug logging
    #[serde(default)]
    pub debug: bool,
}

impl AppConfig {
    /// Load configuration from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: AppConfig = serde_json::from_str(&content)?;

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load configuration with standard priority:
    /// 1. Explicit path
    /// 2. ~/.config/pullwatch/config.{PULLWATCH_ENV}.json
    /// 3. Defaults
    pub fn load(explicit_path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = explicit_path {
            if path.exists() {
                tracing::info!("Loading config from: {:?}", path);
                return Self::from_file(path);
            } else {
                return Err(ConfigError::ValidationError(format!(
                    "Config file not found: {:?}",
                    path
                )));
            }
        }

        let env = std::env::var("PULLWATCH_ENV").unwrap_or_else(|_| "production".to_string());

        if let Some(config_dir) = Self::config_dir() {
            let config_path = config_dir.join(format!("config.{}.json", env));
            if config_path.exists() {
                tracing::info!("Loading config from: {:?}", config_path);
                return Self::from_file(&config_path);
            }
        }

        tracing::info!("Using default configuration with environment overrides");
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(ms) = env_u64("PULLWATCH_POLL_INTERVAL_MS")? {
            self.monitor.poll_interval_ms = ms;
        }
        if let Some(ms) = env_u64("PULLWATCH_STALENESS_MS")? {
            self.monitor.staleness_threshold_ms = ms;
        }
        if let Some(secs) = env_u64("PULLWATCH_TIMEOUT_SECS")? {
            self.monitor.timeout_secs = secs;
        }
        if let Some(ms) = env_u64("PULLWATCH_GRACE_MS")? {
            self.monitor.grace_period_ms = ms;
        }
        Ok(())
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.monitor.validate()?;
        self.loopback.validate()?;
        Ok(())
    }

    /// Get the config directory path
    pub fn config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("pullwatch"))
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

fn env_u64(name: &str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().map(Some).map_err(|_| {
            ConfigError::ValidationError(format!("{} must be an integer, got {:?}", name, value))
        }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.monitor.poll_interval(), Duration::from_secs(2));
        assert_eq!(config.monitor.tool_name, "pull_model");
        assert_eq!(config.monitor.resource_prefix, "litert://downloads/");
        assert_eq!(config.loopback.step_percent, 10);
    }

    #[test]
    fn test_monitor_config_validation() {
        let mut config = MonitorConfig::default();
        assert!(config.validate().is_ok());

        config.grace_period_ms = 0;
        assert!(config.validate().is_err());

        config.grace_period_ms = 100;
        config.max_read_failures = 0;
        assert!(config.validate().is_err());

        config.max_read_failures = 3;
        config.tool_name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pull_spec_uses_configured_endpoint() {
        let mut config = MonitorConfig::default();
        let spec = config.pull_spec("gemma3-1b", Some("gemma"), None);
        assert_eq!(spec.call, "pull_model");
        assert_eq!(spec.resource_id, "litert://downloads/gemma3-1b");
        assert_eq!(spec.args["alias"], "gemma");

        config.tool_name = "fetch_model".to_string();
        config.resource_prefix = "mirror://downloads/".to_string();
        let spec = config.pull_spec("gemma3-1b", None, None);
        assert_eq!(spec.call, "fetch_model");
        assert_eq!(spec.resource_id, "mirror://downloads/gemma3-1b");
        assert_eq!(spec.task_id, "gemma3-1b");
    }

    #[test]
    fn test_loopback_config_validation() {
        let mut config = LoopbackConfig::default();
        config.step_percent = 0;
        assert!(config.validate().is_err());
        config.step_percent = 101;
        assert!(config.validate().is_err());
        config.step_percent = 25;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.test.json");
        std::fs::write(&path, r#"{"monitor": {"poll_interval_ms": 250}}"#).unwrap();

        let config = AppConfig::from_file(&path).unwrap();
        assert_eq!(config.monitor.poll_interval_ms, 250);
        assert_eq!(config.monitor.grace_period_ms, 3000);
        assert_eq!(config.loopback.models.len(), 5);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut config = AppConfig::default();
        config.monitor.timeout_secs = 30;
        config.save_to_file(&path).unwrap();

        let parsed = AppConfig::from_file(&path).unwrap();
        assert_eq!(parsed.monitor.timeout_secs, 30);
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let result = AppConfig::load(Some(Path::new("/nonexistent/pullwatch.json")));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
