//! Orchestrator configuration (YAML)
//!
//! ```yaml
//! version: 1
//! autostart: true
//! event_capacity: 256
//! max_batch: 50
//! log_filter: info
//! ```

use crate::error::KappaError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Configuration error type
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing 'version' field in configuration file. Add 'version: 1' to the top of your YAML file.")]
    MissingVersion,

    #[error("Unsupported configuration version {found}. Supported versions: {}", supported.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))]
    UnsupportedVersion { found: u32, supported: Vec<u32> },

    #[error("Invalid range for field '{field}': {value} not in {min}..={max}")]
    Range {
        field: String,
        value: String,
        min: String,
        max: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

impl From<ConfigError> for KappaError {
    fn from(err: ConfigError) -> Self {
        KappaError::config(err)
    }
}

/// YAML schema v1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFileV1 {
    version: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    autostart: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    event_capacity: Option<usize>,

    #[serde(skip_serializing_if = "Option::is_none")]
    max_batch: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    log_filter: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KappaConfig {
    /// Open flows as soon as they are registered
    pub autostart: bool,
    /// Buffer size of every event channel
    pub event_capacity: usize,
    /// Default batch size for log sources
    pub max_batch: u64,
    /// Tracing filter directive, overridden by `RUST_LOG`
    pub log_filter: Option<String>,
}

impl Default for KappaConfig {
    fn default() -> Self {
        Self {
            autostart: true,
            event_capacity: 256,
            max_batch: 50,
            log_filter: None,
        }
    }
}

impl KappaConfig {
    pub fn autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    pub fn max_batch(mut self, max_batch: u64) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    pub fn validate(&self) -> ConfigResult<()> {
        check_range("event_capacity", self.event_capacity as u64, 1, 65_536)?;
        check_range("max_batch", self.max_batch, 1, 100_000)?;
        Ok(())
    }

    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        let file: ConfigFileV1 = serde_yaml::from_str(content)?;

        let version = file.version.ok_or(ConfigError::MissingVersion)?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(ConfigError::UnsupportedVersion {
                found: version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }

        let defaults = Self::default();
        let config = Self {
            autostart: file.autostart.unwrap_or(defaults.autostart),
            event_capacity: file.event_capacity.unwrap_or(defaults.event_capacity),
            max_batch: file.max_batch.unwrap_or(defaults.max_batch),
            log_filter: file.log_filter,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        let file = ConfigFileV1 {
            version: Some(1),
            autostart: Some(self.autostart),
            event_capacity: Some(self.event_capacity),
            max_batch: Some(self.max_batch),
            log_filter: self.log_filter.clone(),
        };
        Ok(serde_yaml::to_string(&file)?)
    }
}

fn check_range(field: &str, value: u64, min: u64, max: u64) -> ConfigResult<()> {
    if value < min || value > max {
        return Err(ConfigError::Range {
            field: field.to_string(),
            value: value.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        });
    }
    Ok(())
}
