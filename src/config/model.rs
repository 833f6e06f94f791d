// src/config/model.rs

use serde::Deserialize;
use std::{str::FromStr, time::Duration};
use thiserror::Error;

use crate::monitor::MonitorOptions;
use crate::remediation::RemediationStrategy;

/// Top-level runtime config
#[derive(Debug, Clone)]
pub struct Config {
    pub logging:     LoggingConfig,
    pub monitor:     MonitorConfig,
    pub remediation: RemediationConfig,
}

/// Mirror of the `[logging]` table
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]                   pub enable: bool,
    #[serde(default)]                   pub file:   Option<String>,
    #[serde(default = "default_level")] pub level:  String,
}
fn default_level() -> String { "INFO".into() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { enable: false, file: None, level: default_level() }
    }
}

/// Raw `[monitor]` table; durations still strings
#[derive(Debug, Default, Deserialize)]
pub struct MonitorStub {
    #[serde(default)] pub processes:     Vec<String>,
    #[serde(default)] pub start_timeout: Option<String>,
    #[serde(default)] pub poll_interval: Option<String>,
    #[serde(default)] pub log_target:    Option<String>,
}

/// Raw `[remediation]` table
#[derive(Debug, Default, Deserialize)]
pub struct RemediationStub {
    #[serde(default)] pub enabled:     bool,
    #[serde(default)] pub strategy:    Option<String>,
    #[serde(default)] pub grace_delay: Option<String>,
}

/// Whole file as it sits on disk
#[derive(Debug, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)] pub logging:     LoggingConfig,
    #[serde(default)] pub monitor:     MonitorStub,
    #[serde(default)] pub remediation: RemediationStub,
}

/// Fully-typed `[monitor]`
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub processes: Vec<String>,
    pub options:   MonitorOptions,
}

/// Fully-typed `[remediation]`
#[derive(Debug, Clone, Copy)]
pub struct RemediationConfig {
    pub enabled:     bool,
    pub strategy:    RemediationStrategy,
    pub grace_delay: Duration,
}

/// All the ways config loading can go wrong
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid remediation strategy '{0}' (expected 'direct' or 'shell')")]
    InvalidStrategy(String),

    #[error("invalid duration '{0}': {1}")]
    InvalidDuration(String, #[source] humantime::DurationError),

    #[error("invalid process name '{0}'")]
    InvalidProcessName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Allow `"Shell"` → `RemediationStrategy::Shell`
impl FromStr for RemediationStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(RemediationStrategy::Direct),
            "shell"  => Ok(RemediationStrategy::Shell),
            other    => Err(ConfigError::InvalidStrategy(other.into())),
        }
    }
}
