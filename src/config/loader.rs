// src/config/loader.rs

//! # Configuration Loader
//!
//! Reads `procwatch.toml`, deserializes it into `RawConfig` and converts the
//! raw tables into the typed runtime `Config`, validating names and
//! durations on the way.

use std::{fs, path::Path, time::Duration};

use crate::config::model::{
    Config, ConfigError, MonitorConfig, MonitorStub, RawConfig, RemediationConfig, RemediationStub,
};
use crate::constants::{DEFAULT_GRACE_DELAY, DEFAULT_LOG_TARGET, DEFAULT_POLL_INTERVAL, DEFAULT_START_TIMEOUT};
use crate::monitor::MonitorOptions;
use crate::remediation::RemediationStrategy;
use crate::util::is_valid_process_name;

const LOG_TARGET: &str = "procwatch::config";

/// Load and validate the configuration at `path`.
/// Logs at DEBUG before reading and INFO on success.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    procwatch_log!(log::Level::Debug, LOG_TARGET, "Reading config from {:?}", path);
    let txt = fs::read_to_string(path)?;
    let cfg = parse(&txt)?;
    procwatch_log!(
        log::Level::Info,
        LOG_TARGET,
        "Loaded config from {:?}: {} watched process(es)",
        path,
        cfg.monitor.processes.len()
    );
    Ok(cfg)
}

/// Parse and validate TOML text.
pub fn parse(txt: &str) -> Result<Config, ConfigError> {
    let raw: RawConfig = toml::from_str(txt)?;
    Ok(Config {
        logging:     raw.logging,
        monitor:     convert_monitor(raw.monitor)?,
        remediation: convert_remediation(raw.remediation)?,
    })
}

fn convert_monitor(stub: MonitorStub) -> Result<MonitorConfig, ConfigError> {
    if let Some(bad) = stub.processes.iter().find(|n| !is_valid_process_name(n)) {
        return Err(ConfigError::InvalidProcessName(bad.clone()));
    }
    Ok(MonitorConfig {
        processes: stub.processes,
        options:   MonitorOptions {
            start_timeout: duration_or(stub.start_timeout, DEFAULT_START_TIMEOUT)?,
            poll_interval: duration_or(stub.poll_interval, DEFAULT_POLL_INTERVAL)?,
            log_target:    stub.log_target.unwrap_or_else(|| DEFAULT_LOG_TARGET.into()),
        },
    })
}

fn convert_remediation(stub: RemediationStub) -> Result<RemediationConfig, ConfigError> {
    let strategy = match stub.strategy {
        Some(s) => s.parse()?,
        None => RemediationStrategy::default(),
    };
    Ok(RemediationConfig {
        enabled:     stub.enabled,
        strategy,
        grace_delay: duration_or(stub.grace_delay, DEFAULT_GRACE_DELAY)?,
    })
}

/// `"250ms"` → `Duration`; absent → `default`.
fn duration_or(raw: Option<String>, default: Duration) -> Result<Duration, ConfigError> {
    match raw {
        Some(s) => humantime::parse_duration(&s).map_err(|e| ConfigError::InvalidDuration(s, e)),
        None => Ok(default),
    }
}
