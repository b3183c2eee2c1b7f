//! Reconciliation sensor configuration.
//!
//! Configuration is resolved in layers: defaults, then a serialized document
//! (the CLI reads JSON scenario files), then `TIDEMARK_*` environment
//! variables via [`SensorConfig::apply_env`].
//!
//! ## Environment
//!
//! | Variable | Field |
//! |----------|-------|
//! | `TIDEMARK_SENSOR_NAME` | `name` |
//! | `TIDEMARK_WAIT_FOR_ALL_UPSTREAM` | `wait_for_all_upstream` |
//! | `TIDEMARK_WAIT_FOR_IN_PROGRESS_RUNS` | `wait_for_in_progress_runs` |
//! | `TIDEMARK_MINIMUM_INTERVAL_SECONDS` | `minimum_interval_seconds` |
//! | `TIDEMARK_DEFAULT_STATUS` | `default_status` (`running` / `stopped`) |
//! | `TIDEMARK_RUN_TAGS` | `run_tags` (`key=value,key=value`) |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::AssetSelection;
use crate::reconcile::ReconciliationOptions;
use crate::sensor::SensorStatus;

/// Default sensor name.
pub const DEFAULT_SENSOR_NAME: &str = "asset_reconciliation_sensor";

/// Configuration for an asset reconciliation sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SensorConfig {
    /// Sensor name; ASCII letters, digits and underscores only.
    pub name: String,
    /// Assets the sensor keeps up to date.
    pub selection: AssetSelection,
    /// Require every parent to be updated before materializing.
    pub wait_for_all_upstream: bool,
    /// Defer assets whose parents are still being produced.
    pub wait_for_in_progress_runs: bool,
    /// Minimum seconds between evaluations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_interval_seconds: Option<u64>,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Status the sensor starts in.
    pub default_status: SensorStatus,
    /// Tags attached to every run request.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub run_tags: BTreeMap<String, String>,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SENSOR_NAME.to_string(),
            selection: AssetSelection::All,
            wait_for_all_upstream: false,
            wait_for_in_progress_runs: true,
            minimum_interval_seconds: None,
            description: None,
            default_status: SensorStatus::Stopped,
            run_tags: BTreeMap::new(),
        }
    }
}

impl SensorConfig {
    /// Loads configuration from environment variables over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed, or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Overrides fields with any `TIDEMARK_*` variables that are set.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is present but malformed, or the
    /// resulting configuration is invalid.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(name) = env_string("TIDEMARK_SENSOR_NAME") {
            self.name = name;
        }
        if let Some(all) = env_bool("TIDEMARK_WAIT_FOR_ALL_UPSTREAM")? {
            self.wait_for_all_upstream = all;
        }
        if let Some(wait) = env_bool("TIDEMARK_WAIT_FOR_IN_PROGRESS_RUNS")? {
            self.wait_for_in_progress_runs = wait;
        }
        if let Some(seconds) = env_u64("TIDEMARK_MINIMUM_INTERVAL_SECONDS")? {
            self.minimum_interval_seconds = Some(seconds);
        }
        if let Some(status) = env_string("TIDEMARK_DEFAULT_STATUS") {
            self.default_status = parse_status("TIDEMARK_DEFAULT_STATUS", &status)?;
        }
        if let Some(tags) = env_string("TIDEMARK_RUN_TAGS") {
            self.run_tags = parse_run_tags("TIDEMARK_RUN_TAGS", &tags)?;
        }
        self.validate()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfiguration`] describing the first problem.
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if self.minimum_interval_seconds == Some(0) {
            return Err(Error::configuration(
                "minimum_interval_seconds must be greater than zero",
            ));
        }
        if let Some(key) = self.run_tags.keys().find(|k| k.trim().is_empty()) {
            return Err(Error::configuration(format!(
                "run tag keys must not be empty (got {key:?})"
            )));
        }
        Ok(())
    }

    /// Policy switches for the reconciliation engine.
    #[must_use]
    pub fn options(&self) -> ReconciliationOptions {
        ReconciliationOptions {
            wait_for_all_upstream: self.wait_for_all_upstream,
            wait_for_in_progress_runs: self.wait_for_in_progress_runs,
        }
    }
}

/// Checks a sensor name against `^[A-Za-z0-9_]+$`.
///
/// # Errors
///
/// Returns [`Error::InvalidConfiguration`] if the name is empty or contains
/// other characters.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::configuration(format!(
            "sensor name {name:?} must match ^[A-Za-z0-9_]+$"
        )));
    }
    Ok(())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    v.parse::<u64>()
        .map(Some)
        .map_err(|e| Error::configuration(format!("{name} must be a u64: {e}")))
}

fn env_bool(name: &str) -> Result<Option<bool>> {
    let Some(v) = env_string(name) else {
        return Ok(None);
    };
    parse_bool(name, &v).map(Some)
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    let value = value.trim().to_ascii_lowercase();
    match value.as_str() {
        "true" | "1" | "yes" | "y" => Ok(true),
        "false" | "0" | "no" | "n" => Ok(false),
        _ => Err(Error::configuration(format!(
            "{name} must be a boolean (true/false/1/0)"
        ))),
    }
}

fn parse_status(name: &str, value: &str) -> Result<SensorStatus> {
    match value.trim().to_ascii_lowercase().as_str() {
        "running" => Ok(SensorStatus::Running),
        "stopped" => Ok(SensorStatus::Stopped),
        _ => Err(Error::configuration(format!(
            "{name} must be one of: running, stopped (got {value})"
        ))),
    }
}

/// Parses `key=value,key=value`. Blank entries are ignored.
fn parse_run_tags(name: &str, value: &str) -> Result<BTreeMap<String, String>> {
    let mut tags = BTreeMap::new();
    for entry in value.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let Some((key, val)) = entry.split_once('=') else {
            return Err(Error::configuration(format!(
                "{name} entries must be key=value (got {entry})"
            )));
        };
        tags.insert(key.trim().to_string(), val.trim().to_string());
    }
    Ok(tags)
}
