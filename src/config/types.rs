//! Configuration types.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::ConfigError;

/// External command run when an alert fires, e.g. an audio player and a clip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertCommand {
    /// Program to execute.
    pub command: String,
    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,
}

/// Pattern whose appearance triggers an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoundConfig {
    /// Regular expression tested against each new line.
    #[serde(default = "default_found_pattern")]
    pub pattern: String,
    /// Command to run on each matching line.
    #[serde(default)]
    pub alert: Option<AlertCommand>,
}

fn default_found_pattern() -> String {
    r"Found [1-9]+ proofs\.".to_string()
}

impl Default for FoundConfig {
    fn default() -> Self {
        Self {
            pattern: default_found_pattern(),
            alert: None,
        }
    }
}

/// Pattern expected to appear regularly; its absence triggers an alert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingConfig {
    /// Regular expression the log should keep producing.
    pub pattern: String,
    /// Minutes without a matching line before alerting.
    #[serde(default = "default_missing_timeout_mins")]
    pub timeout_mins: f64,
    /// Shown in the alert instead of the raw pattern.
    #[serde(default)]
    pub description: Option<String>,
    /// Command to run when the timeout fires.
    #[serde(default)]
    pub alert: Option<AlertCommand>,
}

fn default_missing_timeout_mins() -> f64 {
    5.0
}

impl MissingConfig {
    /// Zero when out of range; [`Config::validate`] rejects such values.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_mins * 60.0).unwrap_or_default()
    }

    /// Description if set, otherwise the pattern.
    #[must_use]
    pub fn label(&self) -> &str {
        self.description.as_deref().unwrap_or(&self.pattern)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log files to watch.
    #[serde(default)]
    pub log_files: Vec<PathBuf>,
    /// Seconds between polls of each file.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: f64,
    /// Upper bound on one poll cycle, in seconds.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: f64,
    /// Consecutive unreadable polls before warning about a file.
    #[serde(default = "default_unavailable_warn_after")]
    pub unavailable_warn_after: u32,
    /// Pattern that triggers an alert when found.
    #[serde(default)]
    pub found: FoundConfig,
    /// Patterns that trigger an alert when missing.
    #[serde(default)]
    pub missing: Vec<MissingConfig>,
}

fn default_check_interval_secs() -> f64 {
    2.0
}

fn default_poll_timeout_secs() -> f64 {
    30.0
}

fn default_unavailable_warn_after() -> u32 {
    5
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_files: Vec::new(),
            check_interval_secs: default_check_interval_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
            unavailable_warn_after: default_unavailable_warn_after(),
            found: FoundConfig::default(),
            missing: Vec::new(),
        }
    }
}

impl Config {
    /// Zero when out of range; [`Config::validate`] rejects such values.
    #[must_use]
    pub fn check_interval(&self) -> Duration {
        Duration::try_from_secs_f64(self.check_interval_secs).unwrap_or_default()
    }

    /// Zero when out of range; [`Config::validate`] rejects such values.
    #[must_use]
    pub fn poll_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.poll_timeout_secs).unwrap_or_default()
    }

    /// Compile the found pattern.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] if the pattern is not a valid regex.
    pub fn found_regex(&self) -> Result<Regex, ConfigError> {
        compile(&self.found.pattern)
    }

    /// Compile every missing pattern, paired with its config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidPattern`] for the first invalid regex.
    pub fn missing_regexes(&self) -> Result<Vec<(&MissingConfig, Regex)>, ConfigError> {
        self.missing
            .iter()
            .map(|m| compile(&m.pattern).map(|re| (m, re)))
            .collect()
    }

    /// Check that the configuration can be used to start watching.
    ///
    /// Every missing log file is reported at once, not just the first.
    ///
    /// # Errors
    ///
    /// Returns the first problem found, in field order.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_files.is_empty() {
            return Err(ConfigError::NoLogFiles);
        }

        let missing: Vec<PathBuf> = self
            .log_files
            .iter()
            .filter(|p| !p.exists())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingLogFiles(missing));
        }

        checked_secs("check_interval_secs", self.check_interval_secs, self.check_interval_secs)?;
        checked_secs("poll_timeout_secs", self.poll_timeout_secs, self.poll_timeout_secs)?;
        for m in &self.missing {
            checked_secs("missing.timeout_mins", m.timeout_mins * 60.0, m.timeout_mins)?;
        }

        self.found_regex()?;
        self.missing_regexes()?;
        Ok(())
    }
}

/// Check that `secs` is usable as a timer period: positive, representable as a
/// `Duration`, and small enough to add to the current instant. `value` is the
/// field as written, reported on failure.
fn checked_secs(field: &'static str, secs: f64, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .filter(|d| !d.is_zero() && Instant::now().checked_add(*d).is_some())
        .ok_or(ConfigError::InvalidValue { field, value })
}

fn compile(pattern: &str) -> Result<Regex, ConfigError> {
    Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}
