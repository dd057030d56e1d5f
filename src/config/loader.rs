//! Configuration file loader.

use std::path::{Path, PathBuf};

use super::Config;

const LOCAL_CONFIG_FILE: &str = ".log-sentinel.toml";
const APP_DIR: &str = "log-sentinel";

/// Configuration loader that searches multiple locations.
#[derive(Debug)]
pub struct ConfigLoader {
    /// Search paths in order of priority.
    search_paths: Vec<PathBuf>,
}

impl ConfigLoader {
    /// Create a new config loader with default search paths.
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = Vec::new();

        // 1. Current directory: .log-sentinel.toml
        search_paths.push(PathBuf::from(LOCAL_CONFIG_FILE));

        // 2. User config directory: ~/.config/log-sentinel/config.toml
        if let Some(config_dir) = dirs::config_dir() {
            search_paths.push(config_dir.join(APP_DIR).join("config.toml"));
        }

        Self { search_paths }
    }

    /// Create a config loader with a specific config file path.
    #[must_use]
    pub fn with_path(path: PathBuf) -> Self {
        Self {
            search_paths: vec![path],
        }
    }

    /// Load configuration from the first available file.
    ///
    /// # Errors
    ///
    /// Returns an error if no config file exists or it cannot be parsed.
    pub fn load(&self) -> Result<Config, ConfigError> {
        let Some(path) = self.find_config_file() else {
            return Err(ConfigError::NotFound(self.search_paths.clone()));
        };
        tracing::debug!(path = %path.display(), "Loading config file");
        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path.
    fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the search paths for debugging.
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Find the first config file that exists.
    #[must_use]
    pub fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths.iter().find(|p| p.exists()).cloned()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No config file found (searched {0:?})")]
    NotFound(Vec<PathBuf>),

    #[error("Failed to read config file {path}: {source}")]
    ReadError {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("No log files specified")]
    NoLogFiles,

    #[error("Log files not found: {0:?}")]
    MissingLogFiles(Vec<PathBuf>),

    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: f64 },

    #[error("Invalid pattern {pattern:?}: {source}")]
    InvalidPattern {
        pattern: String,
        source: regex::Error,
    },
}
