//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::indexer::IndexConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Index configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IndexSettings {
    /// One checkpoint every `interval` events
    #[serde(default = "default_interval")]
    pub interval: u64,

    #[serde(default = "default_branching_factor")]
    pub branching_factor: usize,

    /// Store indexes on disk and reuse them across runs
    #[serde(default = "default_persistent")]
    pub persistent: bool,

    #[serde(default = "default_index_dir")]
    pub index_dir: String,

    #[serde(default = "default_node_cache_capacity")]
    pub node_cache_capacity: usize,
}

fn default_interval() -> u64 {
    1000
}

fn default_branching_factor() -> usize {
    32
}

fn default_persistent() -> bool {
    true
}

fn default_index_dir() -> String {
    dirs::cache_dir()
        .map(|p| p.join("tracemark").to_string_lossy().to_string())
        .unwrap_or_else(|| "./tracemark_index".to_string())
}

fn default_node_cache_capacity() -> usize {
    crate::checkpoint::DEFAULT_NODE_CACHE_CAPACITY
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            branching_factor: default_branching_factor(),
            persistent: default_persistent(),
            index_dir: default_index_dir(),
            node_cache_capacity: default_node_cache_capacity(),
        }
    }
}

impl IndexSettings {
    /// Runtime indexer parameters
    pub fn index_config(&self) -> IndexConfig {
        IndexConfig::new(self.interval)
            .with_branching_factor(self.branching_factor)
            .with_node_cache_capacity(self.node_cache_capacity)
    }

    /// Index directory with a leading `~` expanded
    pub fn index_dir(&self) -> PathBuf {
        match self.index_dir.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(&self.index_dir)),
            None => PathBuf::from(&self.index_dir),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,

    pub file: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })
    }

    fn parse(content: &str) -> Result<Self, String> {
        let config: Config = toml::from_str(content).map_err(|e| e.to_string())?;
        config
            .index
            .index_config()
            .validate()
            .map_err(|e| e.to_string())?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("tracemark").join("config.toml")),
            Some(PathBuf::from("./tracemark.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::debug!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Index overrides
        if let Some(interval) = env_parse("TRACEMARK_INTERVAL") {
            self.index.interval = interval;
        }
        if let Some(branching) = env_parse("TRACEMARK_BRANCHING_FACTOR") {
            self.index.branching_factor = branching;
        }
        if let Some(persistent) = env_parse("TRACEMARK_PERSISTENT") {
            self.index.persistent = persistent;
        }
        if let Ok(dir) = std::env::var("TRACEMARK_INDEX_DIR") {
            self.index.index_dir = dir;
        }
        if let Some(capacity) = env_parse("TRACEMARK_NODE_CACHE") {
            self.index.node_cache_capacity = capacity;
        }

        // Logging overrides
        if let Ok(level) = std::env::var("TRACEMARK_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("TRACEMARK_LOG_FORMAT") {
            self.logging.format = format;
        }
        if let Ok(file) = std::env::var("TRACEMARK_LOG_FILE") {
            self.logging.file = Some(file);
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("Ignoring invalid {}={:?}", name, value);
            None
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# tracemark configuration
#
# Environment variables override these settings:
# - TRACEMARK_INTERVAL
# - TRACEMARK_BRANCHING_FACTOR
# - TRACEMARK_PERSISTENT
# - TRACEMARK_INDEX_DIR
# - TRACEMARK_NODE_CACHE
# - TRACEMARK_LOG_LEVEL
# - TRACEMARK_LOG_FORMAT
# - TRACEMARK_LOG_FILE

[index]
# One checkpoint every N events
interval = 1000

# B-tree branching factor (nodes hold up to 2b-1 checkpoints)
branching_factor = 32

# Keep indexes on disk and reuse them while the trace is unchanged
persistent = true

# Directory for index files
index_dir = "~/.cache/tracemark"

# Decoded B-tree nodes kept in memory
node_cache_capacity = 256

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"

# Optional log file path
# file = "/var/log/tracemark/tracemark.log"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_parses() {
        let config = Config::parse(&generate_default_config()).unwrap();

        assert_eq!(config.index.interval, 1000);
        assert_eq!(config.index.branching_factor, 32);
        assert!(config.index.persistent);
        assert_eq!(config.logging.format, "pretty");
        assert!(config.logging.file.is_none());
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = Config::parse("[index]\ninterval = 50\n").unwrap();

        assert_eq!(config.index.interval, 50);
        assert_eq!(config.index.node_cache_capacity, 256);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tracemark.toml");
        std::fs::write(&path, "[index]\ninterval = 0\n").unwrap();

        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_missing_file() {
        let err = Config::load(Path::new("/nonexistent/tracemark.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_index_dir_expands_home() {
        let settings = IndexSettings {
            index_dir: "~/indexes".to_string(),
            ..IndexSettings::default()
        };

        if let Some(home) = dirs::home_dir() {
            assert_eq!(settings.index_dir(), home.join("indexes"));
        }
    }
}
