//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.
//! Everything is read once; components receive plain values such as
//! [`CreationOptions`] rather than consulting process state themselves.

use crate::storage::enumerator::DEFAULT_ENUMERATION_CACHE_SIZE;
use crate::storage::options::{
    CreationOptions, DEFAULT_HARD_RETAINED_LIMIT, DEFAULT_SOFT_RETAINED_LIMIT,
};
use crate::storage::paged::{DEFAULT_MAX_OPEN_PAGES, DEFAULT_PAGE_SIZE};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Entries in the shared key → id cache
    #[serde(default = "default_enumeration_cache_size")]
    pub enumeration_cache_size: usize,

    /// Containers cached per index
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    #[serde(default = "default_page_size")]
    pub page_size: usize,

    #[serde(default = "default_max_open_pages")]
    pub max_open_pages: usize,

    #[serde(default)]
    pub io_statistics: bool,

    #[serde(default = "default_true")]
    pub single_file_descriptor: bool,

    #[serde(default = "default_true")]
    pub compression_enabled: bool,

    #[serde(default)]
    pub dump_chunk_removal_time: bool,

    /// Bytes retained per value before compaction spills it
    #[serde(default = "default_soft_retained_limit")]
    pub soft_retained_limit: u64,

    #[serde(default = "default_hard_retained_limit")]
    pub hard_retained_limit: u64,
}

fn default_data_dir() -> String {
    dirs::data_local_dir()
        .map(|p| p.join("indexio").to_string_lossy().to_string())
        .unwrap_or_else(|| "./indexio_data".to_string())
}

fn default_enumeration_cache_size() -> usize {
    DEFAULT_ENUMERATION_CACHE_SIZE
}

fn default_cache_size() -> usize {
    crate::index::DEFAULT_CACHE_SIZE
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

fn default_max_open_pages() -> usize {
    DEFAULT_MAX_OPEN_PAGES
}

fn default_true() -> bool {
    true
}

fn default_soft_retained_limit() -> u64 {
    DEFAULT_SOFT_RETAINED_LIMIT
}

fn default_hard_retained_limit() -> u64 {
    DEFAULT_HARD_RETAINED_LIMIT
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            enumeration_cache_size: default_enumeration_cache_size(),
            cache_size: default_cache_size(),
            page_size: default_page_size(),
            max_open_pages: default_max_open_pages(),
            io_statistics: false,
            single_file_descriptor: true,
            compression_enabled: true,
            dump_chunk_removal_time: false,
            soft_retained_limit: default_soft_retained_limit(),
            hard_retained_limit: default_hard_retained_limit(),
        }
    }
}

impl StorageSettings {
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(&self.data_dir)
    }

    /// Creation options for every store opened under these settings
    pub fn creation_options(&self) -> CreationOptions {
        let mut options = CreationOptions::default().with_compression(self.compression_enabled);
        options.single_file_descriptor = self.single_file_descriptor;
        options.dump_chunk_removal_time = self.dump_chunk_removal_time;
        options.io_statistics = self.io_statistics;
        options.soft_retained_limit = self.soft_retained_limit;
        options.hard_retained_limit = self.hard_retained_limit;
        options.page_size = self.page_size;
        options.max_open_pages = self.max_open_pages;
        options
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
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
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => {
            tracing::warn!("Ignoring {}={:?}: not a boolean", name, value);
            None
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

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

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
            dirs::config_dir().map(|p| p.join("indexio").join("config.toml")),
            Some(PathBuf::from("/etc/indexio/config.toml")),
            Some(PathBuf::from("./config.toml")),
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

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        // Storage overrides
        if let Ok(data_dir) = std::env::var("INDEXIO_DATA_DIR") {
            self.storage.data_dir = data_dir;
        }
        if let Ok(size) = std::env::var("INDEXIO_ENUMERATION_CACHE_SIZE") {
            match size.parse() {
                Ok(size) => self.storage.enumeration_cache_size = size,
                Err(_) => tracing::warn!("Ignoring INDEXIO_ENUMERATION_CACHE_SIZE={:?}", size),
            }
        }
        if let Some(flag) = env_flag("INDEXIO_IO_STATISTICS") {
            self.storage.io_statistics = flag;
        }
        if let Some(flag) = env_flag("INDEXIO_SINGLE_FILE_DESCRIPTOR") {
            self.storage.single_file_descriptor = flag;
        }
        if let Some(flag) = env_flag("INDEXIO_COMPRESSION") {
            self.storage.compression_enabled = flag;
        }
        if let Some(flag) = env_flag("INDEXIO_DUMP_CHUNK_REMOVAL_TIME") {
            self.storage.dump_chunk_removal_time = flag;
        }

        // Logging overrides
        if let Ok(level) = std::env::var("INDEXIO_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(format) = std::env::var("INDEXIO_LOG_FORMAT") {
            self.logging.format = format;
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

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level. Calling this twice is harmless:
/// the second installation is ignored.
pub fn init_logging(config: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    r#"# Indexio Configuration
#
# Environment variables override these settings:
# - INDEXIO_DATA_DIR
# - INDEXIO_ENUMERATION_CACHE_SIZE
# - INDEXIO_IO_STATISTICS
# - INDEXIO_SINGLE_FILE_DESCRIPTOR
# - INDEXIO_COMPRESSION
# - INDEXIO_DUMP_CHUNK_REMOVAL_TIME
# - INDEXIO_LOG_LEVEL
# - INDEXIO_LOG_FORMAT

[storage]
# Directory holding one subdirectory per index
data_dir = "~/.local/share/indexio"

# Entries in the shared key -> id cache
enumeration_cache_size = 8192

# Value containers cached per index
cache_size = 64

# Memory-mapped page size (bytes)
page_size = 1048576

# Pages kept mapped per file
max_open_pages = 64

# Count page loads and flushes, reported at debug level on close
io_statistics = false

# Read and append values through one file handle
single_file_descriptor = true

# LZ4-compress value logs (changing this discards existing indices)
compression_enabled = true

# Log timing of chunk compaction every 1000 chunks
dump_chunk_removal_time = false

# Bytes a value may retain in memory during compaction before it is spilled
soft_retained_limit = 10485760
hard_retained_limit = 104857600

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#
    .to_string()
}
