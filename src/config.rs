//! Configuration for elohim-files

use crate::hash::DEFAULT_HASH_LEN;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default storage root
pub fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("elohim-files")
}

fn default_hot_dir() -> PathBuf {
    default_storage_dir().join("hot")
}

/// Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hot tier directory (serves clients directly)
    #[serde(default = "default_hot_dir")]
    pub hot_storage_dir: PathBuf,

    /// Cold tier directory (long-term, authoritative when enabled)
    #[serde(default)]
    pub cold_storage_dir: Option<PathBuf>,

    /// Enable the cold tier
    #[serde(default)]
    pub use_cold_storage: bool,

    /// Length of content hashes in hex characters
    #[serde(default = "default_hash_len")]
    pub hash_len: usize,

    /// Days a hot file may go unaccessed before eviction
    #[serde(default = "default_hot_retention_days")]
    pub hot_retention_days: u64,

    /// Days a cold file may go unaccessed before eviction
    #[serde(default = "default_cold_retention_days")]
    pub cold_retention_days: u64,

    /// Hot tier size cap in bytes (0 = unlimited)
    #[serde(default)]
    pub hot_size_limit_bytes: u64,

    /// Cold tier size cap in bytes (0 = unlimited)
    #[serde(default)]
    pub cold_size_limit_bytes: u64,

    /// Delete files written longer ago than this, regardless of access (0 = disabled)
    #[serde(default)]
    pub forced_deletion_after_hours: u64,

    /// Cleanup interval in minutes, aligned to clock boundaries
    #[serde(default = "default_cleanup_interval_minutes")]
    pub cleanup_interval_minutes: u64,

    /// Age after which abandoned temp files are removed
    #[serde(default = "default_temp_file_grace_minutes")]
    pub temp_file_grace_minutes: u64,

    /// Window in which repeated touches of one hash collapse
    #[serde(default = "default_touch_debounce_secs")]
    pub touch_debounce_secs: u64,

    /// Sweep the debounce map every N touches
    #[serde(default = "default_touch_sweep_every")]
    pub touch_sweep_every: u64,

    /// Maximum number of simultaneously active downloads
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,

    /// Seconds a queued request may wait for activation before expiring
    #[serde(default = "default_request_expiry_secs")]
    pub request_expiry_secs: u64,

    /// Seconds an activated request may wait for its stream to start
    #[serde(default = "default_active_timeout_secs")]
    pub active_timeout_secs: u64,

    /// Seconds finished/expired requests are remembered
    #[serde(default = "default_terminal_retention_secs")]
    pub terminal_retention_secs: u64,

    /// Main file server URL. Shards pull misses from and forward touches to it.
    /// The node without a main URL is the authoritative (catalog-writing) node.
    #[serde(default)]
    pub main_url: Option<String>,

    /// Shared secret for internal (node-to-node) endpoints
    #[serde(default)]
    pub internal_token: Option<String>,

    /// Catalog database path (authoritative node only)
    #[serde(default)]
    pub catalog_path: Option<PathBuf>,

    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Maximum accepted upload size in bytes
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: u64,
}

fn default_hash_len() -> usize {
    DEFAULT_HASH_LEN
}

fn default_hot_retention_days() -> u64 {
    14
}

fn default_cold_retention_days() -> u64 {
    60
}

fn default_cleanup_interval_minutes() -> u64 {
    15
}

fn default_temp_file_grace_minutes() -> u64 {
    20
}

fn default_touch_debounce_secs() -> u64 {
    90
}

fn default_touch_sweep_every() -> u64 {
    1000
}

fn default_max_concurrent_downloads() -> usize {
    50
}

fn default_request_expiry_secs() -> u64 {
    300
}

fn default_active_timeout_secs() -> u64 {
    60
}

fn default_terminal_retention_secs() -> u64 {
    600
}

fn default_http_port() -> u16 {
    6200
}

fn default_max_upload_bytes() -> u64 {
    256 * 1024 * 1024
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hot_storage_dir: default_hot_dir(),
            cold_storage_dir: None,
            use_cold_storage: false,
            hash_len: DEFAULT_HASH_LEN,
            hot_retention_days: 14,
            cold_retention_days: 60,
            hot_size_limit_bytes: 0,
            cold_size_limit_bytes: 0,
            forced_deletion_after_hours: 0,
            cleanup_interval_minutes: 15,
            temp_file_grace_minutes: 20,
            touch_debounce_secs: 90,
            touch_sweep_every: 1000,
            max_concurrent_downloads: 50,
            request_expiry_secs: 300,
            active_timeout_secs: 60,
            terminal_retention_secs: 600,
            main_url: None,
            internal_token: None,
            catalog_path: None,
            http_port: 6200,
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }

    /// Cold tier directory, if the cold tier is enabled and configured
    pub fn cold_dir(&self) -> Option<&Path> {
        if self.use_cold_storage {
            self.cold_storage_dir.as_deref()
        } else {
            None
        }
    }

    /// Whether this node owns catalog mutations
    pub fn is_authoritative(&self) -> bool {
        self.main_url.is_none()
    }

    /// Catalog path, defaulting next to the hot tier
    pub fn catalog_db_path(&self) -> PathBuf {
        self.catalog_path.clone().unwrap_or_else(|| {
            self.hot_storage_dir
                .parent()
                .map(|p| p.join("catalog.sled"))
                .unwrap_or_else(|| PathBuf::from("catalog.sled"))
        })
    }

    pub fn touch_debounce(&self) -> Duration {
        Duration::from_secs(self.touch_debounce_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_minutes.max(1) * 60)
    }

    pub fn request_expiry(&self) -> Duration {
        Duration::from_secs(self.request_expiry_secs)
    }

    pub fn active_timeout(&self) -> Duration {
        Duration::from_secs(self.active_timeout_secs)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }
}
