//! Configuration for pairdrive.
//!
//! Typed structs mapping the YAML configuration file, with defaults and a
//! loader. One [`Config`] describes one sync root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub sync: SyncConfig,
    pub transfers: TransferConfig,
    pub behavior: BehaviorConfig,
    pub network: NetworkConfig,
    pub logging: LoggingConfig,
}

/// Sync root settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Root directory of the local replica.
    pub root: PathBuf,
    /// Remote node id of the synchronized subtree root.
    pub remote_root_id: String,
    /// Name of this machine, embedded in conflict-copy file names.
    pub device_name: String,
    /// Path of the sync database file.
    pub db_path: PathBuf,
    /// Seconds between passes when nothing is happening.
    pub poll_interval: u64,
    /// Bound on automatic pass restarts before the sync is surfaced as broken.
    pub max_restarts: u32,
}

/// Upload/download tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Files above this size (bytes) upload through a chunked session.
    pub session_threshold: u64,
    /// Chunk size (bytes) for upload sessions.
    pub chunk_size: u64,
    /// Attempts per operation before it is given up.
    pub max_attempts: u32,
    /// Free disk space floor (bytes); downloads refuse to start below it.
    pub free_space_floor: u64,
}

/// User-visible behavior switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BehaviorConfig {
    /// Deletions go to the trash instead of being removed outright.
    pub move_to_trash: bool,
    /// Virtual-file mode: downloads become placeholders.
    pub virtual_files: bool,
    /// Consecutive failures on one node before it is temporarily excluded.
    pub blacklist_after_errors: u32,
    /// Number of passes an excluded node stays excluded.
    pub blacklist_pass_count: u32,
}

/// Remote endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Base URL of the drive API.
    pub base_url: String,
    /// Access token; refreshed out of band.
    pub token: String,
    /// Request timeout in seconds.
    pub timeout: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `pairdrive_engine=debug`.
    pub level: String,
    /// Verbose per-node logging of tree and operation construction.
    pub extended: bool,
}

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("pairdrive")
            .join("config.yaml")
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));
        Self {
            root: home.join("Pairdrive"),
            remote_root_id: "root".to_string(),
            device_name: hostname_or_fallback(),
            db_path: dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("~/.local/share"))
                .join("pairdrive")
                .join("sync.db"),
            poll_interval: 30,
            max_restarts: 5,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            session_threshold: 50 * 1024 * 1024,
            chunk_size: 10 * 1024 * 1024,
            max_attempts: 5,
            free_space_floor: 512 * 1024 * 1024,
        }
    }
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            move_to_trash: true,
            virtual_files: false,
            blacklist_after_errors: 3,
            blacklist_pass_count: 10,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            base_url: "https://drive.example.com/api/v2".to_string(),
            token: String::new(),
            timeout: 30,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            extended: false,
        }
    }
}

fn hostname_or_fallback() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "this-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = Config::default();
        assert!(config.transfers.session_threshold > config.transfers.chunk_size);
        assert!(config.behavior.move_to_trash);
        assert!(!config.behavior.virtual_files);
        assert!(config.sync.max_restarts > 0);
    }

    #[test]
    fn test_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");

        let mut config = Config::default();
        config.sync.device_name = "test-box".to_string();
        config.behavior.virtual_files = true;
        std::fs::write(&path, serde_yaml::to_string(&config).unwrap()).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.sync.device_name, "test-box");
        assert!(loaded.behavior.virtual_files);
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/config.yaml"));
        assert_eq!(config.logging.level, "info");
    }
}
