//! Configuration loading for tabvault-relay.
//!
//! Configuration is loaded from a TOML file (default: `relay.toml`).

use serde::Deserialize;
use std::path::PathBuf;

/// Root configuration for tabvault-relay.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// HTTP server configuration.
    pub server: ServerConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Restore protocol configuration.
    pub restore: RestoreConfig,
    /// Push event-stream configuration.
    pub events: EventsConfig,
    /// Cleanup task configuration.
    pub cleanup: CleanupConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Bearer token every API call must carry. The relay stores only
    /// ciphertext, but the token keeps strangers from filling the disk.
    pub auth_token: String,
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Maximum encrypted snapshot size in bytes (default: 500 KB).
    #[serde(default = "default_max_snapshot_size")]
    pub max_snapshot_size: usize,
    /// Snapshot retention in seconds (default: 30 days). The newest
    /// snapshot per device is always kept regardless of age.
    #[serde(default = "default_snapshot_retention")]
    pub snapshot_retention_secs: u64,
}

/// Restore protocol configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RestoreConfig {
    /// Lifetime of a pending restore request in seconds (default: 300).
    #[serde(default = "default_restore_ttl")]
    pub ttl_secs: u64,
}

/// Push event-stream configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Heartbeat interval on open streams in seconds (default: 25).
    /// Short enough to beat common proxy idle timeouts.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    /// Per-device buffer of undelivered frames before the stream is
    /// considered stuck (default: 32).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Cleanup task configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CleanupConfig {
    /// Cleanup interval in seconds (default: 300).
    #[serde(default = "default_cleanup_interval")]
    pub interval_secs: u64,
    /// Enable cleanup task (default: true).
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("relay.db")
}

fn default_max_snapshot_size() -> usize {
    512 * 1024
}

fn default_snapshot_retention() -> u64 {
    30 * 24 * 60 * 60 // 30 days in seconds
}

fn default_restore_ttl() -> u64 {
    300 // 5 minutes
}

fn default_heartbeat_secs() -> u64 {
    25
}

fn default_channel_capacity() -> usize {
    32
}

fn default_cleanup_interval() -> u64 {
    300 // 5 minutes
}

fn default_cleanup_enabled() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind_address: default_bind_address(),
                auth_token: "test-token".to_string(),
            },
            storage: StorageConfig {
                database: default_database_path(),
                max_snapshot_size: default_max_snapshot_size(),
                snapshot_retention_secs: default_snapshot_retention(),
            },
            restore: RestoreConfig {
                ttl_secs: default_restore_ttl(),
            },
            events: EventsConfig {
                heartbeat_secs: default_heartbeat_secs(),
                channel_capacity: default_channel_capacity(),
            },
            cleanup: CleanupConfig {
                interval_secs: default_cleanup_interval(),
                enabled: default_cleanup_enabled(),
            },
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.storage.max_snapshot_size, 512 * 1024);
        assert_eq!(config.restore.ttl_secs, 300);
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"
auth_token = "s3cret"

[storage]
database = "/data/relay.db"
max_snapshot_size = 2097152

[restore]
ttl_secs = 120

[events]
heartbeat_secs = 10

[cleanup]
interval_secs = 60
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.server.auth_token, "s3cret");
        assert_eq!(config.storage.database, PathBuf::from("/data/relay.db"));
        assert_eq!(config.storage.max_snapshot_size, 2_097_152);
        assert_eq!(config.restore.ttl_secs, 120);
        assert_eq!(config.events.heartbeat_secs, 10);
        assert_eq!(config.cleanup.interval_secs, 60);
    }

    #[test]
    fn config_missing_fields_use_defaults() {
        let toml = r#"
[server]
auth_token = "s3cret"
[storage]
[restore]
[events]
[cleanup]
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.storage.max_snapshot_size, 512 * 1024);
        assert_eq!(config.storage.snapshot_retention_secs, 30 * 24 * 60 * 60);
        assert_eq!(config.events.channel_capacity, 32);
        assert!(config.cleanup.enabled);
    }

    #[test]
    fn auth_token_is_required() {
        let toml = r#"
[server]
[storage]
[restore]
[events]
[cleanup]
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }
}
