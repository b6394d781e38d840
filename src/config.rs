//! Process-wide configuration.
//!
//! Per-broker/OPC-UA-server connection parameters live in the database (they
//! are multi-tenant and dynamic, see [`crate::db::models::DataSourceSpec`]);
//! this module covers only the knobs that are fixed for the lifetime of one
//! process.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

fn default_purge_interval_hours() -> f64 {
    24.0
}
fn default_window_size() -> usize {
    25
}
fn default_lru_cache_size() -> usize {
    1000
}
fn default_buffer_timeout_seconds() -> u64 {
    60
}
fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_ping_timeout_seconds() -> u64 {
    90
}
fn default_buffer_sweep_interval_seconds() -> u64 {
    5
}
fn default_outbound_topic_prefix() -> String {
    "openspc".to_string()
}
fn default_outbound_rate_limit_prune_interval_seconds() -> u64 {
    300
}

/// Top-level application configuration, loaded from environment variables with
/// an optional TOML file overlay (`OPENSPC_CONFIG_FILE`).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Postgres connection string.
    pub database_url: String,

    /// Path to the symmetric key used to encrypt broker/OPC-UA credentials at
    /// rest. No fallback to unencrypted storage is supported.
    pub credential_encryption_key_path: String,

    #[serde(default = "default_purge_interval_hours")]
    pub purge_interval_hours: f64,

    #[serde(default = "default_window_size")]
    pub window_size: usize,

    #[serde(default = "default_lru_cache_size")]
    pub lru_cache_size: usize,

    #[serde(default = "default_buffer_timeout_seconds")]
    pub buffer_timeout_seconds: u64,

    #[serde(default = "default_buffer_sweep_interval_seconds")]
    pub buffer_sweep_interval_seconds: u64,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default = "default_ping_timeout_seconds")]
    pub live_subscriber_ping_timeout_seconds: u64,

    /// Unified Namespace prefix for outbound re-publication topics (§6
    /// "Egress: MQTT outbound re-publish": `{prefix}/{plant}/{hierarchy...}/{char}/{event}`).
    #[serde(default = "default_outbound_topic_prefix")]
    pub outbound_topic_prefix: String,

    #[serde(default = "default_outbound_rate_limit_prune_interval_seconds")]
    pub outbound_rate_limit_prune_interval_seconds: u64,
}

impl AppConfig {
    /// Loads configuration from environment variables, optionally overlaid by
    /// a TOML file named in `OPENSPC_CONFIG_FILE`.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("OPENSPC_CONFIG_FILE") {
            return Self::from_toml_file(&path);
        }
        Self::from_env()
    }

    fn from_env() -> Result<Self> {
        let database_url = std::env::var("OPENSPC_DATABASE_URL")
            .map_err(|_| Error::Config("OPENSPC_DATABASE_URL is required".into()))?;
        let credential_encryption_key_path = std::env::var("OPENSPC_CREDENTIAL_KEY_PATH")
            .map_err(|_| Error::Config("OPENSPC_CREDENTIAL_KEY_PATH is required".into()))?;

        let parse_env = |name: &str| -> Option<String> { std::env::var(name).ok() };

        Ok(AppConfig {
            database_url,
            credential_encryption_key_path,
            purge_interval_hours: parse_env("OPENSPC_PURGE_INTERVAL_HOURS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_purge_interval_hours),
            window_size: parse_env("OPENSPC_WINDOW_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_window_size),
            lru_cache_size: parse_env("OPENSPC_LRU_CACHE_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_lru_cache_size),
            buffer_timeout_seconds: parse_env("OPENSPC_BUFFER_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_buffer_timeout_seconds),
            buffer_sweep_interval_seconds: default_buffer_sweep_interval_seconds(),
            listen_addr: parse_env("OPENSPC_LISTEN_ADDR").unwrap_or_else(default_listen_addr),
            live_subscriber_ping_timeout_seconds: parse_env("OPENSPC_PING_TIMEOUT_SECONDS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_ping_timeout_seconds),
            outbound_topic_prefix: parse_env("OPENSPC_OUTBOUND_TOPIC_PREFIX").unwrap_or_else(default_outbound_topic_prefix),
            outbound_rate_limit_prune_interval_seconds: default_outbound_rate_limit_prune_interval_seconds(),
        })
    }

    fn from_toml_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(Path::new(path))
            .map_err(|e| Error::Config(format!("reading config file {path}: {e}")))?;
        toml::from_str(&contents).map_err(|e| Error::Config(format!("parsing config file: {e}")))
    }

    pub fn buffer_timeout(&self) -> Duration {
        Duration::from_secs(self.buffer_timeout_seconds)
    }

    pub fn buffer_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.buffer_sweep_interval_seconds)
    }

    pub fn live_subscriber_ping_timeout(&self) -> Duration {
        Duration::from_secs(self.live_subscriber_ping_timeout_seconds)
    }

    pub fn outbound_rate_limit_prune_interval(&self) -> Duration {
        Duration::from_secs(self.outbound_rate_limit_prune_interval_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        assert_eq!(default_window_size(), 25);
        assert_eq!(default_lru_cache_size(), 1000);
        assert_eq!(default_buffer_timeout_seconds(), 60);
        assert_eq!(default_purge_interval_hours(), 24.0);
    }

    #[test]
    fn from_toml_file_parses_required_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
            database_url = "postgres://localhost/openspc"
            credential_encryption_key_path = "/etc/openspc/key"
            "#,
        )
        .unwrap();

        let cfg = AppConfig::from_toml_file(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.database_url, "postgres://localhost/openspc");
        assert_eq!(cfg.window_size, 25);
        assert_eq!(cfg.buffer_timeout_seconds, 60);
    }
}
