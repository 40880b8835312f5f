use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::codec::DOWNLOAD_CHUNK_SIZE;
use crate::relay::download::PumpConfig;
use crate::relay::upload::DEFAULT_MAX_PENDING;

/// Top-level configuration, read from `config.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub relay: RelaySettings,
    pub local: LocalSettings,
    /// Log file for the servers (defaults to `ferry.log` in the cache directory)
    pub log_file: Option<PathBuf>,
}

/// Settings for the websocket shell relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub bind: IpAddr,
    pub port: u16,
    pub download_chunk_size: usize,
    pub ack_timeout_secs: u64,
    pub ready_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub keepalive_secs: u64,
    /// Replacement for a leading `~` in remote paths
    pub remote_home: String,
    /// Directory that bare remote file names are resolved against
    pub remote_base_dir: String,
    pub max_upload_chunks: u64,
    /// Uploads one session may have open at once
    pub max_pending_uploads: usize,
    /// Directory with the browser client, served at `/`
    pub client_dir: Option<PathBuf>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 669,
            download_chunk_size: DOWNLOAD_CHUNK_SIZE,
            ack_timeout_secs: 10,
            ready_timeout_secs: 60,
            connect_timeout_secs: 20,
            keepalive_secs: 10,
            remote_home: "/root".to_string(),
            remote_base_dir: "/root".to_string(),
            max_upload_chunks: 1 << 20,
            max_pending_uploads: DEFAULT_MAX_PENDING,
            client_dir: None,
        }
    }
}

impl RelaySettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn pump_config(&self) -> PumpConfig {
        PumpConfig {
            chunk_size: self.download_chunk_size.max(1),
            ack_timeout: Duration::from_secs(self.ack_timeout_secs),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
        }
    }
}

/// Settings for the single-host HTTP file server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub bind: IpAddr,
    pub port: u16,
    /// Upload root; relative paths are resolved against the working directory
    pub root: PathBuf,
    pub max_upload_bytes: usize,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 667,
            root: PathBuf::from("uploads"),
            max_upload_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

impl Settings {
    /// Load configuration from the default config file, falling back to defaults
    pub fn load() -> Result<Self> {
        let config_path = get_config_file_path()?;
        if !config_path.exists() {
            return Ok(Self::default());
        }
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;

        let settings: Settings = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))?;

        Ok(settings)
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory at {}", parent.display()))?;
        }

        let content = serde_json::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file at {}", path.display()))?;

        Ok(())
    }

    /// Log file location, defaulting into the cache directory
    pub fn log_file_path(&self) -> Result<PathBuf> {
        match &self.log_file {
            Some(path) => Ok(path.clone()),
            None => Ok(get_cache_dir()?.join("ferry.log")),
        }
    }
}

/// Get the default config directory
pub fn get_config_dir() -> Result<PathBuf> {
    ProjectDirs::from("dev", "ferry", "ferry")
        .map(|proj_dirs| proj_dirs.config_dir().to_path_buf())
        .context("Failed to determine config directory")
}

/// Get the default cache directory
pub fn get_cache_dir() -> Result<PathBuf> {
    ProjectDirs::from("dev", "ferry", "ferry")
        .map(|proj_dirs| proj_dirs.cache_dir().to_path_buf())
        .context("Failed to determine cache directory")
}

/// Get the path to the config file
pub fn get_config_file_path() -> Result<PathBuf> {
    let config_dir = get_config_dir()?;
    Ok(config_dir.join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let settings: Settings = serde_json::from_str(r#"{ "relay": { "port": 7000 } }"#).unwrap();
        assert_eq!(settings.relay.port, 7000);
        assert_eq!(settings.relay.ack_timeout_secs, 10);
        assert_eq!(settings.relay.remote_home, "/root");
        assert_eq!(settings.local.port, 667);
        assert_eq!(settings.local.root, PathBuf::from("uploads"));
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");

        let mut settings = Settings::default();
        settings.relay.remote_base_dir = "/srv/drop".to_string();
        settings.local.port = 8080;
        settings.save_to_path(&path).unwrap();

        let loaded = Settings::load_from_path(&path).unwrap();
        assert_eq!(loaded.relay.remote_base_dir, "/srv/drop");
        assert_eq!(loaded.local.port, 8080);
    }

    #[test]
    fn test_malformed_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = Settings::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_pump_config_from_settings() {
        let pump = RelaySettings::default().pump_config();
        assert_eq!(pump.chunk_size, 5 * 1024 * 1024);
        assert_eq!(pump.ack_timeout, Duration::from_secs(10));
    }
}
