//! Daemon configuration and well-known paths.
//!
//! Everything lives under the per-user application-support directory
//! (`~/Library/Application Support/iMCP` on macOS, `~/.config/iMCP` on
//! Linux). The directory layout is a fixed contract shared with the UI
//! layer and the bridge binary:
//!
//! - `server.port`    -- port rendezvous file (written by the listener)
//! - `tokens.json`    -- token snapshot (written by the UI)
//! - `services.json`  -- per-service enabled flags (written by the UI)
//! - `config.json`    -- daemon settings (this file)
//! - `data/`          -- service adapter stores
//! - `logs/`          -- rolling daemon logs

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Name of the app-support subdirectory.
pub const APP_DIR_NAME: &str = "iMCP";

/// File name of the port rendezvous file.
pub const PORT_FILE_NAME: &str = "server.port";

/// Resolve the application-support directory, honouring the
/// `IMCP_SUPPORT_DIR` override (used by tests and CI).
pub fn support_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("IMCP_SUPPORT_DIR") {
        return PathBuf::from(dir);
    }
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// Daemon settings persisted in `config.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub watcher: WatcherConfig,
}

/// Message watcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Path to the host message database. `None` falls back to the
    /// platform default location.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    /// Executable invoked when new messages arrive. The watcher stays idle
    /// without one.
    #[serde(default)]
    pub script_path: Option<PathBuf>,
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub poll_secs: u64,
    #[serde(default = "default_script_timeout_secs")]
    pub script_timeout_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            database_path: None,
            script_path: None,
            debounce_secs: default_debounce_secs(),
            poll_secs: default_poll_secs(),
            script_timeout_secs: default_script_timeout_secs(),
        }
    }
}

fn default_debounce_secs() -> u64 {
    5
}

fn default_poll_secs() -> u64 {
    60
}

fn default_script_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Load `config.json` from the given support directory, falling back to
    /// defaults when the file is missing or unreadable.
    pub fn load(support_dir: &Path) -> Self {
        let path = support_dir.join("config.json");
        match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }
}

/// Path of the port rendezvous file inside a support directory.
pub fn port_file_path(support_dir: &Path) -> PathBuf {
    support_dir.join(PORT_FILE_NAME)
}

/// Path of the token snapshot file.
pub fn tokens_path(support_dir: &Path) -> PathBuf {
    support_dir.join("tokens.json")
}

/// Path of the service-bindings file.
pub fn services_path(support_dir: &Path) -> PathBuf {
    support_dir.join("services.json")
}

/// Directory holding the service adapter stores.
pub fn data_dir(support_dir: &Path) -> PathBuf {
    support_dir.join("data")
}

/// Directory holding rolling daemon logs.
pub fn log_dir(support_dir: &Path) -> PathBuf {
    support_dir.join("logs")
}

/// Platform-default location of the host message database.
pub fn default_message_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Library")
        .join("Messages")
        .join("chat.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert!(!config.watcher.enabled);
        assert_eq!(config.watcher.debounce_secs, 5);
        assert_eq!(config.watcher.poll_secs, 60);
        assert_eq!(config.watcher.script_timeout_secs, 30);
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path());
        assert!(config.watcher.script_path.is_none());
    }

    #[test]
    fn test_load_partial_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"watcher":{"enabled":true,"scriptPath":"/usr/local/bin/on-message"}}"#,
        )
        .unwrap();
        let config = Config::load(dir.path());
        assert!(config.watcher.enabled);
        assert_eq!(
            config.watcher.script_path.as_deref(),
            Some(Path::new("/usr/local/bin/on-message"))
        );
        // Unspecified fields keep their defaults.
        assert_eq!(config.watcher.debounce_secs, 5);
    }

    #[test]
    fn test_well_known_paths() {
        let root = Path::new("/tmp/imcp-test");
        assert!(port_file_path(root).ends_with("server.port"));
        assert!(tokens_path(root).ends_with("tokens.json"));
        assert!(data_dir(root).ends_with("data"));
    }
}
