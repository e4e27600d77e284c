//! Bridge configuration.
//!
//! Settings are read from a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/runt-bridge/settings.json
//! - Linux: ~/.config/runt-bridge/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\runt-bridge\settings.json
//!
//! Every field is optional in the file; missing fields take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Comm target name used by the Jupyter widget protocol.
pub const WIDGET_TARGET_NAME: &str = "jupyter.widget";

/// MIME key under which a display bundle carries serialized widget state.
pub const WIDGET_STATE_MIME: &str = "application/vnd.jupyter.widget-state+json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Comm target the registrar subscribes to.
    pub widget_target_name: String,

    /// MIME key the hydrator looks for in display_data bundles.
    pub widget_state_mime: String,

    /// How long to wait for a heartbeat before declaring the kernel dead.
    pub heartbeat_timeout_ms: u64,

    /// How long to wait for the kernel_info_reply handshake.
    pub kernel_info_timeout_ms: u64,

    /// Send a shutdown_request to the kernel when the session is torn down.
    ///
    /// Off by default: the bridge attaches to kernels it did not start.
    pub shutdown_kernel_on_teardown: bool,

    /// Append every observed kernel message to this JSONL file.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dump_path: Option<PathBuf>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            widget_target_name: WIDGET_TARGET_NAME.to_string(),
            widget_state_mime: WIDGET_STATE_MIME.to_string(),
            heartbeat_timeout_ms: 2_000,
            kernel_info_timeout_ms: 10_000,
            shutdown_kernel_on_teardown: false,
            dump_path: None,
        }
    }
}

impl BridgeConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn kernel_info_timeout(&self) -> Duration {
        Duration::from_millis(self.kernel_info_timeout_ms)
    }
}

/// Get the path to the default settings file
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("runt-bridge")
        .join("settings.json")
}

/// Load settings from an explicit file. Read and parse errors propagate.
pub fn load_config_from(path: &Path) -> Result<BridgeConfig> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Load settings from the default location, returning defaults if the file
/// is missing or unreadable.
pub fn load_config() -> BridgeConfig {
    let path = config_path();
    if !path.exists() {
        return BridgeConfig::default();
    }
    match load_config_from(&path) {
        Ok(config) => config,
        Err(e) => {
            log::warn!("[config] Ignoring unreadable settings at {:?}: {}", path, e);
            BridgeConfig::default()
        }
    }
}

/// Save settings to a file, creating parent directories as needed.
pub fn save_config(config: &BridgeConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.widget_target_name, "jupyter.widget");
        assert_eq!(
            config.widget_state_mime,
            "application/vnd.jupyter.widget-state+json"
        );
        assert!(!config.shutdown_kernel_on_teardown);
        assert!(config.dump_path.is_none());
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let json = r#"{"widget_target_name": "custom.widget"}"#;
        let parsed: BridgeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.widget_target_name, "custom.widget");
        assert_eq!(parsed.widget_state_mime, WIDGET_STATE_MIME);
        assert_eq!(parsed.kernel_info_timeout_ms, 10_000);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("settings.json");
        let config = BridgeConfig {
            shutdown_kernel_on_teardown: true,
            dump_path: Some(PathBuf::from("/tmp/dump.jsonl")),
            ..Default::default()
        };

        save_config(&config, &path).unwrap();
        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_invalid_file_errors() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(load_config_from(&path).is_err());
    }

    #[test]
    fn test_config_path_is_valid() {
        let path = config_path();
        assert!(path.ends_with("runt-bridge/settings.json"));
    }
}
