//! Configuration file management.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use pulse_core::ConnectionConfig;
use serde::{Deserialize, Serialize};

/// Default scan timeout in seconds.
pub const DEFAULT_SCAN_TIMEOUT: u64 = 10;

/// Configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Default device name or address
    #[serde(default)]
    pub device: Option<String>,

    /// Scan timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,

    /// Connection timeout in seconds
    #[serde(default)]
    pub connect_timeout: Option<u64>,

    /// Service discovery timeout in seconds
    #[serde(default)]
    pub discovery_timeout: Option<u64>,

    /// Database path (defaults to the platform data directory)
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// Persist readings while watching
    #[serde(default = "default_true")]
    pub store: bool,

    /// Device aliases (friendly name -> device name or address)
    #[serde(default)]
    pub aliases: HashMap<String, String>,
}

fn default_true() -> bool {
    true
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device: None,
            timeout: None,
            connect_timeout: None,
            discovery_timeout: None,
            database: None,
            store: true,
            aliases: HashMap::new(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("pulse")
            .join("config.toml")
    }

    /// Load config from `path` (or the default location), falling back to
    /// defaults when the file is missing or unreadable.
    pub fn load(path: Option<&Path>) -> Self {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::path);
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Warning: {:#}", e);
                Self::default()
            }
        }
    }

    /// Load config from `path`, failing on a missing or malformed file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// BLE timeouts, with configured values overriding the defaults.
    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();
        if let Some(secs) = self.connect_timeout {
            config = config.connection_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.discovery_timeout {
            config = config.discovery_timeout(Duration::from_secs(secs));
        }
        config
    }

    /// The database path to open.
    pub fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(pulse_store::default_db_path)
    }
}

/// Resolve device from arg or config, expanding aliases.
pub fn resolve_device(device: Option<String>, config: &Config) -> Option<String> {
    device
        .or_else(|| config.device.clone())
        .map(|d| resolve_alias(&d, config))
}

/// Resolve an alias to its target, or return the input unchanged.
pub fn resolve_alias(device: &str, config: &Config) -> String {
    config
        .aliases
        .get(device)
        .cloned()
        .unwrap_or_else(|| device.to_string())
}

/// Resolve timeout: explicit flag, then config, then `default`.
pub fn resolve_timeout(cmd_timeout: Option<u64>, config: &Config, default: u64) -> u64 {
    cmd_timeout.or(config.timeout).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_device_prefers_arg() {
        let config = Config {
            device: Some("config-device".to_string()),
            ..Default::default()
        };
        let result = resolve_device(Some("arg-device".to_string()), &config);
        assert_eq!(result, Some("arg-device".to_string()));
    }

    #[test]
    fn test_resolve_device_falls_back_to_config() {
        let config = Config {
            device: Some("config-device".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_device(None, &config),
            Some("config-device".to_string())
        );
        assert_eq!(resolve_device(None, &Config::default()), None);
    }

    #[test]
    fn test_resolve_device_expands_alias() {
        let mut config = Config::default();
        config
            .aliases
            .insert("chest".to_string(), "AA:BB:CC:DD:EE:FF".to_string());

        assert_eq!(
            resolve_device(Some("chest".to_string()), &config),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
        assert_eq!(resolve_alias("Polar", &config), "Polar");
    }

    #[test]
    fn test_resolve_timeout_precedence() {
        let config = Config {
            timeout: Some(60),
            ..Default::default()
        };
        assert_eq!(resolve_timeout(Some(45), &config, 10), 45);
        assert_eq!(resolve_timeout(None, &config, 10), 60);
        assert_eq!(resolve_timeout(None, &Config::default(), 10), 10);
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: Config = toml::from_str("device = \"Polar\"").unwrap();
        assert_eq!(config.device.as_deref(), Some("Polar"));
        assert!(config.store);
        assert!(config.database.is_none());
    }

    #[test]
    fn test_connection_config_overrides() {
        let config = Config {
            connect_timeout: Some(20),
            ..Default::default()
        };
        let connection = config.connection_config();
        assert_eq!(connection.connection_timeout, Duration::from_secs(20));
        assert_eq!(connection.discovery_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pulse").join("config.toml");
        let config = Config {
            device: Some("Wahoo".to_string()),
            store: false,
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load(Some(&path));
        assert_eq!(loaded.device.as_deref(), Some("Wahoo"));
        assert!(!loaded.store);
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&dir.path().join("absent.toml")));
        assert!(config.device.is_none());
        assert!(config.store);
    }

    #[test]
    fn test_load_from_rejects_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "store = \"maybe\"").unwrap();
        assert!(Config::load_from(&path).is_err());
    }
}
