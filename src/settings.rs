//! Persisted user settings
//!
//! Stored as JSON in the platform config directory. A missing or unreadable
//! file never prevents the proxy from starting; callers that want the
//! failure use [`Settings::load_from`] / [`Settings::save_to`] directly.

use crate::config::{
    ConfigError, ProxyConfig, DEFAULT_FIREWALL_RULE_NAME, DEFAULT_PORT, DEFAULT_TARGET_URL,
    DEFAULT_USE_TLS,
};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

const APPLICATION: &str = "UrlProxy";
const SETTINGS_FILE: &str = "settings.json";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to access settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// User-editable settings, as written to `settings.json`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct Settings {
    pub port: u16,
    pub target_url: String,
    pub firewall_rule_name: String,
    pub use_https: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            target_url: DEFAULT_TARGET_URL.to_string(),
            firewall_rule_name: DEFAULT_FIREWALL_RULE_NAME.to_string(),
            use_https: DEFAULT_USE_TLS,
        }
    }
}

impl Settings {
    /// `<config dir>/UrlProxy/settings.json`, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", APPLICATION).map(|dirs| dirs.config_dir().join(SETTINGS_FILE))
    }

    /// Read settings from `path`. A file that does not exist yields defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(SettingsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        serde_json::from_str(&contents).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read settings, falling back to defaults on any error
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        Self::load_from(path).unwrap_or_else(|e| {
            warn!("{}; using default settings", e);
            Self::default()
        })
    }

    /// Write settings to `path`, creating parent directories as needed
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        let path = path.as_ref();
        let io_error = |source: io::Error| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).map_err(io_error)
    }

    /// Write settings, logging instead of failing
    pub fn save_or_warn<P: AsRef<Path>>(&self, path: P) {
        if let Err(e) = self.save_to(path) {
            warn!("Could not save settings: {}", e);
        }
    }

    pub fn to_proxy_config(&self) -> Result<ProxyConfig, ConfigError> {
        ProxyConfig::new(
            self.port,
            &self.target_url,
            self.use_https,
            &self.firewall_rule_name,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.port, 3000);
        assert_eq!(settings.target_url, "http://localhost:5059");
        assert_eq!(settings.firewall_rule_name, "AAProxyRule");
        assert!(settings.use_https);
    }

    #[test]
    fn test_reads_pascal_case_keys_with_defaults_for_missing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, r#"{ "Port": 8443, "TargetUrl": "http://127.0.0.1:8000" }"#).unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.port, 8443);
        assert_eq!(settings.target_url, "http://127.0.0.1:8000");
        assert_eq!(settings.firewall_rule_name, "AAProxyRule");
        assert!(settings.use_https);
    }

    #[test]
    fn test_corrupt_file_is_an_error_but_load_or_default_recovers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            Settings::load_from(&path),
            Err(SettingsError::Parse { .. })
        ));
        assert_eq!(Settings::load_or_default(&path), Settings::default());
    }

    #[test]
    fn test_save_creates_directories() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("UrlProxy").join("settings.json");

        let settings = Settings {
            port: 4000,
            target_url: "http://localhost:9000".to_string(),
            firewall_rule_name: "DevRule".to_string(),
            use_https: false,
        };
        settings.save_to(&path).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("\"FirewallRuleName\": \"DevRule\""));
        assert_eq!(Settings::load_from(&path).unwrap(), settings);
    }

    #[test]
    fn test_to_proxy_config() {
        let config = Settings::default().to_proxy_config().unwrap();
        assert_eq!(config.port(), 3000);
        assert!(config.use_tls());

        let broken = Settings {
            port: 0,
            ..Settings::default()
        };
        assert!(broken.to_proxy_config().is_err());
    }
}
