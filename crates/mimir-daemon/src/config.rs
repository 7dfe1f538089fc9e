//! Configuration file management.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Overlay/network settings.
    #[serde(default)]
    pub network: NetworkConfig,
    /// Local storage settings.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Identity settings.
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Advanced settings.
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// 0 = OS-assigned ephemeral port for the overlay listening socket.
    #[serde(default)]
    pub listen_port: u16,
    /// Tracker public keys, as 64-char lower-case hex (Section 6, "Wire
    /// constants frozen").
    #[serde(default)]
    pub tracker_pubkeys_hex: Vec<String>,
    /// Mediator public keys this node talks to, as 64-char lower-case
    /// hex, with an optional `host:port` hint for the dev overlay
    /// transport's address book.
    #[serde(default)]
    pub mediators: Vec<MediatorEntry>,
    /// Client implementation identifier carried in every HELLO
    /// (Section 4.1).
    #[serde(default = "default_client_id")]
    pub client_id: u32,
}

/// One configured mediator (Section 4.6/4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediatorEntry {
    pub pubkey_hex: String,
    #[serde(default)]
    pub address_hint: Option<String>,
}

/// Local storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
    /// Directory attachments are written into (Section 4.9). Empty =
    /// `$data_dir/attachments/`.
    #[serde(default)]
    pub attachments_dir: String,
}

/// Identity configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Display nickname advertised in `INFO_RESPONSE`/member profiles.
    #[serde(default)]
    pub nickname: String,
    /// Free-form profile info text.
    #[serde(default)]
    pub info: String,
}

/// Advanced configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log file path. Empty = stderr.
    #[serde(default)]
    pub log_file: String,
}

fn default_client_id() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_port: 0,
            tracker_pubkeys_hex: Vec::new(),
            mediators: Vec::new(),
            client_id: default_client_id(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            attachments_dir: String::new(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            nickname: String::new(),
            info: String::new(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_file: String::new(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default config file location. Falls
    /// back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// The data directory path.
    pub fn data_dir(&self) -> PathBuf {
        if self.storage.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.storage.data_dir)
        }
    }

    /// The attachments directory path (Section 4.9).
    pub fn attachments_dir(&self) -> PathBuf {
        if self.storage.attachments_dir.is_empty() {
            self.data_dir().join("attachments")
        } else {
            PathBuf::from(&self.storage.attachments_dir)
        }
    }

    fn config_path() -> PathBuf {
        if let Ok(dir) = std::env::var("MIMIR_DATA_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        Self::default_data_dir().join("config.toml")
    }

    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("MIMIR_DATA_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/Mimir")
        }
        #[cfg(target_os = "linux")]
        {
            dirs_fallback(".mimir")
        }
        #[cfg(target_os = "windows")]
        {
            dirs_fallback("Mimir")
        }
        #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
        {
            dirs_fallback(".mimir")
        }
    }
}

/// Fallback home directory resolution.
fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/mimir"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.network.listen_port, 0);
        assert_eq!(config.network.client_id, 1);
        assert_eq!(config.advanced.log_level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let _parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
    }

    #[test]
    fn test_attachments_dir_defaults_under_data_dir() {
        let mut config = DaemonConfig::default();
        config.storage.data_dir = "/tmp/mimir-test".to_string();
        assert_eq!(
            config.attachments_dir(),
            PathBuf::from("/tmp/mimir-test/attachments")
        );
    }
}
