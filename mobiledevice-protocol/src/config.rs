//! Transport Configuration
//!
//! Read-only settings shared by every client in the process: where the
//! multiplexer daemon listens, I/O timeouts, frame size limits and the label
//! sent with every request.
//!
//! Loaded from `<config dir>/mobiledevice/transport.toml` when present.
//! The `USBMUXD_SOCKET_ADDRESS` environment variable overrides the daemon
//! address.

use crate::muxer::MuxerAddress;
use crate::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming the multiplexer daemon address
pub const MUXER_ADDRESS_ENV: &str = "USBMUXD_SOCKET_ADDRESS";

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Daemon address (`UNIX:/path` or `host:port`); platform default if unset
    #[serde(default)]
    pub muxer_address: Option<String>,

    /// Per-operation I/O timeout in seconds, 0 disables
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    /// Largest accepted frame payload in bytes
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Client label sent as `ProgName` / `Label`
    #[serde(default = "default_label")]
    pub label: String,

    /// Directory for file-backed pairing records
    #[serde(default)]
    pub pairing_record_dir: Option<PathBuf>,
}

fn default_io_timeout() -> u64 {
    30
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}

fn default_label() -> String {
    env!("CARGO_PKG_NAME").to_string()
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            muxer_address: None,
            io_timeout_secs: default_io_timeout(),
            max_frame_size: default_max_frame_size(),
            label: default_label(),
            pairing_record_dir: None,
        }
    }
}

impl TransportConfig {
    /// Default location of the configuration file
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join("mobiledevice")
            .join("transport.toml")
    }

    /// Load from the default location, falling back to defaults
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            debug!("No transport config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProtocolError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    /// Parse TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| ProtocolError::Configuration(format!("invalid transport config: {}", e)))?;
        if config.max_frame_size == 0 {
            return Err(ProtocolError::Configuration(
                "max_frame_size must be positive".to_string(),
            ));
        }
        Ok(config)
    }

    /// Per-operation I/O timeout, `None` when disabled
    pub fn io_timeout(&self) -> Option<Duration> {
        (self.io_timeout_secs > 0).then(|| Duration::from_secs(self.io_timeout_secs))
    }

    /// Daemon address from the environment or this config, `None` for the platform default
    pub fn muxer_address(&self) -> Result<Option<MuxerAddress>> {
        self.muxer_address_with(std::env::var(MUXER_ADDRESS_ENV).ok())
    }

    /// Same as [`TransportConfig::muxer_address`] with an explicit environment value
    pub fn muxer_address_with(&self, env_value: Option<String>) -> Result<Option<MuxerAddress>> {
        env_value
            .filter(|value| !value.trim().is_empty())
            .or_else(|| self.muxer_address.clone())
            .map(|value| MuxerAddress::parse(&value))
            .transpose()
    }

    /// Directory for file-backed pairing records
    pub fn pairing_record_dir(&self) -> PathBuf {
        self.pairing_record_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from(".local/share"))
                .join("mobiledevice")
                .join("pairing")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.io_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(config.label, "mobiledevice-protocol");
        assert!(config.pairing_record_dir().ends_with("mobiledevice/pairing"));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = TransportConfig::from_toml("io_timeout_secs = 0\nlabel = \"test-host\"\n").unwrap();
        assert_eq!(config.io_timeout(), None);
        assert_eq!(config.label, "test-host");
        assert_eq!(config.max_frame_size, default_max_frame_size());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            TransportConfig::from_toml("io_timeout_secs = \"soon\""),
            Err(ProtocolError::Configuration(_))
        ));
        assert!(matches!(
            TransportConfig::from_toml("max_frame_size = 0"),
            Err(ProtocolError::Configuration(_))
        ));
    }

    #[test]
    fn test_environment_overrides_file() {
        let config = TransportConfig {
            muxer_address: Some("127.0.0.1:27015".to_string()),
            ..TransportConfig::default()
        };

        assert_eq!(
            config.muxer_address_with(None).unwrap(),
            Some(MuxerAddress::Tcp("127.0.0.1:27015".to_string()))
        );
        assert_eq!(
            config
                .muxer_address_with(Some("UNIX:/tmp/mux".to_string()))
                .unwrap(),
            Some(MuxerAddress::Unix(PathBuf::from("/tmp/mux")))
        );
        assert_eq!(
            TransportConfig::default().muxer_address_with(None).unwrap(),
            None
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transport.toml");
        std::fs::write(&path, "muxer_address = \"UNIX:/run/usbmuxd\"\n").unwrap();

        let config = TransportConfig::load_from(&path).unwrap();
        assert_eq!(config.muxer_address.as_deref(), Some("UNIX:/run/usbmuxd"));
        assert!(matches!(
            TransportConfig::load_from(&dir.path().join("missing.toml")),
            Err(ProtocolError::Configuration(_))
        ));
    }
}
