//! Multiplexer Daemon Location
//!
//! Where the multiplexer daemon listens depends on the platform and can be
//! overridden by the environment. [`MuxerLocator`] is the pluggable
//! strategy; [`DefaultLocator`] implements the standard resolution:
//!
//! 1. `USBMUXD_SOCKET_ADDRESS` (`UNIX:/path` or `host:port`)
//! 2. the configured `muxer_address`
//! 3. `/var/run/usbmuxd` on Unix, `127.0.0.1:27015` elsewhere
//!
//! A daemon that is not running is not an error: locating it yields `None`.

use crate::config::TransportConfig;
use crate::transport::BoxChannel;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::path::PathBuf;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Unix socket path of the daemon
pub const DEFAULT_UNIX_SOCKET: &str = "/var/run/usbmuxd";

/// Loopback address of the daemon on platforms without Unix sockets
pub const DEFAULT_TCP_ADDRESS: &str = "127.0.0.1:27015";

/// Where the multiplexer daemon listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxerAddress {
    /// Unix domain socket
    Unix(PathBuf),
    /// TCP `host:port`
    Tcp(String),
}

impl MuxerAddress {
    /// Parse `UNIX:/path` or `host:port`
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if let Some(path) = value.strip_prefix("UNIX:") {
            if path.is_empty() {
                return Err(ProtocolError::Configuration(
                    "empty Unix socket path".to_string(),
                ));
            }
            return Ok(MuxerAddress::Unix(PathBuf::from(path)));
        }

        match value.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(MuxerAddress::Tcp(value.to_string()))
            }
            _ => Err(ProtocolError::Configuration(format!(
                "invalid multiplexer address {:?}",
                value
            ))),
        }
    }

    /// Standard daemon location for this platform
    pub fn platform_default() -> Self {
        if cfg!(unix) {
            MuxerAddress::Unix(PathBuf::from(DEFAULT_UNIX_SOCKET))
        } else {
            MuxerAddress::Tcp(DEFAULT_TCP_ADDRESS.to_string())
        }
    }

    /// Open a connection to this address
    pub async fn connect(&self) -> io::Result<BoxChannel> {
        match self {
            MuxerAddress::Tcp(address) => {
                let stream = TcpStream::connect(address.as_str()).await?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            #[cfg(unix)]
            MuxerAddress::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await?;
                Ok(Box::new(stream))
            }
            #[cfg(not(unix))]
            MuxerAddress::Unix(path) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("Unix sockets are unavailable ({})", path.display()),
            )),
        }
    }
}

impl fmt::Display for MuxerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxerAddress::Unix(path) => write!(f, "UNIX:{}", path.display()),
            MuxerAddress::Tcp(address) => f.write_str(address),
        }
    }
}

/// Strategy for reaching the multiplexer daemon
#[async_trait]
pub trait MuxerLocator: Send + Sync {
    /// Open a fresh channel to the daemon, `None` if it is not present
    async fn locate(&self) -> Result<Option<BoxChannel>>;
}

/// Environment / configuration / platform-default resolution
#[derive(Debug, Clone)]
pub struct DefaultLocator {
    address: MuxerAddress,
}

impl DefaultLocator {
    /// Always use `address`
    pub fn new(address: MuxerAddress) -> Self {
        Self { address }
    }

    /// Resolve the address from the environment and `config`
    pub fn from_config(config: &TransportConfig) -> Result<Self> {
        let address = config
            .muxer_address()?
            .unwrap_or_else(MuxerAddress::platform_default);
        debug!("Multiplexer daemon expected at {}", address);
        Ok(Self { address })
    }

    /// Address this locator connects to
    pub fn address(&self) -> &MuxerAddress {
        &self.address
    }
}

#[async_trait]
impl MuxerLocator for DefaultLocator {
    async fn locate(&self) -> Result<Option<BoxChannel>> {
        match self.address.connect().await {
            Ok(channel) => {
                info!("Connected to multiplexer daemon at {}", self.address);
                Ok(Some(channel))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                debug!("No multiplexer daemon at {}: {}", self.address, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            MuxerAddress::parse("UNIX:/var/run/usbmuxd").unwrap(),
            MuxerAddress::Unix(PathBuf::from("/var/run/usbmuxd"))
        );
        assert_eq!(
            MuxerAddress::parse(" 127.0.0.1:27015 ").unwrap(),
            MuxerAddress::Tcp("127.0.0.1:27015".to_string())
        );
        assert_eq!(
            MuxerAddress::parse("[::1]:27015").unwrap(),
            MuxerAddress::Tcp("[::1]:27015".to_string())
        );

        for bad in ["", "UNIX:", "localhost", ":27015", "host:port", "host:70000"] {
            assert!(
                matches!(
                    MuxerAddress::parse(bad),
                    Err(ProtocolError::Configuration(_))
                ),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_display_roundtrip() {
        for text in ["UNIX:/tmp/mux", "10.0.0.2:27015"] {
            assert_eq!(MuxerAddress::parse(text).unwrap().to_string(), text);
        }
    }

    #[tokio::test]
    async fn test_missing_daemon_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let address = if cfg!(unix) {
            MuxerAddress::Unix(dir.path().join("no-such-socket"))
        } else {
            MuxerAddress::Tcp("127.0.0.1:1".to_string())
        };
        let locator = DefaultLocator::new(address);
        assert!(locator.locate().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_tcp_daemon_is_found() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = MuxerAddress::Tcp(listener.local_addr().unwrap().to_string());
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let locator = DefaultLocator::new(address);
        assert!(locator.locate().await.unwrap().is_some());
        accept.await.unwrap();
    }
}
