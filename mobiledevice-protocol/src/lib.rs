//! Mobile Device Transport Implementation
//!
//! This library provides a pure Rust implementation of the host side of the
//! device multiplexer protocol and the session-management service, enabling
//! authenticated, optionally TLS-protected channels to services running on
//! attached mobile devices.
//!
//! ## Layers
//!
//! - [`codec`]: multiplexer and property-list frame encoding
//! - [`muxer`]: client for the host's multiplexer daemon
//! - [`plist_client`]: length-prefixed property-list client with TLS that
//!   can be switched on and off mid-stream
//! - [`pairing`]: pairing records, trust model and record stores
//! - [`lockdown`]: the device's session-management service
//! - [`service`]: "open service X on device Y" in one call
//! - [`scope`]: which device a unit of work refers to
//! - [`emulator`]: in-process daemon and device peer

pub mod codec;
pub mod config;
pub mod device;
pub mod emulator;
pub mod lockdown;
pub mod muxer;
pub mod pairing;
pub mod plist_client;
pub mod scope;
pub mod service;
pub mod transport;

mod error;
pub use config::TransportConfig;
pub use device::{ConnectionType, Device, DeviceRegistry};
pub use error::{MuxerResultCode, ProtocolError, Result};
pub use lockdown::{LockdownClient, ServiceDescriptor, SessionInfo, LOCKDOWN_PORT};
pub use muxer::{DeviceEvent, DeviceEvents, MuxerClient, MuxerConnector};
pub use pairing::{PairingRecord, PairingRecordStore};
pub use plist_client::PropertyListClient;
pub use scope::DeviceScope;
pub use service::ServiceConnector;
pub use transport::TlsState;

/// Version of the multiplexer frame protocol we implement
pub const PROTOCOL_VERSION: u32 = codec::MUXER_PLIST_VERSION;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_version() {
        assert_eq!(PROTOCOL_VERSION, 1);
    }
}
