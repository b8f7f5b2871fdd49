//! Multiplexer Daemon Protocol
//!
//! The host-side multiplexer daemon owns the physical links to devices and
//! exposes them through a framed property-list protocol:
//!
//! - [`locator`]: where the daemon listens and how to reach it
//! - [`message`]: request and response bodies
//! - [`client`]: request/response client, `Connect` hand-over, `Listen`
//! - [`events`]: attach/detach notification stream

pub mod client;
pub mod events;
pub mod locator;
pub mod message;

pub use client::{ConnectOutcome, LocatorConnector, MuxerClient, MuxerConnector};
pub use events::{DeviceEvent, DeviceEvents};
pub use locator::{DefaultLocator, MuxerAddress, MuxerLocator};
pub use message::{MuxerRequest, MuxerResponse};
