//! Error handling for the device transport stack
//!
//! This module provides a single error type for every layer of the stack:
//! multiplexer framing, property-list framing, the TLS state machine,
//! pairing trust material and device selection.
//! Errors from underlying libraries are converted automatically using `thiserror`.
//!
//! ## Error Handling Patterns
//!
//! ### Error Matching
//!
//! Every failure is matchable; callers never have to parse messages:
//!
//! ```rust
//! use mobiledevice_protocol::{MuxerResultCode, ProtocolError};
//!
//! fn describe(error: &ProtocolError) -> &'static str {
//!     match error {
//!         ProtocolError::Muxer(MuxerResultCode::BadDevice) => "device went away",
//!         ProtocolError::Muxer(MuxerResultCode::ConnectionRefused) => "port closed",
//!         ProtocolError::AmbiguousDevice(_) => "pass a udid",
//!         ProtocolError::DeviceNotFound(_) => "unknown udid",
//!         e if e.is_channel_fatal() => "channel lost",
//!         _ => "other",
//!     }
//! }
//!
//! assert_eq!(describe(&ProtocolError::AmbiguousDevice(0)), "pass a udid");
//! ```
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! Socket and channel I/O failures. Fatal to the channel; never retried here.
//!
//! ### Framing Errors
//! `MalformedFrame`, `TruncatedFrame` and `FrameSizeExceeded`: the peer
//! violated the framing contract. Fatal to the channel.
//!
//! ### Negative Results
//! `Muxer` and `Service`: the peer answered with a well-formed refusal.
//! The channel stays usable.
//!
//! ### Caller Errors
//! `InvalidPairingRecord`, `AlreadyEncrypted`, `NotEncrypted`,
//! `AmbiguousDevice`, `DeviceNotFound`.

use std::fmt;
use thiserror::Error;

/// Result type for protocol operations
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Result code carried by a multiplexer `Result` message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuxerResultCode {
    /// Request succeeded
    Ok,
    /// The daemon did not understand the request
    BadCommand,
    /// The device id is unknown or the device detached
    BadDevice,
    /// The device refused the connection to the requested port
    ConnectionRefused,
    /// The daemon does not speak the requested protocol version
    BadVersion,
    /// Any other code, preserved verbatim
    Other(u64),
}

impl MuxerResultCode {
    /// Decode the numeric `Number` field of a `Result` message
    pub fn from_code(code: u64) -> Self {
        match code {
            0 => MuxerResultCode::Ok,
            1 => MuxerResultCode::BadCommand,
            2 => MuxerResultCode::BadDevice,
            3 => MuxerResultCode::ConnectionRefused,
            6 => MuxerResultCode::BadVersion,
            other => MuxerResultCode::Other(other),
        }
    }

    /// Numeric value as sent on the wire
    pub fn code(&self) -> u64 {
        match self {
            MuxerResultCode::Ok => 0,
            MuxerResultCode::BadCommand => 1,
            MuxerResultCode::BadDevice => 2,
            MuxerResultCode::ConnectionRefused => 3,
            MuxerResultCode::BadVersion => 6,
            MuxerResultCode::Other(code) => *code,
        }
    }

    /// Whether this code signals success
    pub fn is_ok(&self) -> bool {
        matches!(self, MuxerResultCode::Ok)
    }
}

impl fmt::Display for MuxerResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MuxerResultCode::Ok => write!(f, "ok"),
            MuxerResultCode::BadCommand => write!(f, "bad command"),
            MuxerResultCode::BadDevice => write!(f, "bad device"),
            MuxerResultCode::ConnectionRefused => write!(f, "connection refused"),
            MuxerResultCode::BadVersion => write!(f, "bad version"),
            MuxerResultCode::Other(code) => write!(f, "result code {}", code),
        }
    }
}

/// Errors that can occur during protocol operations
///
/// # Examples
///
/// ```rust
/// use mobiledevice_protocol::ProtocolError;
///
/// let error = ProtocolError::DeviceNotFound("00008030-001A".to_string());
/// assert_eq!(error.to_string(), "Device not found: 00008030-001A");
///
/// let error = ProtocolError::NotEncrypted;
/// assert_eq!(error.to_string(), "Channel is not encrypted");
/// ```
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Socket or channel I/O failure
    ///
    /// Automatically converted from `std::io::Error`. Fatal to the channel.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Frame header or payload violates the framing contract
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Channel or buffer ended in the middle of a frame
    #[error("Truncated frame: expected {expected} bytes, got {actual}")]
    TruncatedFrame {
        /// Bytes the frame required
        expected: usize,
        /// Bytes actually available
        actual: usize,
    },

    /// Frame length exceeds the configured maximum (DoS prevention)
    #[error("Frame size exceeded: {0} bytes (max: {1})")]
    FrameSizeExceeded(usize, usize),

    /// Multiplexer answered with a non-success result code
    #[error("Multiplexer returned {0}")]
    Muxer(MuxerResultCode),

    /// Device-side service answered with an `Error` key
    #[error("Service request {request} failed: {error}")]
    Service {
        /// Request that failed (e.g. `StartService`)
        request: String,
        /// Error string reported by the device (e.g. `InvalidService`)
        error: String,
    },

    /// Peer sent a well-formed message that does not fit the exchange
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Pairing record is missing or has inconsistent trust material
    #[error("Invalid pairing record: {0}")]
    InvalidPairingRecord(String),

    /// No pairing record stored for the device
    #[error("Pairing record not found: {0}")]
    PairingRecordNotFound(String),

    /// `enable_tls` called on an encrypted channel
    #[error("Channel is already encrypted")]
    AlreadyEncrypted,

    /// `disable_tls` called on a plaintext channel
    #[error("Channel is not encrypted")]
    NotEncrypted,

    /// Channel was closed by a previous failure, cancellation or disposal
    #[error("Channel is closed")]
    Closed,

    /// Operation was cancelled; the channel has been closed
    #[error("Operation cancelled")]
    Cancelled,

    /// No udid given and the number of attached devices is not exactly one
    #[error("Ambiguous device: {0} devices attached")]
    AmbiguousDevice(usize),

    /// No attached device matches the requested udid
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// The multiplexer daemon is not running on this host
    #[error("Multiplexer daemon is not available")]
    MuxerUnavailable,

    /// TLS handshake rejected (alert, certificate rejection)
    ///
    /// Automatically converted from `rustls::Error`.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Certificate processing error
    ///
    /// Automatically converted from `openssl::error::ErrorStack`.
    #[error("Certificate error: {0}")]
    Certificate(#[from] openssl::error::ErrorStack),

    /// Property list (de)serialization error
    ///
    /// Automatically converted from `plist::Error`.
    #[error("Property list error: {0}")]
    Plist(#[from] plist::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl ProtocolError {
    /// Check if this error leaves the channel unusable
    ///
    /// Clients move to their `Closed` state when an operation fails with a
    /// channel-fatal error. A rejected TLS handshake (`Tls`) is not fatal:
    /// the channel stays plaintext.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mobiledevice_protocol::{MuxerResultCode, ProtocolError};
    ///
    /// let error = ProtocolError::MalformedFrame("bad version".to_string());
    /// assert!(error.is_channel_fatal());
    ///
    /// let error = ProtocolError::Muxer(MuxerResultCode::BadDevice);
    /// assert!(!error.is_channel_fatal());
    /// ```
    pub fn is_channel_fatal(&self) -> bool {
        matches!(
            self,
            ProtocolError::Transport(_)
                | ProtocolError::MalformedFrame(_)
                | ProtocolError::TruncatedFrame { .. }
                | ProtocolError::FrameSizeExceeded(..)
                | ProtocolError::Plist(_)
                | ProtocolError::Closed
                | ProtocolError::Cancelled
        )
    }

    /// Check if this error requires user action
    ///
    /// Returns `true` when retrying cannot help: the device needs
    /// (re-)pairing or the caller must pick a device.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mobiledevice_protocol::ProtocolError;
    ///
    /// let error = ProtocolError::PairingRecordNotFound("abc".to_string());
    /// assert!(error.requires_user_action());
    ///
    /// let error = ProtocolError::Closed;
    /// assert!(!error.requires_user_action());
    /// ```
    pub fn requires_user_action(&self) -> bool {
        matches!(
            self,
            ProtocolError::InvalidPairingRecord(_)
                | ProtocolError::PairingRecordNotFound(_)
                | ProtocolError::AmbiguousDevice(_)
                | ProtocolError::DeviceNotFound(_)
                | ProtocolError::MuxerUnavailable
                | ProtocolError::Configuration(_)
        )
    }

    /// Build a `TruncatedFrame` from a short read
    pub(crate) fn truncated(expected: usize, actual: usize) -> Self {
        ProtocolError::TruncatedFrame { expected, actual }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ProtocolError::DeviceNotFound("test-device".to_string());
        assert_eq!(error.to_string(), "Device not found: test-device");

        let error = ProtocolError::AlreadyEncrypted;
        assert_eq!(error.to_string(), "Channel is already encrypted");

        let error = ProtocolError::Muxer(MuxerResultCode::ConnectionRefused);
        assert_eq!(error.to_string(), "Multiplexer returned connection refused");

        let error = ProtocolError::truncated(4, 2);
        assert_eq!(
            error.to_string(),
            "Truncated frame: expected 4 bytes, got 2"
        );
    }

    #[test]
    fn test_result_code_mapping() {
        for code in [0u64, 1, 2, 3, 6, 42] {
            assert_eq!(MuxerResultCode::from_code(code).code(), code);
        }
        assert_eq!(MuxerResultCode::from_code(2), MuxerResultCode::BadDevice);
        assert_eq!(MuxerResultCode::from_code(42), MuxerResultCode::Other(42));
        assert!(MuxerResultCode::Ok.is_ok());
        assert!(!MuxerResultCode::BadVersion.is_ok());
    }

    #[test]
    fn test_io_error_conversion() {
        use std::io::{Error, ErrorKind};

        let io_error = Error::new(ErrorKind::BrokenPipe, "pipe closed");
        let protocol_error: ProtocolError = io_error.into();

        assert!(matches!(protocol_error, ProtocolError::Transport(_)));
        assert!(protocol_error.is_channel_fatal());
    }
}
