//! Property-List Protocol Client
//!
//! Frames and unframes property-list messages on one byte channel and owns
//! that channel's encryption state.
//!
//! ## Wire Format
//!
//! Each message is a 4-byte big-endian payload length followed by exactly
//! that many bytes of UTF-8 XML property list.
//!
//! ## States
//!
//! ```text
//! Plaintext --enable_tls--> Encrypted --disable_tls--> Plaintext
//!     \                         |
//!      +------- close ----------+----> Closed
//! ```
//!
//! Framing or transport failures, cancellation and timeouts close the
//! channel; any later operation fails with `Closed`.

use crate::codec::{self, PLIST_LENGTH_SIZE};
use crate::config::TransportConfig;
use crate::pairing::{trust, PairingRecord};
use crate::transport::{guarded, read_full, BoxChannel, Link, TlsState};
use crate::{ProtocolError, Result};
use plist::{Dictionary, Value};
use serde::Serialize;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default maximum payload size (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length-prefixed property-list client over one channel
#[derive(Debug)]
pub struct PropertyListClient {
    link: Link,
    max_frame_size: usize,
    io_timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    in_flight: bool,
}

impl PropertyListClient {
    /// Wrap a plaintext channel
    pub fn new(channel: BoxChannel) -> Self {
        Self {
            link: Link::new(channel),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            io_timeout: None,
            cancel: None,
            in_flight: false,
        }
    }

    /// Wrap a plaintext channel using limits from `config`
    pub fn with_config(channel: BoxChannel, config: &TransportConfig) -> Self {
        Self::new(channel)
            .with_max_frame_size(config.max_frame_size)
            .with_timeout(config.io_timeout())
    }

    /// Race every operation against `token`
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bound every operation by `limit`
    pub fn with_timeout(mut self, limit: Option<Duration>) -> Self {
        self.io_timeout = limit;
        self
    }

    /// Reject frames larger than `max` bytes
    pub fn with_max_frame_size(mut self, max: usize) -> Self {
        self.max_frame_size = max;
        self
    }

    /// Current encryption state
    ///
    /// A client whose cancellation token has fired is `Closed`.
    pub fn state(&self) -> TlsState {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return TlsState::Closed;
        }
        self.link.state()
    }

    /// Whether the channel is TLS-protected
    pub fn is_encrypted(&self) -> bool {
        self.state() == TlsState::Encrypted
    }

    /// Mark the start of a channel operation
    ///
    /// An operation that never finished (its future was dropped) may have
    /// left a partial frame behind, so the channel is closed.
    fn begin(&mut self) -> Result<()> {
        if self.in_flight {
            warn!("Previous operation was abandoned mid-frame, closing channel");
            self.in_flight = false;
            self.link.abort();
            return Err(ProtocolError::Closed);
        }
        if self.link.state() == TlsState::Closed {
            return Err(ProtocolError::Closed);
        }
        self.in_flight = true;
        Ok(())
    }

    fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        self.in_flight = false;
        if let Err(e) = &result {
            if e.is_channel_fatal() {
                debug!("Closing channel after fatal error: {}", e);
                self.link.abort();
            }
        }
        result
    }

    /// Serialize `message` as XML and send it as one frame
    pub async fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        let mut payload = Vec::new();
        plist::to_writer_xml(&mut payload, message)?;
        if payload.len() > self.max_frame_size {
            return Err(ProtocolError::FrameSizeExceeded(
                payload.len(),
                self.max_frame_size,
            ));
        }
        let frame = codec::encode_plist_frame(&payload)?;

        self.begin()?;
        let link = &mut self.link;
        let result = guarded(self.cancel.as_ref(), self.io_timeout, async {
            link.write_all(&frame).await?;
            link.flush().await?;
            Ok(())
        })
        .await;

        if result.is_ok() {
            debug!("Sent property list frame ({} bytes)", payload.len());
        }
        self.finish(result)
    }

    /// Read one message
    ///
    /// Returns `None` when the channel ends cleanly before any byte of the
    /// next length prefix; a channel ending anywhere inside a frame is
    /// `TruncatedFrame`.
    pub async fn read_message(&mut self) -> Result<Option<Value>> {
        self.begin()?;
        let max = self.max_frame_size;
        let link = &mut self.link;
        let result = guarded(self.cancel.as_ref(), self.io_timeout, async {
            let mut prefix = [0u8; PLIST_LENGTH_SIZE];
            let n = read_full(link, &mut prefix).await?;
            if n == 0 {
                return Ok(None);
            }
            let len = codec::decode_plist_frame_length(&prefix[..n])? as usize;
            if len > max {
                return Err(ProtocolError::FrameSizeExceeded(len, max));
            }

            let mut payload = vec![0u8; len];
            let got = read_full(link, &mut payload).await?;
            if got < len {
                return Err(ProtocolError::truncated(len, got));
            }

            let value: Value = plist::from_bytes(&payload).map_err(|e| {
                ProtocolError::MalformedFrame(format!("invalid property list payload: {}", e))
            })?;
            debug!("Received property list frame ({} bytes)", len);
            Ok(Some(value))
        })
        .await;

        self.finish(result)
    }

    /// Send `request` and read the dictionary that answers it
    ///
    /// A channel that ends instead of answering is closed and reported as
    /// `Closed`.
    pub async fn request(&mut self, request: &Dictionary) -> Result<Dictionary> {
        self.write_message(request).await?;
        match self.read_message().await? {
            Some(Value::Dictionary(response)) => Ok(response),
            Some(other) => Err(ProtocolError::UnexpectedResponse(format!(
                "expected a dictionary, got {:?}",
                other
            ))),
            None => {
                self.link.abort();
                Err(ProtocolError::Closed)
            }
        }
    }

    /// Upgrade to TLS as the client, authenticating with `record`
    ///
    /// Fails with `AlreadyEncrypted` while encrypted and with
    /// `InvalidPairingRecord` before touching the channel if the record
    /// cannot authenticate. A handshake the peer rejects leaves the channel
    /// plaintext.
    pub async fn enable_tls(&mut self, record: &PairingRecord) -> Result<()> {
        self.ensure_plaintext()?;
        let config = trust::client_config(record)?;
        let server_name = trust::server_name()?;

        self.begin()?;
        let link = &mut self.link;
        let result = guarded(
            self.cancel.as_ref(),
            self.io_timeout,
            link.upgrade_client(config, server_name),
        )
        .await;
        self.finish(result)
    }

    /// Upgrade to TLS as the server, the device side of `enable_tls`
    pub async fn accept_tls(&mut self, record: &PairingRecord) -> Result<()> {
        self.ensure_plaintext()?;
        let config = trust::server_config(record)?;

        self.begin()?;
        let link = &mut self.link;
        let result = guarded(
            self.cancel.as_ref(),
            self.io_timeout,
            link.upgrade_server(config),
        )
        .await;
        self.finish(result)
    }

    /// Shut TLS down and resume plaintext at the correct stream offset
    pub async fn disable_tls(&mut self) -> Result<()> {
        match self.link.state() {
            TlsState::Plaintext => return Err(ProtocolError::NotEncrypted),
            TlsState::Closed => return Err(ProtocolError::Closed),
            TlsState::Encrypted => {}
        }

        self.begin()?;
        let link = &mut self.link;
        let result = guarded(self.cancel.as_ref(), self.io_timeout, link.downgrade()).await;
        self.finish(result)
    }

    fn ensure_plaintext(&self) -> Result<()> {
        match self.link.state() {
            TlsState::Plaintext => Ok(()),
            TlsState::Encrypted => Err(ProtocolError::AlreadyEncrypted),
            TlsState::Closed => Err(ProtocolError::Closed),
        }
    }

    /// Close the channel; later operations fail with `Closed`
    pub async fn close(&mut self) {
        self.in_flight = false;
        self.link.close().await;
    }
}
