//! Switchable TLS Link
//!
//! [`Link`] owns one byte channel and exposes a single read/write surface
//! whether the channel is currently plaintext or TLS-protected. TLS can be
//! turned on (as client or as server) and back off again on the same
//! socket.
//!
//! ## Downgrade
//!
//! Turning TLS off is a symmetric exchange: each side sends `close_notify`,
//! then reads and discards until the peer's `close_notify` arrives. The TLS
//! session only ever sees whole records (see [`RecordBoundary`]), so once the
//! session is dropped the raw channel is positioned exactly at the first
//! plaintext byte the peer sent after its `close_notify`.

use super::{BoxChannel, RecordBoundary};
use crate::{ProtocolError, Result};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ServerConfig};
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

/// Observable encryption state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    /// Raw channel
    Plaintext,
    /// TLS session active
    Encrypted,
    /// Channel released
    Closed,
}

type Protected = RecordBoundary<BoxChannel>;

/// A channel that is plaintext, TLS-protected, or gone
pub enum Link {
    /// Raw channel
    Plaintext(BoxChannel),
    /// TLS session where this side is the client
    Client(Box<client::TlsStream<Protected>>),
    /// TLS session where this side is the server
    Server(Box<server::TlsStream<Protected>>),
    /// Channel released; every operation fails
    Closed,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Link::Plaintext(_) => f.write_str("Link::Plaintext"),
            Link::Client(_) => f.write_str("Link::Client"),
            Link::Server(_) => f.write_str("Link::Server"),
            Link::Closed => f.write_str("Link::Closed"),
        }
    }
}

/// Extract the TLS-level failure wrapped in an I/O error, if any
fn tls_failure(error: &io::Error) -> Option<rustls::Error> {
    error
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
        .cloned()
}

/// Send `close_notify`, then discard incoming data until the peer's arrives
async fn exchange_close_notify<S>(stream: &mut S) -> io::Result<usize>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.flush().await?;

    let mut discarded = 0;
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Ok(discarded);
        }
        discarded += n;
    }
}

/// Recover the raw channel once the TLS session is finished with it
async fn release(mut protected: Protected) -> io::Result<BoxChannel> {
    protected.discard_partial_record().await?;
    Ok(protected.into_inner())
}

impl Link {
    /// Wrap a raw channel
    pub fn new(channel: BoxChannel) -> Self {
        Link::Plaintext(channel)
    }

    /// Current encryption state
    pub fn state(&self) -> TlsState {
        match self {
            Link::Plaintext(_) => TlsState::Plaintext,
            Link::Client(_) | Link::Server(_) => TlsState::Encrypted,
            Link::Closed => TlsState::Closed,
        }
    }

    /// Take the raw channel out of a plaintext link
    ///
    /// Leaves the link `Closed` while the handshake is in flight, so an
    /// abandoned upgrade is never mistaken for a usable channel.
    fn take_plaintext(&mut self) -> Result<BoxChannel> {
        match mem::replace(self, Link::Closed) {
            Link::Plaintext(channel) => Ok(channel),
            Link::Closed => Err(ProtocolError::Closed),
            encrypted => {
                *self = encrypted;
                Err(ProtocolError::AlreadyEncrypted)
            }
        }
    }

    /// Settle a failed handshake
    ///
    /// A rejected handshake leaves the link plaintext; any other failure
    /// leaves it closed.
    fn handshake_failed(&mut self, error: io::Error, io: Protected) -> ProtocolError {
        match tls_failure(&error) {
            Some(tls) if io.is_at_boundary() => {
                warn!("TLS handshake rejected: {}", tls);
                *self = Link::Plaintext(io.into_inner());
                ProtocolError::Tls(tls)
            }
            _ => {
                warn!("TLS handshake failed, closing channel: {}", error);
                ProtocolError::Transport(error)
            }
        }
    }

    /// Perform a TLS client handshake on the current channel
    pub async fn upgrade_client(
        &mut self,
        config: Arc<ClientConfig>,
        server_name: ServerName<'static>,
    ) -> Result<()> {
        let channel = self.take_plaintext()?;
        debug!("Starting TLS client handshake");

        let connector = TlsConnector::from(config);
        match connector
            .connect(server_name, RecordBoundary::new(channel))
            .into_fallible()
            .await
        {
            Ok(stream) => {
                info!("Channel upgraded to TLS (client)");
                *self = Link::Client(Box::new(stream));
                Ok(())
            }
            Err((error, io)) => Err(self.handshake_failed(error, io)),
        }
    }

    /// Perform a TLS server handshake on the current channel
    pub async fn upgrade_server(&mut self, config: Arc<ServerConfig>) -> Result<()> {
        let channel = self.take_plaintext()?;
        debug!("Starting TLS server handshake");

        let acceptor = TlsAcceptor::from(config);
        match acceptor
            .accept(RecordBoundary::new(channel))
            .into_fallible()
            .await
        {
            Ok(stream) => {
                info!("Channel upgraded to TLS (server)");
                *self = Link::Server(Box::new(stream));
                Ok(())
            }
            Err((error, io)) => Err(self.handshake_failed(error, io)),
        }
    }

    /// End the TLS session and resume plaintext on the same channel
    ///
    /// Any failure here is an I/O failure and leaves the link closed.
    pub async fn downgrade(&mut self) -> Result<()> {
        let protected = match mem::replace(self, Link::Closed) {
            Link::Client(mut stream) => {
                stream.get_mut().1.send_close_notify();
                let discarded = exchange_close_notify(&mut *stream).await?;
                if discarded > 0 {
                    warn!("Discarded {} bytes received during TLS shutdown", discarded);
                }
                (*stream).into_inner().0
            }
            Link::Server(mut stream) => {
                stream.get_mut().1.send_close_notify();
                let discarded = exchange_close_notify(&mut *stream).await?;
                if discarded > 0 {
                    warn!("Discarded {} bytes received during TLS shutdown", discarded);
                }
                (*stream).into_inner().0
            }
            Link::Plaintext(channel) => {
                *self = Link::Plaintext(channel);
                return Err(ProtocolError::NotEncrypted);
            }
            Link::Closed => return Err(ProtocolError::Closed),
        };

        *self = Link::Plaintext(release(protected).await?);
        info!("Channel downgraded to plaintext");
        Ok(())
    }

    /// Release the channel, attempting an orderly shutdown first
    pub async fn close(&mut self) {
        let mut link = mem::replace(self, Link::Closed);
        if let Err(e) = link.shutdown().await {
            debug!("Error while closing channel: {}", e);
        }
    }

    /// Release the channel immediately
    pub fn abort(&mut self) {
        *self = Link::Closed;
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "channel is closed")
}

impl AsyncRead for Link {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Link::Plaintext(channel) => Pin::new(channel).poll_read(cx, buf),
            Link::Client(stream) => Pin::new(stream).poll_read(cx, buf),
            Link::Server(stream) => Pin::new(stream).poll_read(cx, buf),
            Link::Closed => Poll::Ready(Err(closed_error())),
        }
    }
}

impl AsyncWrite for Link {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Link::Plaintext(channel) => Pin::new(channel).poll_write(cx, buf),
            Link::Client(stream) => Pin::new(stream).poll_write(cx, buf),
            Link::Server(stream) => Pin::new(stream).poll_write(cx, buf),
            Link::Closed => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Link::Plaintext(channel) => Pin::new(channel).poll_flush(cx),
            Link::Client(stream) => Pin::new(stream).poll_flush(cx),
            Link::Server(stream) => Pin::new(stream).poll_flush(cx),
            Link::Closed => Poll::Ready(Err(closed_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Link::Plaintext(channel) => Pin::new(channel).poll_shutdown(cx),
            Link::Client(stream) => Pin::new(stream).poll_shutdown(cx),
            Link::Server(stream) => Pin::new(stream).poll_shutdown(cx),
            Link::Closed => Poll::Ready(Ok(())),
        }
    }
}
