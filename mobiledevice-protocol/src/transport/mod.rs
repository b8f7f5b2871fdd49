//! Byte Channel Transport
//!
//! Everything above the multiplexer talks to an opaque bidirectional byte
//! channel. A channel starts life as a multiplexer socket, is handed over
//! to a service after `Connect`, and may have TLS switched on and off on top
//! of it by [`Link`].

pub mod record;
pub mod release;
pub mod secure;

pub use record::RecordBoundary;
pub use release::ReleasableChannel;
pub use secure::{Link, TlsState};

use crate::{ProtocolError, Result};
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// An owned bidirectional byte stream
pub trait Channel: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Channel for T {}

/// Type-erased channel
pub type BoxChannel = Box<dyn Channel>;

/// Run one channel operation under an optional timeout and cancellation token
///
/// Expiry surfaces as a `TimedOut` transport error, cancellation as
/// `Cancelled`. Both are channel-fatal; the caller closes the channel.
pub(crate) async fn guarded<T, F>(
    cancel: Option<&CancellationToken>,
    limit: Option<Duration>,
    operation: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let bounded = async {
        match limit {
            Some(limit) => timeout(limit, operation).await.map_err(|_| {
                ProtocolError::Transport(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "channel operation timed out",
                ))
            })?,
            None => operation.await,
        }
    };

    match cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(ProtocolError::Cancelled),
            result = bounded => result,
        },
        None => bounded.await,
    }
}

/// Fill `buf` completely unless the reader reaches end-of-stream first
///
/// Returns the number of bytes read; anything short of `buf.len()` means
/// the stream ended.
pub(crate) async fn read_full<R: AsyncRead + Unpin + ?Sized>(
    reader: &mut R,
    buf: &mut [u8],
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_read_full_reports_short_reads() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"abc").await.unwrap();
        drop(a);

        let mut buf = [0u8; 4];
        assert_eq!(read_full(&mut b, &mut buf).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(read_full(&mut b, &mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_guarded_cancellation_and_timeout() {
        let token = CancellationToken::new();
        token.cancel();
        let result: Result<()> = guarded(Some(&token), None, std::future::pending()).await;
        assert!(matches!(result, Err(ProtocolError::Cancelled)));

        let result: Result<()> = guarded(
            None,
            Some(Duration::from_millis(10)),
            std::future::pending(),
        )
        .await;
        assert!(matches!(
            result,
            Err(ProtocolError::Transport(e)) if e.kind() == io::ErrorKind::TimedOut
        ));

        let result = guarded(None, None, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_boxed_duplex_is_a_channel() {
        let (a, _b) = tokio::io::duplex(64);
        let channel: BoxChannel = Box::new(a);
        let _again: BoxChannel = Box::new(channel);
    }
}
