//! Channels released on cancellation
//!
//! A [`ReleasableChannel`] owns its inner channel through a shared slot. A
//! watcher task empties the slot as soon as the cancellation token fires,
//! which drops the socket even while the owner sits idle. Later I/O on the
//! wrapper fails with `NotConnected`.

use super::{BoxChannel, Channel};
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::debug;

type Slot = Arc<Mutex<Option<BoxChannel>>>;

/// Channel dropped when its token is cancelled
pub struct ReleasableChannel {
    slot: Slot,
    // Stops the watcher when the wrapper itself goes away
    _watch: DropGuard,
}

impl ReleasableChannel {
    /// Wrap `channel`, releasing it once `token` is cancelled
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(channel: BoxChannel, token: &CancellationToken) -> Self {
        let watch = token.child_token();
        let slot: Slot = Arc::new(Mutex::new(Some(channel)));

        let weak = Arc::downgrade(&slot);
        let watched = watch.clone();
        tokio::spawn(async move {
            watched.cancelled().await;
            let released = match weak.upgrade() {
                Some(slot) => {
                    let channel = lock(&slot).take();
                    channel
                }
                None => None,
            };
            if released.is_some() {
                debug!("Released channel after cancellation");
            }
        });

        Self {
            slot,
            _watch: watch.drop_guard(),
        }
    }

    /// Whether the inner channel has been dropped
    pub fn is_released(&self) -> bool {
        lock(&self.slot).is_none()
    }

    fn poll_inner<T>(
        &self,
        op: impl FnOnce(Pin<&mut Box<dyn Channel>>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        let mut slot = lock(&self.slot);
        match slot.as_mut() {
            Some(channel) => op(Pin::new(channel)),
            None => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "channel released",
            ))),
        }
    }
}

fn lock(slot: &Slot) -> MutexGuard<'_, Option<BoxChannel>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AsyncRead for ReleasableChannel {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.poll_inner(|channel| channel.poll_read(cx, buf))
    }
}

impl AsyncWrite for ReleasableChannel {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_inner(|channel| channel.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_inner(|channel| channel.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.poll_inner(|channel| channel.poll_shutdown(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_passes_bytes_through() {
        let token = CancellationToken::new();
        let (a, mut b) = tokio::io::duplex(1024);
        let mut channel = ReleasableChannel::new(Box::new(a), &token);

        channel.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        assert!(!channel.is_released());
    }

    #[tokio::test]
    async fn test_cancel_drops_inner_channel() {
        let token = CancellationToken::new();
        let (a, mut b) = tokio::io::duplex(1024);
        let mut channel = ReleasableChannel::new(Box::new(a), &token);

        token.cancel();
        settle().await;
        assert!(channel.is_released());

        // The peer sees end-of-stream without the owner doing any I/O
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), b.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let err = channel.write_all(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_drop_stops_watcher() {
        let token = CancellationToken::new();
        let (a, _b) = tokio::io::duplex(1024);
        let channel = ReleasableChannel::new(Box::new(a), &token);
        drop(channel);
        assert!(!token.is_cancelled());
    }
}
