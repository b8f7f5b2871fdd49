//! TLS Record Boundary Reader
//!
//! A TLS library reads ahead from its transport in large chunks. When TLS is
//! switched off mid-connection, any plaintext the peer sent right after its
//! `close_notify` would be swallowed by that read-ahead. [`RecordBoundary`]
//! parses the 5-byte TLS record headers as they pass through and never
//! returns bytes beyond the end of the current record, so the TLS layer can
//! only ever consume whole records.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tracing::warn;

/// TLS record header: content type, legacy version, length
const RECORD_HEADER_SIZE: usize = 5;

/// Pass-through reader that stops at TLS record boundaries
#[derive(Debug)]
pub struct RecordBoundary<S> {
    inner: S,
    header: [u8; RECORD_HEADER_SIZE],
    header_filled: usize,
    body_remaining: usize,
    scratch: Vec<u8>,
}

impl<S> RecordBoundary<S> {
    /// Wrap `inner`, which must be positioned at a record boundary
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            header: [0; RECORD_HEADER_SIZE],
            header_filled: 0,
            body_remaining: 0,
            scratch: Vec::new(),
        }
    }

    /// Whether every record seen so far has been passed through completely
    pub fn is_at_boundary(&self) -> bool {
        self.header_filled == 0 && self.body_remaining == 0
    }

    /// Unwrap the underlying stream
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Bytes that may be read before the next boundary
    fn readable_now(&self) -> usize {
        if self.header_filled < RECORD_HEADER_SIZE {
            RECORD_HEADER_SIZE - self.header_filled
        } else {
            self.body_remaining
        }
    }

    fn consume(&mut self, bytes: &[u8]) {
        let mut bytes = bytes;
        while !bytes.is_empty() {
            if self.header_filled < RECORD_HEADER_SIZE {
                let take = bytes.len().min(RECORD_HEADER_SIZE - self.header_filled);
                self.header[self.header_filled..self.header_filled + take]
                    .copy_from_slice(&bytes[..take]);
                self.header_filled += take;
                bytes = &bytes[take..];

                if self.header_filled == RECORD_HEADER_SIZE {
                    self.body_remaining =
                        u16::from_be_bytes([self.header[3], self.header[4]]) as usize;
                    if self.body_remaining == 0 {
                        self.header_filled = 0;
                    }
                }
            } else {
                let take = bytes.len().min(self.body_remaining);
                self.body_remaining -= take;
                bytes = &bytes[take..];
                if self.body_remaining == 0 {
                    self.header_filled = 0;
                }
            }
        }
    }
}

impl<S: AsyncRead + Unpin> RecordBoundary<S> {
    /// Read and drop the rest of a partially consumed record
    pub async fn discard_partial_record(&mut self) -> io::Result<usize> {
        let mut discarded = 0;
        let mut buf = [0u8; 512];
        while !self.is_at_boundary() {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed inside a TLS record",
                ));
            }
            discarded += n;
        }
        if discarded > 0 {
            warn!("Discarded {} bytes of an unfinished TLS record", discarded);
        }
        Ok(discarded)
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RecordBoundary<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let limit = this.readable_now().min(buf.remaining());
        if limit == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut scratch = std::mem::take(&mut this.scratch);
        if scratch.len() < limit {
            scratch.resize(limit, 0);
        }
        let mut chunk = ReadBuf::new(&mut scratch[..limit]);
        let polled = Pin::new(&mut this.inner).poll_read(cx, &mut chunk);
        if let Poll::Ready(Ok(())) = polled {
            let n = chunk.filled().len();
            buf.put_slice(&scratch[..n]);
            this.consume(&scratch[..n]);
        }
        this.scratch = scratch;
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RecordBoundary<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn record(body: &[u8]) -> Vec<u8> {
        let mut bytes = vec![0x17, 0x03, 0x03];
        bytes.extend_from_slice(&(body.len() as u16).to_be_bytes());
        bytes.extend_from_slice(body);
        bytes
    }

    #[tokio::test]
    async fn test_reads_stop_at_record_end() {
        let (mut peer, local) = tokio::io::duplex(1024);
        let mut stream = record(b"hello");
        stream.extend_from_slice(b"PLAINTEXT");
        peer.write_all(&stream).await.unwrap();

        let mut reader = RecordBoundary::new(local);
        let mut buf = [0u8; 256];
        let mut seen = Vec::new();
        while !(seen.len() == 10 && reader.is_at_boundary()) {
            let n = reader.read(&mut buf).await.unwrap();
            assert!(n > 0);
            seen.extend_from_slice(&buf[..n]);
        }
        assert_eq!(seen, record(b"hello"));

        let mut rest = reader.into_inner();
        let mut plain = [0u8; 9];
        rest.read_exact(&mut plain).await.unwrap();
        assert_eq!(&plain, b"PLAINTEXT");
    }

    #[tokio::test]
    async fn test_discard_partial_record() {
        let (mut peer, local) = tokio::io::duplex(1024);
        let mut stream = record(&[7u8; 40]);
        stream.extend_from_slice(b"next");
        peer.write_all(&stream).await.unwrap();

        let mut reader = RecordBoundary::new(local);
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf).await.unwrap();
        assert!(!reader.is_at_boundary());

        assert_eq!(reader.discard_partial_record().await.unwrap(), 37);
        assert!(reader.is_at_boundary());

        let mut rest = [0u8; 4];
        reader.into_inner().read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"next");
    }

    #[tokio::test]
    async fn test_eof_inside_record() {
        let (mut peer, local) = tokio::io::duplex(1024);
        peer.write_all(&record(b"abcdef")[..7]).await.unwrap();
        drop(peer);

        let mut reader = RecordBoundary::new(local);
        let mut buf = [0u8; 7];
        reader.read_exact(&mut buf).await.unwrap();
        let error = reader.discard_partial_record().await.unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_empty_record_body() {
        let mut reader = RecordBoundary::new(());
        reader.consume(&[0x15, 0x03, 0x03, 0x00, 0x00]);
        assert!(reader.is_at_boundary());
        reader.consume(&[0x15, 0x03]);
        assert!(!reader.is_at_boundary());
    }
}
