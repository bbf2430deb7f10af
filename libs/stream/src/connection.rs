//! Proxied connection: a byte stream split into buffered halves.
//!
//! A [`Connection`] owns any `AsyncRead + AsyncWrite` stream (TCP socket,
//! in-memory pipe, ...) and exposes it as:
//! - [`ConnReader`]: buffered input with unread, freeze/thaw and a close lock
//! - [`ConnWriter`]: buffered output with a write capacity and async flush/close
//!
//! The halves can be moved independently, which is how a bridged pair wires
//! client-read to backend-write and backend-read to client-write.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tracing::trace;

use crate::error::StreamError;
use crate::input::{BufferedInputStream, DEFAULT_READ_BUFFER_SIZE};
use crate::output::{BufferedOutputStream, DEFAULT_WRITE_BUFFER_SIZE};

/// Any byte stream a connection can wrap.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Stream for T {}

/// Type-erased byte stream.
pub type BoxedStream = Box<dyn Stream>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection identifier (for logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Buffer sizes for both halves of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamBuffers {
    /// Maximum number of unread bytes on the input side.
    pub read_capacity: usize,
    /// Output buffer size, i.e. the maximum write capacity.
    pub write_capacity: usize,
}

impl Default for StreamBuffers {
    fn default() -> Self {
        Self {
            read_capacity: DEFAULT_READ_BUFFER_SIZE,
            write_capacity: DEFAULT_WRITE_BUFFER_SIZE,
        }
    }
}

/// A byte stream wrapped in buffered read and write halves.
pub struct Connection {
    id: ConnectionId,
    reader: ConnReader,
    writer: ConnWriter,
}

impl Connection {
    pub fn new(stream: BoxedStream, buffers: StreamBuffers) -> Self {
        let id = ConnectionId::next();
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            id,
            reader: ConnReader {
                id,
                input: BufferedInputStream::with_capacity(read_half, buffers.read_capacity),
                close_locks: 0,
                close_requested: false,
            },
            writer: ConnWriter {
                id,
                output: BufferedOutputStream::with_capacity(write_half, buffers.write_capacity),
            },
        }
    }

    /// Wrap a concrete stream.
    pub fn from_stream<S: Stream>(stream: S, buffers: StreamBuffers) -> Self {
        Self::new(Box::new(stream), buffers)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn reader(&mut self) -> &mut ConnReader {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut ConnWriter {
        &mut self.writer
    }

    pub fn into_split(self) -> (ConnReader, ConnWriter) {
        (self.reader, self.writer)
    }

    /// Put back together the halves of one connection.
    ///
    /// Halves of different connections are returned unchanged.
    pub fn reunite(reader: ConnReader, writer: ConnWriter) -> Result<Self, (ConnReader, ConnWriter)> {
        if reader.id != writer.id {
            return Err((reader, writer));
        }
        Ok(Self {
            id: reader.id,
            reader,
            writer,
        })
    }

    /// Flush pending output, then close both directions.
    pub async fn close(mut self) -> io::Result<()> {
        self.reader.close();
        self.writer.close().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("reader", &self.reader)
            .field("writer", &self.writer)
            .finish()
    }
}

/// Read half of a [`Connection`].
pub struct ConnReader {
    id: ConnectionId,
    input: BufferedInputStream<ReadHalf<BoxedStream>>,
    close_locks: usize,
    close_requested: bool,
}

impl ConnReader {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Push bytes back in front of the input.
    pub fn unread(&mut self, data: &[u8]) -> Result<(), StreamError> {
        self.input.unread(data)
    }

    pub fn pending_len(&self) -> usize {
        self.input.pending_len()
    }

    pub fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        self.input.try_read(buf)
    }

    pub fn freeze(&mut self) {
        self.input.freeze();
    }

    pub fn thaw(&mut self) {
        self.input.thaw();
    }

    pub fn is_frozen(&self) -> bool {
        self.input.is_frozen()
    }

    /// Defer any [`close`](Self::close) until the matching unlock.
    pub fn lock_close(&mut self) {
        self.close_locks += 1;
    }

    /// Release one close lock; applies a deferred close on the last one.
    pub fn unlock_close(&mut self) {
        self.close_locks = self.close_locks.saturating_sub(1);
        if self.close_locks == 0 && self.close_requested {
            trace!(conn = %self.id, "Applying deferred close");
            self.input.close();
        }
    }

    pub fn is_close_locked(&self) -> bool {
        self.close_locks > 0
    }

    /// Close the input side. Returns `false` if the close was deferred by a
    /// close lock.
    pub fn close(&mut self) -> bool {
        self.close_requested = true;
        if self.close_locks > 0 {
            trace!(conn = %self.id, locks = self.close_locks, "Close deferred");
            return false;
        }
        self.input.close();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.input.is_closed()
    }
}

impl AsyncRead for ConnReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().input).poll_read(cx, buf)
    }
}

impl fmt::Debug for ConnReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnReader")
            .field("id", &self.id)
            .field("pending", &self.input.pending_len())
            .field("frozen", &self.input.is_frozen())
            .field("close_locks", &self.close_locks)
            .finish_non_exhaustive()
    }
}

/// Write half of a [`Connection`].
pub struct ConnWriter {
    id: ConnectionId,
    output: BufferedOutputStream<WriteHalf<BoxedStream>>,
}

impl ConnWriter {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Buffer as much of `data` as the write capacity allows.
    pub fn write(&mut self, data: &[u8]) -> usize {
        self.output.write(data)
    }

    pub fn write_capacity(&self) -> usize {
        self.output.write_capacity()
    }

    pub fn buffered_len(&self) -> usize {
        self.output.buffered_len()
    }

    pub fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.output.poll_drain(cx)
    }

    /// The "write capacity available" signal.
    pub fn poll_write_capacity(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        self.output.poll_write_capacity(cx)
    }

    pub async fn write_capacity_available(&mut self) -> io::Result<usize> {
        self.output.write_capacity_available().await
    }

    /// Write every buffered byte to the underlying stream.
    pub async fn flush(&mut self) -> io::Result<()> {
        self.output.flush().await
    }

    /// Flush, then shut the write direction down.
    pub async fn close(&mut self) -> io::Result<()> {
        self.output.shutdown().await
    }

    pub fn is_closed(&self) -> bool {
        self.output.is_closed()
    }
}

impl AsyncWrite for ConnWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().output).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().output).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().output).poll_shutdown(cx)
    }
}

impl fmt::Debug for ConnWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnWriter")
            .field("id", &self.id)
            .field("buffered", &self.output.buffered_len())
            .field("write_capacity", &self.output.write_capacity())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn small_buffers() -> StreamBuffers {
        StreamBuffers {
            read_capacity: 16,
            write_capacity: 8,
        }
    }

    #[tokio::test]
    async fn test_connection_roundtrip() {
        let (local, mut remote) = tokio::io::duplex(64);
        let conn = Connection::from_stream(local, small_buffers());
        let (mut reader, mut writer) = conn.into_split();

        assert_eq!(writer.write(b"ping"), 4);
        writer.flush().await.unwrap();

        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_write_capacity_bounded_by_buffer() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut conn = Connection::from_stream(local, small_buffers());

        assert_eq!(conn.writer().write_capacity(), 8);
        assert_eq!(conn.writer().write(b"0123456789"), 8);
        assert_eq!(conn.writer().write_capacity(), 0);

        assert_eq!(conn.writer().write_capacity_available().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_close_lock_defers_close() {
        let (local, _remote) = tokio::io::duplex(64);
        let mut conn = Connection::from_stream(local, small_buffers());
        let reader = conn.reader();

        reader.lock_close();
        reader.lock_close();
        assert!(!reader.close());
        assert!(!reader.is_closed());

        reader.unlock_close();
        assert!(!reader.is_closed());

        reader.unlock_close();
        assert!(reader.is_closed());
        assert!(!reader.is_close_locked());
    }

    #[tokio::test]
    async fn test_unlock_without_close_request_keeps_stream_open() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = Connection::from_stream(local, small_buffers());

        conn.reader().lock_close();
        conn.reader().unlock_close();
        assert!(!conn.reader().is_closed());

        remote.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        conn.reader().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn test_close_shuts_down_peer_view() {
        let (local, mut remote) = tokio::io::duplex(64);
        let mut conn = Connection::from_stream(local, small_buffers());
        conn.writer().write(b"last");
        conn.close().await.unwrap();

        let mut out = Vec::new();
        remote.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"last");
    }

    #[tokio::test]
    async fn test_reunite_keeps_unread_bytes() {
        let (local, mut remote) = tokio::io::duplex(64);
        let conn = Connection::from_stream(local, small_buffers());
        let id = conn.id();
        let (mut reader, writer) = conn.into_split();
        reader.unread(b"again").unwrap();

        let mut conn = Connection::reunite(reader, writer).unwrap();
        assert_eq!(conn.id(), id);

        remote.write_all(b"!").await.unwrap();
        let mut buf = [0u8; 6];
        conn.reader().read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"again!");
    }

    #[tokio::test]
    async fn test_reunite_rejects_foreign_halves() {
        let (a, _a_remote) = tokio::io::duplex(64);
        let (b, _b_remote) = tokio::io::duplex(64);
        let (a_reader, _a_writer) = Connection::from_stream(a, small_buffers()).into_split();
        let (_b_reader, b_writer) = Connection::from_stream(b, small_buffers()).into_split();

        let (reader, writer) = Connection::reunite(a_reader, b_writer).unwrap_err();
        assert_ne!(reader.id(), writer.id());
    }

    #[test]
    fn test_connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert_ne!(a, b);
        assert!(a.to_string().starts_with("conn-"));
    }
}
