//! Bounded buffered output stream.
//!
//! [`BufferedOutputStream`] gives a writer a *write capacity*: the free room
//! in its buffer. [`write`] never blocks and may accept fewer bytes than
//! offered; buffered bytes reach the underlying writer whenever the stream
//! is drained, flushed or polled for capacity.
//!
//! [`write`]: BufferedOutputStream::write

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::AsyncWrite;

use crate::error::StreamError;

/// Default size of the output buffer.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// Write-side decorator with a bounded buffer.
#[derive(Debug)]
pub struct BufferedOutputStream<W> {
    inner: W,
    buffer: BytesMut,
    capacity: usize,
    closed: bool,
}

impl<W> BufferedOutputStream<W> {
    pub fn new(inner: W) -> Self {
        Self::with_capacity(inner, DEFAULT_WRITE_BUFFER_SIZE)
    }

    /// Wrap `inner` with a buffer of `capacity` bytes (at least one).
    pub fn with_capacity(inner: W, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner,
            buffer: BytesMut::with_capacity(capacity),
            capacity,
            closed: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes accepted but not yet handed to the underlying writer.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// How many bytes [`write`](Self::write) would accept right now.
    pub fn write_capacity(&self) -> usize {
        if self.closed {
            0
        } else {
            self.capacity - self.buffer.len()
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Buffer as much of `data` as fits and return how much was taken.
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = self.write_capacity().min(data.len());
        if n > 0 {
            self.buffer.put_slice(&data[..n]);
        }
        n
    }
}

impl<W: AsyncWrite + Unpin> BufferedOutputStream<W> {
    /// Hand buffered bytes to the underlying writer until the buffer is empty
    /// or the writer stops accepting.
    pub fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while !self.buffer.is_empty() {
            match Pin::new(&mut self.inner).poll_write(cx, &self.buffer) {
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "underlying writer accepted zero bytes",
                    )));
                }
                Poll::Ready(Ok(n)) => self.buffer.advance(n),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Resolve once the stream has write capacity, draining meanwhile.
    pub fn poll_write_capacity(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        if self.closed {
            return Poll::Ready(Err(StreamError::Closed.into()));
        }

        if let Poll::Ready(Err(e)) = self.poll_drain(cx) {
            return Poll::Ready(Err(e));
        }

        match self.write_capacity() {
            0 => Poll::Pending,
            n => Poll::Ready(Ok(n)),
        }
    }

    /// Wait until write capacity is available.
    pub async fn write_capacity_available(&mut self) -> io::Result<usize> {
        poll_fn(|cx| self.poll_write_capacity(cx)).await
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for BufferedOutputStream<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }
        ready!(this.poll_write_capacity(cx))?;
        Poll::Ready(Ok(this.write(data)))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_drain(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.closed {
            ready!(this.poll_drain(cx))?;
            ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
            this.closed = true;
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
