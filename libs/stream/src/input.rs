//! Pushback-capable buffered input stream.
//!
//! [`BufferedInputStream`] wraps any `AsyncRead` and adds:
//! - an *unread* area whose bytes are served before the underlying source,
//!   so a consumer can hand back bytes it read but could not use
//! - *freeze/thaw*, which suspends reads without closing the stream
//! - *close*, which fails an outstanding read with [`StreamError::Closed`]
//!   instead of leaving it pending forever
//!
//! Every read path takes `&mut self`, so at most one read can be outstanding
//! at any time.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use bytes::{BufMut, BytesMut};
use futures_util::task::noop_waker_ref;
use tokio::io::{AsyncRead, ReadBuf};
use tracing::trace;

use crate::error::StreamError;

/// Default capacity of the unread area.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Read-side decorator with unread, freeze/thaw and close.
#[derive(Debug)]
pub struct BufferedInputStream<R> {
    inner: R,
    /// Bytes logically prepended to whatever `inner` yields next.
    pending: BytesMut,
    capacity: usize,
    frozen: bool,
    closed: bool,
    /// Waker of the outstanding read, if it returned `Pending`.
    read_waker: Option<Waker>,
    /// Source failure held back until the unread bytes ahead of it are served.
    pending_error: Option<io::Error>,
}

impl<R> BufferedInputStream<R> {
    /// Wrap `inner` with the default unread capacity.
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_READ_BUFFER_SIZE)
    }

    /// Wrap `inner`, allowing at most `capacity` unread bytes.
    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            pending: BytesMut::new(),
            capacity,
            frozen: false,
            closed: false,
            read_waker: None,
            pending_error: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of unread bytes waiting to be served.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Push `data` back in front of the stream.
    ///
    /// Fails with [`StreamError::BufferFull`] without touching the buffer if
    /// the result would exceed the capacity. A successful unread thaws the
    /// stream and reschedules any outstanding read.
    pub fn unread(&mut self, data: &[u8]) -> Result<(), StreamError> {
        if data.is_empty() {
            return Ok(());
        }
        if self.closed {
            return Err(StreamError::Closed);
        }

        let available = self.capacity.saturating_sub(self.pending.len());
        if data.len() > available {
            return Err(StreamError::BufferFull {
                requested: data.len(),
                available,
            });
        }

        let mut merged = BytesMut::with_capacity(data.len() + self.pending.len());
        merged.put_slice(data);
        merged.put_slice(&self.pending);
        self.pending = merged;

        trace!(
            unread = data.len(),
            pending = self.pending.len(),
            "Bytes unread"
        );

        self.thaw();
        Ok(())
    }

    /// Suspend reads. An outstanding read stays pending until [`thaw`].
    ///
    /// [`thaw`]: BufferedInputStream::thaw
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    /// Resume reads and reschedule the outstanding read, if any.
    pub fn thaw(&mut self) {
        self.frozen = false;
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }

    /// Close the stream.
    ///
    /// Unread bytes are discarded and an outstanding read is woken so that it
    /// completes with [`StreamError::Closed`].
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.pending.clear();
        self.pending_error = None;
        if let Some(waker) = self.read_waker.take() {
            waker.wake();
        }
    }
}

impl<R: AsyncRead + Unpin> BufferedInputStream<R> {
    /// Non-blocking read.
    ///
    /// Returns [`StreamError::WouldBlock`] while frozen, even if unread bytes
    /// are available, and when neither the unread area nor the source can
    /// produce anything right now.
    pub fn try_read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if self.frozen {
            return Err(StreamError::WouldBlock);
        }

        let mut cx = Context::from_waker(noop_waker_ref());
        let mut out = ReadBuf::new(buf);
        match self.read_into(&mut cx, &mut out) {
            Poll::Ready(Ok(())) => Ok(out.filled().len()),
            Poll::Ready(Err(e)) => Err(e.into()),
            Poll::Pending => Err(StreamError::WouldBlock),
        }
    }

    /// Serve unread bytes first, then top up from the source.
    ///
    /// Never returns `Pending` once unread bytes were copied into `out`. A
    /// source failure after such a copy is held and returned by the first
    /// read that finds the unread area empty.
    fn read_into(&mut self, cx: &mut Context<'_>, out: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.pending.is_empty() {
            if let Some(e) = self.pending_error.take() {
                return Poll::Ready(Err(e));
            }
        }

        let from_pending = self.pending.len().min(out.remaining());
        if from_pending > 0 {
            let chunk = self.pending.split_to(from_pending);
            out.put_slice(&chunk);
        }

        if out.remaining() == 0 || self.pending_error.is_some() {
            return Poll::Ready(Ok(()));
        }

        match Pin::new(&mut self.inner).poll_read(cx, out) {
            Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
            Poll::Ready(Err(e)) if from_pending > 0 => {
                trace!(error = %e, served = from_pending, "Source error held behind unread bytes");
                self.pending_error = Some(e);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending if from_pending > 0 => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for BufferedInputStream<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.closed {
            this.read_waker = None;
            return Poll::Ready(Err(StreamError::Closed.into()));
        }

        if this.frozen {
            this.read_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        this.read_waker = None;
        match this.read_into(cx, out) {
            Poll::Pending => {
                this.read_waker = Some(cx.waker().clone());
                Poll::Pending
            }
            ready => ready,
        }
    }
}
