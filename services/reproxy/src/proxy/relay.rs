//! Byte relaying between a client and its bridge.
//!
//! A [`Relay`] copies one direction, reader R to writer W, as a small state
//! machine driven by [`Relay::poll_step`]:
//!
//! ```text
//!            capacity == 0                 capacity available
//!   Idle ───────────────────▶ WritePending ─────────────────▶ Idle
//!    │                             ▲
//!    │ capacity > 0                │ short write (remainder unread)
//!    ▼                             │
//!   ReadPending ──────────────────┘
//!    │  full write ─▶ Idle
//!    └─ EOF / error ─▶ Done
//! ```
//!
//! While in `WritePending`, R is frozen and close-locked: bytes pushed back
//! into R must reach W before R may close. [`run_pair`] drives both
//! directions and performs the teardown once either one ends.
//!
//! ## Doubtful bridges
//!
//! A bridge that sat idle for longer than its pool trusts may already be
//! closed on the backend side. For such a pair the client-to-backend relay
//! keeps a copy of what it sent until the backend sends its first byte. If
//! the backend goes away before that, the copy is unread back into the
//! client and the client is handed back in [`PairReport::replay`] instead of
//! being closed.

use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::BytesMut;
use reproxy_stream::{ConnReader, ConnWriter, Connection};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::ReproxyError;

/// Default relay transfer block.
pub const DEFAULT_BLOCK_SIZE: usize = 8192;

/// Default bound on a pair's teardown.
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Maximum bytes read per step.
    pub block_size: usize,
    /// Upper bound for flushing and closing both sides.
    pub teardown_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }
}

/// Which side of a pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Client => Side::Backend,
            Side::Backend => Side::Client,
        }
    }
}

/// Relay state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Ready to decide between reading and waiting for capacity.
    Idle,
    /// A read on R is in flight.
    ReadPending,
    /// R is frozen until W reports write capacity.
    WritePending,
    /// Moving pushed-back bytes across during teardown.
    Closing,
    /// Direction finished.
    Done,
}

/// Why a direction stopped.
#[derive(Debug)]
pub enum RelayEnd {
    /// R reached end of stream.
    Eof,
    /// A stream of the pair failed. `side` owns the failing stream: the
    /// relay's source for read and pushback errors, its destination for
    /// write and drain errors.
    Failed { side: Side, error: ReproxyError },
}

impl RelayEnd {
    pub fn is_eof(&self) -> bool {
        matches!(self, RelayEnd::Eof)
    }

    /// The side whose stream failed, if the direction did not simply end.
    pub fn failed_side(&self) -> Option<Side> {
        match self {
            RelayEnd::Eof => None,
            RelayEnd::Failed { side, .. } => Some(*side),
        }
    }

    pub fn error(&self) -> Option<&ReproxyError> {
        match self {
            RelayEnd::Eof => None,
            RelayEnd::Failed { error, .. } => Some(error),
        }
    }
}

/// One direction of a bridged pair.
#[derive(Debug)]
pub struct Relay {
    source: Side,
    state: RelayState,
    buf: Box<[u8]>,
    transferred: u64,
    /// Whether this relay holds R's close lock.
    locked: bool,
    /// Copy of everything handed to W, kept while a resend may be needed.
    replay: Option<BytesMut>,
    replay_limit: usize,
    first_read: Option<Instant>,
}

impl Relay {
    /// Relay reading from `source` and writing to its peer.
    pub fn new(source: Side, block_size: usize) -> Self {
        Self {
            source,
            state: RelayState::Idle,
            buf: vec![0u8; block_size.max(1)].into_boxed_slice(),
            transferred: 0,
            locked: false,
            replay: None,
            replay_limit: 0,
            first_read: None,
        }
    }

    /// Keep a copy of up to `limit` relayed bytes. Past the limit the copy
    /// is dropped for good.
    pub fn with_replay(mut self, limit: usize) -> Self {
        self.replay = Some(BytesMut::new());
        self.replay_limit = limit;
        self
    }

    pub fn source(&self) -> Side {
        self.source
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    /// Bytes accepted by W so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// When R first produced data.
    pub fn first_read_at(&self) -> Option<Instant> {
        self.first_read
    }

    /// Length of the kept copy, if one is still kept.
    pub fn replay_len(&self) -> Option<usize> {
        self.replay.as_ref().map(|cache| cache.len())
    }

    /// Stop keeping a copy and return what was kept.
    pub fn take_replay(&mut self) -> Option<BytesMut> {
        self.replay.take()
    }

    /// Advance the relay until it must wait or its direction ends.
    pub fn poll_step(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut ConnReader,
        writer: &mut ConnWriter,
    ) -> Poll<RelayEnd> {
        loop {
            if let Poll::Ready(Err(e)) = writer.poll_drain(cx) {
                return self.fail(reader, self.source.peer(), e.into());
            }

            match self.state {
                RelayState::Idle => {
                    if writer.write_capacity() == 0 {
                        self.suspend(reader);
                        self.state = RelayState::WritePending;
                    } else {
                        self.state = RelayState::ReadPending;
                    }
                }
                RelayState::ReadPending => {
                    let read = {
                        let mut out = ReadBuf::new(&mut self.buf);
                        match Pin::new(&mut *reader).poll_read(cx, &mut out) {
                            Poll::Pending => return Poll::Pending,
                            Poll::Ready(result) => result.map(|()| out.filled().len()),
                        }
                    };
                    let n = match read {
                        Ok(n) => n,
                        Err(e) => return self.fail(reader, self.source, e.into()),
                    };

                    if n == 0 {
                        return self.finish(reader, RelayEnd::Eof);
                    }
                    if self.first_read.is_none() {
                        self.first_read = Some(Instant::now());
                    }

                    let written = writer.write(&self.buf[..n]);
                    self.transferred += written as u64;
                    self.keep_copy(written);

                    if written < n {
                        trace!(
                            source = ?self.source,
                            read = n,
                            written,
                            "Short write, unreading remainder"
                        );
                        if let Err(e) = reader.unread(&self.buf[written..n]) {
                            return self.fail(reader, self.source, e.into());
                        }
                        self.suspend(reader);
                        self.state = RelayState::WritePending;
                    } else {
                        self.state = RelayState::Idle;
                    }
                }
                RelayState::WritePending => match writer.poll_write_capacity(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => {
                        return self.fail(reader, self.source.peer(), e.into());
                    }
                    Poll::Ready(Ok(_)) => {
                        self.resume(reader);
                        self.state = RelayState::Idle;
                    }
                },
                // Driven by `poll_release` or finished.
                RelayState::Closing | RelayState::Done => return Poll::Pending,
            }
        }
    }

    /// Teardown path: move bytes still pushed back into R over to W, then
    /// release R's close lock and drain W.
    ///
    /// No new data is read from R's source.
    pub fn poll_release(
        &mut self,
        cx: &mut Context<'_>,
        reader: &mut ConnReader,
        writer: &mut ConnWriter,
    ) -> Poll<io::Result<()>> {
        self.state = RelayState::Closing;

        while self.locked {
            ready!(writer.poll_write_capacity(cx))?;

            let n = writer
                .write_capacity()
                .min(reader.pending_len())
                .min(self.buf.len());
            if n > 0 {
                reader.thaw();
                let read = reader.try_read(&mut self.buf[..n]).map_err(io::Error::from)?;
                let written = writer.write(&self.buf[..read]);
                self.transferred += written as u64;
            }

            if reader.pending_len() == 0 {
                self.locked = false;
                reader.unlock_close();
            } else {
                reader.freeze();
            }
        }

        ready!(writer.poll_drain(cx))?;
        self.state = RelayState::Done;
        Poll::Ready(Ok(()))
    }

    fn keep_copy(&mut self, written: usize) {
        let Some(cache) = self.replay.as_mut() else {
            return;
        };
        if cache.len() + written > self.replay_limit {
            trace!(
                source = ?self.source,
                kept = cache.len(),
                limit = self.replay_limit,
                "Replay copy over limit, dropping it"
            );
            self.replay = None;
        } else {
            cache.extend_from_slice(&self.buf[..written]);
        }
    }

    fn suspend(&mut self, reader: &mut ConnReader) {
        reader.freeze();
        if !self.locked {
            reader.lock_close();
            self.locked = true;
        }
    }

    fn resume(&mut self, reader: &mut ConnReader) {
        if self.locked {
            self.locked = false;
            reader.unlock_close();
        }
        reader.thaw();
    }

    fn fail(&mut self, reader: &mut ConnReader, side: Side, error: ReproxyError) -> Poll<RelayEnd> {
        self.finish(reader, RelayEnd::Failed { side, error })
    }

    fn finish(&mut self, reader: &mut ConnReader, end: RelayEnd) -> Poll<RelayEnd> {
        if self.locked {
            self.locked = false;
            reader.unlock_close();
        }
        self.state = RelayState::Done;
        Poll::Ready(end)
    }
}

/// Outcome of a bridged pair.
#[derive(Debug)]
pub struct PairReport {
    /// Bytes relayed client to backend.
    pub bytes_up: u64,
    /// Bytes relayed backend to client.
    pub bytes_down: u64,
    /// The side whose direction ended first.
    pub closed_by: Side,
    /// Why that direction ended.
    pub end: RelayEnd,
    /// Whether teardown completed within the timeout and without errors.
    pub clean_teardown: bool,
    /// Time from pairing to the backend's first byte.
    pub first_response: Option<Duration>,
    /// The client, with its sent bytes restored, when the bridge died before
    /// answering and the pair kept a replay copy.
    pub replay: Option<Connection>,
}

impl PairReport {
    /// Whether the backend ended the pair, by closing or by failing.
    pub fn backend_failed(&self) -> bool {
        match &self.end {
            RelayEnd::Eof => self.closed_by == Side::Backend,
            RelayEnd::Failed { side, .. } => *side == Side::Backend,
        }
    }
}

/// Relay both directions of a (client, backend) pair until one ends, then
/// tear the pair down.
///
/// Teardown order: bytes pushed back into the peer's reader are delivered,
/// the peer's output is flushed and the peer closed, then the originating
/// side is closed. Both connections are dropped on return.
///
/// With `replay_limit` set, client bytes are kept until the backend answers.
/// If the backend ends the pair first, the client is not torn down but
/// returned in [`PairReport::replay`] with those bytes unread.
pub async fn run_pair(
    client: Connection,
    backend: Connection,
    config: RelayConfig,
    replay_limit: Option<usize>,
) -> PairReport {
    let started = Instant::now();
    let (mut client_r, mut client_w) = client.into_split();
    let (mut backend_r, mut backend_w) = backend.into_split();

    let mut up = Relay::new(Side::Client, config.block_size);
    if let Some(limit) = replay_limit {
        up = up.with_replay(limit);
    }
    let mut down = Relay::new(Side::Backend, config.block_size);

    let (closed_by, end) = poll_fn(|cx| {
        if let Poll::Ready(end) = up.poll_step(cx, &mut client_r, &mut backend_w) {
            return Poll::Ready((Side::Client, end));
        }
        if let Poll::Ready(end) = down.poll_step(cx, &mut backend_r, &mut client_w) {
            return Poll::Ready((Side::Backend, end));
        }
        // The backend answered; nothing will be resent.
        if down.first_read_at().is_some() {
            up.take_replay();
        }
        Poll::Pending
    })
    .await;

    match &end {
        RelayEnd::Eof => debug!(closed_by = ?closed_by, "Direction reached EOF"),
        RelayEnd::Failed { side, error } if error.is_buffer_full() => {
            warn!(closed_by = ?closed_by, failed_side = ?side, error = %error, "Relay buffer overflow")
        }
        RelayEnd::Failed { side, error } => {
            debug!(closed_by = ?closed_by, failed_side = ?side, error = %error, "Direction failed")
        }
    }

    let first_response = down
        .first_read_at()
        .map(|at| at.saturating_duration_since(started));

    let mut report = PairReport {
        bytes_up: up.transferred(),
        bytes_down: down.transferred(),
        closed_by,
        end,
        clean_teardown: false,
        first_response,
        replay: None,
    };

    if let Some(cache) = up.take_replay() {
        if first_response.is_none() && report.backend_failed() {
            match hand_back(&mut up, client_r, client_w, &cache) {
                Ok(conn) => {
                    debug!(replayed = cache.len(), "Bridge failed before answering, handing client back");
                    report.clean_teardown = true;
                    report.replay = Some(conn);
                    return report;
                }
                Err((r, w)) => {
                    client_r = r;
                    client_w = w;
                }
            }
        }
    }

    let closing = async {
        match closed_by {
            Side::Client => {
                teardown(&mut down, &mut client_r, &mut client_w, &mut backend_r, &mut backend_w)
                    .await
            }
            Side::Backend => {
                teardown(&mut up, &mut backend_r, &mut backend_w, &mut client_r, &mut client_w)
                    .await
            }
        }
    };

    report.clean_teardown = match tokio::time::timeout(config.teardown_timeout, closing).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            debug!(error = %e, "Teardown error");
            false
        }
        Err(_) => {
            warn!(
                timeout_ms = config.teardown_timeout.as_millis() as u64,
                "Teardown timed out"
            );
            false
        }
    };
    report.bytes_up = up.transferred();
    report.bytes_down = down.transferred();

    debug!(
        bytes_up = report.bytes_up,
        bytes_down = report.bytes_down,
        clean = report.clean_teardown,
        "Pair closed"
    );

    report
}

/// Unread `cache` in front of the client's input and rebuild the client
/// connection. Nothing is read from or written to the client.
fn hand_back(
    up: &mut Relay,
    mut reader: ConnReader,
    writer: ConnWriter,
    cache: &[u8],
) -> Result<Connection, (ConnReader, ConnWriter)> {
    up.resume(&mut reader);
    if let Err(e) = reader.unread(cache) {
        debug!(error = %e, kept = cache.len(), "Replay copy does not fit, closing client");
        return Err((reader, writer));
    }
    Connection::reunite(reader, writer)
}

/// Close a pair whose `origin` side ended first.
///
/// `peer_relay` is the relay reading from the peer and writing to the origin.
async fn teardown(
    peer_relay: &mut Relay,
    origin_r: &mut ConnReader,
    origin_w: &mut ConnWriter,
    peer_r: &mut ConnReader,
    peer_w: &mut ConnWriter,
) -> io::Result<()> {
    // Deferred while the peer relay holds pushed-back bytes.
    peer_r.close();
    let delivered = poll_fn(|cx| peer_relay.poll_release(cx, peer_r, origin_w)).await;

    let flushed = peer_w.close().await;
    peer_r.close();

    let origin_closed = origin_w.close().await;
    origin_r.close();

    delivered.and(flushed).and(origin_closed)
}
