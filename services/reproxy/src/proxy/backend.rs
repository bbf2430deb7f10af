//! Backend pool management.
//!
//! A [`BackendPool`] keeps a bounded set of *bridges* (outbound connections)
//! to one backend address:
//! - `free`: connected and idle, ready to be paired with a client
//! - `busy`: paired with a client
//! - `connecting`: connect in flight
//!
//! `free + busy + connecting <= max_size` holds at all times. The pool grows
//! eagerly while `free < min_size` or clients are waiting, and reconnects the
//! same slot when a busy bridge is released below `max_size`.
//!
//! A free bridge is checked before it is handed out and on every maintenance
//! pass; one the backend has closed is dropped and its slot reconnected.
//!
//! The idle timeout adapts to the backend: it shrinks to the idle time of a
//! bridge that died before answering, and grows to the idle time of one that
//! answered. Bridges idle for longer than the current timeout are doubtful.
//!
//! Pools are owned by the dispatcher's event loop. Connect attempts run as
//! spawned tasks and report back through [`Event::BridgeConnected`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reproxy_stream::{BoxedStream, Connection, StreamBuffers, StreamError};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn, Instrument};

use super::connector::{BackoffPolicy, Connector};
use super::dispatcher::Event;
use super::ids::{BackendId, BridgeId};
use crate::error::ReproxyError;

/// Default minimum number of free bridges kept per backend.
pub const DEFAULT_MIN_POOL_SIZE: usize = 1;

/// Default maximum number of bridges (free + busy + connecting) per backend.
pub const DEFAULT_MAX_POOL_SIZE: usize = 2;

/// Default time a free bridge may sit idle before it is closed.
pub const DEFAULT_BRIDGE_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Lowest value the adaptive idle timeout shrinks to, unless configured lower.
pub const MIN_BRIDGE_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

/// Pool sizing and idle policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub bridge_idle_timeout: Duration,
}

impl PoolConfig {
    /// Create a config; `max_size` is raised to at least `max(min_size, 1)`.
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self {
            min_size,
            max_size: max_size.max(min_size).max(1),
            bridge_idle_timeout: DEFAULT_BRIDGE_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, bridge_idle_timeout: Duration) -> Self {
        self.bridge_idle_timeout = bridge_idle_timeout;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_POOL_SIZE, DEFAULT_MAX_POOL_SIZE)
    }
}

/// What a pool needs from its owner to open bridges.
#[derive(Clone)]
pub struct PoolContext {
    pub connector: Arc<dyn Connector>,
    pub events: mpsc::UnboundedSender<Event>,
    pub buffers: StreamBuffers,
    pub backoff: BackoffPolicy,
}

impl fmt::Debug for PoolContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolContext")
            .field("buffers", &self.buffers)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// A connected bridge to a backend.
#[derive(Debug)]
pub struct Bridge {
    id: BridgeId,
    backend_id: BackendId,
    conn: Connection,
    idle_since: Instant,
}

impl Bridge {
    pub fn id(&self) -> BridgeId {
        self.id
    }

    pub fn backend_id(&self) -> BackendId {
        self.backend_id
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn into_connection(self) -> Connection {
        self.conn
    }

    /// Time since the bridge connected or was last released.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.idle_since)
    }

    /// Whether the backend still holds the connection open.
    ///
    /// Reads at most one byte without waiting and unreads it, so bytes the
    /// backend sent unprompted stay in front of the stream.
    fn is_open(&mut self) -> bool {
        let mut byte = [0u8; 1];
        let reader = self.conn.reader();
        match reader.try_read(&mut byte) {
            Err(StreamError::WouldBlock) => true,
            Ok(0) => false,
            Ok(n) => reader.unread(&byte[..n]).is_ok(),
            Err(e) => {
                trace!(bridge_id = %self.id, error = %e, "Bridge check failed");
                false
            }
        }
    }
}

/// Result of [`BackendPool::release_bridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The slot is being reconnected under the same bridge id.
    Reused,
    /// The slot was dropped.
    Destroyed,
    /// The bridge id was not held by this pool.
    Unknown,
}

/// Statistics for a backend pool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendPoolStats {
    pub connects_attempted: u64,
    pub connects_succeeded: u64,
    pub connects_failed: u64,
    pub bridges_reused: u64,
    pub bridges_destroyed: u64,
    pub bridges_evicted: u64,
    /// Free bridges found closed by the backend.
    pub bridges_stale: u64,
}

/// Bounded pool of bridges to a single backend address.
pub struct BackendPool {
    id: BackendId,
    address: String,
    config: PoolConfig,
    ctx: PoolContext,
    free: VecDeque<Bridge>,
    busy: VecDeque<BridgeId>,
    connecting: Vec<BridgeId>,
    enabled: bool,
    /// Adaptive idle timeout, starting at `config.bridge_idle_timeout`.
    idle_timeout: Duration,
    /// Consecutive failed connects; drives the retry backoff.
    retry_attempt: u32,
    retry_scheduled: bool,
    stats: BackendPoolStats,
}

impl BackendPool {
    /// Create a pool and immediately start connecting its first bridge.
    pub fn new(id: BackendId, address: String, config: PoolConfig, ctx: PoolContext) -> Self {
        let mut pool = Self {
            id,
            address,
            idle_timeout: config.bridge_idle_timeout,
            config,
            ctx,
            free: VecDeque::new(),
            busy: VecDeque::new(),
            connecting: Vec::new(),
            enabled: true,
            retry_attempt: 0,
            retry_scheduled: false,
            stats: BackendPoolStats::default(),
        };
        pool.new_bridge();
        pool
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    /// Free + busy + connecting.
    pub fn count_all_bridges(&self) -> usize {
        self.free.len() + self.busy.len() + self.connecting.len()
    }

    /// No busy bridges and no connect in flight.
    pub fn is_drained(&self) -> bool {
        self.busy.is_empty() && self.connecting.is_empty()
    }

    pub fn stats(&self) -> BackendPoolStats {
        self.stats.clone()
    }

    /// Current adaptive idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Whether a bridge idle for `idle` may have been closed by the backend.
    pub fn is_doubtful(&self, idle: Duration) -> bool {
        idle > self.idle_timeout
    }

    /// A bridge answered after `observed_idle` without traffic from the
    /// backend: bridges that idle are evidently fine.
    pub fn notify_bridge_activity(&mut self, observed_idle: Duration) {
        if observed_idle > self.idle_timeout {
            debug!(
                backend_id = %self.id,
                from_ms = self.idle_timeout.as_millis() as u64,
                to_ms = observed_idle.as_millis() as u64,
                "Raising bridge idle timeout"
            );
            self.idle_timeout = observed_idle;
        }
    }

    /// A bridge died before answering after `observed_idle` without traffic
    /// from the backend. Shrinks the idle timeout and evicts the free bridges
    /// that are now past it.
    pub fn notify_bridge_error(&mut self, observed_idle: Duration, now: Instant) {
        let floor = self.config.bridge_idle_timeout.min(MIN_BRIDGE_IDLE_TIMEOUT);
        let lowered = self.idle_timeout.min(observed_idle).max(floor);
        if lowered < self.idle_timeout {
            debug!(
                backend_id = %self.id,
                from_ms = self.idle_timeout.as_millis() as u64,
                to_ms = lowered.as_millis() as u64,
                "Lowering bridge idle timeout"
            );
            self.idle_timeout = lowered;
        }
        self.evict_idle(now);
    }

    /// Whether a free bridge exists.
    ///
    /// If none does, a new connect is started (bounded by `max_size`) so the
    /// pool grows ahead of the next request.
    pub fn has_free_bridges(&mut self) -> bool {
        if !self.free.is_empty() {
            return true;
        }
        self.new_bridge();
        false
    }

    /// Take a free bridge and mark it busy.
    ///
    /// Free bridges the backend has closed meanwhile are skipped and their
    /// slots reconnected.
    pub fn request_bridge(&mut self) -> Option<Bridge> {
        while let Some(mut bridge) = self.free.pop_front() {
            if !bridge.is_open() {
                self.replace_stale(bridge.id);
                continue;
            }

            self.busy.push_back(bridge.id);
            debug!(
                backend_id = %self.id,
                bridge_id = %bridge.id,
                free = self.free.len(),
                busy = self.busy.len(),
                "Bridge acquired"
            );
            return Some(bridge);
        }
        None
    }

    /// A connect attempt succeeded.
    ///
    /// With `waiting > 0` clients the bridge is handed over directly as busy
    /// and returned; otherwise it becomes free. Afterwards another connect
    /// starts if clients are still waiting or `free < min_size`.
    pub fn on_bridge_connected(
        &mut self,
        bridge_id: BridgeId,
        stream: BoxedStream,
        waiting: usize,
    ) -> Option<Bridge> {
        if !self.remove_connecting(bridge_id) {
            debug!(backend_id = %self.id, bridge_id = %bridge_id, "Dropping untracked bridge");
            return None;
        }

        if !self.enabled {
            debug!(backend_id = %self.id, bridge_id = %bridge_id, "Pool disabled, dropping bridge");
            return None;
        }

        self.stats.connects_succeeded += 1;
        self.retry_attempt = 0;

        let bridge = Bridge {
            id: bridge_id,
            backend_id: self.id,
            conn: Connection::new(stream, self.ctx.buffers),
            idle_since: Instant::now(),
        };

        let (handed, still_waiting) = if waiting > 0 {
            self.busy.push_back(bridge_id);
            (Some(bridge), waiting - 1)
        } else {
            self.free.push_back(bridge);
            (None, 0)
        };

        debug!(
            backend_id = %self.id,
            bridge_id = %bridge_id,
            handed_over = handed.is_some(),
            free = self.free.len(),
            busy = self.busy.len(),
            connecting = self.connecting.len(),
            "Bridge connected"
        );

        if still_waiting > 0 || self.free.len() < self.config.min_size {
            self.new_bridge();
        }

        handed
    }

    /// A connect attempt failed.
    ///
    /// The slot is dropped. While demand remains, a reconnect is scheduled
    /// after the backoff delay rather than retried immediately.
    pub fn on_bridge_failed(&mut self, bridge_id: BridgeId, error: &ReproxyError, waiting: usize) {
        if !self.remove_connecting(bridge_id) {
            return;
        }

        self.stats.connects_failed += 1;
        warn!(
            backend_id = %self.id,
            bridge_id = %bridge_id,
            address = %self.address,
            attempt = self.retry_attempt,
            error = %error,
            "Failed to connect bridge"
        );

        if self.has_demand(waiting) {
            self.schedule_retry();
        }
    }

    /// A scheduled reconnect is due.
    pub fn on_retry(&mut self, waiting: usize) {
        self.retry_scheduled = false;
        if self.has_demand(waiting) {
            self.new_bridge();
        }
    }

    /// Give a bridge back after its pair closed.
    ///
    /// The bridge is removed from whichever queue holds it. If the pool is
    /// still enabled and the remaining bridge count is below `max_size`, the
    /// same slot is reconnected; otherwise it is destroyed.
    pub fn release_bridge(&mut self, bridge_id: BridgeId) -> ReleaseOutcome {
        let removed = if let Some(pos) = self.busy.iter().position(|id| *id == bridge_id) {
            self.busy.remove(pos);
            true
        } else if let Some(pos) = self.free.iter().position(|b| b.id == bridge_id) {
            self.free.remove(pos);
            true
        } else {
            false
        };

        if !removed {
            return ReleaseOutcome::Unknown;
        }

        if self.enabled && self.count_all_bridges() < self.config.max_size {
            self.stats.bridges_reused += 1;
            debug!(backend_id = %self.id, bridge_id = %bridge_id, "Bridge reused");
            self.connect_bridge(bridge_id);
            ReleaseOutcome::Reused
        } else {
            self.stats.bridges_destroyed += 1;
            debug!(backend_id = %self.id, bridge_id = %bridge_id, "Destroying bridge");
            ReleaseOutcome::Destroyed
        }
    }

    /// Close free bridges idle for at least the idle timeout, drop those the
    /// backend has closed, then replenish towards `min_size`. Returns the
    /// number evicted for idleness.
    pub fn evict_idle(&mut self, now: Instant) -> usize {
        let timeout = self.idle_timeout;
        let before = self.free.len();
        self.free.retain(|bridge| bridge.idle_for(now) < timeout);
        let evicted = before - self.free.len();

        if evicted > 0 {
            self.stats.bridges_evicted += evicted as u64;
            debug!(backend_id = %self.id, evicted, "Evicted idle bridges");
        }

        let mut stale = Vec::new();
        self.free.retain_mut(|bridge| {
            let open = bridge.is_open();
            if !open {
                stale.push(bridge.id);
            }
            open
        });
        for bridge_id in stale {
            self.replace_stale(bridge_id);
        }

        let missing = self
            .config
            .min_size
            .saturating_sub(self.free.len() + self.connecting.len());
        for _ in 0..missing {
            if !self.new_bridge() {
                break;
            }
        }

        evicted
    }

    /// Stop opening bridges and close the free ones.
    ///
    /// In-flight connects are dropped on completion and busy bridges are
    /// destroyed on release.
    pub fn shutdown(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;
        let closed = self.free.len();
        self.free.clear();
        info!(
            backend_id = %self.id,
            address = %self.address,
            closed,
            busy = self.busy.len(),
            connecting = self.connecting.len(),
            "Backend pool shut down"
        );
    }

    /// Account for a free bridge found closed and reconnect its slot.
    fn replace_stale(&mut self, bridge_id: BridgeId) {
        self.stats.bridges_stale += 1;
        debug!(
            backend_id = %self.id,
            bridge_id = %bridge_id,
            "Free bridge closed by backend, reconnecting"
        );
        if self.enabled {
            self.connect_bridge(bridge_id);
        }
    }

    fn has_demand(&self, waiting: usize) -> bool {
        self.enabled && (waiting > 0 || self.free.len() < self.config.min_size)
    }

    /// Start a connect for a fresh slot if `max_size` allows.
    fn new_bridge(&mut self) -> bool {
        if !self.enabled || self.count_all_bridges() >= self.config.max_size {
            return false;
        }
        self.connect_bridge(BridgeId::next());
        true
    }

    fn connect_bridge(&mut self, bridge_id: BridgeId) {
        self.connecting.push(bridge_id);
        self.stats.connects_attempted += 1;

        let connector = Arc::clone(&self.ctx.connector);
        let events = self.ctx.events.clone();
        let address = self.address.clone();
        let backend_id = self.id;

        tokio::spawn(
            async move {
                let result = connector.connect(&address).await;
                // Receiver gone means the dispatcher stopped.
                let _ = events.send(Event::BridgeConnected {
                    backend_id,
                    bridge_id,
                    result,
                });
            }
            .instrument(tracing::debug_span!("connect", backend_id = %backend_id, bridge_id = %bridge_id)),
        );
    }

    fn schedule_retry(&mut self) {
        if self.retry_scheduled {
            return;
        }
        self.retry_scheduled = true;

        let delay = self.ctx.backoff.delay(self.retry_attempt);
        self.retry_attempt = self.retry_attempt.saturating_add(1);

        debug!(
            backend_id = %self.id,
            delay_ms = delay.as_millis() as u64,
            "Scheduling bridge reconnect"
        );

        let events = self.ctx.events.clone();
        let backend_id = self.id;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::RetryConnect { backend_id });
        });
    }

    fn remove_connecting(&mut self, bridge_id: BridgeId) -> bool {
        match self.connecting.iter().position(|id| *id == bridge_id) {
            Some(pos) => {
                self.connecting.swap_remove(pos);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for BackendPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendPool")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("free", &self.free.len())
            .field("busy", &self.busy.len())
            .field("connecting", &self.connecting.len())
            .field("enabled", &self.enabled)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}
