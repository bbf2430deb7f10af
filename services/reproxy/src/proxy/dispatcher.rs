//! Client dispatch and bridge pairing.
//!
//! The [`Dispatcher`] owns every backend pool, the FIFO of clients waiting
//! for a bridge, and the table of live pairs. It is driven from a single
//! task: connect attempts and pair tasks report back through an event
//! channel, so no state is shared or locked.
//!
//! ## Flow
//!
//! ```text
//! accept ─▶ select pool (round robin, free bridge first) ─▶ enqueue client
//!                │                                              │
//!                └─ request_bridge ─▶ bridge ready ─▶ pair oldest client
//!                                                        │
//!                                  PairClosed ◀─ run_pair (spawned)
//!                                      │
//!                                      ├─▶ release_bridge (reuse / destroy)
//!                                      └─▶ replayed client back to the queue front
//! ```

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reproxy_stream::{BoxedStream, Connection, StreamBuffers};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use super::backend::{BackendPool, BackendPoolStats, Bridge, PoolConfig, PoolContext};
use super::connector::{BackoffPolicy, Connector};
use super::ids::{BackendId, BridgeId, ClientId, PairId};
use super::relay::{run_pair, PairReport, RelayConfig};
use crate::error::{ReproxyError, Result};

/// Default time a client may wait for a bridge before it is rejected.
pub const DEFAULT_BRIDGE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default period of the maintenance tick (acquisition timeouts, idle eviction).
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(1);

/// Command mailbox size for [`DispatcherHandle`].
const COMMAND_MAILBOX_SIZE: usize = 1024;

// =============================================================================
// Configuration
// =============================================================================

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Sizing applied to every backend pool.
    pub pool: PoolConfig,
    /// Buffer sizes for client and bridge connections.
    pub buffers: StreamBuffers,
    /// Relay tuning for bridged pairs.
    pub relay: RelayConfig,
    /// Delay policy for reconnecting failed bridges.
    pub backoff: BackoffPolicy,
    /// How long a client may wait for a bridge.
    pub bridge_acquire_timeout: Duration,
    /// Period of [`Dispatcher::maintain`] when running as a task.
    pub maintenance_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            buffers: StreamBuffers::default(),
            relay: RelayConfig::default(),
            backoff: BackoffPolicy::default(),
            bridge_acquire_timeout: DEFAULT_BRIDGE_ACQUIRE_TIMEOUT,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }
}

impl DispatcherConfig {
    /// Reject settings the relay cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.relay.block_size == 0 {
            return Err(ReproxyError::InvalidConfig(
                "relay block size must be greater than zero".to_string(),
            ));
        }
        // A short write can push back up to a whole block.
        if self.buffers.read_capacity < self.relay.block_size {
            return Err(ReproxyError::InvalidConfig(format!(
                "read buffer ({}) must be at least the relay block size ({})",
                self.buffers.read_capacity, self.relay.block_size
            )));
        }
        if self.buffers.write_capacity == 0 {
            return Err(ReproxyError::InvalidConfig(
                "write buffer must be greater than zero".to_string(),
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(ReproxyError::InvalidConfig(
                "maintenance interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Bytes a doubtful pair may keep for a resend: whatever room a full
    /// pushed-back block leaves in the client's read buffer.
    fn replay_limit(&self) -> usize {
        self.buffers
            .read_capacity
            .saturating_sub(self.relay.block_size)
    }
}

// =============================================================================
// Events and Records
// =============================================================================

/// Notifications delivered to the dispatcher loop.
pub enum Event {
    /// A bridge connect attempt finished.
    BridgeConnected {
        backend_id: BackendId,
        bridge_id: BridgeId,
        result: Result<BoxedStream>,
    },
    /// A backoff delay for a failed connect elapsed.
    RetryConnect { backend_id: BackendId },
    /// A pair task finished its teardown.
    PairClosed { pair_id: PairId, report: PairReport },
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::BridgeConnected {
                backend_id,
                bridge_id,
                result,
            } => f
                .debug_struct("BridgeConnected")
                .field("backend_id", backend_id)
                .field("bridge_id", bridge_id)
                .field("ok", &result.is_ok())
                .finish(),
            Event::RetryConnect { backend_id } => f
                .debug_struct("RetryConnect")
                .field("backend_id", backend_id)
                .finish(),
            Event::PairClosed { pair_id, report } => f
                .debug_struct("PairClosed")
                .field("pair_id", pair_id)
                .field("report", report)
                .finish(),
        }
    }
}

/// Handle returned by [`Dispatcher::add_backend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackendHandle(BackendId);

impl BackendHandle {
    pub fn id(&self) -> BackendId {
        self.0
    }
}

/// A client waiting for a bridge.
#[derive(Debug)]
struct PendingClient {
    id: ClientId,
    conn: Connection,
    enqueued_at: Instant,
}

/// A live (client, bridge) pair.
#[derive(Debug)]
struct PairRecord {
    client_id: ClientId,
    backend_id: BackendId,
    bridge_id: BridgeId,
    /// How long the bridge had been idle when it was paired.
    bridge_idle: Duration,
    started_at: Instant,
    task: AbortHandle,
}

/// Snapshot of a live pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairInfo {
    pub pair_id: PairId,
    pub client_id: ClientId,
    pub backend_id: BackendId,
    pub bridge_id: BridgeId,
    pub age: Duration,
}

/// Dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherStats {
    pub clients_accepted: u64,
    pub clients_bridged: u64,
    pub clients_rejected: u64,
    /// Clients put back in the queue after their bridge died unanswered.
    pub clients_replayed: u64,
    pub pairs_closed: u64,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub pending_clients: usize,
    pub active_pairs: usize,
    pub backends: usize,
    pub draining_backends: usize,
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Round-robin dispatcher pairing clients with pooled bridges.
pub struct Dispatcher {
    config: DispatcherConfig,
    connector: Arc<dyn Connector>,
    backends: Vec<BackendPool>,
    /// Next backend to try; `None` until the first backend is added.
    cursor: Option<usize>,
    pending: VecDeque<PendingClient>,
    /// Removed pools whose busy bridges have not been released yet.
    draining: HashMap<BackendId, BackendPool>,
    pairs: HashMap<PairId, PairRecord>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    enabled: bool,
    stats: DispatcherStats,
}

impl Dispatcher {
    /// Create a dispatcher; fails if `config` does not validate.
    pub fn new(config: DispatcherConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            connector,
            backends: Vec::new(),
            cursor: None,
            pending: VecDeque::new(),
            draining: HashMap::new(),
            pairs: HashMap::new(),
            events_tx,
            events_rx,
            enabled: true,
            stats: DispatcherStats::default(),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn pending_clients(&self) -> usize {
        self.pending.len()
    }

    /// The pool the round-robin cursor points at.
    pub fn cursor_backend(&self) -> Option<BackendId> {
        self.cursor
            .and_then(|idx| self.backends.get(idx))
            .map(|pool| pool.id())
    }

    /// Look up a live or draining pool.
    pub fn pool(&self, handle: BackendHandle) -> Option<&BackendPool> {
        self.backends
            .iter()
            .find(|pool| pool.id() == handle.id())
            .or_else(|| self.draining.get(&handle.id()))
    }

    pub fn pool_stats(&self, handle: BackendHandle) -> Option<BackendPoolStats> {
        self.pool(handle).map(|pool| pool.stats())
    }

    pub fn active_pairs(&self) -> Vec<PairInfo> {
        let now = Instant::now();
        let mut pairs: Vec<PairInfo> = self
            .pairs
            .iter()
            .map(|(pair_id, record)| PairInfo {
                pair_id: *pair_id,
                client_id: record.client_id,
                backend_id: record.backend_id,
                bridge_id: record.bridge_id,
                age: now.saturating_duration_since(record.started_at),
            })
            .collect();
        pairs.sort_by_key(|info| info.pair_id);
        pairs
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            pending_clients: self.pending.len(),
            active_pairs: self.pairs.len(),
            backends: self.backends.len(),
            draining_backends: self.draining.len(),
            ..self.stats.clone()
        }
    }

    /// Append a backend to the rotation and start filling its pool.
    pub fn add_backend(&mut self, address: impl Into<String>) -> BackendHandle {
        let id = BackendId::next();
        let address = address.into();
        let ctx = PoolContext {
            connector: Arc::clone(&self.connector),
            events: self.events_tx.clone(),
            buffers: self.config.buffers,
            backoff: self.config.backoff.clone(),
        };

        info!(backend_id = %id, address = %address, "Backend added");
        self.backends
            .push(BackendPool::new(id, address, self.config.pool.clone(), ctx));

        if self.cursor.is_none() {
            self.cursor = Some(0);
        }

        BackendHandle(id)
    }

    /// Take a backend out of rotation.
    ///
    /// Free bridges are closed at once; busy ones stay up until their pairs
    /// close, then the pool is dropped.
    pub fn remove_backend(&mut self, handle: BackendHandle) -> Result<()> {
        let idx = self
            .backends
            .iter()
            .position(|pool| pool.id() == handle.id())
            .ok_or(ReproxyError::UnknownBackend(handle.id()))?;

        let mut pool = self.backends.remove(idx);
        let len = self.backends.len();
        self.cursor = match self.cursor {
            _ if len == 0 => None,
            Some(cursor) if idx < cursor => Some(cursor - 1),
            Some(cursor) if cursor >= len => Some(0),
            other => other,
        };

        info!(
            backend_id = %pool.id(),
            address = %pool.address(),
            busy = pool.busy_count(),
            "Backend removed"
        );

        pool.shutdown();
        if !pool.is_drained() {
            self.draining.insert(pool.id(), pool);
        }

        // Waiting clients may have been counting on that pool's connects.
        if !self.pending.is_empty() {
            for pool in &mut self.backends {
                pool.has_free_bridges();
            }
        }

        Ok(())
    }

    /// Admit a client connection.
    ///
    /// The client is queued until a bridge is available. With no backends
    /// configured it is closed right away.
    pub fn on_connection_accepted(&mut self, conn: Connection) -> Result<ClientId> {
        let client_id = ClientId::next();
        self.stats.clients_accepted += 1;

        if !self.enabled || self.backends.is_empty() {
            self.stats.clients_rejected += 1;
            warn!(client_id = %client_id, conn = %conn.id(), "No backends available, rejecting client");
            return Err(ReproxyError::NoBackends);
        }

        debug!(client_id = %client_id, conn = %conn.id(), "Client accepted");
        self.dispatch(
            PendingClient {
                id: client_id,
                conn,
                enqueued_at: Instant::now(),
            },
            false,
        );

        Ok(client_id)
    }

    /// Queue a client (at the front if `first`) and ask the selected pool
    /// for a bridge.
    fn dispatch(&mut self, client: PendingClient, first: bool) {
        let idx = self.select_backend();
        let bridge = self.backends[idx].request_bridge();

        debug!(
            client_id = %client.id,
            backend_id = %self.backends[idx].id(),
            bridge_ready = bridge.is_some(),
            first,
            "Client queued"
        );

        if first {
            self.pending.push_front(client);
        } else {
            self.pending.push_back(client);
        }

        if let Some(bridge) = bridge {
            self.on_bridge_ready(bridge);
        }
    }

    /// Scan from the cursor for a pool with a free bridge; fall back to the
    /// cursor pool. Asking a pool without free bridges makes it grow.
    fn select_backend(&mut self) -> usize {
        let len = self.backends.len();
        let start = self.cursor.unwrap_or(0) % len;

        for offset in 0..len {
            let idx = (start + offset) % len;
            if self.backends[idx].has_free_bridges() {
                self.cursor = Some((idx + 1) % len);
                return idx;
            }
        }

        self.cursor = Some((start + 1) % len);
        start
    }

    /// Pair a ready bridge with the oldest waiting client.
    fn on_bridge_ready(&mut self, bridge: Bridge) {
        let Some(client) = self.pending.pop_front() else {
            debug!(bridge_id = %bridge.id(), "No client waiting, releasing bridge");
            let (backend_id, bridge_id) = (bridge.backend_id(), bridge.id());
            drop(bridge);
            if let Some(pool) = self.pool_mut(backend_id) {
                pool.release_bridge(bridge_id);
            }
            return;
        };

        let PendingClient {
            id: client_id,
            conn: client_conn,
            enqueued_at,
        } = client;
        let pair_id = PairId::next();
        let backend_id = bridge.backend_id();
        let bridge_id = bridge.id();
        let now = Instant::now();
        let waited = now.saturating_duration_since(enqueued_at);
        let bridge_idle = bridge.idle_for(now);
        let doubtful = self
            .pool_mut(backend_id)
            .is_some_and(|pool| pool.is_doubtful(bridge_idle));
        let replay_limit = doubtful.then(|| self.config.replay_limit());

        let span = info_span!(
            "pair",
            pair_id = %pair_id,
            client_id = %client_id,
            backend_id = %backend_id,
            bridge_id = %bridge_id
        );
        let events = self.events_tx.clone();
        let relay = self.config.relay.clone();
        let backend_conn = bridge.into_connection();

        let task = tokio::spawn(
            async move {
                let report = run_pair(client_conn, backend_conn, relay, replay_limit).await;
                let _ = events.send(Event::PairClosed { pair_id, report });
            }
            .instrument(span),
        );

        debug!(
            pair_id = %pair_id,
            client_id = %client_id,
            backend_id = %backend_id,
            bridge_id = %bridge_id,
            waited_ms = waited.as_millis() as u64,
            bridge_idle_ms = bridge_idle.as_millis() as u64,
            doubtful,
            "Client bridged"
        );

        self.stats.clients_bridged += 1;
        self.pairs.insert(
            pair_id,
            PairRecord {
                client_id,
                backend_id,
                bridge_id,
                bridge_idle,
                started_at: now,
                task: task.abort_handle(),
            },
        );
    }

    /// Settle a closed pair: release its bridge exactly once, feed the
    /// bridge's fate into the pool's idle timeout, and requeue a client the
    /// pair handed back.
    ///
    /// Returns `false` if the pair was already settled.
    pub fn on_pair_closed(&mut self, pair_id: PairId, mut report: PairReport) -> bool {
        let Some(record) = self.pairs.remove(&pair_id) else {
            debug!(pair_id = %pair_id, "Pair already closed");
            return false;
        };

        self.stats.pairs_closed += 1;
        self.stats.bytes_up += report.bytes_up;
        self.stats.bytes_down += report.bytes_down;

        let now = Instant::now();
        let outcome = self.pool_mut(record.backend_id).map(|pool| {
            let outcome = pool.release_bridge(record.bridge_id);
            match report.first_response {
                Some(delay) => pool.notify_bridge_activity(record.bridge_idle + delay),
                None if report.backend_failed() => {
                    let silent = record.bridge_idle + now.saturating_duration_since(record.started_at);
                    pool.notify_bridge_error(silent, now);
                }
                None => {}
            }
            outcome
        });

        debug!(
            pair_id = %pair_id,
            client_id = %record.client_id,
            backend_id = %record.backend_id,
            bridge_id = %record.bridge_id,
            closed_by = ?report.closed_by,
            bytes_up = report.bytes_up,
            bytes_down = report.bytes_down,
            release = ?outcome,
            replayed = report.replay.is_some(),
            "Pair settled"
        );

        self.reap_draining(record.backend_id);

        if let Some(conn) = report.replay.take() {
            self.requeue(record.client_id, conn);
        }
        true
    }

    /// Put a handed-back client at the front of the queue.
    fn requeue(&mut self, client_id: ClientId, conn: Connection) {
        if !self.enabled || self.backends.is_empty() {
            self.stats.clients_rejected += 1;
            warn!(client_id = %client_id, "No backends left for replayed client, closing it");
            return;
        }

        self.stats.clients_replayed += 1;
        info!(client_id = %client_id, "Bridge died before answering, replaying client");
        self.dispatch(
            PendingClient {
                id: client_id,
                conn,
                enqueued_at: Instant::now(),
            },
            true,
        );
    }

    /// Apply one event from a connect or pair task.
    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::BridgeConnected {
                backend_id,
                bridge_id,
                result,
            } => {
                let waiting = self.pending.len();
                let handed = match self.pool_mut(backend_id) {
                    Some(pool) => match result {
                        Ok(stream) => pool.on_bridge_connected(bridge_id, stream, waiting),
                        Err(e) => {
                            // The waiting clients stay queued until the
                            // acquisition timeout.
                            pool.on_bridge_failed(bridge_id, &e, waiting);
                            None
                        }
                    },
                    None => {
                        debug!(backend_id = %backend_id, bridge_id = %bridge_id, "Connect for unknown backend");
                        None
                    }
                };

                if let Some(bridge) = handed {
                    self.on_bridge_ready(bridge);
                }
                self.reap_draining(backend_id);
            }
            Event::RetryConnect { backend_id } => {
                let waiting = self.pending.len();
                if let Some(pool) = self.backends.iter_mut().find(|p| p.id() == backend_id) {
                    pool.on_retry(waiting);
                }
            }
            Event::PairClosed { pair_id, report } => {
                self.on_pair_closed(pair_id, report);
            }
        }
    }

    /// Wait for the next event.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events_rx.recv().await
    }

    /// Reject clients that waited longer than the acquisition timeout and
    /// evict idle bridges.
    pub fn maintain(&mut self, now: Instant) {
        let timeout = self.config.bridge_acquire_timeout;

        // FIFO order means the expired clients are at the front.
        while let Some(client) = self.pending.front() {
            let waited = now.saturating_duration_since(client.enqueued_at);
            if waited < timeout {
                break;
            }
            if let Some(client) = self.pending.pop_front() {
                self.stats.clients_rejected += 1;
                warn!(
                    client_id = %client.id,
                    waited_ms = waited.as_millis() as u64,
                    "No bridge acquired in time, rejecting client"
                );
            }
        }

        for pool in &mut self.backends {
            pool.evict_idle(now);
        }
    }

    /// Close waiting clients, abort live pairs and shut every pool down.
    pub fn shutdown(&mut self) {
        if !self.enabled {
            return;
        }
        self.enabled = false;

        let pending = self.pending.len();
        self.pending.clear();

        let pairs = self.pairs.len();
        for (_, record) in self.pairs.drain() {
            record.task.abort();
        }

        for pool in &mut self.backends {
            pool.shutdown();
        }
        self.backends.clear();
        self.draining.clear();
        self.cursor = None;

        info!(pending, pairs, "Dispatcher shut down");
    }

    /// Run the event loop until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => break,
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
                _ = ticker.tick() => self.maintain(Instant::now()),
            }
        }

        self.shutdown();
    }

    /// Spawn the event loop and return a handle to it.
    pub fn spawn(self) -> (DispatcherHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_MAILBOX_SIZE);
        let task = tokio::spawn(self.run(rx).instrument(info_span!("dispatcher")));
        (DispatcherHandle { tx }, task)
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Accept { conn, reply } => {
                let _ = reply.send(self.on_connection_accepted(conn));
            }
            Command::AddBackend { address, reply } => {
                let _ = reply.send(self.add_backend(address));
            }
            Command::RemoveBackend { handle, reply } => {
                let _ = reply.send(self.remove_backend(handle));
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::ActivePairs { reply } => {
                let _ = reply.send(self.active_pairs());
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn pool_mut(&mut self, backend_id: BackendId) -> Option<&mut BackendPool> {
        match self.backends.iter_mut().find(|pool| pool.id() == backend_id) {
            Some(pool) => Some(pool),
            None => self.draining.get_mut(&backend_id),
        }
    }

    fn reap_draining(&mut self, backend_id: BackendId) {
        if self
            .draining
            .get(&backend_id)
            .is_some_and(|pool| pool.is_drained())
        {
            self.draining.remove(&backend_id);
            debug!(backend_id = %backend_id, "Drained backend dropped");
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("backends", &self.backends)
            .field("cursor", &self.cursor)
            .field("pending", &self.pending.len())
            .field("pairs", &self.pairs.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Requests served by a running dispatcher.
pub enum Command {
    Accept {
        conn: Connection,
        reply: oneshot::Sender<Result<ClientId>>,
    },
    AddBackend {
        address: String,
        reply: oneshot::Sender<BackendHandle>,
    },
    RemoveBackend {
        handle: BackendHandle,
        reply: oneshot::Sender<Result<()>>,
    },
    Stats {
        reply: oneshot::Sender<DispatcherStats>,
    },
    ActivePairs {
        reply: oneshot::Sender<Vec<PairInfo>>,
    },
    Shutdown,
}

/// Cloneable handle to a spawned [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<Command>,
}

impl DispatcherHandle {
    /// Hand an accepted client to the dispatcher.
    pub async fn accept(&self, conn: Connection) -> Result<ClientId> {
        self.request(|reply| Command::Accept { conn, reply }).await?
    }

    pub async fn add_backend(&self, address: impl Into<String>) -> Result<BackendHandle> {
        let address = address.into();
        self.request(|reply| Command::AddBackend { address, reply })
            .await
    }

    pub async fn remove_backend(&self, handle: BackendHandle) -> Result<()> {
        self.request(|reply| Command::RemoveBackend { handle, reply })
            .await?
    }

    pub async fn stats(&self) -> Result<DispatcherStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    pub async fn active_pairs(&self) -> Result<Vec<PairInfo>> {
        self.request(|reply| Command::ActivePairs { reply }).await
    }

    /// Ask the dispatcher to stop. Stopping twice is fine.
    pub async fn shutdown(&self) {
        let _ = self.tx.send(Command::Shutdown).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| ReproxyError::DispatcherStopped)?;
        rx.await.map_err(|_| ReproxyError::DispatcherStopped)
    }
}
