//! Pooled TCP reverse proxy.
//!
//! This module provides:
//! - Backend pools of pre-connected bridges
//! - Round-robin dispatch of clients onto bridges
//! - Bidirectional relaying with short-write pushback
//! - The TCP listener that feeds the dispatcher
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Dispatcher -> BackendPool (bridge) -> Backend
//!                           |
//!                       run_pair (relay both directions, teardown)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Dispatcher, DispatcherConfig, Listener, ListenerConfig, TcpConnector};
//!
//! let dispatcher = Dispatcher::new(DispatcherConfig::default(), Arc::new(TcpConnector::new()))?;
//! let (handle, _task) = dispatcher.spawn();
//! handle.add_backend("127.0.0.1:9000").await?;
//!
//! let listener = Listener::bind(ListenerConfig::new("127.0.0.1:8080".parse()?), handle).await?;
//! Arc::new(listener).run().await?;
//! ```

mod backend;
mod connector;
mod dispatcher;
mod ids;
mod listener;
mod relay;

#[cfg(test)]
mod testing;

pub use backend::{
    BackendPool, BackendPoolStats, Bridge, PoolConfig, PoolContext, ReleaseOutcome,
    DEFAULT_BRIDGE_IDLE_TIMEOUT, DEFAULT_MAX_POOL_SIZE, DEFAULT_MIN_POOL_SIZE,
    MIN_BRIDGE_IDLE_TIMEOUT,
};
pub use connector::{BackoffPolicy, Connector, TcpConnector, DEFAULT_CONNECT_TIMEOUT};
pub use dispatcher::{
    BackendHandle, Command, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherStats, Event,
    PairInfo, DEFAULT_BRIDGE_ACQUIRE_TIMEOUT, DEFAULT_MAINTENANCE_INTERVAL,
};
pub use ids::{BackendId, BridgeId, ClientId, PairId};
pub use listener::{Listener, ListenerConfig, ListenerStats, DEFAULT_MAX_CONNECTIONS};
pub use relay::{
    run_pair, PairReport, Relay, RelayConfig, RelayEnd, RelayState, Side, DEFAULT_BLOCK_SIZE,
    DEFAULT_TEARDOWN_TIMEOUT,
};
