//! reproxy
//!
//! Reverse proxy that keeps pools of pre-connected "bridges" to each backend
//! and pairs every accepted client with one of them.

pub mod config;
pub mod error;
pub mod proxy;

pub use config::Config;
pub use error::{ReproxyError, Result};
pub use proxy::{
    BackendHandle, Connector, Dispatcher, DispatcherConfig, DispatcherHandle, Listener,
    ListenerConfig, PoolConfig, RelayConfig, TcpConnector,
};
