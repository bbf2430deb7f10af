//! Proxy configuration (env-driven).

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reproxy_stream::StreamBuffers;

use crate::proxy::{
    BackoffPolicy, DispatcherConfig, ListenerConfig, PoolConfig, RelayConfig,
    DEFAULT_BLOCK_SIZE, DEFAULT_BRIDGE_ACQUIRE_TIMEOUT, DEFAULT_BRIDGE_IDLE_TIMEOUT,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAINTENANCE_INTERVAL, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_POOL_SIZE, DEFAULT_MIN_POOL_SIZE, DEFAULT_TEARDOWN_TIMEOUT,
};

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

/// Proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the listener binds to.
    pub listen_addr: SocketAddr,

    /// Backend addresses (`host:port`), in round-robin order.
    pub backends: Vec<String>,

    /// Minimum free bridges kept per backend.
    pub min_pool_size: usize,

    /// Maximum bridges per backend.
    pub max_pool_size: usize,

    /// Relay transfer block.
    pub block_size: usize,

    pub buffers: StreamBuffers,

    pub connect_timeout: Duration,

    /// How long a client may wait for a bridge.
    pub acquire_timeout: Duration,

    /// Free bridges idle longer than this are closed.
    pub bridge_idle_timeout: Duration,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr = lookup("REPROXY_LISTEN_ADDR")
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
            .parse()
            .context("REPROXY_LISTEN_ADDR must be a socket address (host:port).")?;

        let backends: Vec<String> = lookup("REPROXY_BACKENDS")
            .context("Missing backends. Set REPROXY_BACKENDS to a comma-separated host:port list.")?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if backends.is_empty() {
            bail!("REPROXY_BACKENDS must name at least one backend.");
        }

        let min_pool_size = parse_or(&lookup, "REPROXY_MIN_POOL_SIZE", DEFAULT_MIN_POOL_SIZE)?;
        let max_pool_size = parse_or(&lookup, "REPROXY_MAX_POOL_SIZE", DEFAULT_MAX_POOL_SIZE)?;
        if max_pool_size == 0 || max_pool_size < min_pool_size {
            bail!(
                "REPROXY_MAX_POOL_SIZE ({max_pool_size}) must be at least 1 and at least REPROXY_MIN_POOL_SIZE ({min_pool_size})."
            );
        }

        let block_size = parse_or(&lookup, "REPROXY_BLOCK_SIZE", DEFAULT_BLOCK_SIZE)?;
        if block_size == 0 {
            bail!("REPROXY_BLOCK_SIZE must be greater than zero.");
        }

        let defaults = StreamBuffers::default();
        let buffers = StreamBuffers {
            read_capacity: parse_or(&lookup, "REPROXY_READ_BUFFER_SIZE", defaults.read_capacity)?,
            write_capacity: parse_or(
                &lookup,
                "REPROXY_WRITE_BUFFER_SIZE",
                defaults.write_capacity,
            )?,
        };
        // A short write can push back up to a whole block.
        if buffers.read_capacity < block_size {
            bail!(
                "REPROXY_READ_BUFFER_SIZE ({}) must be at least REPROXY_BLOCK_SIZE ({block_size}).",
                buffers.read_capacity
            );
        }
        if buffers.write_capacity == 0 {
            bail!("REPROXY_WRITE_BUFFER_SIZE must be greater than zero.");
        }

        let connect_timeout = parse_millis(&lookup, "REPROXY_CONNECT_TIMEOUT_MS", DEFAULT_CONNECT_TIMEOUT)?;
        let acquire_timeout = parse_millis(
            &lookup,
            "REPROXY_ACQUIRE_TIMEOUT_MS",
            DEFAULT_BRIDGE_ACQUIRE_TIMEOUT,
        )?;
        let bridge_idle_timeout = parse_millis(
            &lookup,
            "REPROXY_BRIDGE_IDLE_TIMEOUT_MS",
            DEFAULT_BRIDGE_IDLE_TIMEOUT,
        )?;

        let max_connections =
            parse_or(&lookup, "REPROXY_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?.max(1);

        let log_level = lookup("REPROXY_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            backends,
            min_pool_size,
            max_pool_size,
            block_size,
            buffers,
            connect_timeout,
            acquire_timeout,
            bridge_idle_timeout,
            max_connections,
            log_level,
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            pool: PoolConfig::new(self.min_pool_size, self.max_pool_size)
                .with_idle_timeout(self.bridge_idle_timeout),
            buffers: self.buffers,
            relay: RelayConfig {
                block_size: self.block_size,
                teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
            },
            backoff: BackoffPolicy::default(),
            bridge_acquire_timeout: self.acquire_timeout,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.listen_addr);
        config.max_connections = self.max_connections;
        config.buffers = self.buffers;
        config
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .ok()
            .with_context(|| format!("{key} must be a non-negative integer.")),
        None => Ok(default),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration> {
    let ms = parse_or(lookup, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}
