//! Outbound connection factory and connect retry policy.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use reproxy_stream::BoxedStream;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ReproxyError, Result};

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Opens byte streams to backend addresses.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `address` (`host:port`, resolved by the implementation).
    async fn connect(&self, address: &str) -> Result<BoxedStream>;
}

/// TCP connector with a connect timeout.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    pub fn with_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<BoxedStream> {
        debug!(address = %address, "Connecting to backend");

        let stream = match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
        }
        .map_err(|source| ReproxyError::Connect {
            address: address.to_string(),
            source,
        })?;

        if let Err(e) = stream.set_nodelay(true) {
            debug!(address = %address, error = %e, "Failed to set TCP_NODELAY");
        }

        Ok(Box::new(stream))
    }
}

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff for reconnecting failed bridges.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(31) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter = if self.jitter > 0.0 {
            rand::rng().random_range(-1.0..=1.0) * delay * self.jitter
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}
