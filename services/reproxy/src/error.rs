//! Error types for the proxy service.

use std::io;

use reproxy_stream::StreamError;
use thiserror::Error;

use crate::proxy::BackendId;

/// Errors surfaced by the dispatcher, backend pools and relays.
#[derive(Debug, Error)]
pub enum ReproxyError {
    /// A bridge could not be connected to its backend.
    #[error("failed to connect to backend {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    /// The backend handle does not belong to this dispatcher.
    #[error("unknown backend: {0}")]
    UnknownBackend(BackendId),

    /// A client arrived while no backend was configured.
    #[error("no backends configured")]
    NoBackends,

    /// Settings that cannot work together.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The dispatcher task is gone.
    #[error("dispatcher has stopped")]
    DispatcherStopped,

    /// Buffered stream failure (closed stream, unread overflow).
    #[error(transparent)]
    Stream(#[from] StreamError),

    /// Transport failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl ReproxyError {
    /// Whether this error is an unread overflow on a relay buffer.
    pub fn is_buffer_full(&self) -> bool {
        matches!(self, ReproxyError::Stream(StreamError::BufferFull { .. }))
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ReproxyError>;
