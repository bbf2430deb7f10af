//! Stream error taxonomy.

use std::io;

use thiserror::Error;

/// Errors produced by the buffered stream decorators.
#[derive(Debug, Error)]
pub enum StreamError {
    /// No data can be produced right now (frozen stream or empty source).
    #[error("operation would block")]
    WouldBlock,

    /// `unread` would overflow the pending buffer.
    #[error("buffer is full: {requested} bytes requested, {available} available")]
    BufferFull { requested: usize, available: usize },

    /// The stream was closed, possibly while a read was outstanding.
    #[error("stream is closed")]
    Closed,

    /// Failure reported by the underlying source or sink.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl StreamError {
    /// Whether the caller may simply retry later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StreamError::WouldBlock)
    }
}

impl From<StreamError> for io::Error {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::WouldBlock => io::Error::from(io::ErrorKind::WouldBlock),
            StreamError::Closed => io::Error::new(io::ErrorKind::NotConnected, "stream is closed"),
            StreamError::Io(e) => e,
            full @ StreamError::BufferFull { .. } => io::Error::other(full),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_io_error_kinds() {
        let e: io::Error = StreamError::WouldBlock.into();
        assert_eq!(e.kind(), io::ErrorKind::WouldBlock);

        let e: io::Error = StreamError::Closed.into();
        assert_eq!(e.kind(), io::ErrorKind::NotConnected);

        let e: io::Error = StreamError::BufferFull {
            requested: 10,
            available: 4,
        }
        .into();
        assert_eq!(e.kind(), io::ErrorKind::Other);
        assert!(e.to_string().contains("10 bytes requested"));
    }

    #[test]
    fn test_transient() {
        assert!(StreamError::WouldBlock.is_transient());
        assert!(!StreamError::Closed.is_transient());
    }
}
