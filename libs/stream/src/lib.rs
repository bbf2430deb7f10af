//! Buffered stream decorators for proxied connections.
//!
//! - [`BufferedInputStream`]: unread (pushback), freeze/thaw, close
//! - [`BufferedOutputStream`]: bounded output buffer with a write capacity
//! - [`Connection`]: a byte stream split into [`ConnReader`] / [`ConnWriter`]

pub mod connection;
pub mod error;
pub mod input;
pub mod output;

pub use connection::{
    BoxedStream, ConnReader, ConnWriter, Connection, ConnectionId, Stream, StreamBuffers,
};
pub use error::StreamError;
pub use input::{BufferedInputStream, DEFAULT_READ_BUFFER_SIZE};
pub use output::{BufferedOutputStream, DEFAULT_WRITE_BUFFER_SIZE};
