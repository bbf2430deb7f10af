//! TCP listener feeding accepted clients to the dispatcher.
//!
//! Concurrency is bounded by a semaphore. The permit travels with the client
//! stream, so a slot is only freed once the dispatcher drops the connection
//! (rejection, acquisition timeout, or pair teardown).

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use reproxy_stream::{Connection, StreamBuffers};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn, Instrument};

use super::dispatcher::DispatcherHandle;

/// Default maximum concurrent client connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Buffer sizes for accepted client connections.
    pub buffers: StreamBuffers,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            buffers: StreamBuffers::default(),
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently held (queued or bridged).
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections the dispatcher refused.
    pub dispatch_failed: AtomicU64,
}

/// A TCP listener for the proxy.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    dispatcher: DispatcherHandle,
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
}

impl Listener {
    pub async fn bind(config: ListenerConfig, dispatcher: DispatcherHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            dispatcher,
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Accept connections until the task is dropped.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(peer_addr = %peer_addr, "Connection rejected: max connections reached");
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                    }

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let stream = PermitStream {
                        inner: stream,
                        stats: Arc::clone(&self.stats),
                        _permit: permit,
                    };
                    let conn = Connection::from_stream(stream, self.config.buffers);
                    let listener = Arc::clone(&self);

                    tokio::spawn(
                        async move {
                            match listener.dispatcher.accept(conn).await {
                                Ok(client_id) => {
                                    debug!(client_id = %client_id, "Client handed to dispatcher");
                                }
                                Err(e) => {
                                    listener
                                        .stats
                                        .dispatch_failed
                                        .fetch_add(1, Ordering::Relaxed);
                                    debug!(error = %e, "Client not dispatched");
                                }
                            }
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Client stream holding its connection slot until dropped.
struct PermitStream {
    inner: TcpStream,
    stats: Arc<ListenerStats>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PermitStream {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

impl AsyncRead for PermitStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PermitStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
