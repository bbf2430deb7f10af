//! Test harness for proxy integration tests.
//!
//! Provides TCP echo backends and a running proxy (dispatcher + listener)
//! bound to loopback.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use reproxy::proxy::{BackoffPolicy, DispatcherStats};
use reproxy::{
    BackendHandle, Dispatcher, DispatcherConfig, DispatcherHandle, Listener, ListenerConfig,
    PoolConfig, TcpConnector,
};

/// Echo server; every reply is prefixed with `marker` when one is set.
#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_at("127.0.0.1:0".parse().unwrap(), "").await
    }

    pub async fn spawn_tagged(marker: &str) -> io::Result<Self> {
        Self::spawn_at("127.0.0.1:0".parse().unwrap(), marker).await
    }

    pub async fn spawn_at(addr: SocketAddr, marker: &str) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));
        let bytes_received = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);
        let bytes_clone = Arc::clone(&bytes_received);
        let marker = marker.as_bytes().to_vec();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                let bytes = Arc::clone(&bytes_clone);
                                let marker = marker.clone();
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                bytes.fetch_add(n as u64, Ordering::Relaxed);
                                                if stream.write_all(&marker).await.is_err() {
                                                    break;
                                                }
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            bytes_received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running proxy on loopback.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub dispatcher: DispatcherHandle,
    pub listener: Arc<Listener>,
    dispatcher_task: Option<JoinHandle<()>>,
    listener_task: JoinHandle<()>,
}

#[allow(dead_code)]
impl ProxyHandle {
    pub async fn spawn(config: DispatcherConfig) -> io::Result<Self> {
        let connector = Arc::new(TcpConnector::with_timeout(Duration::from_millis(500)));
        let dispatcher = Dispatcher::new(config, connector).map_err(io::Error::other)?;
        let (dispatcher, dispatcher_task) = dispatcher.spawn();

        let listener_config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        let listener = Arc::new(Listener::bind(listener_config, dispatcher.clone()).await?);
        let listen_addr = listener.local_addr()?;

        let run = Arc::clone(&listener);
        let listener_task = tokio::spawn(async move {
            let _ = run.run().await;
        });

        Ok(Self {
            listen_addr,
            dispatcher,
            listener,
            dispatcher_task: Some(dispatcher_task),
            listener_task,
        })
    }

    pub async fn add_backend(&self, addr: SocketAddr) -> BackendHandle {
        self.dispatcher
            .add_backend(addr.to_string())
            .await
            .expect("dispatcher running")
    }

    pub async fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats().await.expect("dispatcher running")
    }

    pub async fn shutdown(mut self) {
        self.dispatcher.shutdown().await;
        if let Some(task) = self.dispatcher_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ProxyHandle {
    fn drop(&mut self) {
        self.listener_task.abort();
        if let Some(task) = self.dispatcher_task.take() {
            task.abort();
        }
    }
}

/// Dispatcher config tuned for fast tests.
#[allow(dead_code)]
pub fn test_config(pool: PoolConfig) -> DispatcherConfig {
    DispatcherConfig {
        pool,
        backoff: BackoffPolicy {
            base: Duration::from_millis(50),
            max: Duration::from_millis(200),
            jitter: 0.0,
        },
        bridge_acquire_timeout: Duration::from_millis(300),
        maintenance_interval: Duration::from_millis(50),
        ..DispatcherConfig::default()
    }
}

/// Send `payload` through the proxy and read one reply.
#[allow(dead_code)]
pub async fn try_roundtrip(addr: SocketAddr, payload: &[u8]) -> Result<Vec<u8>, &'static str> {
    let result = timeout(Duration::from_secs(2), async {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_all(payload).await?;
        stream.flush().await?;
        let mut buf = vec![0u8; 256];
        let n = stream.read(&mut buf).await?;
        Ok::<_, io::Error>(buf[..n].to_vec())
    })
    .await;

    match result {
        Ok(Ok(data)) if !data.is_empty() => Ok(data),
        Ok(Ok(_)) => Err("connection closed"),
        Ok(Err(_)) => Err("io error"),
        Err(_) => Err("timeout"),
    }
}

/// Poll `check` until it holds or `deadline` passes.
#[allow(dead_code)]
pub async fn wait_for<F, Fut>(deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
