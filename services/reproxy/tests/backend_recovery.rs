mod harness;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use harness::{test_config, try_roundtrip, wait_for, ProxyHandle, TcpEchoBackend};
use reproxy::PoolConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Echo backend that hangs up on any connection silent for `idle`.
async fn spawn_impatient_backend(idle: Duration) -> (SocketAddr, Arc<AtomicU64>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&connections);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1024];
                loop {
                    match tokio::time::timeout(idle, stream.read(&mut buf)).await {
                        Ok(Ok(n)) if n > 0 => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
            });
        }
    });

    (addr, connections)
}

#[tokio::test]
async fn clients_served_once_dead_backend_comes_up() {
    let temp_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = temp_listener.local_addr().unwrap();
    drop(temp_listener);

    let proxy = ProxyHandle::spawn(test_config(PoolConfig::new(1, 1))).await.unwrap();
    proxy.add_backend(dead_addr).await;

    // No bridge can be acquired; the client is closed after the acquisition timeout.
    let result1 = try_roundtrip(proxy.listen_addr, b"test1").await;
    assert!(result1.is_err(), "Connection should fail - no backend");
    assert_eq!(proxy.stats().await.clients_rejected, 1);

    // Reconnects keep running with backoff while the pool is below min_size.
    let backend = TcpEchoBackend::spawn_at(dead_addr, "").await.unwrap();
    let b = &backend;
    assert!(
        wait_for(Duration::from_secs(3), move || async move { b.connection_count() >= 1 }).await,
        "Pool should reconnect to the recovered backend"
    );

    let result2 = try_roundtrip(proxy.listen_addr, b"test2").await;
    match result2 {
        Ok(data) => assert_eq!(data, b"test2", "Backend should echo after recovery"),
        Err(e) => panic!("Connection after recovery should succeed: {}", e),
    }
}

#[tokio::test]
async fn removed_backend_receives_no_clients() {
    let a = TcpEchoBackend::spawn_tagged("A:").await.unwrap();
    let b = TcpEchoBackend::spawn_tagged("B:").await.unwrap();
    let proxy = ProxyHandle::spawn(test_config(PoolConfig::new(1, 2))).await.unwrap();
    let handle_a = proxy.add_backend(a.addr).await;
    proxy.add_backend(b.addr).await;

    proxy.dispatcher.remove_backend(handle_a).await.unwrap();
    assert!(proxy.dispatcher.remove_backend(handle_a).await.is_err());
    assert_eq!(proxy.stats().await.backends, 1);

    for _ in 0..3 {
        let reply = try_roundtrip(proxy.listen_addr, b"x").await.unwrap();
        assert_eq!(&reply[..1], b"B");

        let p = &proxy;
        assert!(wait_for(Duration::from_secs(2), move || async move { p.stats().await.active_pairs == 0 }).await);
    }
}

#[tokio::test]
async fn idle_bridges_closed_by_backend_are_replaced() {
    let (addr, connections) = spawn_impatient_backend(Duration::from_millis(300)).await;
    let proxy = ProxyHandle::spawn(test_config(PoolConfig::new(1, 1))).await.unwrap();
    proxy.add_backend(addr).await;

    // The backend hangs up on the first bridge; the pool must notice and reconnect.
    let c = &connections;
    assert!(
        wait_for(Duration::from_secs(3), move || async move { c.load(Ordering::Relaxed) >= 2 }).await,
        "Pool should replace the bridge the backend closed"
    );

    let reply = try_roundtrip(proxy.listen_addr, b"still here").await.unwrap();
    assert_eq!(reply, b"still here");
}
