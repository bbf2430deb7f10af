mod harness;

use std::sync::atomic::Ordering;
use std::time::Duration;

use harness::{test_config, try_roundtrip, wait_for, ProxyHandle, TcpEchoBackend};
use reproxy::PoolConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::test]
async fn echo_round_trip_through_bridge() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(test_config(PoolConfig::new(1, 2))).await.unwrap();
    proxy.add_backend(backend.addr).await;

    let reply = try_roundtrip(proxy.listen_addr, b"hello").await;
    assert_eq!(reply.unwrap(), b"hello");

    let stats = proxy.stats().await;
    assert_eq!(stats.clients_accepted, 1);
    assert_eq!(stats.clients_bridged, 1);
}

#[tokio::test]
async fn sequential_clients_recycle_bridge_slots() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(test_config(PoolConfig::new(1, 2))).await.unwrap();
    proxy.add_backend(backend.addr).await;

    for i in 0..5u8 {
        let payload = [b'a' + i; 4];
        let reply = try_roundtrip(proxy.listen_addr, &payload).await;
        assert_eq!(reply.unwrap(), payload, "client {}", i);
    }

    let p = &proxy;
    assert!(wait_for(Duration::from_secs(2), move || async move { p.stats().await.pairs_closed == 5 }).await);

    let stats = proxy.stats().await;
    assert_eq!(stats.clients_bridged, 5);
    assert_eq!(stats.active_pairs, 0);
    assert_eq!(stats.bytes_up, 20);
    assert_eq!(stats.bytes_down, 20);
    assert_eq!(backend.bytes_received.load(Ordering::Relaxed), 20);
}

#[tokio::test]
async fn large_payload_survives_short_writes() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let proxy = ProxyHandle::spawn(test_config(PoolConfig::new(1, 2))).await.unwrap();
    proxy.add_backend(backend.addr).await;

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let (mut read_half, mut write_half) = stream.into_split();

    let to_send = payload.clone();
    let writer = tokio::spawn(async move {
        write_half.write_all(&to_send).await.unwrap();
        write_half
    });

    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), read_half.read_exact(&mut echoed))
        .await
        .expect("echo in time")
        .unwrap();
    let _write_half = writer.await.unwrap();

    assert!(echoed == payload, "echoed bytes differ");
}

#[tokio::test]
async fn round_robin_across_backends() {
    let a = TcpEchoBackend::spawn_tagged("A:").await.unwrap();
    let b = TcpEchoBackend::spawn_tagged("B:").await.unwrap();
    let proxy = ProxyHandle::spawn(test_config(PoolConfig::new(1, 2))).await.unwrap();
    proxy.add_backend(a.addr).await;
    proxy.add_backend(b.addr).await;

    let (a_ref, b_ref) = (&a, &b);
    assert!(
        wait_for(Duration::from_secs(2), move || async move {
            a_ref.connection_count() >= 1 && b_ref.connection_count() >= 1
        })
        .await
    );

    let mut served = Vec::new();
    for round in 0..4u64 {
        // Each backend has a free bridge again before the next client.
        let expected = 1 + round / 2;
        assert!(
            wait_for(Duration::from_secs(2), move || async move {
                a_ref.connection_count() >= expected && b_ref.connection_count() >= expected
            })
            .await
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = TcpStream::connect(proxy.listen_addr).await.unwrap();
        stream.write_all(b"x").await.unwrap();
        let mut reply = [0u8; 3];
        timeout(Duration::from_secs(2), stream.read_exact(&mut reply))
            .await
            .expect("reply in time")
            .unwrap();
        served.push(reply[0]);
        drop(stream);

        let p = &proxy;
        assert!(wait_for(Duration::from_secs(2), move || async move { p.stats().await.active_pairs == 0 }).await);
    }

    assert_eq!(served, b"ABAB");
}

#[tokio::test]
async fn client_rejected_without_backends() {
    let proxy = ProxyHandle::spawn(test_config(PoolConfig::default())).await.unwrap();

    let result = try_roundtrip(proxy.listen_addr, b"anyone").await;
    assert!(result.is_err());

    let stats = proxy.stats().await;
    assert_eq!(stats.clients_rejected, 1);
    assert_eq!(stats.clients_bridged, 0);
}

#[tokio::test]
async fn shutdown_closes_waiting_clients() {
    let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);

    let mut config = test_config(PoolConfig::new(1, 1));
    config.bridge_acquire_timeout = Duration::from_secs(30);
    let proxy = ProxyHandle::spawn(config).await.unwrap();
    proxy.add_backend(dead_addr).await;

    let mut client = TcpStream::connect(proxy.listen_addr).await.unwrap();
    let p = &proxy;
    assert!(wait_for(Duration::from_secs(2), move || async move { p.stats().await.pending_clients == 1 }).await);

    let dispatcher = proxy.dispatcher.clone();
    proxy.shutdown().await;

    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(2), client.read(&mut buf))
        .await
        .expect("client closed in time");
    assert!(matches!(read, Ok(0) | Err(_)));
    assert!(dispatcher.stats().await.is_err());
}
