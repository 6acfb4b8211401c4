
use std::net::SocketAddr;
use std::time::Duration;

use harness::{read_exactly, read_until_closed, wire, GatewayHandle, GatewayOptions, TcpEchoBackend};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Open a session that has reached the relay phase.
async fn relaying_client(gateway: SocketAddr) -> TcpStream {
    let connect = wire::stomp_connect(Some("v"), None);
    let mut client = TcpStream::connect(gateway).await.unwrap();
    client.write_all(&connect).await.unwrap();
    assert_eq!(read_exactly(&mut client, connect.len()).await.unwrap(), connect);
    client
}

#[tokio::test]
async fn connections_over_limit_are_rejected() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn_with(GatewayOptions {
        max_connections: 1,
        ..GatewayOptions::default()
    })
    .await
    .unwrap();
    gateway.register("stomp", Some("v"), backend.addr);

    let first = relaying_client(gateway.listen_addr).await;

    let mut second = TcpStream::connect(gateway.listen_addr).await.unwrap();
    assert!(read_until_closed(&mut second).await.unwrap().is_empty());
    assert_eq!(gateway.stat(|s| &s.connections_rejected), 1);

    // The slot frees up once the first connection ends.
    drop(first);
    gateway.wait_for_closed(1).await;
    let _third = relaying_client(gateway.listen_addr).await;
    assert_eq!(gateway.stat(|s| &s.connections_accepted), 2);
}

#[tokio::test]
async fn idle_relay_is_closed() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let mut options = GatewayOptions::default();
    options.config.idle_timeout = Some(Duration::from_millis(200));
    let gateway = GatewayHandle::spawn_with(options).await.unwrap();
    gateway.register("stomp", Some("v"), backend.addr);

    let mut client = relaying_client(gateway.listen_addr).await;
    assert!(read_until_closed(&mut client).await.unwrap().is_empty());

    gateway.wait_for_closed(1).await;
    assert_eq!(gateway.stat(|s| &s.timeouts), 1);
}

#[tokio::test]
async fn shutdown_drains_in_flight_connections() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn().await.unwrap();
    gateway.register("stomp", Some("v"), backend.addr);

    let mut client = relaying_client(gateway.listen_addr).await;
    gateway.shutdown.shutdown();

    // New connections are refused once the listener stops.
    timeout(Duration::from_secs(2), async {
        while TcpStream::connect(gateway.listen_addr).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener still accepting after shutdown");

    // The in-flight connection keeps relaying during the grace period.
    client.write_all(b"PING").await.unwrap();
    assert_eq!(read_exactly(&mut client, 4).await.unwrap(), b"PING");

    client.shutdown().await.unwrap();
    read_until_closed(&mut client).await.unwrap();

    let result = timeout(Duration::from_secs(5), gateway.task).await.unwrap();
    assert!(result.unwrap().is_ok());
}

#[tokio::test]
async fn shutdown_closes_connections_after_grace() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn_with(GatewayOptions {
        shutdown_grace: Duration::from_millis(200),
        ..GatewayOptions::default()
    })
    .await
    .unwrap();
    gateway.register("stomp", Some("v"), backend.addr);

    let mut client = relaying_client(gateway.listen_addr).await;
    gateway.shutdown.shutdown();

    // The gateway closes the idle session itself once the grace elapses.
    assert!(read_until_closed(&mut client).await.unwrap().is_empty());

    let stats = gateway.stats.clone();
    let result = timeout(Duration::from_secs(5), gateway.task).await.unwrap();
    assert!(result.unwrap().is_ok());
    assert_eq!(stats.connections_active.load(std::sync::atomic::Ordering::Relaxed), 0);
    assert_eq!(stats.aborted.load(std::sync::atomic::Ordering::Relaxed), 1);
}
