
use std::net::SocketAddr;

use harness::{
    dead_address, read_exactly, read_until_closed, wire, GatewayHandle, GatewayOptions,
    TcpEchoBackend,
};
use mgw_gateway::{Registration, Strategy};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

/// Run one STOMP session through the gateway and close it.
async fn session(gateway: SocketAddr, login: &str) -> std::io::Result<()> {
    let connect = wire::stomp_connect(Some("v"), Some(login));
    let mut client = TcpStream::connect(gateway).await?;
    client.write_all(&connect).await?;
    let echoed = read_exactly(&mut client, connect.len()).await?;
    assert_eq!(echoed, connect);
    client.shutdown().await?;
    read_until_closed(&mut client).await?;
    Ok(())
}

fn counts(backends: &[TcpEchoBackend]) -> Vec<u64> {
    backends.iter().map(|b| b.connection_count()).collect()
}

#[tokio::test]
async fn sticky_client_keeps_backend_across_reconnects() {
    let backends = vec![
        TcpEchoBackend::spawn().await.unwrap(),
        TcpEchoBackend::spawn().await.unwrap(),
        TcpEchoBackend::spawn().await.unwrap(),
    ];
    let gateway = GatewayHandle::spawn().await.unwrap();
    for backend in &backends {
        gateway.register("stomp", Some("v"), backend.addr);
    }

    for _ in 0..5 {
        session(gateway.listen_addr, "alice").await.unwrap();
    }

    let after = counts(&backends);
    assert_eq!(after.iter().sum::<u64>(), 5);
    let chosen = after.iter().position(|c| *c == 5).expect("all sessions on one backend");

    // Deregister the chosen backend: the client moves and sticks again.
    gateway.registry.remove(&Registration::new(
        "stomp",
        Some("v"),
        backends[chosen].addr.to_string(),
    ));
    session(gateway.listen_addr, "alice").await.unwrap();
    session(gateway.listen_addr, "alice").await.unwrap();

    let moved = counts(&backends);
    assert_eq!(moved[chosen], 5);
    let new_home = moved
        .iter()
        .enumerate()
        .position(|(i, c)| i != chosen && *c == 2)
        .expect("both reconnects on one new backend");
    assert_ne!(new_home, chosen);
}

#[tokio::test]
async fn round_robin_spreads_connections() {
    let backends = vec![
        TcpEchoBackend::spawn().await.unwrap(),
        TcpEchoBackend::spawn().await.unwrap(),
    ];
    let gateway = GatewayHandle::spawn_with(GatewayOptions {
        strategy: Strategy::RoundRobin,
        ..GatewayOptions::default()
    })
    .await
    .unwrap();
    for backend in &backends {
        gateway.register("stomp", Some("v"), backend.addr);
    }

    for _ in 0..4 {
        session(gateway.listen_addr, "alice").await.unwrap();
    }
    assert_eq!(counts(&backends), vec![2, 2]);
}

#[tokio::test]
async fn unreachable_backend_fails_over_to_next_candidate() {
    let live = TcpEchoBackend::spawn().await.unwrap();
    let gateway = GatewayHandle::spawn_with(GatewayOptions {
        strategy: Strategy::RoundRobin,
        ..GatewayOptions::default()
    })
    .await
    .unwrap();

    // Round-robin tries the dead registration first.
    gateway.register("stomp", Some("v"), dead_address().await);
    gateway.register("stomp", Some("v"), live.addr);

    session(gateway.listen_addr, "alice").await.unwrap();

    gateway.wait_for_closed(1).await;
    assert_eq!(live.connection_count(), 1);
    assert_eq!(gateway.stat(|s| &s.relayed), 1);
    assert_eq!(gateway.stat(|s| &s.backend_unreachable), 0);
}

#[tokio::test]
async fn failover_is_bounded_by_max_attempts() {
    let live = TcpEchoBackend::spawn().await.unwrap();

    let mut options = GatewayOptions {
        strategy: Strategy::RoundRobin,
        ..GatewayOptions::default()
    };
    options.config.max_connect_attempts = 1;
    let gateway = GatewayHandle::spawn_with(options).await.unwrap();
    gateway.register("stomp", Some("v"), dead_address().await);
    gateway.register("stomp", Some("v"), live.addr);

    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    client
        .write_all(&wire::stomp_connect(Some("v"), None))
        .await
        .unwrap();
    assert!(read_until_closed(&mut client).await.unwrap().is_empty());

    gateway.wait_for_closed(1).await;
    assert_eq!(gateway.stat(|s| &s.backend_unreachable), 1);
    assert_eq!(live.connection_count(), 0);
}

#[tokio::test]
async fn all_backends_unreachable_fails_fast() {
    let gateway = GatewayHandle::spawn().await.unwrap();
    gateway.register("stomp", Some("v"), dead_address().await);
    gateway.register("stomp", Some("v"), dead_address().await);

    let mut client = TcpStream::connect(gateway.listen_addr).await.unwrap();
    client
        .write_all(&wire::stomp_connect(Some("v"), None))
        .await
        .unwrap();
    assert!(read_until_closed(&mut client).await.unwrap().is_empty());

    gateway.wait_for_closed(1).await;
    assert_eq!(gateway.stat(|s| &s.backend_unreachable), 1);
}
