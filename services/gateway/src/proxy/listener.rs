//! TCP listener and connection lifecycle.
//!
//! Accepts clients, enforces the connection limit, hands each connection to
//! its own task running a [`GatewayConnection`], and drains in-flight
//! connections on shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, field, info, warn, Instrument};

use crate::error::GatewayError;

use super::connection::{ConnectionSummary, Gateway, GatewayConnection};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time in-flight connections get to finish after shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to. Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Drain period before remaining connections are aborted.
    pub shutdown_grace: Duration,
}

impl ListenerConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections finished, whatever the outcome.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// Connections whose protocol was identified.
    pub protocols_identified: AtomicU64,
    /// Connections that relayed and closed cleanly.
    pub relayed: AtomicU64,
    pub protocol_unrecognized: AtomicU64,
    pub decode_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub no_backend: AtomicU64,
    pub backend_unreachable: AtomicU64,
    pub client_closed: AtomicU64,
    pub io_errors: AtomicU64,
    /// Connections cut off before reaching an outcome (shutdown abort).
    pub aborted: AtomicU64,
    /// Bytes proxied to backends, replayed handshake bytes excluded.
    pub bytes_to_backend: AtomicU64,
    /// Bytes proxied from backends.
    pub bytes_from_backend: AtomicU64,
}

impl ListenerStats {
    fn record_outcome(&self, result: &Result<ConnectionSummary, GatewayError>) {
        let counter = match result {
            Ok(_) => &self.relayed,
            Err(GatewayError::ProtocolUnrecognized { .. }) => &self.protocol_unrecognized,
            Err(GatewayError::Decode(_)) => &self.decode_errors,
            Err(GatewayError::Timeout { .. }) => &self.timeouts,
            Err(GatewayError::NoBackend { .. }) => &self.no_backend,
            Err(GatewayError::BackendUnreachable { .. }) => &self.backend_unreachable,
            Err(GatewayError::ClientClosed { .. }) => &self.client_closed,
            Err(GatewayError::Io { .. }) => &self.io_errors,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Releases the connection slot and updates gauges when a connection task
/// ends, including when it is aborted.
struct ConnectionGuard {
    stats: Arc<ListenerStats>,
    permit: Option<OwnedSemaphorePermit>,
    /// Set once the terminal outcome has been recorded.
    finished: bool,
}

impl ConnectionGuard {
    fn new(stats: Arc<ListenerStats>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            stats,
            permit: Some(permit),
            finished: false,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        drop(self.permit.take());
        if !self.finished {
            self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            warn!(
                outcome = "aborted",
                reason = "aborted",
                "Connection aborted before completing"
            );
        }
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        self.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Requests a graceful listener shutdown. Cheap to clone.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Stop accepting and start draining. Idempotent.
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }
}

/// A TCP listener for the gateway.
pub struct Listener {
    config: ListenerConfig,
    listener: TcpListener,
    gateway: Arc<Gateway>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    stats: Arc<ListenerStats>,
    shutdown: ShutdownHandle,
}

impl Listener {
    /// Bind the listener.
    pub async fn bind(config: ListenerConfig, gateway: Arc<Gateway>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            protocols = ?gateway.protocols().names(),
            "Listener bound"
        );

        let (tx, _rx) = watch::channel(false);
        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            gateway,
            stats: Arc::new(ListenerStats::default()),
            shutdown: ShutdownHandle { tx: Arc::new(tx) },
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> Arc<ListenerStats> {
        Arc::clone(&self.stats)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accept and handle connections until shutdown is requested, then
    /// drain.
    pub async fn run(self) -> io::Result<()> {
        let Listener {
            config,
            listener,
            gateway,
            conn_semaphore,
            stats,
            shutdown,
        } = self;

        let local_addr = listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        let mut shutdown_rx = shutdown.tx.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                // The watch guard is not Send; drop it inside the branch.
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => break,

                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection task panicked");
                        }
                    }
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => {
                        // Try to acquire a permit
                        let permit = match Arc::clone(&conn_semaphore).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                                warn!(
                                    peer_addr = %peer_addr,
                                    "Connection rejected: max connections reached"
                                );
                                continue;
                            }
                        };

                        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
                        stats.connections_active.fetch_add(1, Ordering::Relaxed);

                        let mut guard = ConnectionGuard::new(Arc::clone(&stats), permit);
                        let gateway = Arc::clone(&gateway);
                        let span = tracing::info_span!(
                            "connection",
                            peer = %peer_addr,
                            protocol = field::Empty,
                            route = field::Empty,
                            backend = field::Empty,
                        );

                        connections.spawn(
                            async move {
                                let mut connection =
                                    GatewayConnection::new(&gateway, stream, peer_addr);
                                let result = connection.run().await;
                                finish(&guard.stats, &connection, &result);
                                guard.finished = true;
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        // Brief sleep to avoid tight loop on persistent errors
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        // Refuse new connections while draining.
        drop(listener);
        info!(
            in_flight = connections.len(),
            grace_ms = config.shutdown_grace.as_millis() as u64,
            "Listener draining"
        );

        let drained = tokio::time::timeout(config.shutdown_grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "Shutdown grace elapsed, closing remaining connections"
            );
            connections.abort_all();
            while connections.join_next().await.is_some() {}
        }

        info!(bind_addr = %local_addr, "Listener stopped");
        Ok(())
    }
}

/// Record the terminal outcome of one connection.
fn finish(
    stats: &ListenerStats,
    connection: &GatewayConnection<'_>,
    result: &Result<ConnectionSummary, GatewayError>,
) {
    if connection.protocol().is_some() {
        stats.protocols_identified.fetch_add(1, Ordering::Relaxed);
    }
    let relayed = connection.relay_stats();
    stats
        .bytes_to_backend
        .fetch_add(relayed.to_backend, Ordering::Relaxed);
    stats
        .bytes_from_backend
        .fetch_add(relayed.from_backend, Ordering::Relaxed);
    stats.record_outcome(result);

    match result {
        Ok(summary) => info!(
            protocol = summary.protocol,
            route = %summary.route,
            backend = %summary.backend.address,
            bytes_to_backend = summary.relay.to_backend,
            bytes_from_backend = summary.relay.from_backend,
            outcome = "closed",
            "Connection closed"
        ),
        Err(e @ GatewayError::ClientClosed { .. }) => debug!(
            outcome = "failed",
            reason = e.reason_code(),
            error = %e,
            "Connection failed"
        ),
        Err(e) if e.is_expected() => info!(
            outcome = "failed",
            reason = e.reason_code(),
            error = %e,
            "Connection failed"
        ),
        Err(e) => warn!(
            outcome = "failed",
            reason = e.reason_code(),
            error = %e,
            "Connection failed"
        ),
    }
}
