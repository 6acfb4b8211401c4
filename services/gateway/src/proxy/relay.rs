//! Byte relay between an identified client and its backend.
//!
//! Two copy loops share one idle clock. Each loop writes a chunk fully
//! before reading the next, so a slow peer stalls the fast one through TCP
//! backpressure instead of growing a buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;

use crate::error::{GatewayError, Side};

use super::connection::ConnectionState;

/// Per-direction buffer size.
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Bytes moved in each direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub to_backend: u64,
    pub from_backend: u64,
}

/// Last-activity clock and byte counters shared by both copy loops.
#[derive(Debug)]
pub struct Activity {
    started: Instant,
    last_active_ms: AtomicU64,
    to_backend: AtomicU64,
    from_backend: AtomicU64,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            last_active_ms: AtomicU64::new(0),
            to_backend: AtomicU64::new(0),
            from_backend: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_active_ms.fetch_max(now, Ordering::Relaxed);
    }

    /// Time since either direction last moved bytes.
    pub fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            to_backend: self.to_backend.load(Ordering::Relaxed),
            from_backend: self.from_backend.load(Ordering::Relaxed),
        }
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Relay until both directions reach EOF, either leg fails, or the
/// connection is idle for `idle_timeout`.
///
/// EOF on one leg half-closes the other. Any error returns immediately;
/// the caller drops both streams, which closes both legs. Byte counts are
/// kept in `activity` and stay readable after an error.
pub async fn relay(
    client: &mut TcpStream,
    backend: &mut TcpStream,
    idle_timeout: Option<Duration>,
    activity: &Activity,
) -> Result<RelayStats, GatewayError> {
    activity.touch();
    let (mut client_read, mut client_write) = client.split();
    let (mut backend_read, mut backend_write) = backend.split();

    let upstream = copy_half(
        &mut client_read,
        &mut backend_write,
        Side::Client,
        Side::Backend,
        &activity.to_backend,
        activity,
    );
    let downstream = copy_half(
        &mut backend_read,
        &mut client_write,
        Side::Backend,
        Side::Client,
        &activity.from_backend,
        activity,
    );
    tokio::pin!(upstream);
    tokio::pin!(downstream);

    let mut upstream_done = false;
    let mut downstream_done = false;

    while !(upstream_done && downstream_done) {
        let idle = async {
            match idle_timeout {
                Some(limit) => tokio::time::sleep(limit.saturating_sub(activity.idle_for())).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = &mut upstream, if !upstream_done => {
                result?;
                upstream_done = true;
            }
            result = &mut downstream, if !downstream_done => {
                result?;
                downstream_done = true;
            }
            _ = idle => {
                if let Some(limit) = idle_timeout {
                    if activity.idle_for() >= limit {
                        return Err(GatewayError::Timeout {
                            phase: ConnectionState::Relaying,
                        });
                    }
                }
            }
        }
    }

    Ok(activity.stats())
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    from: Side,
    to: Side,
    counter: &AtomicU64,
    activity: &Activity,
) -> Result<(), GatewayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|source| GatewayError::Io { side: from, source })?;
        if n == 0 {
            break;
        }
        activity.touch();
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|source| GatewayError::Io { side: to, source })?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }

    // Propagate the half-close.
    writer
        .shutdown()
        .await
        .map_err(|source| GatewayError::Io { side: to, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_relay_half_close_and_counts() {
        // client_peer <-> [client | backend] <-> backend_peer
        let (mut client_peer, mut client) = pair().await;
        let (mut backend, mut backend_peer) = pair().await;

        let relay_task = tokio::spawn(async move {
            let activity = Activity::new();
            relay(&mut client, &mut backend, None, &activity).await
        });

        client_peer.write_all(b"hello").await.unwrap();
        client_peer.shutdown().await.unwrap();

        let mut received = Vec::new();
        backend_peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello");

        // The other direction still works after the half-close.
        backend_peer.write_all(b"world!").await.unwrap();
        backend_peer.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client_peer.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"world!");

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(
            stats,
            RelayStats {
                to_backend: 5,
                from_backend: 6
            }
        );
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (_client_peer, mut client) = pair().await;
        let (mut backend, _backend_peer) = pair().await;

        let activity = Activity::new();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            relay(&mut client, &mut backend, Some(Duration::from_millis(50)), &activity),
        )
        .await
        .unwrap();

        assert!(matches!(
            result,
            Err(GatewayError::Timeout {
                phase: ConnectionState::Relaying
            })
        ));
    }

    #[test]
    fn test_activity_idle_clock() {
        let activity = Activity::new();
        activity.touch();
        assert!(activity.idle_for() < Duration::from_secs(1));
        assert_eq!(activity.stats(), RelayStats::default());
    }
}
