//! Per-connection orchestration.
//!
//! A [`GatewayConnection`] walks one accepted client through
//! `Identifying -> Snooping -> Selecting -> Connecting -> Relaying`. Every
//! byte read from the client before relaying is kept and replayed to the
//! backend first, so the backend sees exactly the stream the client sent.
//! Any error is terminal and moves the connection to `Failed`.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mgw_protocol::{
    BackendPrelude, ConnectionParameters, Identification, Protocol, ProtocolSet, SnoopOptions,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn, Span};

use crate::error::GatewayError;

use super::balancer::LoadBalancer;
use super::registry::{RouteKey, ServiceEndpoint, SharedRegistry};
use super::relay::{relay, Activity, RelayStats};

/// Default deadline for identification and snooping together.
pub const DEFAULT_SNOOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default backend connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of candidates tried before giving up.
pub const DEFAULT_MAX_CONNECT_ATTEMPTS: usize = 3;

/// Read size while waiting for the rest of a handshake.
const SNOOP_READ_SIZE: usize = 4096;

/// Lifecycle of one gateway connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Accepting,
    Identifying,
    Snooping,
    Selecting,
    Connecting,
    Relaying,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Accepting => "accepting",
            ConnectionState::Identifying => "identifying",
            ConnectionState::Snooping => "snooping",
            ConnectionState::Selecting => "selecting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Relaying => "relaying",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestration settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Frame limits and default virtual host handed to snoopers.
    pub snoop: SnoopOptions,
    /// Shared deadline for identification and snooping.
    pub snoop_timeout: Duration,
    pub connect_timeout: Duration,
    /// Relay idle limit across both directions. `None` relays forever.
    pub idle_timeout: Option<Duration>,
    /// Candidates tried per connection, at least one.
    pub max_connect_attempts: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            snoop: SnoopOptions::default(),
            snoop_timeout: DEFAULT_SNOOP_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            idle_timeout: None,
            max_connect_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
        }
    }
}

/// State shared by every connection of a listener.
pub struct Gateway {
    protocols: ProtocolSet,
    registry: SharedRegistry,
    balancer: Arc<dyn LoadBalancer>,
    config: GatewayConfig,
}

impl Gateway {
    pub fn new(
        protocols: ProtocolSet,
        registry: SharedRegistry,
        balancer: Arc<dyn LoadBalancer>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            protocols,
            registry,
            balancer,
            config,
        }
    }

    pub fn protocols(&self) -> &ProtocolSet {
        &self.protocols
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.registry
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }
}

/// What a connection that reached relaying did.
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub protocol: &'static str,
    pub route: RouteKey,
    pub backend: ServiceEndpoint,
    pub relay: RelayStats,
}

/// Identity used for sticky selection: user, then client id, then the peer
/// IP. The port is left out so reconnects keep their backend.
pub fn client_key(params: &ConnectionParameters, peer: &SocketAddr) -> String {
    params
        .user
        .clone()
        .or_else(|| params.client_id.clone())
        .unwrap_or_else(|| peer.ip().to_string())
}

/// One accepted client connection.
pub struct GatewayConnection<'g> {
    gateway: &'g Gateway,
    client: TcpStream,
    peer: SocketAddr,
    state: ConnectionState,
    /// Every client byte read before relaying, in arrival order.
    buffered: Vec<u8>,
    protocol: Option<&'static str>,
    activity: Activity,
}

impl<'g> GatewayConnection<'g> {
    pub fn new(gateway: &'g Gateway, client: TcpStream, peer: SocketAddr) -> Self {
        Self {
            gateway,
            client,
            peer,
            state: ConnectionState::Accepting,
            buffered: Vec::new(),
            protocol: None,
            activity: Activity::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The identified protocol, once known.
    pub fn protocol(&self) -> Option<&'static str> {
        self.protocol
    }

    /// Bytes relayed so far. Valid after a relay error too.
    pub fn relay_stats(&self) -> RelayStats {
        self.activity.stats()
    }

    /// Drive the connection to a terminal state.
    pub async fn run(&mut self) -> Result<ConnectionSummary, GatewayError> {
        let result = self.drive().await;
        match &result {
            Ok(_) => self.transition(ConnectionState::Closed),
            Err(_) => self.transition(ConnectionState::Failed),
        }
        result
    }

    fn transition(&mut self, next: ConnectionState) {
        trace!(from = %self.state, to = %next, "Connection state");
        self.state = next;
    }

    async fn drive(&mut self) -> Result<ConnectionSummary, GatewayError> {
        let gateway = self.gateway;
        let config = &gateway.config;
        let deadline = Instant::now() + config.snoop_timeout;

        self.transition(ConnectionState::Identifying);
        let protocol = self.identify(deadline).await?;
        self.protocol = Some(protocol.name());
        Span::current().record("protocol", protocol.name());
        debug!(
            protocol = protocol.name(),
            buffered = self.buffered.len(),
            "Protocol identified"
        );

        self.transition(ConnectionState::Snooping);
        let (params, prelude) = self.snoop(protocol.as_ref(), deadline).await?;
        let route = RouteKey::new(params.protocol.clone(), params.virtual_host.clone());
        Span::current().record("route", tracing::field::display(&route));
        debug!(
            %route,
            user = params.user.as_deref(),
            client_id = params.client_id.as_deref(),
            "Connection parameters snooped"
        );

        let key = client_key(&params, &self.peer);
        let (mut backend, endpoint) = self.select_and_connect(&route, &key).await?;
        Span::current().record("backend", endpoint.address.as_str());

        backend
            .write_all(&self.buffered)
            .await
            .map_err(GatewayError::backend_io)?;
        trace!(bytes = self.buffered.len(), "Replayed buffered client bytes");

        if !prelude.is_empty() {
            let limit = config.snoop.limits.max_body_length;
            timeout(config.connect_timeout, discard_prelude(&mut backend, prelude, limit))
                .await
                .map_err(|_| GatewayError::Timeout {
                    phase: ConnectionState::Connecting,
                })?
                .map_err(GatewayError::backend_io)?;
        }

        self.buffered = Vec::new();
        self.transition(ConnectionState::Relaying);
        let idle_timeout = config.idle_timeout;
        let stats = relay(&mut self.client, &mut backend, idle_timeout, &self.activity).await?;

        Ok(ConnectionSummary {
            protocol: protocol.name(),
            route,
            backend: endpoint,
            relay: stats,
        })
    }

    /// Buffer client bytes until a protocol matches. Never reads past the
    /// identification budget.
    async fn identify(&mut self, deadline: Instant) -> Result<Arc<dyn Protocol>, GatewayError> {
        let gateway = self.gateway;
        let protocols = &gateway.protocols;
        let budget = protocols.identification_budget();

        loop {
            match protocols.identify(&self.buffered) {
                Identification::Matched(protocol) => return Ok(protocol),
                Identification::Unmatched => {
                    return Err(GatewayError::ProtocolUnrecognized {
                        buffered: self.buffered.len(),
                    })
                }
                Identification::NeedMoreBytes => {}
            }

            if self.buffered.len() >= budget {
                return Err(GatewayError::ProtocolUnrecognized {
                    buffered: self.buffered.len(),
                });
            }
            self.read_client(budget - self.buffered.len(), deadline).await?;
        }
    }

    /// Run the protocol's snooper over the buffered bytes and further reads.
    async fn snoop(
        &mut self,
        protocol: &dyn Protocol,
        deadline: Instant,
    ) -> Result<(ConnectionParameters, BackendPrelude), GatewayError> {
        let mut snooper = protocol.new_snooper(&self.gateway.config.snoop);
        let mut reply = Vec::new();
        let mut fed = 0;

        loop {
            let result = snooper.feed(&self.buffered[fed..], &mut reply)?;
            fed = self.buffered.len();

            if !reply.is_empty() {
                timeout_at(deadline, self.client.write_all(&reply))
                    .await
                    .map_err(|_| GatewayError::Timeout {
                        phase: self.state,
                    })?
                    .map_err(GatewayError::client_io)?;
                trace!(bytes = reply.len(), "Sent handshake reply");
                reply.clear();
            }

            if let Some(params) = result {
                return Ok((params, snooper.backend_prelude()));
            }
            self.read_client(SNOOP_READ_SIZE, deadline).await?;
        }
    }

    /// Pick and connect to a backend, failing over to the remaining
    /// candidates of the same set.
    async fn select_and_connect(
        &mut self,
        route: &RouteKey,
        client_key: &str,
    ) -> Result<(TcpStream, ServiceEndpoint), GatewayError> {
        let gateway = self.gateway;
        let config = &gateway.config;
        let mut candidates = gateway.registry.lookup(route);
        let mut last_error = None;

        for attempt in 1..=config.max_connect_attempts.max(1) {
            self.transition(ConnectionState::Selecting);
            let endpoint = match gateway.balancer.select(route, &candidates, client_key) {
                Ok(endpoint) => endpoint,
                Err(_) => break,
            };

            self.transition(ConnectionState::Connecting);
            let connected = tokio::select! {
                result = connect(&endpoint.address, config.connect_timeout) => result,
                closed = client_hangup(&self.client) => {
                    closed.map_err(GatewayError::client_io)?;
                    return Err(GatewayError::ClientClosed {
                        phase: ConnectionState::Connecting,
                    });
                }
            };
            match connected {
                Ok(stream) => {
                    debug!(backend = %endpoint.address, attempt, "Connected to backend");
                    return Ok((stream, endpoint));
                }
                Err(e) => {
                    warn!(
                        backend = %endpoint.address,
                        attempt,
                        error = %e,
                        "Backend connection failed"
                    );
                    candidates.retain(|c| *c != endpoint);
                    last_error = Some(GatewayError::BackendUnreachable {
                        address: endpoint.address,
                        reason: e.to_string(),
                    });
                }
            }
        }

        Err(last_error.unwrap_or_else(|| GatewayError::NoBackend {
            route: route.clone(),
        }))
    }

    /// Read up to `max` more client bytes into the buffer.
    async fn read_client(&mut self, max: usize, deadline: Instant) -> Result<(), GatewayError> {
        let start = self.buffered.len();
        self.buffered.resize(start + max, 0);

        let read = timeout_at(deadline, self.client.read(&mut self.buffered[start..])).await;
        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                self.buffered.truncate(start);
                return Err(GatewayError::client_io(e));
            }
            Err(_) => {
                self.buffered.truncate(start);
                return Err(GatewayError::Timeout { phase: self.state });
            }
        };

        self.buffered.truncate(start + n);
        if n == 0 {
            return Err(GatewayError::ClientClosed { phase: self.state });
        }
        Ok(())
    }
}

async fn connect(address: &str, connect_timeout: Duration) -> io::Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(address)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timeout")),
    }
}

/// Resolves once the client has closed with nothing left unread. Pending
/// client data keeps it waiting, since that data belongs to the backend.
async fn client_hangup(client: &TcpStream) -> io::Result<()> {
    let mut byte = [0u8; 1];
    if client.peek(&mut byte).await? == 0 {
        return Ok(());
    }
    std::future::pending().await
}

/// Drop the backend's answers to handshake steps the gateway already
/// answered. `max_frame` bounds each length-prefixed frame.
async fn discard_prelude(
    backend: &mut TcpStream,
    prelude: BackendPrelude,
    max_frame: usize,
) -> io::Result<()> {
    let mut fixed = vec![0u8; prelude.fixed_bytes];
    backend.read_exact(&mut fixed).await?;

    for _ in 0..prelude.length_prefixed_frames {
        let mut size = [0u8; 4];
        backend.read_exact(&mut size).await?;
        let size = u32::from_be_bytes(size) as usize;
        if size < 4 || size > max_frame {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("backend handshake frame of {size} bytes"),
            ));
        }
        let mut rest = (&mut *backend).take((size - 4) as u64);
        let skipped = tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
        if skipped < (size - 4) as u64 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }

    trace!(?prelude, "Discarded backend handshake prelude");
    Ok(())
}
