//! Protocol-detecting TCP gateway.
//!
//! This module provides:
//! - TCP listener management with connection limits and graceful drain
//! - Protocol identification and handshake snooping
//! - Backend registry view and load balancing
//! - Buffered-byte replay and bidirectional relaying
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Identify -> Snoop -> Registry -> Balancer -> Backend
//!                          |                                          ^
//!                          +------------ replayed client bytes -------+
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{Gateway, GatewayConfig, Listener, ListenerConfig, ServiceRegistry};
//!
//! let registry = Arc::new(ServiceRegistry::new());
//! let balancer = balancer::from_strategy(Strategy::Sticky, 10_000);
//! let gateway = Arc::new(Gateway::new(
//!     ProtocolSet::builtin(),
//!     registry,
//!     balancer,
//!     GatewayConfig::default(),
//! ));
//!
//! let config = ListenerConfig::new("[::]:61613".parse()?);
//! let listener = Listener::bind(config, gateway).await?;
//! listener.run().await?;
//! ```

pub mod balancer;
mod connection;
mod listener;
mod lru;
mod registry;
mod relay;

pub use balancer::{LoadBalancer, NoCandidates, Strategy};
pub use connection::{
    client_key, ConnectionState, ConnectionSummary, Gateway, GatewayConfig, GatewayConnection,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_CONNECT_ATTEMPTS, DEFAULT_SNOOP_TIMEOUT,
};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, ShutdownHandle, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_SHUTDOWN_GRACE,
};
pub use lru::LruCache;
pub use registry::{
    CandidateSet, Registration, RouteKey, ServiceEndpoint, ServiceRegistry, SharedRegistry,
};
pub use relay::{relay, Activity, RelayStats};
