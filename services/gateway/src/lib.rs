//! mgw gateway
//!
//! Accepts client connections on one port, identifies the messaging
//! protocol from the first bytes, snoops the handshake for the virtual host
//! and identity, and relays the connection to a registered backend.

pub mod config;
pub mod error;
pub mod proxy;
pub mod sync;

pub use error::{GatewayError, Side};
pub use proxy::{
    Gateway, GatewayConfig, Listener, ListenerConfig, ListenerStats, LoadBalancer, Registration,
    RouteKey, ServiceEndpoint, ServiceRegistry, ShutdownHandle, Strategy,
};
