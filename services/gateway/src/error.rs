//! Connection failure taxonomy.

use std::fmt;
use std::io;

use mgw_protocol::DecodeError;
use thiserror::Error;

use crate::proxy::{ConnectionState, RouteKey};

/// Which leg of a proxied connection an I/O error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Backend,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Backend => f.write_str("backend"),
        }
    }
}

/// Terminal failure of one gateway connection.
///
/// Every variant closes the connection. None of them affect other
/// connections or the listener.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No registered protocol matched within the identification budget.
    #[error("no protocol matched the first {buffered} bytes")]
    ProtocolUnrecognized { buffered: usize },

    /// The handshake was malformed or exceeded a limit.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A phase did not finish before its deadline.
    #[error("{phase} timed out")]
    Timeout { phase: ConnectionState },

    /// The registry had no candidates for the routing key.
    #[error("no backend registered for {route}")]
    NoBackend { route: RouteKey },

    /// Every attempted backend refused, failed or timed out.
    #[error("backend {address} unreachable: {reason}")]
    BackendUnreachable { address: String, reason: String },

    /// The client went away before relaying started.
    #[error("client closed the connection while {phase}")]
    ClientClosed { phase: ConnectionState },

    /// I/O failure on one leg.
    #[error("{side} i/o error: {source}")]
    Io {
        side: Side,
        #[source]
        source: io::Error,
    },
}

impl GatewayError {
    pub fn client_io(source: io::Error) -> Self {
        GatewayError::Io {
            side: Side::Client,
            source,
        }
    }

    pub fn backend_io(source: io::Error) -> Self {
        GatewayError::Io {
            side: Side::Backend,
            source,
        }
    }

    /// Stable reason code for logs and counters.
    pub fn reason_code(&self) -> &'static str {
        match self {
            GatewayError::ProtocolUnrecognized { .. } => "protocol_unrecognized",
            GatewayError::Decode(_) => "decode_error",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::NoBackend { .. } => "no_backend",
            GatewayError::BackendUnreachable { .. } => "backend_unreachable",
            GatewayError::ClientClosed { .. } => "client_closed",
            GatewayError::Io { side: Side::Client, .. } => "client_io",
            GatewayError::Io { side: Side::Backend, .. } => "backend_io",
        }
    }

    /// Whether this is routine churn rather than something an operator
    /// should look at.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            GatewayError::NoBackend { .. }
                | GatewayError::ClientClosed { .. }
                | GatewayError::Io { side: Side::Client, .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        let err = GatewayError::Decode(DecodeError::MissingTerminator);
        assert_eq!(err.reason_code(), "decode_error");
        assert!(!err.is_expected());

        let err = GatewayError::NoBackend {
            route: RouteKey::new("stomp", "v"),
        };
        assert_eq!(err.reason_code(), "no_backend");
        assert!(err.is_expected());
        assert_eq!(err.to_string(), "no backend registered for stomp/v");

        let err = GatewayError::backend_io(io::Error::other("reset"));
        assert_eq!(err.reason_code(), "backend_io");
    }

    #[test]
    fn test_timeout_names_phase() {
        let err = GatewayError::Timeout {
            phase: ConnectionState::Snooping,
        };
        assert_eq!(err.to_string(), "snooping timed out");
    }
}
