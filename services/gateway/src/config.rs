//! Gateway configuration.
//!
//! Everything is env-driven; see `Config::from_env` for the variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use mgw_protocol::{FrameLimits, ProtocolSet, SnoopOptions, DEFAULT_VIRTUAL_HOST};

use crate::proxy::{
    GatewayConfig, ListenerConfig, Strategy, DEFAULT_MAX_CONNECTIONS, DEFAULT_MAX_CONNECT_ATTEMPTS,
};
use crate::sync::RegistrySource;

/// Default sticky cache capacity.
pub const DEFAULT_STICKY_CAPACITY: usize = 10_000;

/// Gateway configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Listener address (example: [::]:61613).
    pub bind_addr: SocketAddr,

    /// Enabled protocols, in identification order.
    pub protocols: Vec<String>,

    /// Virtual host used when a handshake names none.
    pub default_virtual_host: String,

    pub limits: FrameLimits,

    pub snoop_timeout: Duration,
    pub connect_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    pub max_connect_attempts: usize,

    pub load_balancer: Strategy,
    pub sticky_capacity: usize,

    pub max_connections: usize,
    pub shutdown_grace: Duration,

    /// Where registrations come from. `None` starts with an empty registry.
    pub registry_source: Option<RegistrySource>,
    pub registry_poll_interval: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_addr: SocketAddr = lookup("MGW_BIND_ADDR")
            .unwrap_or_else(|| "[::]:61613".to_string())
            .parse()
            .context("MGW_BIND_ADDR must be a socket address (example: [::]:61613).")?;

        let protocols = parse_protocols(
            &lookup("MGW_PROTOCOLS").unwrap_or_else(|| "stomp,amqp,mqtt".to_string()),
        )?;

        let default_virtual_host = lookup("MGW_DEFAULT_VHOST")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_VIRTUAL_HOST.to_string());

        let defaults = FrameLimits::default();
        let limits = FrameLimits {
            max_line_length: parse_or(&lookup, "MGW_MAX_LINE_LENGTH", defaults.max_line_length)?,
            max_headers: parse_or(&lookup, "MGW_MAX_HEADERS", defaults.max_headers)?,
            max_header_length: parse_or(
                &lookup,
                "MGW_MAX_HEADER_LENGTH",
                defaults.max_header_length,
            )?,
            max_body_length: parse_or(&lookup, "MGW_MAX_BODY_LENGTH", defaults.max_body_length)?,
        };

        let snoop_timeout = Duration::from_millis(parse_or(&lookup, "MGW_SNOOP_TIMEOUT_MS", 5000)?);
        let connect_timeout =
            Duration::from_millis(parse_or(&lookup, "MGW_CONNECT_TIMEOUT_MS", 2000)?);
        let idle_timeout = lookup("MGW_IDLE_TIMEOUT_MS")
            .map(|v| v.parse::<u64>())
            .transpose()
            .context("MGW_IDLE_TIMEOUT_MS must be an integer (milliseconds).")?
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);

        let max_connect_attempts: usize = parse_or(
            &lookup,
            "MGW_MAX_CONNECT_ATTEMPTS",
            DEFAULT_MAX_CONNECT_ATTEMPTS,
        )?;

        let load_balancer = match lookup("MGW_LOAD_BALANCER") {
            Some(v) => v
                .parse::<Strategy>()
                .context("MGW_LOAD_BALANCER must be sticky, round-robin or random.")?,
            None => Strategy::default(),
        };
        let sticky_capacity = parse_or(&lookup, "MGW_STICKY_CAPACITY", DEFAULT_STICKY_CAPACITY)?;

        let max_connections = parse_or(&lookup, "MGW_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let shutdown_grace =
            Duration::from_millis(parse_or(&lookup, "MGW_SHUTDOWN_GRACE_MS", 10_000)?);

        let registry_source = match (lookup("MGW_REGISTRY_FILE"), lookup("MGW_REGISTRY_URL")) {
            (Some(_), Some(_)) => bail!("Set only one of MGW_REGISTRY_FILE and MGW_REGISTRY_URL."),
            (Some(path), None) => Some(RegistrySource::File(PathBuf::from(path))),
            (None, Some(url)) => Some(RegistrySource::Http(url)),
            (None, None) => None,
        };
        let registry_poll_ms: u64 = parse_or(&lookup, "MGW_REGISTRY_POLL_MS", 1000)?;
        let registry_poll_interval = Duration::from_millis(registry_poll_ms.max(50));

        let log_level = lookup("MGW_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            bind_addr,
            protocols,
            default_virtual_host,
            limits,
            snoop_timeout,
            connect_timeout,
            idle_timeout,
            max_connect_attempts: max_connect_attempts.max(1),
            load_balancer,
            sticky_capacity,
            max_connections: max_connections.max(1),
            shutdown_grace,
            registry_source,
            registry_poll_interval,
            log_level,
        })
    }

    /// Enabled protocols in identification order.
    pub fn protocol_set(&self) -> Result<ProtocolSet> {
        let mut set = ProtocolSet::new();
        for name in &self.protocols {
            let protocol = mgw_protocol::builtin(name)
                .with_context(|| format!("Unknown protocol {name:?} in MGW_PROTOCOLS"))?;
            set.register(protocol);
        }
        Ok(set)
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            snoop: SnoopOptions {
                limits: self.limits,
                default_virtual_host: self.default_virtual_host.clone(),
            },
            snoop_timeout: self.snoop_timeout,
            connect_timeout: self.connect_timeout,
            idle_timeout: self.idle_timeout,
            max_connect_attempts: self.max_connect_attempts,
        }
    }

    pub fn listener_config(&self) -> ListenerConfig {
        let mut config = ListenerConfig::new(self.bind_addr);
        config.max_connections = self.max_connections;
        config.shutdown_grace = self.shutdown_grace;
        config
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} must be a non-negative integer, got {raw:?}.")),
        None => Ok(default),
    }
}

fn parse_protocols(raw: &str) -> Result<Vec<String>> {
    let mut protocols = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let name = name.to_ascii_lowercase();
        if mgw_protocol::builtin(&name).is_none() {
            bail!(
                "Unknown protocol {name:?} in MGW_PROTOCOLS (known: {}).",
                mgw_protocol::BUILTIN_PROTOCOLS.join(", ")
            );
        }
        if !protocols.contains(&name) {
            protocols.push(name);
        }
    }
    if protocols.is_empty() {
        bail!("MGW_PROTOCOLS must name at least one protocol.");
    }
    Ok(protocols)
}
