//! Backend registry view.
//!
//! Maps a routing key (protocol, virtual host) to the backend endpoints
//! currently registered for it. The registry is fed by an external updater
//! and only read by connection handlers:
//! - Readers load an immutable snapshot without locking
//! - Writers build a new snapshot and swap it in atomically
//! - Lookups return a point-in-time copy; staleness is expected

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A backend address for one protocol. Value type, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// `host:port`.
    pub address: String,
    pub protocol: String,
}

impl ServiceEndpoint {
    pub fn new(address: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            protocol: protocol.into(),
        }
    }
}

impl fmt::Display for ServiceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.address)
    }
}

/// Point-in-time list of endpoints for a routing key.
pub type CandidateSet = Vec<ServiceEndpoint>;

/// Key for registry lookups and load balancer buckets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteKey {
    pub protocol: String,
    pub virtual_host: String,
}

impl RouteKey {
    pub fn new(protocol: impl Into<String>, virtual_host: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            virtual_host: virtual_host.into(),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.protocol, self.virtual_host)
    }
}

/// One registered backend, as published by service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Registration {
    pub protocol: String,
    /// Virtual host served. `None` serves every virtual host of the
    /// protocol that has no exact registration.
    #[serde(default)]
    pub virtual_host: Option<String>,
    pub address: String,
}

impl Registration {
    pub fn new(
        protocol: impl Into<String>,
        virtual_host: Option<&str>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            virtual_host: virtual_host.map(str::to_string),
            address: address.into(),
        }
    }

    pub fn endpoint(&self) -> ServiceEndpoint {
        ServiceEndpoint::new(self.address.clone(), self.protocol.clone())
    }
}

/// Immutable snapshot of registry data for lock-free reads.
#[derive(Debug, Default)]
struct RegistrySnapshot {
    /// Registrations in publication order, duplicates removed.
    registrations: Vec<Registration>,
    /// Endpoints by exact routing key.
    by_route: HashMap<RouteKey, CandidateSet>,
    /// Endpoints serving any virtual host, by protocol.
    any_host: HashMap<String, CandidateSet>,
}

impl RegistrySnapshot {
    fn from_registrations(registrations: Vec<Registration>) -> Self {
        let mut snapshot = Self::default();
        let mut seen = HashSet::with_capacity(registrations.len());

        for registration in &registrations {
            if !seen.insert(registration) {
                continue;
            }

            let endpoint = registration.endpoint();
            match &registration.virtual_host {
                Some(vhost) => snapshot
                    .by_route
                    .entry(RouteKey::new(registration.protocol.clone(), vhost.clone()))
                    .or_default()
                    .push(endpoint),
                None => snapshot
                    .any_host
                    .entry(registration.protocol.clone())
                    .or_default()
                    .push(endpoint),
            }
            snapshot.registrations.push(registration.clone());
        }

        snapshot
    }

    fn with_upsert(&self, registration: Registration) -> Self {
        let mut registrations = self.registrations.clone();
        registrations.push(registration);
        Self::from_registrations(registrations)
    }

    fn without(&self, registration: &Registration) -> Self {
        let registrations = self
            .registrations
            .iter()
            .filter(|r| *r != registration)
            .cloned()
            .collect();
        Self::from_registrations(registrations)
    }

    fn lookup(&self, route: &RouteKey) -> CandidateSet {
        if let Some(endpoints) = self.by_route.get(route) {
            return endpoints.clone();
        }
        self.any_host
            .get(&route.protocol)
            .cloned()
            .unwrap_or_default()
    }
}

/// Live, externally updated view of reachable backends.
pub struct ServiceRegistry {
    /// Atomically swappable snapshot.
    snapshot: ArcSwap<RegistrySnapshot>,
}

impl ServiceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RegistrySnapshot::default()),
        }
    }

    /// Replace every registration in a single pointer swap.
    ///
    /// Lookups in flight keep the old snapshot until they finish.
    pub fn update(&self, registrations: Vec<Registration>) {
        let snapshot = RegistrySnapshot::from_registrations(registrations);
        let count = snapshot.registrations.len();
        self.snapshot.store(Arc::new(snapshot));
        info!(registration_count = count, "Service registry updated");
    }

    /// Add one registration. Adding an existing registration is a no-op.
    pub fn upsert(&self, registration: Registration) {
        self.snapshot
            .rcu(|current| current.with_upsert(registration.clone()));
    }

    /// Remove one registration.
    pub fn remove(&self, registration: &Registration) {
        self.snapshot.rcu(|current| current.without(registration));
    }

    /// Candidates for a routing key. Empty is not an error here.
    pub fn lookup(&self, route: &RouteKey) -> CandidateSet {
        let candidates = self.snapshot.load().lookup(route);
        debug!(route = %route, candidates = candidates.len(), "Registry lookup");
        candidates
    }

    pub fn registrations(&self) -> Vec<Registration> {
        self.snapshot.load().registrations.clone()
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().registrations.is_empty()
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared registry reference.
pub type SharedRegistry = Arc<ServiceRegistry>;
