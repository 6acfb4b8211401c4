//! Backend selection strategies.
//!
//! A balancer picks one endpoint from a point-in-time candidate set. An empty
//! set is reported as [`NoCandidates`], never a panic.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tracing::trace;

use super::lru::LruCache;
use super::registry::{RouteKey, ServiceEndpoint};

/// The candidate set was empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("no candidates")]
pub struct NoCandidates;

/// Picks a backend for one connection.
pub trait LoadBalancer: Send + Sync {
    /// Strategy name for logs.
    fn name(&self) -> &'static str;

    fn select(
        &self,
        route: &RouteKey,
        candidates: &[ServiceEndpoint],
        client_key: &str,
    ) -> Result<ServiceEndpoint, NoCandidates>;
}

/// Configured strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    #[default]
    Sticky,
    RoundRobin,
    Random,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sticky => "sticky",
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown load balancer strategy: {0}")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sticky" => Ok(Self::Sticky),
            "round-robin" | "round_robin" | "roundrobin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            other => Err(UnknownStrategy(other.to_string())),
        }
    }
}

/// Build the balancer for a strategy. `sticky_capacity` bounds the sticky
/// cache and is ignored by the other strategies.
pub fn from_strategy(strategy: Strategy, sticky_capacity: usize) -> Arc<dyn LoadBalancer> {
    match strategy {
        Strategy::Sticky => Arc::new(StickyBalancer::new(sticky_capacity)),
        Strategy::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        Strategy::Random => Arc::new(RandomBalancer),
    }
}

/// Session affinity keyed by client identity.
///
/// Eviction policy: the cache holds at most `capacity` client keys; when a
/// new key arrives at capacity, the least recently selected key is dropped.
/// A cached endpoint that is no longer a candidate is replaced.
pub struct StickyBalancer {
    cache: Mutex<LruCache<String, ServiceEndpoint>>,
}

impl StickyBalancer {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    /// Deterministic pick: hash the key over the address-sorted candidates.
    fn pick(candidates: &[ServiceEndpoint], client_key: &str) -> ServiceEndpoint {
        let mut sorted: Vec<&ServiceEndpoint> = candidates.iter().collect();
        sorted.sort();

        let mut hasher = DefaultHasher::new();
        client_key.hash(&mut hasher);
        let index = (hasher.finish() % sorted.len() as u64) as usize;
        sorted[index].clone()
    }
}

impl LoadBalancer for StickyBalancer {
    fn name(&self) -> &'static str {
        "sticky"
    }

    fn select(
        &self,
        route: &RouteKey,
        candidates: &[ServiceEndpoint],
        client_key: &str,
    ) -> Result<ServiceEndpoint, NoCandidates> {
        if candidates.is_empty() {
            return Err(NoCandidates);
        }

        let key = format!("{route}/{client_key}");
        let mut cache = self.cache.lock();

        if let Some(endpoint) = cache.get(&key) {
            if candidates.contains(endpoint) {
                trace!(%route, client_key, backend = %endpoint.address, "Sticky hit");
                return Ok(endpoint.clone());
            }
        }

        let endpoint = Self::pick(candidates, client_key);
        trace!(%route, client_key, backend = %endpoint.address, "Sticky assign");
        cache.insert(key, endpoint.clone());
        Ok(endpoint)
    }
}

/// Rotates through candidates, one counter per route.
#[derive(Default)]
pub struct RoundRobinBalancer {
    counters: DashMap<RouteKey, AtomicUsize>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn select(
        &self,
        route: &RouteKey,
        candidates: &[ServiceEndpoint],
        _client_key: &str,
    ) -> Result<ServiceEndpoint, NoCandidates> {
        if candidates.is_empty() {
            return Err(NoCandidates);
        }

        let count = match self.counters.get(route) {
            Some(counter) => counter.fetch_add(1, Ordering::Relaxed),
            None => self
                .counters
                .entry(route.clone())
                .or_insert_with(|| AtomicUsize::new(0))
                .fetch_add(1, Ordering::Relaxed),
        };
        Ok(candidates[count % candidates.len()].clone())
    }
}

/// Uniform random choice.
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(
        &self,
        _route: &RouteKey,
        candidates: &[ServiceEndpoint],
        _client_key: &str,
    ) -> Result<ServiceEndpoint, NoCandidates> {
        if candidates.is_empty() {
            return Err(NoCandidates);
        }
        let index = rand::rng().random_range(0..candidates.len());
        Ok(candidates[index].clone())
    }
}
