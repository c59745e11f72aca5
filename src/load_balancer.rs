/// Backend selection for routes with several upstream instances
use dashmap::DashMap;
use log::{debug, warn};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{GatewayError, GatewayResult};
use crate::models::{Route, ROUND_ROBIN};

/// Trait for load balancing strategies
pub trait LoadBalancingStrategy: Send + Sync {
    /// Pick the index of the backend to use for this request
    fn select_index(&self, route: &Route, backend_count: usize, request_path: &str) -> usize;
}

/// Round-robin strategy with one monotonically increasing counter per route.
///
/// Counters are created lazily through the map's entry API and never reset,
/// so concurrent first requests for the same route share one counter.
#[derive(Default)]
pub struct RoundRobinStrategy {
    counters: DashMap<i64, AtomicUsize>,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of routes that have a counter
    pub fn tracked_routes(&self) -> usize {
        self.counters.len()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select_index(&self, route: &Route, backend_count: usize, _request_path: &str) -> usize {
        let counter = self
            .counters
            .entry(route.id)
            .or_insert_with(|| AtomicUsize::new(0));
        counter.fetch_add(1, Ordering::Relaxed) % backend_count
    }
}

/// Chooses one backend URL from a route's backend list
pub struct BackendSelector {
    round_robin: RoundRobinStrategy,
    /// Routes already warned about for an unsupported strategy tag
    warned: DashMap<i64, ()>,
}

impl Default for BackendSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendSelector {
    pub fn new() -> Self {
        Self {
            round_robin: RoundRobinStrategy::new(),
            warned: DashMap::new(),
        }
    }

    /// Select a backend for the request. A single backend is returned directly.
    pub fn select<'a>(
        &self,
        route: &Route,
        backends: &'a [String],
        request_path: &str,
    ) -> GatewayResult<&'a str> {
        match backends.len() {
            0 => Err(GatewayError::BackendUnavailable(format!(
                "route {} has no backends",
                route.id
            ))),
            1 => Ok(backends[0].as_str()),
            count => {
                let strategy = self.strategy_for(route);
                let index = strategy.select_index(route, count, request_path);
                debug!(
                    "Route {} selected backend {} ({}/{})",
                    route.id, backends[index], index, count
                );
                Ok(backends[index].as_str())
            }
        }
    }

    fn strategy_for(&self, route: &Route) -> &dyn LoadBalancingStrategy {
        if route.load_balancing_strategy != ROUND_ROBIN
            && self.warned.insert(route.id, ()).is_none()
        {
            warn!(
                "Route {} uses unsupported load balancing strategy '{}', falling back to round-robin",
                route.id, route.load_balancing_strategy
            );
        }
        &self.round_robin
    }
}
