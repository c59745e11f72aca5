/// Request routing for the API Gateway
use log::{debug, warn};
use std::sync::Arc;

use crate::catalog::RouteStore;
use crate::error::{GatewayError, GatewayResult};
use crate::models::Route;

/// Prefixes stripped (in this order) when the exact path has no route
pub const VERSION_PREFIXES: [&str; 3] = ["/api/", "/v1/", "/v2/"];

/// Resolves an inbound path to a configured route
pub struct RouteResolver {
    store: Arc<dyn RouteStore>,
}

impl RouteResolver {
    pub fn new(store: Arc<dyn RouteStore>) -> Self {
        Self { store }
    }

    /// Exact match first, then one retry per version prefix the path starts with.
    pub async fn resolve(&self, path: &str) -> GatewayResult<Route> {
        if let Some(route) = self.lookup(path).await {
            debug!("Route {} exact-matched for {}", route.id, path);
            return Ok(route);
        }

        for candidate in fallback_candidates(path) {
            if let Some(route) = self.lookup(&candidate).await {
                debug!(
                    "Route {} matched {} after prefix strip ({})",
                    route.id, path, candidate
                );
                return Ok(route);
            }
        }

        debug!("No route matched for {}", path);
        Err(GatewayError::RouteNotFound(path.to_string()))
    }

    /// Store failures count as "not found" for this candidate
    async fn lookup(&self, path: &str) -> Option<Route> {
        match self.store.get_route_by_path(path).await {
            Ok(route) => route,
            Err(e) => {
                warn!("Route lookup failed for {}: {}", path, e);
                None
            }
        }
    }
}

/// Candidate paths produced by stripping each matching version prefix
pub fn fallback_candidates(path: &str) -> impl Iterator<Item = String> + '_ {
    VERSION_PREFIXES
        .iter()
        .filter_map(move |prefix| path.strip_prefix(prefix))
        .map(|rest| format!("/{}", rest))
}
