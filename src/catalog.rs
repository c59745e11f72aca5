//! Read accessors over routes, cache rules and API keys
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::Config;
use crate::error::GatewayResult;
use crate::models::{ApiKey, CacheRule, Route};

#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Exact-path lookup. `Ok(None)` means no route is configured for `path`.
    async fn get_route_by_path(&self, path: &str) -> GatewayResult<Option<Route>>;
}

#[async_trait]
pub trait CacheRuleStore: Send + Sync {
    async fn get_cache_rule_by_route_id(&self, route_id: i64) -> GatewayResult<Option<CacheRule>>;
}

#[async_trait]
pub trait ApiKeyStore: Send + Sync {
    async fn get_api_key_by_token(&self, token: &str) -> GatewayResult<Option<ApiKey>>;
}

/// Catalog declared in the configuration file
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    routes_by_path: HashMap<String, Route>,
    rules_by_route: HashMap<i64, CacheRule>,
    keys_by_token: HashMap<String, ApiKey>,
}

impl StaticCatalog {
    pub fn new(routes: Vec<Route>, rules: Vec<CacheRule>, keys: Vec<ApiKey>) -> Self {
        Self {
            routes_by_path: routes.into_iter().map(|r| (r.path.clone(), r)).collect(),
            rules_by_route: rules.into_iter().map(|r| (r.route_id, r)).collect(),
            keys_by_token: keys.into_iter().map(|k| (k.key.clone(), k)).collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let default_timeout: Duration = config.proxy.default_timeout;
        let routes = config
            .routes
            .iter()
            .map(|r| r.to_route(default_timeout))
            .collect();
        let rules = config
            .routes
            .iter()
            .filter_map(|r| r.to_cache_rule())
            .collect();
        let keys = config.api_keys.iter().map(ApiKey::from).collect();
        Self::new(routes, rules, keys)
    }
}

#[async_trait]
impl RouteStore for StaticCatalog {
    async fn get_route_by_path(&self, path: &str) -> GatewayResult<Option<Route>> {
        Ok(self.routes_by_path.get(path).cloned())
    }
}

#[async_trait]
impl CacheRuleStore for StaticCatalog {
    async fn get_cache_rule_by_route_id(&self, route_id: i64) -> GatewayResult<Option<CacheRule>> {
        Ok(self.rules_by_route.get(&route_id).cloned())
    }
}

#[async_trait]
impl ApiKeyStore for StaticCatalog {
    async fn get_api_key_by_token(&self, token: &str) -> GatewayResult<Option<ApiKey>> {
        Ok(self
            .keys_by_token
            .get(token)
            .filter(|key| key.enabled)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ROUND_ROBIN;

    fn catalog() -> StaticCatalog {
        let route = Route {
            id: 1,
            path: "/users".to_string(),
            backend_urls: vec!["http://users:8080".to_string()],
            load_balancing_strategy: ROUND_ROBIN.to_string(),
            timeout_ms: 1000,
            retry_count: 0,
            owner: "team".to_string(),
        };
        let rule = CacheRule {
            id: 10,
            route_id: 1,
            ttl_seconds: 60,
            key_pattern: "*".to_string(),
            enabled: true,
            owner: "team".to_string(),
        };
        let active = ApiKey {
            id: 5,
            key: "gw_live".to_string(),
            name: "live".to_string(),
            tier: "pro".to_string(),
            rate_limit_rpm: 100,
            enabled: true,
            owner: "team".to_string(),
        };
        let revoked = ApiKey {
            id: 6,
            key: "gw_revoked".to_string(),
            enabled: false,
            ..active.clone()
        };
        StaticCatalog::new(vec![route], vec![rule], vec![active, revoked])
    }

    #[tokio::test]
    async fn test_route_lookup_is_exact() {
        let catalog = catalog();
        assert_eq!(catalog.get_route_by_path("/users").await.unwrap().unwrap().id, 1);
        assert!(catalog.get_route_by_path("/users/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cache_rule_by_route() {
        let catalog = catalog();
        assert_eq!(
            catalog.get_cache_rule_by_route_id(1).await.unwrap().unwrap().ttl_seconds,
            60
        );
        assert!(catalog.get_cache_rule_by_route_id(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_disabled_keys_are_not_returned() {
        let catalog = catalog();
        assert_eq!(catalog.get_api_key_by_token("gw_live").await.unwrap().unwrap().id, 5);
        assert!(catalog.get_api_key_by_token("gw_revoked").await.unwrap().is_none());
        assert!(catalog.get_api_key_by_token("unknown").await.unwrap().is_none());
    }
}
