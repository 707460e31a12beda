//! # Router Module
//!
//! Ordered path-pattern routing from inbound paths to upstream services.
//!
//! ## Pattern forms
//!
//! - `/api/v1/products/*` matches any path starting with `/api/v1/products`
//! - `/static*` matches any path starting with the raw prefix `/static`
//! - anything else matches by exact equality
//!
//! Routes are checked in insertion order and the first match wins. Paths are
//! compared as received; there is no normalization.
//!
//! ## Rust Concepts Used
//!
//! - `parking_lot::RwLock<Vec<Arc<Route>>>` lets every request read the table
//!   concurrently while the admin API replaces entries
//! - Lookups clone the matching `Arc<Route>` out of the lock, so the guard is
//!   dropped before the request does any I/O

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::core::config::RouteConfig;
use crate::core::error::{GatewayError, GatewayResult};
use crate::core::types::ServiceInstance;
use crate::load_balancing::{create_balancer, eligible_instances, ConnectionStatsStore, LoadBalancer, SelectionContext};
use crate::observability::health::InstanceSource;

/// A registered route with its runtime state
pub struct Route {
    pub config: RouteConfig,

    /// Shared with the health checker, mutated in place
    pub instances: Vec<Arc<ServiceInstance>>,

    balancer: Arc<dyn LoadBalancer>,

    /// HTTP client carrying this route's connect timeout
    client: reqwest::Client,
}

impl Route {
    pub fn from_config(config: RouteConfig, stats: Arc<ConnectionStatsStore>) -> GatewayResult<Self> {
        config.validate()?;

        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GatewayError::config(format!("Failed to build HTTP client: {}", e)))?;

        let instances = config
            .upstream_instances
            .iter()
            .map(|instance| Arc::new(ServiceInstance::from_config(instance)))
            .collect();

        let balancer = create_balancer(config.load_balancing_algorithm, stats);

        Ok(Self {
            config,
            instances,
            balancer,
            client,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.config.path
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn balancer(&self) -> &dyn LoadBalancer {
        self.balancer.as_ref()
    }

    /// Instances the balancer may pick from right now
    pub fn eligible_instances(&self) -> Vec<Arc<ServiceInstance>> {
        eligible_instances(&self.instances, self.config.health_check_enabled)
    }

    /// Pick an instance from `eligible` through the route's balancer
    pub fn select(
        &self,
        eligible: &[Arc<ServiceInstance>],
        ctx: &SelectionContext,
    ) -> Option<Arc<ServiceInstance>> {
        self.balancer
            .select(eligible, ctx)
            .and_then(|index| eligible.get(index).cloned())
    }

    pub fn matches(&self, path: &str) -> bool {
        pattern_matches(&self.config.path, path)
    }

    /// Path to send upstream for an inbound `path`
    ///
    /// With `strip_path_prefix`, a leading `/api/v1/<segment>` group is removed;
    /// failing that, a leading `/<service_name>` segment is removed. An empty
    /// remainder becomes `/`.
    pub fn upstream_path(&self, path: &str) -> String {
        if !self.config.strip_path_prefix {
            return path.to_string();
        }

        let remainder = strip_api_group(path)
            .or_else(|| strip_segment(path, &self.config.service_name))
            .unwrap_or(path);

        if remainder.is_empty() {
            "/".to_string()
        } else {
            remainder.to_string()
        }
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.config.path)
            .field("service_name", &self.config.service_name)
            .field("algorithm", &self.balancer.algorithm_name())
            .field("instances", &self.instances.len())
            .finish()
    }
}

/// Whether `pattern` matches `path` under the three pattern forms
pub fn pattern_matches(pattern: &str, path: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix("/*") {
        path.starts_with(prefix)
    } else if let Some(prefix) = pattern.strip_suffix('*') {
        path.starts_with(prefix)
    } else {
        pattern == path
    }
}

/// `/api/v1/<segment>/rest` → `/rest`
fn strip_api_group(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/api/v1/")?;
    if rest.is_empty() {
        return None;
    }
    match rest.find('/') {
        Some(index) => Some(&rest[index..]),
        None => Some(""),
    }
}

/// `/<segment>/rest` → `/rest`, only when the first segment equals `segment`
fn strip_segment<'a>(path: &'a str, segment: &str) -> Option<&'a str> {
    if segment.is_empty() {
        return None;
    }
    let rest = path.strip_prefix('/')?.strip_prefix(segment)?;
    if rest.is_empty() || rest.starts_with('/') {
        Some(rest)
    } else {
        None
    }
}

/// Ordered route table
pub struct Router {
    routes: RwLock<Vec<Arc<Route>>>,
    stats: Arc<ConnectionStatsStore>,
}

impl Router {
    pub fn new(stats: Arc<ConnectionStatsStore>) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            stats,
        }
    }

    /// Register a route, replacing one with the same pattern in place
    pub fn add_route(&self, config: RouteConfig) -> GatewayResult<Arc<Route>> {
        let route = Arc::new(Route::from_config(config, Arc::clone(&self.stats))?);

        let replaced = {
            let mut routes = self.routes.write();
            match routes.iter().position(|r| r.pattern() == route.pattern()) {
                Some(index) => {
                    routes[index] = Arc::clone(&route);
                    true
                }
                None => {
                    routes.push(Arc::clone(&route));
                    false
                }
            }
        };

        info!(
            path = %route.pattern(),
            service = %route.service_name(),
            instances = route.instances.len(),
            algorithm = route.balancer().algorithm_name(),
            replaced = replaced,
            "Registered route"
        );

        Ok(route)
    }

    /// Remove the route registered under `pattern`
    pub fn remove_route(&self, pattern: &str) -> bool {
        self.take_route(pattern).is_some()
    }

    /// Remove and return the route registered under `pattern`
    pub fn take_route(&self, pattern: &str) -> Option<Arc<Route>> {
        let removed = {
            let mut routes = self.routes.write();
            let index = routes.iter().position(|r| r.pattern() == pattern)?;
            routes.remove(index)
        };

        info!(path = %pattern, "Removed route");
        Some(removed)
    }

    /// First registered route matching `path`
    pub fn match_route(&self, path: &str) -> Option<Arc<Route>> {
        self.routes.read().iter().find(|r| r.matches(path)).cloned()
    }

    /// Snapshot of the table in match order
    pub fn routes(&self) -> Vec<Arc<Route>> {
        self.routes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }

    pub fn stats(&self) -> &Arc<ConnectionStatsStore> {
        &self.stats
    }
}

impl InstanceSource for Router {
    /// Every instance of routes that have health checking enabled
    fn instances(&self) -> Vec<Arc<ServiceInstance>> {
        self.routes
            .read()
            .iter()
            .filter(|r| r.config.health_check_enabled)
            .flat_map(|r| r.instances.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::InstanceConfig;

    fn router() -> Router {
        Router::new(Arc::new(ConnectionStatsStore::new()))
    }

    fn route(path: &str, service: &str) -> RouteConfig {
        RouteConfig::new(path, service).with_instance(InstanceConfig::new("localhost", 8004))
    }

    #[test]
    fn test_pattern_forms() {
        assert!(pattern_matches("/api/v1/products/*", "/api/v1/products/42"));
        assert!(pattern_matches("/api/v1/products/*", "/api/v1/products"));
        assert!(pattern_matches("/static*", "/static-files/app.js"));
        assert!(pattern_matches("/health", "/health"));
        assert!(!pattern_matches("/health", "/health/"));
        assert!(!pattern_matches("/api/v1/products/*", "/api/v1/orders/1"));
    }

    #[test]
    fn test_first_registered_wins() {
        let router = router();
        router.add_route(route("/api/v1/*", "catch-all")).unwrap();
        router.add_route(route("/api/v1/products/*", "products")).unwrap();

        let matched = router.match_route("/api/v1/products/1").unwrap();
        assert_eq!(matched.service_name(), "catch-all");
    }

    #[test]
    fn test_replace_in_place_keeps_order() {
        let router = router();
        router.add_route(route("/a/*", "a")).unwrap();
        router.add_route(route("/b/*", "b")).unwrap();
        router.add_route(route("/a/*", "a2")).unwrap();

        let routes = router.routes();
        assert_eq!(routes.len(), 2);
        assert_eq!(routes[0].service_name(), "a2");
        assert_eq!(routes[1].service_name(), "b");
    }

    #[test]
    fn test_remove_route() {
        let router = router();
        router.add_route(route("/a/*", "a")).unwrap();
        assert!(router.remove_route("/a/*"));
        assert!(!router.remove_route("/a/*"));
        assert!(router.match_route("/a/x").is_none());
        assert!(router.is_empty());
    }

    #[test]
    fn test_invalid_route_rejected() {
        let router = router();
        let result = router.add_route(RouteConfig::new("/empty", "empty"));
        assert!(matches!(result, Err(GatewayError::Validation { .. })));
        assert!(router.is_empty());
    }

    #[test]
    fn test_upstream_path_stripping() {
        let router = router();
        let products = router.add_route(route("/api/v1/products/*", "products")).unwrap();
        assert_eq!(products.upstream_path("/api/v1/products/42"), "/42");
        assert_eq!(products.upstream_path("/api/v1/products"), "/");
        assert_eq!(products.upstream_path("/api/v1/products/a/b"), "/a/b");

        let orders = router.add_route(route("/orders/*", "orders")).unwrap();
        assert_eq!(orders.upstream_path("/orders/7"), "/7");
        assert_eq!(orders.upstream_path("/orders"), "/");
        assert_eq!(orders.upstream_path("/ordersx/7"), "/ordersx/7");

        let mut keep = route("/keep/*", "keep");
        keep.strip_path_prefix = false;
        let keep = router.add_route(keep).unwrap();
        assert_eq!(keep.upstream_path("/keep/1"), "/keep/1");
    }

    #[test]
    fn test_instance_source_skips_unchecked_routes() {
        let router = router();
        router.add_route(route("/a/*", "a")).unwrap();
        let mut unchecked = route("/b/*", "b");
        unchecked.health_check_enabled = false;
        router.add_route(unchecked).unwrap();

        assert_eq!(router.instances().len(), 1);
    }

    #[test]
    fn test_route_select_uses_balancer() {
        let router = router();
        let config = RouteConfig::new("/rr/*", "rr")
            .with_instance(InstanceConfig::new("localhost", 9001))
            .with_instance(InstanceConfig::new("localhost", 9002));
        let route = router.add_route(config).unwrap();

        let eligible = route.eligible_instances();
        let ctx = SelectionContext::default();
        let first = route.select(&eligible, &ctx).unwrap();
        let second = route.select(&eligible, &ctx).unwrap();
        assert_ne!(first.key(), second.key());
    }
}
