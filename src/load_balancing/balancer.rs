//! # Load Balancer Module
//!
//! Instance selection strategies for a route's upstream instances.
//!
//! ## Rust Concepts Explained
//!
//! - `Arc<dyn LoadBalancer>` lets every route own its own balancer behind a
//!   trait object while the forwarder calls it the same way for all of them
//! - `parking_lot::Mutex<usize>` guards the round-robin cursors; the critical
//!   section is a single read-modify-write, never held across an `.await`
//! - `Send + Sync` bounds let the balancer be shared across request tasks
//!
//! ## Load Balancing Algorithms
//!
//! 1. **Round Robin**: Cycles through the eligible instances in order
//! 2. **Weighted Round Robin**: Round robin over a list where each instance
//!    appears `weight` times
//! 3. **Least Connections**: Fewest active connections, ties go to list order
//! 4. **IP Hash**: SHA-256 of the client IP modulo the instance count
//! 5. **Random**: Uniform choice
//!
//! IP hash is plain modulo hashing, so changing the set of eligible instances
//! moves most clients to a different instance.
//!
//! Selection never touches connection statistics; billing is the caller's job.

use std::sync::Arc;

use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::config::LoadBalancingAlgorithm;
use crate::core::types::ServiceInstance;
use crate::load_balancing::stats::ConnectionStatsStore;

/// Request attributes a strategy may use
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    pub client_ip: Option<String>,
    pub session_id: Option<String>,
}

impl SelectionContext {
    pub fn with_client_ip(ip: impl Into<String>) -> Self {
        Self {
            client_ip: Some(ip.into()),
            session_id: None,
        }
    }
}

/// Core trait for load balancing algorithms
///
/// `instances` is the already-filtered eligible set. The returned index points
/// into that slice.
pub trait LoadBalancer: Send + Sync {
    fn select(&self, instances: &[Arc<ServiceInstance>], ctx: &SelectionContext) -> Option<usize>;

    /// Get the algorithm name for metrics and logging
    fn algorithm_name(&self) -> &'static str;
}

/// Instances a balancer may choose from
///
/// With health checking disabled for the route every instance is eligible.
pub fn eligible_instances(
    instances: &[Arc<ServiceInstance>],
    health_check_enabled: bool,
) -> Vec<Arc<ServiceInstance>> {
    instances
        .iter()
        .filter(|instance| !health_check_enabled || instance.is_healthy())
        .cloned()
        .collect()
}

/// Build the balancer for a route
pub fn create_balancer(
    algorithm: LoadBalancingAlgorithm,
    stats: Arc<ConnectionStatsStore>,
) -> Arc<dyn LoadBalancer> {
    match algorithm {
        LoadBalancingAlgorithm::RoundRobin => Arc::new(RoundRobinBalancer::new()),
        LoadBalancingAlgorithm::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::new()),
        LoadBalancingAlgorithm::LeastConnections => Arc::new(LeastConnectionsBalancer::new(stats)),
        LoadBalancingAlgorithm::IpHash => Arc::new(IpHashBalancer),
        LoadBalancingAlgorithm::Random => Arc::new(RandomBalancer),
    }
}

fn record_selection(instance: &ServiceInstance, algorithm: &'static str) {
    counter!("load_balancer_selections", "algorithm" => algorithm).increment(1);
    debug!(
        instance = %instance.key(),
        algorithm = algorithm,
        "Selected instance for load balancing"
    );
}

fn record_empty(algorithm: &'static str) -> Option<usize> {
    counter!("load_balancer_failed_selections", "algorithm" => algorithm).increment(1);
    warn!(algorithm = algorithm, "No eligible instance to select");
    None
}

/// Round-robin load balancer
///
/// The cursor is taken modulo the eligible count at selection time, so it
/// stays valid while instances drop in and out of the eligible set.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    cursor: Mutex<usize>,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, instances: &[Arc<ServiceInstance>], _ctx: &SelectionContext) -> Option<usize> {
        if instances.is_empty() {
            return record_empty(self.algorithm_name());
        }

        let index = {
            let mut cursor = self.cursor.lock();
            let index = *cursor % instances.len();
            *cursor = (index + 1) % instances.len();
            index
        };

        record_selection(&instances[index], self.algorithm_name());
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        "round_robin"
    }
}

/// Weighted round-robin over a virtual list
///
/// An instance with weight `w` occupies `w` consecutive slots; weight 0
/// removes it from rotation entirely. The list is never materialized: the
/// cursor indexes into the cumulative weights.
#[derive(Debug, Default)]
pub struct WeightedRoundRobinBalancer {
    cursor: Mutex<u64>,
}

impl WeightedRoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn select(&self, instances: &[Arc<ServiceInstance>], _ctx: &SelectionContext) -> Option<usize> {
        let total: u64 = instances.iter().map(|i| u64::from(i.weight)).sum();
        if total == 0 {
            return record_empty(self.algorithm_name());
        }

        let mut slot = {
            let mut cursor = self.cursor.lock();
            let slot = *cursor % total;
            *cursor = (slot + 1) % total;
            slot
        };

        let index = instances.iter().position(|instance| {
            let weight = u64::from(instance.weight);
            if slot < weight {
                true
            } else {
                slot -= weight;
                false
            }
        })?;

        record_selection(&instances[index], self.algorithm_name());
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        "weighted_round_robin"
    }
}

/// Least connections load balancer
///
/// Reads the shared connection statistics that the forwarder maintains.
pub struct LeastConnectionsBalancer {
    stats: Arc<ConnectionStatsStore>,
}

impl LeastConnectionsBalancer {
    pub fn new(stats: Arc<ConnectionStatsStore>) -> Self {
        Self { stats }
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn select(&self, instances: &[Arc<ServiceInstance>], _ctx: &SelectionContext) -> Option<usize> {
        // min_by_key keeps the first of equal elements, which gives list order on ties
        let selected = instances
            .iter()
            .enumerate()
            .min_by_key(|(_, instance)| self.stats.active_connections(&instance.key()))
            .map(|(index, _)| index);

        match selected {
            Some(index) => {
                record_selection(&instances[index], self.algorithm_name());
                Some(index)
            }
            None => record_empty(self.algorithm_name()),
        }
    }

    fn algorithm_name(&self) -> &'static str {
        "least_connections"
    }
}

/// Client-IP affinity by hashing
#[derive(Debug, Default)]
pub struct IpHashBalancer;

impl IpHashBalancer {
    /// First 8 bytes of SHA-256(ip) as a big-endian integer
    pub fn hash_ip(ip: &str) -> u64 {
        let digest = Sha256::digest(ip.as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(bytes)
    }
}

impl LoadBalancer for IpHashBalancer {
    fn select(&self, instances: &[Arc<ServiceInstance>], ctx: &SelectionContext) -> Option<usize> {
        if instances.is_empty() {
            return record_empty(self.algorithm_name());
        }

        let index = match ctx.client_ip.as_deref() {
            Some(ip) => (Self::hash_ip(ip) % instances.len() as u64) as usize,
            None => 0,
        };

        record_selection(&instances[index], self.algorithm_name());
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        "ip_hash"
    }
}

#[derive(Debug, Default)]
pub struct RandomBalancer;

impl LoadBalancer for RandomBalancer {
    fn select(&self, instances: &[Arc<ServiceInstance>], _ctx: &SelectionContext) -> Option<usize> {
        if instances.is_empty() {
            return record_empty(self.algorithm_name());
        }

        let index = rand::thread_rng().gen_range(0..instances.len());
        record_selection(&instances[index], self.algorithm_name());
        Some(index)
    }

    fn algorithm_name(&self) -> &'static str {
        "random"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn instances(weights: &[u32]) -> Vec<Arc<ServiceInstance>> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| Arc::new(ServiceInstance::new("127.0.0.1", 8001 + i as u16, *w)))
            .collect()
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let balancer = RoundRobinBalancer::new();
        let pool = instances(&[1, 1, 1]);
        let ctx = SelectionContext::default();

        let picks: Vec<usize> = (0..6).map(|_| balancer.select(&pool, &ctx).unwrap()).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_round_robin_empty_pool() {
        let balancer = RoundRobinBalancer::new();
        assert!(balancer.select(&[], &SelectionContext::default()).is_none());
    }

    #[test]
    fn test_weighted_round_robin_follows_weights() {
        let balancer = WeightedRoundRobinBalancer::new();
        let pool = instances(&[1, 2]);
        let ctx = SelectionContext::default();

        let mut counts = HashMap::new();
        for _ in 0..300 {
            *counts.entry(balancer.select(&pool, &ctx).unwrap()).or_insert(0) += 1;
        }
        assert_eq!(counts[&0], 100);
        assert_eq!(counts[&1], 200);
    }

    #[test]
    fn test_weighted_round_robin_slot_order_and_huge_weights() {
        let balancer = WeightedRoundRobinBalancer::new();
        let ctx = SelectionContext::default();

        let pool = instances(&[2, 1]);
        let picks: Vec<usize> = (0..6).map(|_| balancer.select(&pool, &ctx).unwrap()).collect();
        assert_eq!(picks, vec![0, 0, 1, 0, 0, 1]);

        let heavy = WeightedRoundRobinBalancer::new();
        let pool = instances(&[u32::MAX, u32::MAX]);
        assert_eq!(heavy.select(&pool, &ctx), Some(0));
        assert_eq!(heavy.select(&pool, &ctx), Some(0));
    }

    #[test]
    fn test_weighted_round_robin_zero_weight() {
        let balancer = WeightedRoundRobinBalancer::new();
        let ctx = SelectionContext::default();

        let pool = instances(&[0, 3]);
        for _ in 0..10 {
            assert_eq!(balancer.select(&pool, &ctx), Some(1));
        }

        assert!(balancer.select(&instances(&[0, 0]), &ctx).is_none());
    }

    #[test]
    fn test_least_connections_prefers_idle_and_breaks_ties_in_order() {
        let stats = Arc::new(ConnectionStatsStore::new());
        let balancer = LeastConnectionsBalancer::new(Arc::clone(&stats));
        let pool = instances(&[1, 1, 1]);
        let ctx = SelectionContext::default();

        assert_eq!(balancer.select(&pool, &ctx), Some(0));

        stats.record_start(&pool[0].key());
        stats.record_start(&pool[1].key());
        assert_eq!(balancer.select(&pool, &ctx), Some(2));

        stats.record_start(&pool[2].key());
        stats.record_start(&pool[2].key());
        assert_eq!(balancer.select(&pool, &ctx), Some(0));
    }

    #[test]
    fn test_selection_does_not_bill_stats() {
        let stats = Arc::new(ConnectionStatsStore::new());
        let balancer = LeastConnectionsBalancer::new(Arc::clone(&stats));
        let pool = instances(&[1, 1]);

        balancer.select(&pool, &SelectionContext::default());
        assert!(stats.get(&pool[0].key()).is_none());
    }

    #[test]
    fn test_ip_hash_is_deterministic() {
        let balancer = IpHashBalancer;
        let pool = instances(&[1, 1, 1, 1]);
        let ctx = SelectionContext::with_client_ip("203.0.113.7");

        let first = balancer.select(&pool, &ctx).unwrap();
        for _ in 0..20 {
            assert_eq!(balancer.select(&pool, &ctx), Some(first));
        }
        assert_eq!(
            first,
            (IpHashBalancer::hash_ip("203.0.113.7") % 4) as usize
        );
    }

    #[test]
    fn test_ip_hash_without_ip_picks_first() {
        let balancer = IpHashBalancer;
        let pool = instances(&[1, 1, 1]);
        assert_eq!(balancer.select(&pool, &SelectionContext::default()), Some(0));
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let balancer = RandomBalancer;
        let pool = instances(&[1, 1, 1]);
        for _ in 0..100 {
            let index = balancer.select(&pool, &SelectionContext::default()).unwrap();
            assert!(index < 3);
        }
    }

    #[test]
    fn test_eligible_instances_filters_unhealthy() {
        let pool = instances(&[1, 1, 1]);
        pool[1].set_health(false, chrono::Utc::now());

        let eligible = eligible_instances(&pool, true);
        assert_eq!(eligible.len(), 2);
        assert!(eligible.iter().all(|i| i.is_healthy()));

        assert_eq!(eligible_instances(&pool, false).len(), 3);
    }

    #[test]
    fn test_create_balancer_names() {
        let stats = Arc::new(ConnectionStatsStore::new());
        for algorithm in [
            LoadBalancingAlgorithm::RoundRobin,
            LoadBalancingAlgorithm::WeightedRoundRobin,
            LoadBalancingAlgorithm::LeastConnections,
            LoadBalancingAlgorithm::IpHash,
            LoadBalancingAlgorithm::Random,
        ] {
            let balancer = create_balancer(algorithm, Arc::clone(&stats));
            assert_eq!(balancer.algorithm_name(), algorithm.as_str());
        }
    }
}
