pub mod balancer;
pub mod stats;
pub mod sticky;

pub use balancer::{create_balancer, eligible_instances, LoadBalancer, SelectionContext};
pub use stats::{ConnectionStats, ConnectionStatsStore, InFlightGuard};
pub use sticky::StickySessionManager;
