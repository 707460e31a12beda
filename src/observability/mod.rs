// Out-of-band instance health probing
pub mod health;

// Request and error aggregation
pub mod metrics;

// Re-export commonly used types for convenience
pub use health::{HealthCheckResult, HealthChecker, HealthProbe, InstanceSource};
pub use metrics::{ErrorMetric, MetricsCollector, MetricsSnapshot, RequestMetric};
