//! # Core Types Module
//!
//! Data structures shared by the router, the load balancer, the health checker
//! and the request forwarder.
//!
//! ## Rust Ownership Concepts in This Module
//!
//! - A [`ServiceInstance`] is created once from route configuration and then
//!   shared through `Arc<ServiceInstance>` by every component that needs it.
//! - Its health flag is an `AtomicBool`, so the health checker can flip it
//!   through a shared reference while request tasks read it without locking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::config::InstanceConfig;

/// One upstream process serving a service
///
/// Identity is `(host, port)`. Instances start healthy and only the health
/// checker changes that.
#[derive(Debug)]
pub struct ServiceInstance {
    pub host: String,
    pub port: u16,
    /// Relative weight for `weighted_round_robin`; 0 excludes the instance
    pub weight: u32,
    healthy: AtomicBool,
    last_health_check: Mutex<Option<DateTime<Utc>>>,
}

impl ServiceInstance {
    pub fn new(host: impl Into<String>, port: u16, weight: u32) -> Self {
        Self {
            host: host.into(),
            port,
            weight,
            healthy: AtomicBool::new(true),
            last_health_check: Mutex::new(None),
        }
    }

    pub fn from_config(config: &InstanceConfig) -> Self {
        Self::new(config.host.clone(), config.port, config.weight)
    }

    /// `"host:port"`, used as the key for stats, sticky records and health history
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// Record the outcome of a health probe
    pub fn set_health(&self, healthy: bool, checked_at: DateTime<Utc>) {
        self.healthy.store(healthy, Ordering::Release);
        *self.last_health_check.lock() = Some(checked_at);
    }

    pub fn last_health_check(&self) -> Option<DateTime<Utc>> {
        *self.last_health_check.lock()
    }

    pub fn snapshot(&self) -> ServiceInstanceSnapshot {
        ServiceInstanceSnapshot {
            host: self.host.clone(),
            port: self.port,
            weight: self.weight,
            url: self.base_url(),
            healthy: self.is_healthy(),
            last_health_check: self.last_health_check(),
        }
    }
}

/// Serializable view of an instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstanceSnapshot {
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub url: String,
    pub healthy: bool,
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Authentication context produced by a token validator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    /// Unique user identifier (the `sub` claim)
    pub user_id: String,

    pub username: Option<String>,

    pub email: Option<String>,

    /// User roles for authorization
    pub roles: Vec<String>,

    /// Remaining claims from the token
    pub claims: HashMap<String, serde_json::Value>,
}

impl AuthContext {
    /// Check if user has a specific role
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    /// True when `allowed` is empty or shares at least one role with the user
    pub fn has_any_role(&self, allowed: &[String]) -> bool {
        allowed.is_empty() || allowed.iter().any(|role| self.has_role(role))
    }
}

/// Per-request data gathered by the forwarder before an instance is picked
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Propagated from the inbound trace header or freshly generated
    pub trace_id: String,

    /// Always freshly generated
    pub span_id: String,

    pub client_ip: Option<String>,

    /// Value of the sticky session cookie, when present
    pub session_id: Option<String>,

    pub auth: Option<AuthContext>,

    pub started_at: Instant,
}

impl RequestContext {
    pub fn new(trace_id: Option<String>) -> Self {
        Self {
            trace_id: trace_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            span_id: Uuid::new_v4().to_string(),
            client_ip: None,
            session_id: None,
            auth: None,
            started_at: Instant::now(),
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.auth.as_ref().map(|auth| auth.user_id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_identity_and_url() {
        let instance = ServiceInstance::new("10.0.0.5", 8080, 2);
        assert_eq!(instance.key(), "10.0.0.5:8080");
        assert_eq!(instance.base_url(), "http://10.0.0.5:8080");
        assert!(instance.is_healthy());
        assert!(instance.last_health_check().is_none());
    }

    #[test]
    fn test_set_health_updates_flag_and_timestamp() {
        let instance = ServiceInstance::new("localhost", 9000, 1);
        let now = Utc::now();
        instance.set_health(false, now);

        let snapshot = instance.snapshot();
        assert!(!snapshot.healthy);
        assert_eq!(snapshot.last_health_check, Some(now));
    }

    #[test]
    fn test_request_context_trace_ids() {
        let propagated = RequestContext::new(Some("trace-abc".to_string()));
        assert_eq!(propagated.trace_id, "trace-abc");

        let fresh = RequestContext::new(None);
        assert!(Uuid::parse_str(&fresh.trace_id).is_ok());
        assert_ne!(fresh.trace_id, fresh.span_id);
    }

    #[test]
    fn test_auth_context_roles() {
        let auth = AuthContext {
            user_id: "42".to_string(),
            username: Some("alice".to_string()),
            email: None,
            roles: vec!["editor".to_string()],
            claims: HashMap::new(),
        };

        assert!(auth.has_any_role(&[]));
        assert!(auth.has_any_role(&["admin".to_string(), "editor".to_string()]));
        assert!(!auth.has_any_role(&["admin".to_string()]));
    }
}
