//! Sticky session pinning
//!
//! Maps a session id (from the session cookie) to the instance that served
//! it first. Records expire after a TTL; expiry is checked on lookup and by
//! [`StickySessionManager::cleanup_expired`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::core::types::ServiceInstance;

#[derive(Debug, Clone)]
struct SessionRecord {
    instance_key: String,
    created_at: Instant,
}

#[derive(Debug)]
pub struct StickySessionManager {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    ttl: Duration,
}

impl StickySessionManager {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Instance pinned to `session_id`, if it is still among `instances`
    ///
    /// An expired record, or one pointing at an instance not in `instances`,
    /// is deleted and `None` is returned.
    pub fn get_instance(
        &self,
        session_id: &str,
        instances: &[Arc<ServiceInstance>],
    ) -> Option<Arc<ServiceInstance>> {
        let mut sessions = self.sessions.lock();
        let record = sessions.get(session_id)?;

        if record.created_at.elapsed() > self.ttl {
            sessions.remove(session_id);
            debug!(session_id = %session_id, "Sticky session expired");
            return None;
        }

        match instances.iter().find(|i| i.key() == record.instance_key) {
            Some(instance) => Some(Arc::clone(instance)),
            None => {
                debug!(
                    session_id = %session_id,
                    instance = %record.instance_key,
                    "Pinned instance no longer eligible, dropping sticky session"
                );
                sessions.remove(session_id);
                None
            }
        }
    }

    /// Pin `session_id` to `instance`, replacing any previous pin
    pub fn create(&self, session_id: &str, instance: &ServiceInstance) {
        self.sessions.lock().insert(
            session_id.to_string(),
            SessionRecord {
                instance_key: instance.key(),
                created_at: Instant::now(),
            },
        );
    }

    /// Remove every expired record, returning how many were dropped
    pub fn cleanup_expired(&self) -> usize {
        let removed = {
            let mut sessions = self.sessions.lock();
            let before = sessions.len();
            sessions.retain(|_, record| record.created_at.elapsed() <= self.ttl);
            before - sessions.len()
        };

        if removed > 0 {
            info!(removed = removed, "Cleaned up expired sticky sessions");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StickySessionManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(3600))
    }
}
