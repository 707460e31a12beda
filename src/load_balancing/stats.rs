//! Per-instance connection statistics
//!
//! One [`ConnectionStats`] entry per instance key (`"host:port"`), held in a
//! `DashMap` so request tasks for different instances never contend.
//! The least-connections balancer reads `active_connections` from here; the
//! forwarder is the only writer, through [`InFlightGuard`].

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Number of response-time samples kept per instance
pub const RESPONSE_TIME_SAMPLES: usize = 100;

#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub response_times: VecDeque<Duration>,
    pub last_request_time: Option<DateTime<Utc>>,
}

impl ConnectionStats {
    /// Fraction of requests that did not fail; 1.0 before the first request
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        (self.total_requests - self.failed_requests) as f64 / self.total_requests as f64
    }

    /// Mean of the retained samples, in milliseconds
    pub fn average_response_time_ms(&self) -> f64 {
        if self.response_times.is_empty() {
            return 0.0;
        }
        let total: f64 = self
            .response_times
            .iter()
            .map(|d| d.as_secs_f64() * 1000.0)
            .sum();
        total / self.response_times.len() as f64
    }

    fn push_sample(&mut self, sample: Duration) {
        if self.response_times.len() == RESPONSE_TIME_SAMPLES {
            self.response_times.pop_front();
        }
        self.response_times.push_back(sample);
    }

    pub fn snapshot(&self) -> ConnectionStatsSnapshot {
        ConnectionStatsSnapshot {
            active_connections: self.active_connections,
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            success_rate: self.success_rate(),
            average_response_time_ms: self.average_response_time_ms(),
            last_request_time: self.last_request_time,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStatsSnapshot {
    pub active_connections: u64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub success_rate: f64,
    pub average_response_time_ms: f64,
    pub last_request_time: Option<DateTime<Utc>>,
}

/// Shared connection statistics keyed by instance key
#[derive(Debug, Default)]
pub struct ConnectionStatsStore {
    stats: DashMap<String, ConnectionStats>,
}

impl ConnectionStatsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a request as started against `key`
    pub fn record_start(&self, key: &str) {
        let mut entry = self.stats.entry(key.to_string()).or_default();
        entry.active_connections += 1;
        entry.total_requests += 1;
        entry.last_request_time = Some(Utc::now());
    }

    /// Count a request against `key` as finished
    ///
    /// Unknown keys are ignored; the active count never drops below zero.
    pub fn record_end(&self, key: &str, success: bool, response_time: Option<Duration>) {
        if let Some(mut entry) = self.stats.get_mut(key) {
            entry.active_connections = entry.active_connections.saturating_sub(1);
            if !success {
                entry.failed_requests += 1;
            }
            if let Some(sample) = response_time {
                entry.push_sample(sample);
            }
        }
    }

    /// Start billing `key` and return a guard that finishes it
    pub fn begin(self: &Arc<Self>, key: &str) -> InFlightGuard {
        self.record_start(key);
        InFlightGuard {
            store: Arc::clone(self),
            key: key.to_string(),
            started_at: Instant::now(),
            finished: false,
        }
    }

    pub fn active_connections(&self, key: &str) -> u64 {
        self.stats
            .get(key)
            .map(|entry| entry.active_connections)
            .unwrap_or(0)
    }

    pub fn get(&self, key: &str) -> Option<ConnectionStats> {
        self.stats.get(key).map(|entry| entry.clone())
    }

    /// Snapshot for `key`; an instance never billed reports the empty stats
    pub fn snapshot(&self, key: &str) -> ConnectionStatsSnapshot {
        self.stats
            .get(key)
            .map(|entry| entry.snapshot())
            .unwrap_or_else(|| ConnectionStats::default().snapshot())
    }

    pub fn remove(&self, key: &str) {
        self.stats.remove(key);
    }
}

/// Active request against one instance
///
/// Dropping the guard without calling [`InFlightGuard::finish`] records the
/// request as failed, which is what happens when the inbound request future
/// is cancelled mid-flight.
#[derive(Debug)]
pub struct InFlightGuard {
    store: Arc<ConnectionStatsStore>,
    key: String,
    started_at: Instant,
    finished: bool,
}

impl InFlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn finish(mut self, success: bool, response_time: Option<Duration>) {
        self.finished = true;
        self.store.record_end(&self.key, success, response_time);
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.store.record_end(&self.key, false, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate_defaults_to_one() {
        let stats = ConnectionStats::default();
        assert_eq!(stats.success_rate(), 1.0);
        assert_eq!(stats.average_response_time_ms(), 0.0);
    }

    #[test]
    fn test_start_and_end_update_counters() {
        let store = ConnectionStatsStore::new();
        store.record_start("a:1");
        store.record_start("a:1");
        assert_eq!(store.active_connections("a:1"), 2);

        store.record_end("a:1", true, Some(Duration::from_millis(10)));
        store.record_end("a:1", false, Some(Duration::from_millis(30)));

        let stats = store.get("a:1").unwrap();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_requests, 2);
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.success_rate(), 0.5);
        assert!((stats.average_response_time_ms() - 20.0).abs() < 1e-6);
    }

    #[test]
    fn test_end_never_goes_negative() {
        let store = ConnectionStatsStore::new();
        store.record_end("unknown:1", true, None);
        assert!(store.get("unknown:1").is_none());

        store.record_start("a:1");
        store.record_end("a:1", true, None);
        store.record_end("a:1", true, None);
        assert_eq!(store.active_connections("a:1"), 0);
    }

    #[test]
    fn test_response_time_ring_is_bounded() {
        let store = ConnectionStatsStore::new();
        store.record_start("a:1");
        for ms in 0..(RESPONSE_TIME_SAMPLES as u64 + 20) {
            store.record_end("a:1", true, Some(Duration::from_millis(ms)));
        }
        let stats = store.get("a:1").unwrap();
        assert_eq!(stats.response_times.len(), RESPONSE_TIME_SAMPLES);
        assert_eq!(stats.response_times.front(), Some(&Duration::from_millis(20)));
    }

    #[test]
    fn test_guard_drop_records_failure() {
        let store = Arc::new(ConnectionStatsStore::new());
        {
            let _guard = store.begin("a:1");
            assert_eq!(store.active_connections("a:1"), 1);
        }
        let stats = store.get("a:1").unwrap();
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.failed_requests, 1);

        let guard = store.begin("a:1");
        guard.finish(true, Some(Duration::from_millis(5)));
        let stats = store.get("a:1").unwrap();
        assert_eq!(stats.failed_requests, 1);
        assert_eq!(stats.total_requests, 2);
    }
}
