//! Circuit Breaker Implementation
//!
//! A per-upstream state machine that fails fast once an upstream keeps failing,
//! instead of queuing requests behind a dying dependency.
//!
//! ## States:
//! - **Closed**: Normal operation. Consecutive failures are counted and reaching
//!   `failure_threshold` trips the circuit.
//! - **Open**: Calls are rejected immediately until `recovery_timeout` has passed
//!   since the last failure; the next call then moves the circuit to HalfOpen
//!   before it executes.
//! - **HalfOpen**: At most `half_open_max_calls` trial calls run at once; a
//!   slot frees up when its call finishes or is abandoned. Any failure reopens
//!   the circuit, `success_threshold` consecutive successes close it.
//!
//! Every call made through [`CircuitBreaker::call`] also carries a hard timeout;
//! hitting it counts as a failure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Outcome of a call rejected or failed by the breaker
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open")]
    Open,
    #[error("Call timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Inner(E),
}

/// Circuit breaker state machine
#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerState {
    /// Tracks the number of consecutive failures
    Closed { failure_count: u32 },

    /// Records when the circuit was opened
    Open { opened_at: Instant },

    /// Successes seen in the current half-open generation and trial calls
    /// still running
    HalfOpen { success_count: u32, in_flight: u32 },
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed { .. } => "closed",
            Self::Open { .. } => "open",
            Self::HalfOpen { .. } => "half_open",
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Whether calls go through the breaker at all
    pub enabled: bool,

    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,

    /// How long to wait after the last failure before probing again
    #[serde(with = "humantime_serde")]
    pub recovery_timeout: Duration,

    /// Number of consecutive successes needed in HalfOpen to close the circuit
    pub success_threshold: u32,

    /// Maximum number of trial calls running at once while HalfOpen
    pub half_open_max_calls: u32,

    /// Hard deadline applied to every call
    #[serde(with = "humantime_serde")]
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 3,
            half_open_max_calls: 3,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Metrics collected by the circuit breaker
///
/// Uses atomic operations for lock-free updates from multiple tasks
#[derive(Debug, Default)]
pub struct CircuitBreakerMetrics {
    pub total_calls: AtomicU64,
    pub successful_calls: AtomicU64,
    pub failed_calls: AtomicU64,
    pub rejected_calls: AtomicU64,
    pub timed_out_calls: AtomicU64,
    pub circuit_opened_count: AtomicU64,
    pub circuit_closed_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    /// Get a snapshot of current metrics
    pub fn snapshot(&self) -> CircuitBreakerMetricsSnapshot {
        CircuitBreakerMetricsSnapshot {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            successful_calls: self.successful_calls.load(Ordering::Relaxed),
            failed_calls: self.failed_calls.load(Ordering::Relaxed),
            rejected_calls: self.rejected_calls.load(Ordering::Relaxed),
            timed_out_calls: self.timed_out_calls.load(Ordering::Relaxed),
            circuit_opened_count: self.circuit_opened_count.load(Ordering::Relaxed),
            circuit_closed_count: self.circuit_closed_count.load(Ordering::Relaxed),
        }
    }

    /// Calculate failure rate as a percentage
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_calls.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let failed = self.failed_calls.load(Ordering::Relaxed);
        (failed as f64 / total as f64) * 100.0
    }
}

/// Immutable snapshot of circuit breaker metrics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerMetricsSnapshot {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub timed_out_calls: u64,
    pub circuit_opened_count: u64,
    pub circuit_closed_count: u64,
}

/// Serializable view of a breaker for the admin API
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: &'static str,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout_ms: u64,
    pub call_timeout_ms: u64,
    pub metrics: CircuitBreakerMetricsSnapshot,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    last_failure: Option<Instant>,
    last_failure_wall: Option<DateTime<Utc>>,
    /// Bumped on every entry into HalfOpen
    generation: u64,
}

/// Per-upstream circuit breaker
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: CircuitBreakerConfig,
    metrics: Arc<CircuitBreakerMetrics>,
    name: String,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner {
                state: CircuitBreakerState::Closed { failure_count: 0 },
                last_failure: None,
                last_failure_wall: None,
                generation: 0,
            }),
            config,
            metrics: Arc::new(CircuitBreakerMetrics::default()),
            name: name.into(),
        }
    }

    /// Create a circuit breaker with default configuration
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Run `fut` under the breaker and its hard timeout
    ///
    /// A rejected call never polls `fut`. Any `Err` from `fut` and any timeout
    /// are recorded as failures. Dropping the returned future mid-flight
    /// gives back its half-open slot without recording an outcome.
    pub async fn call<F, T, E>(&self, fut: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        if !self.config.enabled {
            return fut.await.map_err(CircuitBreakerError::Inner);
        }

        let permit = self.acquire()?;

        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(err)) => {
                permit.failure();
                Err(CircuitBreakerError::Inner(err))
            }
            Err(_) => {
                self.metrics.timed_out_calls.fetch_add(1, Ordering::Relaxed);
                permit.failure();
                Err(CircuitBreakerError::Timeout(self.config.call_timeout))
            }
        }
    }

    /// Check whether a call may proceed, moving Open → HalfOpen when the
    /// recovery timeout has elapsed
    ///
    /// In HalfOpen the permit holds one of `half_open_max_calls` slots until it
    /// is settled or dropped.
    pub fn acquire<E>(&self) -> Result<CallPermit<'_>, CircuitBreakerError<E>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let admitted = match inner.state {
            CircuitBreakerState::Closed { .. } => Some(None),
            CircuitBreakerState::Open { .. } => {
                let recovered = inner
                    .last_failure
                    .map(|at| now.duration_since(at) >= self.config.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    inner.generation += 1;
                    inner.state = CircuitBreakerState::HalfOpen {
                        success_count: 0,
                        in_flight: 1,
                    };
                    info!(breaker = %self.name, "Circuit breaker moved to HALF_OPEN");
                    Some(Some(inner.generation))
                } else {
                    None
                }
            }
            CircuitBreakerState::HalfOpen {
                success_count,
                in_flight,
            } => {
                if in_flight < self.config.half_open_max_calls.max(1) {
                    inner.state = CircuitBreakerState::HalfOpen {
                        success_count,
                        in_flight: in_flight + 1,
                    };
                    Some(Some(inner.generation))
                } else {
                    None
                }
            }
        };

        match admitted {
            Some(generation) => {
                self.metrics.total_calls.fetch_add(1, Ordering::Relaxed);
                Ok(CallPermit {
                    breaker: self,
                    generation,
                    settled: false,
                })
            }
            None => {
                self.metrics.rejected_calls.fetch_add(1, Ordering::Relaxed);
                Err(CircuitBreakerError::Open)
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.settle_success(None);
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        self.settle_failure();
    }

    fn settle_success(&self, generation: Option<u64>) {
        let mut inner = self.inner.lock();
        self.metrics.successful_calls.fetch_add(1, Ordering::Relaxed);
        let current = inner.generation;

        match inner.state {
            CircuitBreakerState::Closed { .. } => {
                inner.state = CircuitBreakerState::Closed { failure_count: 0 };
            }
            CircuitBreakerState::Open { .. } => {}
            CircuitBreakerState::HalfOpen {
                success_count,
                in_flight,
            } => {
                let in_flight = match generation {
                    Some(g) if g == current => in_flight.saturating_sub(1),
                    _ => in_flight,
                };
                let success_count = success_count + 1;
                if success_count >= self.config.success_threshold {
                    inner.state = CircuitBreakerState::Closed { failure_count: 0 };
                    self.metrics.circuit_closed_count.fetch_add(1, Ordering::Relaxed);
                    info!(breaker = %self.name, "Circuit breaker moved to CLOSED");
                } else {
                    inner.state = CircuitBreakerState::HalfOpen {
                        success_count,
                        in_flight,
                    };
                }
            }
        }
    }

    fn settle_failure(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        self.metrics.failed_calls.fetch_add(1, Ordering::Relaxed);
        inner.last_failure = Some(now);
        inner.last_failure_wall = Some(Utc::now());

        match inner.state {
            CircuitBreakerState::Closed { failure_count } => {
                let failure_count = failure_count + 1;
                if failure_count >= self.config.failure_threshold {
                    inner.state = CircuitBreakerState::Open { opened_at: now };
                    self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        breaker = %self.name,
                        failures = failure_count,
                        "Circuit breaker moved to OPEN (threshold reached)"
                    );
                } else {
                    inner.state = CircuitBreakerState::Closed { failure_count };
                }
            }
            CircuitBreakerState::Open { .. } => {}
            CircuitBreakerState::HalfOpen { .. } => {
                inner.state = CircuitBreakerState::Open { opened_at: now };
                self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
                warn!(breaker = %self.name, "Circuit breaker moved to OPEN (half-open failure)");
            }
        }
    }

    /// Give back a half-open slot whose call never finished
    fn release(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        if let CircuitBreakerState::HalfOpen {
            success_count,
            in_flight,
        } = inner.state
        {
            inner.state = CircuitBreakerState::HalfOpen {
                success_count,
                in_flight: in_flight.saturating_sub(1),
            };
            debug!(breaker = %self.name, "Released half-open slot of an abandoned call");
        }
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitBreakerState {
        self.inner.lock().state.clone()
    }

    /// Consecutive failures while closed
    pub fn failure_count(&self) -> u32 {
        match self.inner.lock().state {
            CircuitBreakerState::Closed { failure_count } => failure_count,
            CircuitBreakerState::Open { .. } => self.config.failure_threshold,
            CircuitBreakerState::HalfOpen { .. } => 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<CircuitBreakerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        let (failure_count, success_count) = match inner.state {
            CircuitBreakerState::Closed { failure_count } => (failure_count, 0),
            CircuitBreakerState::Open { .. } => (self.config.failure_threshold, 0),
            CircuitBreakerState::HalfOpen { success_count, .. } => (0, success_count),
        };

        CircuitBreakerSnapshot {
            name: self.name.clone(),
            state: inner.state.as_str(),
            failure_count,
            success_count,
            last_failure_time: inner.last_failure_wall,
            failure_threshold: self.config.failure_threshold,
            success_threshold: self.config.success_threshold,
            recovery_timeout_ms: self.config.recovery_timeout.as_millis() as u64,
            call_timeout_ms: self.config.call_timeout.as_millis() as u64,
            metrics: self.metrics.snapshot(),
        }
    }

    /// Manually force the circuit breaker to open (for admin override)
    pub fn force_open(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.state = CircuitBreakerState::Open { opened_at: now };
        inner.last_failure = Some(now);
        inner.last_failure_wall = Some(Utc::now());
        self.metrics.circuit_opened_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Manually force the circuit breaker to close (for admin override)
    pub fn force_close(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitBreakerState::Closed { failure_count: 0 };
        self.metrics.circuit_closed_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Manually force the circuit breaker to half-open (for admin override)
    pub fn force_half_open(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.state = CircuitBreakerState::HalfOpen {
            success_count: 0,
            in_flight: 0,
        };
    }
}

/// Admission for one call through a [`CircuitBreaker`]
///
/// Settle it with [`CallPermit::success`] or [`CallPermit::failure`]. A permit
/// dropped unsettled, e.g. because the caller went away, frees its half-open
/// slot and records nothing.
#[must_use = "dropping a permit without settling it records no outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: Option<u64>,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.settle_success(self.generation);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.settle_failure();
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        if let Some(generation) = self.generation {
            self.breaker.release(generation);
        }
    }
}

/// One breaker per upstream service name
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Get or create the breaker for `name` using the registry's configuration
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().get(name).cloned()
    }

    /// All breakers, sorted by name
    pub fn get_all(&self) -> Vec<Arc<CircuitBreaker>> {
        let mut all: Vec<_> = self.breakers.lock().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.lock().remove(name)
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
