//! Circuit breaker implementation
//!
//! # State Transitions
//! ```text
//! Closed ──[decayed failures >= threshold]──> Open
//!   ▲                                           │
//!   │                                           │ [reset_timeout elapsed]
//!   │                                           ▼
//!   └───────[probe succeeds]──────────────── HalfOpen
//!                 [probe fails] ───────────────> Open (timer restarts)
//! ```
//!
//! A probe failing with an error the failure policy ignores neither closes
//! nor reopens the circuit; the slot is released for the next caller.
//!
//! State, failure history and the probe slot live behind a single mutex so
//! every transition is linearizable. Counters are atomics read without locking.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{CircuitBreakerConfig, FailurePolicyKind};
use crate::request::{RequestSpec, Response};
use crate::transport::{TlsContext, Transport};
use crate::{Error, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed (allowing requests)
    Closed,
    /// Circuit is open (rejecting requests)
    Open,
    /// Circuit is half-open (one probe request admitted)
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        })
    }
}

/// Predicate deciding whether a failure counts toward the trip threshold
pub type FailurePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Which failures count toward the trip threshold
#[derive(Clone)]
pub enum FailurePolicy {
    /// Every failure counts
    AllExceptions,
    /// Only transport errors carrying a 5xx status count
    ServerErrorsOnly,
    /// Caller-supplied predicate
    Custom(FailurePredicate),
}

impl FailurePolicy {
    /// Build a custom policy from a closure
    pub fn custom(predicate: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    /// Does `error` count toward the threshold?
    #[must_use]
    pub fn counts(&self, error: &Error) -> bool {
        match self {
            Self::AllExceptions => true,
            Self::ServerErrorsOnly => error.is_server_error(),
            Self::Custom(predicate) => predicate(error),
        }
    }
}

impl From<FailurePolicyKind> for FailurePolicy {
    fn from(kind: FailurePolicyKind) -> Self {
        match kind {
            FailurePolicyKind::AllExceptions => Self::AllExceptions,
            FailurePolicyKind::ServerErrorsOnly => Self::ServerErrorsOnly,
        }
    }
}

impl fmt::Debug for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllExceptions => f.write_str("AllExceptions"),
            Self::ServerErrorsOnly => f.write_str("ServerErrorsOnly"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Breaker counters snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitMetrics {
    /// Every call offered to the breaker, including rejected ones
    pub total_requests: u64,
    /// Calls whose transport attempt succeeded
    pub successful_requests: u64,
    /// Calls whose transport attempt failed (counted or not)
    pub failed_requests: u64,
    /// Calls rejected without reaching the transport
    pub rejected_requests: u64,
    /// CLOSED/HALF_OPEN → OPEN transitions
    pub circuit_trips: u64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    trips: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CircuitMetrics {
        CircuitMetrics {
            total_requests: self.total.load(Ordering::Relaxed),
            successful_requests: self.successful.load(Ordering::Relaxed),
            failed_requests: self.failed.load(Ordering::Relaxed),
            rejected_requests: self.rejected.load(Ordering::Relaxed),
            circuit_trips: self.trips.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.total,
            &self.successful,
            &self.failed,
            &self.rejected,
            &self.trips,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Mutex-guarded breaker state
struct Inner {
    state: CircuitState,
    /// Timestamps of counted failures, oldest first
    failures: VecDeque<Instant>,
    /// When the circuit last opened
    opened_at: Option<Instant>,
    /// A HALF_OPEN probe is in flight
    probe_in_flight: bool,
}

impl Inner {
    fn prune(&mut self, now: Instant, decay: Duration) {
        while let Some(&oldest) = self.failures.front() {
            if now.saturating_duration_since(oldest) >= decay {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

/// How a call was admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Breaker disabled: count only
    Bypass,
    /// Normal CLOSED admission
    Closed,
    /// The single HALF_OPEN probe
    Probe,
}

/// Circuit breaker guarding one downstream service
pub struct CircuitBreaker {
    /// Breaker name (used in logs, errors and metric labels)
    name: String,
    enabled: bool,
    failure_threshold: u32,
    reset_timeout: Duration,
    failure_decay: Duration,
    policy: FailurePolicy,
    inner: Mutex<Inner>,
    counters: Counters,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self::with_policy(name, config, config.failure_policy.into())
    }

    /// Create a circuit breaker with an explicit failure policy
    #[must_use]
    pub fn with_policy(name: &str, config: &CircuitBreakerConfig, policy: FailurePolicy) -> Self {
        Self {
            name: name.to_string(),
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout,
            failure_decay: config.failure_decay,
            policy,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                probe_in_flight: false,
            }),
            counters: Counters::default(),
        }
    }

    /// Breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run one attempt through the breaker.
    ///
    /// Fails with [`Error::CircuitOpen`] without touching `transport` while
    /// the circuit is open or a half-open probe is already in flight.
    #[tracing::instrument(skip_all, fields(breaker = %self.name, request = %request))]
    pub async fn call(&self, request: &RequestSpec, transport: &dyn Transport) -> Result<Response> {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        let admission = self.admit()?;

        let mut guard = ProbeGuard {
            breaker: self,
            armed: admission == Admission::Probe,
        };
        let result = transport.execute(request).await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(admission),
            Err(e) => self.record_failure(admission, e),
        }
        result
    }

    /// Execute `request` straight through `transport` as a liveness probe.
    ///
    /// Success and failure counters are updated, but the outcome never
    /// changes the circuit state or the failure history.
    pub async fn perform_health_check(&self, request: &RequestSpec, transport: &dyn Transport) -> bool {
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        match transport.execute(request).await {
            Ok(_) => {
                self.counters.successful.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, "Health check passed");
                true
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(breaker = %self.name, error = %e, "Health check failed");
                false
            }
        }
    }

    /// Current state. An open circuit whose reset timeout has elapsed
    /// reports (and moves to) half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open && self.reset_elapsed(&inner, Instant::now()) {
            self.transition(&mut inner, CircuitState::HalfOpen);
        }
        inner.state
    }

    /// Failures inside the decay window
    pub fn failure_count(&self) -> u32 {
        let mut inner = self.inner.lock();
        inner.prune(Instant::now(), self.failure_decay);
        u32::try_from(inner.failures.len()).unwrap_or(u32::MAX)
    }

    /// Counter snapshot
    #[must_use]
    pub fn metrics(&self) -> CircuitMetrics {
        self.counters.snapshot()
    }

    /// Force the circuit closed and clear history and counters
    pub fn reset_circuit(&self) {
        let mut inner = self.inner.lock();
        inner.failures.clear();
        inner.opened_at = None;
        inner.probe_in_flight = false;
        if inner.state != CircuitState::Closed {
            self.transition(&mut inner, CircuitState::Closed);
        }
        self.counters.reset();
        info!(breaker = %self.name, "Circuit breaker manually reset");
    }

    /// Human-readable status line
    pub fn status_message(&self) -> String {
        if !self.enabled {
            return format!("Backend '{}' circuit breaker is closed (disabled)", self.name);
        }
        let state = self.state();
        let inner = self.inner.lock();
        match state {
            CircuitState::Closed => format!(
                "Backend '{}' circuit breaker is closed ({} recent failures)",
                self.name,
                inner.failures.len()
            ),
            CircuitState::Open => {
                let retry_in = self.retry_in(&inner, Instant::now());
                format!(
                    "Backend '{}' circuit breaker is open after {} failures, retry in {} seconds",
                    self.name,
                    inner.failures.len(),
                    retry_in.as_secs().max(1)
                )
            }
            CircuitState::HalfOpen => format!(
                "Backend '{}' circuit breaker is half-open, testing recovery",
                self.name
            ),
        }
    }

    /// Decide whether a call may proceed
    fn admit(&self) -> Result<Admission> {
        if !self.enabled {
            return Ok(Admission::Bypass);
        }

        let now = Instant::now();
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            if !self.reset_elapsed(&inner, now) {
                let retry_in = self.retry_in(&inner, now);
                drop(inner);
                return Err(self.reject(retry_in));
            }
            self.transition(&mut inner, CircuitState::HalfOpen);
        }

        let state = inner.state;
        match state {
            CircuitState::Closed => {
                tracing::trace!("Circuit closed, allowing request");
                Ok(Admission::Closed)
            }
            CircuitState::HalfOpen if !inner.probe_in_flight => {
                inner.probe_in_flight = true;
                debug!(breaker = %self.name, "Circuit half-open, admitting probe request");
                Ok(Admission::Probe)
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                drop(inner);
                Err(self.reject(Duration::ZERO))
            }
        }
    }

    fn reject(&self, retry_in: Duration) -> Error {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!(
            "sentinel_http_circuit_requests_total",
            "breaker" => self.name.clone(),
            "outcome" => "rejected"
        )
        .increment(1);
        debug!(breaker = %self.name, retry_in_ms = retry_in.as_millis(), "Circuit open, rejecting request");
        Error::CircuitOpen {
            name: self.name.clone(),
            retry_in,
        }
    }

    fn record_success(&self, admission: Admission) {
        self.counters.successful.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!(
            "sentinel_http_circuit_requests_total",
            "breaker" => self.name.clone(),
            "outcome" => "success"
        )
        .increment(1);

        if admission == Admission::Probe {
            let mut inner = self.inner.lock();
            inner.probe_in_flight = false;
            inner.failures.clear();
            self.transition(&mut inner, CircuitState::Closed);
        }
    }

    fn record_failure(&self, admission: Admission, error: &Error) {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!(
            "sentinel_http_circuit_requests_total",
            "breaker" => self.name.clone(),
            "outcome" => "failure"
        )
        .increment(1);

        if admission == Admission::Bypass {
            return;
        }

        let counted = self.policy.counts(error);
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if admission == Admission::Probe {
            inner.probe_in_flight = false;
            if counted {
                inner.failures.push_back(now);
                inner.prune(now, self.failure_decay);
                warn!(breaker = %self.name, error = %error, "Probe failed, reopening circuit");
                self.trip(&mut inner, now);
            } else {
                // Not evidence of recovery either: stay half-open, next caller probes
                debug!(
                    breaker = %self.name,
                    error = %error,
                    "Probe failed with an error the policy ignores, slot released"
                );
            }
            return;
        }

        if !counted {
            debug!(breaker = %self.name, error = %error, "Failure not counted by policy");
            return;
        }

        inner.failures.push_back(now);
        inner.prune(now, self.failure_decay);
        let failures = inner.failures.len();
        warn!(breaker = %self.name, failures, threshold = self.failure_threshold, "Failure recorded");

        if inner.state == CircuitState::Closed && failures >= self.failure_threshold as usize {
            self.trip(&mut inner, now);
        }
    }

    fn trip(&self, inner: &mut Inner, now: Instant) {
        inner.opened_at = Some(now);
        self.counters.trips.fetch_add(1, Ordering::Relaxed);
        telemetry_metrics::counter!("sentinel_http_circuit_trips_total", "breaker" => self.name.clone())
            .increment(1);
        self.transition(inner, CircuitState::Open);
    }

    fn reset_elapsed(&self, inner: &Inner, now: Instant) -> bool {
        inner
            .opened_at
            .is_none_or(|opened| now.saturating_duration_since(opened) >= self.reset_timeout)
    }

    fn retry_in(&self, inner: &Inner, now: Instant) -> Duration {
        inner.opened_at.map_or(Duration::ZERO, |opened| {
            self.reset_timeout
                .saturating_sub(now.saturating_duration_since(opened))
        })
    }

    /// Transition to a new state (caller holds the lock)
    fn transition(&self, inner: &mut Inner, new_state: CircuitState) {
        let old_state = inner.state;
        inner.state = new_state;

        match new_state {
            CircuitState::Closed => {
                inner.opened_at = None;
                info!(breaker = %self.name, from = %old_state, "Circuit breaker closed");
            }
            CircuitState::Open => {
                warn!(
                    breaker = %self.name,
                    from = %old_state,
                    failures = inner.failures.len(),
                    "Circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.probe_in_flight = false;
                debug!(breaker = %self.name, "Circuit breaker half-open");
            }
        }
    }
}

/// Frees the half-open probe slot if the probe future is dropped before
/// its outcome is recorded.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock();
            inner.probe_in_flight = false;
            debug!(breaker = %self.breaker.name, "Probe abandoned, slot released");
        }
    }
}

/// [`Transport`] decorator routing every attempt through a [`CircuitBreaker`]
pub struct CircuitBreakerTransport<T> {
    breaker: Arc<CircuitBreaker>,
    inner: T,
}

impl<T: Transport> CircuitBreakerTransport<T> {
    /// Wrap `inner` with `breaker`
    pub fn new(breaker: Arc<CircuitBreaker>, inner: T) -> Self {
        Self { breaker, inner }
    }

    /// The shared breaker
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Probe the wrapped transport without affecting circuit state
    pub async fn perform_health_check(&self, request: &RequestSpec) -> bool {
        self.breaker.perform_health_check(request, &self.inner).await
    }
}

#[async_trait]
impl<T: Transport> Transport for CircuitBreakerTransport<T> {
    async fn execute(&self, request: &RequestSpec) -> Result<Response> {
        self.breaker.call(request, &self.inner).await
    }

    fn configure_ssl(&self, tls: TlsContext) -> Result<()> {
        self.inner.configure_ssl(tls)
    }

    fn set_base_url(&self, url: &str) -> Result<()> {
        self.inner.set_base_url(url)
    }
}
