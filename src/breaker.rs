//! # Circuit Breaker
//!
//! Wraps journal and snapshot store calls so that a failing database is not
//! hammered by every caller. The engine never retries on its own; the breaker
//! is the only place where repeated transient failures change behavior.
//!
//! ```text
//!            max-failures consecutive
//!            transient failures
//!   Closed ─────────────────────────► Open ──── reset-timeout elapsed ───► HalfOpen
//!     ▲                                 ▲                                    │
//!     │          trial call succeeds    │      trial call fails              │
//!     └─────────────────────────────────┼────────────────────────────────────┤
//!                                       └────────────────────────────────────┘
//! ```
//!
//! Only [`Error::is_transient`] failures and call timeouts count. Conflicts,
//! serialization failures, invalid requests and cancellations mean the
//! database answered, so they reset the failure count like a success.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::settings::CircuitBreakerConfig;

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Call counters.
#[derive(Debug, Default)]
pub struct BreakerMetrics {
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub rejections: AtomicU64,
    pub opens: AtomicU64,
}

/// Point-in-time copy of [`BreakerMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerMetricsSnapshot {
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
    pub opens: u64,
}

impl BreakerMetrics {
    pub fn snapshot(&self) -> BreakerMetricsSnapshot {
        BreakerMetricsSnapshot {
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
        }
    }
}

struct Core {
    name: String,
    max_failures: u32,
    call_timeout: Duration,
    reset_timeout: Duration,
    inner: Mutex<Inner>,
    metrics: BreakerMetrics,
}

/// Closed/Open/HalfOpen breaker with a per-call timeout.
///
/// Clones share state.
#[derive(Clone)]
pub struct CircuitBreaker {
    core: Arc<Core>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self {
            core: Arc::new(Core {
                name: name.into(),
                max_failures: config.max_failures,
                call_timeout: config.call_timeout,
                reset_timeout: config.reset_timeout,
                inner: Mutex::new(Inner {
                    state: BreakerState::Closed,
                    consecutive_failures: 0,
                    opened_at: None,
                    trial_in_flight: false,
                }),
                metrics: BreakerMetrics::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    /// Current state. An open breaker whose reset timeout has elapsed reports
    /// `HalfOpen`.
    pub fn state(&self) -> BreakerState {
        let Ok(inner) = self.core.inner.lock() else {
            return BreakerState::Open;
        };
        match inner.state {
            BreakerState::Open if self.reset_elapsed(&inner) => BreakerState::HalfOpen,
            state => state,
        }
    }

    pub fn metrics(&self) -> BreakerMetricsSnapshot {
        self.core.metrics.snapshot()
    }

    /// Runs `call` through the breaker.
    ///
    /// Dropping the returned future before it finishes records nothing; a
    /// half-open trial it carried is handed to the next caller.
    pub async fn call<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = self.admit()?;

        match tokio::time::timeout(self.core.call_timeout, call).await {
            Ok(result) => {
                permit.record(&result);
                result
            }
            Err(_) => {
                permit.record_failure();
                Err(Error::Connection(format!(
                    "{} call timed out after {:?}",
                    self.core.name, self.core.call_timeout
                )))
            }
        }
    }

    /// Admits a call that is not wrapped by [`CircuitBreaker::call`], such as
    /// a long-lived replay stream. The caller reports the outcome through the
    /// permit.
    pub fn admit(&self) -> Result<CallPermit> {
        let trial = self.before_call()?;
        Ok(CallPermit {
            breaker: self.clone(),
            trial,
            settled: false,
        })
    }

    fn reset_elapsed(&self, inner: &Inner) -> bool {
        inner
            .opened_at
            .map(|at| at.elapsed() >= self.core.reset_timeout)
            .unwrap_or(true)
    }

    /// Returns whether the admitted call is the half-open trial.
    fn before_call(&self) -> Result<bool> {
        let mut inner = self.core.inner.lock().map_err(|_| Error::CircuitOpen)?;
        match inner.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open if self.reset_elapsed(&inner) => {
                inner.state = BreakerState::HalfOpen;
                inner.trial_in_flight = true;
                info!(breaker = %self.core.name, "circuit breaker half-open, admitting trial call");
                Ok(true)
            }
            BreakerState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(true)
            }
            _ => {
                self.core.metrics.rejections.fetch_add(1, Ordering::Relaxed);
                Err(Error::CircuitOpen)
            }
        }
    }

    fn on_success(&self) {
        self.core.metrics.successes.fetch_add(1, Ordering::Relaxed);
        let Ok(mut inner) = self.core.inner.lock() else {
            return;
        };
        if inner.state != BreakerState::Closed {
            info!(breaker = %self.core.name, "circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    fn on_failure(&self) {
        self.core.metrics.failures.fetch_add(1, Ordering::Relaxed);
        let Ok(mut inner) = self.core.inner.lock() else {
            return;
        };
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.core.max_failures,
            BreakerState::Open => false,
        };
        if trip {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
            self.core.metrics.opens.fetch_add(1, Ordering::Relaxed);
            warn!(
                breaker = %self.core.name,
                failures = inner.consecutive_failures,
                reset_timeout = ?self.core.reset_timeout,
                "circuit breaker opened"
            );
        }
    }

    /// A trial that ended without an outcome frees the slot for the next call.
    fn abandon_trial(&self) {
        let Ok(mut inner) = self.core.inner.lock() else {
            return;
        };
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
            debug!(breaker = %self.core.name, "half-open trial abandoned");
        }
    }
}

// =============================================================================
// Permit
// =============================================================================

/// One admitted call. Record its outcome with [`CallPermit::record`];
/// dropping it unrecorded leaves the failure count untouched.
pub struct CallPermit {
    breaker: CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    /// Counts `result` like [`CircuitBreaker::call`] would: only transient
    /// errors are failures.
    pub fn record<T>(self, result: &Result<T>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_error(e),
        }
    }

    pub fn record_success(mut self) {
        self.settled = true;
        self.breaker.on_success();
    }

    pub fn record_error(mut self, error: &Error) {
        self.settled = true;
        if error.is_transient() {
            self.breaker.on_failure();
        } else {
            self.breaker.on_success();
        }
    }

    fn record_failure(mut self) {
        self.settled = true;
        self.breaker.on_failure();
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.abandon_trial();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
