//! Circuit breaker around destination writes.
//!
//! When the destination is throttling or down, every replay worker would keep
//! retrying into it. The breaker watches a window of recent writes and, once
//! too many fail transiently, rejects writes outright for a recovery period.
//! After that a few trial writes decide whether it closes again.
//!
//! Only failures the caller says count are held against the destination: a
//! record rejected for its own content says nothing about destination health.
//!
//! ```rust,no_run
//! # use changefeed_migrator::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError};
//! # use changefeed_migrator::destination::WriteError;
//! # async fn example() {
//! let circuit = CircuitBreaker::new("destination_writes", CircuitConfig::default());
//!
//! let result = circuit
//!     .call_counting(WriteError::is_retryable, || async { Ok::<(), WriteError>(()) })
//!     .await;
//! match result {
//!     Ok(()) => {}
//!     Err(CircuitError::Rejected) => { /* open: back off, costs an attempt */ }
//!     Err(CircuitError::Inner(e)) => { /* the write itself failed */ }
//! }
//! # }
//! ```

use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of a call the breaker did not let through, or that failed.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not attempted.
    #[error("circuit breaker open, request rejected")]
    Rejected,

    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls evaluated while closed.
    pub window: u32,
    /// Failure rate over the window (0.0 - 1.0) that opens the circuit.
    pub failure_rate: f32,
    /// Trial calls while half-open.
    pub half_open_calls: u32,
    /// How long the circuit stays open before trial calls.
    pub recovery_timeout: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            window: 20,
            failure_rate: 0.5,
            half_open_calls: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Never trips in practice. For callers that already bound their retries.
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            window: 1000,
            failure_rate: 1.0,
            half_open_calls: 1,
            recovery_timeout: Duration::from_millis(1),
        }
    }

    /// Tiny window and quick recovery.
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            window: 2,
            failure_rate: 0.5,
            half_open_calls: 1,
            recovery_timeout: Duration::from_millis(50),
        }
    }
}

/// A named breaker with call accounting.
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,

    /// Set on rejection, cleared by the next call that gets through.
    open: AtomicBool,

    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate)
            .closed_len(config.window.max(1) as usize)
            .half_open_len(config.half_open_calls.max(1) as usize)
            .open_wait(config.recovery_timeout)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            open: AtomicBool::new(false),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` through the breaker; every error counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_counting(|_: &E| true, f).await
    }

    /// Run `f` through the breaker; only errors for which `counts` returns
    /// true are held against the circuit.
    pub async fn call_counting<P, F, Fut, T, E>(&self, counts: P, f: F) -> Result<T, CircuitError<E>>
    where
        P: Fn(&E) -> bool,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let result = self.inner.call_with(counts, f()).await;
        if !matches!(result, Err(RecloserError::Rejected)) && self.open.swap(false, Ordering::Relaxed) {
            info!(circuit = %self.name, "Circuit breaker letting calls through again");
            crate::metrics::set_circuit_open(&self.name, false);
        }

        match result {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_rejection(&self.name);
                if !self.open.swap(true, Ordering::Relaxed) {
                    warn!(circuit = %self.name, "Circuit breaker open, rejecting calls");
                    crate::metrics::set_circuit_open(&self.name, true);
                }
                Err(CircuitError::Rejected)
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, "Circuit call failed");
                Err(CircuitError::Inner(e))
            }
        }
    }

    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    /// Whether the most recent call was rejected.
    ///
    /// Recloser does not expose its state, so this lags until the next call.
    #[must_use]
    pub fn is_likely_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("open", &self.is_likely_open())
            .field("calls_total", &self.calls_total())
            .field("rejections", &self.rejections())
            .finish()
    }
}
