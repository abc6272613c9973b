//! Operation fabric: timeout, retry-with-backoff, safe-wrap, circuit breaker.
//!
//! Every browser-side operation in the gateway goes through these primitives;
//! no other component manipulates cancellation or deadlines directly.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

#[derive(Error, Debug)]
pub enum FabricError {
    #[error("operation timed out: {label}")]
    Timeout { label: String },

    #[error("retries exhausted: {last}")]
    RetryExhausted { last: String },

    #[error("circuit breaker is open")]
    CircuitOpen,

    #[error("{0}")]
    Op(String),
}

impl FabricError {
    /// Whether this is a deadline expiry (as opposed to the operation's own
    /// failure).
    pub fn is_timeout(&self) -> bool {
        matches!(self, FabricError::Timeout { .. })
    }
}

/// Race `op` against a deadline. Cancellation is cooperative: the future is
/// dropped on expiry, but work it spawned may continue in the background.
pub async fn with_timeout<T, E, F>(op: F, deadline: Duration, label: &str) -> Result<T, FabricError>
where
    F: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    match tokio::time::timeout(deadline, op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(FabricError::Op(e.to_string())),
        Err(_) => Err(FabricError::Timeout {
            label: label.to_string(),
        }),
    }
}

/// Retry policy: attempt count, base backoff, and per-attempt deadline.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
    pub timeout: Duration,
}

/// Run `op` up to `policy.retries` times, each attempt wrapped in
/// [`with_timeout`]. The delay before retry attempt *i* grows as
/// `backoff * 2^i`.
pub async fn with_retry<T, E, F, Fut>(
    mut op: F,
    policy: &RetryPolicy,
    label: &str,
) -> Result<T, FabricError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let attempts = policy.retries.max(1);
    let mut last_error = FabricError::Op("no attempts made".to_string());

    for attempt in 0..attempts {
        if attempt > 0 {
            let delay = policy.backoff * 2u32.saturating_pow(attempt);
            tracing::debug!(label, attempt, ?delay, "retrying after backoff");
            tokio::time::sleep(delay).await;
        }

        match with_timeout(op(), policy.timeout, label).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                tracing::warn!(label, attempt, error = %e, "attempt failed");
                last_error = e;
            }
        }
    }

    Err(FabricError::RetryExhausted {
        last: last_error.to_string(),
    })
}

/// Execute `op`; on failure invoke `on_error` and return `fallback`. Never
/// propagates.
pub async fn safe<T, E, Fut>(op: Fut, fallback: T, on_error: impl FnOnce(&E)) -> T
where
    Fut: Future<Output = Result<T, E>>,
{
    match op.await {
        Ok(value) => value,
        Err(e) => {
            on_error(&e);
            fallback
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy)]
pub struct BreakerState {
    pub is_open: bool,
    pub failures: u32,
    pub last_failure_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    failures: u32,
    last_failure: Option<Instant>,
    open: bool,
}

/// Circuit breaker with states Closed and Open.
///
/// Failures accumulate; at `threshold` the breaker opens and every call fails
/// fast. Once `reset_after` has elapsed since the last failure the next call
/// is admitted again (half-open collapsed into an eager reset); success
/// closes the breaker and zeroes the counter.
pub struct CircuitBreaker {
    threshold: u32,
    reset_after: Duration,
    inner: parking_lot::Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_after: Duration) -> Self {
        Self {
            threshold,
            reset_after,
            inner: parking_lot::Mutex::new(BreakerInner {
                failures: 0,
                last_failure: None,
                open: false,
            }),
        }
    }

    pub async fn call<T, E, Fut>(&self, op: Fut) -> Result<T, FabricError>
    where
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        {
            let mut inner = self.inner.lock();
            if inner.open {
                let cooled_down = inner
                    .last_failure
                    .map(|at| at.elapsed() > self.reset_after)
                    .unwrap_or(true);
                if !cooled_down {
                    return Err(FabricError::CircuitOpen);
                }
                // Cooldown elapsed: admit this call as the probe.
                inner.open = false;
                inner.failures = 0;
            }
        }

        match op.await {
            Ok(value) => {
                let mut inner = self.inner.lock();
                inner.failures = 0;
                inner.open = false;
                Ok(value)
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.failures += 1;
                inner.last_failure = Some(Instant::now());
                if inner.failures >= self.threshold {
                    inner.open = true;
                    tracing::warn!(
                        failures = inner.failures,
                        "circuit breaker opened"
                    );
                }
                Err(FabricError::Op(e.to_string()))
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        let inner = self.inner.lock();
        BreakerState {
            is_open: inner.open,
            failures: inner.failures,
            last_failure_at: inner.last_failure,
        }
    }
}
