//! Bounded retry policy for optimistic read-check-write sequences.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// How many times an optimistic sequence runs and how long to wait between runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    retries: u32,
    backoff: Duration,
}

/// Returned when every attempt either conflicted or failed.
#[derive(Debug)]
pub struct RetryExhausted<E> {
    pub attempts: u32,
    pub last_error: Option<E>,
}

impl RetryPolicy {
    /// `retries` extra attempts after the first, `backoff` between them.
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self { retries, backoff }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }

    /// Run `op` until it settles.
    ///
    /// `op` gets the 1-based attempt number and must re-read all state it
    /// depends on. `Ok(Some(v))` settles with `v`, `Ok(None)` is a conflict
    /// and `Err(e)` a transient failure; both are retried.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryExhausted<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
        E: std::fmt::Display,
    {
        let attempts = self.max_attempts();
        let mut last_error = None;

        for attempt in 1..=attempts {
            match op(attempt).await {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    debug!(attempt, attempts, "Optimistic attempt conflicted");
                }
                Err(e) => {
                    debug!(attempt, attempts, error = %e, "Optimistic attempt failed");
                    last_error = Some(e);
                }
            }

            if attempt < attempts && !self.backoff.is_zero() {
                tokio::time::sleep(self.backoff).await;
            }
        }

        Err(RetryExhausted {
            attempts,
            last_error,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::ZERO)
    }
}
