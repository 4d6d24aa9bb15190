//! Bounded exponential backoff for connector calls.

use async_trait::async_trait;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tessera_connectors::ConnectorError;

/// Retry configuration applied to each source read and target write.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// Told about every failed attempt that will be retried.
#[async_trait]
pub trait AttemptObserver: Send + Sync {
    async fn attempt_failed(&self, operation: &str, error: &ConnectorError);
}

/// Observer for retries outside a run; `run` already logs each attempt.
pub struct LogOnly;

#[async_trait]
impl AttemptObserver for LogOnly {
    async fn attempt_failed(&self, _operation: &str, _error: &ConnectorError) {}
}

impl RetryPolicy {
    /// No retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before the attempt following failed attempt `attempt`
    /// (1-based), before jitter.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// Random delay within the upper half of the backoff window.
    fn jittered(&self, attempt: u32) -> Duration {
        let delay = self.delay_after(attempt);
        if delay.is_zero() {
            return delay;
        }
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        delay.mul_f64(factor)
    }

    /// Run `op` until it succeeds, fails terminally, or the attempt budget
    /// is spent. Only transient errors are retried.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &str,
        observer: &dyn AttemptObserver,
        mut op: F,
    ) -> Result<T, ConnectorError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.jittered(attempt);
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    observer.attempt_failed(operation, &e).await;
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::error!(operation, attempt, error = %e, "Retries exhausted");
                    } else {
                        tracing::debug!(operation, error = %e, "Terminal failure, not retrying");
                    }
                    return Err(e);
                }
            }
        }
    }
}
