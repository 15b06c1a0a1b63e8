//! Retry Logic
//!
//! Exponential backoff for transient generator failures.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tokio_evolve_orchestrator::retry::{retry_if, RetryPolicy};
//!
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
//!
//! let text = retry_if(&policy, || generator.generate(&prompt, &params), |e| e.is_retryable()).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::GenerationConfig;

/// Exponential backoff policy.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: usize,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl RetryPolicy {
    /// Doubling backoff starting at `initial_delay`, capped at 60 seconds.
    pub fn exponential(max_attempts: usize, initial_delay: Duration) -> Self {
        Self {
            max_attempts,
            initial_delay,
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }

    /// Cap every delay at `max_delay`.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Policy described by the `[generation]` section.
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self::exponential(
            config.retry_attempts as usize,
            Duration::from_millis(config.retry_base_ms),
        )
        .with_max_delay(Duration::from_millis(config.retry_max_ms))
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let delay = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }
}

/// Run `f` until it succeeds, the attempts run out, or `should_retry`
/// rejects an error.
///
/// `should_retry` is consulted only when another attempt is still allowed,
/// so every `true` it returns is followed by exactly one retry.
///
/// # Panics
///
/// This function never panics.
pub async fn retry_if<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    mut f: F,
    mut should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match f().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempt = attempt, "retry: operation succeeded after retries");
                }
                return Ok(result);
            }
            Err(e) => {
                if attempt >= policy.max_attempts {
                    warn!(attempts = attempt, error = %e, "retry: all attempts exhausted");
                    return Err(e);
                }
                if !should_retry(&e) {
                    warn!(error = %e, "retry: error is not retryable");
                    return Err(e);
                }

                let delay = policy.calculate_delay(attempt);
                warn!(
                    attempt = attempt,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retry: operation failed"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
