//! Bounded retry for transport operations.
//!
//! Used by outbound links for the initial dial. The delay grows by
//! `exponential_base` per attempt and is capped at `max_delay`; jitter is
//! optional so timer-driven tests stay deterministic.

use crate::config::LinkOptions;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, the first one included.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            exponential_base: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Policy for dialing a peer: one attempt plus `max_connect_retries`.
    pub fn for_connect(options: &LinkOptions) -> Self {
        Self {
            max_attempts: options.max_connect_retries + 1,
            base_delay: options.connect_retry_delay,
            max_delay: options.connect_timeout,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the attempt following `attempt` (0-indexed).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.exponential_base.powi(attempt as i32);
        let mut secs = scaled.min(self.max_delay.as_secs_f64());
        if self.jitter {
            secs = (secs * rand::rng().random_range(0.5..1.5)).min(self.max_delay.as_secs_f64());
        }
        Duration::from_secs_f64(secs)
    }
}

/// Outcome bookkeeping of [`retry_async`].
#[derive(Debug, Clone, Default)]
pub struct RetryStats {
    pub attempts: u32,
    pub total_delay: Duration,
    pub success: bool,
    pub last_error: Option<String>,
}

/// Run `operation` until it succeeds, a non-retryable error comes back, or
/// the policy's attempts are used up.
pub async fn retry_async<F, Fut, T, E>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: impl Fn(&E) -> bool,
) -> (Result<T, E>, RetryStats)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut stats = RetryStats::default();
    let mut attempt = 0;

    loop {
        stats.attempts = attempt + 1;
        let err = match operation().await {
            Ok(value) => {
                stats.success = true;
                if attempt > 0 {
                    debug!("Succeeded on attempt {}", attempt + 1);
                }
                return (Ok(value), stats);
            }
            Err(e) => e,
        };
        stats.last_error = Some(err.to_string());

        if !should_retry(&err) {
            debug!("Not retrying: {}", err);
            return (Err(err), stats);
        }
        if attempt + 1 >= policy.max_attempts {
            warn!("Giving up after {} attempts: {}", stats.attempts, err);
            return (Err(err), stats);
        }

        let delay = policy.delay_after(attempt);
        stats.total_delay += delay;
        debug!(
            "Attempt {}/{} failed: {}; next in {:?}",
            attempt + 1,
            policy.max_attempts,
            err,
            delay
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}
