use std::time::Duration;
use tokio::time::sleep;
use rand::Rng;

use crate::config::NotificationConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &NotificationConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Exponential delay with up to 50% jitter, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as u64;
        let exp_ms = base_ms.saturating_mul(2_u64.saturating_pow(attempt.min(32)));
        let jitter = if exp_ms >= 2 { rand::thread_rng().gen_range(0..=exp_ms / 2) } else { 0 };
        Duration::from_millis(exp_ms.saturating_add(jitter)).min(self.max_delay)
    }
}

/// Outcome of a retried operation: the final result and how many calls were made.
#[derive(Debug)]
pub struct Retried<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

/// Retry an idempotent operation with exponential backoff and jitter.
/// Errors for which `retryable` returns false end the loop immediately.
pub async fn retry_with_backoff<F, Fut, T, E, P>(policy: &RetryPolicy, retryable: P, mut f: F) -> Retried<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match f(attempt).await {
            Ok(value) => return Retried { result: Ok(value), attempts: attempt + 1 },
            Err(e) => {
                if attempt + 1 >= attempts || !retryable(&e) {
                    return Retried { result: Err(e), attempts: attempt + 1 };
                }
                let delay = policy.delay_for(attempt);
                tracing::debug!(
                    "Retry attempt {} failed ({}), waiting {}ms before retry",
                    attempt + 1,
                    e,
                    delay.as_millis()
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
