// Retry with bounded exponential backoff
// Only transient failures are retried; server retry hints take precedence
// over the computed delay (capped at the policy maximum).

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::CallFailure;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    fn delay_after(&self, attempt: u32, failure: &CallFailure) -> Duration {
        let computed = self.backoff(attempt);
        match failure.retry_after {
            Some(hint) => hint.min(self.max_delay).max(computed),
            None => computed,
        }
    }
}

pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, CallFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallFailure>>,
{
    let mut attempt = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(CallFailure::cancelled());
        }
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(failure) => {
                if !failure.is_transient() || attempt >= policy.max_attempts.max(1) {
                    return Err(failure);
                }

                let delay = policy.delay_after(attempt, &failure);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %failure, "Retrying call");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CallFailure::cancelled()),
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}
