// Bounded retry for rate-limited calls
//
// Exponential backoff with a hard cap; every sleep honors cancellation.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ApiError;

/// Configuration for rate-limit retries
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each one after
    pub base_delay: Duration,
    /// Hard cap on a single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryPolicy {
    /// `min(base * 2^attempt, max)` for a 0-indexed attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `operation`, retrying while it fails with `RateLimited`
///
/// The closure receives the attempt number (0-indexed). Any other outcome is
/// returned as-is. Cancellation yields `ApiError::Cancelled` at once, whether
/// the operation or a backoff sleep is pending.
pub async fn retry_rate_limited<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut attempt = 0;

    loop {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ApiError::Cancelled),
            result = operation(attempt) => result,
        };

        match result {
            Err(ApiError::RateLimited { .. }) if attempt < policy.max_retries => {
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    "Received 429, retrying after {}ms (attempt {}/{})",
                    delay.as_millis(),
                    attempt + 1,
                    policy.max_retries
                );

                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(ApiError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(ApiError::RateLimited { body }) => {
                tracing::error!(
                    total_attempts = attempt + 1,
                    "Still rate limited after all retries"
                );
                return Err(ApiError::RateLimited { body });
            }
            other => return other,
        }
    }
}
