//! Bounded retry with exponential backoff and jitter.
//!
//! Applied to requester calls for transient failures only; auth and
//! bad-request errors surface immediately.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use relaybot_types::error::RequesterError;

/// Retry behavior for requester calls.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts including the first (default 3).
    pub max_attempts: u32,
    /// Base delay before the first retry.
    pub base_delay: Duration,
    /// Cap on the computed delay.
    pub max_delay: Duration,
    /// Fraction of the delay added as random jitter.
    pub jitter_fraction: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(20),
            jitter_fraction: 0.25,
        }
    }
}

/// Delay before retry number `attempt` (0-indexed): `base * 2^attempt`,
/// capped, plus random jitter.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base_ms = config.base_delay.as_millis() as u64;
    let raw_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let capped_ms = raw_ms.min(config.max_delay.as_millis() as u64);
    let jitter_max = (capped_ms as f64 * config.jitter_fraction) as u64;
    let jitter = if jitter_max > 0 {
        rand::thread_rng().gen_range(0..=jitter_max)
    } else {
        0
    };
    Duration::from_millis(capped_ms + jitter)
}

/// Run `op` with retries for retryable [`RequesterError`] kinds.
///
/// A provider-supplied `retry_after_ms` takes precedence over the computed
/// backoff for that attempt.
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, mut op: F) -> Result<T, RequesterError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RequesterError>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempt += 1;
                if attempt >= config.max_attempts || !err.is_retryable() {
                    return Err(err);
                }
                let delay = match &err {
                    RequesterError::RateLimited {
                        retry_after_ms: Some(ms),
                    } => Duration::from_millis(*ms),
                    _ => compute_delay(config, attempt - 1),
                };
                debug!(attempt, ?delay, error = %err, "retrying requester call");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_fraction: 0.0,
        }
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            jitter_fraction: 0.0,
        };
        assert_eq!(compute_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(compute_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(compute_delay(&config, 2), Duration::from_millis(300));
        assert_eq!(compute_delay(&config, 5), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast_config(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(RequesterError::Network("reset".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RequesterError::Auth("nope".into())) }
        })
        .await;
        assert!(matches!(result, Err(RequesterError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&fast_config(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(RequesterError::Timeout) }
        })
        .await;
        assert!(matches!(result, Err(RequesterError::Timeout)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
