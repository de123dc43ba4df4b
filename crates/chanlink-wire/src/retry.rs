//! Retry with exponential backoff and jitter for connection establishment.
//!
//! The policy itself is the [`RetryConfig`] value object; this module only
//! computes delays and drives attempts, so retry semantics can be tested
//! without touching a socket.

use chanlink_types::RetryConfig;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of a retry operation.
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation succeeded.
    Success {
        result: T,
        /// Total number of attempts made (1 = first try succeeded).
        attempts: u32,
    },
    /// The error was not retryable.
    Fatal { error: E, attempts: u32 },
    /// A bounded policy ran out of attempts.
    Exhausted { last_error: E, attempts: u32 },
}

/// Compute the delay before retry number `attempt` (0-indexed).
///
/// Formula: `min(min_delay * 2^attempt, max_delay) * (1 + random * jitter)`,
/// clamped to `max_delay`.
pub fn compute_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config
        .min_delay_ms
        .saturating_mul(1u64.checked_shl(attempt).unwrap_or(u64::MAX));
    let capped = base.min(config.max_delay_ms);

    if config.jitter <= 0.0 {
        return Duration::from_millis(capped);
    }

    let jitter_offset = (capped as f64) * pseudo_random_fraction() * config.jitter;
    let with_jitter = ((capped as f64) + jitter_offset) as u64;
    Duration::from_millis(with_jitter.min(config.max_delay_ms))
}

/// Fraction in `[0, 1)` from the clock's sub-second nanos. Good enough to
/// spread reconnect storms, not for anything else.
fn pseudo_random_fraction() -> f64 {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let mixed = nanos.wrapping_mul(2654435761);
    (mixed as f64) / (u32::MAX as f64 + 1.0)
}

/// Run `operation` until it succeeds, fails with an error `should_retry`
/// rejects, or the policy's attempt budget is spent.
pub async fn retry_async<F, Fut, T, E, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> RetryOutcome<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Debug,
{
    let max = config.max_attempts.map(|m| m.max(1));
    let mut attempt: u32 = 0;

    loop {
        let outcome = operation().await;
        attempt = attempt.saturating_add(1);

        let err = match outcome {
            Ok(result) => {
                if attempt > 1 {
                    debug!(attempts = attempt, "retry succeeded");
                }
                return RetryOutcome::Success {
                    result,
                    attempts: attempt,
                };
            }
            Err(err) => err,
        };

        if !should_retry(&err) {
            debug!(attempt, "error is not retryable, giving up: {:?}", err);
            return RetryOutcome::Fatal {
                error: err,
                attempts: attempt,
            };
        }

        if max.is_some_and(|max| attempt >= max) {
            warn!(
                attempts = attempt,
                "all retry attempts exhausted: {:?}", err
            );
            return RetryOutcome::Exhausted {
                last_error: err,
                attempts: attempt,
            };
        }

        let delay = compute_backoff(config, attempt - 1);
        let delay_ms = delay.as_millis() as u64;
        debug!(attempt, delay_ms, "retrying after error: {:?}", err);
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_attempts: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_attempts,
            min_delay_ms: 1,
            max_delay_ms: 5,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_compute_backoff_exponential_and_capped() {
        let config = RetryConfig {
            max_attempts: None,
            min_delay_ms: 100,
            max_delay_ms: 500,
            jitter: 0.0,
        };
        assert_eq!(compute_backoff(&config, 0), Duration::from_millis(100));
        assert_eq!(compute_backoff(&config, 1), Duration::from_millis(200));
        assert_eq!(compute_backoff(&config, 2), Duration::from_millis(400));
        assert_eq!(compute_backoff(&config, 3), Duration::from_millis(500));
        assert_eq!(compute_backoff(&config, 63), Duration::from_millis(500));
        assert_eq!(compute_backoff(&config, 200), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_cap() {
        let config = RetryConfig {
            max_attempts: None,
            min_delay_ms: 100,
            max_delay_ms: 150,
            jitter: 1.0,
        };
        for attempt in 0..10 {
            let delay = compute_backoff(&config, attempt);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn test_unbounded_retries_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let outcome = retry_async(
            &fast(None),
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 7 {
                        Err("refused")
                    } else {
                        Ok("open")
                    }
                }
            },
            |_| true,
        )
        .await;

        match outcome {
            RetryOutcome::Success { result, attempts } => {
                assert_eq!(result, "open");
                assert_eq!(attempts, 8);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let outcome = retry_async(
            &fast(None),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("address in use")
                }
            },
            |_| false,
        )
        .await;

        match outcome {
            RetryOutcome::Fatal { error, attempts } => {
                assert_eq!(error, "address in use");
                assert_eq!(attempts, 1);
            }
            other => panic!("expected fatal, got {other:?}"),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bounded_policy_exhausts() {
        let outcome = retry_async(
            &fast(Some(3)),
            || async { Err::<(), _>("timeout") },
            |_| true,
        )
        .await;

        match outcome {
            RetryOutcome::Exhausted {
                last_error,
                attempts,
            } => {
                assert_eq!(last_error, "timeout");
                assert_eq!(attempts, 3);
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_zero_attempt_budget_still_tries_once() {
        let outcome = retry_async(&fast(Some(0)), || async { Ok::<_, ()>(5) }, |_| true).await;
        assert!(matches!(
            outcome,
            RetryOutcome::Success {
                result: 5,
                attempts: 1
            }
        ));
    }
}
