//! Bounded retry for exchange-facing calls.

use crate::config::ExecutionConfig;
use crate::exchange::GatewayError;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for GatewayError {
    fn is_retryable(&self) -> bool {
        GatewayError::is_retryable(self)
    }
}

/// How many times to try, and how long to pause before the first try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &ExecutionConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            backoff: config.retry_backoff(),
        }
    }
}

/// Why a retried operation produced no result.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    Exhausted {
        operation: String,
        attempts: u32,
        last: E,
    },
    /// An attempt failed with an error that retrying cannot fix.
    #[error("{operation} aborted: {error}")]
    Aborted { operation: String, error: E },
}

/// Run `op` until it succeeds, hits a non-retryable error, or runs out of attempts.
///
/// Pauses once before the first attempt to stay clear of rate limits. Only
/// the first failure is logged in full.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    tokio::time::sleep(policy.backoff).await;

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(%operation, attempt, "Succeeded after retrying");
                }
                return Ok(value);
            }
            Err(error) if !error.is_retryable() => {
                warn!(%operation, attempt, %error, "Non-retryable failure");
                return Err(RetryError::Aborted {
                    operation: operation.to_string(),
                    error,
                });
            }
            Err(error) => {
                if attempt == 1 {
                    warn!(%operation, %error, "Failed, trying again");
                } else {
                    debug!(%operation, attempt, "Still failing");
                }

                if attempt >= max_attempts {
                    return Err(RetryError::Exhausted {
                        operation: operation.to_string(),
                        attempts: attempt,
                        last: error,
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 20,
            backoff: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_last_attempt() {
        let calls = AtomicU32::new(0);

        let result = retry(&fast_policy(), "place order", || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 20 {
                    Err(GatewayError::Transient("timeout".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 20);
        assert_eq!(calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry(&fast_policy(), "place order", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(GatewayError::RateLimited { status: 429 }) }
        })
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 20);
                assert_eq!(last, GatewayError::RateLimited { status: 429 });
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_rejection_aborts_immediately() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry(&fast_policy(), "place order", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(GatewayError::Rejected {
                    code: -2010,
                    message: "insufficient balance".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(RetryError::Aborted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
