// SPDX-License-Identifier: MIT OR Apache-2.0
//! Exponential backoff retry driver.

use pipeline_error::PipelineError;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff policy: `initial_interval`, multiplied by
/// `multiplier` after each attempt, capped at `max_interval`, up to
/// `max_attempts`, with an optional overall `max_elapsed_time` budget.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_interval: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_interval: Duration,
    /// Maximum number of attempts (including the first), inclusive.
    pub max_attempts: u32,
    /// Total time budget across all attempts. `None` means unbounded.
    pub max_elapsed_time: Option<Duration>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(200),
            multiplier: 2.0,
            max_interval: Duration::from_secs(30),
            max_attempts: 5,
            max_elapsed_time: None,
        }
    }
}

impl BackoffConfig {
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt as i32);
        let millis = (self.initial_interval.as_millis() as f64) * factor;
        let capped = millis.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Outcome of a retry loop that gave up.
#[derive(Debug)]
pub enum RetryError {
    /// The operation's own error was not retryable, or retries were
    /// exhausted; carries the last error observed.
    Exhausted(PipelineError),
}

impl std::fmt::Display for RetryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryError::Exhausted(e) => write!(f, "retry exhausted: {e}"),
        }
    }
}

impl std::error::Error for RetryError {}

/// Run `op` with exponential backoff per `config`.
///
/// Retries only while `err.is_retryable()` holds on the returned
/// [`PipelineError`] (the `Transient` category per the pipeline's error
/// taxonomy); any other error returns immediately without consuming an
/// attempt budget beyond the one already spent.
pub async fn retry_with_backoff<F, Fut, T>(
    config: &BackoffConfig,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, PipelineError>>,
{
    let start = Instant::now();
    let mut last_err: Option<PipelineError> = None;

    for attempt in 0..config.max_attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(RetryError::Exhausted(e));
                }
                if let Some(budget) = config.max_elapsed_time {
                    if start.elapsed() >= budget {
                        return Err(RetryError::Exhausted(e));
                    }
                }
                last_err = Some(e);
                if attempt + 1 < config.max_attempts {
                    tokio::time::sleep(config.delay_for_attempt(attempt)).await;
                }
            }
        }
    }

    Err(RetryError::Exhausted(last_err.expect(
        "loop runs at least once when max_attempts > 0",
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_error::ErrorCode;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let cfg = BackoffConfig {
            initial_interval: Duration::from_millis(100),
            multiplier: 2.0,
            max_interval: Duration::from_millis(300),
            max_attempts: 10,
            max_elapsed_time: None,
        };
        assert_eq!(cfg.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(cfg.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(cfg.delay_for_attempt(2), Duration::from_millis(300));
        assert_eq!(cfg.delay_for_attempt(5), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn succeeds_without_retry() {
        let calls = AtomicU32::new(0);
        let cfg = BackoffConfig {
            initial_interval: Duration::from_millis(1),
            ..Default::default()
        };
        let result = retry_with_backoff(&cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, PipelineError>(42) }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let cfg = BackoffConfig {
            initial_interval: Duration::from_millis(1),
            max_attempts: 5,
            ..Default::default()
        };
        let result = retry_with_backoff(&cfg, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PipelineError::new(ErrorCode::StoreTimeout, "timeout"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = AtomicU32::new(0);
        let cfg = BackoffConfig {
            initial_interval: Duration::from_millis(1),
            max_attempts: 5,
            ..Default::default()
        };
        let result: Result<(), _> = retry_with_backoff(&cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::new(ErrorCode::ConfigInvalid, "bad config")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let cfg = BackoffConfig {
            initial_interval: Duration::from_millis(1),
            max_attempts: 3,
            ..Default::default()
        };
        let result: Result<(), _> = retry_with_backoff(&cfg, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::new(ErrorCode::BrokerFetchError, "fetch failed")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
