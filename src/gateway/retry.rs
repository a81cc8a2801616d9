//! Bounded retry with exponential backoff.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;

/// Error types the retry executor can classify and construct.
pub trait Retryable: Sized {
    /// Whether another attempt may succeed.
    fn is_retryable(&self) -> bool;

    /// The error returned when cancellation interrupts the backoff.
    fn cancelled() -> Self;

    /// Wrap the last error once every attempt has failed.
    fn exhausted(attempts: u32, last: Self) -> Self;
}

/// Delay before `attempt` (1-based): zero for the first, then
/// `initial × factor^(attempt − 2)` capped at `max`.
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    if attempt <= 1 {
        return Duration::ZERO;
    }
    let exponent = i32::try_from(attempt - 2).unwrap_or(i32::MAX);
    let secs = config.initial_delay().as_secs_f64() * config.backoff_factor.powi(exponent);
    scale_capped(secs, config.max_delay())
}

fn scale_capped(secs: f64, max: Duration) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(max).min(max)
}

/// Run `operation` until it succeeds, fails permanently or runs out of
/// attempts. `operation` receives the 1-based attempt number.
///
/// Without a config, or with `max_attempts <= 1`, the operation runs once
/// and its result is returned as is.
pub async fn with_retry<T, E, F, Fut>(
    cancel: &CancellationToken,
    config: Option<&RetryConfig>,
    mut operation: F,
) -> Result<T, E>
where
    E: Retryable + Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let Some(config) = config.filter(|c| c.max_attempts > 1) else {
        return operation(1).await;
    };

    let mut delay = config.initial_delay();
    let mut attempt = 1;

    loop {
        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() {
            return Err(err);
        }
        if attempt >= config.max_attempts {
            return Err(E::exhausted(attempt, err));
        }
        if cancel.is_cancelled() {
            return Err(E::cancelled());
        }

        tracing::debug!(
            attempt,
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after failure"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(E::cancelled()),
            _ = tokio::time::sleep(delay) => {}
        }

        delay = scale_capped(delay.as_secs_f64() * config.backoff_factor, config.max_delay());
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::errors::BackendError;
    use std::error::Error as _;

    fn config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_factor: 2.0,
        }
    }

    fn transport_error() -> BackendError {
        BackendError::Transport {
            server: "github".into(),
            reason: "pipe closed".into(),
        }
    }

    #[test]
    fn test_backoff_delay_formula() {
        let cfg = RetryConfig {
            max_attempts: 10,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_factor: 2.0,
        };
        assert_eq!(backoff_delay(&cfg, 0), Duration::ZERO);
        assert_eq!(backoff_delay(&cfg, 1), Duration::ZERO);
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_millis(100));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_millis(200));
        assert_eq!(backoff_delay(&cfg, 4), Duration::from_millis(400));
        assert_eq!(backoff_delay(&cfg, 6), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(&cfg, 60), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn test_exhausts_after_exactly_max_attempts() {
        let cancel = CancellationToken::new();
        let mut calls = 0;

        let result: Result<(), BackendError> =
            with_retry(&cancel, Some(&config(4)), |attempt| {
                calls += 1;
                assert_eq!(attempt, calls);
                async { Err(transport_error()) }
            })
            .await;

        assert_eq!(calls, 4);
        let err = result.unwrap_err();
        assert!(matches!(err, BackendError::RetryExhausted { attempts: 4, .. }));
        assert!(err.source().unwrap().to_string().contains("pipe closed"));
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let cancel = CancellationToken::new();
        let result = with_retry(&cancel, Some(&config(3)), |attempt| async move {
            if attempt < 3 {
                Err(transport_error())
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_no_config_runs_once_verbatim() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: Result<(), BackendError> = with_retry(&cancel, None, |_| {
            calls += 1;
            async { Err(transport_error()) }
        })
        .await;
        assert_eq!(calls, 1);
        assert!(matches!(result.unwrap_err(), BackendError::Transport { .. }));

        let mut calls = 0;
        let _: Result<(), BackendError> = with_retry(&cancel, Some(&config(1)), |_| {
            calls += 1;
            async { Err(transport_error()) }
        })
        .await;
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: Result<(), BackendError> =
            with_retry(&cancel, Some(&config(5)), |_| {
                calls += 1;
                async {
                    Err(BackendError::NotStarted {
                        name: "github".into(),
                    })
                }
            })
            .await;
        assert_eq!(calls, 1);
        assert!(matches!(result.unwrap_err(), BackendError::NotStarted { .. }));
    }

    #[tokio::test]
    async fn test_retry_tag_overrides_classification() {
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let result: Result<(), BackendError> =
            with_retry(&cancel, Some(&config(3)), |_| {
                calls += 1;
                async {
                    Err(BackendError::retryable(BackendError::Timeout {
                        operation: "tools/call".into(),
                        timeout_ms: 10,
                    }))
                }
            })
            .await;
        assert_eq!(calls, 3);
        assert!(matches!(
            result.unwrap_err().root_cause(),
            BackendError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff() {
        let cancel = CancellationToken::new();
        let slow = RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 10_000,
            max_delay_ms: 10_000,
            backoff_factor: 1.0,
        };

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result: Result<(), BackendError> =
            with_retry(&cancel, Some(&slow), |_| async { Err(transport_error()) }).await;

        assert!(matches!(result.unwrap_err(), BackendError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_prior_cancellation_fails_fast() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut calls = 0;
        let result: Result<(), BackendError> =
            with_retry(&cancel, Some(&config(3)), |_| {
                calls += 1;
                async { Err(transport_error()) }
            })
            .await;
        assert_eq!(calls, 1);
        assert!(matches!(result.unwrap_err(), BackendError::Cancelled));
    }
}
