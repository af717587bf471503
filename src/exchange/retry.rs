// =============================================================================
// Retry policy for exchange calls — bounded attempts, linear back-off
// =============================================================================

use std::future::Future;

use tokio::time::{sleep, Duration};
use tracing::warn;

use crate::config::RetrySettings;
use crate::exchange::OrderError;

/// Retry an order placement, re-attempting only transient failures.
///
/// Hard rejections and quantity-limit errors surface immediately so the
/// caller can run its dedicated fallback paths. On exhaustion the last
/// transient error is returned.
pub async fn retry_order<F, Fut, T>(
    settings: &RetrySettings,
    operation_name: &str,
    mut operation: F,
) -> Result<T, OrderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrderError>>,
{
    let attempts = settings.max_attempts.max(1);
    let mut last_error = OrderError::Transient("no attempt made".to_string());

    for attempt in 1..=attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                let delay = Duration::from_millis(settings.backoff_ms * attempt as u64);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "transient exchange error — retrying"
                );
                sleep(delay).await;
                last_error = e;
            }
            Err(e) => return Err(e),
        }
    }

    Err(last_error)
}

/// Whether an HTTP status is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_settings(max_attempts: u32) -> RetrySettings {
        RetrySettings { max_attempts, backoff_ms: 1 }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let result: Result<u32, OrderError> =
            retry_order(&fast_settings(3), "test", || async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn transient_errors_are_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_order(&fast_settings(3), "test", || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(OrderError::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn hard_rejection_is_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<u32, OrderError> = retry_order(&fast_settings(3), "test", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(OrderError::Rejected("bad params".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(OrderError::Rejected(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn quantity_limit_surfaces_immediately() {
        let result: Result<u32, OrderError> = retry_order(&fast_settings(5), "test", || async {
            Err(OrderError::MaxQuantityExceeded { max_qty: 10.0 })
        })
        .await;

        match result {
            Err(OrderError::MaxQuantityExceeded { max_qty }) => assert_eq!(max_qty, 10.0),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn exhaustion_returns_last_transient() {
        let result: Result<u32, OrderError> = retry_order(&fast_settings(2), "test", || async {
            Err(OrderError::Transient("still down".into()))
        })
        .await;

        assert!(matches!(result, Err(OrderError::Transient(_))));
    }

    #[test]
    fn retryable_status_classification() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
    }
}
