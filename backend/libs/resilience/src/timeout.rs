/// Timeout wrapper for external calls
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;

/// Failure of a bounded operation.
///
/// `Failed` keeps the operation's own error so callers can still classify it.
#[derive(Debug, thiserror::Error)]
pub enum TimeoutError<E> {
    #[error("{operation} timed out after {after:?}")]
    Elapsed {
        operation: &'static str,
        after: Duration,
    },
    #[error("{operation} failed: {error}")]
    Failed { operation: &'static str, error: E },
}

/// Execute a fallible future with a deadline
pub async fn with_timeout_result<F, T, E>(
    operation: &'static str,
    duration: Duration,
    future: F,
) -> Result<T, TimeoutError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match timeout(duration, future).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(error)) => Err(TimeoutError::Failed { operation, error }),
        Err(_) => {
            tracing::warn!(operation, ?duration, "external call timed out");
            Err(TimeoutError::Elapsed {
                operation,
                after: duration,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_success() {
        let result = with_timeout_result("noop", Duration::from_secs(1), async {
            Ok::<_, String>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_elapsed() {
        let result = with_timeout_result("slow", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, String>(42)
        })
        .await;

        match result {
            Err(TimeoutError::Elapsed { operation, after }) => {
                assert_eq!(operation, "slow");
                assert_eq!(after, Duration::from_millis(10));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_result_keeps_operation_error() {
        let result = with_timeout_result("store.persist", Duration::from_secs(1), async {
            Err::<i32, _>("unreachable")
        })
        .await;

        match result {
            Err(TimeoutError::Failed { operation, error }) => {
                assert_eq!(operation, "store.persist");
                assert_eq!(error, "unreachable");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
