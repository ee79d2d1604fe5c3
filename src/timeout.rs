//! Hard wall-clock ceiling wrapping an entire query execution.
//!
//! `tokio::time::timeout` already resolves the race the Python original had
//! to disambiguate by string-matching error prefixes: if the wrapped future
//! finishes before the deadline — whether with success or a domain error
//! such as [`GatewayError::QueryTimeout`] — that result is returned
//! untouched. Only a genuine deadline expiry produces
//! [`GatewayError::HardTimeout`].

use std::future::Future;
use std::time::Duration;

use crate::error::GatewayError;

pub async fn with_hard_deadline<F, T>(hard_timeout_s: u64, op: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(Duration::from_secs(hard_timeout_s), op).await {
        Ok(result) => result,
        Err(_elapsed) => Err(GatewayError::HardTimeout(hard_timeout_s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_ok_when_op_finishes_in_time() {
        let result = with_hard_deadline(1, async { Ok::<_, GatewayError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn domain_error_propagates_unchanged_even_near_deadline() {
        let result = with_hard_deadline(1, async {
            Err::<i32, _>(GatewayError::QueryTimeout {
                backend: "PostgreSQL".to_string(),
                timeout_s: 1,
            })
        })
        .await;
        match result {
            Err(GatewayError::QueryTimeout { .. }) => {}
            other => panic!("expected QueryTimeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn elapsed_deadline_raises_hard_timeout() {
        let result = with_hard_deadline(0, async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, GatewayError>(())
        })
        .await;
        assert!(matches!(result, Err(GatewayError::HardTimeout(0))));
    }
}
