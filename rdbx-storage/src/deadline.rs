//! Deadlines for calls into external collaborators.

use rdbx_core::{RdbxError, RdbxResult};
use std::future::Future;
use std::time::Duration;

/// Run `call`, giving up once `timeout` elapses.
///
/// On expiry the in-flight future is dropped and
/// [`RdbxError::Cancelled`] is returned. `None` waits forever.
pub async fn with_deadline<T, F>(
    operation: &'static str,
    timeout: Option<Duration>,
    call: F,
) -> RdbxResult<T>
where
    F: Future<Output = RdbxResult<T>>,
{
    let Some(limit) = timeout else {
        return call.await;
    };

    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_ms = limit.as_millis() as u64, "Call exceeded deadline");
            Err(RdbxError::Cancelled {
                operation,
                timeout: limit,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_stalled_call_is_cancelled() {
        let result: RdbxResult<()> = with_deadline(
            "stall",
            Some(Duration::from_millis(20)),
            std::future::pending(),
        )
        .await;
        assert_eq!(
            result,
            Err(RdbxError::Cancelled {
                operation: "stall",
                timeout: Duration::from_millis(20),
            })
        );
    }

    #[tokio::test]
    async fn test_fast_call_passes_through() {
        let result = with_deadline("fast", Some(Duration::from_secs(5)), async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_no_deadline() {
        let result = with_deadline("open", None, async { Ok("done") }).await;
        assert_eq!(result, Ok("done"));
    }
}
