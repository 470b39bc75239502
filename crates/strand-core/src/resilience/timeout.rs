//! Deadline wrapper that cancels an attached token on expiry.
//!
//! Unlike a bare `tokio::time::timeout`, expiry here also fires the step's
//! cancellation token so in-flight children (processes, streams, pool
//! waiters) observe the abort instead of being silently dropped.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// The wrapped future did not complete in time.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("timed out after {timeout_ms}ms")]
pub struct TimeoutElapsed {
    pub timeout_ms: u64,
}

/// Run `fut` under a deadline. On expiry the token is cancelled and
/// `Err(TimeoutElapsed)` is returned; otherwise the future's own output is
/// passed through.
pub async fn with_timeout<F>(
    duration: Duration,
    token: &CancellationToken,
    fut: F,
) -> Result<F::Output, TimeoutElapsed>
where
    F: Future,
{
    tokio::select! {
        out = fut => Ok(out),
        _ = tokio::time::sleep(duration) => {
            token.cancel();
            Err(TimeoutElapsed {
                timeout_ms: duration.as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_within_deadline() {
        let token = CancellationToken::new();
        let out = with_timeout(Duration::from_millis(100), &token, async { 42 }).await;
        assert_eq!(out, Ok(42));
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn test_expiry_cancels_token() {
        let token = CancellationToken::new();
        let out = with_timeout(Duration::from_millis(10), &token, async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            42
        })
        .await;
        assert_eq!(out, Err(TimeoutElapsed { timeout_ms: 10 }));
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_inner_future_sees_cancellation() {
        let token = CancellationToken::new();
        let inner = token.clone();
        let out = with_timeout(Duration::from_millis(10), &token, async move {
            inner.cancelled().await;
            "observed"
        })
        .await;
        // The sleep branch wins and cancels; the inner future was dropped
        // mid-wait, which is exactly the cooperative contract.
        assert!(out.is_err());
        assert!(token.is_cancelled());
    }
}
