//! Timeout enforcement.
//!
//! Every backend interaction (dial, handshake, response head) gets a deadline.
//! Timeout errors are distinct from the underlying operation's errors.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// An operation did not finish within its deadline.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("{operation} timed out after {after:?}")]
pub struct Elapsed {
    pub operation: &'static str,
    pub after: Duration,
}

/// Run `fut` with a deadline. A zero duration disables the deadline.
pub async fn with_timeout<F, T>(
    operation: &'static str,
    after: Duration,
    fut: F,
) -> Result<T, Elapsed>
where
    F: Future<Output = T>,
{
    if after.is_zero() {
        return Ok(fut.await);
    }
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| Elapsed { operation, after })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_within_deadline() {
        let value = with_timeout("noop", Duration::from_secs(1), async { 7 }).await;
        assert_eq!(value, Ok(7));
    }

    #[tokio::test]
    async fn reports_operation_on_timeout() {
        let err = with_timeout("backend dial", Duration::from_millis(10), std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_eq!(err.operation, "backend dial");
        assert!(err.to_string().contains("backend dial timed out"));
    }

    #[tokio::test]
    async fn zero_disables_deadline() {
        let value = with_timeout("slow", Duration::ZERO, async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            "done"
        })
        .await;
        assert_eq!(value, Ok("done"));
    }
}
