//! Bounded-latency wrapper for collaborator calls.
//!
//! Every call to an external system goes through [`with_timeout`], which turns an
//! elapsed deadline into [`CallError::Timeout`]. Idempotent reads may use
//! [`retry_read_once`], which retries exactly once after a timeout. Writes,
//! logins, exchanges and signing never go through the retrying path.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::error::Upstream;

/// Outcome of a wrapped collaborator call that did not succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallError<E> {
    Timeout(Upstream),
    Failed(E),
}

/// Run `fut` with a deadline.
pub async fn with_timeout<T, E, F>(service: Upstream, limit: Duration, fut: F) -> Result<T, CallError<E>>
where
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(CallError::Failed(e)),
        Err(_) => {
            warn!(
                service = %service,
                timeout_ms = limit.as_millis() as u64,
                "Upstream call timed out"
            );
            Err(CallError::Timeout(service))
        }
    }
}

/// Run an idempotent read with a deadline, retrying once on timeout.
pub async fn retry_read_once<T, E, F, Fut>(service: Upstream, limit: Duration, mut op: F) -> Result<T, CallError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match with_timeout(service, limit, op()).await {
        Err(CallError::Timeout(_)) => {
            debug!(service = %service, "Retrying idempotent read after timeout");
            with_timeout(service, limit, op()).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_call_passes_through_results() {
        let ok: Result<u8, CallError<&str>> =
            with_timeout(Upstream::KeyStore, Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(ok, Ok(7));

        let failed: Result<u8, CallError<&str>> =
            with_timeout(Upstream::KeyStore, Duration::from_secs(1), async { Err("boom") }).await;
        assert_eq!(failed, Err(CallError::Failed("boom")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let result: Result<(), CallError<()>> = with_timeout(Upstream::IdentityProvider, Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(CallError::Timeout(Upstream::IdentityProvider)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_retried_once_after_timeout() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, CallError<()>> = retry_read_once(Upstream::KeyStore, Duration::from_millis(50), || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                Ok(42)
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_gives_up_after_second_timeout() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, CallError<()>> = retry_read_once(Upstream::TokenLookup, Duration::from_millis(50), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(1)
            }
        })
        .await;

        assert_eq!(result, Err(CallError::Timeout(Upstream::TokenLookup)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_not_retried() {
        let attempts = AtomicUsize::new(0);
        let result: Result<u32, CallError<&str>> = retry_read_once(Upstream::KeyStore, Duration::from_secs(1), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err("denied") }
        })
        .await;

        assert_eq!(result, Err(CallError::Failed("denied")));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
