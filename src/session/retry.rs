//! Refresh-and-retry wrapper for the post-handshake visibility window.
//!
//! The identity provider's credential exchange has a documented brief
//! window where a freshly issued credential is not yet visible to
//! dependent reads, which then fail with a not-found-shaped error. The
//! wrapper turns that user-visible failure into a credential refresh plus
//! a short, bounded retry.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::provider::ProviderError;

#[derive(Clone, Copy, Debug)]
pub struct RetryPlan {
    pub max_retries: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPlan {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(400),
        }
    }
}

/// Run `op`, and on a transient-shaped failure refresh the credential and
/// retry with exponentially doubling delays.
///
/// # Errors
/// Propagates `op`'s error unchanged when it is not transient, when the
/// refresh itself fails (the refresh failure is strictly less informative
/// than the cause it was working around), or when retries are exhausted.
pub async fn retry_with_refresh<T, Op, OpFut, Re, ReFut>(
    plan: &RetryPlan,
    mut op: Op,
    refresh: Re,
) -> Result<T, ProviderError>
where
    Op: FnMut() -> OpFut,
    OpFut: Future<Output = Result<T, ProviderError>>,
    Re: Fn() -> ReFut,
    ReFut: Future<Output = Result<(), ProviderError>>,
{
    let mut delay = plan.initial_delay;
    let mut attempt = 0u32;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < plan.max_retries => {
                if let Err(refresh_err) = refresh().await {
                    warn!("credential refresh failed during retry: {refresh_err}");
                    return Err(err);
                }
                attempt += 1;
                debug!("transient backend error, retry {attempt} in {delay:?}: {err}");
                sleep(delay).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_plan() -> RetryPlan {
        RetryPlan {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn transient_then_success_invokes_op_exactly_twice() {
        let calls = AtomicUsize::new(0);
        let refreshes = AtomicUsize::new(0);

        let result = retry_with_refresh(
            &fast_plan(),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::Transient("row not found".to_string()))
                } else {
                    Ok(42)
                }
            },
            || async {
                refreshes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_transient_error_is_surfaced_without_retry() {
        let calls = AtomicUsize::new(0);
        let refreshes = AtomicUsize::new(0);

        let result: Result<(), _> = retry_with_refresh(
            &fast_plan(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::InvalidCredentials)
            },
            || async {
                refreshes.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(ProviderError::InvalidCredentials)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            refreshes.load(Ordering::SeqCst),
            0,
            "refresh must not run for non-transient errors"
        );
    }

    #[tokio::test]
    async fn failed_refresh_propagates_the_original_error() {
        let result: Result<(), _> = retry_with_refresh(
            &fast_plan(),
            || async { Err(ProviderError::Transient("original cause".to_string())) },
            || async { Err(ProviderError::Unavailable) },
        )
        .await;

        match result {
            Err(ProviderError::Transient(message)) => assert_eq!(message, "original cause"),
            other => panic!("expected the original error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let calls = AtomicUsize::new(0);

        let result: Result<(), _> = retry_with_refresh(
            &fast_plan(),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Transient("still racing".to_string()))
            },
            || async { Ok(()) },
        )
        .await;

        assert!(result.is_err());
        // Initial call plus max_retries.
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
