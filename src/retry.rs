//! Bounded exponential backoff for idempotent remote calls.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

use crate::cancel::CancelLatch;

/// Backoff parameters for [`retry`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Delay after the first unsuccessful attempt.
    pub initial: Duration,
    /// Upper bound for the delay.
    pub max: Duration,
    /// Total attempts before giving up.
    pub attempts: u32,
}

impl RetryPolicy {
    /// Policy for ordinary control-plane calls.
    pub const API: Self = Self {
        initial: Duration::from_millis(200),
        max: Duration::from_secs(30),
        attempts: 11,
    };

    /// Policy for stopping an instance, which the provider often refuses while
    /// the guest is still busy.
    pub const STOP: Self = Self {
        initial: Duration::from_secs(10),
        max: Duration::from_secs(60),
        attempts: 6,
    };

    fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Errors returned by [`retry`].
#[derive(Debug, Error, Eq, PartialEq)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// The operation reported an error that retrying cannot fix.
    #[error(transparent)]
    Fatal(E),
    /// Every attempt asked to be retried.
    #[error("gave up after {attempts} attempts")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
    },
    /// The cancellation latch was set between attempts.
    #[error("cancelled while retrying")]
    Cancelled,
}

/// Runs `operation` until it reports completion.
///
/// The operation receives the zero-based attempt number and returns
/// `Ok(true)` when done, `Ok(false)` to be retried and `Err` to abort.
///
/// # Errors
///
/// Returns [`RetryError::Fatal`] with the operation's error,
/// [`RetryError::Exhausted`] once `policy.attempts` attempts have asked to be
/// retried and [`RetryError::Cancelled`] when `cancel` is set before a sleep.
pub async fn retry<E, F, Fut>(
    policy: RetryPolicy,
    cancel: Option<&CancelLatch>,
    mut operation: F,
) -> Result<(), RetryError<E>>
where
    E: std::error::Error + 'static,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<bool, E>>,
{
    for attempt in 0..policy.attempts {
        if operation(attempt).await.map_err(RetryError::Fatal)? {
            return Ok(());
        }
        if attempt + 1 == policy.attempts {
            break;
        }
        if cancel.is_some_and(CancelLatch::is_cancelled) {
            return Err(RetryError::Cancelled);
        }
        let delay = policy.delay_after(attempt);
        debug!(attempt, delay_ms = delay.as_millis(), "retrying");
        sleep(delay).await;
    }
    Err(RetryError::Exhausted {
        attempts: policy.attempts,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use rstest::rstest;

    use super::*;
    use crate::client::ClientError;

    const FAST: RetryPolicy = RetryPolicy {
        initial: Duration::from_millis(1),
        max: Duration::from_millis(2),
        attempts: 4,
    };

    #[rstest]
    #[case(0, Duration::from_millis(200))]
    #[case(1, Duration::from_millis(400))]
    #[case(7, Duration::from_millis(25_600))]
    #[case(8, Duration::from_secs(30))]
    #[case(40, Duration::from_secs(30))]
    fn api_delay_doubles_up_to_cap(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(RetryPolicy::API.delay_after(attempt), expected);
    }

    #[rstest]
    #[tokio::test]
    async fn succeeds_once_operation_reports_done() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry(FAST, None, move |attempt| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<_, ClientError>(attempt == 2))
        })
        .await;
        assert_eq!(result, Ok(()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn exhausts_after_configured_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry(FAST, None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok::<_, ClientError>(false))
        })
        .await;
        assert_eq!(result, Err(RetryError::Exhausted { attempts: 4 }));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[rstest]
    #[tokio::test]
    async fn fatal_error_aborts_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result = retry(FAST, None, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Err::<bool, _>(ClientError::api("CreateImage", "Denied", "no")))
        })
        .await;
        assert!(matches!(result, Err(RetryError::Fatal(ClientError::Api { .. }))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn cancellation_is_checked_before_sleeping() {
        let latch = CancelLatch::new();
        let trigger = latch.clone();
        let result = retry(FAST, Some(&latch), move |_| {
            trigger.cancel();
            std::future::ready(Ok::<_, ClientError>(false))
        })
        .await;
        assert_eq!(result, Err(RetryError::Cancelled));
    }
}
