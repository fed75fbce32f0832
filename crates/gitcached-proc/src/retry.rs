//! Bounded-time exponential backoff for one async operation.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep, Instant};

/// Backoff policy: total wall-clock budget and first pause length.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    /// Give up once this much time has elapsed since the first attempt.
    pub max_total: Duration,
    /// Pause before the first retry. Grows by the classifier's
    /// multiplier on every subsequent failure.
    pub initial_interval: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            max_total: Duration::from_secs(180),
            initial_interval: Duration::from_secs(1),
        }
    }
}

/// Classifier verdict on one failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RetryOutcome {
    /// Worth another try; grow the pause by this factor afterwards.
    /// A factor of 1 keeps the interval constant. A factor of zero or
    /// below is treated as non-retryable.
    Retry(f64),
    /// No retry will help.
    Fatal,
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The time budget ran out. Fires at most once per [`retry`] call.
    #[error("gave up after {attempts} attempts: {error}")]
    GaveUp { attempts: u32, error: E },
    /// The classifier ruled the failure non-retryable.
    #[error("non-retryable: {0}")]
    Fatal(E),
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::GaveUp { error, .. } | RetryError::Fatal(error) => error,
        }
    }
}

/// Runs `op` until it succeeds, the classifier rules a failure fatal,
/// or the policy's time budget is exhausted.
///
/// The budget is checked when a failure comes back: a failure observed
/// past the deadline gives up rather than sleeping again, so with
/// multiplier `m` and initial interval `i` the number of retries before
/// give-up is the smallest `k` whose summed pauses reach the budget.
pub async fn retry<T, E, F, Fut, C>(
    policy: Backoff,
    label: &str,
    mut op: F,
    mut classify: C,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: FnMut(&E) -> RetryOutcome,
    E: std::fmt::Display,
{
    let deadline = Instant::now() + policy.max_total;
    let mut interval = policy.initial_interval;
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let error = match op().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::info!(op = label, attempts, "succeeded after retries");
                }
                return Ok(value);
            }
            Err(error) => error,
        };
        let multiplier = match classify(&error) {
            RetryOutcome::Retry(m) if m > 0.0 => m,
            _ => {
                tracing::warn!(op = label, attempts, %error, "non-retryable failure");
                return Err(RetryError::Fatal(error));
            }
        };
        if Instant::now() >= deadline {
            tracing::warn!(op = label, attempts, %error, "retry budget exhausted");
            return Err(RetryError::GaveUp { attempts, error });
        }
        tracing::debug!(op = label, attempts, pause = ?interval, %error, "retrying");
        sleep(interval).await;
        interval = Duration::from_secs_f64(interval.as_secs_f64() * multiplier);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn failing_op(calls: Arc<AtomicU32>, succeed_on: u32) -> impl FnMut() -> FailFut {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            FailFut {
                ok: succeed_on != 0 && n >= succeed_on,
            }
        }
    }

    struct FailFut {
        ok: bool,
    }

    impl Future for FailFut {
        type Output = Result<u32, String>;
        fn poll(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Self::Output> {
            std::task::Poll::Ready(if self.ok {
                Ok(7)
            } else {
                Err(String::from("connect refused"))
            })
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry(
            Backoff::default(),
            "connect",
            failing_op(Arc::clone(&calls), 1),
            |_| RetryOutcome::Retry(2.0),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_retries_cancels_further_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry(
            Backoff::default(),
            "connect",
            failing_op(Arc::clone(&calls), 3),
            |_| RetryOutcome::Retry(2.0),
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_classification_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry(
            Backoff::default(),
            "connect",
            failing_op(Arc::clone(&calls), 0),
            |_| RetryOutcome::Fatal,
        )
        .await;
        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_multiplier_is_non_retryable() {
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry(
            Backoff::default(),
            "connect",
            failing_op(Arc::clone(&calls), 0),
            |_| RetryOutcome::Retry(0.0),
        )
        .await;
        assert!(matches!(result, Err(RetryError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_give_up_count_matches_geometric_budget() {
        // Pauses of 1, 2, 4, 8 seconds put the fifth attempt at t=15,
        // past the 10 second budget, so exactly 4 retries happen.
        let policy = Backoff {
            max_total: Duration::from_secs(10),
            initial_interval: Duration::from_secs(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let result = retry(
            policy,
            "connect",
            failing_op(Arc::clone(&calls), 0),
            |_| RetryOutcome::Retry(2.0),
        )
        .await;
        match result {
            Err(RetryError::GaveUp { attempts, .. }) => assert_eq!(attempts, 5),
            other => panic!("expected give-up, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_constant_multiplier_keeps_interval() {
        let policy = Backoff {
            max_total: Duration::from_secs(3),
            initial_interval: Duration::from_secs(1),
        };
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();
        let result = retry(
            policy,
            "connect",
            failing_op(Arc::clone(&calls), 0),
            |_| RetryOutcome::Retry(1.0),
        )
        .await;
        assert!(matches!(result, Err(RetryError::GaveUp { .. })));
        // Three one-second pauses land the final failure at t=3.
        assert_eq!(started.elapsed(), Duration::from_secs(3));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
