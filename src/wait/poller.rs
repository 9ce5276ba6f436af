//! Bounded polling loop shared by every readiness condition.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use super::PollSettings;
use super::condition::Readiness;
use crate::error::WaitError;

/// Shortest deadline a single fetch gets, however short the poll interval.
pub const MIN_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// A condition became ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSuccess {
    /// 1-based attempt on which the condition was observed ready.
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Fetch state and evaluate it until ready, or fail after `settings.attempts` tries.
///
/// A failed fetch is treated as not ready; only an exhausted budget is fatal.
/// Each fetch is bounded by [`fetch_timeout`], and one that runs out of time
/// counts as failed. There is no sleep after the final attempt.
pub async fn poll<T, E, F, Fut, V>(
    description: &str,
    settings: PollSettings,
    mut fetch: F,
    evaluate: V,
) -> Result<PollSuccess, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    V: Fn(&T) -> Readiness,
{
    let start = Instant::now();
    let attempts = settings.attempts.max(1);
    let limit = fetch_timeout(settings);

    for attempt in 1..=attempts {
        match tokio::time::timeout(limit, fetch()).await {
            Ok(Ok(state)) => match evaluate(&state) {
                Readiness::Ready => {
                    debug!("{} ready after {} attempt(s)", description, attempt);
                    return Ok(PollSuccess {
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    });
                }
                Readiness::NotReady(reason) => {
                    debug!(
                        "[{}/{}] waiting for {}: {}",
                        attempt, attempts, description, reason
                    );
                }
            },
            Ok(Err(e)) => {
                debug!(
                    "[{}/{}] fetch failed while waiting for {}: {}",
                    attempt, attempts, description, e
                );
            }
            Err(_) => {
                debug!(
                    "[{}/{}] fetch timed out after {}s while waiting for {}",
                    attempt,
                    attempts,
                    limit.as_secs(),
                    description
                );
            }
        }

        if attempt < attempts {
            tokio::time::sleep(settings.interval).await;
        }
    }

    Err(WaitError::Timeout {
        description: description.to_string(),
        attempts,
        interval: settings.interval,
    })
}

/// Deadline for one fetch: the poll interval, but never below [`MIN_FETCH_TIMEOUT`].
///
/// A wait therefore returns within `attempts x (fetch_timeout + interval)`.
pub fn fetch_timeout(settings: PollSettings) -> Duration {
    settings.interval.max(MIN_FETCH_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> Arc<AtomicU32> {
        Arc::new(AtomicU32::new(0))
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_ready_on_first_attempt() {
        let result = poll(
            "always ready",
            PollSettings::new(Duration::from_secs(10), 5),
            || async { Ok::<_, String>(()) },
            |_| Readiness::Ready,
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 1);
        assert_eq!(result.elapsed, Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_ready_after_some_attempts() {
        let calls = counter();
        let fetch_calls = calls.clone();
        let result = poll(
            "third time lucky",
            PollSettings::new(Duration::from_secs(2), 10),
            move || {
                let n = fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, String>(n) }
            },
            |n| {
                if *n >= 3 {
                    Readiness::Ready
                } else {
                    Readiness::NotReady(format!("attempt {n}"))
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.elapsed, Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_times_out_after_budget() {
        let calls = counter();
        let fetch_calls = calls.clone();
        let start = Instant::now();

        let err = poll(
            "never ready",
            PollSettings::new(Duration::from_secs(10), 6),
            move || {
                fetch_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            },
            |_| Readiness::NotReady("nope".to_string()),
        )
        .await
        .unwrap_err();

        let elapsed = start.elapsed();
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(elapsed >= Duration::from_secs(50));
        assert!(elapsed <= Duration::from_secs(60));
        assert_eq!(
            err,
            WaitError::Timeout {
                description: "never ready".to_string(),
                attempts: 6,
                interval: Duration::from_secs(10),
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_fetch_errors_are_not_fatal() {
        let calls = counter();
        let fetch_calls = calls.clone();
        let result = poll(
            "flaky fetch",
            PollSettings::new(Duration::from_secs(1), 5),
            move || {
                let n = fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("connection reset by peer".to_string())
                    } else {
                        Ok(())
                    }
                }
            },
            |_| Readiness::Ready,
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_zero_attempts_still_checks_once() {
        let calls = counter();
        let fetch_calls = calls.clone();
        let err = poll(
            "zero budget",
            PollSettings::new(Duration::from_secs(1), 0),
            move || {
                fetch_calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, String>(()) }
            },
            |_| Readiness::NotReady("nope".to_string()),
        )
        .await
        .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, WaitError::Timeout { attempts: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_hung_fetch_times_out_within_bound() {
        let settings = PollSettings::new(Duration::from_secs(5), 3);
        let start = Instant::now();

        let err = poll(
            "hung fetch",
            settings,
            std::future::pending::<Result<(), String>>,
            |_| Readiness::Ready,
        )
        .await
        .unwrap_err();

        // 3 fetches cut at 10s each, plus 2 sleeps of 5s.
        assert_eq!(start.elapsed(), Duration::from_secs(40));
        assert!(matches!(err, WaitError::Timeout { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_recovers_after_hung_fetch() {
        let calls = counter();
        let fetch_calls = calls.clone();
        let result = poll(
            "stalled once",
            PollSettings::new(Duration::from_secs(30), 4),
            move || {
                let n = fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 1 {
                        std::future::pending::<()>().await;
                    }
                    Ok::<_, String>(())
                }
            },
            |_| Readiness::Ready,
        )
        .await
        .unwrap();

        assert_eq!(result.attempts, 2);
        assert_eq!(result.elapsed, Duration::from_secs(60));
    }

    #[test]
    fn test_fetch_timeout_floor() {
        assert_eq!(
            fetch_timeout(PollSettings::new(Duration::from_secs(1), 3)),
            MIN_FETCH_TIMEOUT
        );
        assert_eq!(
            fetch_timeout(PollSettings::new(Duration::from_secs(30), 3)),
            Duration::from_secs(30)
        );
    }
}
