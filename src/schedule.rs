//! Whole-run retry and a minimal in-process trigger.
//!
//! Feed failures never reach this layer; only runs that fail outright are
//! retried, with a fixed delay and a bounded number of attempts.

use std::future::Future;
use std::time::Duration;

use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{error, info, warn};

/// Fixed-delay retry for whole runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(1),
        }
    }
}

/// Calls `op` until it succeeds or `policy.max_attempts` attempts have failed.
///
/// `op` receives the 1-based attempt number. The last error is returned.
pub async fn run_with_retry<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> anyhow::Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts => {
                warn!(
                    attempt,
                    max_attempts,
                    error = %format_args!("{e:#}"),
                    "Run failed, retrying"
                );
                sleep(policy.delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(attempt, error = %format_args!("{e:#}"), "Run failed, giving up");
                return Err(e);
            }
        }
    }
}

/// Invokes `job` once per `period` until `max_runs` runs have happened
/// (`None` = forever) or Ctrl+C is received.
///
/// Runs never overlap: a tick that fires while a run is in progress is
/// skipped rather than queued. A run in progress is never cancelled; Ctrl+C
/// during a run stops the schedule once it finishes.
pub async fn run_every<F, Fut>(period: Duration, max_runs: Option<usize>, job: F)
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = ()>,
{
    run_until(period, max_runs, tokio::signal::ctrl_c(), job).await;
}

/// [`run_every`] with an arbitrary stop signal.
///
/// `shutdown` is polled before every tick, so a signal that completes while
/// `job` is running is seen as soon as the job returns.
pub async fn run_until<S, F, Fut>(
    period: Duration,
    max_runs: Option<usize>,
    shutdown: S,
    mut job: F,
) -> usize
where
    S: Future,
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = ()>,
{
    // `interval` rejects a zero period.
    let mut ticker = interval(period.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tokio::pin!(shutdown);

    let mut runs = 0;
    loop {
        if max_runs.is_some_and(|max| runs >= max) {
            break;
        }

        tokio::select! {
            biased;
            _ = &mut shutdown => {
                info!("Interrupted, stopping schedule");
                break;
            }
            _ = ticker.tick() => {}
        }

        runs += 1;
        job(runs).await;
    }

    info!(runs, "Schedule finished");
    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_delay(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let value = run_with_retry(&no_delay(3), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(7) }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let value = run_with_retry(&no_delay(3), |attempt| async move {
            if attempt < 3 {
                anyhow::bail!("attempt {attempt} failed");
            }
            Ok(attempt)
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let err = run_with_retry(&no_delay(3), |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(anyhow::anyhow!("attempt {attempt} failed")) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.to_string(), "attempt 3 failed");
    }

    #[tokio::test]
    async fn test_zero_attempts_still_runs_once() {
        let calls = AtomicU32::new(0);
        let _ = run_with_retry(&no_delay(0), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("nope")) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_signal_during_run_is_not_lost() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut tx = Some(tx);

        let runs = run_until(Duration::from_millis(5), Some(5), rx, |_| {
            // Signal arrives while the first run is in progress.
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
            async {}
        })
        .await;

        assert_eq!(runs, 1);
    }

    #[tokio::test]
    async fn test_zero_period_does_not_panic() {
        let runs =
            run_until(Duration::ZERO, Some(2), std::future::pending::<()>(), |_| async {}).await;
        assert_eq!(runs, 2);
    }

    #[tokio::test]
    async fn test_run_every_stops_after_max_runs() {
        let runs = Arc::new(AtomicU32::new(0));
        let counter = runs.clone();
        run_every(Duration::from_millis(5), Some(3), move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
