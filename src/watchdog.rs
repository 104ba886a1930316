//! Timeout and cancellation enforcement
//!
//! Everything that waits on something outside the process (a job as a whole,
//! one cascade attempt) runs through [`race`]: the work future is polled
//! against the job's cancel token and a deadline, and is dropped the moment
//! either fires. Dropping is what releases resources: slot guards held by the
//! future are dropped with it, and child processes are spawned with
//! `kill_on_drop` so they die too.

use crate::error::{Error, ExtractionError, Result};
use crate::registry::{JobHandle, JobRegistry};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// How a raced future ended
#[derive(Debug)]
pub enum Raced<T> {
    /// The future finished first
    Completed(T),
    /// The deadline elapsed; the future was dropped
    TimedOut,
    /// The cancel token fired; the future was dropped
    Cancelled,
}

/// Poll `work` until it completes, `timeout` elapses, or `cancel` fires
///
/// Cancellation wins ties so a job cancelled at its deadline is reported as
/// cancelled.
pub async fn race<F>(cancel: &CancellationToken, timeout: Duration, work: F) -> Raced<F::Output>
where
    F: Future,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Raced::Cancelled,
        result = tokio::time::timeout(timeout, work) => match result {
            Ok(output) => Raced::Completed(output),
            Err(_) => Raced::TimedOut,
        },
    }
}

/// Bound a single extraction attempt
///
/// The attempt's own deadline expiring is an ordinary attempt failure (the
/// cascade moves on); the job being cancelled is not.
pub async fn run_attempt<T, F>(
    cancel: &CancellationToken,
    timeout: Duration,
    attempt: F,
) -> std::result::Result<T, ExtractionError>
where
    F: Future<Output = std::result::Result<T, ExtractionError>>,
{
    match race(cancel, timeout, attempt).await {
        Raced::Completed(result) => result,
        Raced::TimedOut => Err(ExtractionError::AttemptTimedOut(timeout)),
        Raced::Cancelled => Err(ExtractionError::Cancelled),
    }
}

/// Job-level timeout enforcement
#[derive(Clone)]
pub struct Watchdog {
    registry: Arc<JobRegistry>,
}

impl Watchdog {
    /// Create a watchdog reporting timeouts to `registry`
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }

    /// Run a job's work under `timeout`
    ///
    /// On expiry the job is marked [`TimedOut`](crate::types::JobState::TimedOut),
    /// its cancel token is fired, and the work future is dropped before this
    /// returns, so everything it held is already released.
    pub async fn run_with_timeout<T, F>(
        &self,
        handle: &JobHandle,
        timeout: Duration,
        work: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        match race(handle.cancel_token(), timeout, work).await {
            Raced::Completed(result) => {
                tracing::debug!(
                    job_id = %handle.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    ok = result.is_ok(),
                    "job work finished"
                );
                result
            }
            Raced::TimedOut => {
                tracing::warn!(
                    job_id = %handle.id(),
                    timeout_secs = timeout.as_secs(),
                    "job exceeded its timeout, cancelling"
                );
                self.registry.mark_timed_out(handle);
                Err(Error::TimedOut { after: timeout })
            }
            Raced::Cancelled => {
                tracing::info!(
                    job_id = %handle.id(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "job cancelled"
                );
                Err(Error::Cancelled)
            }
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::types::{JobState, NormalizedRequest, ResourceClass, UserId};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    async fn running_job(registry: &JobRegistry) -> JobHandle {
        let handle = registry
            .submit(
                UserId(1),
                NormalizedRequest::parse("https://slow.example/v").unwrap(),
                ResourceClass::BulkVideo,
            )
            .await
            .unwrap();
        registry.mark_running(&handle).unwrap();
        handle
    }

    #[tokio::test(start_paused = true)]
    async fn race_reports_each_outcome() {
        let token = CancellationToken::new();
        let done = race(&token, Duration::from_secs(1), async { 7 }).await;
        assert!(matches!(done, Raced::Completed(7)));

        let slow = race(&token, Duration::from_secs(1), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
        })
        .await;
        assert!(matches!(slow, Raced::TimedOut));

        token.cancel();
        let cancelled = race(&token, Duration::from_secs(1), async { 7 }).await;
        assert!(matches!(cancelled, Raced::Cancelled), "cancel wins ties");
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_timeout_is_an_attempt_failure() {
        let token = CancellationToken::new();
        let result: std::result::Result<(), _> =
            run_attempt(&token, Duration::from_secs(2), async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(ExtractionError::AttemptTimedOut(d)) if d == Duration::from_secs(2)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_marks_job_and_drops_held_resources() {
        let registry = Arc::new(JobRegistry::new(&JobsConfig::default()));
        let watchdog = Watchdog::new(Arc::clone(&registry));
        let handle = running_job(&registry).await;

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(Arc::clone(&dropped));
        let started = Instant::now();

        let result: Result<()> = watchdog
            .run_with_timeout(&handle, Duration::from_secs(30), async move {
                let _guard = guard;
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::TimedOut { after }) if after.as_secs() == 30));
        assert!(started.elapsed() < Duration::from_secs(31));
        assert!(dropped.load(Ordering::SeqCst), "work future dropped on timeout");
        assert!(handle.cancel_token().is_cancelled());
        assert_eq!(registry.state(handle.id()), Some(JobState::TimedOut));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_drops_work_promptly() {
        let registry = Arc::new(JobRegistry::new(&JobsConfig::default()));
        let watchdog = Watchdog::new(Arc::clone(&registry));
        let handle = running_job(&registry).await;

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(Arc::clone(&dropped));
        let token = handle.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            token.cancel();
        });

        let result: Result<()> = watchdog
            .run_with_timeout(&handle, Duration::from_secs(600), async move {
                let _guard = guard;
                std::future::pending::<()>().await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(dropped.load(Ordering::SeqCst));
        assert_eq!(registry.state(handle.id()), Some(JobState::Running));
    }

    #[tokio::test]
    async fn completed_work_passes_its_result_through() {
        let registry = Arc::new(JobRegistry::new(&JobsConfig::default()));
        let watchdog = Watchdog::new(Arc::clone(&registry));
        let handle = running_job(&registry).await;

        let ok = watchdog
            .run_with_timeout(&handle, Duration::from_secs(5), async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(ok, 5);

        let err: Result<()> = watchdog
            .run_with_timeout(&handle, Duration::from_secs(5), async {
                Err(Error::EncodingFailed("zero duration".into()))
            })
            .await;
        assert!(matches!(err, Err(Error::EncodingFailed(_))));
        assert_eq!(registry.state(handle.id()), Some(JobState::Running));
    }
}
