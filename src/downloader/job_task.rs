//! Execution of one admitted job.
//!
//! Slot order is fixed everywhere: the user slot is taken at admission
//! (non-blocking), the resource permit here (blocking, cancellable). Both are
//! RAII guards owned by [`MediaDownloader::execute`], so every exit path
//! releases them before the registry is told the job has settled.

use crate::cascade::ExtractionRequest;
use crate::delivery::DeliveryContext;
use crate::error::{Error, Result};
use crate::finisher::FinishStep;
use crate::limits::UserSlot;
use crate::registry::{JobHandle, JobRegistry};
use crate::types::{Event, JobOutcome, JobState, OutputFormat};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::Instant;

use super::{JobTracking, MediaDownloader};

/// Counts a spawned job task until it returns or is dropped
pub(crate) struct RunningTask(Arc<AtomicUsize>);

impl Drop for RunningTask {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl JobTracking {
    pub(crate) fn track_task(&self) -> RunningTask {
        self.running_tasks.fetch_add(1, Ordering::SeqCst);
        RunningTask(Arc::clone(&self.running_tasks))
    }
}

/// Settles the job if its task unwinds (panic, runtime teardown) before
/// reporting a result
struct SettleOnDrop {
    registry: Arc<JobRegistry>,
    handle: Option<JobHandle>,
}

impl SettleOnDrop {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for SettleOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let state = if std::thread::panicking() {
                JobState::Failed
            } else {
                JobState::Cancelled
            };
            tracing::error!(job_id = %handle.id(), state = ?state, "job task ended without a result");
            self.registry.finish(&handle, state);
        }
    }
}

impl MediaDownloader {
    /// Run an admitted job to a terminal state
    pub(crate) async fn run_job(
        self,
        handle: JobHandle,
        format: OutputFormat,
        user_slot: UserSlot,
    ) -> Result<JobOutcome> {
        let guard = SettleOnDrop {
            registry: Arc::clone(&self.jobs.registry),
            handle: Some(handle.clone()),
        };
        let started = Instant::now();

        let result = self.execute(&handle, &format, user_slot).await;
        guard.disarm();

        let recorded = self
            .jobs
            .registry
            .finish(&handle, JobState::from_result(&result));
        self.report(&handle, &result, recorded, started);
        result
    }

    /// Acquire the resource permit and run the pipeline under the watchdog
    async fn execute(
        &self,
        handle: &JobHandle,
        format: &OutputFormat,
        user_slot: UserSlot,
    ) -> Result<JobOutcome> {
        let cancel = handle.cancel_token();
        let class = handle.resource_class();

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = self.limits.pool.acquire(class) => permit?,
        };
        self.jobs.registry.mark_running(handle)?;
        self.emit_event(Event::JobStarted {
            id: handle.id().clone(),
        });
        tracing::info!(
            job_id = %handle.id(),
            user_id = %handle.user_id(),
            resource_class = %class,
            "job started"
        );

        let result = self
            .jobs
            .watchdog
            .run_with_timeout(
                handle,
                self.config.jobs.job_timeout,
                self.process(handle, format),
            )
            .await;

        drop(permit);
        drop(user_slot);
        result
    }

    /// Cache lookup, cascade, finisher, delivery, cache store
    async fn process(&self, handle: &JobHandle, format: &OutputFormat) -> Result<JobOutcome> {
        let cancel = handle.cancel_token();

        if let Some(reference) = self.pipeline.cache.lookup(handle.request(), format).await {
            self.emit_event(Event::CacheHit {
                id: handle.id().clone(),
            });
            return Ok(JobOutcome {
                job_id: handle.id().clone(),
                parts: reference.handles.len(),
                reference,
                from_cache: true,
                partial: false,
            });
        }

        // Removed when dropped, on every exit path
        let work_dir = tempfile::Builder::new()
            .prefix(&format!("job-{}-", handle.id().short()))
            .tempdir_in(&self.config.jobs.temp_dir)?;

        let extraction = ExtractionRequest {
            job_id: handle.id().clone(),
            request: handle.request().clone(),
            resource_class: handle.resource_class(),
            format: format.clone(),
            work_dir: work_dir.path().to_path_buf(),
        };
        let artifact = self
            .pipeline
            .cascade
            .run_cascade(&extraction, cancel, |failure| {
                self.emit_event(Event::AttemptFailed {
                    id: handle.id().clone(),
                    strategy: failure.strategy.clone(),
                    error: failure.error.to_string(),
                });
            })
            .await?;

        let plan = self
            .pipeline
            .finisher
            .ensure_within_limit(
                &artifact,
                self.pipeline.finisher.limit_bytes(),
                format,
                work_dir.path(),
                cancel,
                |step| {
                    let event = match step {
                        FinishStep::Reencoding(target) => Event::Reencoding {
                            id: handle.id().clone(),
                            video_bps: target.video_bps,
                            audio_bps: target.audio_bps,
                        },
                        FinishStep::Splitting { parts } => Event::Splitting {
                            id: handle.id().clone(),
                            parts,
                        },
                    };
                    self.emit_event(event);
                },
            )
            .await?;

        let context = DeliveryContext {
            job_id: handle.id().clone(),
            user_id: handle.user_id(),
            resource_class: handle.resource_class(),
        };
        let reference = self.pipeline.sink.deliver(&context, &plan).await?;

        // A best-effort plan is not worth repeating from cache
        if !plan.oversized {
            self.pipeline
                .cache
                .store(handle.request(), format, &reference, self.config.cache.ttl)
                .await;
        }

        Ok(JobOutcome {
            job_id: handle.id().clone(),
            reference,
            from_cache: false,
            parts: plan.len(),
            partial: plan.oversized,
        })
    }

    fn report(
        &self,
        handle: &JobHandle,
        result: &Result<JobOutcome>,
        recorded: Option<JobState>,
        started: Instant,
    ) {
        let id = handle.id().clone();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(outcome) => {
                tracing::info!(
                    job_id = %id,
                    elapsed_ms,
                    parts = outcome.parts,
                    from_cache = outcome.from_cache,
                    partial = outcome.partial,
                    "job completed"
                );
                self.emit_event(Event::JobCompleted {
                    id,
                    parts: outcome.parts,
                    from_cache: outcome.from_cache,
                    partial: outcome.partial,
                });
            }
            Err(Error::TimedOut { .. }) => {
                self.emit_event(Event::JobTimedOut { id });
            }
            Err(Error::Cancelled | Error::ShuttingDown) => {
                tracing::info!(job_id = %id, elapsed_ms, "job cancelled");
                self.emit_event(Event::JobCancelled { id });
            }
            Err(e) => {
                tracing::warn!(job_id = %id, elapsed_ms, error = %e, code = e.error_code(), "job failed");
                self.emit_event(Event::JobFailed {
                    id,
                    error: e.to_string(),
                });
            }
        }
        if let Some(state) = recorded
            && state != JobState::from_result(result)
        {
            tracing::debug!(job_id = %handle.id(), recorded = ?state, "registry kept an earlier terminal state");
        }
    }
}
