//! Single admission entry point: `submit_job`.

use crate::error::{Error, Result};
use crate::registry::{JobHandle, JobRegistry, SettleWaiter};
use crate::types::{Event, JobOutcome, JobRequest, NormalizedRequest};
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::MediaDownloader;

/// Removes an admitted record that never reached a job task
///
/// Covers rejection after admission (user over limit, superseded while
/// waiting) and the caller dropping `submit_job` before the task was spawned.
struct PendingAdmission {
    registry: Arc<JobRegistry>,
    handle: Option<JobHandle>,
}

impl PendingAdmission {
    fn new(registry: Arc<JobRegistry>, handle: JobHandle) -> Self {
        Self {
            registry,
            handle: Some(handle),
        }
    }

    /// The job task now owns the record
    fn hand_off(mut self) {
        self.handle = None;
    }
}

impl Drop for PendingAdmission {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            tracing::debug!(job_id = %handle.id(), "discarding job that never started");
            self.registry.discard(&handle);
        }
    }
}

impl MediaDownloader {
    /// Submit a request and wait for its outcome
    ///
    /// Steps, in order:
    /// 1. Normalize the request and deduplicate it against the registry
    /// 2. Supersede the user's older jobs (if enabled) and wait, bounded by
    ///    `supersede_grace`, for them to release their slots
    /// 3. Take a user slot without blocking
    /// 4. Run the job task: resource permit, cache, cascade, finisher,
    ///    delivery, all under the job timeout
    ///
    /// Dropping the returned future cancels the job; its slots are released
    /// as the task unwinds.
    ///
    /// # Errors
    ///
    /// Admission rejections ([`Error::DuplicateRequest`],
    /// [`Error::UserOverLimit`], [`Error::InvalidRequest`],
    /// [`Error::ShuttingDown`]) leave no trace. Terminal failures are
    /// [`Error::ExtractionFailed`], [`Error::TimedOut`], [`Error::Cancelled`],
    /// [`Error::EncodingFailed`] and [`Error::Delivery`].
    pub async fn submit_job(&self, request: JobRequest) -> Result<JobOutcome> {
        if !self.jobs.accepting_new.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }

        let normalized = NormalizedRequest::parse(&request.raw_request)?;
        let handle = self
            .jobs
            .registry
            .submit(request.user_id, normalized, request.resource_class)
            .await?;
        let pending = PendingAdmission::new(Arc::clone(&self.jobs.registry), handle.clone());

        self.emit_event(Event::JobAdmitted {
            id: handle.id().clone(),
            user_id: handle.user_id(),
            resource_class: handle.resource_class(),
        });

        if self.config.jobs.supersede_previous {
            let waiters = self
                .jobs
                .registry
                .supersede_except(handle.user_id(), handle.id());
            if !waiters.is_empty() {
                self.await_superseded(&handle, waiters).await;
            }
        }

        if handle.cancel_token().is_cancelled() || !self.jobs.accepting_new.load(Ordering::SeqCst)
        {
            self.emit_event(Event::JobCancelled {
                id: handle.id().clone(),
            });
            return Err(Error::Cancelled);
        }

        let limit = self.config.limits.max_jobs_per_user;
        let Some(user_slot) = self
            .limits
            .user_slots
            .try_acquire_slot(handle.user_id(), limit)
        else {
            let active = self.limits.user_slots.active(handle.user_id());
            tracing::info!(
                job_id = %handle.id(),
                user_id = %handle.user_id(),
                active,
                limit,
                "user over concurrent job limit"
            );
            return Err(Error::UserOverLimit {
                user_id: handle.user_id(),
                active,
                limit,
            });
        };

        let running = self.jobs.track_task();
        let task = self.clone();
        let task_handle = handle.clone();
        let format = request.output_format.clone();
        pending.hand_off();

        // Caller going away cancels the job
        let cancel_on_drop = handle.cancel_token().clone().drop_guard();
        let joined = tokio::spawn(async move {
            let _running = running;
            task.run_job(task_handle, format, user_slot).await
        })
        .await;
        cancel_on_drop.disarm();

        match joined {
            Ok(result) => result,
            Err(e) if e.is_panic() => {
                tracing::error!(job_id = %handle.id(), "job task panicked");
                let error = format!("job {} panicked", handle.id());
                self.emit_event(Event::JobFailed {
                    id: handle.id().clone(),
                    error: error.clone(),
                });
                Err(Error::Other(error))
            }
            Err(e) => Err(Error::Other(format!("job {} task failed: {e}", handle.id()))),
        }
    }

    /// Wait until superseded jobs have released their slots
    ///
    /// Bounded by `supersede_grace`; a job that is slow to unwind does not
    /// block the new one forever, it just makes the user slot check below
    /// more likely to fail. Returns early if this job is itself cancelled.
    async fn await_superseded(&self, handle: &JobHandle, waiters: Vec<SettleWaiter>) {
        let count = waiters.len();
        let grace = self.config.jobs.supersede_grace;
        let all_settled = futures::future::join_all(waiters.into_iter().map(SettleWaiter::wait));

        tokio::select! {
            biased;
            _ = handle.cancel_token().cancelled() => {}
            result = tokio::time::timeout(grace, all_settled) => {
                if result.is_err() {
                    tracing::warn!(
                        job_id = %handle.id(),
                        superseded = count,
                        grace_secs = grace.as_secs(),
                        "superseded jobs still unwinding after grace period"
                    );
                } else {
                    tracing::debug!(job_id = %handle.id(), superseded = count, "superseded jobs released their slots");
                }
            }
        }
    }
}
