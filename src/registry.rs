//! Job registry and deduplicator
//!
//! Owns every job record from admission until eviction. A record is keyed by
//! the deterministic [`JobId`], so a resubmission of the same (user, request)
//! lands on the existing record and is rejected while that job is active or
//! was submitted within the dedup window.
//!
//! Terminal records linger for `retention` to answer "is this still running"
//! queries, except superseded jobs, which are evicted as soon as their task
//! settles.
//!
//! Every transition is written through to the optional
//! [`KeyValueStore`](crate::store::KeyValueStore) in a spawned task. The store
//! is consulted only when a submission misses the in-memory map, which lets a
//! restarted process keep rejecting duplicates of jobs that just finished.

use crate::config::JobsConfig;
use crate::error::{Error, Result};
use crate::store::KeyValueStore;
use crate::types::{JobId, JobState, NormalizedRequest, ResourceClass, UserId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

struct JobRecord {
    generation: u64,
    user_id: UserId,
    resource_class: ResourceClass,
    state: JobState,
    submitted_at: Instant,
    submitted_wall: chrono::DateTime<chrono::Utc>,
    finished_at: Option<Instant>,
    superseded: bool,
    cancel: CancellationToken,
    settled: watch::Sender<bool>,
}

/// Borrowed view of a job handed to the task that executes it
#[derive(Clone, Debug)]
pub struct JobHandle {
    id: JobId,
    generation: u64,
    user_id: UserId,
    request: NormalizedRequest,
    resource_class: ResourceClass,
    cancel: CancellationToken,
}

impl JobHandle {
    /// Job id
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Requesting user
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Normalized request
    pub fn request(&self) -> &NormalizedRequest {
        &self.request
    }

    /// Resource class
    pub fn resource_class(&self) -> ResourceClass {
        self.resource_class
    }

    /// Token cancelled on supersede, timeout or shutdown
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Resolves once a superseded job's task has released its slots
pub struct SettleWaiter {
    id: JobId,
    rx: watch::Receiver<bool>,
}

impl SettleWaiter {
    /// Job being waited on
    pub fn id(&self) -> &JobId {
        &self.id
    }

    /// Wait until the job has settled (or its record is gone)
    pub async fn wait(mut self) {
        // A dropped sender means the record was evicted, which only happens
        // after settling or discard.
        let _ = self.rx.wait_for(|settled| *settled).await;
    }
}

/// Record written to the store under `job:<id>`
#[derive(Clone, Debug, Serialize, Deserialize)]
struct JobSnapshot {
    job_id: JobId,
    user_id: UserId,
    resource_class: ResourceClass,
    state: JobState,
    instance_id: String,
    submitted_at: chrono::DateTime<chrono::Utc>,
}

fn snapshot_key(id: &JobId) -> String {
    format!("job:{}", id)
}

/// In-flight and recently finished jobs
pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    next_generation: AtomicU64,
    dedup_window: Duration,
    retention: Duration,
    store: Option<Arc<dyn KeyValueStore>>,
    store_timeout: Duration,
    instance_id: String,
}

impl JobRegistry {
    /// Create a registry with no persistent store
    pub fn new(jobs: &JobsConfig) -> Self {
        let instance_id = format!("{:016x}", rand::random::<u64>());
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            dedup_window: jobs.dedup_window,
            retention: jobs.retention,
            store: None,
            store_timeout: Duration::from_secs(2),
            instance_id,
        }
    }

    /// Write transitions through to `store`; reads are bounded by `timeout`
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>, timeout: Duration) -> Self {
        self.store = Some(store);
        self.store_timeout = timeout;
        self
    }

    /// Random id of this process instance, stamped on every snapshot
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<JobId, JobRecord>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_duplicate(&self, record: &JobRecord, now: Instant) -> bool {
        record.state.is_active() || now.duration_since(record.submitted_at) < self.dedup_window
    }

    /// Admit a job, or reject it as a duplicate
    ///
    /// Creates the record in [`JobState::Admitted`]. A record that is still
    /// active, or was submitted less than `dedup_window` ago, yields
    /// [`Error::DuplicateRequest`].
    pub async fn submit(
        &self,
        user_id: UserId,
        request: NormalizedRequest,
        resource_class: ResourceClass,
    ) -> Result<JobHandle> {
        let id = JobId::derive(user_id, &request);

        let known = {
            let jobs = self.lock();
            match jobs.get(&id) {
                Some(record) if self.is_duplicate(record, Instant::now()) => {
                    tracing::debug!(job_id = %id, state = ?record.state, "duplicate submission rejected");
                    return Err(Error::DuplicateRequest { job_id: id });
                }
                Some(_) => true,
                None => false,
            }
        };

        if !known && self.snapshot_is_duplicate(&id).await {
            tracing::debug!(job_id = %id, "duplicate of a job recorded by a previous instance");
            return Err(Error::DuplicateRequest { job_id: id });
        }

        let (handle, snapshot) = {
            let mut jobs = self.lock();
            let now = Instant::now();
            // Re-check: another submission may have raced us while the store was read
            if let Some(record) = jobs.get(&id)
                && self.is_duplicate(record, now)
            {
                return Err(Error::DuplicateRequest { job_id: id });
            }

            let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
            let cancel = CancellationToken::new();
            let (settled, _) = watch::channel(false);
            let record = JobRecord {
                generation,
                user_id,
                resource_class,
                state: JobState::Admitted,
                submitted_at: now,
                submitted_wall: chrono::Utc::now(),
                finished_at: None,
                superseded: false,
                cancel: cancel.clone(),
                settled,
            };
            let snapshot = self.snapshot(&id, &record);
            jobs.insert(id.clone(), record);

            let handle = JobHandle {
                id: id.clone(),
                generation,
                user_id,
                request,
                resource_class,
                cancel,
            };
            (handle, snapshot)
        };

        tracing::info!(
            job_id = %handle.id,
            user_id = %user_id,
            resource_class = %resource_class,
            "job admitted"
        );
        self.persist(snapshot);
        Ok(handle)
    }

    async fn snapshot_is_duplicate(&self, id: &JobId) -> bool {
        let Some(store) = &self.store else {
            return false;
        };

        let bytes = match tokio::time::timeout(self.store_timeout, store.get(&snapshot_key(id))).await
        {
            Ok(Ok(Some(bytes))) => bytes,
            Ok(Ok(None)) => return false,
            Ok(Err(e)) => {
                tracing::warn!(job_id = %id, store = store.name(), error = %e, "registry store unavailable");
                return false;
            }
            Err(_) => {
                tracing::warn!(job_id = %id, store = store.name(), "registry store lookup timed out");
                return false;
            }
        };

        let snapshot: JobSnapshot = match serde_json::from_slice(&bytes) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "ignoring unreadable job snapshot");
                return false;
            }
        };

        if snapshot.instance_id == self.instance_id {
            return false;
        }
        if snapshot.state.is_active() {
            // The instance that wrote this died mid-job; nothing is running it
            tracing::debug!(job_id = %id, instance = %snapshot.instance_id, "ignoring stale active snapshot");
            return false;
        }

        let age = chrono::Utc::now().signed_duration_since(snapshot.submitted_at);
        age.to_std().is_ok_and(|age| age < self.dedup_window)
    }

    fn snapshot(&self, id: &JobId, record: &JobRecord) -> Option<JobSnapshot> {
        self.store.as_ref()?;
        Some(JobSnapshot {
            job_id: id.clone(),
            user_id: record.user_id,
            resource_class: record.resource_class,
            state: record.state,
            instance_id: self.instance_id.clone(),
            submitted_at: record.submitted_wall,
        })
    }

    fn persist(&self, snapshot: Option<JobSnapshot>) {
        let (Some(store), Some(snapshot)) = (self.store.clone(), snapshot) else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let ttl = self.retention + self.dedup_window;
        runtime.spawn(async move {
            let key = snapshot_key(&snapshot.job_id);
            let result = match serde_json::to_vec(&snapshot) {
                Ok(bytes) => store.set(&key, bytes, ttl).await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                tracing::warn!(key = %key, store = store.name(), error = %e, "failed to persist job snapshot");
            }
        });
    }

    fn forget(&self, id: &JobId) {
        let Some(store) = self.store.clone() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let key = snapshot_key(id);
        runtime.spawn(async move {
            if let Err(e) = store.delete(&key).await {
                tracing::warn!(key = %key, error = %e, "failed to delete job snapshot");
            }
        });
    }

    /// Move an admitted job to [`JobState::Running`]
    ///
    /// Fails with [`Error::Cancelled`] if the job was superseded or cancelled
    /// while it waited for its slots.
    pub fn mark_running(&self, handle: &JobHandle) -> Result<()> {
        let snapshot = {
            let mut jobs = self.lock();
            let record = match jobs.get_mut(&handle.id) {
                Some(r) if r.generation == handle.generation => r,
                _ => return Err(Error::Cancelled),
            };
            if record.state != JobState::Admitted || handle.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            record.state = JobState::Running;
            self.snapshot(&handle.id, record)
        };

        tracing::debug!(job_id = %handle.id, "job running");
        self.persist(snapshot);
        Ok(())
    }

    /// Record that the watchdog fired for this job and cancel its work
    pub fn mark_timed_out(&self, handle: &JobHandle) {
        self.transition(handle, JobState::TimedOut);
        handle.cancel.cancel();
    }

    fn transition(&self, handle: &JobHandle, state: JobState) -> Option<JobState> {
        let (final_state, snapshot) = {
            let mut jobs = self.lock();
            let record = jobs
                .get_mut(&handle.id)
                .filter(|r| r.generation == handle.generation)?;
            if record.state.is_active() {
                record.state = state;
                record.finished_at = Some(Instant::now());
                (record.state, self.snapshot(&handle.id, record))
            } else {
                (record.state, None)
            }
        };
        self.persist(snapshot);
        Some(final_state)
    }

    /// Record the job's terminal state and signal that its slots are free
    ///
    /// The first terminal state wins: a job superseded or timed out keeps that
    /// state even if its task later reports something else. Superseded jobs
    /// are evicted here. Returns the recorded state.
    pub fn finish(&self, handle: &JobHandle, state: JobState) -> Option<JobState> {
        debug_assert!(state.is_terminal());
        let final_state = self.transition(handle, state)?;

        let evicted = {
            let mut jobs = self.lock();
            let Some(record) = jobs
                .get(&handle.id)
                .filter(|r| r.generation == handle.generation)
            else {
                return Some(final_state);
            };
            record.settled.send_replace(true);
            if record.superseded {
                jobs.remove(&handle.id);
                true
            } else {
                false
            }
        };

        if evicted {
            self.forget(&handle.id);
        }
        tracing::debug!(job_id = %handle.id, state = ?final_state, evicted, "job settled");
        Some(final_state)
    }

    /// Drop a record that never ran (e.g. rejected for the user's slot limit)
    ///
    /// The submission leaves no trace, so resubmitting is not a duplicate.
    pub fn discard(&self, handle: &JobHandle) {
        let removed = {
            let mut jobs = self.lock();
            match jobs.get(&handle.id) {
                Some(r) if r.generation == handle.generation => jobs.remove(&handle.id).is_some(),
                _ => false,
            }
        };
        if removed {
            self.forget(&handle.id);
        }
    }

    /// Cancel every active job of `user_id` except `keep`
    ///
    /// The jobs move to [`JobState::Cancelled`] immediately; the returned
    /// waiters resolve once each task has released its slots.
    pub fn supersede_except(&self, user_id: UserId, keep: &JobId) -> Vec<SettleWaiter> {
        self.supersede_matching(user_id, Some(keep))
    }

    /// Cancel every active job of `user_id`
    pub fn supersede(&self, user_id: UserId) -> Vec<SettleWaiter> {
        self.supersede_matching(user_id, None)
    }

    fn supersede_matching(&self, user_id: UserId, keep: Option<&JobId>) -> Vec<SettleWaiter> {
        let mut waiters = Vec::new();
        let mut snapshots = Vec::new();
        {
            let mut jobs = self.lock();
            let now = Instant::now();
            for (id, record) in jobs.iter_mut() {
                if record.user_id != user_id || Some(id) == keep || !record.state.is_active() {
                    continue;
                }
                record.state = JobState::Cancelled;
                record.finished_at = Some(now);
                record.superseded = true;
                record.cancel.cancel();
                waiters.push(SettleWaiter {
                    id: id.clone(),
                    rx: record.settled.subscribe(),
                });
                snapshots.push(self.snapshot(id, record));
                tracing::info!(job_id = %id, user_id = %user_id, "superseding previous job");
            }
        }
        for snapshot in snapshots {
            self.persist(snapshot);
        }
        waiters
    }

    /// Cancel the tokens of every active job (shutdown)
    pub fn cancel_all(&self) -> usize {
        let jobs = self.lock();
        let mut cancelled = 0;
        for record in jobs.values().filter(|r| r.state.is_active()) {
            record.cancel.cancel();
            cancelled += 1;
        }
        cancelled
    }

    /// Evict terminal records older than the retention window
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, record| match record.finished_at {
            Some(finished) if !record.state.is_active() => {
                now.duration_since(finished) < self.retention
            }
            _ => true,
        });
        let evicted = before - jobs.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted expired job records");
        }
        evicted
    }

    /// Current state of a job, if its record is still held
    pub fn state(&self, id: &JobId) -> Option<JobState> {
        self.lock().get(id).map(|r| r.state)
    }

    /// Whether the (user, request) pair has an active job
    pub fn is_running(&self, user_id: UserId, request: &NormalizedRequest) -> bool {
        let id = JobId::derive(user_id, request);
        self.state(&id).is_some_and(JobState::is_active)
    }

    /// Number of active jobs
    pub fn active_count(&self) -> usize {
        self.lock().values().filter(|r| r.state.is_active()).count()
    }

    /// Number of active jobs owned by `user_id`
    pub fn active_for_user(&self, user_id: UserId) -> usize {
        self.lock()
            .values()
            .filter(|r| r.user_id == user_id && r.state.is_active())
            .count()
    }

    /// Number of held records, active or terminal
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no records are held
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
