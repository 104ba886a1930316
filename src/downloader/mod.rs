//! Job orchestration service split into focused submodules.
//!
//! The `MediaDownloader` struct and its methods are organized by concern:
//! - [`admission`] - `submit_job`: dedup, supersede, user slot, spawn
//! - [`job_task`] - Execution of one admitted job under the watchdog
//! - [`lifecycle`] - Shutdown coordination
//! - [`services`] - Background janitor

mod admission;
mod job_task;
mod lifecycle;
mod services;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use crate::cache::{CacheStats, ResultCache};
use crate::cascade::{Cascade, Extractor, YtDlpExtractor};
use crate::config::Config;
use crate::db::Database;
use crate::delivery::{DeliverySink, DirectorySink};
use crate::error::{Error, Result};
use crate::finisher::{FfmpegToolkit, Finisher, MediaToolkit};
use crate::limits::{PoolUsage, ResourcePool, UserSlots};
use crate::registry::JobRegistry;
use crate::store::KeyValueStore;
use crate::types::{Event, JobId, JobState, NormalizedRequest, UserId};
use crate::watchdog::Watchdog;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// External collaborators a downloader is built from
///
/// [`MediaDownloader::new`] fills these in from configuration; tests and
/// embedders with their own front end pass them to
/// [`MediaDownloader::with_collaborators`].
pub struct Collaborators {
    /// Resolves a request to a media file
    pub extractor: Arc<dyn Extractor>,
    /// Probes, re-encodes and cuts media
    pub toolkit: Arc<dyn MediaToolkit>,
    /// Receives finished plans
    pub sink: Arc<dyn DeliverySink>,
    /// Durability for the cache and registry; `None` keeps both in memory
    pub store: Option<Arc<dyn KeyValueStore>>,
}

/// Concurrency limits
#[derive(Clone)]
pub(crate) struct Limits {
    /// Per-class ceilings on concurrent external work
    pub(crate) pool: Arc<ResourcePool>,
    /// Per-user ceilings on concurrent jobs
    pub(crate) user_slots: Arc<UserSlots>,
}

/// Job tracking and timeout enforcement
#[derive(Clone)]
pub(crate) struct JobTracking {
    /// Admitted, running and recently finished jobs
    pub(crate) registry: Arc<JobRegistry>,
    /// Job-level timeout wrapper
    pub(crate) watchdog: Watchdog,
    /// Job tasks spawned and not yet returned
    pub(crate) running_tasks: Arc<AtomicUsize>,
    /// Set to false during shutdown
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Cancelled at shutdown to stop background services
    pub(crate) shutdown: CancellationToken,
}

/// The cache-extract-finish-deliver pipeline
#[derive(Clone)]
pub(crate) struct Pipeline {
    /// Result cache consulted before extraction
    pub(crate) cache: Arc<ResultCache>,
    /// Extraction strategies
    pub(crate) cascade: Arc<Cascade>,
    /// Size-ceiling enforcement
    pub(crate) finisher: Arc<Finisher>,
    /// Delivery collaborator
    pub(crate) sink: Arc<dyn DeliverySink>,
}

/// Main service instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct MediaDownloader {
    /// Configuration (wrapped in Arc for sharing across tasks)
    pub(crate) config: Arc<Config>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// SQLite persistence, when configured
    pub(crate) db: Option<Arc<Database>>,
    /// The store the cache and registry write through to, when configured
    pub(crate) store: Option<Arc<dyn KeyValueStore>>,
    /// Whether the previous instance on this database did not shut down cleanly
    pub(crate) recovered_unclean: bool,
    /// Concurrency limits
    pub(crate) limits: Limits,
    /// Job tracking
    pub(crate) jobs: JobTracking,
    /// Processing pipeline
    pub(crate) pipeline: Pipeline,
}

impl MediaDownloader {
    /// Create a downloader using the real external tools
    ///
    /// This validates the configuration, resolves yt-dlp, ffmpeg and ffprobe
    /// (from explicit paths or PATH) and delivers into
    /// `persistence.output_dir`. Persistence follows
    /// [`with_collaborators`](Self::with_collaborators).
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let extractor = Arc::new(YtDlpExtractor::from_config(&config.tools)?);
        let toolkit = Arc::new(FfmpegToolkit::from_config(&config.tools)?);
        tracing::info!(
            ytdlp = %extractor.binary_path().display(),
            "external tools resolved"
        );
        let sink = Arc::new(DirectorySink::new(config.persistence.output_dir.clone()));

        Self::with_collaborators(
            config,
            Collaborators {
                extractor,
                toolkit,
                sink,
                store: None,
            },
        )
        .await
    }

    /// Create a downloader around caller-provided collaborators
    ///
    /// When `persistence.database_path` is set the SQLite database is opened
    /// for clean-shutdown tracking, and becomes the store unless
    /// `collaborators.store` names another one.
    pub async fn with_collaborators(
        config: Config,
        mut collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;

        let db = match &config.persistence.database_path {
            Some(path) => Some(Arc::new(Database::new(path).await?)),
            None => None,
        };
        if collaborators.store.is_none() {
            collaborators.store = db.clone().map(|db| db as Arc<dyn KeyValueStore>);
        }

        Self::build(config, collaborators, db).await
    }

    async fn build(
        config: Config,
        collaborators: Collaborators,
        db: Option<Arc<Database>>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.jobs.temp_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create temp directory '{}': {}",
                        config.jobs.temp_dir.display(),
                        e
                    ),
                ))
            })?;

        // Create broadcast channel with buffer size of 1000 events
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let mut registry = JobRegistry::new(&config.jobs);
        let mut cache = ResultCache::new(&config.cache);
        if let Some(store) = &collaborators.store {
            registry = registry.with_store(Arc::clone(store), config.cache.lookup_timeout);
            cache = cache.with_store(Arc::clone(store));
        }
        let registry = Arc::new(registry);

        // Mark that we're starting up (for unclean shutdown detection)
        let mut recovered_unclean = false;
        if let Some(db) = &db {
            let unclean = db.was_unclean_shutdown().await?;
            let previous = db.set_clean_start(registry.instance_id()).await?;
            if let Some(previous) = previous
                && unclean
            {
                tracing::warn!(
                    previous_instance = %previous,
                    "previous instance did not shut down cleanly"
                );
                recovered_unclean = true;
            }
        }

        tracing::info!(
            instance_id = registry.instance_id(),
            extractor = collaborators.extractor.name(),
            toolkit = collaborators.toolkit.name(),
            sink = collaborators.sink.name(),
            store = collaborators.store.as_ref().map(|s| s.name()),
            strategies = config.cascade.strategies.len(),
            "media downloader initialized"
        );

        let limits = Limits {
            pool: Arc::new(ResourcePool::new(&config.limits)),
            user_slots: Arc::new(UserSlots::new()),
        };

        let jobs = JobTracking {
            watchdog: Watchdog::new(Arc::clone(&registry)),
            registry,
            running_tasks: Arc::new(AtomicUsize::new(0)),
            accepting_new: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
        };

        let pipeline = Pipeline {
            cache: Arc::new(cache),
            cascade: Arc::new(Cascade::new(collaborators.extractor, &config.cascade)),
            finisher: Arc::new(Finisher::new(collaborators.toolkit, config.finisher.clone())),
            sink: collaborators.sink,
        };

        Ok(Self {
            config: Arc::new(config),
            event_tx,
            db,
            store: collaborators.store,
            recovered_unclean,
            limits,
            jobs,
            pipeline,
        })
    }

    /// Subscribe to job events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// Events are buffered, but if a subscriber falls behind by more than 1000 events,
    /// it will receive a `RecvError::Lagged` error.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    /// State of a job whose record is still held
    pub fn job_state(&self, id: &JobId) -> Option<JobState> {
        self.jobs.registry.state(id)
    }

    /// Whether `user_id` has an active job for `raw_request`
    pub fn is_running(&self, user_id: UserId, raw_request: &str) -> Result<bool> {
        let request = NormalizedRequest::parse(raw_request)?;
        Ok(self.jobs.registry.is_running(user_id, &request))
    }

    /// Per-class permit usage
    pub fn resource_usage(&self) -> Vec<PoolUsage> {
        self.limits.pool.usage_all()
    }

    /// User slots currently held by `user_id`
    pub fn active_user_slots(&self, user_id: UserId) -> usize {
        self.limits.user_slots.active(user_id)
    }

    /// Jobs in `Admitted` or `Running` state
    pub fn active_jobs(&self) -> usize {
        self.jobs.registry.active_count()
    }

    /// Job tasks that have been spawned and not yet returned
    ///
    /// A job can be terminal in the registry (timed out, superseded) while its
    /// task is still unwinding; this counts those too.
    pub fn running_tasks(&self) -> usize {
        self.jobs.running_tasks.load(Ordering::SeqCst)
    }

    /// Result cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.pipeline.cache.stats()
    }

    /// Whether the previous instance on the same database crashed
    pub fn recovered_from_unclean_shutdown(&self) -> bool {
        self.recovered_unclean
    }

    /// Cancel every active job of `user_id`
    ///
    /// Returns how many jobs were cancelled. Their slots are released as
    /// their tasks observe the cancellation.
    pub fn cancel_user_jobs(&self, user_id: UserId) -> usize {
        self.jobs.registry.supersede(user_id).len()
    }
}
