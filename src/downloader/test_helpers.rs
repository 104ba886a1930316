//! Shared test helpers for creating MediaDownloader instances in tests.

use crate::cascade::{ExtractionRequest, Extractor, Strategy};
use crate::config::Config;
use crate::delivery::{DeliveryContext, DeliverySink};
use crate::downloader::{Collaborators, MediaDownloader};
use crate::error::{Error, ExtractionError, Result};
use crate::finisher::{EncodeTarget, MediaToolkit, Segment};
use crate::store::KeyValueStore;
use crate::types::{ArtifactReference, DeliveryPlan, MediaArtifact};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// What the fake extractor does on each call
#[derive(Clone, Debug)]
pub(crate) enum Behavior {
    /// Write a file of this many bytes
    Produce { size: u64, duration_secs: f64 },
    /// Fail as the tool would
    Fail,
    /// Never return
    Hang,
    /// Panic inside the job task
    Panic,
}

/// Extractor that counts calls and concurrent attempts
pub(crate) struct FakeExtractor {
    behavior: Mutex<Behavior>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak: AtomicUsize,
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeExtractor {
    pub(crate) fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        })
    }

    pub(crate) fn producing(size: u64) -> Arc<Self> {
        Self::new(Behavior::Produce {
            size,
            duration_secs: 60.0,
        })
    }

    pub(crate) fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub(crate) fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(
        &self,
        request: &ExtractionRequest,
        _strategy: &Strategy,
        _cancel: &CancellationToken,
    ) -> std::result::Result<MediaArtifact, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(Arc::clone(&self.in_flight));

        let (behavior, delay) = {
            let behavior = self.behavior.lock().unwrap().clone();
            let delay = *self.delay.lock().unwrap();
            (behavior, delay)
        };
        tokio::time::sleep(delay).await;

        match behavior {
            Behavior::Produce {
                size,
                duration_secs,
            } => {
                let path = request
                    .work_dir
                    .join(format!("media.{}", request.format.as_str()));
                let file = tokio::fs::File::create(&path).await.unwrap();
                file.set_len(size).await.unwrap();
                Ok(MediaArtifact {
                    path,
                    size_bytes: size,
                    duration_secs: Some(duration_secs),
                })
            }
            Behavior::Fail => Err(ExtractionError::ToolFailed {
                tool: "fake".into(),
                status: "exit status: 1".into(),
                diagnostic: "ERROR: Video unavailable".into(),
            }),
            Behavior::Hang => {
                std::future::pending::<()>().await;
                unreachable!()
            }
            Behavior::Panic => panic!("extractor blew up"),
        }
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Toolkit that halves on re-encode and cuts proportionally to time
pub(crate) struct FakeToolkit;

#[async_trait]
impl MediaToolkit for FakeToolkit {
    async fn probe(&self, _input: &Path, _cancel: &CancellationToken) -> Result<Option<f64>> {
        Ok(Some(60.0))
    }

    async fn reencode(
        &self,
        input: &Path,
        output: &Path,
        _target: &EncodeTarget,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let len = tokio::fs::metadata(input).await?.len();
        let file = tokio::fs::File::create(output).await?;
        file.set_len(len / 2).await?;
        Ok(())
    }

    async fn cut(
        &self,
        input: &Path,
        output: &Path,
        segment: &Segment,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let len = tokio::fs::metadata(input).await?.len();
        let secs = segment
            .duration_secs
            .unwrap_or(60.0 - segment.start_secs)
            .max(0.0);
        let file = tokio::fs::File::create(output).await?;
        file.set_len((len as f64 * secs / 60.0) as u64).await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "fake"
    }
}

/// Sink that records deliveries and hands out synthetic handles
#[derive(Default)]
pub(crate) struct RecordingSink {
    delivered: Mutex<Vec<(DeliveryContext, usize)>>,
    fail: AtomicBool,
    hang: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn deliveries(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub(crate) fn part_counts(&self) -> Vec<usize> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|(_, parts)| *parts)
            .collect()
    }

    pub(crate) fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub(crate) fn hang_forever(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeliverySink for RecordingSink {
    async fn deliver(
        &self,
        context: &DeliveryContext,
        plan: &DeliveryPlan,
    ) -> Result<ArtifactReference> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(Error::Delivery("chat upload rejected".into()));
        }
        for part in &plan.parts {
            assert!(part.path.exists(), "plan part missing at delivery time");
        }
        self.delivered
            .lock()
            .unwrap()
            .push((context.clone(), plan.len()));
        Ok(ArtifactReference::new(
            (0..plan.len())
                .map(|i| format!("file-id:{}:{i}", context.job_id.short()))
                .collect(),
        ))
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// A downloader wired to fakes, plus handles to inspect them
pub(crate) struct TestRig {
    pub(crate) downloader: MediaDownloader,
    pub(crate) extractor: Arc<FakeExtractor>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) temp_dir: TempDir,
}

/// Test configuration rooted in `dir`
///
/// Short timeouts and no dedup window, so tests can resubmit immediately.
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.jobs.temp_dir = dir.join("temp");
    config.jobs.dedup_window = Duration::ZERO;
    config.jobs.job_timeout = Duration::from_secs(120);
    config.jobs.supersede_grace = Duration::from_secs(5);
    config.cascade.attempt_timeout = Duration::from_secs(60);
    config.cascade.retry.initial_delay = Duration::from_millis(10);
    config.cascade.retry.jitter = false;
    config.persistence.output_dir = dir.join("media");
    config
}

/// Helper to create a test MediaDownloader around fakes.
/// The returned rig owns the tempdir, which must be kept alive.
pub(crate) async fn create_test_downloader_with(
    extractor: Arc<FakeExtractor>,
    configure: impl FnOnce(&mut Config),
    store: Option<Arc<dyn KeyValueStore>>,
) -> TestRig {
    let temp_dir = tempfile::tempdir().unwrap();
    let mut config = test_config(temp_dir.path());
    configure(&mut config);

    let sink = Arc::new(RecordingSink::default());
    let downloader = MediaDownloader::with_collaborators(
        config,
        Collaborators {
            extractor: Arc::clone(&extractor) as Arc<dyn Extractor>,
            toolkit: Arc::new(FakeToolkit),
            sink: Arc::clone(&sink) as Arc<dyn DeliverySink>,
            store,
        },
    )
    .await
    .unwrap();

    TestRig {
        downloader,
        extractor,
        sink,
        temp_dir,
    }
}

/// Downloader whose extractor produces a 1 KiB file
pub(crate) async fn create_test_downloader() -> TestRig {
    create_test_downloader_with(FakeExtractor::producing(1024), |_| {}, None).await
}

/// Poll until `condition` holds (paused-clock friendly)
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}
