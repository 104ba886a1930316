//! Common test utilities for media-dl integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use media_dl::cascade::ExtractionRequest;
use media_dl::finisher::{EncodeTarget, Segment};
use media_dl::{
    ArtifactReference, Collaborators, Config, DeliveryContext, DeliveryPlan, DeliverySink, Error,
    ExtractionError, Extractor, MediaArtifact, MediaDownloader, MediaToolkit, Strategy,
};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Extractor whose behavior is chosen by the request text
///
/// - contains `hang`: never returns
/// - contains `fail`: the tool fails
/// - anything else: a 4 KiB file after `delay`
pub struct ScriptedExtractor {
    delay: Duration,
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

impl ScriptedExtractor {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn extract(
        &self,
        request: &ExtractionRequest,
        _strategy: &Strategy,
        _cancel: &CancellationToken,
    ) -> Result<MediaArtifact, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(Arc::clone(&self.in_flight));

        let text = request.request.as_str();
        if text.contains("hang") {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        if text.contains("fail") {
            return Err(ExtractionError::ToolFailed {
                tool: "scripted".into(),
                status: "exit status: 1".into(),
                diagnostic: "ERROR: Private video".into(),
            });
        }

        let path = request
            .work_dir
            .join(format!("media.{}", request.format.as_str()));
        tokio::fs::write(&path, vec![0u8; 4096])
            .await
            .map_err(|e| ExtractionError::NoOutput(e.to_string()))?;
        Ok(MediaArtifact {
            path,
            size_bytes: 4096,
            duration_secs: Some(30.0),
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Toolkit that must never be needed (artifacts are under the ceiling)
pub struct UnusedToolkit;

#[async_trait]
impl MediaToolkit for UnusedToolkit {
    async fn probe(
        &self,
        _input: &Path,
        _cancel: &CancellationToken,
    ) -> media_dl::Result<Option<f64>> {
        Err(Error::NotSupported("probe".into()))
    }

    async fn reencode(
        &self,
        _input: &Path,
        _output: &Path,
        _target: &EncodeTarget,
        _cancel: &CancellationToken,
    ) -> media_dl::Result<()> {
        Err(Error::NotSupported("reencode".into()))
    }

    async fn cut(
        &self,
        _input: &Path,
        _output: &Path,
        _segment: &Segment,
        _cancel: &CancellationToken,
    ) -> media_dl::Result<()> {
        Err(Error::NotSupported("cut".into()))
    }

    fn name(&self) -> &str {
        "unused"
    }
}

/// Sink that counts deliveries
#[derive(Default)]
pub struct CountingSink {
    delivered: AtomicUsize,
}

impl CountingSink {
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeliverySink for CountingSink {
    async fn deliver(
        &self,
        context: &DeliveryContext,
        plan: &DeliveryPlan,
    ) -> media_dl::Result<ArtifactReference> {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(ArtifactReference::new(
            (0..plan.len())
                .map(|i| format!("{}/{i}", context.job_id))
                .collect(),
        ))
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Downloader around the fakes above
pub struct Harness {
    pub downloader: MediaDownloader,
    pub extractor: Arc<ScriptedExtractor>,
    pub sink: Arc<CountingSink>,
    _dir: TempDir,
}

/// Build a harness; `configure` runs on top of fast test defaults
pub async fn harness(delay: Duration, configure: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.jobs.temp_dir = dir.path().join("temp");
    config.jobs.dedup_window = Duration::ZERO;
    config.jobs.supersede_grace = Duration::from_secs(5);
    config.jobs.job_timeout = Duration::from_secs(120);
    config.cascade.attempt_timeout = Duration::from_secs(60);
    config.persistence.output_dir = dir.path().join("media");
    configure(&mut config);

    let extractor = ScriptedExtractor::new(delay);
    let sink = Arc::new(CountingSink::default());
    let downloader = MediaDownloader::with_collaborators(
        config,
        Collaborators {
            extractor: Arc::clone(&extractor) as Arc<dyn Extractor>,
            toolkit: Arc::new(UnusedToolkit),
            sink: Arc::clone(&sink) as Arc<dyn DeliverySink>,
            store: None,
        },
    )
    .await
    .unwrap();

    Harness {
        downloader,
        extractor,
        sink,
        _dir: dir,
    }
}

/// Poll until `condition` holds or panic after ~20s
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..4000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition never became true");
}

/// No slot, permit or task is left behind
pub fn assert_no_leaks(downloader: &MediaDownloader) {
    assert_eq!(downloader.running_tasks(), 0, "job tasks still running");
    assert_eq!(downloader.active_jobs(), 0, "jobs still active");
    for usage in downloader.resource_usage() {
        assert_eq!(usage.in_use, 0, "{} permits leaked", usage.class);
        assert_eq!(
            usage.acquired_total, usage.released_total,
            "{} acquire/release mismatch",
            usage.class
        );
    }
}
