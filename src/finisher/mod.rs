//! Adaptive media finisher
//!
//! Makes a produced artifact fit the delivery ceiling:
//! 1. pass through when it already fits
//! 2. otherwise re-encode once at a bitrate computed from the duration
//! 3. if that still does not fit (or fails), split the original into
//!    stream-copied, time-contiguous parts, refining the part count when a
//!    part comes out too large
//! 4. if no pass fits, return the last split anyway, flagged `oversized`
//!
//! Content is never dropped silently: the last split segment is open-ended,
//! and only parts that came out empty are left out of the plan.

mod ffmpeg;
mod plan;


pub use ffmpeg::FfmpegToolkit;
pub use plan::{
    EncodeTarget, Segment, chunk_target_bytes, compute_encode_target, part_count, split_segments,
};

use crate::config::FinisherConfig;
use crate::error::{Error, Result};
use crate::types::{DeliveryPlan, MediaArtifact, OutputFormat, PlanKind, PlanPart};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Media operations the finisher delegates to external tools
///
/// Implementations return [`Error::Cancelled`] when `cancel` fires and must not
/// leave a process running afterwards.
#[async_trait]
pub trait MediaToolkit: Send + Sync {
    /// Playback duration in seconds, if the container reports one
    async fn probe(&self, input: &Path, cancel: &CancellationToken) -> Result<Option<f64>>;

    /// Re-encode `input` into `output` at the given bitrates
    async fn reencode(
        &self,
        input: &Path,
        output: &Path,
        target: &EncodeTarget,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Copy one time range of `input` into `output` without re-encoding
    async fn cut(
        &self,
        input: &Path,
        output: &Path,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Toolkit name for logging
    fn name(&self) -> &str;
}

/// Progress reported while finishing an oversized artifact
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FinishStep {
    /// About to re-encode at this target
    Reencoding(EncodeTarget),
    /// About to split into this many parts
    Splitting {
        /// Number of segments cut in this pass
        parts: usize,
    },
}

/// Ensures artifacts fit the delivery ceiling
pub struct Finisher {
    toolkit: Arc<dyn MediaToolkit>,
    config: FinisherConfig,
}

impl Finisher {
    /// Create a finisher
    pub fn new(toolkit: Arc<dyn MediaToolkit>, config: FinisherConfig) -> Self {
        Self { toolkit, config }
    }

    /// Configured ceiling in bytes
    pub fn limit_bytes(&self) -> u64 {
        self.config.limit_bytes
    }

    /// Produce a delivery plan whose parts are each at most `limit_bytes`
    ///
    /// New files are written into `work_dir`. Zero-size or zero-duration
    /// input is [`Error::EncodingFailed`]; so is a split that fails outright.
    pub async fn ensure_within_limit<F>(
        &self,
        artifact: &MediaArtifact,
        limit_bytes: u64,
        format: &OutputFormat,
        work_dir: &Path,
        cancel: &CancellationToken,
        mut on_step: F,
    ) -> Result<DeliveryPlan>
    where
        F: FnMut(FinishStep) + Send,
    {
        if artifact.size_bytes == 0 {
            return Err(Error::EncodingFailed(format!(
                "{} is empty",
                artifact.path.display()
            )));
        }
        if let Some(duration) = artifact.duration_secs
            && duration <= 0.0
        {
            return Err(Error::EncodingFailed("media has zero duration".into()));
        }
        if limit_bytes == 0 {
            return Err(Error::EncodingFailed("size ceiling is zero".into()));
        }

        if artifact.size_bytes <= limit_bytes {
            return Ok(DeliveryPlan::pass_through(artifact));
        }

        let (duration, duration_known) = self.resolve_duration(artifact, cancel).await?;
        let extension = artifact
            .path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(format.as_str())
            .to_string();

        tracing::info!(
            path = %artifact.path.display(),
            size_bytes = artifact.size_bytes,
            limit_bytes,
            duration_secs = duration,
            "artifact exceeds delivery ceiling"
        );

        let target = compute_encode_target(limit_bytes, duration, format.is_audio(), &self.config);
        on_step(FinishStep::Reencoding(target));
        let reencoded = work_dir.join(format!("reencoded.{extension}"));
        if let Some(plan) = self
            .try_reencode(artifact, &reencoded, &target, limit_bytes, duration_known.then_some(duration), cancel)
            .await?
        {
            return Ok(plan);
        }

        self.split(
            artifact,
            duration,
            duration_known,
            limit_bytes,
            &extension,
            work_dir,
            cancel,
            &mut on_step,
        )
        .await
    }

    /// Known duration, else probed, else the configured fallback
    async fn resolve_duration(
        &self,
        artifact: &MediaArtifact,
        cancel: &CancellationToken,
    ) -> Result<(f64, bool)> {
        if let Some(duration) = artifact.duration_secs {
            return Ok((duration, true));
        }
        match self.toolkit.probe(&artifact.path, cancel).await {
            Ok(Some(duration)) if duration > 0.0 => Ok((duration, true)),
            Ok(Some(_)) => Err(Error::EncodingFailed("media has zero duration".into())),
            Ok(None) => {
                tracing::warn!(
                    path = %artifact.path.display(),
                    fallback_secs = self.config.fallback_duration_secs,
                    "duration unknown, using fallback"
                );
                Ok((self.config.fallback_duration_secs, false))
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                tracing::warn!(
                    path = %artifact.path.display(),
                    error = %e,
                    fallback_secs = self.config.fallback_duration_secs,
                    "probe failed, using fallback duration"
                );
                Ok((self.config.fallback_duration_secs, false))
            }
        }
    }

    /// One re-encode pass; `None` means fall through to splitting
    async fn try_reencode(
        &self,
        artifact: &MediaArtifact,
        output: &Path,
        target: &EncodeTarget,
        limit_bytes: u64,
        duration: Option<f64>,
        cancel: &CancellationToken,
    ) -> Result<Option<DeliveryPlan>> {
        tracing::debug!(
            toolkit = self.toolkit.name(),
            video_bps = target.video_bps,
            audio_bps = target.audio_bps,
            floor_hit = target.floor_hit,
            "re-encoding"
        );

        match self.toolkit.reencode(&artifact.path, output, target, cancel).await {
            Ok(()) => {}
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                tracing::warn!(error = %e, "re-encode failed, splitting instead");
                remove_quietly(output).await;
                return Ok(None);
            }
        }

        let size_bytes = match tokio::fs::metadata(output).await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                tracing::warn!(error = %e, "re-encode produced no readable output");
                return Ok(None);
            }
        };

        if size_bytes > 0 && size_bytes <= limit_bytes {
            tracing::info!(size_bytes, limit_bytes, "re-encoded artifact fits");
            return Ok(Some(DeliveryPlan {
                parts: vec![PlanPart {
                    path: output.to_path_buf(),
                    size_bytes,
                    start_secs: 0.0,
                    duration_secs: duration,
                }],
                kind: PlanKind::Reencoded,
                oversized: false,
            }));
        }

        tracing::info!(size_bytes, limit_bytes, "re-encoded artifact still too large");
        remove_quietly(output).await;
        Ok(None)
    }

    #[allow(clippy::too_many_arguments)]
    async fn split<F>(
        &self,
        artifact: &MediaArtifact,
        mut duration: f64,
        duration_known: bool,
        limit_bytes: u64,
        extension: &str,
        work_dir: &Path,
        cancel: &CancellationToken,
        on_step: &mut F,
    ) -> Result<DeliveryPlan>
    where
        F: FnMut(FinishStep) + Send,
    {
        let chunk = chunk_target_bytes(limit_bytes, self.config.split_headroom);
        let mut wanted = part_count(artifact.size_bytes, chunk);
        let mut retries_left = self.config.max_split_passes;
        let mut pass = 1u32;

        loop {
            on_step(FinishStep::Splitting { parts: wanted });
            tracing::info!(pass, parts = wanted, chunk_bytes = chunk, "splitting artifact");

            let parts = self
                .cut_pass(artifact, duration, duration_known, wanted, pass, extension, work_dir, cancel)
                .await?;
            if parts.is_empty() {
                return Err(Error::EncodingFailed("splitting produced no output".into()));
            }

            let largest = parts.iter().map(|p| p.size_bytes).max().unwrap_or(0);
            if largest <= limit_bytes {
                return Ok(DeliveryPlan {
                    parts,
                    kind: PlanKind::Split,
                    oversized: false,
                });
            }

            if retries_left == 0 {
                tracing::warn!(
                    parts = parts.len(),
                    largest_bytes = largest,
                    limit_bytes,
                    "could not split under the ceiling, delivering best effort"
                );
                return Ok(DeliveryPlan {
                    parts,
                    kind: PlanKind::Split,
                    oversized: true,
                });
            }

            // re-measure a guessed duration from the bounded parts
            let estimate = (!duration_known)
                .then(|| estimate_duration(&parts))
                .flatten()
                .filter(|estimate| *estimate > duration * 1.05);
            if let Some(estimate) = estimate {
                tracing::info!(
                    previous_secs = duration,
                    estimate_secs = estimate,
                    "re-estimated duration from split parts"
                );
                duration = estimate;
                wanted = part_count(artifact.size_bytes, chunk);
            } else {
                let scaled = (wanted as f64 * largest as f64 / chunk as f64).ceil() as usize;
                wanted = scaled.max(wanted + 1);
            }
            retries_left -= 1;
            pass += 1;
            for part in &parts {
                remove_quietly(&part.path).await;
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn cut_pass(
        &self,
        artifact: &MediaArtifact,
        duration: f64,
        duration_known: bool,
        wanted: usize,
        pass: u32,
        extension: &str,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<PlanPart>> {
        let mut parts = Vec::with_capacity(wanted);
        for segment in split_segments(duration, wanted) {
            let output: PathBuf =
                work_dir.join(format!("part-{pass}-{:03}.{extension}", segment.index));
            self.toolkit
                .cut(&artifact.path, &output, &segment, cancel)
                .await
                .map_err(|e| match e {
                    Error::Cancelled => Error::Cancelled,
                    other => Error::EncodingFailed(format!(
                        "cutting part {} failed: {other}",
                        segment.index + 1
                    )),
                })?;

            let size_bytes = tokio::fs::metadata(&output).await?.len();
            if size_bytes == 0 {
                tracing::debug!(index = segment.index, "dropping empty part");
                remove_quietly(&output).await;
                continue;
            }

            let duration_secs = segment.duration_secs.or_else(|| {
                duration_known.then(|| (duration - segment.start_secs).max(0.0))
            });
            parts.push(PlanPart {
                path: output,
                size_bytes,
                start_secs: segment.start_secs,
                duration_secs,
            });
        }
        Ok(parts)
    }
}

/// Total duration implied by a pass cut over a guessed duration
///
/// The bounded parts cover `[0, tail.start_secs)`; their bytes per second
/// extrapolate the open-ended tail.
fn estimate_duration(parts: &[PlanPart]) -> Option<f64> {
    let (tail, bounded) = parts.split_last()?;
    if tail.duration_secs.is_some() {
        return None;
    }
    let window_secs = tail.start_secs;
    let window_bytes: u64 = bounded.iter().map(|p| p.size_bytes).sum();
    if window_secs <= 0.0 || window_bytes == 0 {
        return None;
    }
    let bytes_per_sec = window_bytes as f64 / window_secs;
    Some(window_secs + tail.size_bytes as f64 / bytes_per_sec)
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = %path.display(), error = %e, "failed to remove intermediate file");
    }
}
