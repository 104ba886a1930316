//! Fallback/retry cascade over extraction strategies
//!
//! A job's extraction is attempted once per [`Strategy`], lowest tier first,
//! until one attempt yields a non-empty artifact. Each attempt:
//! - gets its own `attempt-N` subdirectory of the job's working directory,
//!   removed again if the attempt fails
//! - is bounded by `attempt_timeout` via [`run_attempt`](crate::watchdog::run_attempt)
//! - is separated from the previous one by an exponential backoff that the
//!   job's cancel token can interrupt
//!
//! Per-attempt failures are reported through a callback and never surface on
//! their own; only exhaustion does, as [`Error::ExtractionFailed`].

mod strategy;
mod ytdlp;

pub use strategy::{Credential, EgressRoute, Strategy, order_strategies};
pub use ytdlp::YtDlpExtractor;

use crate::config::{CascadeConfig, RetryConfig};
use crate::error::{Error, ExtractionError, Result};
use crate::retry::{Backoff, IsRetryable};
use crate::types::{JobId, MediaArtifact, NormalizedRequest, OutputFormat, ResourceClass};
use crate::watchdog::run_attempt;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything the extractor needs to know about the job
#[derive(Clone, Debug)]
pub struct ExtractionRequest {
    /// Job being served
    pub job_id: JobId,
    /// URL or search query
    pub request: NormalizedRequest,
    /// Resource class of the job
    pub resource_class: ResourceClass,
    /// Wanted output format
    pub format: OutputFormat,
    /// Directory the extractor must write into
    pub work_dir: PathBuf,
}

/// Resolves a request to a media file using one strategy
///
/// Implementations must honor `cancel` at every wait and leave nothing running
/// once they return.
#[async_trait]
pub trait Extractor: Send + Sync {
    /// Produce a media file inside `request.work_dir`
    async fn extract(
        &self,
        request: &ExtractionRequest,
        strategy: &Strategy,
        cancel: &CancellationToken,
    ) -> std::result::Result<MediaArtifact, ExtractionError>;

    /// Extractor name for logging
    fn name(&self) -> &str;
}

/// A failed attempt, reported before the cascade moves on
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// 1-based attempt number
    pub attempt: usize,
    /// Strategy that failed
    pub strategy: String,
    /// What went wrong
    pub error: ExtractionError,
}

/// Ordered extraction attempts for one job
pub struct Cascade {
    extractor: Arc<dyn Extractor>,
    strategies: Vec<Strategy>,
    attempt_timeout: Duration,
    retry: RetryConfig,
}

impl Cascade {
    /// Build a cascade from configuration
    pub fn new(extractor: Arc<dyn Extractor>, config: &CascadeConfig) -> Self {
        Self {
            extractor,
            strategies: config.strategies.clone(),
            attempt_timeout: config.attempt_timeout,
            retry: config.retry.clone(),
        }
    }

    /// Configured strategies, in configuration order
    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    /// Try strategies in order until one produces an artifact
    ///
    /// Returns [`Error::Cancelled`] as soon as `cancel` fires (including
    /// during a backoff wait) and [`Error::ExtractionFailed`] when every
    /// strategy failed or a failure no other strategy can fix occurred.
    pub async fn run_cascade<F>(
        &self,
        request: &ExtractionRequest,
        cancel: &CancellationToken,
        mut on_failure: F,
    ) -> Result<MediaArtifact>
    where
        F: FnMut(&AttemptFailure) + Send,
    {
        let ordered = order_strategies(&self.strategies, &mut rand::thread_rng());
        let mut backoff = Backoff::new(&self.retry);
        let mut attempts = 0;
        let mut last_error: Option<ExtractionError> = None;

        for strategy in &ordered {
            if attempts > 0 {
                let delay = backoff.next_delay();
                tracing::debug!(job_id = %request.job_id, delay_ms = delay.as_millis() as u64, "waiting before next strategy");
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            attempts += 1;
            let attempt_dir = request.work_dir.join(format!("attempt-{attempts}"));
            tokio::fs::create_dir_all(&attempt_dir).await?;
            let attempt_request = ExtractionRequest {
                work_dir: attempt_dir.clone(),
                ..request.clone()
            };

            tracing::debug!(
                job_id = %request.job_id,
                strategy = %strategy.name,
                attempt = attempts,
                extractor = self.extractor.name(),
                "extraction attempt"
            );

            let result = run_attempt(
                cancel,
                self.attempt_timeout,
                self.extractor.extract(&attempt_request, strategy, cancel),
            )
            .await
            .and_then(|artifact| {
                if artifact.size_bytes == 0 {
                    Err(ExtractionError::NoOutput(format!(
                        "{} is empty",
                        artifact.path.display()
                    )))
                } else {
                    Ok(artifact)
                }
            });

            match result {
                Ok(artifact) => {
                    tracing::info!(
                        job_id = %request.job_id,
                        strategy = %strategy.name,
                        attempt = attempts,
                        size_bytes = artifact.size_bytes,
                        "extraction succeeded"
                    );
                    return Ok(artifact);
                }
                Err(ExtractionError::Cancelled) => return Err(Error::Cancelled),
                Err(error) => {
                    tracing::warn!(
                        job_id = %request.job_id,
                        strategy = %strategy.name,
                        attempt = attempts,
                        error = %error,
                        "extraction attempt failed"
                    );
                    on_failure(&AttemptFailure {
                        attempt: attempts,
                        strategy: strategy.name.clone(),
                        error: error.clone(),
                    });
                    if let Err(e) = tokio::fs::remove_dir_all(&attempt_dir).await {
                        tracing::debug!(path = %attempt_dir.display(), error = %e, "failed to clean attempt directory");
                    }

                    let retryable = error.is_retryable();
                    last_error = Some(error);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(Error::ExtractionFailed {
            attempts,
            last_error: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no strategies configured".to_string()),
        })
    }
}
