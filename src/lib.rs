//! # media-dl
//!
//! Job orchestration and adaptive delivery pipeline for chat-driven media
//! download services.
//!
//! A front end (chat bot, HTTP handler) hands each user request to
//! [`MediaDownloader::submit_job`]. The downloader deduplicates it, enforces
//! per-user and per-resource-class concurrency ceilings, consults the result
//! cache, runs an extraction cascade (yt-dlp with rotating credentials and
//! egress routes), fits the result under the delivery size ceiling by
//! re-encoding or splitting (ffmpeg), and hands the parts to a
//! [`DeliverySink`]. Every job runs under a watchdog timeout and every slot
//! it holds is released on every exit path.
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_dl::{Config, JobRequest, MediaDownloader, ResourceClass};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let downloader = MediaDownloader::new(Config::default()).await?;
//!     let _janitor = downloader.start_janitor();
//!
//!     // Subscribe to events
//!     let mut events = downloader.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let request = JobRequest::new(42, "https://example.com/watch?v=abc", ResourceClass::BulkVideo);
//!     let outcome = downloader.submit_job(request).await?;
//!     println!("delivered {} part(s): {:?}", outcome.parts, outcome.reference.handles);
//!
//!     downloader.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Two-layer result cache
pub mod cache;
/// Extraction cascade over ordered strategies
pub mod cascade;
/// Configuration types
pub mod config;
/// SQLite persistence layer
pub mod db;
/// Delivery collaborator boundary
pub mod delivery;
/// Job orchestration service (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Size-ceiling enforcement (re-encode, split)
pub mod finisher;
/// Per-class and per-user concurrency limits
pub mod limits;
/// External process execution
pub mod process;
/// In-flight job registry
pub mod registry;
/// Backoff between extraction attempts
pub mod retry;
/// Key-value store boundary
pub mod store;
/// Core types and events
pub mod types;
/// Job and attempt timeouts
pub mod watchdog;

// Re-export commonly used types
pub use cache::{CacheStats, ResultCache};
pub use cascade::{Extractor, Strategy, YtDlpExtractor};
pub use config::Config;
pub use db::Database;
pub use delivery::{DeliveryContext, DeliverySink, DirectorySink};
pub use downloader::{Collaborators, MediaDownloader};
pub use error::{DatabaseError, Error, ExtractionError, Result};
pub use finisher::{FfmpegToolkit, MediaToolkit};
pub use limits::PoolUsage;
pub use store::{KeyValueStore, MemoryStore};
pub use types::{
    ArtifactReference, DeliveryPlan, Event, JobId, JobOutcome, JobRequest, JobState,
    MediaArtifact, OutputFormat, ResourceClass, UserId,
};

/// Helper function to run the downloader with graceful signal handling.
///
/// Waits for a termination signal and then calls the downloader's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use media_dl::{MediaDownloader, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let downloader = MediaDownloader::new(config).await?;
///
///     // Run with automatic signal handling
///     run_with_shutdown(downloader).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(downloader: MediaDownloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Set up signal handlers - these may fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
