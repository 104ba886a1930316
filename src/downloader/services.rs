//! Background janitor: evicts settled job records and expired cache entries.

use std::sync::Arc;
use std::time::Duration;

use super::MediaDownloader;

/// Upper bound on one store purge
const STORE_PURGE_TIMEOUT: Duration = Duration::from_secs(10);

impl MediaDownloader {
    /// Start the janitor background task
    ///
    /// Runs every `jobs.janitor_interval` until [`shutdown`](Self::shutdown).
    pub fn start_janitor(&self) -> tokio::task::JoinHandle<()> {
        let downloader = self.clone();
        let interval_period = self.config.jobs.janitor_interval;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval_period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = downloader.jobs.shutdown.cancelled() => {
                        tracing::debug!("Janitor stopped");
                        break;
                    }
                    _ = interval.tick() => downloader.sweep().await,
                }
            }
        });

        tracing::info!(
            interval_secs = interval_period.as_secs(),
            "Janitor background task started"
        );
        handle
    }

    /// One janitor pass
    pub(crate) async fn sweep(&self) {
        let records = self.jobs.registry.evict_expired();
        let cached = self.pipeline.cache.purge_expired();

        let mut stored = 0;
        if let Some(store) = self.store.as_ref().map(Arc::clone) {
            match tokio::time::timeout(STORE_PURGE_TIMEOUT, store.purge_expired()).await {
                Ok(Ok(n)) => stored = n,
                Ok(Err(e)) => {
                    tracing::warn!(store = store.name(), error = %e, "Failed to purge expired store entries")
                }
                Err(_) => tracing::warn!(store = store.name(), "Store purge timed out"),
            }
        }

        if records + cached > 0 || stored > 0 {
            tracing::debug!(records, cached, stored, "Janitor evicted expired entries");
        }
    }
}
