//! Shutdown coordination.

use crate::error::Result;
use crate::types::Event;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::MediaDownloader;

/// How long shutdown waits for job tasks to unwind
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

impl MediaDownloader {
    /// Gracefully shut down the downloader
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops admitting new jobs
    /// 2. Cancels every admitted and running job
    /// 3. Closes the resource pool so queued jobs stop waiting for permits
    /// 4. Waits for job tasks to unwind with a timeout (30 seconds)
    /// 5. Stops background services
    /// 6. Marks a clean shutdown in the database
    ///
    /// # Errors
    ///
    /// Database failures are logged rather than returned so the remaining
    /// steps still run; the method currently always returns `Ok`.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        // 1. Stop accepting new jobs
        self.jobs.accepting_new.store(false, Ordering::SeqCst);
        tracing::info!("Stopped accepting new jobs");

        // 2. Cancel everything in flight
        let cancelled = self.jobs.registry.cancel_all();
        tracing::info!(cancelled, "Signaled cancellation to active jobs");

        // 3. Wake jobs still queued on a permit
        self.limits.pool.close();

        // 4. Wait for job tasks to return
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.wait_for_running_tasks()).await {
            Ok(()) => tracing::info!("All job tasks finished"),
            Err(_) => tracing::warn!(
                remaining = self.running_tasks(),
                "Timeout waiting for job tasks, proceeding with shutdown"
            ),
        }

        // 5. Stop the janitor
        self.jobs.shutdown.cancel();

        // 6. Mark clean shutdown in database
        if let Some(db) = &self.db {
            if let Err(e) = db.set_clean_shutdown().await {
                tracing::error!(error = %e, "Failed to mark clean shutdown in database");
            } else {
                tracing::info!("Marked clean shutdown in database");
            }
        }

        self.emit_event(Event::Shutdown);

        let (acquired, released) = self.limits.user_slots.totals();
        tracing::info!(
            user_slots_acquired = acquired,
            user_slots_released = released,
            "Graceful shutdown complete"
        );
        Ok(())
    }

    async fn wait_for_running_tasks(&self) {
        loop {
            let running = self.running_tasks();
            if running == 0 {
                return;
            }
            tracing::debug!(running, "Waiting for job tasks to finish");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}
