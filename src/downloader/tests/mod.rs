use super::test_helpers::*;
use super::*;
use crate::types::{JobOutcome, JobRequest, ResourceClass};
use std::time::Duration;

mod lifecycle;

fn video(user: i64, url: &str) -> JobRequest {
    JobRequest::new(user, url, ResourceClass::BulkVideo)
}

fn job_id(user: i64, raw: &str) -> JobId {
    JobId::derive(UserId(user), &NormalizedRequest::parse(raw).unwrap())
}

/// Spawn a submission so the test can interact with it while it runs
fn spawn_submit(
    downloader: &MediaDownloader,
    request: JobRequest,
) -> tokio::task::JoinHandle<Result<JobOutcome>> {
    let downloader = downloader.clone();
    tokio::spawn(async move { downloader.submit_job(request).await })
}

/// Every slot and permit is back
fn assert_idle(downloader: &MediaDownloader) {
    assert_eq!(downloader.running_tasks(), 0);
    assert_eq!(downloader.active_jobs(), 0);
    assert_eq!(downloader.limits.user_slots.total_active(), 0);
    for usage in downloader.resource_usage() {
        assert_eq!(usage.in_use, 0, "{} permit leaked", usage.class);
        assert_eq!(usage.acquired_total, usage.released_total);
    }
    let (acquired, released) = downloader.limits.user_slots.totals();
    assert_eq!(acquired, released);
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
