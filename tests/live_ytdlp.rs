//! End-to-end tests with the real yt-dlp and ffmpeg binaries
//!
//! These tests download from the public internet. They are compiled only with
//! the `live-tests` feature and are additionally marked #[ignore].
//!
//! # Running the tests
//!
//! ```bash
//! MEDIA_DL_LIVE_URL="https://www.youtube.com/watch?v=jNQXAC9IVRw" \
//!     cargo test --features live-tests --test live_ytdlp -- --ignored --nocapture
//! ```
//!
//! # Environment variables
//!
//! - `MEDIA_DL_LIVE_URL` - Short public video to fetch (default: "Me at the zoo")

#![cfg(feature = "live-tests")]

use media_dl::{Config, JobRequest, MediaDownloader, ResourceClass};
use std::time::Duration;

const DEFAULT_URL: &str = "https://www.youtube.com/watch?v=jNQXAC9IVRw";

fn live_url() -> String {
    std::env::var("MEDIA_DL_LIVE_URL").unwrap_or_else(|_| DEFAULT_URL.to_string())
}

async fn live_downloader(dir: &std::path::Path, configure: impl FnOnce(&mut Config)) -> MediaDownloader {
    let mut config = Config::default();
    config.jobs.temp_dir = dir.join("temp");
    config.persistence.output_dir = dir.join("media");
    config.persistence.database_path = Some(dir.join("media-dl.db"));
    configure(&mut config);
    MediaDownloader::new(config)
        .await
        .expect("yt-dlp, ffmpeg and ffprobe must be on PATH")
}

/// A short video is fetched and delivered as a single part, then served from cache
#[tokio::test]
#[ignore]
async fn test_live_video_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = live_downloader(dir.path(), |_| {}).await;

    let outcome = downloader
        .submit_job(JobRequest::new(1, live_url(), ResourceClass::BulkVideo))
        .await
        .unwrap();
    assert_eq!(outcome.parts, 1);
    let delivered = std::path::Path::new(&outcome.reference.handles[0]);
    assert!(delivered.exists());
    assert!(std::fs::metadata(delivered).unwrap().len() > 0);

    let again = downloader
        .submit_job(JobRequest::new(2, live_url(), ResourceClass::BulkVideo))
        .await
        .unwrap();
    assert!(again.from_cache);

    downloader.shutdown().await.unwrap();
}

/// A tiny ceiling forces the re-encode/split path through real ffmpeg
#[tokio::test]
#[ignore]
async fn test_live_split_under_small_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = live_downloader(dir.path(), |config| {
        config.finisher.limit_bytes = 150 * 1024;
        config.finisher.min_video_bps = 20_000;
        config.finisher.audio_reserve_bps = 16_000;
        config.jobs.job_timeout = Duration::from_secs(40 * 60);
    })
    .await;

    let outcome = downloader
        .submit_job(JobRequest::new(1, live_url(), ResourceClass::BulkVideo))
        .await
        .unwrap();

    for handle in &outcome.reference.handles {
        let len = std::fs::metadata(handle).unwrap().len();
        if !outcome.partial {
            assert!(len <= 150 * 1024, "{handle} is {len} bytes");
        }
    }

    downloader.shutdown().await.unwrap();
}

/// Audio requests produce the requested container
#[tokio::test]
#[ignore]
async fn test_live_audio_extraction() {
    let dir = tempfile::tempdir().unwrap();
    let downloader = live_downloader(dir.path(), |_| {}).await;

    let outcome = downloader
        .submit_job(JobRequest::new(1, live_url(), ResourceClass::SingleAudio))
        .await
        .unwrap();
    assert!(outcome.reference.handles[0].ends_with(".mp3"));

    downloader.shutdown().await.unwrap();
}
