//! Configuration types for media-dl

use crate::cascade::Strategy;
use crate::error::{Error, Result};
use crate::types::ResourceClass;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Main configuration for [`MediaDownloader`](crate::MediaDownloader)
///
/// Every field has a default, so `Config::default()` is a working
/// configuration as long as yt-dlp and ffmpeg can be found on PATH.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Concurrency ceilings (per resource class and per user)
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Job lifecycle timing (watchdog, dedup window, retention, supersede)
    #[serde(default)]
    pub jobs: JobsConfig,

    /// Result cache settings
    #[serde(default)]
    pub cache: CacheConfig,

    /// Size-ceiling enforcement for delivered media
    #[serde(default)]
    pub finisher: FinisherConfig,

    /// Extraction strategies and the delay between attempts
    #[serde(default)]
    pub cascade: CascadeConfig,

    /// External tool paths (yt-dlp, ffmpeg, ffprobe)
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Database and output locations
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Check cross-field invariants that serde defaults cannot express
    ///
    /// Rejects zero ceilings, an invalid split headroom, and an outer job
    /// timeout that would fire before the cascade could try every strategy.
    pub fn validate(&self) -> Result<()> {
        for class in ResourceClass::ALL {
            if self.limits.ceiling(class) == 0 {
                return Err(Error::config(
                    format!("ceiling for {class} must be at least 1"),
                    &format!("limits.{class}"),
                ));
            }
        }
        if self.limits.max_jobs_per_user == 0 {
            return Err(Error::config(
                "max_jobs_per_user must be at least 1",
                "limits.max_jobs_per_user",
            ));
        }

        if self.finisher.limit_bytes == 0 {
            return Err(Error::config(
                "limit_bytes must be greater than zero",
                "finisher.limit_bytes",
            ));
        }
        let headroom = self.finisher.split_headroom;
        if !(headroom > 0.0 && headroom <= 1.0) {
            return Err(Error::config(
                format!("split_headroom must be in (0, 1], got {headroom}"),
                "finisher.split_headroom",
            ));
        }
        if self.finisher.max_split_passes == 0 {
            return Err(Error::config(
                "max_split_passes must be at least 1",
                "finisher.max_split_passes",
            ));
        }

        if self.cascade.strategies.is_empty() {
            return Err(Error::config(
                "at least one extraction strategy is required",
                "cascade.strategies",
            ));
        }
        let worst_case = self.cascade.worst_case_duration();
        if self.jobs.job_timeout <= worst_case {
            return Err(Error::config(
                format!(
                    "job_timeout ({}s) must exceed the cascade worst case ({}s)",
                    self.jobs.job_timeout.as_secs(),
                    worst_case.as_secs()
                ),
                "jobs.job_timeout",
            ));
        }

        Ok(())
    }
}

/// Concurrency ceilings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Concurrent bulk video jobs system-wide (default: 16)
    #[serde(default = "default_bulk_video")]
    pub bulk_video: usize,

    /// Concurrent single-audio jobs system-wide (default: 3)
    #[serde(default = "default_single_audio")]
    pub single_audio: usize,

    /// Concurrent playlist jobs system-wide (default: 4)
    #[serde(default = "default_playlist")]
    pub playlist: usize,

    /// Concurrent in-flight jobs per user, across all classes (default: 1)
    #[serde(default = "default_max_jobs_per_user")]
    pub max_jobs_per_user: usize,
}

impl LimitsConfig {
    /// Ceiling for a resource class
    pub fn ceiling(&self, class: ResourceClass) -> usize {
        match class {
            ResourceClass::BulkVideo => self.bulk_video,
            ResourceClass::SingleAudio => self.single_audio,
            ResourceClass::Playlist => self.playlist,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            bulk_video: default_bulk_video(),
            single_audio: default_single_audio(),
            playlist: default_playlist(),
            max_jobs_per_user: default_max_jobs_per_user(),
        }
    }
}

/// Job lifecycle timing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Watchdog timeout for a whole job (default: 30 minutes)
    #[serde(default = "default_job_timeout", with = "duration_serde")]
    pub job_timeout: Duration,

    /// Window in which an identical (user, request) submission is rejected (default: 10 seconds)
    #[serde(default = "default_dedup_window", with = "duration_serde")]
    pub dedup_window: Duration,

    /// How long terminal job records are kept for status queries (default: 5 minutes)
    #[serde(default = "default_retention", with = "duration_serde")]
    pub retention: Duration,

    /// Cancel a user's in-flight job when they submit a different request (default: true)
    #[serde(default = "default_true")]
    pub supersede_previous: bool,

    /// How long admission waits for a superseded job to release its slots (default: 10 seconds)
    #[serde(default = "default_supersede_grace", with = "duration_serde")]
    pub supersede_grace: Duration,

    /// Interval of the background janitor (default: 60 seconds)
    #[serde(default = "default_janitor_interval", with = "duration_serde")]
    pub janitor_interval: Duration,

    /// Parent directory of the per-job working directories (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            job_timeout: default_job_timeout(),
            dedup_window: default_dedup_window(),
            retention: default_retention(),
            supersede_previous: true,
            supersede_grace: default_supersede_grace(),
            janitor_interval: default_janitor_interval(),
            temp_dir: default_temp_dir(),
        }
    }
}

/// Result cache settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Enable the result cache (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Time-to-live of cached references (default: 7 days)
    #[serde(default = "default_cache_ttl", with = "duration_serde")]
    pub ttl: Duration,

    /// Upper bound on a persistent-store lookup before it counts as a miss (default: 2 seconds)
    #[serde(default = "default_lookup_timeout", with = "duration_serde")]
    pub lookup_timeout: Duration,

    /// Maximum entries kept in the in-memory layer (default: 1024)
    #[serde(default = "default_memory_entries")]
    pub memory_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: default_cache_ttl(),
            lookup_timeout: default_lookup_timeout(),
            memory_entries: default_memory_entries(),
        }
    }
}

/// Size-ceiling enforcement settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinisherConfig {
    /// Hard per-file delivery ceiling in bytes (default: 49 MiB)
    #[serde(default = "default_limit_bytes")]
    pub limit_bytes: u64,

    /// Bitrate reserved for the audio track when computing the video target (default: 128 kbit/s)
    #[serde(default = "default_audio_reserve_bps")]
    pub audio_reserve_bps: u64,

    /// Floor for the computed video bitrate (default: 200 kbit/s)
    #[serde(default = "default_min_video_bps")]
    pub min_video_bps: u64,

    /// Floor for the computed audio bitrate of audio-only media (default: 32 kbit/s)
    #[serde(default = "default_min_audio_bps")]
    pub min_audio_bps: u64,

    /// Duration assumed when the artifact's duration is unknown (default: 600 seconds)
    #[serde(default = "default_fallback_duration_secs")]
    pub fallback_duration_secs: f64,

    /// Fraction of `limit_bytes` targeted per split part (default: 0.9)
    #[serde(default = "default_split_headroom")]
    pub split_headroom: f64,

    /// How many times splitting is retried with more parts when a part is still too large (default: 2)
    #[serde(default = "default_max_split_passes")]
    pub max_split_passes: u32,
}

impl Default for FinisherConfig {
    fn default() -> Self {
        Self {
            limit_bytes: default_limit_bytes(),
            audio_reserve_bps: default_audio_reserve_bps(),
            min_video_bps: default_min_video_bps(),
            min_audio_bps: default_min_audio_bps(),
            fallback_duration_secs: default_fallback_duration_secs(),
            split_headroom: default_split_headroom(),
            max_split_passes: default_max_split_passes(),
        }
    }
}

/// Extraction cascade settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Strategies in tier order (default: a single direct strategy)
    #[serde(default = "default_strategies")]
    pub strategies: Vec<Strategy>,

    /// Time budget of a single extraction attempt (default: 5 minutes)
    #[serde(default = "default_attempt_timeout", with = "duration_serde")]
    pub attempt_timeout: Duration,

    /// Delay between attempts
    #[serde(default)]
    pub retry: RetryConfig,
}

impl CascadeConfig {
    /// Longest time the cascade can take before giving up
    ///
    /// Sum of every attempt timeout plus the largest possible delay between
    /// consecutive attempts.
    pub fn worst_case_duration(&self) -> Duration {
        let attempts = self.strategies.len() as u32;
        let gaps = attempts.saturating_sub(1) as usize;
        self.attempt_timeout * attempts + crate::retry::worst_case_delay(&self.retry, gaps)
    }
}

impl Default for CascadeConfig {
    fn default() -> Self {
        Self {
            strategies: default_strategies(),
            attempt_timeout: default_attempt_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

/// Backoff between cascade attempts
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the second attempt (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between attempts (default: 30 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// External tool paths
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to yt-dlp executable (auto-detected if None)
    #[serde(default)]
    pub ytdlp_path: Option<PathBuf>,

    /// Path to ffmpeg executable (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Path to ffprobe executable (auto-detected if None)
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: None,
            ffmpeg_path: None,
            ffprobe_path: None,
            search_path: true,
        }
    }
}

/// Data storage locations
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database path (None = in-memory store only, nothing survives a restart)
    #[serde(default)]
    pub database_path: Option<PathBuf>,

    /// Where the built-in directory sink places delivered files (default: "./media")
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            output_dir: default_output_dir(),
        }
    }
}

fn default_bulk_video() -> usize {
    16
}

fn default_single_audio() -> usize {
    3
}

fn default_playlist() -> usize {
    4
}

fn default_max_jobs_per_user() -> usize {
    1
}

fn default_true() -> bool {
    true
}

fn default_job_timeout() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_dedup_window() -> Duration {
    Duration::from_secs(10)
}

fn default_retention() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_supersede_grace() -> Duration {
    Duration::from_secs(10)
}

fn default_janitor_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./temp")
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(7 * 24 * 3600)
}

fn default_lookup_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_memory_entries() -> usize {
    1024
}

fn default_limit_bytes() -> u64 {
    49 * 1024 * 1024
}

fn default_audio_reserve_bps() -> u64 {
    128_000
}

fn default_min_video_bps() -> u64 {
    200_000
}

fn default_min_audio_bps() -> u64 {
    32_000
}

fn default_fallback_duration_secs() -> f64 {
    600.0
}

fn default_split_headroom() -> f64 {
    0.9
}

fn default_max_split_passes() -> u32 {
    2
}

fn default_strategies() -> Vec<Strategy> {
    vec![Strategy::direct()]
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("./media")
}

// Duration serialization helper (as seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
