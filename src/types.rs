//! Core types for media-dl

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::PathBuf;

/// Number of hex characters kept from the SHA-256 digest for job ids and cache keys
pub(crate) const DIGEST_HEX_LEN: usize = 32;

/// Identity of the requesting user (chat user id on the front end)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl From<i64> for UserId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic job identifier derived from (user, normalized request)
///
/// Two submissions of the same request by the same user always map to the same
/// id, which is what makes deduplication a simple map lookup.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Derive the id for a user's request
    pub fn derive(user_id: UserId, request: &NormalizedRequest) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(user_id.0.to_be_bytes());
        hasher.update([0u8]);
        hasher.update(request.as_str().as_bytes());
        Self(truncated_hex(&hasher.finalize()))
    }

    /// Wrap an existing hex id (e.g. one read back from the store)
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    /// Full hex form
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, used in directory names and log lines
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub(crate) fn truncated_hex(digest: &[u8]) -> String {
    let mut hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex.truncate(DIGEST_HEX_LEN);
    hex
}

/// A request after case/whitespace normalization
///
/// URLs keep their path and query untouched (video ids are case-sensitive) but
/// get a lowercased scheme and host and lose their fragment. Anything that is
/// not an http(s) URL is treated as a search query: trimmed, inner whitespace
/// collapsed, lowercased.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NormalizedRequest(String);

impl NormalizedRequest {
    /// Normalize a raw user request
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidRequest("request is empty".into()));
        }

        if let Ok(mut url) = url::Url::parse(trimmed) {
            match url.scheme() {
                "http" | "https" => {
                    if url.host_str().is_none() {
                        return Err(Error::InvalidRequest(format!("URL has no host: {trimmed}")));
                    }
                    url.set_fragment(None);
                    return Ok(Self(url.to_string()));
                }
                // "ytsearch:foo" and similar parse as URLs; treat them as queries
                _ if !trimmed.contains("://") => {}
                other => {
                    return Err(Error::InvalidRequest(format!(
                        "unsupported URL scheme: {other}"
                    )));
                }
            }
        }

        let query = trimmed
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Ok(Self(query))
    }

    /// Whether this request is a URL (as opposed to a search query)
    pub fn is_url(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    /// Normalized text
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NormalizedRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Category of job with its own system-wide concurrency ceiling
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceClass {
    /// Full video downloads
    BulkVideo,
    /// Single audio track
    SingleAudio,
    /// Playlist downloads
    ///
    /// Only selects the concurrency ceiling. A job still yields one artifact:
    /// the yt-dlp extractor passes `--no-playlist`, so a playlist URL
    /// delivers its first item. Front ends wanting every entry submit one
    /// job per item.
    Playlist,
}

impl ResourceClass {
    /// Every resource class, in pool index order
    pub const ALL: [ResourceClass; 3] = [
        ResourceClass::BulkVideo,
        ResourceClass::SingleAudio,
        ResourceClass::Playlist,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            ResourceClass::BulkVideo => 0,
            ResourceClass::SingleAudio => 1,
            ResourceClass::Playlist => 2,
        }
    }

    /// Output format used when the request does not specify one
    pub fn default_format(self) -> OutputFormat {
        match self {
            ResourceClass::BulkVideo => OutputFormat::new("mp4"),
            ResourceClass::SingleAudio | ResourceClass::Playlist => OutputFormat::new("mp3"),
        }
    }

    /// Stable lowercase name
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceClass::BulkVideo => "bulk_video",
            ResourceClass::SingleAudio => "single_audio",
            ResourceClass::Playlist => "playlist",
        }
    }
}

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested output container/codec family (e.g. "mp4", "mp3")
///
/// Part of the cache key: a cached artifact is only ever returned for the exact
/// format it was produced in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutputFormat(String);

impl OutputFormat {
    /// Create a format, lowercased
    pub fn new(format: impl AsRef<str>) -> Self {
        Self(format.as_ref().trim().to_lowercase())
    }

    /// Format name, also used as the output file extension
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the format is audio-only
    pub fn is_audio(&self) -> bool {
        matches!(
            self.0.as_str(),
            "mp3" | "m4a" | "aac" | "opus" | "ogg" | "flac" | "wav"
        )
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Job lifecycle state
///
/// `Admitted → Running → {Completed, Failed, TimedOut, Cancelled}`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Passed deduplication, waiting for slots
    Admitted,
    /// Holding both slots and executing
    Running,
    /// Delivered successfully
    Completed,
    /// Failed (extraction exhausted, encoding failed, delivery failed, ...)
    Failed,
    /// Killed by the watchdog
    TimedOut,
    /// Superseded by a newer request or cancelled at shutdown
    Cancelled,
}

impl JobState {
    /// Whether the state is terminal
    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Whether the job is still in flight
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Admitted | JobState::Running)
    }

    /// Terminal state corresponding to a job's final result
    pub fn from_result<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => JobState::Completed,
            Err(Error::TimedOut { .. }) => JobState::TimedOut,
            Err(Error::Cancelled) | Err(Error::ShuttingDown) => JobState::Cancelled,
            Err(_) => JobState::Failed,
        }
    }
}

/// A request as handed in by the delivery front end
#[derive(Clone, Debug)]
pub struct JobRequest {
    /// Requesting user
    pub user_id: UserId,
    /// Raw URL or search query as typed by the user
    pub raw_request: String,
    /// Resource class governing concurrency
    pub resource_class: ResourceClass,
    /// Output format (defaults to the class's format)
    pub output_format: OutputFormat,
}

impl JobRequest {
    /// Create a request using the resource class's default output format
    pub fn new(
        user_id: impl Into<UserId>,
        raw_request: impl Into<String>,
        resource_class: ResourceClass,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            raw_request: raw_request.into(),
            resource_class,
            output_format: resource_class.default_format(),
        }
    }

    /// Override the output format
    pub fn with_format(mut self, format: impl AsRef<str>) -> Self {
        self.output_format = OutputFormat::new(format);
        self
    }
}

/// File produced by extraction (and possibly encoding)
#[derive(Clone, Debug, PartialEq)]
pub struct MediaArtifact {
    /// Location inside the job's working directory
    pub path: PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
    /// Playback duration, when known
    pub duration_secs: Option<f64>,
}

impl MediaArtifact {
    /// Build an artifact by reading the size from disk
    pub async fn from_path(path: PathBuf, duration_secs: Option<f64>) -> Result<Self> {
        let size_bytes = tokio::fs::metadata(&path).await?.len();
        Ok(Self {
            path,
            size_bytes,
            duration_secs,
        })
    }
}

/// How a delivery plan was produced
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// The artifact already fit under the ceiling
    PassThrough,
    /// Re-encoded once at a computed bitrate
    Reencoded,
    /// Split into time-contiguous stream-copied parts
    Split,
}

/// One file of a delivery plan
#[derive(Clone, Debug, PartialEq)]
pub struct PlanPart {
    /// File to deliver
    pub path: PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
    /// Offset of this part in the original timeline
    pub start_secs: f64,
    /// Playback duration of this part, when known
    pub duration_secs: Option<f64>,
}

/// Ordered list of files to deliver for one completed job
#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryPlan {
    /// Parts in delivery order
    pub parts: Vec<PlanPart>,
    /// How the plan was produced
    pub kind: PlanKind,
    /// Set when at least one part still exceeds the ceiling (best effort)
    pub oversized: bool,
}

impl DeliveryPlan {
    /// Single-part plan delivering the artifact unchanged
    pub fn pass_through(artifact: &MediaArtifact) -> Self {
        Self {
            parts: vec![PlanPart {
                path: artifact.path.clone(),
                size_bytes: artifact.size_bytes,
                start_secs: 0.0,
                duration_secs: artifact.duration_secs,
            }],
            kind: PlanKind::PassThrough,
            oversized: false,
        }
    }

    /// Number of parts
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Whether the plan has no parts
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Sum of the known part durations
    pub fn total_duration_secs(&self) -> f64 {
        self.parts.iter().filter_map(|p| p.duration_secs).sum()
    }

    /// Largest part size
    pub fn largest_part_bytes(&self) -> u64 {
        self.parts.iter().map(|p| p.size_bytes).max().unwrap_or(0)
    }
}

/// Opaque handle(s) meaningful to the delivery collaborator, one per part
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReference {
    /// Handles in delivery order (e.g. remote file ids)
    pub handles: Vec<String>,
}

impl ArtifactReference {
    /// Create a reference from handles
    pub fn new(handles: Vec<String>) -> Self {
        Self { handles }
    }
}

/// Successful result of [`crate::MediaDownloader::submit_job`]
#[derive(Clone, Debug, PartialEq)]
pub struct JobOutcome {
    /// Job that produced the result
    pub job_id: JobId,
    /// What the delivery collaborator holds
    pub reference: ArtifactReference,
    /// Whether the result was served from the result cache
    pub from_cache: bool,
    /// Number of parts delivered
    pub parts: usize,
    /// True when the finisher could only produce a best-effort plan with
    /// oversized parts; the front end should report a partial failure
    pub partial: bool,
}

/// Event emitted during the job lifecycle
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job passed deduplication
    JobAdmitted {
        /// Job id
        id: JobId,
        /// Requesting user
        user_id: UserId,
        /// Resource class
        resource_class: ResourceClass,
    },

    /// Job acquired its slots and started executing
    JobStarted {
        /// Job id
        id: JobId,
    },

    /// Result served from the cache; extraction and finishing skipped
    CacheHit {
        /// Job id
        id: JobId,
    },

    /// One cascade strategy failed; the next one will be tried
    AttemptFailed {
        /// Job id
        id: JobId,
        /// Strategy name
        strategy: String,
        /// Diagnostic
        error: String,
    },

    /// Artifact exceeded the ceiling and is being re-encoded
    Reencoding {
        /// Job id
        id: JobId,
        /// Target video bitrate (bits/s), absent for audio-only media
        #[serde(skip_serializing_if = "Option::is_none")]
        video_bps: Option<u64>,
        /// Target audio bitrate (bits/s)
        audio_bps: u64,
    },

    /// Artifact is being split into parts
    Splitting {
        /// Job id
        id: JobId,
        /// Number of parts
        parts: usize,
    },

    /// Job delivered
    JobCompleted {
        /// Job id
        id: JobId,
        /// Number of parts
        parts: usize,
        /// Served from cache
        from_cache: bool,
        /// Best-effort plan with oversized parts
        partial: bool,
    },

    /// Job failed
    JobFailed {
        /// Job id
        id: JobId,
        /// Error message
        error: String,
    },

    /// Job killed by the watchdog
    JobTimedOut {
        /// Job id
        id: JobId,
    },

    /// Job cancelled
    JobCancelled {
        /// Job id
        id: JobId,
    },

    /// Service is shutting down
    Shutdown,
}
