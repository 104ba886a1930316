//! Bitrate and segment arithmetic for the finisher
//!
//! Pure functions only; nothing here touches the filesystem.

use crate::config::FinisherConfig;

/// Bitrates for a single re-encode pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EncodeTarget {
    /// Video bitrate in bits/s, `None` for audio-only output
    pub video_bps: Option<u64>,
    /// Audio bitrate in bits/s
    pub audio_bps: u64,
    /// The computed bitrate was below the configured floor and was clamped,
    /// so the output will likely still exceed the ceiling
    pub floor_hit: bool,
}

/// Bitrate that makes `duration_secs` of media fit in `limit_bytes`
///
/// For video the audio reserve is subtracted from the total first. The result
/// is clamped to `min_video_bps` (or `min_audio_bps` for audio-only media),
/// which is what keeps very long inputs from being encoded at a useless
/// bitrate. `duration_secs` must be positive.
pub fn compute_encode_target(
    limit_bytes: u64,
    duration_secs: f64,
    audio_only: bool,
    config: &FinisherConfig,
) -> EncodeTarget {
    let total_bps = (limit_bytes as f64 * 8.0 / duration_secs).floor();
    let total_bps = if total_bps.is_finite() && total_bps > 0.0 {
        total_bps as u64
    } else {
        0
    };

    if audio_only {
        let floor_hit = total_bps < config.min_audio_bps;
        return EncodeTarget {
            video_bps: None,
            audio_bps: total_bps.max(config.min_audio_bps),
            floor_hit,
        };
    }

    let video_bps = total_bps.saturating_sub(config.audio_reserve_bps);
    let floor_hit = video_bps < config.min_video_bps;
    EncodeTarget {
        video_bps: Some(video_bps.max(config.min_video_bps)),
        audio_bps: config.audio_reserve_bps,
        floor_hit,
    }
}

/// One time range of the original media
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Segment {
    /// Position in delivery order, from 0
    pub index: usize,
    /// Start offset in seconds
    pub start_secs: f64,
    /// Length in seconds; `None` runs to the end of the input
    pub duration_secs: Option<f64>,
}

/// Number of parts needed so each is at most `chunk_bytes`
pub fn part_count(size_bytes: u64, chunk_bytes: u64) -> usize {
    if chunk_bytes == 0 {
        return 1;
    }
    size_bytes.div_ceil(chunk_bytes).max(1) as usize
}

/// Split `duration_secs` into `parts` contiguous, equal segments
///
/// The last segment is open-ended so nothing past an inaccurate duration
/// estimate is lost.
pub fn split_segments(duration_secs: f64, parts: usize) -> Vec<Segment> {
    let parts = parts.max(1);
    let length = duration_secs / parts as f64;
    (0..parts)
        .map(|index| Segment {
            index,
            start_secs: length * index as f64,
            duration_secs: (index + 1 < parts).then_some(length),
        })
        .collect()
}

/// Bytes each split part should aim for
pub fn chunk_target_bytes(limit_bytes: u64, split_headroom: f64) -> u64 {
    ((limit_bytes as f64) * split_headroom).floor().max(1.0) as u64
}
