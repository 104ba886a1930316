//! ffmpeg/ffprobe backed [`MediaToolkit`]

use super::MediaToolkit;
use super::plan::{EncodeTarget, Segment};
use crate::config::ToolsConfig;
use crate::error::{Error, Result};
use crate::process::{ToolFailure, ToolOutput, resolve_binary, run_tool};
use async_trait::async_trait;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Media operations implemented by running ffmpeg and ffprobe
pub struct FfmpegToolkit {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegToolkit {
    /// Create a toolkit with explicit binary paths
    pub fn new(ffmpeg: PathBuf, ffprobe: PathBuf) -> Self {
        Self { ffmpeg, ffprobe }
    }

    /// Resolve both binaries from tools configuration
    pub fn from_config(tools: &ToolsConfig) -> Result<Self> {
        let ffmpeg = resolve_binary(tools.ffmpeg_path.as_deref(), "ffmpeg", tools.search_path)?;
        let ffprobe = resolve_binary(tools.ffprobe_path.as_deref(), "ffprobe", tools.search_path)?;
        Ok(Self::new(ffmpeg, ffprobe))
    }

    async fn run(
        &self,
        tool: &str,
        binary: &Path,
        args: Vec<OsString>,
        cancel: &CancellationToken,
    ) -> Result<ToolOutput> {
        let mut command = Command::new(binary);
        command.args(args);
        let output = run_tool(tool, command, cancel)
            .await
            .map_err(|failure| match failure {
                ToolFailure::Cancelled => Error::Cancelled,
                other => Error::ExternalTool(format!("{tool}: {other}")),
            })?;
        if !output.success() {
            return Err(Error::ExternalTool(format!(
                "{tool} exited with {}: {}",
                output.status,
                output.diagnostic()
            )));
        }
        Ok(output)
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Duration from `ffprobe -print_format json -show_format` output
fn parse_probe_duration(json: &str) -> Result<Option<f64>> {
    let probe: ProbeOutput = serde_json::from_str(json)?;
    Ok(probe
        .format
        .and_then(|f| f.duration)
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d >= 0.0))
}

fn probe_args(input: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-v", "quiet", "-print_format", "json", "-show_format"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push(input.as_os_str().to_owned());
    args
}

/// Codec pair for an output container, chosen by file extension
fn codecs_for(output: &Path) -> (&'static str, &'static str) {
    let ext = output
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "mp3" => ("", "libmp3lame"),
        "ogg" => ("", "libvorbis"),
        "opus" => ("", "libopus"),
        "webm" => ("libvpx-vp9", "libopus"),
        _ => ("libx264", "aac"),
    }
}

fn reencode_args(input: &Path, output: &Path, target: &EncodeTarget) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-y".into(),
        "-i".into(),
        input.as_os_str().to_owned(),
    ];
    let (video_codec, audio_codec) = codecs_for(output);
    match target.video_bps {
        Some(bps) => {
            let codec = if video_codec.is_empty() {
                "libx264"
            } else {
                video_codec
            };
            args.extend([
                "-c:v".into(),
                codec.into(),
                "-b:v".into(),
                bps.to_string().into(),
                "-maxrate".into(),
                bps.to_string().into(),
                "-bufsize".into(),
                bps.saturating_mul(2).to_string().into(),
            ]);
        }
        None => args.push("-vn".into()),
    }
    args.extend([
        "-c:a".into(),
        audio_codec.into(),
        "-b:a".into(),
        target.audio_bps.to_string().into(),
    ]);
    args.push(output.as_os_str().to_owned());
    args
}

/// Stream-copy one time range; `-ss` before `-i` seeks on the input
fn cut_args(input: &Path, output: &Path, segment: &Segment) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-hide_banner".into(),
        "-nostats".into(),
        "-y".into(),
        "-ss".into(),
        format!("{:.3}", segment.start_secs).into(),
        "-i".into(),
        input.as_os_str().to_owned(),
    ];
    if let Some(duration) = segment.duration_secs {
        args.extend(["-t".into(), format!("{duration:.3}").into()]);
    }
    args.extend([
        "-map".into(),
        "0".into(),
        "-c".into(),
        "copy".into(),
        "-avoid_negative_ts".into(),
        "make_zero".into(),
    ]);
    args.push(output.as_os_str().to_owned());
    args
}

#[async_trait]
impl MediaToolkit for FfmpegToolkit {
    async fn probe(&self, input: &Path, cancel: &CancellationToken) -> Result<Option<f64>> {
        let output = self
            .run("ffprobe", &self.ffprobe, probe_args(input), cancel)
            .await?;
        parse_probe_duration(&output.stdout_lossy())
    }

    async fn reencode(
        &self,
        input: &Path,
        output: &Path,
        target: &EncodeTarget,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run("ffmpeg", &self.ffmpeg, reencode_args(input, output, target), cancel)
            .await
            .map(|_| ())
    }

    async fn cut(
        &self,
        input: &Path,
        output: &Path,
        segment: &Segment,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.run("ffmpeg", &self.ffmpeg, cut_args(input, output, segment), cancel)
            .await
            .map(|_| ())
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}
