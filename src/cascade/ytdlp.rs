//! yt-dlp backed extractor

use super::{ExtractionRequest, Extractor, Strategy};
use crate::config::ToolsConfig;
use crate::error::{ExtractionError, Result};
use crate::process::{ToolFailure, resolve_binary, run_tool};
use crate::types::MediaArtifact;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const TOOL: &str = "yt-dlp";

/// Leftovers of an interrupted or in-progress download
const PARTIAL_SUFFIXES: [&str; 4] = ["part", "ytdl", "temp", "tmp"];

/// Extractor that shells out to the `yt-dlp` binary
///
/// # Examples
///
/// ```no_run
/// use media_dl::cascade::YtDlpExtractor;
/// use std::path::PathBuf;
///
/// // Explicit path
/// let extractor = YtDlpExtractor::new(PathBuf::from("/usr/local/bin/yt-dlp"));
///
/// // Or auto-discover from PATH
/// let extractor = YtDlpExtractor::from_path().expect("yt-dlp not found in PATH");
/// ```
pub struct YtDlpExtractor {
    binary_path: PathBuf,
}

impl YtDlpExtractor {
    /// Create an extractor with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find yt-dlp in PATH
    pub fn from_path() -> Option<Self> {
        which::which(TOOL).ok().map(Self::new)
    }

    /// Resolve the binary from tools configuration
    pub fn from_config(tools: &ToolsConfig) -> Result<Self> {
        resolve_binary(tools.ytdlp_path.as_deref(), TOOL, tools.search_path).map(Self::new)
    }

    /// Path of the binary this extractor runs
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

/// Command line for one attempt
///
/// The target always comes last, after `--`, so a query can never be read as
/// an option.
pub(crate) fn build_args(request: &ExtractionRequest, strategy: &Strategy) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "--no-simulate".into(),
        "--no-progress".into(),
        "--no-playlist".into(),
        "--print".into(),
        "after_move:%(duration)s|%(filepath)s".into(),
        "-o".into(),
        request.work_dir.join("%(id)s.%(ext)s").into_os_string(),
    ];

    let format = request.format.as_str();
    if request.format.is_audio() {
        args.extend(["-x".into(), "--audio-format".into(), format.into()]);
    } else {
        args.extend([
            "-f".into(),
            "bv*+ba/b".into(),
            "--merge-output-format".into(),
            format.into(),
        ]);
    }

    if let Some(credential) = &strategy.credential {
        args.push("--cookies".into());
        args.push(credential.cookies_file.clone().into_os_string());
    }
    if let Some(egress) = &strategy.egress {
        args.push("--proxy".into());
        args.push(egress.proxy_url.clone().into());
    }
    for (name, value) in &strategy.headers {
        args.push("--add-header".into());
        args.push(format!("{name}:{value}").into());
    }

    args.push("--".into());
    if request.request.is_url() {
        args.push(request.request.as_str().into());
    } else {
        args.push(format!("ytsearch1:{}", request.request.as_str()).into());
    }
    args
}

/// Parse the `after_move` print line: `<duration>|<path>`
///
/// yt-dlp prints `NA` for an unknown duration.
fn parse_printed(stdout: &str) -> Option<(PathBuf, Option<f64>)> {
    let line = stdout.lines().rev().find(|l| l.contains('|'))?;
    let (duration, path) = line.trim().split_once('|')?;
    if path.is_empty() {
        return None;
    }
    let duration = duration
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d > 0.0);
    Some((PathBuf::from(path), duration))
}

/// Largest finished file in `dir`, ignoring partial downloads
async fn largest_file(dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut best: Option<(u64, PathBuf)> = None;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let partial = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| PARTIAL_SUFFIXES.contains(&e));
        if partial {
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        if best.as_ref().is_none_or(|(size, _)| metadata.len() > *size) {
            best = Some((metadata.len(), path));
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn map_failure(failure: ToolFailure) -> ExtractionError {
    match failure {
        ToolFailure::Launch(e) => ExtractionError::Launch {
            tool: TOOL.to_string(),
            reason: e.to_string(),
        },
        ToolFailure::Wait(e) => ExtractionError::ToolFailed {
            tool: TOOL.to_string(),
            status: "unknown".to_string(),
            diagnostic: e.to_string(),
        },
        ToolFailure::Cancelled => ExtractionError::Cancelled,
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn extract(
        &self,
        request: &ExtractionRequest,
        strategy: &Strategy,
        cancel: &CancellationToken,
    ) -> std::result::Result<MediaArtifact, ExtractionError> {
        let mut command = Command::new(&self.binary_path);
        command.args(build_args(request, strategy));

        let output = run_tool(TOOL, command, cancel).await.map_err(map_failure)?;
        if !output.success() {
            return Err(ExtractionError::ToolFailed {
                tool: TOOL.to_string(),
                status: output.status.to_string(),
                diagnostic: output.diagnostic(),
            });
        }

        let printed = parse_printed(&output.stdout_lossy());
        let (path, duration) = match printed {
            Some((path, duration)) if tokio::fs::try_exists(&path).await.unwrap_or(false) => {
                (path, duration)
            }
            _ => {
                let found = largest_file(&request.work_dir)
                    .await
                    .map_err(|e| ExtractionError::NoOutput(e.to_string()))?;
                match found {
                    Some(path) => (path, None),
                    None => {
                        return Err(ExtractionError::NoOutput(format!(
                            "nothing written to {}",
                            request.work_dir.display()
                        )));
                    }
                }
            }
        };

        MediaArtifact::from_path(path, duration)
            .await
            .map_err(|e| ExtractionError::NoOutput(e.to_string()))
    }

    fn name(&self) -> &str {
        TOOL
    }
}
