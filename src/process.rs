//! Cancellable external process execution
//!
//! The single place where yt-dlp, ffmpeg and ffprobe are started. Children are
//! spawned with `kill_on_drop`, and [`run_tool`] races the child against the
//! job's cancel token, so a superseded or timed-out job never leaves a process
//! running behind it.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Longest stderr tail kept as a diagnostic
const DIAGNOSTIC_CHARS: usize = 500;

/// Captured output of a finished tool
#[derive(Debug)]
pub struct ToolOutput {
    /// Exit status
    pub status: ExitStatus,
    /// Raw stdout
    pub stdout: Vec<u8>,
    /// Raw stderr
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    /// Whether the tool exited successfully
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout as (lossy) UTF-8
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Tail of stderr, suitable for logs and error messages
    pub fn diagnostic(&self) -> String {
        diagnostic(&self.stderr)
    }
}

/// Why a tool produced no output
#[derive(Debug)]
pub enum ToolFailure {
    /// The process could not be spawned (missing binary, permissions)
    Launch(std::io::Error),
    /// Waiting on the process or reading its pipes failed
    Wait(std::io::Error),
    /// The cancel token fired; the child was killed
    Cancelled,
}

impl std::fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolFailure::Launch(e) => write!(f, "failed to launch: {e}"),
            ToolFailure::Wait(e) => write!(f, "failed while waiting: {e}"),
            ToolFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Run `command` to completion unless `cancel` fires first
///
/// Stdout and stderr are captured; stdin is closed. When cancelled the child
/// is dropped, which kills it.
pub async fn run_tool(
    tool: &str,
    mut command: Command,
    cancel: &CancellationToken,
) -> std::result::Result<ToolOutput, ToolFailure> {
    command
        .kill_on_drop(true)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let child = command.spawn().map_err(ToolFailure::Launch)?;
    let pid = child.id();
    tracing::debug!(tool, pid, "spawned external tool");

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            tracing::debug!(tool, pid, "cancelled, killing external tool");
            Err(ToolFailure::Cancelled)
        }
        output = child.wait_with_output() => {
            let output = output.map_err(ToolFailure::Wait)?;
            tracing::debug!(tool, pid, status = %output.status, "external tool exited");
            Ok(ToolOutput {
                status: output.status,
                stdout: output.stdout,
                stderr: output.stderr,
            })
        }
    }
}

/// Locate a tool binary
///
/// An explicit path wins and must exist. Otherwise, when `search_path` is set,
/// the binary is looked up on PATH.
pub fn resolve_binary(explicit: Option<&Path>, name: &str, search_path: bool) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::NotSupported(format!(
            "{name} not found at configured path {}",
            path.display()
        )));
    }

    if search_path && let Ok(path) = which::which(name) {
        tracing::debug!(tool = name, path = %path.display(), "found tool on PATH");
        return Ok(path);
    }

    Err(Error::NotSupported(format!(
        "{name} binary not found; set its path in tools config or install it on PATH"
    )))
}

/// Last [`DIAGNOSTIC_CHARS`] characters of a tool's stderr, trimmed
pub fn diagnostic(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    let count = text.chars().count();
    if count <= DIAGNOSTIC_CHARS {
        return text.to_string();
    }
    text.chars().skip(count - DIAGNOSTIC_CHARS).collect()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn diagnostic_keeps_the_tail() {
        let long = format!("{}ERROR: Video unavailable", "x".repeat(1000));
        let d = diagnostic(long.as_bytes());
        assert_eq!(d.chars().count(), DIAGNOSTIC_CHARS);
        assert!(d.ends_with("ERROR: Video unavailable"));

        assert_eq!(diagnostic(b"  short\n"), "short");
    }

    #[test]
    fn diagnostic_is_char_boundary_safe() {
        let text = "é".repeat(800);
        let d = diagnostic(text.as_bytes());
        assert_eq!(d.chars().count(), DIAGNOSTIC_CHARS);
    }

    #[test]
    fn resolve_binary_prefers_explicit_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let resolved = resolve_binary(Some(file.path()), "yt-dlp", true).unwrap();
        assert_eq!(resolved, file.path());

        let err = resolve_binary(Some(Path::new("/no/such/yt-dlp")), "yt-dlp", true).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[test]
    fn resolve_binary_without_search_needs_explicit_path() {
        let err = resolve_binary(None, "sh", false).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[cfg(unix)]
    #[test]
    fn resolve_binary_searches_path() {
        assert!(resolve_binary(None, "sh", true).is_ok());
        assert!(resolve_binary(None, "definitely-not-a-real-tool-xyz", true).is_err());
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_failure() {
        let token = CancellationToken::new();
        let result = run_tool(
            "nope",
            Command::new("/definitely/not/a/real/binary"),
            &token,
        )
        .await;
        assert!(matches!(result, Err(ToolFailure::Launch(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_status_and_output() {
        let token = CancellationToken::new();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");

        let output = run_tool("sh", cmd, &token).await.unwrap();
        assert!(!output.success());
        assert_eq!(output.status.code(), Some(3));
        assert_eq!(output.stdout_lossy().trim(), "out");
        assert_eq!(output.diagnostic(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_child_promptly() {
        let token = CancellationToken::new();
        let mut cmd = Command::new("sleep");
        cmd.arg("30");

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let result = run_tool("sleep", cmd, &token).await;
        assert!(matches!(result, Err(ToolFailure::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
