//! External tool adapters.
//!
//! The pipeline only sees the [`Prober`] and [`ConversionTools`] traits.
//! The command-backed implementations drive mediainfo, ffmpeg, dovi_tool and
//! mkvmerge with explicit input/output paths and per-call timeouts.

pub mod commands;
pub mod mediainfo;
pub mod toolchain;

use crate::media::LayerKind;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub use mediainfo::{
    parse_frame_progress, parse_layer_summary, parse_mediainfo_output, MediaInfoProber,
};
pub use toolchain::CommandToolchain;

const ENOSPC: i32 = 28;
const STDERR_LIMIT: usize = 2000;

/// Error type for external tool invocations.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Failed to start {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("{tool} timed out after {}s", .timeout.as_secs())]
    Timeout { tool: String, timeout: Duration },

    #[error("{tool} produced unusable output: {reason}")]
    BadOutput { tool: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ToolError {
    /// Transient errors are retried on the next cycle without consuming an
    /// attempt: timeouts, out-of-space and interrupted I/O.
    pub fn is_transient(&self) -> bool {
        match self {
            ToolError::Timeout { .. } => true,
            ToolError::Failed { stderr, .. } => stderr.contains("No space left on device"),
            ToolError::Io(e) => is_transient_io(e),
            ToolError::Spawn { .. } | ToolError::BadOutput { .. } => false,
        }
    }
}

pub(crate) fn is_transient_io(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    ) || e.raw_os_error() == Some(ENOSPC)
}

/// What a successful tool run printed.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Probe result: everything the eligibility decision needs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProbeInfo {
    /// Dolby Vision profile, `None` when the stream carries no DV metadata.
    pub profile: Option<u8>,
    pub layer: LayerKind,
    pub codec: Option<String>,
    pub duration_secs: Option<f64>,
    /// Frame count from the container metadata.
    pub frame_count: Option<u64>,
    /// Frame rate as reported, e.g. `23.976`.
    pub frame_rate: Option<String>,
}

/// Timeouts proportional to the amount of data a step moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolTimeouts {
    pub base: Duration,
    pub per_gb: Duration,
}

impl ToolTimeouts {
    pub fn new(base_secs: u64, per_gb_secs: u64) -> Self {
        Self {
            base: Duration::from_secs(base_secs),
            per_gb: Duration::from_secs(per_gb_secs),
        }
    }

    /// Timeout for a step whose input is `size_bytes` large.
    pub fn for_size(&self, size_bytes: u64) -> Duration {
        let gb = size_bytes as f64 / 1_000_000_000.0;
        self.base + self.per_gb.mul_f64(gb.ceil())
    }
}

/// Metadata prober.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo, ToolError>;

    /// Count the frames of the primary video stream by reading it, for when
    /// container metadata is in doubt. `None` if the count is not reported.
    async fn count_frames(&self, path: &Path, timeout: Duration)
        -> Result<Option<u64>, ToolError>;
}

/// Extractor, converter and remuxer. Exit 0 is success; anything else is a
/// failure with captured diagnostics.
#[async_trait]
pub trait ConversionTools: Send + Sync {
    /// Copy the primary video stream of `source` to an elementary stream.
    async fn extract(&self, source: &Path, output: &Path, timeout: Duration)
        -> Result<(), ToolError>;

    /// Rewrite profile 7 RPUs as profile 8.1 and drop the enhancement layer.
    async fn convert(&self, input: &Path, output: &Path, timeout: Duration)
        -> Result<(), ToolError>;

    /// Build a container from `video` plus every non-video track of `source`.
    /// `frame_rate` sets the video track's timing when known.
    async fn remux(
        &self,
        video: &Path,
        source: &Path,
        output: &Path,
        frame_rate: Option<&str>,
        timeout: Duration,
    ) -> Result<(), ToolError>;
}

/// Run `cmd` to completion, killing it if `timeout` elapses.
///
/// `ok_codes` lists the exit codes treated as success.
pub async fn run_tool(
    cmd: std::process::Command,
    tool: &str,
    timeout: Duration,
    ok_codes: &[i32],
) -> Result<ToolOutput, ToolError> {
    let mut cmd = Command::from(cmd);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(tool, ?timeout, "Running external tool");

    let child = cmd.spawn().map_err(|source| ToolError::Spawn {
        tool: tool.to_string(),
        source,
    })?;

    // Dropping the wait future on timeout drops the child, which kills it.
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(ToolError::Timeout {
                tool: tool.to_string(),
                timeout,
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

    match output.status.code() {
        Some(code) if ok_codes.contains(&code) => Ok(ToolOutput { stdout, stderr }),
        code => Err(ToolError::Failed {
            tool: tool.to_string(),
            status: code
                .map(|c| format!("exit code {}", c))
                .unwrap_or_else(|| "signal".to_string()),
            stderr: truncate_diagnostic(&stderr),
        }),
    }
}

/// Keep the tail of a diagnostic; tools print the cause last.
fn truncate_diagnostic(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_LIMIT {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_LIMIT;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &trimmed[start..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_scales_with_size() {
        let timeouts = ToolTimeouts::new(300, 120);
        assert_eq!(timeouts.for_size(0), Duration::from_secs(300));
        assert_eq!(timeouts.for_size(1), Duration::from_secs(420));
        assert_eq!(timeouts.for_size(50_000_000_000), Duration::from_secs(300 + 50 * 120));
    }

    #[test]
    fn test_transient_classification() {
        let timeout = ToolError::Timeout {
            tool: "ffmpeg".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(timeout.is_transient());

        let enospc = ToolError::Failed {
            tool: "mkvmerge".to_string(),
            status: "exit code 2".to_string(),
            stderr: "Error: No space left on device".to_string(),
        };
        assert!(enospc.is_transient());

        let broken = ToolError::Failed {
            tool: "dovi_tool".to_string(),
            status: "exit code 1".to_string(),
            stderr: "Invalid NAL unit".to_string(),
        };
        assert!(!broken.is_transient());

        assert!(ToolError::Io(io::Error::from_raw_os_error(ENOSPC)).is_transient());
        assert!(!ToolError::Io(io::Error::new(io::ErrorKind::PermissionDenied, "ro")).is_transient());
    }

    #[test]
    fn test_truncate_diagnostic_keeps_tail() {
        let long = format!("{}the actual cause", "x".repeat(5000));
        let truncated = truncate_diagnostic(&long);
        assert!(truncated.ends_with("the actual cause"));
        assert!(truncated.len() <= STDERR_LIMIT + 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_reports_exit_code_and_stderr() {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c").arg("echo broken stream >&2; exit 3");
        let err = run_tool(cmd, "sh", Duration::from_secs(10), &[0])
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { status, stderr, .. } => {
                assert_eq!(status, "exit code 3");
                assert_eq!(stderr, "broken stream");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_accepts_listed_codes() {
        let mut cmd = std::process::Command::new("sh");
        cmd.arg("-c").arg("echo done; exit 1");
        let output = run_tool(cmd, "sh", Duration::from_secs(10), &[0, 1])
            .await
            .unwrap();
        assert_eq!(output.stdout.trim(), "done");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_tool_times_out() {
        let mut cmd = std::process::Command::new("sleep");
        cmd.arg("30");
        let started = std::time::Instant::now();
        let err = run_tool(cmd, "sleep", Duration::from_millis(200), &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
        assert!(err.is_transient());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_run_tool_missing_binary() {
        let cmd = std::process::Command::new("/nonexistent/dovi-migrate-tool");
        let err = run_tool(cmd, "missing", Duration::from_secs(1), &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }
}
