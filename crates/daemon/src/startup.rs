//! Preflight checks and leftover cleanup run before the daemon starts.
//!
//! - Every configured tool must answer its version flag
//! - Work directories from a previous run are removed from `temp_dir`
//! - Partial remux outputs next to recovered files are removed

use crate::config::ToolsConfig;
use crate::pipeline::{partial_path, WORK_DIR_PREFIX};
use crate::tools::commands::version_command;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("{tool} not available: {reason}")]
    ToolUnavailable { tool: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// ffmpeg takes a single dash; the others take `--version`.
fn version_flag(tool: &Path) -> &'static str {
    let is_ffmpeg = tool
        .file_stem()
        .map(|s| s.to_string_lossy().eq_ignore_ascii_case("ffmpeg"))
        .unwrap_or(false);
    if is_ffmpeg {
        "-version"
    } else {
        "--version"
    }
}

/// Check that `tool` runs and exits successfully with its version flag.
pub fn check_tool_available(tool: &Path) -> Result<(), StartupError> {
    let name = tool.display().to_string();
    let flag = version_flag(tool);
    let output = version_command(tool, flag).output().map_err(|e| {
        StartupError::ToolUnavailable {
            tool: name.clone(),
            reason: format!("{} {} failed; is it installed and in PATH? Error: {}", name, flag, e),
        }
    })?;

    if !output.status.success() {
        return Err(StartupError::ToolUnavailable {
            tool: name.clone(),
            reason: format!("{} {} exited with {}", name, flag, output.status),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    debug!(
        tool = %name,
        version = stdout.lines().next().unwrap_or(""),
        "Tool available"
    );
    Ok(())
}

/// Run all tool checks. mediainfo is checked first since probing gates
/// everything else.
pub fn run_startup_checks(tools: &ToolsConfig) -> Result<(), StartupError> {
    for tool in [&tools.mediainfo, &tools.ffmpeg, &tools.dovi_tool, &tools.mkvmerge] {
        check_tool_available(tool)?;
    }
    info!("All external tools available");
    Ok(())
}

/// Remove `convert_*` entries left in `temp_dir` by an interrupted run.
///
/// A missing `temp_dir` is created. Returns the number of entries removed.
pub fn cleanup_orphaned_work_dirs(temp_dir: &Path) -> Result<usize, StartupError> {
    fs::create_dir_all(temp_dir)?;

    let mut removed = 0;
    for entry in fs::read_dir(temp_dir)? {
        let entry = entry?;
        if !entry.file_name().to_string_lossy().starts_with(WORK_DIR_PREFIX) {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Removed orphaned work dir");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), "Failed to remove orphaned work dir: {}", e),
        }
    }

    if removed > 0 {
        info!(removed, temp_dir = %temp_dir.display(), "Cleaned up orphaned work dirs");
    }
    Ok(removed)
}

/// Delete partial remux outputs belonging to `originals`. The originals
/// themselves are never touched.
pub fn remove_stale_partials(originals: &[PathBuf]) -> usize {
    let mut removed = 0;
    for original in originals {
        let partial = partial_path(original);
        match fs::remove_file(&partial) {
            Ok(()) => {
                info!(path = %original.display(), "Removed stale partial output");
                removed += 1;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %partial.display(), "Failed to remove stale partial: {}", e),
        }
    }
    removed
}
