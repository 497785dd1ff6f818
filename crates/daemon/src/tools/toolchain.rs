//! Command-backed conversion toolchain.

use super::commands::{convert_command, extract_command, remux_command};
use super::{run_tool, ConversionTools, ToolError};
use crate::config::ToolsConfig;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// mkvmerge exits 1 when it finished with warnings.
const MKVMERGE_OK_CODES: &[i32] = &[0, 1];

/// Drives ffmpeg, dovi_tool and mkvmerge.
#[derive(Debug, Clone)]
pub struct CommandToolchain {
    ffmpeg: PathBuf,
    dovi_tool: PathBuf,
    mkvmerge: PathBuf,
}

impl CommandToolchain {
    pub fn new(ffmpeg: PathBuf, dovi_tool: PathBuf, mkvmerge: PathBuf) -> Self {
        Self {
            ffmpeg,
            dovi_tool,
            mkvmerge,
        }
    }

    pub fn from_config(tools: &ToolsConfig) -> Self {
        Self::new(
            tools.ffmpeg.clone(),
            tools.dovi_tool.clone(),
            tools.mkvmerge.clone(),
        )
    }
}

#[async_trait]
impl ConversionTools for CommandToolchain {
    async fn extract(
        &self,
        source: &Path,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), ToolError> {
        info!(source = %source.display(), "Extracting video stream");
        run_tool(
            extract_command(&self.ffmpeg, source, output, None),
            "ffmpeg",
            timeout,
            &[0],
        )
        .await?;
        Ok(())
    }

    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        timeout: Duration,
    ) -> Result<(), ToolError> {
        info!(input = %input.display(), "Converting RPU to profile 8.1");
        run_tool(
            convert_command(&self.dovi_tool, input, output),
            "dovi_tool",
            timeout,
            &[0],
        )
        .await?;
        Ok(())
    }

    async fn remux(
        &self,
        video: &Path,
        source: &Path,
        output: &Path,
        frame_rate: Option<&str>,
        timeout: Duration,
    ) -> Result<(), ToolError> {
        info!(output = %output.display(), frame_rate = ?frame_rate, "Remuxing");
        let result = run_tool(
            remux_command(&self.mkvmerge, video, source, output, frame_rate),
            "mkvmerge",
            timeout,
            MKVMERGE_OK_CODES,
        )
        .await?;
        if !result.stdout.trim().is_empty() {
            warn!(output = %output.display(), "mkvmerge warnings: {}", result.stdout.trim());
        }
        Ok(())
    }
}
