//! Metadata probing with mediainfo, plus RPU sampling for MEL/FEL detection.

use super::commands::{
    extract_command, extract_rpu_command, frame_count_command, mediainfo_command,
    rpu_summary_command, LAYER_SAMPLE_SECS,
};
use super::{run_tool, ProbeInfo, Prober, ToolError};
use crate::media::LayerKind;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Raw mediainfo JSON structures for parsing.
mod mediainfo_json {
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    pub struct MediaInfoOutput {
        pub media: Option<Media>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Media {
        #[serde(default)]
        pub track: Vec<Track>,
    }

    #[derive(Debug, Deserialize)]
    pub struct Track {
        #[serde(rename = "@type")]
        pub track_type: Option<String>,
        #[serde(rename = "Format")]
        pub format: Option<String>,
        #[serde(rename = "HDR_Format")]
        pub hdr_format: Option<String>,
        #[serde(rename = "HDR_Format_Profile")]
        pub hdr_format_profile: Option<String>,
        #[serde(rename = "Duration")]
        pub duration: Option<String>,
        #[serde(rename = "FrameCount")]
        pub frame_count: Option<String>,
        #[serde(rename = "FrameRate")]
        pub frame_rate: Option<String>,
    }
}

/// Parses mediainfo JSON output.
///
/// The profile comes from the first video track's `HDR_Format_Profile`
/// (`dvhe.07`, `dvh1.08`, ...). The layer kind is not reported by mediainfo
/// and is left as [`LayerKind::None`].
pub fn parse_mediainfo_output(json_str: &str) -> Result<ProbeInfo, ToolError> {
    let output: mediainfo_json::MediaInfoOutput =
        serde_json::from_str(json_str).map_err(|e| ToolError::BadOutput {
            tool: "mediainfo".to_string(),
            reason: e.to_string(),
        })?;

    let tracks = output.media.map(|m| m.track).unwrap_or_default();
    let video = tracks
        .iter()
        .find(|t| t.track_type.as_deref() == Some("Video"))
        .ok_or_else(|| ToolError::BadOutput {
            tool: "mediainfo".to_string(),
            reason: "no video track".to_string(),
        })?;

    let general_duration = tracks
        .iter()
        .find(|t| t.track_type.as_deref() == Some("General"))
        .and_then(|t| t.duration.as_deref());

    let profile = video
        .hdr_format_profile
        .as_deref()
        .and_then(parse_dovi_profile)
        .or_else(|| video.hdr_format.as_deref().and_then(parse_dovi_profile));

    let duration_secs = video
        .duration
        .as_deref()
        .or(general_duration)
        .and_then(|d| d.trim().parse::<f64>().ok());

    let frame_count = video
        .frame_count
        .as_deref()
        .and_then(|n| n.trim().parse::<u64>().ok());
    // Only a positive number is a usable rate for the remux.
    let frame_rate = video
        .frame_rate
        .as_deref()
        .map(str::trim)
        .filter(|r| r.parse::<f64>().is_ok_and(|fps| fps > 0.0))
        .map(str::to_string);

    Ok(ProbeInfo {
        profile,
        layer: LayerKind::None,
        codec: video.format.clone(),
        duration_secs,
        frame_count,
        frame_rate,
    })
}

/// Frame count from the last `frame=` progress field ffmpeg printed.
pub fn parse_frame_progress(stderr: &str) -> Option<u64> {
    let idx = stderr.rfind("frame=")?;
    let digits: String = stderr[idx + "frame=".len()..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Extract the profile number from a codec string such as `dvhe.07.06` or
/// `Dolby Vision, Version 1.0, dvhe.08.06, BL+RPU`.
pub fn parse_dovi_profile(text: &str) -> Option<u8> {
    let lower = text.to_lowercase();
    for prefix in ["dvhe.", "dvh1.", "dvav.", "dva1.", "dav1."] {
        if let Some(idx) = lower.find(prefix) {
            let digits: String = lower[idx + prefix.len()..]
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect();
            if let Ok(profile) = digits.parse::<u8>() {
                return Some(profile);
            }
        }
    }
    None
}

/// Parse `dovi_tool info --summary` output for the enhancement layer type.
///
/// The summary prints a line such as `Profile: 7 (FEL)`.
pub fn parse_layer_summary(summary: &str) -> Option<LayerKind> {
    let upper = summary.to_uppercase();
    if upper.contains("(FEL)") || upper.contains("EL_TYPE: FEL") {
        Some(LayerKind::Fel)
    } else if upper.contains("(MEL)") || upper.contains("EL_TYPE: MEL") {
        Some(LayerKind::Mel)
    } else {
        None
    }
}

/// Command-backed [`Prober`].
pub struct MediaInfoProber {
    mediainfo: PathBuf,
    ffmpeg: PathBuf,
    dovi_tool: PathBuf,
    /// Parent of the per-probe scratch directories.
    scratch_root: PathBuf,
    timeout: Duration,
}

impl MediaInfoProber {
    pub fn new(
        mediainfo: PathBuf,
        ffmpeg: PathBuf,
        dovi_tool: PathBuf,
        scratch_root: PathBuf,
        timeout: Duration,
    ) -> Self {
        Self {
            mediainfo,
            ffmpeg,
            dovi_tool,
            scratch_root,
            timeout,
        }
    }

    /// Resolve MEL vs FEL from a short sample of the stream. The scratch
    /// directory is named `convert_*` so startup cleanup also sweeps it.
    async fn sample_layer(&self, path: &Path) -> Result<Option<LayerKind>, ToolError> {
        let scratch = self.scratch_root.join(format!("convert_probe_{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;

        let result = self.sample_layer_in(path, &scratch).await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!(dir = %scratch.display(), "Could not remove probe scratch dir: {}", e);
        }
        result
    }

    async fn sample_layer_in(
        &self,
        path: &Path,
        scratch: &Path,
    ) -> Result<Option<LayerKind>, ToolError> {
        let sample = scratch.join("sample.hevc");
        let rpu = scratch.join("sample.rpu");

        run_tool(
            extract_command(&self.ffmpeg, path, &sample, Some(LAYER_SAMPLE_SECS)),
            "ffmpeg",
            self.timeout,
            &[0],
        )
        .await?;
        run_tool(
            extract_rpu_command(&self.dovi_tool, &sample, &rpu),
            "dovi_tool",
            self.timeout,
            &[0],
        )
        .await?;
        let summary = run_tool(
            rpu_summary_command(&self.dovi_tool, &rpu),
            "dovi_tool",
            self.timeout,
            &[0],
        )
        .await?;

        Ok(parse_layer_summary(&summary.stdout))
    }
}

#[async_trait]
impl Prober for MediaInfoProber {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo, ToolError> {
        let output = run_tool(
            mediainfo_command(&self.mediainfo, path),
            "mediainfo",
            self.timeout,
            &[0],
        )
        .await?;
        let mut info = parse_mediainfo_output(&output.stdout)?;

        if info.profile == Some(7) {
            info.layer = match self.sample_layer(path).await {
                Ok(Some(layer)) => layer,
                Ok(None) => {
                    warn!(path = %path.display(), "Layer type not reported; treating as FEL");
                    LayerKind::Fel
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => {
                    warn!(path = %path.display(), "Layer sampling failed ({}); treating as FEL", e);
                    LayerKind::Fel
                }
            };
        }

        debug!(
            path = %path.display(),
            profile = ?info.profile,
            layer = %info.layer,
            codec = ?info.codec,
            frames = ?info.frame_count,
            "Probed"
        );
        Ok(info)
    }

    async fn count_frames(
        &self,
        path: &Path,
        timeout: Duration,
    ) -> Result<Option<u64>, ToolError> {
        let output = run_tool(frame_count_command(&self.ffmpeg, path), "ffmpeg", timeout, &[0])
            .await?;
        Ok(parse_frame_progress(&output.stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const PROFILE7_JSON: &str = r#"{
        "creatingLibrary": {"name": "MediaInfoLib", "version": "24.01"},
        "media": {
            "@ref": "/movies/X.mkv",
            "track": [
                {"@type": "General", "Format": "Matroska", "Duration": "7345.120"},
                {
                    "@type": "Video",
                    "Format": "HEVC",
                    "FrameRate": "23.976",
                    "FrameCount": "176106",
                    "HDR_Format": "Dolby Vision / SMPTE ST 2086",
                    "HDR_Format_Profile": "dvhe.07 / ",
                    "HDR_Format_Level": "06",
                    "HDR_Format_Settings": "BL+EL+RPU / "
                },
                {"@type": "Audio", "Format": "MLP FBA"}
            ]
        }
    }"#;

    #[test]
    fn test_parse_profile7() {
        let info = parse_mediainfo_output(PROFILE7_JSON).unwrap();
        assert_eq!(info.profile, Some(7));
        assert_eq!(info.codec.as_deref(), Some("HEVC"));
        assert_eq!(info.duration_secs, Some(7345.12));
        assert_eq!(info.frame_count, Some(176_106));
        assert_eq!(info.frame_rate.as_deref(), Some("23.976"));
        assert_eq!(info.layer, LayerKind::None);
    }

    #[test]
    fn test_unusable_frame_fields_are_ignored() {
        let json = r#"{"media": {"track": [
            {"@type": "Video", "Format": "HEVC", "FrameRate": "VFR", "FrameCount": "n/a"}
        ]}}"#;
        let info = parse_mediainfo_output(json).unwrap();
        assert_eq!(info.frame_count, None);
        assert_eq!(info.frame_rate, None);
    }

    #[test]
    fn test_parse_frame_progress() {
        let stderr = "Input #0, matroska,webm, from 'X.mkv':\n\
            frame= 1200 fps=600 q=-1.0 size=N/A time=00:00:50.05 bitrate=N/A\r\
            frame=176106 fps=2101 q=-1.0 Lsize=N/A time=02:02:25.12 bitrate=N/A speed=87x\n";
        assert_eq!(parse_frame_progress(stderr), Some(176_106));
        assert_eq!(parse_frame_progress("no progress here"), None);
    }

    #[test]
    fn test_parse_non_dovi() {
        let json = r#"{"media": {"track": [
            {"@type": "General"},
            {"@type": "Video", "Format": "AVC", "Duration": "60.0"}
        ]}}"#;
        let info = parse_mediainfo_output(json).unwrap();
        assert_eq!(info.profile, None);
        assert_eq!(info.codec.as_deref(), Some("AVC"));
        assert_eq!(info.duration_secs, Some(60.0));
    }

    #[test]
    fn test_parse_profile_from_hdr_format_fallback() {
        let json = r#"{"media": {"track": [
            {"@type": "Video", "Format": "HEVC",
             "HDR_Format": "Dolby Vision, Version 1.0, dvhe.08.06, BL+RPU, HDR10 compatible"}
        ]}}"#;
        assert_eq!(parse_mediainfo_output(json).unwrap().profile, Some(8));
    }

    #[test]
    fn test_parse_without_video_track_fails() {
        let json = r#"{"media": {"track": [{"@type": "Audio"}]}}"#;
        assert!(matches!(
            parse_mediainfo_output(json),
            Err(ToolError::BadOutput { .. })
        ));
        assert!(parse_mediainfo_output("not json").is_err());
    }

    #[test]
    fn test_parse_dovi_profile_variants() {
        assert_eq!(parse_dovi_profile("dvhe.07.06"), Some(7));
        assert_eq!(parse_dovi_profile("DVHE.05.06"), Some(5));
        assert_eq!(parse_dovi_profile("dvh1.08.06"), Some(8));
        assert_eq!(parse_dovi_profile("dav1.10.09"), Some(10));
        assert_eq!(parse_dovi_profile("SMPTE ST 2086"), None);
        assert_eq!(parse_dovi_profile("dvhe."), None);
    }

    #[test]
    fn test_parse_layer_summary() {
        let fel = "Summary:\n  Frames: 24\n  Profile: 7 (FEL)\n  DM version: 1 (CM v2.9)\n";
        let mel = "Summary:\n  Frames: 24\n  Profile: 7 (MEL)\n";
        assert_eq!(parse_layer_summary(fel), Some(LayerKind::Fel));
        assert_eq!(parse_layer_summary(mel), Some(LayerKind::Mel));
        assert_eq!(parse_layer_summary("Profile: 8"), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_count_frames_reads_ffmpeg_progress() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let ffmpeg = dir.path().join("ffmpeg");
        std::fs::write(
            &ffmpeg,
            "#!/bin/sh\nprintf 'frame=  240 fps=0.0\\rframe= 1440 fps=960 speed=40x\\n' >&2\n",
        )
        .unwrap();
        std::fs::set_permissions(&ffmpeg, std::fs::Permissions::from_mode(0o755)).unwrap();

        let prober = MediaInfoProber::new(
            "mediainfo".into(),
            ffmpeg,
            "dovi_tool".into(),
            dir.path().to_path_buf(),
            Duration::from_secs(10),
        );
        let counted = prober
            .count_frames(Path::new("/movies/X.mkv"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(counted, Some(1440));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_profile_prefix_parsing(
            prefix in prop_oneof![Just("dvhe"), Just("dvh1"), Just("DVHE")],
            profile in 0u8..20,
            level in 1u8..14,
        ) {
            let text = format!("{}.{:02}.{:02}", prefix, profile, level);
            prop_assert_eq!(parse_dovi_profile(&text), Some(profile));
        }
    }
}
