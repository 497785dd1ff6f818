//! Command builders for the conversion toolchain.
//!
//! Builders return an unstarted `std::process::Command` so argument lists can
//! be inspected in tests; [`super::run_tool`] executes them.

use std::path::Path;
use std::process::Command;

/// Seconds of video sampled when resolving MEL vs FEL.
pub const LAYER_SAMPLE_SECS: u32 = 1;

/// `mediainfo --Output=JSON <path>`
pub fn mediainfo_command(mediainfo: &Path, path: &Path) -> Command {
    let mut cmd = Command::new(mediainfo);
    cmd.arg("--Output=JSON").arg(path);
    cmd
}

/// Copy the first video stream to an Annex-B HEVC elementary stream.
///
/// With `sample_secs` only the leading seconds are copied (layer probing).
pub fn extract_command(
    ffmpeg: &Path,
    source: &Path,
    output: &Path,
    sample_secs: Option<u32>,
) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(["-y", "-nostdin", "-loglevel", "error"]);
    cmd.arg("-i").arg(source);
    cmd.args(["-map", "0:v:0", "-c:v", "copy", "-bsf:v", "hevc_mp4toannexb"]);
    if let Some(secs) = sample_secs {
        cmd.arg("-t").arg(secs.to_string());
    }
    cmd.args(["-f", "hevc"]);
    cmd.arg(output);
    cmd
}

/// `dovi_tool -m 2 convert --discard`: RPU mode 2 rewrites profile 7 RPUs
/// as 8.1, `--discard` drops the enhancement layer.
pub fn convert_command(dovi_tool: &Path, input: &Path, output: &Path) -> Command {
    let mut cmd = Command::new(dovi_tool);
    cmd.args(["-m", "2", "convert", "--discard"]);
    cmd.arg("-i").arg(input);
    cmd.arg("-o").arg(output);
    cmd
}

/// `dovi_tool extract-rpu -i <hevc> -o <rpu>`
pub fn extract_rpu_command(dovi_tool: &Path, input: &Path, output: &Path) -> Command {
    let mut cmd = Command::new(dovi_tool);
    cmd.arg("extract-rpu");
    cmd.arg("-i").arg(input);
    cmd.arg("-o").arg(output);
    cmd
}

/// `dovi_tool info --summary -i <rpu>`
pub fn rpu_summary_command(dovi_tool: &Path, rpu: &Path) -> Command {
    let mut cmd = Command::new(dovi_tool);
    cmd.args(["info", "--summary"]);
    cmd.arg("-i").arg(rpu);
    cmd
}

/// Stream-copy the first video stream to the null muxer. ffmpeg's final
/// progress line then carries the real frame count.
pub fn frame_count_command(ffmpeg: &Path, source: &Path) -> Command {
    let mut cmd = Command::new(ffmpeg);
    cmd.args(["-hide_banner", "-nostdin"]);
    cmd.arg("-i").arg(source);
    cmd.args(["-map", "0:v:0", "-c", "copy", "-f", "null", "-"]);
    cmd
}

/// New container from the converted stream plus every non-video track
/// (audio, subtitles, chapters, attachments) of the original.
///
/// A raw HEVC stream carries no timing, so the source frame rate is passed
/// as the video track's default duration when known.
pub fn remux_command(
    mkvmerge: &Path,
    video: &Path,
    source: &Path,
    output: &Path,
    frame_rate: Option<&str>,
) -> Command {
    let mut cmd = Command::new(mkvmerge);
    cmd.arg("-q");
    cmd.arg("-o").arg(output);
    if let Some(fps) = frame_rate {
        cmd.arg("--default-duration").arg(format!("0:{}fps", fps));
    }
    cmd.arg(video);
    cmd.arg("--no-video").arg(source);
    cmd
}

/// Version probe used by the startup check.
pub fn version_command(tool: &Path, flag: &str) -> Command {
    let mut cmd = Command::new(tool);
    cmd.arg(flag);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    /// Helper to convert Command args to a Vec of strings for easier testing
    fn get_command_args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .filter_map(|arg| arg.to_str().map(String::from))
            .collect()
    }

    /// Helper to check if args contain a flag with a specific value
    fn has_flag_with_value(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|pair| pair[0] == flag && pair[1] == value)
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop::string::string_regex("/[a-zA-Z0-9_/. -]{1,50}")
            .unwrap()
            .prop_filter("no trailing slash", |s| !s.ends_with('/'))
    }

    #[test]
    fn test_mediainfo_command() {
        let cmd = mediainfo_command(Path::new("mediainfo"), Path::new("/movies/X.mkv"));
        assert_eq!(cmd.get_program(), "mediainfo");
        assert_eq!(get_command_args(&cmd), vec!["--Output=JSON", "/movies/X.mkv"]);
    }

    #[test]
    fn test_extract_command_full_stream() {
        let cmd = extract_command(
            Path::new("ffmpeg"),
            Path::new("/movies/X.mkv"),
            Path::new("/temp/convert_1/video.hevc"),
            None,
        );
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(&args, "-i", "/movies/X.mkv"));
        assert!(has_flag_with_value(&args, "-map", "0:v:0"));
        assert!(has_flag_with_value(&args, "-c:v", "copy"));
        assert!(has_flag_with_value(&args, "-f", "hevc"));
        assert!(!args.contains(&"-t".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/temp/convert_1/video.hevc"));
    }

    #[test]
    fn test_extract_command_sample() {
        let cmd = extract_command(
            Path::new("ffmpeg"),
            Path::new("/movies/X.mkv"),
            Path::new("/temp/probe/sample.hevc"),
            Some(LAYER_SAMPLE_SECS),
        );
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(&args, "-t", "1"));
    }

    #[test]
    fn test_convert_command_discards_enhancement_layer() {
        let cmd = convert_command(
            Path::new("/usr/local/bin/dovi_tool"),
            Path::new("/w/video.hevc"),
            Path::new("/w/video.p8.hevc"),
        );
        assert_eq!(cmd.get_program(), "/usr/local/bin/dovi_tool");
        let args = get_command_args(&cmd);
        assert_eq!(&args[..4], &["-m", "2", "convert", "--discard"]);
        assert!(has_flag_with_value(&args, "-i", "/w/video.hevc"));
        assert!(has_flag_with_value(&args, "-o", "/w/video.p8.hevc"));
    }

    #[test]
    fn test_rpu_commands() {
        let extract = extract_rpu_command(
            Path::new("dovi_tool"),
            Path::new("/p/sample.hevc"),
            Path::new("/p/sample.rpu"),
        );
        let args = get_command_args(&extract);
        assert_eq!(args[0], "extract-rpu");
        assert!(has_flag_with_value(&args, "-o", "/p/sample.rpu"));

        let summary = rpu_summary_command(Path::new("dovi_tool"), Path::new("/p/sample.rpu"));
        assert_eq!(
            get_command_args(&summary),
            vec!["info", "--summary", "-i", "/p/sample.rpu"]
        );
    }

    #[test]
    fn test_remux_command_sets_default_duration() {
        let cmd = remux_command(
            Path::new("mkvmerge"),
            Path::new("/w/video.p8.hevc"),
            Path::new("/movies/X.mkv"),
            Path::new("/movies/.X.mkv.dovi-migrate.partial"),
            Some("23.976"),
        );
        assert_eq!(
            get_command_args(&cmd),
            vec![
                "-q",
                "-o",
                "/movies/.X.mkv.dovi-migrate.partial",
                "--default-duration",
                "0:23.976fps",
                "/w/video.p8.hevc",
                "--no-video",
                "/movies/X.mkv",
            ]
        );
    }

    #[test]
    fn test_frame_count_command() {
        let cmd = frame_count_command(Path::new("ffmpeg"), Path::new("/movies/X.mkv"));
        let args = get_command_args(&cmd);
        assert!(has_flag_with_value(&args, "-i", "/movies/X.mkv"));
        assert!(has_flag_with_value(&args, "-map", "0:v:0"));
        assert!(has_flag_with_value(&args, "-f", "null"));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    // The remux keeps the converted video first and takes only non-video
    // tracks from the original, for any pair of paths.
    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_remux_command_layout(
            video in path_strategy(),
            source in path_strategy(),
            output in path_strategy(),
        ) {
            let cmd = remux_command(
                Path::new("mkvmerge"),
                &PathBuf::from(&video),
                &PathBuf::from(&source),
                &PathBuf::from(&output),
                None,
            );
            let args = get_command_args(&cmd);

            prop_assert!(has_flag_with_value(&args, "-o", &output));
            prop_assert!(has_flag_with_value(&args, "--no-video", &source));
            // -q -o <output> <video> --no-video <source>
            prop_assert_eq!(&args[3], &video);
            prop_assert_eq!(&args[4], "--no-video");
        }
    }
}
