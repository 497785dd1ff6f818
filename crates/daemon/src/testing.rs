//! In-process stand-ins for the external collaborators.
//!
//! Media files in tests are small text files such as `profile=7 layer=mel`.
//! The mock prober reads those markers back and the mock toolchain rewrites
//! `profile=7` to `profile=8`. Optional `frames=N` and `fps=R` markers stand
//! in for container metadata; `stream_frames=N` is what a full stream read
//! would count when it differs from `frames`.

use crate::backup::BackupManager;
use crate::config::Config;
use crate::disk_guard::{DiskSpaceGuard, FreeSpace};
use crate::media::{Fingerprint, LayerKind, RetryPolicy};
use crate::notify::{Event, EventKind, NotificationDispatcher, NotificationSink};
use crate::pipeline::{partial_path, JobOutcome, Pipeline, PipelineSettings, WORK_DIR_PREFIX};
use crate::state_store::StateStore;
use crate::tools::{ConversionTools, ProbeInfo, Prober, ToolError, ToolTimeouts};
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const GB: u64 = 1_000_000_000;

/// Parses `profile=N layer=mel|fel frames=N fps=R` markers.
pub(crate) fn parse_markers(content: &str) -> ProbeInfo {
    let mut info = ProbeInfo::default();
    for token in content.split_whitespace() {
        if let Some(profile) = token.strip_prefix("profile=") {
            info.profile = profile.parse().ok();
        } else if let Some(frames) = token.strip_prefix("frames=") {
            info.frame_count = frames.parse().ok();
        } else if let Some(fps) = token.strip_prefix("fps=") {
            info.frame_rate = Some(fps.to_string());
        } else if let Some(layer) = token.strip_prefix("layer=") {
            info.layer = match layer {
                "mel" => LayerKind::Mel,
                "fel" => LayerKind::Fel,
                _ => LayerKind::None,
            };
        }
    }
    info.codec = Some(if info.profile.is_some() { "HEVC" } else { "AVC" }.to_string());
    info
}

#[derive(Default)]
pub(crate) struct MockProber;

async fn read_marker_file(path: &Path, tool: &str) -> Result<String, ToolError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ToolError::Failed {
            tool: tool.to_string(),
            status: "exit code 1".to_string(),
            stderr: e.to_string(),
        })
}

#[async_trait]
impl Prober for MockProber {
    async fn probe(&self, path: &Path) -> Result<ProbeInfo, ToolError> {
        Ok(parse_markers(&read_marker_file(path, "mediainfo").await?))
    }

    async fn count_frames(
        &self,
        path: &Path,
        _timeout: Duration,
    ) -> Result<Option<u64>, ToolError> {
        let content = read_marker_file(path, "ffmpeg").await?;
        let counted = content
            .split_whitespace()
            .find_map(|t| t.strip_prefix("stream_frames="))
            .and_then(|n| n.parse().ok());
        Ok(counted.or(parse_markers(&content).frame_count))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MockFailure {
    /// Non-zero exit.
    Exit,
    Timeout,
    /// Exit 0 with an empty output file.
    Empty,
}

pub(crate) struct MockTools {
    calls: Mutex<Vec<&'static str>>,
    failure: Mutex<Option<(&'static str, MockFailure, u32)>>,
    output_profile: AtomicU8,
    delay_ms: AtomicU64,
    dropped_frames: AtomicU64,
    remux_rates: Mutex<Vec<Option<String>>>,
}

impl Default for MockTools {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failure: Mutex::new(None),
            output_profile: AtomicU8::new(8),
            delay_ms: AtomicU64::new(0),
            dropped_frames: AtomicU64::new(0),
            remux_rates: Mutex::new(Vec::new()),
        }
    }
}

impl MockTools {
    pub(crate) fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    /// Make `step` fail on every call.
    pub(crate) fn fail(&self, step: &'static str, failure: MockFailure) {
        self.fail_times(step, failure, u32::MAX);
    }

    pub(crate) fn fail_times(&self, step: &'static str, failure: MockFailure, times: u32) {
        *self.failure.lock().unwrap() = Some((step, failure, times));
    }

    /// Profile written by `convert`.
    pub(crate) fn set_output_profile(&self, profile: u8) {
        self.output_profile.store(profile, Ordering::SeqCst);
    }

    /// `remux` loses this many frames from a `frames=N` marker.
    pub(crate) fn set_dropped_frames(&self, frames: u64) {
        self.dropped_frames.store(frames, Ordering::SeqCst);
    }

    /// Frame rate passed to each `remux` call.
    pub(crate) fn remux_rates(&self) -> Vec<Option<String>> {
        self.remux_rates.lock().unwrap().clone()
    }

    /// Every step sleeps this long first.
    pub(crate) fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Returns whether the step should write an empty output.
    async fn step(&self, name: &'static str) -> Result<bool, ToolError> {
        self.calls.lock().unwrap().push(name);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let failure = {
            let mut guard = self.failure.lock().unwrap();
            match guard.as_mut() {
                Some((step, failure, remaining)) if *step == name && *remaining > 0 => {
                    *remaining -= 1;
                    Some(*failure)
                }
                _ => None,
            }
        };
        match failure {
            None => Ok(false),
            Some(MockFailure::Empty) => Ok(true),
            Some(MockFailure::Exit) => Err(ToolError::Failed {
                tool: name.to_string(),
                status: "exit code 1".to_string(),
                stderr: "mock failure".to_string(),
            }),
            Some(MockFailure::Timeout) => Err(ToolError::Timeout {
                tool: name.to_string(),
                timeout: Duration::from_secs(1),
            }),
        }
    }
}

#[async_trait]
impl ConversionTools for MockTools {
    async fn extract(
        &self,
        source: &Path,
        output: &Path,
        _timeout: Duration,
    ) -> Result<(), ToolError> {
        let empty = self.step("extract").await?;
        let content = if empty {
            String::new()
        } else {
            tokio::fs::read_to_string(source).await?
        };
        tokio::fs::write(output, content).await?;
        Ok(())
    }

    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        _timeout: Duration,
    ) -> Result<(), ToolError> {
        let empty = self.step("convert").await?;
        let content = if empty {
            String::new()
        } else {
            let profile = self.output_profile.load(Ordering::SeqCst);
            tokio::fs::read_to_string(input)
                .await?
                .replace("profile=7", &format!("profile={}", profile))
        };
        tokio::fs::write(output, content).await?;
        Ok(())
    }

    async fn remux(
        &self,
        video: &Path,
        _source: &Path,
        output: &Path,
        frame_rate: Option<&str>,
        _timeout: Duration,
    ) -> Result<(), ToolError> {
        self.remux_rates
            .lock()
            .unwrap()
            .push(frame_rate.map(str::to_string));
        let empty = self.step("remux").await?;
        let content = if empty {
            String::new()
        } else {
            let dropped = self.dropped_frames.load(Ordering::SeqCst);
            tokio::fs::read_to_string(video)
                .await?
                .split_whitespace()
                .map(|token| match token.strip_prefix("frames=") {
                    Some(n) => {
                        let n: u64 = n.parse().unwrap_or(0);
                        format!("frames={}", n.saturating_sub(dropped))
                    }
                    None => token.to_string(),
                })
                .collect::<Vec<_>>()
                .join(" ")
        };
        tokio::fs::write(output, content).await?;
        Ok(())
    }
}

pub(crate) struct MockFreeSpace(AtomicU64);

impl Default for MockFreeSpace {
    fn default() -> Self {
        Self(AtomicU64::new(1_000 * GB))
    }
}

impl MockFreeSpace {
    pub(crate) fn set_gb(&self, gb: u64) {
        self.0.store(gb * GB, Ordering::SeqCst);
    }
}

impl FreeSpace for MockFreeSpace {
    fn available_bytes(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub(crate) events: Mutex<Vec<Event>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn send(&self, event: &Event) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

/// Retry policy without backoff so retries are due immediately.
pub(crate) fn immediate_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        backoff_base_secs: 0,
        backoff_max_secs: 0,
    }
}

/// A library, state dir and temp dir in one TempDir, wired to mocks.
pub(crate) struct TestEnv {
    pub(crate) temp: TempDir,
    pub(crate) media: PathBuf,
    pub(crate) store: Arc<StateStore>,
    pub(crate) backups: Arc<BackupManager>,
    pub(crate) prober: Arc<MockProber>,
    pub(crate) tools: Arc<MockTools>,
    pub(crate) free: Arc<MockFreeSpace>,
    pub(crate) sink: Arc<RecordingSink>,
    pub(crate) notifier: NotificationDispatcher,
    pub(crate) settings: PipelineSettings,
}

impl TestEnv {
    pub(crate) fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub(crate) fn with_settings(adjust: impl FnOnce(&mut PipelineSettings)) -> Self {
        let temp = TempDir::new().unwrap();
        let media = temp.path().join("movies");
        let temp_dir = temp.path().join("temp");
        std::fs::create_dir_all(&media).unwrap();
        std::fs::create_dir_all(&temp_dir).unwrap();

        let store =
            Arc::new(StateStore::open(&temp.path().join("state"), immediate_retry()).unwrap());
        let backups =
            Arc::new(BackupManager::open(&temp.path().join("state"), None, 7).unwrap());
        let sink = Arc::new(RecordingSink::default());
        let (notifier, _handle) = NotificationDispatcher::spawn(sink.clone());

        let mut settings = PipelineSettings {
            dry_run: false,
            auto_process_fel: false,
            temp_dir,
            timeouts: ToolTimeouts::new(60, 60),
            min_convert_ratio: 0.5,
            max_convert_ratio: 1.05,
        };
        adjust(&mut settings);

        Self {
            temp,
            media,
            store,
            backups,
            prober: Arc::new(MockProber),
            tools: Arc::new(MockTools::default()),
            free: Arc::new(MockFreeSpace::default()),
            sink,
            notifier,
            settings,
        }
    }

    /// Configuration pointing at this environment's directories.
    pub(crate) fn config(&self) -> Config {
        let mut config = Config::default();
        config.state_dir = self.temp.path().join("state");
        config.temp_dir = self.settings.temp_dir.clone();
        config.library.roots = vec![self.media.clone()];
        config.policy.dry_run = self.settings.dry_run;
        config.policy.auto_process_fel = self.settings.auto_process_fel;
        config.workers.retry_backoff_base_secs = 0;
        config.workers.retry_backoff_max_secs = 0;
        config
    }

    pub(crate) fn disk_guard(&self) -> DiskSpaceGuard {
        DiskSpaceGuard::new(50, 2.5, self.free.clone())
    }

    pub(crate) fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            self.store.clone(),
            self.prober.clone(),
            self.tools.clone(),
            self.disk_guard(),
            self.backups.clone(),
            self.notifier.clone(),
            self.settings.clone(),
        )
    }

    /// Write a media file and register it with the store.
    pub(crate) fn add_media(&self, name: &str, content: &str) -> PathBuf {
        let path = self.write_media(name, content);
        let fp = Fingerprint::of_path(&path).unwrap();
        self.store.observe_batch(&[(path.clone(), fp)], false).unwrap();
        path
    }

    /// Write a media file without registering it.
    pub(crate) fn write_media(&self, name: &str, content: &str) -> PathBuf {
        let path = self.media.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Claim and run one file.
    pub(crate) async fn process(&self, path: &Path) -> JobOutcome {
        assert!(self.store.claim_processing(path).unwrap(), "claim failed");
        self.pipeline()
            .run(path, &CancellationToken::new())
            .await
            .unwrap()
    }

    /// Point backups at a directory that no longer exists.
    pub(crate) fn break_backups(&mut self) {
        let gone = self.temp.path().join("backups-gone");
        let manager =
            BackupManager::open(&self.temp.path().join("state"), Some(gone.clone()), 7).unwrap();
        std::fs::remove_dir_all(&gone).unwrap();
        self.backups = Arc::new(manager);
    }

    pub(crate) fn assert_no_scratch(&self, original: &Path) {
        let leftovers: Vec<_> = std::fs::read_dir(&self.settings.temp_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(WORK_DIR_PREFIX))
            .collect();
        assert!(leftovers.is_empty(), "work dirs left: {:?}", leftovers);
        assert!(!partial_path(original).exists(), "partial output left");
    }

    /// Kinds of the events delivered so far.
    pub(crate) async fn events(&self) -> Vec<EventKind> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.sink
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.kind)
            .collect()
    }
}
