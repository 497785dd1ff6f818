//! Per-file conversion state machine.
//!
//! A claimed file moves through named states until it reaches an exit:
//!
//! ```text
//! Claimed -> Probed -> Eligible -> Extracting -> Converting -> Remuxing
//!         -> Verifying -> Replacing -> Completed
//! ```
//!
//! `Probed` may exit as Skipped (or WouldProcess in dry-run), any state before
//! `Replacing` may exit as Failed or as a transient release. Scratch files are
//! removed on every exit by [`WorkPaths`].

use crate::backup::{replace_atomically, BackupManager};
use crate::config::Config;
use crate::disk_guard::DiskSpaceGuard;
use crate::media::{FailureKind, FileStatus, Fingerprint, LayerKind};
use crate::notify::{Event, EventKind, NotificationDispatcher};
use crate::state_store::{FailureDisposition, StateStore, StoreError};
use crate::tools::{ConversionTools, ProbeInfo, Prober, ToolError, ToolTimeouts};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Suffix of the remux output written next to the original.
pub const PARTIAL_SUFFIX: &str = ".dovi-migrate.partial";
/// Prefix of per-job scratch directories under the temp dir.
pub const WORK_DIR_PREFIX: &str = "convert_";

/// Position of a job in the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Claimed,
    Probed,
    Eligible,
    Extracting,
    Converting,
    Remuxing,
    Verifying,
    Replacing,
    Completed,
}

impl PipelineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Claimed => "claimed",
            PipelineState::Probed => "probed",
            PipelineState::Eligible => "eligible",
            PipelineState::Extracting => "extracting",
            PipelineState::Converting => "converting",
            PipelineState::Remuxing => "remuxing",
            PipelineState::Verifying => "verifying",
            PipelineState::Replacing => "replacing",
            PipelineState::Completed => "completed",
        }
    }

    /// States after which a shutdown no longer interrupts the job.
    fn is_committed(&self) -> bool {
        matches!(self, PipelineState::Replacing | PipelineState::Completed)
    }
}

/// How a job ended.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed,
    Skipped { reason: String },
    WouldProcess { reason: String },
    /// Transient abort: back to Pending, no attempt consumed.
    Released { reason: String },
    /// `retry_at` is `None` when the failure is terminal.
    Failed {
        reason: String,
        retry_at: Option<DateTime<Utc>>,
    },
}

/// Why the state machine stopped before `Completed`.
#[derive(Debug)]
enum Exit {
    Skip(String),
    WouldProcess(String),
    Transient(String),
    Fail(String, FailureKind),
}

impl Exit {
    fn from_tool(step: &str, err: ToolError) -> Self {
        if err.is_transient() {
            Exit::Transient(format!("{}: {}", step, err))
        } else {
            Exit::Fail(format!("{}: {}", step, err), FailureKind::Tool)
        }
    }
}

/// Result of the converted-stream plausibility check.
#[derive(Debug, Clone, PartialEq)]
pub enum SizeCheck {
    Accept,
    Reject { input_bytes: u64, output_bytes: u64 },
}

/// Converted stream must be non-empty and within `[min_ratio, max_ratio]`
/// of the extracted stream.
pub fn check_converted_size(
    input_bytes: u64,
    output_bytes: u64,
    min_ratio: f64,
    max_ratio: f64,
) -> SizeCheck {
    if output_bytes == 0 || input_bytes == 0 {
        return SizeCheck::Reject {
            input_bytes,
            output_bytes,
        };
    }
    let ratio = output_bytes as f64 / input_bytes as f64;
    if ratio < min_ratio || ratio > max_ratio {
        SizeCheck::Reject {
            input_bytes,
            output_bytes,
        }
    } else {
        SizeCheck::Accept
    }
}

/// Path of the remux output for `original`: `.<name>.dovi-migrate.partial`
/// in the same directory, so the final rename never crosses filesystems.
pub fn partial_path(original: &Path) -> PathBuf {
    let mut name = std::ffi::OsString::from(".");
    name.push(original.file_name().unwrap_or_default());
    name.push(PARTIAL_SUFFIX);
    original.with_file_name(name)
}

/// Scratch locations of one job. Dropping removes all of them.
#[derive(Debug)]
pub struct WorkPaths {
    pub work_dir: PathBuf,
    pub extracted: PathBuf,
    pub converted: PathBuf,
    pub partial: PathBuf,
}

impl WorkPaths {
    pub fn new(temp_dir: &Path, original: &Path) -> Self {
        let work_dir = temp_dir.join(format!("{}{}", WORK_DIR_PREFIX, Uuid::new_v4()));
        Self {
            extracted: work_dir.join("video.hevc"),
            converted: work_dir.join("video.p8.hevc"),
            partial: partial_path(original),
            work_dir,
        }
    }
}

impl Drop for WorkPaths {
    fn drop(&mut self) {
        if self.work_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&self.work_dir) {
                warn!(dir = %self.work_dir.display(), "Failed to remove work dir: {}", e);
            }
        }
        match fs::remove_file(&self.partial) {
            Ok(()) => debug!(path = %self.partial.display(), "Removed partial output"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(path = %self.partial.display(), "Failed to remove partial: {}", e),
        }
    }
}

/// Ephemeral state of one pipeline execution.
struct ConversionJob {
    path: PathBuf,
    /// Fingerprint recorded by the scan that queued the file.
    scanned: Fingerprint,
    source_size: u64,
    state: PipelineState,
    probe: ProbeInfo,
    paths: WorkPaths,
}

/// Behavior switches for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub dry_run: bool,
    pub auto_process_fel: bool,
    pub temp_dir: PathBuf,
    pub timeouts: ToolTimeouts,
    pub min_convert_ratio: f64,
    pub max_convert_ratio: f64,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            dry_run: config.policy.dry_run,
            auto_process_fel: config.policy.auto_process_fel,
            temp_dir: config.temp_dir.clone(),
            timeouts: ToolTimeouts::new(
                config.tools.timeout_base_secs,
                config.tools.timeout_secs_per_gb,
            ),
            min_convert_ratio: 0.5,
            max_convert_ratio: 1.05,
        }
    }
}

/// Runs claimed files through the state machine.
pub struct Pipeline {
    store: Arc<StateStore>,
    prober: Arc<dyn Prober>,
    tools: Arc<dyn ConversionTools>,
    disk: DiskSpaceGuard,
    backups: Arc<BackupManager>,
    notifier: NotificationDispatcher,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Arc<StateStore>,
        prober: Arc<dyn Prober>,
        tools: Arc<dyn ConversionTools>,
        disk: DiskSpaceGuard,
        backups: Arc<BackupManager>,
        notifier: NotificationDispatcher,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            prober,
            tools,
            disk,
            backups,
            notifier,
            settings,
        }
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Drive a file the caller has already claimed to an exit.
    ///
    /// `shutdown` is checked between steps; once `Replacing` has begun the job
    /// always runs to the rename.
    pub async fn run(
        &self,
        path: &Path,
        shutdown: &CancellationToken,
    ) -> Result<JobOutcome, StoreError> {
        let record = self
            .store
            .get(path)?
            .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))?;
        if record.status != FileStatus::Processing {
            return Err(StoreError::InvalidTransition {
                path: path.to_path_buf(),
                expected: FileStatus::Processing,
                actual: record.status,
            });
        }

        let mut job = ConversionJob {
            path: path.to_path_buf(),
            scanned: record.fingerprint,
            source_size: record.fingerprint.size_bytes,
            state: PipelineState::Claimed,
            probe: ProbeInfo::default(),
            paths: WorkPaths::new(&self.settings.temp_dir, path),
        };

        let exit = loop {
            if shutdown.is_cancelled() && !job.state.is_committed() {
                break Err(Exit::Transient(format!(
                    "shutdown before {}",
                    job.state.as_str()
                )));
            }

            let step = match job.state {
                PipelineState::Claimed => self.probe(&mut job).await,
                PipelineState::Probed => self.check_eligibility(&job),
                PipelineState::Eligible => self.preflight(&job),
                PipelineState::Extracting => self.extract(&job).await,
                PipelineState::Converting => self.convert(&job).await,
                PipelineState::Remuxing => self.remux(&job).await,
                PipelineState::Verifying => self.verify(&job).await,
                PipelineState::Replacing => self.replace(&job).await,
                PipelineState::Completed => break Ok(()),
            };

            match step {
                Ok(next) => {
                    debug!(
                        path = %job.path.display(),
                        from = job.state.as_str(),
                        to = next.as_str(),
                        "Pipeline transition"
                    );
                    job.state = next;
                }
                Err(exit) => break Err(exit),
            }
        };

        let outcome = self.finish(&job, exit).await;
        drop(job);
        outcome
    }

    async fn probe(&self, job: &mut ConversionJob) -> Result<PipelineState, Exit> {
        let info = self
            .prober
            .probe(&job.path)
            .await
            .map_err(|e| Exit::from_tool("probe", e))?;

        let (path, profile, layer) = (job.path.clone(), info.profile, info.layer);
        self.store
            .run_blocking(move |store| store.record_probe(&path, profile, layer))
            .await
            .map_err(|e| Exit::Transient(format!("state store: {}", e)))?;

        info!(
            path = %job.path.display(),
            profile = ?info.profile,
            layer = %info.layer,
            "Probed"
        );
        job.probe = info;
        Ok(PipelineState::Probed)
    }

    fn check_eligibility(&self, job: &ConversionJob) -> Result<PipelineState, Exit> {
        let probe = &job.probe;
        match probe.profile {
            None => return Err(Exit::Skip("no Dolby Vision metadata".to_string())),
            Some(7) => {}
            Some(8) => {
                // A backup of this path means our own rename already landed
                // and only the completion record was lost.
                return match self.backups.has_backup(&job.path) {
                    Ok(true) => {
                        info!(path = %job.path.display(), "Already replaced before restart");
                        Ok(PipelineState::Completed)
                    }
                    Ok(false) => Err(Exit::Skip("already profile 8".to_string())),
                    Err(e) => Err(Exit::Transient(format!("backup ledger: {}", e))),
                };
            }
            Some(p) => return Err(Exit::Skip(format!("profile {} is not convertible", p))),
        }
        if let Some(codec) = &probe.codec {
            if !codec.eq_ignore_ascii_case("HEVC") {
                return Err(Exit::Skip(format!("unsupported codec {}", codec)));
            }
        }
        if probe.layer == LayerKind::Fel && !self.settings.auto_process_fel {
            return Err(Exit::Skip("needs-approval".to_string()));
        }
        if self.settings.dry_run {
            return Err(Exit::WouldProcess(format!(
                "would convert profile 7 {} to profile 8.1",
                probe.layer
            )));
        }
        Ok(PipelineState::Eligible)
    }

    fn preflight(&self, job: &ConversionJob) -> Result<PipelineState, Exit> {
        match Fingerprint::of_path(&job.path) {
            Ok(current) if current == job.scanned => {}
            Ok(_) => return Err(Exit::Transient("file changed since scan".to_string())),
            Err(e) => return Err(Exit::Transient(format!("cannot stat source: {}", e))),
        }

        let parent = job
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/"));
        let targets = [self.settings.temp_dir.clone(), parent];
        if !self.disk.has_room(job.source_size, &targets) {
            return Err(Exit::Transient("insufficient disk space".to_string()));
        }

        fs::create_dir_all(&job.paths.work_dir).map_err(|e| {
            Exit::Transient(format!("cannot create work dir: {}", e))
        })?;
        Ok(PipelineState::Extracting)
    }

    async fn extract(&self, job: &ConversionJob) -> Result<PipelineState, Exit> {
        let timeout = self.settings.timeouts.for_size(job.source_size);
        self.tools
            .extract(&job.path, &job.paths.extracted, timeout)
            .await
            .map_err(|e| Exit::from_tool("extract", e))?;

        match output_size(&job.paths.extracted) {
            Some(size) if size > 0 => Ok(PipelineState::Converting),
            _ => Err(Exit::Fail(
                "extract: produced no output".to_string(),
                FailureKind::Tool,
            )),
        }
    }

    async fn convert(&self, job: &ConversionJob) -> Result<PipelineState, Exit> {
        let timeout = self.settings.timeouts.for_size(job.source_size);
        self.tools
            .convert(&job.paths.extracted, &job.paths.converted, timeout)
            .await
            .map_err(|e| Exit::from_tool("convert", e))?;

        let input = output_size(&job.paths.extracted).unwrap_or(0);
        let output = output_size(&job.paths.converted).unwrap_or(0);
        match check_converted_size(
            input,
            output,
            self.settings.min_convert_ratio,
            self.settings.max_convert_ratio,
        ) {
            SizeCheck::Accept => Ok(PipelineState::Remuxing),
            SizeCheck::Reject {
                input_bytes,
                output_bytes,
            } => Err(Exit::Fail(
                format!(
                    "convert: implausible output size ({} bytes from {} bytes)",
                    output_bytes, input_bytes
                ),
                FailureKind::Tool,
            )),
        }
    }

    async fn remux(&self, job: &ConversionJob) -> Result<PipelineState, Exit> {
        let timeout = self.settings.timeouts.for_size(job.source_size);
        self.tools
            .remux(
                &job.paths.converted,
                &job.path,
                &job.paths.partial,
                job.probe.frame_rate.as_deref(),
                timeout,
            )
            .await
            .map_err(|e| Exit::from_tool("remux", e))?;

        match output_size(&job.paths.partial) {
            Some(size) if size > 0 => Ok(PipelineState::Verifying),
            _ => Err(Exit::Fail(
                "remux: produced no output".to_string(),
                FailureKind::Tool,
            )),
        }
    }

    async fn verify(&self, job: &ConversionJob) -> Result<PipelineState, Exit> {
        let info = self
            .prober
            .probe(&job.paths.partial)
            .await
            .map_err(|e| Exit::from_tool("verify", e))?;

        if info.profile != Some(8) {
            return Err(Exit::Fail(
                format!(
                    "verify: output reports profile {}",
                    info.profile.map_or_else(|| "none".to_string(), |p| p.to_string())
                ),
                FailureKind::Integrity,
            ));
        }

        self.verify_frames(job, info.frame_count).await?;
        Ok(PipelineState::Replacing)
    }

    /// The output must hold as many frames as the source. Source metadata is
    /// sometimes wrong, so a disagreement is settled by counting the source
    /// stream itself. Without a source count there is nothing to compare.
    async fn verify_frames(
        &self,
        job: &ConversionJob,
        output: Option<u64>,
    ) -> Result<(), Exit> {
        let Some(expected) = job.probe.frame_count else {
            debug!(path = %job.path.display(), "Source frame count unknown; skipping comparison");
            return Ok(());
        };
        if output == Some(expected) {
            return Ok(());
        }

        let timeout = self.settings.timeouts.for_size(job.source_size);
        let counted = self
            .prober
            .count_frames(&job.path, timeout)
            .await
            .map_err(|e| Exit::from_tool("verify", e))?;
        if counted.is_some() && counted == output {
            warn!(
                path = %job.path.display(),
                metadata = expected,
                counted = ?counted,
                "Source frame count metadata was wrong; stream count matches output"
            );
            return Ok(());
        }

        Err(Exit::Fail(
            format!(
                "verify: frame count mismatch (source {}, output {})",
                counted.unwrap_or(expected),
                output.map_or_else(|| "unknown".to_string(), |n| n.to_string())
            ),
            FailureKind::Integrity,
        ))
    }

    /// Backup, then the single rename. Nothing here observes cancellation.
    async fn replace(&self, job: &ConversionJob) -> Result<PipelineState, Exit> {
        let backups = Arc::clone(&self.backups);
        let original = job.path.clone();
        let record = tokio::task::spawn_blocking(move || backups.backup(&original))
            .await
            .map_err(|e| Exit::Fail(format!("backup: {}", e), FailureKind::Tool))?
            .map_err(|e| Exit::Fail(format!("backup: {}", e), FailureKind::Tool))?;

        replace_atomically(&job.paths.partial, &job.path)
            .map_err(|e| Exit::Fail(format!("replace: {}", e), FailureKind::Tool))?;

        info!(
            path = %job.path.display(),
            backup = %record.backup.display(),
            "Replaced original"
        );
        Ok(PipelineState::Completed)
    }

    /// Record the exit in the store and notify.
    async fn finish(
        &self,
        job: &ConversionJob,
        exit: Result<(), Exit>,
    ) -> Result<JobOutcome, StoreError> {
        let path = job.path.as_path();
        let owned = job.path.clone();
        match exit {
            Ok(()) => {
                let fingerprint = match Fingerprint::of_path(path) {
                    Ok(fingerprint) => fingerprint,
                    Err(e) => {
                        // The next scan sees a changed fingerprint and finds
                        // the file already converted.
                        warn!(
                            path = %path.display(),
                            "Cannot fingerprint replaced file ({}); keeping the scanned one",
                            e
                        );
                        job.scanned
                    }
                };
                let reason = if job.probe.profile == Some(8) {
                    "already converted; backup on record".to_string()
                } else {
                    format!("converted profile 7 {} to profile 8.1", job.probe.layer)
                };
                let detail = reason.clone();
                self.store
                    .run_blocking(move |store| store.mark_completed(&owned, fingerprint, &detail))
                    .await?;
                self.notifier.notify(Event::for_file(
                    EventKind::Completed,
                    path,
                    FileStatus::Completed,
                    reason,
                ));
                Ok(JobOutcome::Completed)
            }
            Err(Exit::Skip(reason)) => {
                let detail = reason.clone();
                self.store
                    .run_blocking(move |store| store.mark_skipped(&owned, &detail))
                    .await?;
                self.notifier.notify(Event::for_file(
                    EventKind::Skipped,
                    path,
                    FileStatus::Skipped,
                    reason.clone(),
                ));
                Ok(JobOutcome::Skipped { reason })
            }
            Err(Exit::WouldProcess(reason)) => {
                let detail = reason.clone();
                self.store
                    .run_blocking(move |store| store.mark_would_process(&owned, &detail))
                    .await?;
                Ok(JobOutcome::WouldProcess { reason })
            }
            Err(Exit::Transient(reason)) => {
                let detail = reason.clone();
                self.store
                    .run_blocking(move |store| store.release(&owned, &detail))
                    .await?;
                Ok(JobOutcome::Released { reason })
            }
            Err(Exit::Fail(reason, kind)) => {
                let detail = reason.clone();
                let disposition = self
                    .store
                    .run_blocking(move |store| store.mark_failed(&owned, &detail, kind))
                    .await?;
                let retry_at = match disposition {
                    FailureDisposition::Retry { at } => Some(at),
                    FailureDisposition::Terminal => {
                        self.notifier.notify(Event::for_file(
                            EventKind::Failed,
                            path,
                            FileStatus::Failed,
                            reason.clone(),
                        ));
                        None
                    }
                };
                Ok(JobOutcome::Failed { reason, retry_at })
            }
        }
    }
}

fn output_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}
