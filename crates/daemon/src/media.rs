//! Media file records tracked by the state store.
//!
//! A [`MediaFile`] is keyed by its absolute path and carries everything the
//! scheduler and pipeline need to decide whether the file should be (re)processed.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::PathBuf;
use std::time::UNIX_EPOCH;

/// Cheap change detector: size plus modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size_bytes: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: i64,
}

impl Fingerprint {
    pub fn new(size_bytes: u64, modified_ms: i64) -> Self {
        Self {
            size_bytes,
            modified_ms,
        }
    }

    pub fn from_metadata(metadata: &Metadata) -> Self {
        let modified_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        Self::new(metadata.len(), modified_ms)
    }

    pub fn of_path(path: &std::path::Path) -> std::io::Result<Self> {
        Ok(Self::from_metadata(&std::fs::metadata(path)?))
    }
}

/// Dual-layer variant of a profile 7 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    /// No enhancement layer (or not probed yet).
    #[default]
    None,
    /// Minimal enhancement layer; conversion is lossless.
    Mel,
    /// Full enhancement layer; conversion discards picture data.
    Fel,
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LayerKind::None => write!(f, "none"),
            LayerKind::Mel => write!(f, "MEL"),
            LayerKind::Fel => write!(f, "FEL"),
        }
    }
}

/// Processing status of a media file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Waiting for a worker.
    #[default]
    Pending,
    /// Claimed by exactly one worker.
    Processing,
    /// Converted and replaced.
    Completed,
    /// Failed; retryable while `next_retry_at` is set.
    Failed,
    /// Ineligible; not retried until its fingerprint changes or a full scan.
    Skipped,
    /// Dry-run marker: the file would have been converted.
    WouldProcess,
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileStatus::Pending => write!(f, "pending"),
            FileStatus::Processing => write!(f, "processing"),
            FileStatus::Completed => write!(f, "completed"),
            FileStatus::Failed => write!(f, "failed"),
            FileStatus::Skipped => write!(f, "skipped"),
            FileStatus::WouldProcess => write!(f, "would_process"),
        }
    }
}

/// How a failure counts against the attempt budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-zero exit or implausible output from a tool.
    Tool,
    /// Output verified with the wrong profile.
    Integrity,
}

/// Durable record of one file. Owned by the state store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaFile {
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub profile: Option<u8>,
    #[serde(default)]
    pub layer: LayerKind,
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a Failed record may be claimed again; `None` on a
    /// Failed record means the failure is terminal.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<FailureKind>,
}

impl MediaFile {
    pub fn new(path: PathBuf, fingerprint: Fingerprint, now: DateTime<Utc>) -> Self {
        Self {
            path,
            fingerprint,
            profile: None,
            layer: LayerKind::None,
            status: FileStatus::Pending,
            attempts: 0,
            last_error: None,
            discovered_at: now,
            last_attempt_at: None,
            completed_at: None,
            next_retry_at: None,
            last_failure: None,
        }
    }

    /// True when `claim_processing` would succeed at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            FileStatus::Pending => true,
            FileStatus::Failed => self.next_retry_at.is_some_and(|t| t <= now),
            _ => false,
        }
    }

    /// True for a Failed record that will never be retried.
    pub fn is_terminal_failure(&self) -> bool {
        self.status == FileStatus::Failed && self.next_retry_at.is_none()
    }

    /// Return the record to a fresh Pending state after its content changed.
    pub fn invalidate(&mut self, fingerprint: Fingerprint) {
        self.fingerprint = fingerprint;
        self.status = FileStatus::Pending;
        self.attempts = 0;
        self.last_error = None;
        self.completed_at = None;
        self.next_retry_at = None;
        self.last_failure = None;
        self.profile = None;
        self.layer = LayerKind::None;
    }
}

/// Upper bound on any retry delay, whatever the configuration says.
pub const MAX_BACKOFF_SECS: u64 = 365 * 24 * 60 * 60;

/// Exponential retry delay: `min(base * 2^(attempts-1), max)`, never more
/// than [`MAX_BACKOFF_SECS`].
pub fn retry_backoff(attempts: u32, base_secs: u64, max_secs: u64) -> Duration {
    let exponent = attempts.saturating_sub(1).min(32);
    let secs = base_secs
        .saturating_mul(1u64 << exponent)
        .min(max_secs)
        .min(MAX_BACKOFF_SECS);
    Duration::seconds(secs as i64)
}

/// Retry policy applied by `mark_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Tool-failure attempts before the failure is terminal.
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 30,
        }
    }
}

impl RetryPolicy {
    /// Attempt cap for a failure kind. Integrity failures get one retry.
    pub fn cap_for(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Tool => self.max_attempts,
            FailureKind::Integrity => self.max_attempts.min(2),
        }
    }
}
