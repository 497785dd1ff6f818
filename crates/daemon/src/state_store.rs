//! Durable state store with compare-and-swap status transitions.
//!
//! All records live in memory behind a mutex and are written to
//! `<state_dir>/state.json` after every mutation (temp file + rename), so a
//! crash leaves either the previous or the new state on disk, never a torn file.
//! Methods block on that write; async callers go through
//! [`StateStore::run_blocking`]. The store is the only place a [`MediaFile`]
//! is mutated.

use crate::media::{
    retry_backoff, FailureKind, FileStatus, Fingerprint, LayerKind, MediaFile, RetryPolicy,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const STATE_FILE_NAME: &str = "state.json";
const STATE_FILE_VERSION: u32 = 1;
/// Records fetched per store read by [`PendingIter`].
const PENDING_PAGE_SIZE: usize = 256;

/// Error type for state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("State file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("State file could not be decoded: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("No record for {}", .0.display())]
    NotFound(PathBuf),

    #[error("Cannot move {} from {actual}: expected {expected}", path.display())]
    InvalidTransition {
        path: PathBuf,
        expected: FileStatus,
        actual: FileStatus,
    },

    #[error("State store lock poisoned")]
    Poisoned,

    #[error("State store task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// On-disk wrapper. Unknown future fields are ignored, missing ones default.
#[derive(Debug, Deserialize)]
struct StateFile {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    files: Vec<MediaFile>,
}

/// Borrowing twin of [`StateFile`] so a write never copies the records.
#[derive(Serialize)]
struct StateFileRef<'a> {
    version: u32,
    files: Vec<&'a MediaFile>,
}

fn default_version() -> u32 {
    STATE_FILE_VERSION
}

/// Result of registering an observation of a file on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First time this path was seen.
    Inserted,
    /// Fingerprint changed; the record was reset to Pending.
    Invalidated,
    /// Skipped or would-process record returned to Pending by a full scan.
    Revalidated,
    /// Nothing changed.
    Unchanged,
}

/// What `mark_failed` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Claimable again once `at` has passed.
    Retry { at: DateTime<Utc> },
    /// Attempt budget exhausted.
    Terminal,
}

/// Persistent record of every known media file.
pub struct StateStore {
    file_path: PathBuf,
    records: Mutex<BTreeMap<PathBuf, MediaFile>>,
    retry: RetryPolicy,
}

impl StateStore {
    /// Open (or create) the store in `state_dir`.
    pub fn open(state_dir: &Path, retry: RetryPolicy) -> Result<Self, StoreError> {
        fs::create_dir_all(state_dir)?;
        let file_path = state_dir.join(STATE_FILE_NAME);

        let records = load_records(&file_path)?;

        info!(
            path = %file_path.display(),
            records = records.len(),
            "Opened state store"
        );

        Ok(Self {
            file_path,
            records: Mutex::new(records),
            retry,
        })
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<PathBuf, MediaFile>>, StoreError> {
        self.records.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run blocking store calls on the blocking thread pool.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StateStore) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&store)).await?
    }

    fn persist(&self, records: &BTreeMap<PathBuf, MediaFile>) -> Result<(), StoreError> {
        let state = StateFileRef {
            version: STATE_FILE_VERSION,
            files: records.values().collect(),
        };
        let json = serde_json::to_vec(&state)?;
        write_atomic(&self.file_path, &json)?;
        Ok(())
    }

    /// Apply `f` to the records and persist. On persistence failure the
    /// records are reloaded from the last good file so memory never runs
    /// ahead of disk.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<PathBuf, MediaFile>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut records = self.lock()?;
        let value = f(&mut records)?;
        if let Err(e) = self.persist(&records) {
            self.roll_back(&mut records);
            return Err(e);
        }
        Ok(value)
    }

    fn roll_back(&self, records: &mut BTreeMap<PathBuf, MediaFile>) {
        match load_records(&self.file_path) {
            Ok(on_disk) => *records = on_disk,
            Err(e) => error!("State rollback failed; memory may be ahead of disk: {}", e),
        }
    }

    /// Apply `f` to the record at `path`, which must currently be Processing.
    fn transition<T>(
        &self,
        path: &Path,
        f: impl FnOnce(&mut MediaFile) -> T,
    ) -> Result<T, StoreError> {
        self.mutate(|records| {
            let file = records
                .get_mut(path)
                .ok_or_else(|| StoreError::NotFound(path.to_path_buf()))?;
            if file.status != FileStatus::Processing {
                return Err(StoreError::InvalidTransition {
                    path: path.to_path_buf(),
                    expected: FileStatus::Processing,
                    actual: file.status,
                });
            }
            Ok(f(file))
        })
    }

    pub fn get(&self, path: &Path) -> Result<Option<MediaFile>, StoreError> {
        Ok(self.lock()?.get(path).cloned())
    }

    /// All records ordered by path.
    pub fn snapshot(&self) -> Result<Vec<MediaFile>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    pub fn len(&self) -> Result<usize, StoreError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.lock()?.is_empty())
    }

    /// Idempotent create-or-update by path.
    ///
    /// A new path is inserted as given. For a known path only the fingerprint
    /// is considered: a changed fingerprint resets the record to Pending. A
    /// record currently held in Processing is never touched.
    pub fn upsert(&self, file: MediaFile) -> Result<UpsertOutcome, StoreError> {
        let now = Utc::now();
        self.mutate(|records| {
            let path = file.path.clone();
            let fingerprint = file.fingerprint;
            Ok(apply_observation(records, path, fingerprint, false, now, Some(file)))
        })
    }

    /// Register a batch of scan observations with a single write.
    ///
    /// With `revalidate`, Skipped and would-process records whose fingerprint
    /// is unchanged are also returned to Pending.
    pub fn observe_batch(
        &self,
        observations: &[(PathBuf, Fingerprint)],
        revalidate: bool,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let now = Utc::now();
        self.mutate(|records| {
            Ok(observations
                .iter()
                .map(|(path, fp)| {
                    apply_observation(records, path.clone(), *fp, revalidate, now, None)
                })
                .collect())
        })
    }

    /// Atomically move `path` from Pending (or a due retryable Failed) to
    /// Processing. Returns false if the record is in any other state,
    /// including Processing held by another worker.
    pub fn claim_processing(&self, path: &Path) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut records = self.lock()?;
        let Some(file) = records.get_mut(path) else {
            return Ok(false);
        };
        if !file.is_claimable(now) {
            return Ok(false);
        }

        let previous = file.clone();
        file.status = FileStatus::Processing;
        file.last_attempt_at = Some(now);
        file.next_retry_at = None;
        if let Err(e) = self.persist(&records) {
            records.insert(path.to_path_buf(), previous);
            return Err(e);
        }

        debug!(path = %path.display(), "Claimed for processing");
        Ok(true)
    }

    /// Store what the prober found for a claimed file.
    pub fn record_probe(
        &self,
        path: &Path,
        profile: Option<u8>,
        layer: LayerKind,
    ) -> Result<(), StoreError> {
        self.transition(path, |file| {
            file.profile = profile;
            file.layer = layer;
        })
    }

    /// Processing -> Completed. `fingerprint` is that of the replaced file,
    /// so the next scan sees it as unchanged. `reason` says what was done.
    pub fn mark_completed(
        &self,
        path: &Path,
        fingerprint: Fingerprint,
        reason: &str,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        self.transition(path, |file| {
            file.status = FileStatus::Completed;
            file.fingerprint = fingerprint;
            file.completed_at = Some(now);
            file.last_error = Some(reason.to_string());
            file.next_retry_at = None;
            file.profile = Some(8);
        })?;
        info!(path = %path.display(), reason, "Marked completed");
        Ok(())
    }

    /// Processing -> Failed, consuming one attempt.
    pub fn mark_failed(
        &self,
        path: &Path,
        reason: &str,
        kind: FailureKind,
    ) -> Result<FailureDisposition, StoreError> {
        let now = Utc::now();
        let retry = self.retry;
        let disposition = self.transition(path, |file| {
            file.status = FileStatus::Failed;
            file.attempts += 1;
            file.last_error = Some(reason.to_string());
            file.last_failure = Some(kind);

            if file.attempts >= retry.cap_for(kind) {
                file.next_retry_at = None;
                FailureDisposition::Terminal
            } else {
                let backoff =
                    retry_backoff(file.attempts, retry.backoff_base_secs, retry.backoff_max_secs);
                let at = now.checked_add_signed(backoff).unwrap_or(DateTime::<Utc>::MAX_UTC);
                file.next_retry_at = Some(at);
                FailureDisposition::Retry { at }
            }
        })?;

        warn!(
            path = %path.display(),
            reason,
            ?kind,
            ?disposition,
            "Marked failed"
        );
        Ok(disposition)
    }

    /// Processing -> Skipped. Never consumes an attempt.
    pub fn mark_skipped(&self, path: &Path, reason: &str) -> Result<(), StoreError> {
        self.transition(path, |file| {
            file.status = FileStatus::Skipped;
            file.last_error = Some(reason.to_string());
            file.next_retry_at = None;
        })?;
        info!(path = %path.display(), reason, "Marked skipped");
        Ok(())
    }

    /// Processing -> WouldProcess (dry-run terminal marker).
    pub fn mark_would_process(&self, path: &Path, reason: &str) -> Result<(), StoreError> {
        self.transition(path, |file| {
            file.status = FileStatus::WouldProcess;
            file.last_error = Some(reason.to_string());
            file.next_retry_at = None;
        })?;
        info!(path = %path.display(), reason, "Dry run: would process");
        Ok(())
    }

    /// Processing -> Pending for a transient abort. The attempt count is kept.
    pub fn release(&self, path: &Path, reason: &str) -> Result<(), StoreError> {
        self.transition(path, |file| {
            file.status = FileStatus::Pending;
            file.last_error = Some(reason.to_string());
        })?;
        info!(path = %path.display(), reason, "Released claim (transient)");
        Ok(())
    }

    /// Startup recovery: every Processing record is orphaned because workers
    /// are process-local. Each goes back to Pending if attempts remain, else to
    /// terminal Failed. Returns the recovered paths.
    pub fn recover_orphans(&self) -> Result<Vec<PathBuf>, StoreError> {
        let max_attempts = self.retry.max_attempts;
        let recovered = self.mutate(|records| {
            let mut recovered = Vec::new();
            for file in records.values_mut() {
                if file.status != FileStatus::Processing {
                    continue;
                }
                if file.attempts < max_attempts {
                    file.status = FileStatus::Pending;
                    file.last_error = Some("interrupted by restart".to_string());
                } else {
                    file.status = FileStatus::Failed;
                    file.next_retry_at = None;
                    file.last_error = Some(
                        "interrupted by restart with no attempts remaining".to_string(),
                    );
                }
                recovered.push(file.path.clone());
            }
            Ok(recovered)
        })?;

        if !recovered.is_empty() {
            warn!(count = recovered.len(), "Recovered orphaned Processing records");
        }
        Ok(recovered)
    }

    /// Return every would-process marker to Pending. Used when the daemon
    /// starts with dry-run disabled.
    pub fn reset_would_process(&self) -> Result<usize, StoreError> {
        self.mutate(|records| {
            let mut count = 0;
            for file in records.values_mut() {
                if file.status == FileStatus::WouldProcess {
                    file.status = FileStatus::Pending;
                    file.last_error = None;
                    count += 1;
                }
            }
            Ok(count)
        })
    }

    /// Drop records whose file no longer exists. Processing records stay.
    pub fn remove_missing(
        &self,
        exists: impl Fn(&Path) -> bool,
    ) -> Result<Vec<PathBuf>, StoreError> {
        self.mutate(|records| {
            let missing: Vec<PathBuf> = records
                .values()
                .filter(|f| f.status != FileStatus::Processing && !exists(&f.path))
                .map(|f| f.path.clone())
                .collect();
            for path in &missing {
                records.remove(path);
            }
            Ok(missing)
        })
    }

    /// Lazy sequence of claimable records ordered by discovery time.
    ///
    /// The cursor reads the store a page at a time and re-checks each record
    /// before yielding it, so records claimed meanwhile are left out. Records
    /// added while iterating are picked up if they sort after the page.
    pub fn list_pending(self: &Arc<Self>) -> PendingIter {
        PendingIter {
            store: Arc::clone(self),
            after: None,
            page: VecDeque::new(),
        }
    }

    /// Up to `limit` claimable records sorting after `after`.
    fn pending_page(
        &self,
        after: Option<&(DateTime<Utc>, PathBuf)>,
        limit: usize,
    ) -> Result<VecDeque<MediaFile>, StoreError> {
        let now = Utc::now();
        let records = self.lock()?;
        let mut page: Vec<&MediaFile> = records
            .values()
            .filter(|f| f.is_claimable(now))
            .filter(|f| match after {
                Some((ts, path)) => (f.discovered_at, &f.path) > (*ts, path),
                None => true,
            })
            .collect();
        page.sort_unstable_by(|a, b| (a.discovered_at, &a.path).cmp(&(b.discovered_at, &b.path)));
        Ok(page.into_iter().take(limit).cloned().collect())
    }

    fn still_claimable(&self, path: &Path) -> Result<Option<MediaFile>, StoreError> {
        let now = Utc::now();
        Ok(self
            .lock()?
            .get(path)
            .filter(|f| f.is_claimable(now))
            .cloned())
    }
}

/// Cursor over pending records; see [`StateStore::list_pending`].
pub struct PendingIter {
    store: Arc<StateStore>,
    after: Option<(DateTime<Utc>, PathBuf)>,
    page: VecDeque<MediaFile>,
}

impl PendingIter {
    /// Start again from the oldest pending record.
    pub fn restart(&mut self) {
        self.after = None;
        self.page.clear();
    }

    fn next_result(&mut self) -> Result<Option<MediaFile>, StoreError> {
        loop {
            if self.page.is_empty() {
                self.page = self.store.pending_page(self.after.as_ref(), PENDING_PAGE_SIZE)?;
            }
            let Some(candidate) = self.page.pop_front() else {
                return Ok(None);
            };
            self.after = Some((candidate.discovered_at, candidate.path.clone()));
            if let Some(file) = self.store.still_claimable(&candidate.path)? {
                return Ok(Some(file));
            }
        }
    }
}

impl Iterator for PendingIter {
    type Item = MediaFile;

    fn next(&mut self) -> Option<MediaFile> {
        match self.next_result() {
            Ok(file) => file,
            Err(e) => {
                warn!("Pending iteration stopped: {}", e);
                None
            }
        }
    }
}

/// Read the records persisted at `file_path`; a missing file is empty.
fn load_records(file_path: &Path) -> Result<BTreeMap<PathBuf, MediaFile>, StoreError> {
    let mut records = BTreeMap::new();
    if !file_path.exists() {
        return Ok(records);
    }
    let content = fs::read(file_path)?;
    let state: StateFile = serde_json::from_slice(&content)?;
    if state.version > STATE_FILE_VERSION {
        warn!(
            version = state.version,
            "State file written by a newer version; unknown fields are ignored"
        );
    }
    for file in state.files {
        records.insert(file.path.clone(), file);
    }
    Ok(records)
}

fn apply_observation(
    records: &mut BTreeMap<PathBuf, MediaFile>,
    path: PathBuf,
    fingerprint: Fingerprint,
    revalidate: bool,
    now: DateTime<Utc>,
    template: Option<MediaFile>,
) -> UpsertOutcome {
    match records.get_mut(&path) {
        None => {
            let file = template.unwrap_or_else(|| MediaFile::new(path.clone(), fingerprint, now));
            records.insert(path, file);
            UpsertOutcome::Inserted
        }
        Some(file) if file.status == FileStatus::Processing => UpsertOutcome::Unchanged,
        Some(file) if file.fingerprint != fingerprint => {
            debug!(path = %path.display(), previous = %file.status, "Fingerprint changed");
            file.invalidate(fingerprint);
            UpsertOutcome::Invalidated
        }
        Some(file)
            if revalidate
                && matches!(file.status, FileStatus::Skipped | FileStatus::WouldProcess) =>
        {
            file.status = FileStatus::Pending;
            file.last_error = None;
            UpsertOutcome::Revalidated
        }
        Some(_) => UpsertOutcome::Unchanged,
    }
}

/// Write `bytes` to `path` via a sibling temp file and a rename.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        use std::io::Write;
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
