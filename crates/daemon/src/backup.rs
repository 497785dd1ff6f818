//! Pre-replace backups and the final rename.
//!
//! A backup is a full copy of the original made before anything destructive
//! happens. The copy is written under a temporary name and linked into place,
//! so a backup path never references a partial copy and an existing file is
//! never replaced. Records are kept in
//! `<state_dir>/backups.json` and pruned once past retention, but only for
//! files that reached Completed.

use crate::media::FileStatus;
use crate::state_store::{write_atomic, StateStore, StoreError};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const BACKUP_LEDGER_NAME: &str = "backups.json";
const MAX_RETENTION_DAYS: u64 = 36_500;
/// Hex digits of a random id appended to every backup name.
const BACKUP_TAG_LEN: usize = 8;

/// Errors that can occur while backing up or replacing a file.
#[derive(Debug, Error)]
pub enum BackupError {
    /// Copying the original failed; the original is untouched.
    #[error("Failed to create backup of {}: {source}", original.display())]
    CopyFailed {
        original: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Another file already occupies the backup path.
    #[error("Backup path {} already exists", backup.display())]
    AlreadyExists { backup: PathBuf },

    /// The copy does not match the original's size.
    #[error("Backup of {} is incomplete ({written} of {expected} bytes)", original.display())]
    Incomplete {
        original: PathBuf,
        expected: u64,
        written: u64,
    },

    /// The final rename failed; the original is untouched.
    #[error("Failed to rename {} into place: {source}", partial.display())]
    RenameFailed {
        partial: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Backup ledger I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Backup ledger could not be decoded: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Backup ledger lock poisoned")]
    Poisoned,
}

/// One backup owned by the manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub original: PathBuf,
    pub backup: PathBuf,
    pub created_at: DateTime<Utc>,
    pub retain_until: DateTime<Utc>,
}

/// Generates the backup path for `original`: `<name>.bak.<unix seconds>.<tag>`,
/// next to the original or inside `dir` when one is configured. Same-named
/// files from different directories share `dir`, so `tag` must be unique
/// per backup.
pub fn backup_path(original: &Path, dir: Option<&Path>, now: DateTime<Utc>, tag: &str) -> PathBuf {
    let file_name = original
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    let mut name = file_name;
    name.push(format!(".bak.{}.{}", now.timestamp(), tag));

    match dir {
        Some(dir) => dir.join(name),
        None => original.with_file_name(name),
    }
}

/// Creates, records and prunes backups.
pub struct BackupManager {
    ledger_path: PathBuf,
    dir: Option<PathBuf>,
    retention: Duration,
    records: Mutex<Vec<BackupRecord>>,
}

impl BackupManager {
    /// Load the ledger from `state_dir`.
    pub fn open(
        state_dir: &Path,
        dir: Option<PathBuf>,
        retention_days: u64,
    ) -> Result<Self, BackupError> {
        fs::create_dir_all(state_dir)?;
        if let Some(dir) = &dir {
            fs::create_dir_all(dir)?;
        }
        let ledger_path = state_dir.join(BACKUP_LEDGER_NAME);
        let records: Vec<BackupRecord> = if ledger_path.exists() {
            serde_json::from_str(&fs::read_to_string(&ledger_path)?)?
        } else {
            Vec::new()
        };

        debug!(
            path = %ledger_path.display(),
            records = records.len(),
            "Opened backup ledger"
        );

        Ok(Self {
            ledger_path,
            dir,
            retention: Duration::days(retention_days.min(MAX_RETENTION_DAYS) as i64),
            records: Mutex::new(records),
        })
    }

    pub fn records(&self) -> Result<Vec<BackupRecord>, BackupError> {
        Ok(self.records.lock().map_err(|_| BackupError::Poisoned)?.clone())
    }

    /// True if the ledger holds a backup of `original`.
    pub fn has_backup(&self, original: &Path) -> Result<bool, BackupError> {
        let records = self.records.lock().map_err(|_| BackupError::Poisoned)?;
        Ok(records.iter().any(|r| r.original == original))
    }

    fn persist(&self, records: &[BackupRecord]) -> Result<(), BackupError> {
        let json = serde_json::to_string_pretty(records)?;
        write_atomic(&self.ledger_path, json.as_bytes())?;
        Ok(())
    }

    /// Copy `original` to its backup location and record it.
    ///
    /// On error the original is untouched and no record exists.
    pub fn backup(&self, original: &Path) -> Result<BackupRecord, BackupError> {
        let now = Utc::now();
        let tag = Uuid::new_v4().simple().to_string();
        let backup = backup_path(original, self.dir.as_deref(), now, &tag[..BACKUP_TAG_LEN]);

        let mut partial = backup.as_os_str().to_owned();
        partial.push(".partial");
        let partial = PathBuf::from(partial);

        let copy_failed = |source| BackupError::CopyFailed {
            original: original.to_path_buf(),
            source,
        };

        let expected = fs::metadata(original).map_err(copy_failed)?.len();
        let written = match fs::copy(original, &partial) {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(copy_failed(e));
            }
        };
        if written != expected {
            let _ = fs::remove_file(&partial);
            return Err(BackupError::Incomplete {
                original: original.to_path_buf(),
                expected,
                written,
            });
        }
        if let Err(e) = fs::File::open(&partial).and_then(|f| f.sync_all()) {
            let _ = fs::remove_file(&partial);
            return Err(copy_failed(e));
        }

        let mut records = self.records.lock().map_err(|_| BackupError::Poisoned)?;
        if let Err(e) = place_new(&partial, &backup) {
            let _ = fs::remove_file(&partial);
            return Err(match e.kind() {
                io::ErrorKind::AlreadyExists => BackupError::AlreadyExists { backup },
                _ => copy_failed(e),
            });
        }

        let record = BackupRecord {
            original: original.to_path_buf(),
            backup,
            created_at: now,
            retain_until: now + self.retention,
        };
        records.push(record.clone());
        if let Err(e) = self.persist(&records) {
            records.pop();
            let _ = fs::remove_file(&record.backup);
            return Err(e);
        }

        info!(
            original = %original.display(),
            backup = %record.backup.display(),
            "Created backup"
        );
        Ok(record)
    }

    /// Remove backups past retention whose file is Completed.
    ///
    /// Records of files in any other status, or unknown to the store, are
    /// kept regardless of age. Returns the number pruned.
    pub fn prune(&self, store: &StateStore) -> Result<usize, BackupError> {
        self.prune_at(store, Utc::now())
    }

    pub(crate) fn prune_at(
        &self,
        store: &StateStore,
        now: DateTime<Utc>,
    ) -> Result<usize, BackupError> {
        let mut records = self.records.lock().map_err(|_| BackupError::Poisoned)?;
        let before = records.len();
        let mut kept = Vec::with_capacity(before);

        for record in records.drain(..) {
            if now < record.retain_until {
                kept.push(record);
                continue;
            }
            let completed = store
                .get(&record.original)?
                .is_some_and(|f| f.status == FileStatus::Completed);
            if !completed {
                kept.push(record);
                continue;
            }
            match fs::remove_file(&record.backup) {
                Ok(()) => info!(backup = %record.backup.display(), "Pruned backup"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(backup = %record.backup.display(), "Backup already gone")
                }
                Err(e) => {
                    warn!(backup = %record.backup.display(), "Failed to prune backup: {}", e);
                    kept.push(record);
                }
            }
        }

        let pruned = before - kept.len();
        *records = kept;
        if pruned > 0 {
            self.persist(&records)?;
        }
        Ok(pruned)
    }
}

/// Move the finished copy at `partial` to `target` without ever replacing an
/// existing file. A hard link fails on an existing target; where links are
/// unsupported an existence check guards the rename instead.
fn place_new(partial: &Path, target: &Path) -> io::Result<()> {
    match fs::hard_link(partial, target) {
        Ok(()) => {
            if let Err(e) = fs::remove_file(partial) {
                warn!(path = %partial.display(), "Failed to remove linked backup copy: {}", e);
            }
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
        Err(e) => {
            debug!(target = %target.display(), "Hard link unavailable ({}); renaming", e);
            if target.exists() {
                return Err(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("{} exists", target.display()),
                ));
            }
            fs::rename(partial, target)
        }
    }
}

/// Move the finished output over the original with a single rename.
///
/// Both paths must be on the same filesystem; the original name references
/// either the old or the new file at every instant.
pub fn replace_atomically(partial: &Path, original: &Path) -> Result<(), BackupError> {
    fs::rename(partial, original).map_err(|source| BackupError::RenameFailed {
        partial: partial.to_path_buf(),
        source,
    })
}
