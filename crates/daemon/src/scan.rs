//! Library scanner.
//!
//! Walks the configured roots, fingerprints every media file and registers the
//! observations with the state store. The returned candidates are the paths
//! that are claimable afterwards, in lexicographic order.

use crate::media::Fingerprint;
use crate::state_store::{StateStore, StoreError, UpsertOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One year.
const MAX_LOOKBACK_MINUTES: u64 = 525_600;

/// Error type for scans.
#[derive(Debug, Error)]
pub enum ScanError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Scan task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanKind {
    /// New or changed files only.
    Delta,
    /// Also revalidates Skipped records and drops records of deleted files.
    Full,
}

impl std::fmt::Display for ScanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanKind::Delta => write!(f, "delta"),
            ScanKind::Full => write!(f, "full"),
        }
    }
}

/// Summary of one scan.
#[derive(Debug, Clone)]
pub struct ScanRun {
    pub id: Uuid,
    pub kind: ScanKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Media files seen on disk (including recent imports).
    pub discovered: usize,
    /// Seen files that were claimable after the scan.
    pub candidates: usize,
    /// Candidates the worker pool accepted. Candidates already queued are
    /// not counted; filled in by whoever hands them to the pool.
    pub enqueued: usize,
    /// Seen files that were not candidates.
    pub skipped: usize,
    /// Records dropped because their file is gone (full scans only).
    pub removed: usize,
}

impl ScanRun {
    fn start(kind: ScanKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            started_at: Utc::now(),
            finished_at: None,
            discovered: 0,
            candidates: 0,
            enqueued: 0,
            skipped: 0,
            removed: 0,
        }
    }
}

/// Source of recently imported paths, e.g. a media manager's history API.
#[async_trait]
pub trait RecentImports: Send + Sync {
    async fn list_recent_imports(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<PathBuf>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Checks if a file has one of `extensions` (case-insensitive, without dot).
pub fn has_media_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// Recursively list media files under `roots` with their fingerprints.
///
/// Hidden directories and hidden files are skipped; missing roots are
/// logged and ignored. The result is sorted by path.
pub fn walk_roots(roots: &[PathBuf], extensions: &[String]) -> Vec<(PathBuf, Fingerprint)> {
    use walkdir::WalkDir;

    let mut found = Vec::new();

    for root in roots {
        if !root.exists() {
            warn!(root = %root.display(), "Media root does not exist");
            continue;
        }

        let walker = WalkDir::new(root).into_iter().filter_entry(|entry| {
            // The root itself may be hidden.
            entry.depth() == 0
                || !entry
                    .file_name()
                    .to_str()
                    .is_some_and(|name| name.starts_with('.'))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !has_media_extension(entry.path(), extensions) {
                continue;
            }
            if let Ok(metadata) = entry.metadata() {
                found.push((entry.into_path(), Fingerprint::from_metadata(&metadata)));
            }
        }
    }

    found.sort_by(|a, b| a.0.cmp(&b.0));
    found.dedup_by(|a, b| a.0 == b.0);
    found
}

/// Produces candidate sets for the worker pool.
pub struct LibraryScanner {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    store: Arc<StateStore>,
    imports: Option<Arc<dyn RecentImports>>,
    lookback: chrono::Duration,
}

impl LibraryScanner {
    pub fn new(roots: Vec<PathBuf>, extensions: Vec<String>, store: Arc<StateStore>) -> Self {
        Self {
            roots,
            extensions,
            store,
            imports: None,
            lookback: chrono::Duration::minutes(60),
        }
    }

    /// Merge recent imports from `imports` into every delta scan.
    pub fn with_recent_imports(
        mut self,
        imports: Arc<dyn RecentImports>,
        lookback_minutes: u64,
    ) -> Self {
        self.imports = Some(imports);
        self.lookback = chrono::Duration::minutes(lookback_minutes.min(MAX_LOOKBACK_MINUTES) as i64);
        self
    }

    /// Run one scan. Returns the summary and the candidates.
    pub async fn scan(&self, kind: ScanKind) -> Result<(ScanRun, Vec<PathBuf>), ScanError> {
        let mut run = ScanRun::start(kind);
        info!(scan_id = %run.id, %kind, "Scan started");

        let roots = self.roots.clone();
        let extensions = self.extensions.clone();
        let mut observations =
            tokio::task::spawn_blocking(move || walk_roots(&roots, &extensions)).await?;

        if kind == ScanKind::Delta {
            self.merge_recent_imports(&mut observations, run.started_at).await;
        }
        run.discovered = observations.len();

        let store = self.store.clone();
        let (removed, candidates) =
            tokio::task::spawn_blocking(move || register(&store, &observations, kind)).await??;
        for path in &removed {
            info!(path = %path.display(), "Dropped record of missing file");
        }
        run.removed = removed.len();

        run.candidates = candidates.len();
        run.skipped = run.discovered - run.candidates;
        run.finished_at = Some(Utc::now());

        info!(
            scan_id = %run.id,
            %kind,
            discovered = run.discovered,
            candidates = run.candidates,
            skipped = run.skipped,
            removed = run.removed,
            "Scan finished"
        );
        Ok((run, candidates))
    }

    async fn merge_recent_imports(
        &self,
        observations: &mut Vec<(PathBuf, Fingerprint)>,
        now: DateTime<Utc>,
    ) {
        let Some(imports) = &self.imports else {
            return;
        };
        let paths = match imports.list_recent_imports(now - self.lookback).await {
            Ok(paths) => paths,
            Err(e) => {
                warn!("Recent imports unavailable: {}", e);
                return;
            }
        };

        let known: BTreeSet<PathBuf> = observations.iter().map(|(p, _)| p.clone()).collect();
        for path in paths {
            if known.contains(&path) || !has_media_extension(&path, &self.extensions) {
                continue;
            }
            match Fingerprint::of_path(&path) {
                Ok(fp) => {
                    debug!(path = %path.display(), "Merged recent import");
                    observations.push((path, fp));
                }
                Err(e) => debug!(path = %path.display(), "Recent import not readable: {}", e),
            }
        }
        observations.sort_by(|a, b| a.0.cmp(&b.0));
    }
}

/// Record `observations` in the store and return the dropped paths and the
/// claimable candidates. Runs on a blocking thread since every store write
/// hits the disk.
fn register(
    store: &StateStore,
    observations: &[(PathBuf, Fingerprint)],
    kind: ScanKind,
) -> Result<(Vec<PathBuf>, Vec<PathBuf>), StoreError> {
    let outcomes = store.observe_batch(observations, kind == ScanKind::Full)?;
    for ((path, _), outcome) in observations.iter().zip(&outcomes) {
        if *outcome != UpsertOutcome::Unchanged {
            debug!(path = %path.display(), ?outcome, "Observed");
        }
    }

    let removed = if kind == ScanKind::Full {
        store.remove_missing(|p| p.exists())?
    } else {
        Vec::new()
    };

    let now = Utc::now();
    let mut candidates = Vec::new();
    for (path, _) in observations {
        if store.get(path)?.is_some_and(|file| file.is_claimable(now)) {
            candidates.push(path.clone());
        }
    }
    candidates.sort();
    Ok((removed, candidates))
}
