//! Scan scheduling.
//!
//! Two triggers feed one scan queue: a fixed delta interval and a weekly
//! full-scan slot. A single runner task drains the queue, so only one scan
//! walks the library at a time. Scans only enqueue candidates; conversion
//! throughput is the worker pool's business.

use crate::backup::BackupManager;
use crate::config::{parse_time_of_day, parse_weekday, ScheduleConfig};
use crate::scan::{LibraryScanner, ScanError, ScanKind, ScanRun};
use crate::state_store::StateStore;
use crate::worker_pool::PoolHandle;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Local, NaiveDate, TimeZone};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pending scan requests. The gate keeps at most one delta queued.
const SCAN_QUEUE_DEPTH: usize = 4;

const WEEKDAY_NAMES: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("Invalid full-scan day: {0}")]
    InvalidDay(String),

    #[error("Invalid full-scan time (expected HH:MM): {0}")]
    InvalidTime(String),

    #[error("Invalid delta interval: {0} minutes")]
    InvalidInterval(u64),
}

/// Weekly full-scan slot in local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullScanSchedule {
    /// Days from Monday.
    weekday: u32,
    hour: u32,
    minute: u32,
}

impl FullScanSchedule {
    pub fn parse(day: &str, time: &str) -> Result<Self, ScheduleError> {
        let weekday = parse_weekday(day).ok_or_else(|| ScheduleError::InvalidDay(day.to_string()))?;
        let (hour, minute) =
            parse_time_of_day(time).ok_or_else(|| ScheduleError::InvalidTime(time.to_string()))?;
        Ok(Self {
            weekday,
            hour,
            minute,
        })
    }

    /// First slot strictly after `now`, in the same time zone.
    pub fn next_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        let tz = now.timezone();
        let today = now.date_naive();
        for offset in 0..=7 {
            let date = today + ChronoDuration::days(offset);
            if date.weekday().num_days_from_monday() != self.weekday {
                continue;
            }
            if let Some(at) = self.resolve(&tz, date) {
                if at > *now {
                    return at;
                }
            }
        }
        now.clone() + ChronoDuration::weeks(1)
    }

    /// A slot inside a DST gap runs an hour later; an ambiguous one runs at
    /// its first occurrence.
    fn resolve<Tz: TimeZone>(&self, tz: &Tz, date: NaiveDate) -> Option<DateTime<Tz>> {
        let naive = date.and_hms_opt(self.hour, self.minute, 0)?;
        tz.from_local_datetime(&naive).earliest().or_else(|| {
            tz.from_local_datetime(&(naive + ChronoDuration::hours(1)))
                .earliest()
        })
    }
}

impl fmt::Display for FullScanSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let day = WEEKDAY_NAMES
            .get(self.weekday as usize)
            .copied()
            .unwrap_or("?");
        write!(f, "{} {:02}:{:02}", day, self.hour, self.minute)
    }
}

/// Tracks whether a full scan is running and whether a delta is waiting.
#[derive(Debug, Default)]
pub struct ScanGate {
    full_active: AtomicBool,
    delta_queued: AtomicBool,
}

impl ScanGate {
    /// Reserve the delta slot. False while a full scan runs or a delta is
    /// already waiting.
    pub fn try_request_delta(&self) -> bool {
        if self.full_active.load(Ordering::SeqCst) {
            return false;
        }
        !self.delta_queued.swap(true, Ordering::SeqCst)
    }

    /// Free the delta slot once the queued delta starts (or is dropped).
    pub fn begin_delta(&self) {
        self.delta_queued.store(false, Ordering::SeqCst);
    }

    pub fn begin_full(&self) {
        self.full_active.store(true, Ordering::SeqCst);
    }

    pub fn end_full(&self) {
        self.full_active.store(false, Ordering::SeqCst);
    }

    pub fn full_active(&self) -> bool {
        self.full_active.load(Ordering::SeqCst)
    }
}

/// Executes one scan, hands its candidates to the pool and prunes backups.
pub struct ScanRunner {
    scanner: LibraryScanner,
    pool: PoolHandle,
    store: Arc<StateStore>,
    backups: Arc<BackupManager>,
    gate: Arc<ScanGate>,
}

impl ScanRunner {
    pub fn new(
        scanner: LibraryScanner,
        pool: PoolHandle,
        store: Arc<StateStore>,
        backups: Arc<BackupManager>,
    ) -> Self {
        Self {
            scanner,
            pool,
            store,
            backups,
            gate: Arc::new(ScanGate::default()),
        }
    }

    pub fn gate(&self) -> Arc<ScanGate> {
        self.gate.clone()
    }

    /// Walk the library, hand the candidates to the pool and prune backups.
    ///
    /// The full-scan gate is released as soon as the walk and its state
    /// updates finish; conversion of the candidates is never awaited here.
    pub async fn run_scan(&self, kind: ScanKind) -> Result<ScanRun, ScanError> {
        match kind {
            ScanKind::Delta => self.gate.begin_delta(),
            ScanKind::Full => self.gate.begin_full(),
        }

        let scanned = self.scanner.scan(kind).await;

        if kind == ScanKind::Full {
            self.gate.end_full();
        }

        let result = scanned.map(|(run, candidates)| self.enqueue(run, candidates));
        self.prune_backups().await;
        result
    }

    fn enqueue(&self, mut run: ScanRun, candidates: Vec<PathBuf>) -> ScanRun {
        run.enqueued = candidates
            .into_iter()
            .filter(|path| self.pool.enqueue(path.clone()))
            .count();
        info!(
            scan_id = %run.id,
            candidates = run.candidates,
            enqueued = run.enqueued,
            "Candidates handed to workers"
        );
        run
    }

    async fn prune_backups(&self) {
        let backups = self.backups.clone();
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || backups.prune(&store)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(pruned)) => info!(pruned, "Pruned expired backups"),
            Ok(Err(e)) => warn!("Backup prune failed: {}", e),
            Err(e) => error!("Backup prune task failed: {}", e),
        }
    }
}

/// Turns the two triggers into scan requests.
#[derive(Debug, Clone)]
pub struct Scheduler {
    delta_interval: Duration,
    full_scan: FullScanSchedule,
    scan_on_startup: bool,
}

impl Scheduler {
    pub fn new(delta_interval: Duration, full_scan: FullScanSchedule, scan_on_startup: bool) -> Self {
        Self {
            delta_interval,
            full_scan,
            scan_on_startup,
        }
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ScheduleError> {
        if config.delta_interval_minutes == 0 {
            return Err(ScheduleError::InvalidInterval(0));
        }
        let full_scan = FullScanSchedule::parse(&config.full_scan_day, &config.full_scan_time)?;
        Ok(Self::new(
            Duration::from_secs(config.delta_interval_minutes.saturating_mul(60)),
            full_scan,
            config.scan_on_startup,
        ))
    }

    /// Run until `shutdown` is cancelled. A scan already running completes
    /// its walk before this returns.
    pub async fn run(self, runner: Arc<ScanRunner>, shutdown: CancellationToken) {
        let (tx, rx) = mpsc::channel(SCAN_QUEUE_DEPTH);
        let gate = runner.gate();
        let scans = tokio::spawn(run_scans(runner, rx, shutdown.clone()));

        if self.scan_on_startup {
            request_delta(&tx, &gate);
        }

        let mut delta = tokio::time::interval_at(
            Instant::now() + self.delta_interval,
            self.delta_interval,
        );
        delta.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut next_full = self.full_scan.next_after(&Local::now());
        info!(
            delta_interval_secs = self.delta_interval.as_secs(),
            full_scan = %self.full_scan,
            %next_full,
            "Scheduler started"
        );

        loop {
            let until_full = (next_full - Local::now()).to_std().unwrap_or_default();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
                _ = delta.tick() => request_delta(&tx, &gate),
                _ = tokio::time::sleep(until_full) => {
                    request_full(&tx);
                    next_full = self.full_scan.next_after(&next_full);
                    info!(%next_full, "Next full scan scheduled");
                }
            }
        }

        drop(tx);
        if let Err(e) = scans.await {
            error!("Scan runner task panicked: {}", e);
        }
    }
}

fn request_delta(tx: &mpsc::Sender<ScanKind>, gate: &ScanGate) {
    if gate.full_active() {
        info!("Delta scan skipped: full scan in progress");
        return;
    }
    if !gate.try_request_delta() {
        info!("Delta scan skipped: one is already queued");
        return;
    }
    if let Err(e) = tx.try_send(ScanKind::Delta) {
        gate.begin_delta();
        warn!("Delta scan dropped: {}", e);
    }
}

fn request_full(tx: &mpsc::Sender<ScanKind>) {
    if let Err(e) = tx.try_send(ScanKind::Full) {
        warn!("Full scan request dropped: {}", e);
    }
}

async fn run_scans(
    runner: Arc<ScanRunner>,
    mut rx: mpsc::Receiver<ScanKind>,
    shutdown: CancellationToken,
) {
    loop {
        let kind = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            kind = rx.recv() => match kind {
                Some(kind) => kind,
                None => break,
            },
        };
        if let Err(e) = runner.run_scan(kind).await {
            error!(%kind, "Scan failed: {}", e);
        }
    }
    debug!("Scan runner stopped");
}
