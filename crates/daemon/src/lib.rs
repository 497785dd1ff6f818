//! Dolby Vision profile 7 to 8.1 migration daemon
//!
//! Scans a media library, converts dual-layer profile 7 files to single-layer
//! profile 8.1 in place, and tracks every file's progress in a durable state
//! store so interrupted work resumes after a restart.

pub mod backup;
pub mod daemon;
pub mod disk_guard;
pub mod media;
pub mod notify;
pub mod pipeline;
pub mod scan;
pub mod scheduler;
pub mod startup;
pub mod state_store;
pub mod tools;
pub mod worker_pool;

#[cfg(test)]
mod testing;

pub use dovi_migrate_config as config;
pub use dovi_migrate_config::Config;
pub use backup::{BackupError, BackupManager, BackupRecord};
pub use daemon::{Daemon, DaemonError};
pub use disk_guard::{DiskSpaceGuard, FreeSpace, SystemFreeSpace};
pub use media::{FailureKind, FileStatus, Fingerprint, LayerKind, MediaFile, RetryPolicy};
pub use notify::{Event, EventKind, LogSink, NotificationDispatcher, NotificationSink};
pub use pipeline::{JobOutcome, Pipeline, PipelineSettings, PipelineState};
pub use scan::{LibraryScanner, RecentImports, ScanError, ScanKind, ScanRun};
pub use scheduler::{FullScanSchedule, ScanGate, ScanRunner, ScheduleError, Scheduler};
pub use startup::{check_tool_available, run_startup_checks, StartupError};
pub use state_store::{StateStore, StoreError};
pub use tools::{
    CommandToolchain, ConversionTools, MediaInfoProber, ProbeInfo, Prober, ToolError,
};
pub use worker_pool::{PoolHandle, WorkerPool};
