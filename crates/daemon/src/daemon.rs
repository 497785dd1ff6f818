//! Daemon startup and main loop.
//!
//! Wires the state store, pipeline, worker pool and scheduler together,
//! runs the startup recovery pass and drains everything on shutdown.

use crate::backup::{BackupError, BackupManager};
use crate::config::{Config, ConfigError};
use crate::disk_guard::{DiskSpaceGuard, FreeSpace, SystemFreeSpace};
use crate::media::RetryPolicy;
use crate::notify::{Event, EventKind, LogSink, NotificationDispatcher, NotificationSink};
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::scan::{LibraryScanner, RecentImports, ScanError, ScanKind};
use crate::scheduler::{ScanRunner, ScheduleError, Scheduler};
use crate::startup::{
    cleanup_orphaned_work_dirs, remove_stale_partials, run_startup_checks, StartupError,
};
use crate::state_store::{StateStore, StoreError};
use crate::tools::{CommandToolchain, ConversionTools, MediaInfoProber, Prober};
use crate::worker_pool::WorkerPool;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How long shutdown waits for queued notifications to be delivered.
const NOTIFY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Backup error: {0}")]
    Backup(#[from] BackupError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),
}

/// Long-lived daemon state. Runtime pieces (workers, scheduler, notifier)
/// are created per [`Daemon::run`] or [`Daemon::run_once`].
pub struct Daemon {
    config: Config,
    store: Arc<StateStore>,
    backups: Arc<BackupManager>,
    prober: Arc<dyn Prober>,
    tools: Arc<dyn ConversionTools>,
    free_space: Arc<dyn FreeSpace>,
    sink: Arc<dyn NotificationSink>,
    recent_imports: Option<Arc<dyn RecentImports>>,
}

impl Daemon {
    /// Validate the configuration, check every external tool and open the
    /// durable state.
    pub fn new(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        run_startup_checks(&config.tools)?;
        Self::new_without_checks(config)
    }

    /// Like [`Daemon::new`] without the tool availability checks.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let prober = Arc::new(MediaInfoProber::new(
            config.tools.mediainfo.clone(),
            config.tools.ffmpeg.clone(),
            config.tools.dovi_tool.clone(),
            config.temp_dir.clone(),
            Duration::from_secs(config.tools.timeout_base_secs),
        ));
        let tools = Arc::new(CommandToolchain::from_config(&config.tools));
        Self::with_collaborators(
            config,
            prober,
            tools,
            Arc::new(SystemFreeSpace),
            Arc::new(LogSink),
        )
    }

    /// Build a daemon around caller-supplied collaborators.
    pub fn with_collaborators(
        config: Config,
        prober: Arc<dyn Prober>,
        tools: Arc<dyn ConversionTools>,
        free_space: Arc<dyn FreeSpace>,
        sink: Arc<dyn NotificationSink>,
    ) -> Result<Self, DaemonError> {
        config.validate()?;

        let retry = RetryPolicy {
            max_attempts: config.workers.max_attempts,
            backoff_base_secs: config.workers.retry_backoff_base_secs,
            backoff_max_secs: config.workers.retry_backoff_max_secs,
        };
        let store = Arc::new(StateStore::open(&config.state_dir, retry)?);
        let backups = Arc::new(BackupManager::open(
            &config.state_dir,
            config.backup.dir.clone(),
            config.backup.retention_days,
        )?);

        Ok(Self {
            config,
            store,
            backups,
            prober,
            tools,
            free_space,
            sink,
            recent_imports: None,
        })
    }

    /// Merge recently imported paths into every delta scan.
    pub fn with_recent_imports(mut self, source: Arc<dyn RecentImports>) -> Self {
        self.recent_imports = Some(source);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> Arc<StateStore> {
        self.store.clone()
    }

    /// Run until `shutdown` is cancelled, then let in-flight jobs finish.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let scheduler = Scheduler::from_config(&self.config.schedule)?;
        let runtime = self.start(shutdown.clone()).await?;

        scheduler.run(runtime.runner.clone(), shutdown).await;

        runtime.stop().await;
        Ok(())
    }

    /// One full scan, then wait until every candidate reached an exit.
    /// Cancelling `shutdown` stops early the same way [`Daemon::run`] does.
    pub async fn run_once(&self, shutdown: CancellationToken) -> Result<(), DaemonError> {
        let workers = shutdown.child_token();
        let runtime = self.start(workers.clone()).await?;
        let pool = runtime.pool.handle();

        let scanned = tokio::select! {
            _ = shutdown.cancelled() => None,
            result = runtime.runner.run_scan(ScanKind::Full) => Some(result),
        };
        match scanned {
            Some(Ok(_)) => {
                tokio::select! {
                    _ = shutdown.cancelled() => info!("Shutdown requested; draining"),
                    _ = pool.wait_idle() => info!("All candidates processed"),
                }
            }
            Some(Err(e)) => {
                workers.cancel();
                runtime.stop().await;
                return Err(e.into());
            }
            None => info!("Shutdown requested during scan"),
        }

        workers.cancel();
        runtime.stop().await;
        Ok(())
    }

    /// Recovery pass, collaborator wiring and the initial pending enqueue.
    async fn start(&self, shutdown: CancellationToken) -> Result<Runtime, DaemonError> {
        let policy = &self.config.policy;
        info!(
            roots = ?self.config.library.roots,
            dry_run = policy.dry_run,
            auto_process_fel = policy.auto_process_fel,
            concurrency = self.config.workers.concurrency,
            "Starting daemon"
        );

        cleanup_orphaned_work_dirs(&self.config.temp_dir)?;
        let recovered = self.store.recover_orphans()?;
        remove_stale_partials(&recovered);
        if !policy.dry_run {
            let reset = self.store.reset_would_process()?;
            if reset > 0 {
                info!(count = reset, "Dry-run markers returned to Pending");
            }
        }

        let (notifier, notifier_task) = NotificationDispatcher::spawn(self.sink.clone());

        let disk = DiskSpaceGuard::new(
            self.config.disk.min_free_gb,
            self.config.disk.space_multiplier,
            self.free_space.clone(),
        );
        let pipeline = Arc::new(Pipeline::new(
            self.store.clone(),
            self.prober.clone(),
            self.tools.clone(),
            disk,
            self.backups.clone(),
            notifier.clone(),
            PipelineSettings::from_config(&self.config),
        ));
        let pool = WorkerPool::start(
            self.config.workers.concurrency as usize,
            pipeline,
            self.store.clone(),
            shutdown,
        );

        let mut scanner = LibraryScanner::new(
            self.config.library.roots.clone(),
            self.config.library.extensions.clone(),
            self.store.clone(),
        );
        if let Some(source) = &self.recent_imports {
            scanner =
                scanner.with_recent_imports(source.clone(), self.config.schedule.lookback_minutes);
        }
        let runner = Arc::new(ScanRunner::new(
            scanner,
            pool.handle(),
            self.store.clone(),
            self.backups.clone(),
        ));

        notifier.notify(Event::lifecycle(
            EventKind::Startup,
            format!("recovered {} interrupted jobs", recovered.len()),
        ));

        let pending: Vec<_> = self.store.list_pending().map(|f| f.path).collect();
        if !pending.is_empty() {
            info!(count = pending.len(), "Resuming pending files");
        }
        let handle = pool.handle();
        for path in pending {
            handle.enqueue(path);
        }

        Ok(Runtime {
            pool,
            runner,
            notifier,
            notifier_task,
        })
    }
}

struct Runtime {
    pool: WorkerPool,
    runner: Arc<ScanRunner>,
    notifier: NotificationDispatcher,
    notifier_task: JoinHandle<()>,
}

impl Runtime {
    /// Wait for the workers (the caller has cancelled their token), then
    /// flush notifications.
    async fn stop(self) {
        let Runtime {
            pool,
            runner,
            notifier,
            notifier_task,
        } = self;

        pool.join().await;
        drop(runner);

        notifier.notify(Event::lifecycle(EventKind::Shutdown, "workers drained"));
        drop(notifier);
        match tokio::time::timeout(NOTIFY_DRAIN_TIMEOUT, notifier_task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Notification task panicked: {}", e),
            Err(_) => warn!("Timed out delivering pending notifications"),
        }
        info!("Daemon stopped");
    }
}
