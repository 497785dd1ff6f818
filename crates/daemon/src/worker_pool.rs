//! Fixed-size worker pool.
//!
//! Workers share one unbounded candidate queue. The queue holds each path at
//! most once, so its length is bounded by the library size and handing a
//! candidate to the pool never waits on a worker. Each worker claims a path
//! through the state store before running the pipeline; a failed claim means
//! the path is owned elsewhere and the candidate is dropped. A worker runs
//! its job to an exit before taking the next candidate.

use crate::pipeline::{JobOutcome, Pipeline};
use crate::state_store::StateStore;
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Cloneable handle used to feed the pool.
#[derive(Clone)]
pub struct PoolHandle {
    tx: mpsc::UnboundedSender<PathBuf>,
    queued: Arc<Mutex<HashSet<PathBuf>>>,
    /// Queued, in-flight and retry-scheduled paths.
    outstanding: Arc<watch::Sender<usize>>,
}

impl PoolHandle {
    /// Queue `path` unless it is already queued. Returns true if queued.
    /// Never waits.
    pub fn enqueue(&self, path: PathBuf) -> bool {
        {
            let Ok(mut queued) = self.queued.lock() else {
                warn!("Queue index lock poisoned");
                return false;
            };
            if !queued.insert(path.clone()) {
                debug!(path = %path.display(), "Already queued");
                return false;
            }
        }
        self.outstanding.send_modify(|n| *n += 1);

        if let Err(mpsc::error::SendError(path)) = self.tx.send(path) {
            debug!(path = %path.display(), "Pool stopped; candidate dropped");
            self.forget(&path);
            self.finish_one();
            return false;
        }
        true
    }

    /// Resolves once nothing is queued, in flight or waiting for a retry.
    pub async fn wait_idle(&self) {
        let mut rx = self.outstanding.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    fn forget(&self, path: &PathBuf) {
        if let Ok(mut queued) = self.queued.lock() {
            queued.remove(path);
        }
    }

    fn finish_one(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Running pool of worker tasks.
pub struct WorkerPool {
    handle: PoolHandle,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `concurrency` workers. They stop taking candidates once
    /// `shutdown` is cancelled; a job already running finishes first.
    pub fn start(
        concurrency: usize,
        pipeline: Arc<Pipeline>,
        store: Arc<StateStore>,
        shutdown: CancellationToken,
    ) -> Self {
        let concurrency = concurrency.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let (outstanding, _) = watch::channel(0usize);

        let handle = PoolHandle {
            tx,
            queued: Arc::new(Mutex::new(HashSet::new())),
            outstanding: Arc::new(outstanding),
        };

        info!(concurrency, "Starting worker pool");

        let workers = (0..concurrency)
            .map(|id| {
                let worker = Worker {
                    id,
                    rx: rx.clone(),
                    pool: handle.clone(),
                    pipeline: pipeline.clone(),
                    store: store.clone(),
                    shutdown: shutdown.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        Self { handle, workers }
    }

    pub fn handle(&self) -> PoolHandle {
        self.handle.clone()
    }

    /// Wait for every worker to exit. Call after cancelling the token.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!("Worker task panicked: {}", e);
            }
        }
        info!("Worker pool stopped");
    }
}

struct Worker {
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<PathBuf>>>,
    pool: PoolHandle,
    pipeline: Arc<Pipeline>,
    store: Arc<StateStore>,
    shutdown: CancellationToken,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.id, "Worker started");
        loop {
            let next = {
                let mut rx = self.rx.lock().await;
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    path = rx.recv() => path,
                }
            };
            let Some(path) = next else {
                break;
            };

            self.pool.forget(&path);
            self.process(path).await;
            self.pool.finish_one();
        }
        debug!(worker = self.id, "Worker stopped");
    }

    async fn process(&self, path: PathBuf) {
        let claim = {
            let path = path.clone();
            self.store
                .run_blocking(move |store| store.claim_processing(&path))
                .await
        };
        match claim {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker = self.id, path = %path.display(), "Claim refused; discarding");
                return;
            }
            Err(e) => {
                error!(worker = self.id, path = %path.display(), "Claim failed: {}", e);
                return;
            }
        }

        info!(worker = self.id, path = %path.display(), "Processing");
        match self.pipeline.run(&path, &self.shutdown).await {
            Ok(JobOutcome::Failed {
                retry_at: Some(at),
                reason,
            }) => {
                info!(path = %path.display(), %at, %reason, "Retry scheduled");
                self.schedule_retry(path, at);
            }
            Ok(outcome) => {
                debug!(worker = self.id, path = %path.display(), ?outcome, "Job finished");
            }
            Err(e) => {
                error!(worker = self.id, path = %path.display(), "Job aborted: {}", e);
            }
        }
    }

    /// Re-enqueue `path` once its backoff has elapsed.
    fn schedule_retry(&self, path: PathBuf, at: chrono::DateTime<Utc>) {
        let pool = self.pool.clone();
        let shutdown = self.shutdown.clone();
        let delay = (at - Utc::now()).to_std().unwrap_or_default();

        pool.outstanding.send_modify(|n| *n += 1);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    pool.enqueue(path);
                }
            }
            pool.finish_one();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::FileStatus;
    use crate::testing::{MockFailure, TestEnv};
    use std::time::Duration;

    fn start(env: &TestEnv, concurrency: usize) -> (WorkerPool, CancellationToken) {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::start(
            concurrency,
            Arc::new(env.pipeline()),
            env.store.clone(),
            shutdown.clone(),
        );
        (pool, shutdown)
    }

    #[tokio::test]
    async fn test_pool_processes_all_candidates() {
        let env = TestEnv::new();
        let paths: Vec<_> = (0..5)
            .map(|i| env.add_media(&format!("{}.mkv", i), "profile=7 layer=mel"))
            .collect();

        let (pool, shutdown) = start(&env, 2);
        let handle = pool.handle();
        for path in &paths {
            assert!(handle.enqueue(path.clone()));
        }
        tokio::time::timeout(Duration::from_secs(10), handle.wait_idle())
            .await
            .unwrap();

        for path in &paths {
            assert_eq!(
                env.store.get(path).unwrap().unwrap().status,
                FileStatus::Completed
            );
        }
        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_duplicate_candidates_processed_once() {
        let env = TestEnv::new();
        env.tools.set_delay(Duration::from_millis(50));
        let path = env.add_media("X.mkv", "profile=7 layer=mel");

        let (pool, shutdown) = start(&env, 3);
        let handle = pool.handle();
        for _ in 0..5 {
            handle.enqueue(path.clone());
        }
        tokio::time::timeout(Duration::from_secs(10), handle.wait_idle())
            .await
            .unwrap();

        let extracts = env.tools.calls().iter().filter(|c| **c == "extract").count();
        assert_eq!(extracts, 1);
        assert_eq!(env.backups.records().unwrap().len(), 1);
        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_failed_job_is_retried_until_success() {
        let env = TestEnv::new();
        env.tools.fail_times("remux", MockFailure::Exit, 1);
        let path = env.add_media("X.mkv", "profile=7 layer=mel");

        let (pool, shutdown) = start(&env, 1);
        let handle = pool.handle();
        handle.enqueue(path.clone());
        tokio::time::timeout(Duration::from_secs(10), handle.wait_idle())
            .await
            .unwrap();

        let record = env.store.get(&path).unwrap().unwrap();
        assert_eq!(record.status, FileStatus::Completed);
        assert_eq!(record.attempts, 1);
        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_retries_stop_at_attempt_cap() {
        let env = TestEnv::new();
        env.tools.fail("extract", MockFailure::Exit);
        let path = env.add_media("X.mkv", "profile=7 layer=mel");

        let (pool, shutdown) = start(&env, 1);
        let handle = pool.handle();
        handle.enqueue(path.clone());
        tokio::time::timeout(Duration::from_secs(10), handle.wait_idle())
            .await
            .unwrap();

        let record = env.store.get(&path).unwrap().unwrap();
        assert!(record.is_terminal_failure());
        assert_eq!(record.attempts, 3);
        assert_eq!(fs_content(&path), "profile=7 layer=mel");
        shutdown.cancel();
        pool.join().await;
    }

    #[tokio::test]
    async fn test_shutdown_lets_running_job_finish() {
        let env = TestEnv::new();
        env.tools.set_delay(Duration::from_millis(100));
        let first = env.add_media("a.mkv", "profile=7 layer=mel");
        let second = env.add_media("b.mkv", "profile=7 layer=mel");

        let (pool, shutdown) = start(&env, 1);
        let handle = pool.handle();
        handle.enqueue(first.clone());
        handle.enqueue(second.clone());

        // Cancel while the first job is inside extract.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        pool.join().await;

        // The running job stopped at a step boundary and never left a
        // Processing claim behind.
        for path in [&first, &second] {
            let status = env.store.get(path).unwrap().unwrap().status;
            assert_ne!(status, FileStatus::Processing);
            assert_eq!(fs_content(path), "profile=7 layer=mel");
        }
        env.assert_no_scratch(&first);
    }

    fn fs_content(path: &std::path::Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }
}
