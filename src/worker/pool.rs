//! Construction and lifecycle of the fixed-size worker pool.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::bus::EventBus;
use crate::ci::StatusReader;
use crate::git::Repo;
use crate::queue::TicketQueue;
use crate::types::WorkerId;

use super::worker::{Worker, WorkerConfig, WorkerSnapshot};

/// Pool-wide configuration, expanded into one [`WorkerConfig`] per worker.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of workers (N >= 1).
    pub count: u32,
    /// Path of the shared bare repository.
    pub repo_path: PathBuf,
    /// Root directory for worktrees.
    pub workdir: PathBuf,
    /// Directory of CI verdict files.
    pub ci_status_dir: PathBuf,
    /// Argv of the code-generation collaborator.
    pub generator: Vec<String>,
    /// CI collaborator command; `None` resolves `ci.sh` by convention.
    pub ci_command: Option<PathBuf>,
    pub poll_period: Duration,
    pub verdict_poll: Duration,
    pub verdict_timeout: Duration,
    pub skip_generator: bool,
    pub skip_ci: bool,
}

impl PoolConfig {
    pub fn new(
        count: u32,
        repo_path: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        ci_status_dir: impl Into<PathBuf>,
    ) -> Self {
        let defaults = WorkerConfig::new(WorkerId(1), PathBuf::new());
        PoolConfig {
            count,
            repo_path: repo_path.into(),
            workdir: workdir.into(),
            ci_status_dir: ci_status_dir.into(),
            generator: defaults.generator,
            ci_command: None,
            poll_period: defaults.poll_period,
            verdict_poll: defaults.verdict_poll,
            verdict_timeout: defaults.verdict_timeout,
            skip_generator: false,
            skip_ci: false,
        }
    }

    fn worker_config(&self, id: WorkerId) -> WorkerConfig {
        WorkerConfig {
            id,
            workdir: self.workdir.clone(),
            generator: self.generator.clone(),
            ci_command: self.ci_command.clone(),
            poll_period: self.poll_period,
            verdict_poll: self.verdict_poll,
            verdict_timeout: self.verdict_timeout,
            skip_generator: self.skip_generator,
            skip_ci: self.skip_ci,
        }
    }
}

/// The running pool: worker tasks plus their status handles.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    snapshots: Vec<Arc<RwLock<WorkerSnapshot>>>,
}

impl WorkerPool {
    /// Creates workers 1..=N and spawns their claim loops.
    pub fn spawn(
        config: PoolConfig,
        queue: Arc<TicketQueue>,
        bus: Option<Arc<EventBus>>,
        cancel: CancellationToken,
    ) -> WorkerPool {
        let repo = Arc::new(Repo::new(&config.repo_path));

        let mut handles = Vec::with_capacity(config.count as usize);
        let mut snapshots = Vec::with_capacity(config.count as usize);

        for n in 1..=config.count {
            let id = WorkerId(n);
            let worker = Worker::new(
                config.worker_config(id),
                Arc::clone(&repo),
                Arc::clone(&queue),
                StatusReader::new(&config.ci_status_dir),
                bus.clone(),
            );
            snapshots.push(worker.snapshot_handle());

            let token = cancel.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = worker.run(token).await {
                    error!(worker = %id, error = %e, "worker stopped with error");
                }
            }));
        }

        WorkerPool { handles, snapshots }
    }

    /// Current state of every worker.
    pub fn statuses(&self) -> Vec<WorkerSnapshot> {
        self.snapshots
            .iter()
            .map(|snapshot| snapshot.read().unwrap().clone())
            .collect()
    }

    /// Waits for all workers to exit. Call after cancelling the token passed
    /// to [`WorkerPool::spawn`].
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
