//! Composition root: wires the queue, event bus, watcher and worker pool,
//! and drives the daemon lifecycle.
//!
//! There are no hidden globals: every shared component is constructed here
//! and threaded into its consumers explicitly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::config::Config;
use crate::git::{GitError, Repo};
use crate::queue::TicketQueue;
use crate::watch::{BacklogWatcher, WatchConfig};
use crate::worker::{PoolConfig, WorkerPool};

/// Period of the daemon's own queue/worker status log line.
const STATUS_LOG_PERIOD: Duration = Duration::from_secs(30);

/// Fatal composition errors. Anything here aborts startup with a non-zero
/// exit; per-ticket and per-subscriber failures never reach this type.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("failed to create {what} directory {path}: {source}")]
    CreateDir {
        what: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Git(#[from] GitError),
}

/// Runs the daemon until the cancellation token fires.
pub async fn run(config: Config, cancel: CancellationToken) -> Result<(), DaemonError> {
    create_dir(&config.scheduler.backlog_path, "backlog")?;
    create_dir(&config.repository.workdir, "work")?;
    create_dir(&config.ci.status_path, "CI status")?;

    // Initialise the shared repository on first run.
    let repo = Repo::new(&config.repository.path);
    if !config.repository.path.exists() {
        info!(path = %config.repository.path.display(), "creating bare repository");
        repo.init_bare()?;
    }
    let needs_initial_commit = match repo.list_branches() {
        Ok(branches) => branches.is_empty(),
        Err(_) => true,
    };
    if needs_initial_commit {
        info!("creating initial commit");
        repo.create_initial_commit()?;
    }

    // A previous crash can leave dangling worktree metadata behind.
    if let Err(e) = repo.prune_worktrees() {
        warn!(error = %e, "failed to prune stale worktrees");
    }

    let queue = Arc::new(TicketQueue::new());

    // The daemon is usable without observers; a bus failure is a warning,
    // not a fatal error.
    let bus = match EventBus::bind(&config.ipc.socket_path).await {
        Ok(bus) => Some(Arc::new(bus)),
        Err(e) => {
            warn!(error = %e, "failed to start event bus, running without it");
            None
        }
    };

    let watcher = BacklogWatcher::new(
        WatchConfig {
            backlog_path: config.scheduler.backlog_path.clone(),
            poll_interval: config.poll_interval(),
        },
        Arc::clone(&queue),
        bus.clone(),
    );
    let watcher_cancel = cancel.clone();
    let watcher_handle = tokio::spawn(async move {
        if let Err(e) = watcher.run(watcher_cancel).await {
            warn!(error = %e, "backlog watcher stopped");
        }
    });

    let pool = WorkerPool::spawn(
        PoolConfig::new(
            config.agents.count,
            &config.repository.path,
            &config.repository.workdir,
            &config.ci.status_path,
        ),
        Arc::clone(&queue),
        bus.clone(),
        cancel.clone(),
    );

    info!(agents = config.agents.count, "orchestrator initialized and ready");

    let mut status_ticker = tokio::time::interval(STATUS_LOG_PERIOD);
    status_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    status_ticker.tick().await; // the first tick is immediate

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = status_ticker.tick() => log_status(&queue, &pool),
        }
    }

    info!("shutting down");
    pool.join().await;
    let _ = watcher_handle.await;
    if let Some(bus) = bus {
        bus.shutdown().await;
    }
    info!("orchestrator stopped");

    Ok(())
}

fn create_dir(path: &std::path::Path, what: &'static str) -> Result<(), DaemonError> {
    std::fs::create_dir_all(path).map_err(|source| DaemonError::CreateDir {
        what,
        path: path.to_path_buf(),
        source,
    })
}

fn log_status(queue: &TicketQueue, pool: &WorkerPool) {
    let pending = queue.len();
    match queue.peek() {
        Some(next) => info!(pending, next = %next.id, "queue status"),
        None => info!(pending, "queue status"),
    }

    for status in pool.statuses() {
        match &status.current_ticket {
            Some(ticket) => {
                info!(worker = %status.id, state = %status.state, ticket = %ticket.id,
                      title = %ticket.title, "worker status");
            }
            None => info!(worker = %status.id, state = %status.state, "worker status"),
        }
    }
}
