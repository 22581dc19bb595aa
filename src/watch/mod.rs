//! Backlog watcher: turns ticket files into queue entries.
//!
//! The watcher combines filesystem notifications with a periodic scan.
//! Notifications give low latency; the scan is the floor on responsiveness
//! when notifications are dropped or unavailable (editors' atomic-save
//! patterns often escape them). Both paths converge on the same per-file
//! procedure, which is idempotent against the queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::EventBus;
use crate::queue::TicketQueue;
use crate::types::Ticket;

/// Errors from starting the watcher. Per-file problems are logged, never
/// returned.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        source: notify::Error,
    },
}

/// Configuration for the backlog watcher.
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Directory watched for inbound ticket files.
    pub backlog_path: PathBuf,
    /// Period of the fallback scan.
    pub poll_interval: Duration,
}

/// Watches the backlog directory and enqueues valid tickets.
pub struct BacklogWatcher {
    config: WatchConfig,
    queue: Arc<TicketQueue>,
    bus: Option<Arc<EventBus>>,
}

impl BacklogWatcher {
    pub fn new(
        config: WatchConfig,
        queue: Arc<TicketQueue>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        BacklogWatcher { config, queue, bus }
    }

    /// Runs until cancelled. Performs an initial scan, then reacts to
    /// filesystem notifications and the periodic timer.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), WatchError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut fs_watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                        for path in event.paths {
                            let _ = tx.send(path);
                        }
                    }
                }
                Err(e) => {
                    // The periodic scan keeps making progress regardless.
                    warn!(error = %e, "filesystem notification error");
                }
            },
        )
        .map_err(|source| WatchError::Notify {
            path: self.config.backlog_path.clone(),
            source,
        })?;

        fs_watcher
            .watch(&self.config.backlog_path, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Notify {
                path: self.config.backlog_path.clone(),
                source,
            })?;

        info!(backlog = %self.config.backlog_path.display(), "backlog watcher started");

        self.scan_directory().await;

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("backlog watcher stopping");
                    break;
                }
                Some(path) = rx.recv() => {
                    if is_ticket_file(&path) {
                        self.process_ticket_file(&path).await;
                    }
                }
                _ = ticker.tick() => {
                    self.scan_directory().await;
                }
            }
        }

        // Dropping the notify handle closes the underlying watch.
        drop(fs_watcher);
        Ok(())
    }

    /// Scans the backlog directory for ticket files, ignoring
    /// subdirectories. Errors are logged; the next tick retries.
    async fn scan_directory(&self) {
        let entries = match std::fs::read_dir(&self.config.backlog_path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "failed to scan backlog directory");
                return;
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && is_ticket_file(path))
            .collect();
        files.sort();

        for file in files {
            self.process_ticket_file(&file).await;
        }
    }

    /// Loads, validates, enqueues and archives one ticket file.
    ///
    /// Parse and validation failures are logged and the file is left in
    /// place. Tickets whose id is already queued are skipped; the queue-side
    /// check is the authoritative replay protection.
    async fn process_ticket_file(&self, path: &Path) {
        // Notifications can race the archive rename; a vanished file is fine.
        if !path.exists() {
            return;
        }

        let ticket = match Ticket::load(path) {
            Ok(ticket) => ticket,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "rejected ticket file");
                return;
            }
        };

        if self.is_ticket_queued(&ticket) {
            debug!(ticket = %ticket.id, "ticket already queued, skipping");
            return;
        }

        info!(ticket = %ticket.id, title = %ticket.title, "enqueued ticket");
        self.queue.push(ticket.clone());

        if let Some(bus) = &self.bus {
            bus.publish_ticket_enqueued(ticket).await;
            bus.publish_queue_updated(self.queue.len(), self.queue.peek())
                .await;
        }

        if let Err(e) = self.move_to_processed(path) {
            warn!(file = %path.display(), error = %e, "failed to archive ticket file");
        }
    }

    fn is_ticket_queued(&self, ticket: &Ticket) -> bool {
        self.queue.list().iter().any(|t| t.id == ticket.id)
    }

    /// Atomically renames the source file into `<backlog>/processed/`,
    /// creating the directory on first use. Name collisions overwrite.
    fn move_to_processed(&self, path: &Path) -> std::io::Result<()> {
        let processed_dir = self.config.backlog_path.join("processed");
        std::fs::create_dir_all(&processed_dir)?;

        let file_name = path.file_name().unwrap_or_default();
        let dest = processed_dir.join(file_name);
        std::fs::rename(path, &dest)?;

        debug!(dest = %dest.display(), "archived ticket file");
        Ok(())
    }
}

/// Returns true for files with a `.yaml` or `.yml` extension.
fn is_ticket_file(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .as_deref(),
        Some("yaml") | Some("yml")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::ticket_yaml;
    use tempfile::TempDir;

    fn start_watcher(
        backlog: &Path,
        queue: Arc<TicketQueue>,
    ) -> (CancellationToken, tokio::task::JoinHandle<()>) {
        let watcher = BacklogWatcher::new(
            WatchConfig {
                backlog_path: backlog.to_path_buf(),
                poll_interval: Duration::from_millis(50),
            },
            queue,
            None,
        );
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            watcher.run(token).await.unwrap();
        });
        (cancel, handle)
    }

    async fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition never reached");
    }

    #[test]
    fn ticket_file_extensions() {
        assert!(is_ticket_file(Path::new("a.yaml")));
        assert!(is_ticket_file(Path::new("a.yml")));
        assert!(is_ticket_file(Path::new("a.YAML")));
        assert!(!is_ticket_file(Path::new("a.json")));
        assert!(!is_ticket_file(Path::new("yaml")));
    }

    #[tokio::test]
    async fn enqueues_and_archives_existing_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("feat-1.yaml"), ticket_yaml("feat-1", 1)).unwrap();

        let queue = Arc::new(TicketQueue::new());
        let (cancel, handle) = start_watcher(dir.path(), Arc::clone(&queue));

        let q = Arc::clone(&queue);
        wait_for(move || q.len() == 1).await;

        assert_eq!(queue.peek().unwrap().id.as_str(), "feat-1");
        assert!(!dir.path().join("feat-1.yaml").exists());
        assert!(dir.path().join("processed").join("feat-1.yaml").exists());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn picks_up_file_dropped_after_start() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(TicketQueue::new());
        let (cancel, handle) = start_watcher(dir.path(), Arc::clone(&queue));

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(dir.path().join("feat-2.yml"), ticket_yaml("feat-2", 2)).unwrap();

        let q = Arc::clone(&queue);
        wait_for(move || q.len() == 1).await;
        assert_eq!(queue.peek().unwrap().id.as_str(), "feat-2");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_ticket_is_not_archived() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "id: x\npriority: 9\n").unwrap();

        let queue = Arc::new(TicketQueue::new());
        let (cancel, handle) = start_watcher(dir.path(), Arc::clone(&queue));

        // Give the watcher several scan cycles.
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(queue.is_empty());
        assert!(dir.path().join("broken.yaml").exists());
        assert!(!dir.path().join("processed").join("broken.yaml").exists());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_ticket_id_enqueued_once() {
        let dir = TempDir::new().unwrap();
        let queue = Arc::new(TicketQueue::new());
        let (cancel, handle) = start_watcher(dir.path(), Arc::clone(&queue));

        std::fs::write(dir.path().join("one.yaml"), ticket_yaml("dup", 3)).unwrap();
        let q = Arc::clone(&queue);
        wait_for(move || q.len() == 1).await;

        // Same id under a different file name: the queue-side check wins and
        // the duplicate is skipped without being archived.
        std::fs::write(dir.path().join("two.yaml"), ticket_yaml("dup", 3)).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(queue.len(), 1);
        assert!(dir.path().join("two.yaml").exists());

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn non_yaml_files_are_ignored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a ticket").unwrap();

        let queue = Arc::new(TicketQueue::new());
        let (cancel, handle) = start_watcher(dir.path(), Arc::clone(&queue));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(queue.is_empty());
        assert!(dir.path().join("notes.txt").exists());

        cancel.cancel();
        handle.await.unwrap();
    }
}
