//! The publishing side of the event bus.
//!
//! The server owns the unix socket. Each accepted connection joins the
//! subscriber set; `publish` serialises the event once and writes it to every
//! subscriber under the read lock, with a short per-write deadline so one
//! slow client cannot stall the rest. Failed subscribers are collected during
//! the fan-out and evicted afterwards, never mid-write.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{expand_socket_path, BusError, Event, EventPayload, WorkerState};
use crate::types::{Ticket, WorkerId};

/// Deadline for a single subscriber write. Slow clients beyond this are
/// treated as dead and evicted.
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);

type SubscriberId = u64;
/// Publishes hold the outer read lock; add/remove hold the write lock. The
/// per-subscriber mutex serialises concurrent publishers on one connection,
/// which keeps each JSON line atomic on the wire.
type Subscribers = Arc<RwLock<HashMap<SubscriberId, Arc<Mutex<OwnedWriteHalf>>>>>;

/// Publishing end of the event bus.
pub struct EventBus {
    socket_path: PathBuf,
    subscribers: Subscribers,
    cancel: CancellationToken,
}

impl EventBus {
    /// Binds the socket and starts accepting subscribers.
    ///
    /// Any stale socket file is removed first and the parent directory is
    /// created if missing. `~/` in the path is expanded.
    pub async fn bind(socket_path: &str) -> Result<EventBus, BusError> {
        let socket_path = expand_socket_path(socket_path);

        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| BusError::Socket {
                path: socket_path.clone(),
                source,
            })?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|source| BusError::Socket {
            path: socket_path.clone(),
            source,
        })?;
        info!(socket = %socket_path.display(), "event bus listening");

        let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(accept_loop(
            listener,
            Arc::clone(&subscribers),
            cancel.clone(),
        ));

        Ok(EventBus {
            socket_path,
            subscribers,
            cancel,
        })
    }

    /// Path of the bound socket (after `~/` expansion).
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Number of currently connected subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Publishes one event to every subscriber.
    ///
    /// With zero subscribers this is a no-op. Write errors mark the offending
    /// subscriber for removal; nothing is retried or buffered.
    pub async fn publish(&self, payload: EventPayload) {
        let event = Event::new(payload);
        let mut line = match serde_json::to_vec(&event) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to encode event");
                return;
            }
        };
        line.push(b'\n');

        let mut dead = Vec::new();
        {
            let subscribers = self.subscribers.read().await;
            for (id, writer) in subscribers.iter() {
                let mut writer = writer.lock().await;
                let write = tokio::time::timeout(WRITE_TIMEOUT, writer.write_all(&line));
                match write.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        debug!(subscriber = id, error = %e, "subscriber write failed");
                        dead.push(*id);
                    }
                    Err(_) => {
                        debug!(subscriber = id, "subscriber write timed out");
                        dead.push(*id);
                    }
                }
            }
        }

        // Eviction is deferred until after the fan-out so a dead subscriber
        // never blocks the live ones.
        if !dead.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in dead {
                subscribers.remove(&id);
                debug!(subscriber = id, "evicted subscriber");
            }
        }
    }

    // Helper publishers carrying the conventional messages.

    pub async fn publish_queue_updated(&self, queue_length: usize, next_ticket: Option<Ticket>) {
        self.publish(EventPayload::QueueUpdated {
            queue_length,
            next_ticket,
        })
        .await;
    }

    pub async fn publish_ticket_enqueued(&self, ticket: Ticket) {
        let message = format!("Ticket {} enqueued", ticket.id);
        self.publish(EventPayload::TicketEnqueued { ticket, message })
            .await;
    }

    pub async fn publish_ticket_started(&self, ticket: Ticket, worker_id: WorkerId) {
        let message = format!("Worker {} started processing ticket {}", worker_id, ticket.id);
        self.publish(EventPayload::TicketStarted {
            ticket,
            worker_id,
            message,
        })
        .await;
    }

    pub async fn publish_ticket_complete(&self, ticket: Ticket, worker_id: WorkerId) {
        let message = format!("Worker {} completed ticket {}", worker_id, ticket.id);
        self.publish(EventPayload::TicketComplete {
            ticket,
            worker_id,
            message,
        })
        .await;
    }

    pub async fn publish_worker_status(
        &self,
        worker_id: WorkerId,
        status: WorkerState,
        current_ticket: Option<Ticket>,
        message: impl Into<String>,
    ) {
        self.publish(EventPayload::WorkerStatus {
            worker_id,
            status,
            current_ticket,
            message: message.into(),
        })
        .await;
    }

    /// Stops accepting, drops all subscribers and unlinks the socket file.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.subscribers.write().await.clear();
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
        info!("event bus stopped");
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Accepts connections until cancelled, registering each as a subscriber.
async fn accept_loop(listener: UnixListener, subscribers: Subscribers, cancel: CancellationToken) {
    let mut next_id: SubscriberId = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _addr)) => {
                        let id = next_id;
                        next_id += 1;
                        register(stream, id, &subscribers, &cancel).await;
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept subscriber");
                    }
                }
            }
        }
    }

    debug!("event bus accept loop exiting");
}

/// Registers a new subscriber and spawns its disconnect watcher.
async fn register(
    stream: UnixStream,
    id: SubscriberId,
    subscribers: &Subscribers,
    cancel: &CancellationToken,
) {
    let (mut read_half, write_half) = stream.into_split();
    subscribers
        .write()
        .await
        .insert(id, Arc::new(Mutex::new(write_half)));
    debug!(subscriber = id, "subscriber connected");

    // Subscribers never send events; reading until EOF detects disconnects
    // so the writer can be dropped without waiting for a failed publish.
    let subscribers = Arc::clone(subscribers);
    let cancel = cancel.clone();
    tokio::spawn(async move {
        use tokio::io::AsyncReadExt;

        let mut scratch = [0u8; 64];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = read_half.read(&mut scratch) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(_) => continue,
                    }
                }
            }
        }

        if subscribers.write().await.remove(&id).is_some() {
            debug!(subscriber = id, "subscriber disconnected");
        }
    });
}
