//! Event bus: local-socket fan-out of lifecycle events.
//!
//! One server (the daemon) and zero-or-more observer clients over a unix
//! domain socket. Events are newline-delimited JSON objects of the form
//! `{"type": ..., "timestamp": ..., "data": {...}}`. The publisher never
//! buffers or retries: a subscriber whose write fails is evicted and simply
//! misses future events.

mod client;
mod server;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Ticket, WorkerId};

pub use client::BusClient;
pub use server::EventBus;

/// Errors from the event bus. Per-subscriber write failures are handled by
/// eviction and never surface here.
#[derive(Debug, Error)]
pub enum BusError {
    /// Socket could not be created or connected.
    #[error("socket error at {path}: {source}")]
    Socket {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Observable state of a worker, as reported on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Working,
    Error,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Working => write!(f, "working"),
            WorkerState::Error => write!(f, "error"),
        }
    }
}

/// Payload of one event, tagged by type on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    QueueUpdated {
        queue_length: usize,
        next_ticket: Option<Ticket>,
    },
    TicketEnqueued {
        ticket: Ticket,
        message: String,
    },
    TicketStarted {
        ticket: Ticket,
        worker_id: WorkerId,
        message: String,
    },
    TicketComplete {
        ticket: Ticket,
        worker_id: WorkerId,
        message: String,
    },
    WorkerStatus {
        worker_id: WorkerId,
        status: WorkerState,
        current_ticket: Option<Ticket>,
        message: String,
    },
}

impl EventPayload {
    /// The wire name of this event's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            EventPayload::QueueUpdated { .. } => "queue_updated",
            EventPayload::TicketEnqueued { .. } => "ticket_enqueued",
            EventPayload::TicketStarted { .. } => "ticket_started",
            EventPayload::TicketComplete { .. } => "ticket_complete",
            EventPayload::WorkerStatus { .. } => "worker_status",
        }
    }
}

/// One event on the bus. Events are ephemeral; there is no historical store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Event {
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Expands a leading `~/` to the user's home directory. Paths without the
/// prefix are returned unchanged, as is `~/` when no home is known.
pub(crate) fn expand_socket_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
        tracing::warn!("could not determine home directory, using {path} as-is");
    }
    PathBuf::from(path)
}
