//! Priority queue for pending tickets.
//!
//! Tickets are ordered by priority (1 is highest, 5 lowest), then by creation
//! time, then by insertion order (FIFO within the same priority level). The
//! queue is safe under concurrent callers: the watcher pushes while any number
//! of workers race to pop, and exactly one worker claims any given ticket.

use std::collections::BinaryHeap;
use std::fmt;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::types::{Ticket, TicketId};

/// An entry in the priority queue.
///
/// Entries are ordered by:
/// 1. Priority (smaller number first)
/// 2. Ticket creation time (earlier first)
/// 3. Sequence number (lower first, FIFO)
#[derive(Debug, Clone)]
struct QueuedTicket {
    ticket: Ticket,
    /// Creation time resolved at enqueue, so ordering is stable even if the
    /// ticket is mutated later.
    created_at: DateTime<Utc>,
    /// Sequence number for FIFO ordering within the same priority level.
    sequence: u64,
}

impl PartialEq for QueuedTicket {
    fn eq(&self, other: &Self) -> bool {
        self.ticket.priority == other.ticket.priority
            && self.created_at == other.created_at
            && self.sequence == other.sequence
    }
}

impl Eq for QueuedTicket {}

impl PartialOrd for QueuedTicket {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTicket {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; reverse every comparison so that the
        // smallest (priority, created_at, sequence) triple pops first.
        other
            .ticket
            .priority
            .cmp(&self.ticket.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<QueuedTicket>,
    /// Counter for generating sequence numbers. Never reset, so FIFO
    /// guarantees survive `clear()`.
    next_sequence: u64,
}

/// A thread-safe priority queue of tickets.
///
/// `push`/`pop`/`remove`/`clear` serialise as writers; `peek`/`len`/`list`
/// take the read lock and observe a consistent snapshot per call.
#[derive(Debug, Default)]
pub struct TicketQueue {
    inner: RwLock<Inner>,
}

impl TicketQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        TicketQueue::default()
    }

    /// Pushes a ticket onto the queue.
    pub fn push(&self, ticket: Ticket) {
        let created_at = ticket.created_at();
        let mut inner = self.inner.write().unwrap();
        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.heap.push(QueuedTicket {
            ticket,
            created_at,
            sequence,
        });
    }

    /// Pops the highest-priority ticket. Returns `None` if the queue is
    /// empty; never blocks waiting for work.
    pub fn pop(&self) -> Option<Ticket> {
        let mut inner = self.inner.write().unwrap();
        inner.heap.pop().map(|entry| entry.ticket)
    }

    /// Returns a copy of the highest-priority ticket without removing it.
    pub fn peek(&self) -> Option<Ticket> {
        let inner = self.inner.read().unwrap();
        inner.heap.peek().map(|entry| entry.ticket.clone())
    }

    /// Returns the number of tickets in the queue.
    pub fn len(&self) -> usize {
        let inner = self.inner.read().unwrap();
        inner.heap.len()
    }

    /// Returns true if the queue has no tickets.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a copy of all queued tickets in pop order, so callers can
    /// traverse without holding the lock.
    pub fn list(&self) -> Vec<Ticket> {
        let inner = self.inner.read().unwrap();
        let mut entries: Vec<QueuedTicket> = inner.heap.iter().cloned().collect();
        // Our Ord is inverted for the max-heap, so descending order here is
        // ascending pop order.
        entries.sort_by(|a, b| b.cmp(a));
        entries.into_iter().map(|entry| entry.ticket).collect()
    }

    /// Removes the ticket with the given id. Returns true if it was found.
    pub fn remove(&self, ticket_id: &TicketId) -> bool {
        let mut inner = self.inner.write().unwrap();
        let before = inner.heap.len();
        let entries = std::mem::take(&mut inner.heap);
        inner.heap = entries
            .into_iter()
            .filter(|entry| &entry.ticket.id != ticket_id)
            .collect();
        inner.heap.len() < before
    }

    /// Removes all tickets from the queue.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        inner.heap.clear();
    }
}

impl fmt::Display for TicketQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tickets = self.list();
        if tickets.is_empty() {
            return write!(f, "Queue: empty");
        }

        writeln!(f, "Queue ({} tickets):", tickets.len())?;
        for (i, t) in tickets.iter().enumerate() {
            writeln!(f, "  {}. [P{}] {}: {}", i + 1, t.priority, t.id, t.title)?;
        }
        Ok(())
    }
}
