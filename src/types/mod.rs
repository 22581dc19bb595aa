//! Core domain types for the orchestrator.

mod ids;
mod ticket;

pub use ids::{InvalidSha, Sha, TicketId, WorkerId};
pub use ticket::{Ticket, TicketError};
