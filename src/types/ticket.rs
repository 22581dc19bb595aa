//! The ticket: one unit of work described by a YAML document.
//!
//! Tickets are submitted by dropping YAML files into the backlog directory.
//! The scheduler reads the fields below; unknown fields are preserved on
//! pass-through (they survive a YAML round-trip and appear in events) but are
//! never interpreted.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::TicketId;

/// Errors from loading or validating a ticket.
#[derive(Debug, Error)]
pub enum TicketError {
    /// Ticket file could not be read.
    #[error("failed to read ticket file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    /// Ticket YAML could not be parsed.
    #[error("failed to parse ticket YAML: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A required field is missing or out of range. The message names the
    /// first failing field.
    #[error("invalid ticket: {0}")]
    Invalid(String),
}

/// A feature request to be completed by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: TicketId,
    pub title: String,
    pub description: String,
    /// 1 is the highest priority, 5 the lowest.
    pub priority: u8,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locks: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<TicketId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate_min: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Fields the scheduler does not interpret, preserved verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

impl Ticket {
    /// Loads a ticket from a YAML file, filling absent timestamps and
    /// validating required fields.
    pub fn load(path: &Path) -> Result<Ticket, TicketError> {
        let data = std::fs::read_to_string(path).map_err(|source| TicketError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&data)
    }

    /// Parses a ticket from YAML text, filling absent timestamps and
    /// validating required fields.
    pub fn from_yaml(data: &str) -> Result<Ticket, TicketError> {
        let mut ticket: Ticket = serde_yaml::from_str(data)?;

        let now = Utc::now();
        if ticket.created_at.is_none() {
            ticket.created_at = Some(now);
        }
        if ticket.updated_at.is_none() {
            ticket.updated_at = Some(now);
        }

        ticket.validate()?;
        Ok(ticket)
    }

    /// Serializes the ticket back to YAML.
    pub fn to_yaml(&self) -> Result<String, TicketError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Checks that all required fields are present and valid. The error
    /// names the first failing field.
    pub fn validate(&self) -> Result<(), TicketError> {
        if self.id.as_str().is_empty() {
            return Err(TicketError::Invalid("id must not be empty".into()));
        }
        if self.title.is_empty() {
            return Err(TicketError::Invalid("title must not be empty".into()));
        }
        if self.description.is_empty() {
            return Err(TicketError::Invalid(
                "description must not be empty".into(),
            ));
        }
        if !(1..=5).contains(&self.priority) {
            return Err(TicketError::Invalid(
                "priority must be between 1 and 5".into(),
            ));
        }
        Ok(())
    }

    /// Creation timestamp used for queue ordering. Tickets loaded through
    /// [`Ticket::load`] always carry one; the epoch fallback only applies to
    /// hand-built values.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }
}
