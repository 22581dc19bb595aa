//! Newtype wrappers for domain identifiers.
//!
//! These types prevent accidental mixing of different identifiers (e.g., using
//! a ticket id where a branch name is expected) and make the code more
//! self-documenting.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Error returned when parsing an invalid SHA.
#[derive(Debug, Clone, Error)]
#[error("invalid SHA: expected 40 hex characters, got {len} bytes: {preview}")]
pub struct InvalidSha {
    len: usize,
    preview: String,
}

/// The identifier of a ticket, unique within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TicketId(pub String);

impl TicketId {
    pub fn new(s: impl Into<String>) -> Self {
        TicketId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TicketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TicketId {
    fn from(s: &str) -> Self {
        TicketId(s.to_string())
    }
}

/// A worker's identity: a small integer assigned at pool construction,
/// starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl WorkerId {
    /// Returns the branch name reserved for this worker and ticket:
    /// `agent-<worker-id>/<ticket-id>`.
    pub fn branch_for(&self, ticket: &TicketId) -> String {
        format!("agent-{}/{}", self.0, ticket)
    }

    /// Returns the directory name owned by this worker under the workdir.
    pub fn dir_name(&self) -> String {
        format!("agent-{}", self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A git commit SHA (40 hex characters).
///
/// This type guarantees that the contained string is exactly 40 lowercase hex
/// characters. Construction is only possible via `Sha::parse`, which validates
/// the input.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha(String);

impl Sha {
    /// Parses a string as a SHA, validating that it is exactly 40 hex
    /// characters.
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidSha> {
        let s = s.into();
        if s.len() == 40 && s.chars().all(|c| c.is_ascii_hexdigit()) {
            // Normalize to lowercase for consistent comparison
            Ok(Sha(s.to_ascii_lowercase()))
        } else {
            Err(InvalidSha {
                len: s.len(),
                preview: s.chars().take(20).collect(),
            })
        }
    }

    /// Returns the SHA as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a short (8-character) version of the SHA for display.
    pub fn short(&self) -> &str {
        &self.0[..8]
    }
}

impl fmt::Display for Sha {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for Sha {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Sha::parse(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha_parse_valid() {
        let sha = Sha::parse("a".repeat(40)).unwrap();
        assert_eq!(sha.as_str().len(), 40);
    }

    #[test]
    fn sha_parse_normalizes_case() {
        let sha = Sha::parse("ABCDEF1234567890abcdef1234567890abcdef12").unwrap();
        assert_eq!(sha.as_str(), "abcdef1234567890abcdef1234567890abcdef12");
    }

    #[test]
    fn sha_parse_rejects_short() {
        assert!(Sha::parse("abc123").is_err());
    }

    #[test]
    fn sha_parse_rejects_non_hex() {
        assert!(Sha::parse("z".repeat(40)).is_err());
    }

    #[test]
    fn sha_short_is_eight_chars() {
        let sha = Sha::parse("0123456789abcdef0123456789abcdef01234567").unwrap();
        assert_eq!(sha.short(), "01234567");
    }

    #[test]
    fn branch_name_format() {
        let branch = WorkerId(2).branch_for(&TicketId::from("feat-1"));
        assert_eq!(branch, "agent-2/feat-1");
    }

    #[test]
    fn worker_dir_name() {
        assert_eq!(WorkerId(3).dir_name(), "agent-3");
    }
}
