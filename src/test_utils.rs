//! Shared fixtures for unit and integration tests.

use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};

use crate::types::{Sha, Ticket, TicketId};

/// A valid ticket with a fixed creation time, so ordering tests are
/// deterministic.
pub fn make_ticket(id: &str, priority: u8) -> Ticket {
    make_ticket_at(
        id,
        priority,
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
    )
}

/// A valid ticket with an explicit creation time.
pub fn make_ticket_at(id: &str, priority: u8, created_at: DateTime<Utc>) -> Ticket {
    Ticket {
        id: TicketId::from(id),
        title: format!("Ticket {id}"),
        description: format!("Description of {id}"),
        priority,
        locks: Vec::new(),
        dependencies: Vec::new(),
        estimate_min: None,
        tags: Vec::new(),
        created_at: Some(created_at),
        updated_at: Some(created_at),
        extra: Default::default(),
    }
}

/// Minimal valid ticket YAML for backlog fixtures.
pub fn ticket_yaml(id: &str, priority: u8) -> String {
    format!(
        "id: {id}\ntitle: Ticket {id}\ndescription: Description of {id}\npriority: {priority}\n"
    )
}

/// Writes a CI verdict file the way the CI collaborator would.
pub fn write_verdict(dir: &Path, commit: &Sha, status: &str, output: &str) {
    let verdict = serde_json::json!({
        "ref": "refs/heads/agent-1/test",
        "commit": commit.as_str(),
        "status": status,
        "timestamp": "2025-01-01T00:00:00Z",
        "output": output,
    });
    std::fs::write(
        dir.join(format!("{commit}.json")),
        serde_json::to_string_pretty(&verdict).unwrap(),
    )
    .unwrap();
}
