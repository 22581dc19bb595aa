//! Read-only view over the CI verdict directory.
//!
//! The external CI collaborator writes one JSON file per commit, named
//! `<commit-hash>.json`. The orchestrator only ever reads these files; a
//! missing file means "no verdict yet" and is distinct from a failure.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Sha;

/// Errors from reading CI verdicts.
#[derive(Debug, Error)]
pub enum CiError {
    /// No verdict has been written for this commit yet.
    #[error("no CI verdict for commit {0}")]
    NotFound(Sha),

    /// The verdict file exists but could not be read.
    #[error("failed to read CI verdict {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The verdict file exists but is not valid verdict JSON. Never treated
    /// as a FAIL; the caller must surface this.
    #[error("failed to parse CI verdict {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Outcome recorded by the CI collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CiOutcome {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "FAIL")]
    Fail,
}

/// One CI verdict, keyed by commit hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CiVerdict {
    /// The ref that was tested, e.g. `refs/heads/agent-1/feat-1`.
    #[serde(rename = "ref")]
    pub ref_name: String,
    pub commit: Sha,
    pub status: CiOutcome,
    pub timestamp: DateTime<Utc>,
    /// Captured test output, used as failure context.
    pub output: String,
}

/// Reader over a directory of verdict files.
#[derive(Debug, Clone)]
pub struct StatusReader {
    status_dir: PathBuf,
}

impl StatusReader {
    pub fn new(status_dir: impl Into<PathBuf>) -> Self {
        StatusReader {
            status_dir: status_dir.into(),
        }
    }

    fn verdict_path(&self, commit: &Sha) -> PathBuf {
        self.status_dir.join(format!("{commit}.json"))
    }

    /// Returns true if a verdict file exists for the commit.
    pub fn has_status(&self, commit: &Sha) -> bool {
        self.verdict_path(commit).exists()
    }

    /// Reads the verdict for a commit.
    pub fn get_status(&self, commit: &Sha) -> Result<CiVerdict, CiError> {
        let path = self.verdict_path(commit);
        let data = std::fs::read_to_string(&path).map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                CiError::NotFound(commit.clone())
            } else {
                CiError::Read {
                    path: path.clone(),
                    source,
                }
            }
        })?;

        serde_json::from_str(&data).map_err(|source| CiError::Parse { path, source })
    }

    /// Returns true if the commit's verdict is PASS.
    pub fn is_passing(&self, commit: &Sha) -> Result<bool, CiError> {
        Ok(self.get_status(commit)?.status == CiOutcome::Pass)
    }

    /// Reads every verdict in the status directory. An empty or missing
    /// directory yields an empty list.
    pub fn list_statuses(&self) -> Result<Vec<CiVerdict>, CiError> {
        let entries = match std::fs::read_dir(&self.status_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CiError::Read {
                    path: self.status_dir.clone(),
                    source,
                })
            }
        };

        let mut verdicts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| CiError::Read {
                path: self.status_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let data = std::fs::read_to_string(&path).map_err(|source| CiError::Read {
                path: path.clone(),
                source,
            })?;
            let verdict =
                serde_json::from_str(&data).map_err(|source| CiError::Parse { path, source })?;
            verdicts.push(verdict);
        }

        Ok(verdicts)
    }
}
