//! Worktree management for per-ticket isolation.
//!
//! Each (worker, ticket) pair gets its own worktree checked out to the pair's
//! reserved branch. A worktree is owned by exactly one worker, created at
//! ticket start and destroyed on every pipeline exit path.

use std::path::{Path, PathBuf};

use super::{GitError, GitResult, Repo};

impl Repo {
    /// Creates a worktree at `worktree_path` checked out to `branch`.
    ///
    /// If the branch already exists it is checked out; otherwise it is
    /// created from the default branch. Fails with
    /// [`GitError::WorktreeExists`] if the path already exists; stale
    /// worktrees must be removed explicitly, never silently reused.
    ///
    /// Returns the absolute path of the worktree.
    pub fn add_worktree(&self, worktree_path: &Path, branch: &str) -> GitResult<PathBuf> {
        if worktree_path.exists() {
            return Err(GitError::WorktreeExists(worktree_path.to_path_buf()));
        }

        if let Some(parent) = worktree_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| GitError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let path_str = worktree_path.to_string_lossy().to_string();
        if self.branch_exists(branch)? {
            self.run_bare(&["worktree", "add", &path_str, branch])?;
        } else {
            let base = self.default_branch()?;
            self.run_bare(&["worktree", "add", "-b", branch, &path_str, &base])?;
        }

        std::fs::canonicalize(worktree_path).map_err(|source| GitError::Io {
            path: worktree_path.to_path_buf(),
            source,
        })
    }

    /// Forcibly removes a worktree, tolerating dirty state. Idempotent: a
    /// missing worktree is not an error.
    pub fn remove_worktree(&self, worktree_path: &Path) -> GitResult<()> {
        if !worktree_path.exists() {
            return Ok(());
        }

        let path_str = worktree_path.to_string_lossy().to_string();
        self.run_bare(&["worktree", "remove", "--force", &path_str])?;
        Ok(())
    }

    /// Prunes stale worktree metadata for directories that no longer exist.
    pub fn prune_worktrees(&self) -> GitResult<()> {
        self.run_bare(&["worktree", "prune"])?;
        Ok(())
    }
}
