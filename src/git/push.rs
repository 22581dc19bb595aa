//! Staging, committing and publishing agent output.
//!
//! All commands run with the worktree passed as the command's working
//! directory; the orchestrator's own working directory is left untouched.
//! The origin remote is always (re)pointed at the absolute path of the bare
//! repository, resolved before any command runs, because a relative URL would
//! be interpreted against the worktree.

use std::path::Path;

use super::{run_git, run_git_stdout, GitError, GitResult, Repo};
use crate::types::Sha;

impl Repo {
    /// Stages every change in the worktree, commits with `message`, and
    /// pushes the worktree's current branch to the bare repository.
    ///
    /// Fails with [`GitError::NoChanges`] when the worktree is clean, so
    /// callers can distinguish "generator produced nothing" from a real
    /// failure. Returns the new commit hash.
    pub fn commit_all_and_push(&self, worktree: &Path, message: &str) -> GitResult<Sha> {
        let abs_repo = self.abs_path()?;

        run_git(worktree, &["add", "."])?;

        let status = run_git_stdout(worktree, &["status", "--porcelain"])?;
        if status.is_empty() {
            return Err(GitError::NoChanges(worktree.to_path_buf()));
        }

        run_git(worktree, &["commit", "-m", message])?;

        let hash = run_git_stdout(worktree, &["rev-parse", "HEAD"])?;
        let sha = Sha::parse(&hash).map_err(|e| GitError::UnexpectedOutput {
            operation: "rev-parse".to_string(),
            detail: e.to_string(),
        })?;

        let branch = run_git_stdout(worktree, &["branch", "--show-current"])?;
        if branch.is_empty() {
            return Err(GitError::UnexpectedOutput {
                operation: "branch --show-current".to_string(),
                detail: "worktree is in detached HEAD state".to_string(),
            });
        }

        self.configure_origin(worktree, &abs_repo)?;

        let push = super::git_command()
            .current_dir(worktree)
            .args(["push", "origin", branch.as_str()])
            .output()
            .map_err(GitError::GitUnavailable)?;
        if !push.status.success() {
            return Err(GitError::PushFailed {
                branch,
                stderr: String::from_utf8_lossy(&push.stderr).trim().to_string(),
            });
        }

        Ok(sha)
    }

    /// Points the worktree's `origin` remote at the bare repository,
    /// reconfiguring it if it already exists.
    fn configure_origin(&self, worktree: &Path, abs_repo: &Path) -> GitResult<()> {
        let url = abs_repo.to_string_lossy().to_string();
        if run_git(worktree, &["remote", "add", "origin", &url]).is_err() {
            // Remote already exists; repoint it.
            run_git(worktree, &["remote", "set-url", "origin", &url])?;
        }
        Ok(())
    }
}
