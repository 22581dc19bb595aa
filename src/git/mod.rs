//! Repository driver: all interaction with the shared bare repository.
//!
//! Every operation goes through the git CLI. Commands always receive their
//! target directory explicitly (`--git-dir` for the bare repository,
//! `current_dir` for worktrees); the process working directory is never
//! changed, so concurrent workers cannot corrupt each other's git state.
//!
//! Worktree and branch layout:
//! - one worktree per (worker, ticket) at `<workdir>/agent-<w>/<ticket-id>/`
//! - one branch per (worker, ticket) named `agent-<w>/<ticket-id>`

pub mod push;
pub mod worktree;

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use thiserror::Error;

use crate::types::Sha;

/// Errors from repository operations. Each variant carries the failing
/// operation and target path where applicable.
#[derive(Debug, Error)]
pub enum GitError {
    /// Git command exited non-zero.
    #[error("git {operation} failed at {path}: {stderr}")]
    CommandFailed {
        operation: String,
        path: String,
        stderr: String,
    },

    /// The target worktree directory already exists.
    #[error("worktree already exists at {0}")]
    WorktreeExists(PathBuf),

    /// The requested branch does not exist.
    #[error("branch not found: {0}")]
    BranchNotFound(String),

    /// Nothing staged; the worktree is clean.
    #[error("no changes to commit in {0}")]
    NoChanges(PathBuf),

    /// Pushing to the shared repository failed.
    #[error("push of {branch} failed: {stderr}")]
    PushFailed { branch: String, stderr: String },

    /// The git binary could not be run at all.
    #[error("git is not available: {0}")]
    GitUnavailable(std::io::Error),

    /// Command output was not in the expected shape.
    #[error("unexpected git output for {operation}: {detail}")]
    UnexpectedOutput { operation: String, detail: String },

    /// Filesystem error outside of git itself.
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result type for repository operations.
pub type GitResult<T> = Result<T, GitError>;

/// Identity used for commits created by the orchestrator itself (the initial
/// commit). Agent commits inherit the same identity.
const COMMIT_NAME: &str = "Agent Orchestrator";
const COMMIT_EMAIL: &str = "orchestrator@localhost";

/// Create a git Command with a clean environment (no system/user config).
///
/// This keeps behaviour consistent across machines by ignoring system and
/// user git configuration (hooks, aliases, rerere) and disables terminal
/// prompts. The commit identity is passed per-command so no repository
/// config is required.
pub(crate) fn git_command() -> Command {
    let mut cmd = Command::new("git");
    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.arg("-c");
    cmd.arg(format!("user.name={COMMIT_NAME}"));
    cmd.arg("-c");
    cmd.arg(format!("user.email={COMMIT_EMAIL}"));
    cmd
}

/// Run a git command in the given working directory, returning its output on
/// success.
pub(crate) fn run_git(workdir: &Path, args: &[&str]) -> GitResult<Output> {
    let output = git_command()
        .current_dir(workdir)
        .args(args)
        .output()
        .map_err(GitError::GitUnavailable)?;

    if output.status.success() {
        Ok(output)
    } else {
        Err(GitError::CommandFailed {
            operation: args.first().unwrap_or(&"git").to_string(),
            path: workdir.display().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run a git command and return trimmed stdout.
pub(crate) fn run_git_stdout(workdir: &Path, args: &[&str]) -> GitResult<String> {
    let output = run_git(workdir, args)?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Handle to the shared bare repository.
#[derive(Debug, Clone)]
pub struct Repo {
    path: PathBuf,
}

impl Repo {
    /// Creates a handle to a (possibly not yet initialised) bare repository.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Repo { path: path.into() }
    }

    /// Path of the bare repository.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Absolute path of the bare repository. Remote URLs must always be
    /// resolved through this before being handed to a worktree, because
    /// worktrees interpret relative paths against their own directory.
    pub fn abs_path(&self) -> GitResult<PathBuf> {
        std::fs::canonicalize(&self.path).map_err(|source| GitError::Io {
            path: self.path.clone(),
            source,
        })
    }

    /// Runs a git command against the bare repository via `--git-dir`.
    pub(crate) fn run_bare(&self, args: &[&str]) -> GitResult<Output> {
        let output = git_command()
            .arg("--git-dir")
            .arg(&self.path)
            .args(args)
            .output()
            .map_err(GitError::GitUnavailable)?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(GitError::CommandFailed {
                operation: args.first().unwrap_or(&"git").to_string(),
                path: self.path.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn run_bare_stdout(&self, args: &[&str]) -> GitResult<String> {
        let output = self.run_bare(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Initialises a bare repository at the handle's path, creating the
    /// directory if needed.
    pub fn init_bare(&self) -> GitResult<()> {
        std::fs::create_dir_all(&self.path).map_err(|source| GitError::Io {
            path: self.path.clone(),
            source,
        })?;

        let output = git_command()
            .args(["init", "--bare"])
            .arg(&self.path)
            .output()
            .map_err(GitError::GitUnavailable)?;

        if output.status.success() {
            Ok(())
        } else {
            Err(GitError::CommandFailed {
                operation: "init".to_string(),
                path: self.path.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    /// Produces a non-empty initial commit on `main` so that subsequent
    /// branches have a base. Works against a freshly-initialised bare
    /// repository by committing through a temporary clone.
    pub fn create_initial_commit(&self) -> GitResult<()> {
        let tmp = tempdir_for_init()?;
        let clone_dir = tmp.join("clone");
        let abs_repo = self.abs_path()?;

        let output = git_command()
            .arg("clone")
            .arg(&abs_repo)
            .arg(&clone_dir)
            .output()
            .map_err(GitError::GitUnavailable)?;
        if !output.status.success() {
            return Err(GitError::CommandFailed {
                operation: "clone".to_string(),
                path: self.path.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let readme = clone_dir.join("README.md");
        std::fs::write(
            &readme,
            "# Orchestrator Repository\n\nThis repository is managed by the agent orchestrator.\n",
        )
        .map_err(|source| GitError::Io {
            path: readme.clone(),
            source,
        })?;

        run_git(&clone_dir, &["checkout", "-B", "main"])?;
        run_git(&clone_dir, &["add", "README.md"])?;
        run_git(&clone_dir, &["commit", "-m", "Initial commit"])?;
        run_git(&clone_dir, &["push", "origin", "main"])?;

        // Point HEAD at main so clones and worktrees default to it.
        self.run_bare(&["symbolic-ref", "HEAD", "refs/heads/main"])?;

        let _ = std::fs::remove_dir_all(&tmp);
        Ok(())
    }

    /// Returns true if the given branch exists in the repository.
    pub fn branch_exists(&self, branch: &str) -> GitResult<bool> {
        let refspec = format!("refs/heads/{branch}");
        let output = git_command()
            .arg("--git-dir")
            .arg(&self.path)
            .args(["show-ref", "--verify", "--quiet", refspec.as_str()])
            .output()
            .map_err(GitError::GitUnavailable)?;

        match output.status.code() {
            Some(0) => Ok(true),
            // Exit 1 means the ref does not exist, which is not an error.
            Some(1) => Ok(false),
            _ => Err(GitError::CommandFailed {
                operation: "show-ref".to_string(),
                path: self.path.display().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    /// Determines the default branch: `main` preferred, `master` accepted as
    /// a legacy fallback.
    pub fn default_branch(&self) -> GitResult<String> {
        if self.branch_exists("main")? {
            return Ok("main".to_string());
        }
        if self.branch_exists("master")? {
            return Ok("master".to_string());
        }
        Err(GitError::BranchNotFound(
            "neither 'main' nor 'master' exists".to_string(),
        ))
    }

    /// Returns the commit hash at the tip of a branch.
    pub fn branch_commit(&self, branch: &str) -> GitResult<Sha> {
        if !self.branch_exists(branch)? {
            return Err(GitError::BranchNotFound(branch.to_string()));
        }
        let sha = self.run_bare_stdout(&["rev-parse", &format!("refs/heads/{branch}")])?;
        Sha::parse(&sha).map_err(|e| GitError::UnexpectedOutput {
            operation: "rev-parse".to_string(),
            detail: e.to_string(),
        })
    }

    /// Returns the number of commits reachable from a branch.
    pub fn commit_count(&self, branch: &str) -> GitResult<usize> {
        if !self.branch_exists(branch)? {
            return Err(GitError::BranchNotFound(branch.to_string()));
        }
        let count = self.run_bare_stdout(&["rev-list", "--count", branch])?;
        count.parse().map_err(|_| GitError::UnexpectedOutput {
            operation: "rev-list".to_string(),
            detail: format!("non-numeric commit count: {count}"),
        })
    }

    /// Lists local branches.
    pub fn list_branches(&self) -> GitResult<Vec<String>> {
        let output =
            self.run_bare_stdout(&["for-each-ref", "--format=%(refname:short)", "refs/heads"])?;
        Ok(output
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect())
    }
}

fn tempdir_for_init() -> GitResult<PathBuf> {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let dir = std::env::temp_dir().join(format!(
        "orchestrator-init-{}-{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::create_dir_all(&dir).map_err(|source| GitError::Io {
        path: dir.clone(),
        source,
    })?;
    Ok(dir)
}
