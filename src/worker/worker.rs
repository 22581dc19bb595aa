//! One worker: the claim loop and the per-ticket pipeline.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, WorkerState};
use crate::ci::{CiError, CiOutcome, StatusReader};
use crate::git::{GitError, Repo};
use crate::queue::TicketQueue;
use crate::types::{Sha, Ticket, WorkerId};

/// Default argv of the code-generation collaborator.
const DEFAULT_GENERATOR: &[&str] = &["amp", "--no-notifications"];

/// Name of the CI collaborator script, resolved near the daemon executable
/// when no explicit command is configured.
const CI_SCRIPT_NAME: &str = "ci.sh";

/// Errors from one pipeline run. Every variant is caught at the pipeline
/// boundary: the worker finalises and returns to idle, it never dies.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A repository operation failed.
    #[error(transparent)]
    Git(#[from] GitError),

    /// The external command could not be launched at all.
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// The generator ran but exited non-zero.
    #[error("generator {program} exited with {status}")]
    Generator {
        program: String,
        status: std::process::ExitStatus,
    },

    /// CI reported FAIL, or the CI collaborator itself failed.
    #[error("CI failed for {branch}: {output}")]
    CiFailed { branch: String, output: String },

    /// No verdict appeared within the budget.
    #[error("timed out waiting for CI verdict after {timeout:?}")]
    CiTimeout { timeout: Duration },

    /// A verdict file existed but could not be read.
    #[error("CI status error: {0}")]
    Ci(#[from] CiError),

    /// Filesystem failure outside the repository.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: WorkerId,
    /// Root under which this worker materialises worktrees.
    pub workdir: PathBuf,
    /// Argv of the code-generation collaborator.
    pub generator: Vec<String>,
    /// CI collaborator command. When unset, `ci.sh` is resolved relative to
    /// the daemon executable, falling back to the current directory.
    pub ci_command: Option<PathBuf>,
    /// Idle claim-loop tick.
    pub poll_period: Duration,
    /// Interval between verdict checks.
    pub verdict_poll: Duration,
    /// Budget for the verdict to appear.
    pub verdict_timeout: Duration,
    /// Test hook: replace generation with deterministic synthesised files.
    pub skip_generator: bool,
    /// Test hook: treat the push as success, bypassing CI entirely.
    pub skip_ci: bool,
}

impl WorkerConfig {
    pub fn new(id: WorkerId, workdir: impl Into<PathBuf>) -> Self {
        WorkerConfig {
            id,
            workdir: workdir.into(),
            generator: DEFAULT_GENERATOR.iter().map(|s| s.to_string()).collect(),
            ci_command: None,
            poll_period: Duration::from_secs(2),
            verdict_poll: Duration::from_secs(1),
            verdict_timeout: Duration::from_secs(30),
            skip_generator: false,
            skip_ci: false,
        }
    }
}

/// Point-in-time view of a worker, for status reporting.
#[derive(Debug, Clone)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub state: WorkerState,
    pub current_ticket: Option<Ticket>,
}

/// A single long-lived worker. Created once at pool construction and only
/// ever signalled to stop, never recreated.
pub struct Worker {
    config: WorkerConfig,
    repo: Arc<Repo>,
    queue: Arc<TicketQueue>,
    ci: StatusReader,
    bus: Option<Arc<EventBus>>,
    current: Option<Ticket>,
    worktree: Option<PathBuf>,
    snapshot: Arc<RwLock<WorkerSnapshot>>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        repo: Arc<Repo>,
        queue: Arc<TicketQueue>,
        ci: StatusReader,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let snapshot = Arc::new(RwLock::new(WorkerSnapshot {
            id: config.id,
            state: WorkerState::Idle,
            current_ticket: None,
        }));

        Worker {
            config,
            repo,
            queue,
            ci,
            bus,
            current: None,
            worktree: None,
            snapshot,
        }
    }

    /// Shared handle to this worker's status snapshot, for the daemon's
    /// periodic status log.
    pub fn snapshot_handle(&self) -> Arc<RwLock<WorkerSnapshot>> {
        Arc::clone(&self.snapshot)
    }

    /// Runs the claim loop until cancelled.
    ///
    /// Cancellation is only observed between tickets: a pipeline in flight
    /// runs to completion (its external steps are expected to self-bound),
    /// so graceful shutdown is bounded by the longest external step.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), PipelineError> {
        let worker_dir = self.config.workdir.join(self.config.id.dir_name());
        std::fs::create_dir_all(&worker_dir)?;

        info!(worker = %self.config.id, "worker starting");

        let mut ticker = tokio::time::interval(self.config.poll_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(worker = %self.config.id, "worker stopping");
                    self.teardown_worktree();
                    break;
                }
                _ = ticker.tick() => {
                    if self.current.is_none() {
                        if let Some(ticket) = self.queue.pop() {
                            if self.admit(&ticket) {
                                info!(worker = %self.config.id, ticket = %ticket.id, "picked up ticket");
                                self.process_ticket(ticket).await;
                            } else {
                                self.queue.push(ticket);
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Admission check between claim and assignment. Tickets record
    /// `dependencies` and `locks` but the scheduler does not yet enforce
    /// them; an admission step that defers tickets with unsatisfied
    /// dependencies or conflicting lock sets slots in here, requeueing
    /// instead of assigning.
    fn admit(&self, _ticket: &Ticket) -> bool {
        true
    }

    /// Drives one ticket through the pipeline. Every exit path clears the
    /// assignment, tears down the worktree and publishes terminal events.
    pub(crate) async fn process_ticket(&mut self, ticket: Ticket) {
        self.current = Some(ticket.clone());
        self.set_snapshot(WorkerState::Working, Some(ticket.clone()));

        if let Some(bus) = &self.bus {
            bus.publish_ticket_started(ticket.clone(), self.config.id).await;
            bus.publish_worker_status(
                self.config.id,
                WorkerState::Working,
                Some(ticket.clone()),
                format!("Processing ticket {}", ticket.id),
            )
            .await;
        }

        let branch = self.config.id.branch_for(&ticket.id);
        let worktree_path = self
            .config
            .workdir
            .join(self.config.id.dir_name())
            .join(ticket.id.as_str());

        // A worktree left over from a previous failed teardown would make
        // add_worktree refuse; clear it first.
        self.teardown_worktree();

        let worktree = match self.repo.add_worktree(&worktree_path, &branch) {
            Ok(path) => {
                self.worktree = Some(path.clone());
                path
            }
            Err(e) => {
                // Workspace failure is the one path with no branch or commit
                // side effects: just release the worker.
                warn!(worker = %self.config.id, ticket = %ticket.id, error = %e,
                      "failed to create worktree");
                self.current = None;
                self.set_snapshot(WorkerState::Idle, None);
                if let Some(bus) = &self.bus {
                    bus.publish_worker_status(
                        self.config.id,
                        WorkerState::Idle,
                        None,
                        format!("Ticket {} failed: {e}", ticket.id),
                    )
                    .await;
                }
                return;
            }
        };

        let outcome = self.run_stages(&ticket, &branch, &worktree).await;

        // Finalisation, on success and failure alike.
        self.teardown_worktree();
        self.current = None;
        self.set_snapshot(WorkerState::Idle, None);

        match outcome {
            Ok(()) => {
                info!(worker = %self.config.id, ticket = %ticket.id, "completed ticket");
                if let Some(bus) = &self.bus {
                    bus.publish_ticket_complete(ticket.clone(), self.config.id).await;
                    bus.publish_worker_status(
                        self.config.id,
                        WorkerState::Idle,
                        None,
                        format!("Completed ticket {}", ticket.id),
                    )
                    .await;
                }
            }
            Err(e) => {
                warn!(worker = %self.config.id, ticket = %ticket.id, error = %e,
                      "ticket pipeline failed");
                if let Some(bus) = &self.bus {
                    bus.publish_worker_status(
                        self.config.id,
                        WorkerState::Idle,
                        None,
                        format!("Ticket {} failed: {e}", ticket.id),
                    )
                    .await;
                }
            }
        }
    }

    /// Pipeline steps 3-6: generate, commit and push, trigger CI, await the
    /// verdict.
    async fn run_stages(
        &self,
        ticket: &Ticket,
        branch: &str,
        worktree: &Path,
    ) -> Result<(), PipelineError> {
        if self.config.skip_generator {
            self.write_synthesised_files(ticket, worktree)?;
        } else {
            self.run_generator(ticket, worktree).await?;
        }

        let message = commit_message(ticket, self.config.id);
        let commit = self.repo.commit_all_and_push(worktree, &message)?;
        info!(worker = %self.config.id, ticket = %ticket.id, commit = commit.short(),
              "committed and pushed");

        if self.config.skip_ci {
            debug!(worker = %self.config.id, "CI skipped");
            return Ok(());
        }

        self.trigger_ci(branch, &commit).await?;
        self.wait_for_verdict(branch, &commit).await
    }

    /// Invokes the code-generation collaborator with the worktree as its
    /// working directory and the prompt on stdin.
    async fn run_generator(&self, ticket: &Ticket, worktree: &Path) -> Result<(), PipelineError> {
        let (program, args) = match self.config.generator.split_first() {
            Some((program, args)) => (program.clone(), args),
            None => (DEFAULT_GENERATOR[0].to_string(), &[][..]),
        };

        info!(worker = %self.config.id, ticket = %ticket.id, program = %program,
              "generating implementation");

        let mut child = tokio::process::Command::new(&program)
            .args(args)
            .current_dir(worktree)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| PipelineError::Spawn {
                program: program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(build_prompt(ticket).as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            warn!(worker = %self.config.id, output = %combined.trim(),
                  "generator failed");
            return Err(PipelineError::Generator {
                program,
                status: output.status,
            });
        }

        Ok(())
    }

    /// `skip_generator` replacement: deterministic files derived from the
    /// ticket, so the rest of the pipeline has something to commit.
    fn write_synthesised_files(&self, ticket: &Ticket, worktree: &Path) -> std::io::Result<()> {
        let readme = format!(
            "# {}\n\n{}\n\nImplemented by agent {}.\n",
            ticket.title, ticket.description, self.config.id
        );
        std::fs::write(worktree.join("README.md"), readme)?;

        let notes = format!(
            "ticket: {}\npriority: {}\nagent: {}\n",
            ticket.id, ticket.priority, self.config.id
        );
        std::fs::write(worktree.join("implementation.txt"), notes)?;

        debug!(worker = %self.config.id, "wrote synthesised implementation");
        Ok(())
    }

    /// Invokes the CI collaborator as `<cmd> <repo_path> <ref> <commit>`.
    /// Any failure of the invocation itself counts as a CI failure.
    async fn trigger_ci(&self, branch: &str, commit: &Sha) -> Result<(), PipelineError> {
        let command = self.resolve_ci_command();
        let repo_path = self.repo.abs_path()?;
        let ref_name = format!("refs/heads/{branch}");

        info!(worker = %self.config.id, branch, commit = commit.short(), "triggering CI");

        let output = tokio::process::Command::new(&command)
            .arg(&repo_path)
            .arg(&ref_name)
            .arg(commit.as_str())
            .output()
            .await
            .map_err(|e| PipelineError::CiFailed {
                branch: branch.to_string(),
                output: format!("failed to launch {}: {e}", command.display()),
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(PipelineError::CiFailed {
                branch: branch.to_string(),
                output: combined.trim().to_string(),
            });
        }

        Ok(())
    }

    fn resolve_ci_command(&self) -> PathBuf {
        if let Some(command) = &self.config.ci_command {
            return command.clone();
        }

        // By convention the CI script lives in the project root, one level
        // above the daemon binary's directory.
        if let Ok(exe) = std::env::current_exe() {
            if let Some(root) = exe.parent().and_then(|bin| bin.parent()) {
                let candidate = root.join(CI_SCRIPT_NAME);
                if candidate.exists() {
                    return candidate;
                }
            }
        }
        PathBuf::from(CI_SCRIPT_NAME)
    }

    /// Polls the status directory for the commit's verdict.
    ///
    /// A verdict present at the moment of a check always wins over the
    /// deadline; timeout fires only when the verdict is still absent at the
    /// boundary check.
    async fn wait_for_verdict(&self, branch: &str, commit: &Sha) -> Result<(), PipelineError> {
        info!(worker = %self.config.id, branch, commit = commit.short(),
              "waiting for CI verdict");

        let deadline = tokio::time::Instant::now() + self.config.verdict_timeout;
        loop {
            if self.ci.has_status(commit) {
                let verdict = self.ci.get_status(commit)?;
                return match verdict.status {
                    CiOutcome::Pass => {
                        info!(worker = %self.config.id, branch, "CI passed");
                        Ok(())
                    }
                    CiOutcome::Fail => Err(PipelineError::CiFailed {
                        branch: branch.to_string(),
                        output: verdict.output,
                    }),
                };
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(PipelineError::CiTimeout {
                    timeout: self.config.verdict_timeout,
                });
            }

            tokio::time::sleep(self.config.verdict_poll).await;
        }
    }

    /// Removes the tracked worktree, if any. Removal failures are logged;
    /// the path stays tracked for another attempt before the next ticket.
    fn teardown_worktree(&mut self) {
        if let Some(path) = self.worktree.take() {
            debug!(worker = %self.config.id, worktree = %path.display(),
                   "removing worktree");
            if let Err(e) = self.repo.remove_worktree(&path) {
                warn!(worker = %self.config.id, worktree = %path.display(), error = %e,
                      "failed to remove worktree");
                self.worktree = Some(path);
            }
        }
    }

    fn set_snapshot(&self, state: WorkerState, current_ticket: Option<Ticket>) {
        let mut snapshot = self.snapshot.write().unwrap();
        snapshot.state = state;
        snapshot.current_ticket = current_ticket;
    }
}

/// Commit message carrying the ticket title, description and the generating
/// worker marker.
fn commit_message(ticket: &Ticket, worker: WorkerId) -> String {
    format!(
        "Implement {}\n\n{}\n\nGenerated by agent {}",
        ticket.title, ticket.description, worker
    )
}

/// Builds the generator prompt from the ticket.
fn build_prompt(ticket: &Ticket) -> String {
    use std::fmt::Write;

    let mut prompt = format!(
        "You are an AI coding agent working on ticket {}: {}\n\n\
         Description: {}\nPriority: {}\n\n",
        ticket.id, ticket.title, ticket.description, ticket.priority
    );

    if !ticket.dependencies.is_empty() {
        prompt.push_str("Dependencies (these should already be implemented):\n");
        for dep in &ticket.dependencies {
            let _ = writeln!(prompt, "- {dep}");
        }
        prompt.push('\n');
    }

    if !ticket.locks.is_empty() {
        prompt.push_str("This ticket locks the following components (avoid conflicts):\n");
        for lock in &ticket.locks {
            let _ = writeln!(prompt, "- {lock}");
        }
        prompt.push('\n');
    }

    if !ticket.tags.is_empty() {
        let _ = writeln!(prompt, "Tags: {}\n", ticket.tags.join(", "));
    }

    prompt.push_str(
        "Please implement this feature completely. Create all necessary source \
         files, build configuration and a README with usage instructions.\n\n\
         Make sure the implementation is production-ready, includes proper error \
         handling, and follows the project's conventions.\n\n\
         Work in the current directory. Do not explain what you're doing, just \
         implement the solution.\n",
    );

    prompt
}
