//! End-to-end pipeline tests: real repository, real worktrees, real event
//! bus, with the generator and CI collaborators replaced by the test hooks
//! or by fixture scripts.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::bus::{BusClient, Event, EventBus, EventPayload, WorkerState};
use crate::git::Repo;
use crate::queue::TicketQueue;
use crate::test_utils::{make_ticket, ticket_yaml};
use crate::watch::{BacklogWatcher, WatchConfig};
use crate::worker::{PoolConfig, WorkerPool};

struct Fixture {
    _temp: TempDir,
    repo_path: PathBuf,
    workdir: PathBuf,
    ci_status_dir: PathBuf,
    backlog: PathBuf,
    socket: String,
}

impl Fixture {
    fn new() -> Fixture {
        let temp = TempDir::new().unwrap();
        let repo_path = temp.path().join("repo.git");
        let workdir = temp.path().join("work");
        let ci_status_dir = temp.path().join("ci-status");
        let backlog = temp.path().join("backlog");
        let socket = temp.path().join("bus.sock").to_string_lossy().to_string();

        let repo = Repo::new(&repo_path);
        repo.init_bare().unwrap();
        repo.create_initial_commit().unwrap();

        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::create_dir_all(&ci_status_dir).unwrap();
        std::fs::create_dir_all(&backlog).unwrap();

        Fixture {
            _temp: temp,
            repo_path,
            workdir,
            ci_status_dir,
            backlog,
            socket,
        }
    }

    fn repo(&self) -> Repo {
        Repo::new(&self.repo_path)
    }

    fn pool_config(&self, count: u32) -> PoolConfig {
        let mut config = PoolConfig::new(count, &self.repo_path, &self.workdir, &self.ci_status_dir);
        config.poll_period = Duration::from_millis(50);
        config.verdict_poll = Duration::from_millis(100);
        config.skip_generator = true;
        config.skip_ci = true;
        config
    }

    /// Writes an executable CI fixture script. The script receives
    /// `<repo_path> <ref> <commit>` like the real collaborator.
    fn write_ci_script(&self, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = self._temp.path().join("ci.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// A CI script that records the requested verdict for the pushed commit.
    fn verdict_ci_script(&self, status: &str) -> PathBuf {
        let status_dir = self.ci_status_dir.to_string_lossy().to_string();
        self.write_ci_script(&format!(
            r#"commit="$3"
printf '{{"ref":"%s","commit":"%s","status":"{status}","timestamp":"2025-01-01T00:00:00Z","output":"fixture output"}}' "$2" "$commit" > "{status_dir}/$commit.json""#
        ))
    }
}

/// Blocks until the server side has registered `n` subscribers, so no early
/// event can be published before the observer is attached.
async fn wait_subscribed(bus: &EventBus, n: usize) {
    for _ in 0..200 {
        if bus.subscriber_count().await >= n {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("subscriber never registered");
}

async fn next_event(client: &mut BusClient) -> Event {
    tokio::time::timeout(Duration::from_secs(10), client.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

/// Receives events until `stop` returns true, returning everything seen.
async fn collect_until(client: &mut BusClient, stop: impl Fn(&Event) -> bool) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = next_event(client).await;
        let done = stop(&event);
        events.push(event);
        if done {
            return events;
        }
    }
}

async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

fn worktree_paths(fixture: &Fixture, ticket_id: &str, count: u32) -> Vec<PathBuf> {
    (1..=count)
        .map(|n| fixture.workdir.join(format!("agent-{n}")).join(ticket_id))
        .collect()
}

#[tokio::test]
async fn single_ticket_flows_from_backlog_to_branch() {
    let fixture = Fixture::new();
    let queue = Arc::new(TicketQueue::new());
    let bus = Arc::new(EventBus::bind(&fixture.socket).await.unwrap());
    let mut client = BusClient::connect(&fixture.socket).await.unwrap();
    wait_subscribed(&bus, 1).await;
    let cancel = CancellationToken::new();

    let watcher = BacklogWatcher::new(
        WatchConfig {
            backlog_path: fixture.backlog.clone(),
            poll_interval: Duration::from_millis(50),
        },
        Arc::clone(&queue),
        Some(Arc::clone(&bus)),
    );
    let watcher_handle = tokio::spawn(watcher.run(cancel.clone()));

    let pool = WorkerPool::spawn(
        fixture.pool_config(3),
        Arc::clone(&queue),
        Some(Arc::clone(&bus)),
        cancel.clone(),
    );

    std::fs::write(fixture.backlog.join("feat-1.yaml"), ticket_yaml("feat-1", 1)).unwrap();

    let events = collect_until(&mut client, |event| {
        matches!(event.payload, EventPayload::TicketComplete { .. })
    })
    .await;

    // The lifecycle events arrive in order, for the same worker.
    let enqueued = events
        .iter()
        .position(|e| matches!(&e.payload, EventPayload::TicketEnqueued { ticket, .. } if ticket.id.as_str() == "feat-1"))
        .expect("no ticket_enqueued event");
    let started = events
        .iter()
        .position(|e| matches!(&e.payload, EventPayload::TicketStarted { ticket, .. } if ticket.id.as_str() == "feat-1"))
        .expect("no ticket_started event");
    let complete = events.len() - 1;
    assert!(enqueued < started && started < complete);

    let started_worker = match &events[started].payload {
        EventPayload::TicketStarted { worker_id, .. } => *worker_id,
        _ => unreachable!(),
    };
    match &events[complete].payload {
        EventPayload::TicketComplete { ticket, worker_id, .. } => {
            assert_eq!(ticket.id.as_str(), "feat-1");
            assert_eq!(*worker_id, started_worker);
        }
        other => panic!("unexpected payload: {other:?}"),
    }

    // Exactly one branch agent-[1-3]/feat-1 exists and the queue is drained.
    let branches = fixture.repo().list_branches().unwrap();
    let agent_branches: Vec<_> = branches
        .iter()
        .filter(|b| b.ends_with("/feat-1"))
        .collect();
    assert_eq!(agent_branches.len(), 1);
    assert_eq!(*agent_branches[0], format!("agent-{started_worker}/feat-1"));
    assert_eq!(queue.len(), 0);

    // Worktrees never outlive the pipeline.
    for path in worktree_paths(&fixture, "feat-1", 3) {
        assert!(!path.exists(), "stale worktree at {}", path.display());
    }

    cancel.cancel();
    pool.join().await;
    watcher_handle.await.unwrap().unwrap();
    bus.shutdown().await;
}

#[tokio::test]
async fn high_priority_ticket_starts_first() {
    let fixture = Fixture::new();
    let queue = Arc::new(TicketQueue::new());
    let bus = Arc::new(EventBus::bind(&fixture.socket).await.unwrap());
    let mut client = BusClient::connect(&fixture.socket).await.unwrap();
    wait_subscribed(&bus, 1).await;
    let cancel = CancellationToken::new();

    // Both tickets are queued before the single worker first polls.
    queue.push(make_ticket("low", 5));
    queue.push(make_ticket("high", 1));

    let pool = WorkerPool::spawn(
        fixture.pool_config(1),
        Arc::clone(&queue),
        Some(Arc::clone(&bus)),
        cancel.clone(),
    );

    let mut started_order = Vec::new();
    while started_order.len() < 2 {
        if let EventPayload::TicketStarted { ticket, .. } = next_event(&mut client).await.payload {
            started_order.push(ticket.id.as_str().to_string());
        }
    }
    assert_eq!(started_order, vec!["high", "low"]);

    cancel.cancel();
    pool.join().await;
    bus.shutdown().await;
}

#[tokio::test]
async fn skip_ci_still_produces_branch_and_commit() {
    let fixture = Fixture::new();
    let queue = Arc::new(TicketQueue::new());
    let cancel = CancellationToken::new();

    queue.push(make_ticket("feat-9", 2));
    let pool = WorkerPool::spawn(fixture.pool_config(1), Arc::clone(&queue), None, cancel.clone());

    let repo = fixture.repo();
    wait_for(
        || repo.branch_exists("agent-1/feat-9").unwrap_or(false),
        "branch agent-1/feat-9",
    )
    .await;

    // Initial commit plus the agent's commit.
    wait_for(
        || repo.commit_count("agent-1/feat-9").unwrap_or(0) == 2,
        "agent commit on branch",
    )
    .await;

    cancel.cancel();
    pool.join().await;
}

#[tokio::test]
async fn ci_failure_keeps_branch_and_releases_worker() {
    let fixture = Fixture::new();
    let queue = Arc::new(TicketQueue::new());
    let bus = Arc::new(EventBus::bind(&fixture.socket).await.unwrap());
    let mut client = BusClient::connect(&fixture.socket).await.unwrap();
    wait_subscribed(&bus, 1).await;
    let cancel = CancellationToken::new();

    let mut config = fixture.pool_config(1);
    config.skip_ci = false;
    config.ci_command = Some(fixture.verdict_ci_script("FAIL"));
    config.verdict_timeout = Duration::from_secs(5);

    queue.push(make_ticket("feat-2", 1));
    let pool = WorkerPool::spawn(config, Arc::clone(&queue), Some(Arc::clone(&bus)), cancel.clone());

    // Terminal event for a failed pipeline is an idle worker_status with a
    // failure message; ticket_complete must never appear.
    let events = collect_until(&mut client, |event| {
        matches!(
            &event.payload,
            EventPayload::WorkerStatus { status: WorkerState::Idle, message, .. }
                if message.contains("failed")
        )
    })
    .await;
    assert!(
        !events
            .iter()
            .any(|e| matches!(e.payload, EventPayload::TicketComplete { .. })),
        "ticket_complete emitted on CI failure"
    );

    let repo = fixture.repo();
    assert!(repo.branch_exists("agent-1/feat-2").unwrap());
    assert_eq!(repo.commit_count("agent-1/feat-2").unwrap(), 2);
    assert!(!fixture.workdir.join("agent-1").join("feat-2").exists());

    // The worker picks up subsequent tickets normally.
    queue.push(make_ticket("feat-3", 1));
    loop {
        if let EventPayload::TicketStarted { ticket, .. } = next_event(&mut client).await.payload {
            assert_eq!(ticket.id.as_str(), "feat-3");
            break;
        }
    }

    cancel.cancel();
    pool.join().await;
    bus.shutdown().await;
}

#[tokio::test]
async fn missing_verdict_times_out_and_keeps_branch() {
    let fixture = Fixture::new();
    let queue = Arc::new(TicketQueue::new());
    let bus = Arc::new(EventBus::bind(&fixture.socket).await.unwrap());
    let mut client = BusClient::connect(&fixture.socket).await.unwrap();
    wait_subscribed(&bus, 1).await;
    let cancel = CancellationToken::new();

    let mut config = fixture.pool_config(1);
    config.skip_ci = false;
    // CI runs fine but never writes a verdict.
    config.ci_command = Some(fixture.write_ci_script("exit 0"));
    config.verdict_timeout = Duration::from_secs(2);

    queue.push(make_ticket("feat-4", 1));
    let pool = WorkerPool::spawn(config, Arc::clone(&queue), Some(Arc::clone(&bus)), cancel.clone());

    collect_until(&mut client, |event| {
        matches!(
            &event.payload,
            EventPayload::WorkerStatus { status: WorkerState::Idle, message, .. }
                if message.contains("timed out")
        )
    })
    .await;

    let repo = fixture.repo();
    assert!(repo.branch_exists("agent-1/feat-4").unwrap());
    assert!(!fixture.workdir.join("agent-1").join("feat-4").exists());

    cancel.cancel();
    pool.join().await;
    bus.shutdown().await;
}

#[tokio::test]
async fn worktree_failure_has_no_side_effects() {
    let fixture = Fixture::new();
    let queue = Arc::new(TicketQueue::new());
    let bus = Arc::new(EventBus::bind(&fixture.socket).await.unwrap());
    let mut client = BusClient::connect(&fixture.socket).await.unwrap();
    wait_subscribed(&bus, 1).await;
    let cancel = CancellationToken::new();

    // Pre-create the worktree path so workspace acquisition fails.
    let blocked = fixture.workdir.join("agent-1").join("feat-5");
    std::fs::create_dir_all(&blocked).unwrap();

    queue.push(make_ticket("feat-5", 1));
    let pool = WorkerPool::spawn(
        fixture.pool_config(1),
        Arc::clone(&queue),
        Some(Arc::clone(&bus)),
        cancel.clone(),
    );

    let events = collect_until(&mut client, |event| {
        matches!(
            &event.payload,
            EventPayload::WorkerStatus { status: WorkerState::Idle, message, .. }
                if message.contains("failed")
        )
    })
    .await;
    assert!(
        !events
            .iter()
            .any(|e| matches!(e.payload, EventPayload::TicketComplete { .. })),
    );

    // No branch was created for the failed workspace.
    assert!(!fixture.repo().branch_exists("agent-1/feat-5").unwrap());

    cancel.cancel();
    pool.join().await;
    bus.shutdown().await;
}
