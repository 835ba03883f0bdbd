//! End-to-end coordinator scenarios over a real git repository and a fake
//! shell-script agent.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use ralph_core::agent::AgentRegistry;
use ralph_core::config::{CheckConfig, CoordinatorConfig};
use ralph_core::coordinator::Coordinator;
use ralph_core::events::Event;
use ralph_core::tracker::{MemoryTracker, Task, TaskStatus, Tracker};

fn run_git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
    assert!(
        output.status.success(),
        "git {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn create_temp_repo() -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let repo_path = dir.path().join("repo");
    std::fs::create_dir(&repo_path).unwrap();

    run_git(&repo_path, &["init", "-b", "main"]);
    run_git(&repo_path, &["config", "user.email", "test@ralph.dev"]);
    run_git(&repo_path, &["config", "user.name", "Ralph Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
    run_git(&repo_path, &["add", "."]);
    run_git(&repo_path, &["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Write an agent script outside the repository so the working tree stays
/// clean.
fn write_agent(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    path
}

/// The standard fake agent: extracts the task id from the prompt and
/// commits one file named after it.
const WORKING_AGENT: &str = r#"prompt=$(cat)
id=$(printf '%s' "$prompt" | sed -n 's/^Work on task \([^:]*\):.*/\1/p' | head -1)
echo "work for $id" > "task-$id.txt"
echo "finished $id"
exit 0
"#;

fn config_with_agent(agent_path: &Path, target_branch: &str, workers: usize) -> CoordinatorConfig {
    let mut config = CoordinatorConfig {
        max_workers: workers,
        target_branch: target_branch.to_string(),
        ..CoordinatorConfig::default()
    };
    config.agent.command = agent_path.to_string_lossy().into_owned();
    config.agent.timeout_ms = 30_000;
    config
}

struct Scenario {
    _dir: TempDir,
    repo: PathBuf,
    tracker: Arc<MemoryTracker>,
    coordinator: Arc<Coordinator>,
    events: Arc<Mutex<Vec<Event>>>,
}

async fn scenario(config: CoordinatorConfig, tasks: Vec<Task>, dir: TempDir, repo: PathBuf) -> Scenario {
    let tracker = Arc::new(MemoryTracker::with_tasks(tasks));
    let registry = AgentRegistry::with_builtins();
    let coordinator = Arc::new(
        Coordinator::new(
            config,
            &repo,
            Arc::clone(&tracker) as Arc<dyn Tracker>,
            &registry,
        )
        .await
        .expect("coordinator init failed"),
    );

    let events = Arc::new(Mutex::new(Vec::new()));
    let events_clone = Arc::clone(&events);
    let _sub = coordinator.events().on(move |event| {
        events_clone.lock().unwrap().push(event.clone());
    });

    Scenario {
        _dir: dir,
        repo,
        tracker,
        coordinator,
        events,
    }
}

fn event_count(events: &Arc<Mutex<Vec<Event>>>, kind: &str) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.payload.kind() == kind)
        .count()
}

async fn status_of(tracker: &MemoryTracker, id: &str) -> TaskStatus {
    tracker.get_task(id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn happy_path_two_workers_no_gates() {
    let (dir, repo) = create_temp_repo();
    let agent = write_agent(dir.path(), WORKING_AGENT);
    // Base branch doubles as the integration branch.
    let config = config_with_agent(&agent, "main", 2);

    let sc = scenario(
        config,
        vec![Task::open("T1", "add file one"), Task::open("T2", "add file two")],
        dir,
        repo,
    )
    .await;

    let summary = tokio::time::timeout(Duration::from_secs(60), sc.coordinator.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(summary.completed_tasks, 2);
    assert_eq!(summary.blocked_tasks, 0);
    assert_eq!(status_of(&sc.tracker, "T1").await, TaskStatus::Completed);
    assert_eq!(status_of(&sc.tracker, "T2").await, TaskStatus::Completed);

    // Both commits are on main, with the task-id subject format.
    let log = run_git(&sc.repo, &["log", "--format=%s", "main"]);
    assert!(log.contains("T1: add file one"));
    assert!(log.contains("T2: add file two"));
    assert!(sc.repo.join("task-T1.txt").exists());
    assert!(sc.repo.join("task-T2.txt").exists());

    assert_eq!(event_count(&sc.events, "parallel:task-claimed"), 2);
    assert_eq!(event_count(&sc.events, "parallel:merge-succeeded"), 2);
    assert_eq!(event_count(&sc.events, "parallel:main-sync-succeeded"), 2);
    assert_eq!(event_count(&sc.events, "parallel:started"), 1);
    assert_eq!(event_count(&sc.events, "parallel:stopped"), 1);
}

#[tokio::test]
async fn dependencies_serialize_dependent_tasks() {
    let (dir, repo) = create_temp_repo();
    let agent = write_agent(dir.path(), WORKING_AGENT);
    let config = config_with_agent(&agent, "main", 2);

    let mut t2 = Task::open("T2", "depends on first");
    t2.depends_on.insert("T1".to_string());

    let sc = scenario(config, vec![Task::open("T1", "first"), t2], dir, repo).await;

    let summary = tokio::time::timeout(Duration::from_secs(60), sc.coordinator.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(summary.completed_tasks, 2);
    // T1's commit is an ancestor of T2's commit on main.
    let log = run_git(&sc.repo, &["log", "--format=%s", "main"]);
    let subjects: Vec<&str> = log.lines().collect();
    let pos_t1 = subjects.iter().position(|s| s.starts_with("T1:")).unwrap();
    let pos_t2 = subjects.iter().position(|s| s.starts_with("T2:")).unwrap();
    assert!(pos_t2 < pos_t1, "T2 must land after T1: {subjects:?}");
}

#[tokio::test]
async fn gates_enabled_run_validates_then_promotes() {
    let (dir, repo) = create_temp_repo();
    let agent = write_agent(dir.path(), WORKING_AGENT);
    let mut config = config_with_agent(&agent, "ralph/integration", 1);
    config.quality_gates.enabled = true;
    config.quality_gates.checks.insert(
        "sanity".to_string(),
        CheckConfig {
            command: "true".to_string(),
            required: true,
            timeout_ms: Some(30_000),
            retry_on_failure: false,
            max_reruns: None,
        },
    );

    let sc = scenario(config, vec![Task::open("T1", "gated work")], dir, repo).await;

    let summary = tokio::time::timeout(Duration::from_secs(60), sc.coordinator.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(summary.completed_tasks, 1);
    assert_eq!(event_count(&sc.events, "parallel:validation-queued"), 1);
    assert_eq!(event_count(&sc.events, "parallel:validation-passed"), 1);
    assert_eq!(event_count(&sc.events, "parallel:main-sync-succeeded"), 1);

    // Integration carries the commit and main was fast-forwarded to it.
    let integration_head = run_git(&sc.repo, &["rev-parse", "ralph/integration"]);
    let main_head = run_git(&sc.repo, &["rev-parse", "main"]);
    assert_eq!(integration_head, main_head);
    assert!(sc.repo.join("task-T1.txt").exists());
}

#[tokio::test]
async fn failing_agent_blocks_task_after_three_attempts() {
    let (dir, repo) = create_temp_repo();
    let agent = write_agent(dir.path(), "echo could not finish\nexit 1\n");
    let config = config_with_agent(&agent, "main", 1);

    let sc = scenario(config, vec![Task::open("T1", "never finishes")], dir, repo).await;

    let summary = tokio::time::timeout(Duration::from_secs(60), sc.coordinator.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(summary.completed_tasks, 0);
    assert_eq!(summary.blocked_tasks, 1);
    assert_eq!(status_of(&sc.tracker, "T1").await, TaskStatus::Blocked);
    assert_eq!(event_count(&sc.events, "parallel:task-finished"), 3);
    assert_eq!(event_count(&sc.events, "parallel:merge-queued"), 0);
}

#[tokio::test]
async fn credit_exhaustion_blocks_the_task_and_pauses() {
    let (dir, repo) = create_temp_repo();
    let agent = write_agent(
        dir.path(),
        r#"prompt=$(cat)
id=$(printf '%s' "$prompt" | sed -n 's/^Work on task \([^:]*\):.*/\1/p' | head -1)
if [ "$id" = "T5" ]; then
  echo "error: insufficient_credit"
  exit 0
fi
echo "work for $id" > "task-$id.txt"
exit 0
"#,
    );
    let config = config_with_agent(&agent, "main", 1);

    let sc = scenario(
        config,
        vec![Task::open("T5", "rate limited"), Task::open("T6", "still fine")],
        dir,
        repo,
    )
    .await;

    let coordinator = Arc::clone(&sc.coordinator);
    let run = tokio::spawn(async move { coordinator.run().await });

    // Wait for the credit hit to pause the coordinator.
    for _ in 0..300 {
        if sc.coordinator.is_paused() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(sc.coordinator.is_paused(), "credit exhaustion must pause");
    assert_eq!(status_of(&sc.tracker, "T5").await, TaskStatus::Blocked);

    // After the operator resumes, the other task still completes.
    sc.coordinator.resume();
    let summary = tokio::time::timeout(Duration::from_secs(60), run)
        .await
        .expect("run timed out")
        .expect("join failed")
        .expect("run failed");

    assert_eq!(status_of(&sc.tracker, "T6").await, TaskStatus::Completed);
    assert_eq!(status_of(&sc.tracker, "T5").await, TaskStatus::Blocked);
    assert_eq!(summary.completed_tasks, 1);
    assert!(event_count(&sc.events, "parallel:task-released") >= 1);
}

#[tokio::test]
async fn missing_impact_table_blocks_before_dispatch() {
    let (dir, repo) = create_temp_repo();
    let agent = write_agent(dir.path(), WORKING_AGENT);
    let mut config = config_with_agent(&agent, "ralph/integration", 1);
    config.quality_gates.enabled = true;
    config.quality_gates.require_impact_table = true;
    config.quality_gates.checks.insert(
        "sanity".to_string(),
        CheckConfig {
            command: "true".to_string(),
            required: true,
            timeout_ms: Some(30_000),
            retry_on_failure: false,
            max_reruns: None,
        },
    );

    let mut with_impact = Task::open("T2", "declared impact");
    with_impact.impact_table = Some(vec![ralph_core::tracker::ImpactEntry {
        path: "task-T2.txt".to_string(),
        change: "add".to_string(),
        purpose: "demo".to_string(),
    }]);

    let sc = scenario(
        config,
        vec![Task::open("T1", "no impact"), with_impact],
        dir,
        repo,
    )
    .await;

    let summary = tokio::time::timeout(Duration::from_secs(60), sc.coordinator.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(status_of(&sc.tracker, "T1").await, TaskStatus::Blocked);
    assert_eq!(status_of(&sc.tracker, "T2").await, TaskStatus::Completed);
    assert_eq!(event_count(&sc.events, "parallel:impact-missing"), 1);
    assert_eq!(summary.completed_tasks, 1);
    assert_eq!(summary.blocked_tasks, 1);
}

#[tokio::test]
async fn no_op_completion_without_commits() {
    let (dir, repo) = create_temp_repo();
    // Completes without touching anything.
    let agent = write_agent(dir.path(), "echo nothing to do\nexit 0\n");
    let config = config_with_agent(&agent, "main", 1);

    let sc = scenario(config, vec![Task::open("T1", "already done")], dir, repo).await;

    let summary = tokio::time::timeout(Duration::from_secs(60), sc.coordinator.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    assert_eq!(summary.completed_tasks, 1);
    assert_eq!(event_count(&sc.events, "parallel:merge-queued"), 0);
    assert_eq!(status_of(&sc.tracker, "T1").await, TaskStatus::Completed);
}

#[tokio::test]
async fn run_summary_is_written_to_disk() {
    let (dir, repo) = create_temp_repo();
    let agent = write_agent(dir.path(), WORKING_AGENT);
    let config = config_with_agent(&agent, "main", 1);
    let state_dir = repo.join(".ralph");

    let sc = scenario(config, vec![Task::open("T1", "summarized")], dir, repo).await;
    tokio::time::timeout(Duration::from_secs(60), sc.coordinator.run())
        .await
        .expect("run timed out")
        .expect("run failed");

    let summary_dir = state_dir.join("logs/parallel-summary");
    let entries: Vec<_> = std::fs::read_dir(&summary_dir)
        .expect("summary dir missing")
        .filter_map(Result::ok)
        .collect();
    assert_eq!(entries.len(), 1);

    let body = std::fs::read_to_string(entries[0].path()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(value["event_counts"]["parallel:started"], 1);
    assert_eq!(value["completed_tasks"], 1);

    // The events log and the per-task log exist as well.
    assert!(state_dir.join("logs/parallel-events.jsonl").exists());
    let task_logs: Vec<_> = std::fs::read_dir(state_dir.join("logs/parallel-tasks"))
        .expect("task log dir missing")
        .filter_map(Result::ok)
        .collect();
    assert_eq!(task_logs.len(), 1);
}
