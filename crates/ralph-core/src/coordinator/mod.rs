//! The coordinator: dispatch loop and subsystem wiring.
//!
//! One cooperative loop pulls ready tasks from the tracker, claims them
//! optimistically, and spawns runs on idle workers without blocking. The
//! merge queue, validation queue, and mainline sync run as independent
//! consumers; outcomes flow back through the [`OutcomeHub`], which owns
//! worker release, task blocking, and the post-merge path.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentRegistry, OutputHook, StreamHooks};
use crate::config::CoordinatorConfig;
use crate::events::{EventBus, EventPayload, LogHub, StreamKind};
use crate::git::{CommitMetadata, GitDriver};
use crate::mainline::MainlineSync;
use crate::merge::{ConflictResolver, MergeConsumer, MergeOutcomeSink, MergeQueue};
use crate::tracker::{Task, TaskStatus, Tracker};
use crate::validation::{
    FailureDisposition, ValidationEngine, ValidationOutcomeSink, ValidationPlan, ValidationQueue,
    build_plan,
};
use crate::worker::{Worker, WorkerPool, commit_subject, task_trailer};

/// Dispatch idle poll interval.
const IDLE_SLEEP: Duration = Duration::from_millis(100);
/// First not-ready cooldown; doubles per rejection.
const COOLDOWN_INITIAL: Duration = Duration::from_secs(1);
/// Cooldown ceiling.
const COOLDOWN_CAP: Duration = Duration::from_secs(15);
/// Ready-selection probes per dispatch attempt.
const SELECT_RETRIES: usize = 5;
/// In-progress tasks older than this many minutes with no lease are reset
/// to open.
const STALE_IN_PROGRESS_MINUTES: i64 = 30;
/// Agent non-completions before a task is blocked.
const MAX_TASK_FAILURES: u32 = 3;

/// Shutdown summary: event counts by type plus run boundaries.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub event_counts: std::collections::BTreeMap<String, u64>,
    pub completed_tasks: usize,
    pub blocked_tasks: usize,
}

#[derive(Debug, Clone)]
struct Lease {
    worker_id: String,
    claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
struct Cooldown {
    until: Instant,
    attempts: u32,
}

/// Run-local mutable state shared between the dispatch loop and the
/// outcome hub. Each field has a single conceptual mutator.
#[derive(Default)]
struct RunShared {
    paused: AtomicBool,
    /// Active leases: task id -> worker.
    leases: Mutex<HashMap<String, Lease>>,
    /// Tasks excluded for the rest of the run.
    blocked: Mutex<HashSet<String>>,
    /// Not-ready cooldowns.
    cooldowns: Mutex<HashMap<String, Cooldown>>,
    /// Agent non-completion counters.
    failures: Mutex<HashMap<String, u32>>,
}

impl RunShared {
    fn lease_worker(&self, task_id: &str) -> Option<String> {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(task_id)
            .map(|l| l.worker_id.clone())
    }

    fn drop_lease(&self, task_id: &str) -> Option<Lease> {
        self.leases
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(task_id)
    }

    fn block(&self, task_id: &str) {
        self.blocked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(task_id.to_string());
    }
}

/// Receives merge and validation outcomes and drives what follows:
/// releasing workers, blocking tasks, queueing validation, syncing
/// mainline.
struct OutcomeHub {
    tracker: Arc<dyn Tracker>,
    events: EventBus,
    pool: Arc<WorkerPool>,
    mainline: Arc<MainlineSync>,
    shared: Arc<RunShared>,
    gates_enabled: bool,
    gates: crate::config::QualityGateConfig,
    validation: OnceLock<ValidationQueue>,
}

impl OutcomeHub {
    /// Release a task's worker and lease, announcing both.
    fn release(&self, task_id: &str, worker_id: &str, reason: &str) {
        if let Some(lease) = self.shared.drop_lease(task_id) {
            let held = Utc::now() - lease.claimed_at;
            info!(
                task_id = %task_id,
                worker_id = %worker_id,
                held_ms = held.num_milliseconds(),
                reason = %reason,
                "lease released"
            );
        }
        if let Some(worker) = self.pool.get(worker_id) {
            worker.release_reservation();
        }
        self.events.emit(EventPayload::TaskReleased {
            task_id: task_id.to_string(),
            worker_id: worker_id.to_string(),
            reason: reason.to_string(),
        });
        self.events.emit(EventPayload::WorkerIdle {
            worker_id: worker_id.to_string(),
        });
    }

    async fn block_task(&self, task_id: &str) {
        self.shared.block(task_id);
        if let Err(e) = self.tracker.update_status(task_id, TaskStatus::Blocked).await {
            warn!(task_id = %task_id, error = %e, "failed to block task in tracker");
        }
    }

    async fn sync_tasks(&self, newly: Vec<(String, Vec<String>)>) {
        self.mainline.sync_for_tasks(newly).await;
    }
}

#[async_trait]
impl MergeOutcomeSink for OutcomeHub {
    async fn task_landed(&self, task_id: &str, worker_id: &str, landed: Vec<CommitMetadata>) {
        self.release(task_id, worker_id, "commits landed on integration");

        let hashes: Vec<String> = landed.iter().map(|c| c.hash.clone()).collect();

        if self.gates_enabled && !landed.is_empty() {
            let impact = match self.tracker.get_task(task_id).await {
                Ok(Some(task)) => task.impact_entries(),
                _ => Vec::new(),
            };
            let mut changed: Vec<String> = Vec::new();
            for commit in &landed {
                for file in &commit.file_names {
                    if !changed.iter().any(|f| f == file) {
                        changed.push(file.clone());
                    }
                }
            }
            let plan = build_plan(
                &self.gates,
                vec![task_id.to_string()],
                hashes.clone(),
                &changed,
                impact,
            );
            if let Some(queue) = self.validation.get() {
                queue.enqueue(plan);
                return;
            }
        }

        self.sync_tasks(vec![(task_id.to_string(), hashes)]).await;
    }

    async fn task_merge_failed(&self, task_id: &str, worker_id: &str) {
        self.block_task(task_id).await;
        self.release(task_id, worker_id, "merge failed");
    }
}

#[async_trait]
impl ValidationOutcomeSink for OutcomeHub {
    async fn plan_passed(&self, plan: &ValidationPlan, _flaky: bool) {
        let newly = plan
            .task_ids
            .iter()
            .map(|t| (t.clone(), plan.commits.clone()))
            .collect();
        self.sync_tasks(newly).await;
    }

    async fn plan_failed(&self, plan: &ValidationPlan, disposition: FailureDisposition) {
        match disposition {
            FailureDisposition::PauseRequested => {
                warn!(plan_id = %plan.plan_id, "validation requested a pause; waiting for operator");
                self.shared.paused.store(true, Ordering::SeqCst);
            }
            FailureDisposition::Reverted
            | FailureDisposition::Quarantined
            | FailureDisposition::Blocked => {
                for task_id in &plan.task_ids {
                    self.block_task(task_id).await;
                }
            }
        }
    }
}

/// The parallel execution coordinator.
pub struct Coordinator {
    config: CoordinatorConfig,
    tracker: Arc<dyn Tracker>,
    events: EventBus,
    hub: Arc<LogHub>,
    pool: Arc<WorkerPool>,
    merge_queue: MergeQueue,
    validation_queue: Option<ValidationQueue>,
    mainline: Arc<MainlineSync>,
    outcome: Arc<OutcomeHub>,
    shared: Arc<RunShared>,
    cancel: CancellationToken,
    base_branch: String,
    integration_branch: String,
    consumer_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Initialize the full engine: workspaces, workers, consumers.
    ///
    /// Configuration errors (zero workers, bad branch names, unknown agent
    /// plugin) and unusable repositories are fatal here.
    pub async fn new(
        config: CoordinatorConfig,
        repo_root: &Path,
        tracker: Arc<dyn Tracker>,
        registry: &AgentRegistry,
    ) -> Result<Self> {
        config.validate()?;

        let git = GitDriver::open(repo_root).context("repository root is not a git repository")?;
        let base_branch = git
            .current_branch()
            .context("failed to read the checked-out branch")?
            .context("the repository is on a detached HEAD")?;
        let integration_branch = config.integration_branch().to_string();

        let state_dir = repo_root.join(&config.state_dir);
        std::fs::create_dir_all(&state_dir)
            .with_context(|| format!("failed to create state dir {}", state_dir.display()))?;
        // The state dir ignores itself so workspace status stays clean.
        let ignore_path = state_dir.join(".gitignore");
        if !ignore_path.exists() {
            std::fs::write(&ignore_path, "*\n").context("failed to write state-dir gitignore")?;
        }

        let hub = Arc::new(LogHub::new(&state_dir));
        let events = EventBus::new(Arc::clone(&hub));

        let workspace_mgr = crate::workspace::WorkspaceManager::new(git.clone(), &state_dir);
        workspace_mgr.prune_workspaces()?;
        workspace_mgr.snapshot(&base_branch)?;

        if !git.branch_exists(&integration_branch)? {
            let base_head = git.rev_parse(&base_branch)?;
            git.branch_force(&integration_branch, &base_head)?;
        }
        let integration_head = git.rev_parse(&integration_branch)?;

        // Worker workspaces, branched from the integration head.
        let specs: Vec<crate::workspace::WorkspaceSpec> = (1..=config.max_workers)
            .map(|i| {
                let worker_id = format!("w{i}");
                crate::workspace::WorkspaceSpec {
                    branch_name: crate::workspace::WorkspaceManager::worker_branch_name(&worker_id),
                    base_ref: integration_branch.clone(),
                    lock_reason: format!("ralph worker {worker_id}"),
                    worker_id,
                }
            })
            .collect();
        let branch_by_worker: HashMap<String, String> = specs
            .iter()
            .map(|s| (s.worker_id.clone(), s.branch_name.clone()))
            .collect();

        let created = workspace_mgr.create_workspaces(specs).await;
        for (worker_id, error) in &created.failures {
            warn!(worker_id = %worker_id, error = %error, "worker excluded for the run");
            hub.runtime_warn(&format!("worker {worker_id} excluded: {error}"));
        }
        if created.paths.is_empty() {
            anyhow::bail!("no worker workspace could be provisioned");
        }

        let excluded_paths = vec![format!(
            "{}/",
            config.state_dir.to_string_lossy().trim_end_matches('/')
        )];

        let mut workers = Vec::new();
        let mut worker_ids: Vec<&String> = created.paths.keys().collect();
        worker_ids.sort();
        for worker_id in worker_ids {
            let path = created.paths[worker_id].clone();
            let agent = registry
                .create(&config.agent)
                .context("failed to initialize agent plugin")?;
            workers.push(Arc::new(Worker::new(
                worker_id.clone(),
                path.clone(),
                branch_by_worker[worker_id].clone(),
                agent,
                git.at(&path),
                integration_head.clone(),
                excluded_paths.clone(),
                config.agent.credit_markers.clone(),
            )));
        }
        let pool = Arc::new(WorkerPool::new(workers));

        // Merge workspace: the repo root when it already has the
        // integration branch checked out, a dedicated worktree otherwise.
        let merge_git = if base_branch == integration_branch {
            git.clone()
        } else {
            let merge_path = workspace_mgr.workspaces_dir().join("merge");
            if merge_path.exists() {
                git.worktree_remove(&merge_path)?;
            }
            git.worktree_add(&merge_path, None, &integration_branch)
                .context("failed to create the merge workspace")?;
            git.at(&merge_path)
        };

        let shared = Arc::new(RunShared::default());
        let cancel = CancellationToken::new();
        let mainline = Arc::new(MainlineSync::new(
            git.clone(),
            base_branch.clone(),
            integration_branch.clone(),
            events.clone(),
            Arc::clone(&tracker),
        ));

        let outcome = Arc::new(OutcomeHub {
            tracker: Arc::clone(&tracker),
            events: events.clone(),
            pool: Arc::clone(&pool),
            mainline: Arc::clone(&mainline),
            shared: Arc::clone(&shared),
            gates_enabled: config.quality_gates.enabled,
            gates: config.quality_gates.clone(),
            validation: OnceLock::new(),
        });

        let resolver_agent = registry.create(&config.agent).ok();
        let resolver = ConflictResolver::new(
            git.clone(),
            workspace_mgr.workspaces_dir().to_path_buf(),
            integration_branch.clone(),
            resolver_agent,
        );

        let mut consumer_handles = Vec::new();
        let (merge_queue, merge_handle) = MergeQueue::spawn(MergeConsumer {
            git: merge_git.clone(),
            resolver,
            events: events.clone(),
            sink: Arc::clone(&outcome) as Arc<dyn MergeOutcomeSink>,
            cancel: cancel.clone(),
        });
        consumer_handles.push(merge_handle);

        let validation_queue = if config.quality_gates.enabled {
            let validator_path = config
                .quality_gates
                .validator_worktree_path
                .clone()
                .map(|p| repo_root.join(p))
                .unwrap_or_else(|| workspace_mgr.workspaces_dir().join("validator"));
            if validator_path.exists() {
                git.worktree_remove(&validator_path)?;
            }
            git.worktree_add(&validator_path, Some("ralph/validator"), &integration_branch)
                .context("failed to create the validator workspace")?;

            let fix_agent = registry.create(&config.agent).ok();
            let engine = ValidationEngine {
                validator: git.at(&validator_path),
                integration: merge_git,
                integration_branch: integration_branch.clone(),
                gates: config.quality_gates.clone(),
                events: events.clone(),
                hub: Arc::clone(&hub),
                fix_agent,
                sink: Arc::clone(&outcome) as Arc<dyn ValidationOutcomeSink>,
            };
            let (queue, handle) = ValidationQueue::spawn(
                engine,
                config.quality_gates.mode,
                config.quality_gates.batch_window_ms,
                cancel.clone(),
            );
            consumer_handles.push(handle);
            let _ = outcome.validation.set(queue.clone());
            Some(queue)
        } else {
            None
        };

        info!(
            workers = pool.len(),
            base = %base_branch,
            integration = %integration_branch,
            "coordinator initialized"
        );

        Ok(Self {
            config,
            tracker,
            events,
            hub,
            pool,
            merge_queue,
            validation_queue,
            mainline,
            outcome,
            shared,
            cancel,
            base_branch,
            integration_branch,
            consumer_handles: Mutex::new(consumer_handles),
        })
    }

    /// The event stream. Listeners registered here see every event.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Request a stop. Consumed at the next loop iteration; in-flight
    /// agent runs are not killed.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Halt dispatch; in-flight merges and validations continue.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.hub.runtime_info("coordinator paused");
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.hub.runtime_info("coordinator resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Run the dispatch loop until quiescent or stopped.
    pub async fn run(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        self.events.emit(EventPayload::Started {
            worker_count: self.pool.len(),
            base_branch: self.base_branch.clone(),
            integration_branch: self.integration_branch.clone(),
        });
        self.hub.runtime_info(&format!(
            "run started: {} workers, base {}, integration {}",
            self.pool.len(),
            self.base_branch,
            self.integration_branch
        ));

        let reason = loop {
            if self.cancel.is_cancelled() {
                break "stop requested";
            }
            if self.is_paused() {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }

            let Some(worker) = self.pool.idle_worker().cloned() else {
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            };

            match self.select_and_claim(&worker).await {
                Ok(Some(task)) => {
                    self.spawn_task_run(worker, task);
                }
                Ok(None) => {
                    if self.pool.any_busy() {
                        tokio::time::sleep(IDLE_SLEEP).await;
                        continue;
                    }
                    if self.quiesce().await? {
                        tokio::time::sleep(IDLE_SLEEP).await;
                        continue;
                    }
                    break "no work remaining";
                }
                Err(e) => {
                    // Tracker faults are retried at the next iteration.
                    warn!(error = %e, "dispatch iteration failed");
                    tokio::time::sleep(IDLE_SLEEP).await;
                }
            }
        };

        self.wait_for_in_flight().await;
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *self.consumer_handles.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in handles {
            let _ = handle.await;
        }
        self.pool.dispose_all();

        self.events.emit(EventPayload::Stopped {
            reason: reason.to_string(),
        });

        let summary = self.build_summary(started_at).await;
        match serde_json::to_value(&summary) {
            Ok(value) => {
                if let Err(e) = self.hub.write_summary(&value) {
                    warn!(error = %e, "failed to write run summary");
                }
            }
            Err(e) => warn!(error = %e, "failed to encode run summary"),
        }
        Ok(summary)
    }

    /// Pick a ready task and claim it together with the worker, rolling
    /// back on any failure. Rejected candidates grow the exclude set; a
    /// few probes per dispatch attempt keep the tracker round-trips
    /// bounded.
    async fn select_and_claim(&self, worker: &Arc<Worker>) -> Result<Option<Task>> {
        let mut exclude = self.dispatch_exclusions();

        for _ in 0..SELECT_RETRIES {
            let Some(task) = self.tracker.next_ready_task(&exclude).await? else {
                return Ok(None);
            };

            // Impact gate.
            if self.config.quality_gates.enabled
                && self.config.quality_gates.require_impact_table
                && !task.has_impact()
            {
                self.outcome.block_task(&task.id).await;
                self.events.emit(EventPayload::ImpactMissing {
                    task_id: task.id.clone(),
                });
                exclude.insert(task.id);
                continue;
            }

            // Pre-claim dependency re-check.
            if !self.deps_satisfied(&task).await? {
                self.apply_cooldown(&task.id);
                exclude.insert(task.id);
                continue;
            }

            if !worker.try_reserve() {
                return Ok(None);
            }

            match self.tracker.claim_task(&task.id, worker.id()).await {
                Ok(true) => {}
                Ok(false) => {
                    worker.release_reservation();
                    exclude.insert(task.id);
                    continue;
                }
                Err(e) => {
                    worker.release_reservation();
                    return Err(e);
                }
            }

            // Post-claim re-verification; roll both claims back on failure.
            if !self.deps_satisfied(&task).await? {
                if let Err(e) = self.tracker.release_task(&task.id).await {
                    warn!(task_id = %task.id, error = %e, "rollback release failed");
                }
                worker.release_reservation();
                self.apply_cooldown(&task.id);
                exclude.insert(task.id);
                continue;
            }

            self.shared.leases.lock().unwrap_or_else(|e| e.into_inner()).insert(
                task.id.clone(),
                Lease {
                    worker_id: worker.id().to_string(),
                    claimed_at: Utc::now(),
                },
            );
            self.events.emit(EventPayload::TaskClaimed {
                task_id: task.id.clone(),
                title: task.title.clone(),
                worker_id: worker.id().to_string(),
            });
            return Ok(Some(task));
        }

        Ok(None)
    }

    /// Blocked tasks, active cooldowns, and leased tasks are never offered
    /// to the tracker's ready query.
    fn dispatch_exclusions(&self) -> HashSet<String> {
        let mut exclude: HashSet<String> = self
            .shared
            .blocked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();

        {
            let cooldowns = self.shared.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            for (task_id, cooldown) in cooldowns.iter() {
                if now < cooldown.until {
                    exclude.insert(task_id.clone());
                }
            }
        }

        exclude.extend(
            self.shared
                .leases
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .keys()
                .cloned(),
        );
        exclude
    }

    /// Ready iff every dependency is completed or cancelled. The tracker's
    /// own readiness view can lag behind in-flight completions, so this
    /// runs again after claiming.
    async fn deps_satisfied(&self, task: &Task) -> Result<bool> {
        for dep in &task.depends_on {
            let satisfied = self
                .tracker
                .get_task(dep)
                .await?
                .is_some_and(|t| t.status.is_terminal());
            if !satisfied {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn apply_cooldown(&self, task_id: &str) {
        let mut cooldowns = self.shared.cooldowns.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cooldowns.entry(task_id.to_string()).or_insert(Cooldown {
            until: Instant::now(),
            attempts: 0,
        });
        entry.attempts += 1;
        let delay = cooldown_delay(entry.attempts);
        entry.until = Instant::now() + delay;
        info!(task_id = %task_id, attempts = entry.attempts, delay_ms = delay.as_millis() as u64, "not-ready cooldown applied");
    }

    /// Spawn the per-task run without blocking the dispatch loop.
    fn spawn_task_run(&self, worker: Arc<Worker>, task: Task) {
        let outcome = Arc::clone(&self.outcome);
        let merge_queue = self.merge_queue.clone();
        let events = self.events.clone();
        let hub = Arc::clone(&self.hub);
        let shared = Arc::clone(&self.shared);

        tokio::spawn(async move {
            run_task(worker, task, outcome, merge_queue, events, hub, shared).await;
        });
    }

    /// The quiescence sequence, run when no task is ready and no worker is
    /// busy. `Ok(true)` keeps the loop alive; `Ok(false)` lets it exit.
    async fn quiesce(&self) -> Result<bool> {
        // 1. Pending mainline work retries first.
        if self.mainline.retry_pending().await {
            return Ok(true);
        }

        // 2. Wait for merges and validations in flight.
        if self.merge_queue.in_flight() > 0 {
            return Ok(true);
        }
        if self
            .validation_queue
            .as_ref()
            .is_some_and(|q| q.in_flight() > 0)
        {
            return Ok(true);
        }

        // 3. Reset stale in-progress tasks not covered by a lease.
        if self.reset_stale_tasks().await? {
            return Ok(true);
        }

        // 4. Wait while pending-main still has retry budget.
        if self.mainline.has_retryable_pending() {
            return Ok(true);
        }

        // 5. Final probe: any open or in-progress task keeps us alive.
        let open = self.tracker.list_tasks(Some(TaskStatus::Open)).await?;
        if !open.is_empty() {
            return Ok(true);
        }
        let in_progress = self.tracker.list_tasks(Some(TaskStatus::InProgress)).await?;
        Ok(!in_progress.is_empty())
    }

    /// Stale recovery: `in_progress` tasks with an `updated_at` older than
    /// 30 minutes and no active lease go back to `open`. Tasks without the
    /// field are never touched.
    async fn reset_stale_tasks(&self) -> Result<bool> {
        let in_progress = self.tracker.list_tasks(Some(TaskStatus::InProgress)).await?;
        let cutoff = Utc::now() - chrono::Duration::minutes(STALE_IN_PROGRESS_MINUTES);
        let mut reset_any = false;

        for task in in_progress {
            let Some(updated_at) = task.updated_at else {
                continue;
            };
            if updated_at >= cutoff {
                continue;
            }
            if self.shared.lease_worker(&task.id).is_some() {
                continue;
            }
            warn!(task_id = %task.id, "resetting stale in-progress task to open");
            self.hub
                .runtime_warn(&format!("reset stale in-progress task {}", task.id));
            self.tracker.update_status(&task.id, TaskStatus::Open).await?;
            reset_any = true;
        }
        Ok(reset_any)
    }

    /// Wait for in-flight work to wind down after the loop exits. On an
    /// operator stop the queues are abandoned (their consumers exit
    /// between entries), so only running agents are awaited.
    async fn wait_for_in_flight(&self) {
        loop {
            let stopping = self.cancel.is_cancelled();
            let any_held = self.pool.workers().iter().any(|w| {
                if stopping {
                    w.is_busy()
                } else {
                    w.is_busy() || w.is_reserved()
                }
            });
            let queues_busy = !stopping
                && (self.merge_queue.in_flight() > 0
                    || self
                        .validation_queue
                        .as_ref()
                        .is_some_and(|q| q.in_flight() > 0));
            if !any_held && !queues_busy {
                return;
            }
            tokio::time::sleep(IDLE_SLEEP).await;
        }
    }

    async fn build_summary(&self, started_at: DateTime<Utc>) -> RunSummary {
        let completed = self
            .tracker
            .list_tasks(Some(TaskStatus::Completed))
            .await
            .map(|t| t.len())
            .unwrap_or(0);
        let blocked = self
            .tracker
            .list_tasks(Some(TaskStatus::Blocked))
            .await
            .map(|t| t.len())
            .unwrap_or(0);

        RunSummary {
            started_at,
            ended_at: Utc::now(),
            event_counts: self.events.counts(),
            completed_tasks: completed,
            blocked_tasks: blocked,
        }
    }
}

/// Cooldown for the `attempts`-th rejection: 1 s doubling, capped at 15 s.
fn cooldown_delay(attempts: u32) -> Duration {
    let ms = (COOLDOWN_INITIAL.as_millis() as u64).saturating_mul(1u64 << (attempts - 1).min(8));
    Duration::from_millis(ms.min(COOLDOWN_CAP.as_millis() as u64))
}

/// The prompt handed to the agent for a task run.
fn task_prompt(task: &Task) -> String {
    format!(
        "Work on task {id}: {title}\n\n\
         Make the required changes in this workspace and commit them. Use \
         the commit subject '{subject}' or include the trailer '{trailer}' \
         so the commit can be attributed to the task.",
        id = task.id,
        title = task.title,
        subject = commit_subject(&task.id, &task.title),
        trailer = task_trailer(&task.id),
    )
}

/// One complete task run on a worker: agent execution, streaming, commit
/// harvest, and the hand-off to merge or the failure path.
async fn run_task(
    worker: Arc<Worker>,
    task: Task,
    outcome: Arc<OutcomeHub>,
    merge_queue: MergeQueue,
    events: EventBus,
    hub: Arc<LogHub>,
    shared: Arc<RunShared>,
) {
    events.emit(EventPayload::TaskStarted {
        task_id: task.id.clone(),
        worker_id: worker.id().to_string(),
    });

    let task_log = match hub.task_log(&task.id, worker.id()) {
        Ok(log) => Some(Arc::new(log)),
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "failed to open task log");
            None
        }
    };

    let hooks = {
        let make_hook = |stream: StreamKind| {
            let events = events.clone();
            let task_id = task.id.clone();
            let worker_id = worker.id().to_string();
            let task_log = task_log.clone();
            Arc::new(move |line: &str| {
                if let Some(log) = &task_log {
                    log.append(stream.as_str(), line);
                }
                events.emit(EventPayload::TaskOutput {
                    task_id: task_id.clone(),
                    worker_id: worker_id.clone(),
                    stream,
                    chunk: line.to_string(),
                });
            }) as OutputHook
        };
        StreamHooks {
            on_stdout: Some(make_hook(StreamKind::Stdout)),
            on_stderr: Some(make_hook(StreamKind::Stderr)),
        }
    };

    let prompt = task_prompt(&task);
    let result = match worker.execute_task(&task, &prompt, &hooks).await {
        Ok(result) => result,
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "worker run failed");
            hub.runtime_warn(&format!("task {} failed on {}: {e:#}", task.id, worker.id()));
            handle_non_completion(&task, &worker, &outcome, &shared).await;
            return;
        }
    };

    let segments: Vec<String> = result
        .agent
        .stdout_tail(50)
        .lines()
        .map(str::to_string)
        .collect();
    if !segments.is_empty() {
        events.emit(EventPayload::TaskSegments {
            task_id: task.id.clone(),
            worker_id: worker.id().to_string(),
            segments,
        });
    }
    events.emit(EventPayload::TaskFinished {
        task_id: task.id.clone(),
        worker_id: worker.id().to_string(),
        completed: result.agent.completed,
        exit_code: result.agent.exit_code,
        duration_ms: result.agent.duration_ms,
        commits: result.commits.len(),
    });

    if result.credit_exhausted {
        warn!(task_id = %task.id, "credit exhaustion: blocking task and pausing the coordinator");
        hub.runtime_warn(&format!(
            "credit exhaustion reported while running task {}; coordinator paused",
            task.id
        ));
        outcome.block_task(&task.id).await;
        shared.paused.store(true, Ordering::SeqCst);
        outcome.release(&task.id, worker.id(), "credit exhaustion");
        return;
    }

    if !result.agent.completed || (result.commits.is_empty() && !result.no_op) {
        handle_non_completion(&task, &worker, &outcome, &shared).await;
        return;
    }

    if result.no_op {
        info!(task_id = %task.id, "no-op success: completed with a clean tree and no commits");
        if let Err(e) = outcome.tracker.complete_task(&task.id).await {
            warn!(task_id = %task.id, error = %e, "failed to complete no-op task");
        }
        outcome.release(&task.id, worker.id(), "no-op success");
        return;
    }

    let accepted = merge_queue.enqueue(&task, worker.id(), result.commits);
    if accepted == 0 {
        // Everything was already queued or processed; nothing will call
        // back for this task.
        outcome.release(&task.id, worker.id(), "commits already queued");
    }
}

/// Generic non-completion: three strikes block the task, otherwise it goes
/// back to open for another attempt.
async fn handle_non_completion(
    task: &Task,
    worker: &Arc<Worker>,
    outcome: &Arc<OutcomeHub>,
    shared: &Arc<RunShared>,
) {
    let strikes = {
        let mut failures = shared.failures.lock().unwrap_or_else(|e| e.into_inner());
        let entry = failures.entry(task.id.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    if strikes >= MAX_TASK_FAILURES {
        warn!(task_id = %task.id, strikes, "task blocked after repeated failures");
        outcome.block_task(&task.id).await;
        outcome.release(&task.id, worker.id(), "blocked after repeated failures");
    } else {
        if let Err(e) = outcome.tracker.release_task(&task.id).await {
            warn!(task_id = %task.id, error = %e, "failed to reopen task");
        }
        outcome.release(&task.id, worker.id(), "reopened for another attempt");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cooldown_doubles_from_1s_and_caps_at_15s() {
        assert_eq!(cooldown_delay(1), Duration::from_secs(1));
        assert_eq!(cooldown_delay(2), Duration::from_secs(2));
        assert_eq!(cooldown_delay(3), Duration::from_secs(4));
        assert_eq!(cooldown_delay(4), Duration::from_secs(8));
        assert_eq!(cooldown_delay(5), Duration::from_secs(15));
        assert_eq!(cooldown_delay(12), Duration::from_secs(15));
    }

    #[test]
    fn task_prompt_names_the_commit_format() {
        let task = Task::open("T1", "do the thing");
        let prompt = task_prompt(&task);
        assert!(prompt.contains("T1: do the thing"));
        assert!(prompt.contains("Ralph-Task: T1"));
    }

    #[test]
    fn run_shared_lease_round_trip() {
        let shared = RunShared::default();
        shared.leases.lock().unwrap().insert(
            "T1".to_string(),
            Lease {
                worker_id: "w1".to_string(),
                claimed_at: Utc::now(),
            },
        );
        assert_eq!(shared.lease_worker("T1").as_deref(), Some("w1"));
        shared.drop_lease("T1");
        assert_eq!(shared.lease_worker("T1"), None);
    }
}
