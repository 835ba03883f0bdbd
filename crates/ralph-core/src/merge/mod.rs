//! Merge queue: serializes worker commits onto the integration branch.
//!
//! A single consumer task owns the merge workspace and cherry-picks
//! entries strictly one at a time; no two picks ever run concurrently
//! against integration. Enqueue is idempotent, keyed by
//! `(task_id, commit)`: within a run the set of seen keys only grows, so
//! the same commit can never land twice.

pub mod resolver;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::events::{EventBus, EventPayload};
use crate::git::{CherryPick, CommitMetadata, GitDriver};
use crate::tracker::Task;

pub use resolver::{ConflictResolver, Resolution};

/// One commit awaiting its turn on the integration branch.
#[derive(Debug, Clone)]
pub struct MergeEntry {
    pub task_id: String,
    pub worker_id: String,
    pub commit: CommitMetadata,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
}

/// Where merge outcomes are reported.
///
/// The coordinator implements this to drive the post-merge path
/// (validation or mainline sync) and to release workers.
#[async_trait]
pub trait MergeOutcomeSink: Send + Sync {
    /// Every queued commit of the task has landed on integration.
    /// `landed` holds the integration-side commits, application order.
    async fn task_landed(&self, task_id: &str, worker_id: &str, landed: Vec<CommitMetadata>);

    /// The task failed to merge; its remaining queued entries were dropped.
    async fn task_merge_failed(&self, task_id: &str, worker_id: &str);
}

#[derive(Debug, Default)]
struct MergeState {
    /// Keys ever accepted into the queue. Monotone within a run.
    queued_keys: HashSet<(String, String)>,
    /// Keys whose processing finished (landed, skipped, or dropped).
    processed: HashSet<(String, String)>,
    /// Per task: queued entries not yet processed.
    remaining: HashMap<String, usize>,
    /// Per task: integration-side commits landed so far.
    landed: HashMap<String, Vec<CommitMetadata>>,
    /// Tasks whose merge failed; their remaining entries are dropped.
    dropped_tasks: HashSet<String>,
    /// Entries accepted but not yet fully processed.
    in_queue: usize,
}

/// Handle for enqueueing into the merge consumer.
#[derive(Clone)]
pub struct MergeQueue {
    tx: mpsc::UnboundedSender<MergeEntry>,
    state: Arc<Mutex<MergeState>>,
    events: EventBus,
}

impl std::fmt::Debug for MergeQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeQueue")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Everything the consumer needs to process entries.
pub struct MergeConsumer {
    /// Driver bound to the merge workspace (on the integration branch).
    pub git: GitDriver,
    pub resolver: ConflictResolver,
    pub events: EventBus,
    pub sink: Arc<dyn MergeOutcomeSink>,
    pub cancel: CancellationToken,
}

impl MergeQueue {
    /// Spawn the consumer task and return the enqueue handle.
    pub fn spawn(consumer: MergeConsumer) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(MergeState::default()));
        let events = consumer.events.clone();

        let handle = tokio::spawn(run_consumer(rx, Arc::clone(&state), consumer));

        (Self { tx, state, events }, handle)
    }

    /// Enqueue a task's commits, in the worker's application order.
    ///
    /// Duplicate `(task_id, commit)` keys and already-processed commits are
    /// silently dropped. Returns the number of entries actually accepted.
    pub fn enqueue(&self, task: &Task, worker_id: &str, commits: Vec<CommitMetadata>) -> usize {
        let mut accepted = 0;
        for commit in commits {
            let key = (task.id.clone(), commit.hash.clone());
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.queued_keys.contains(&key) || state.processed.contains(&key) {
                    continue;
                }
                state.queued_keys.insert(key);
                *state.remaining.entry(task.id.clone()).or_insert(0) += 1;
                state.in_queue += 1;
            }

            self.events.emit(EventPayload::MergeQueued {
                task_id: task.id.clone(),
                commit: commit.short_hash.clone(),
                worker_id: worker_id.to_string(),
            });

            let entry = MergeEntry {
                task_id: task.id.clone(),
                worker_id: worker_id.to_string(),
                commit,
                enqueued_at: chrono::Utc::now(),
            };
            if self.tx.send(entry).is_err() {
                warn!(task_id = %task.id, "merge consumer is gone; entry dropped");
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.in_queue = state.in_queue.saturating_sub(1);
                continue;
            }
            accepted += 1;
        }
        accepted
    }

    /// Entries accepted but not yet fully processed.
    pub fn in_flight(&self) -> usize {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).in_queue
    }
}

async fn run_consumer(
    mut rx: mpsc::UnboundedReceiver<MergeEntry>,
    state: Arc<Mutex<MergeState>>,
    consumer: MergeConsumer,
) {
    info!("merge consumer started");
    loop {
        let entry = tokio::select! {
            entry = rx.recv() => match entry {
                Some(entry) => entry,
                None => break,
            },
            () = consumer.cancel.cancelled() => break,
        };

        process_entry(&state, &consumer, entry).await;
    }
    info!("merge consumer stopped");
}

async fn process_entry(state: &Arc<Mutex<MergeState>>, consumer: &MergeConsumer, entry: MergeEntry) {
    let key = (entry.task_id.clone(), entry.commit.hash.clone());
    let dropped = {
        let state = state.lock().unwrap_or_else(|e| e.into_inner());
        state.dropped_tasks.contains(&entry.task_id)
    };

    if dropped {
        finish_key(state, &key, &entry.task_id);
        return;
    }

    match apply_entry(state, consumer, &entry).await {
        Ok(()) => {}
        Err(reason) => {
            handle_merge_failure(state, consumer, &entry, &reason).await;
        }
    }
    finish_key(state, &key, &entry.task_id);

    // Countdown to the post-merge path.
    let landed_now = {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        if state.dropped_tasks.contains(&entry.task_id) {
            None
        } else {
            let remaining = state.remaining.get(&entry.task_id).copied().unwrap_or(0);
            if remaining == 0 {
                Some(state.landed.remove(&entry.task_id).unwrap_or_default())
            } else {
                None
            }
        }
    };

    if let Some(landed) = landed_now {
        consumer
            .sink
            .task_landed(&entry.task_id, &entry.worker_id, landed)
            .await;
    }
}

/// Run the per-entry cherry-pick algorithm. Errors are failure reasons for
/// the enriched merge-failed event.
async fn apply_entry(
    state: &Arc<Mutex<MergeState>>,
    consumer: &MergeConsumer,
    entry: &MergeEntry,
) -> Result<(), String> {
    let git = &consumer.git;

    match git.is_dirty() {
        Ok(false) => {}
        Ok(true) => return Err("integration workspace is dirty".to_string()),
        Err(e) => return Err(format!("failed to inspect integration workspace: {e}")),
    }

    let outcome = git
        .cherry_pick(&entry.commit.hash)
        .map_err(|e| format!("cherry-pick failed: {e}"))?;

    match outcome {
        CherryPick::Applied => {
            record_success(state, consumer, entry, false, Vec::new(), false);
            Ok(())
        }
        CherryPick::Empty => {
            git.cherry_pick_skip()
                .map_err(|e| format!("cherry-pick --skip failed: {e}"))?;
            record_success(state, consumer, entry, false, Vec::new(), true);
            Ok(())
        }
        CherryPick::Conflict => {
            let conflict_files = git.conflicted_files().unwrap_or_default();
            git.cherry_pick_abort()
                .map_err(|e| format!("cherry-pick --abort failed: {e}"))?;

            let resolution = consumer
                .resolver
                .resolve(&entry.commit)
                .await
                .map_err(|e| format!("conflict resolver failed: {e:#}"))?;

            match resolution {
                Resolution::Resolved {
                    commit: resolved,
                    conflict_files: resolved_files,
                } => {
                    let files = if resolved_files.is_empty() {
                        conflict_files
                    } else {
                        resolved_files
                    };
                    replay_resolved(state, consumer, entry, &resolved, files)
                }
                Resolution::Unresolved {
                    conflict_files,
                    reason,
                } => Err(format!(
                    "unresolved conflict in {}: {reason}",
                    conflict_files.join(", ")
                )),
            }
        }
    }
}

/// Cherry-pick a resolver-produced commit onto integration.
fn replay_resolved(
    state: &Arc<Mutex<MergeState>>,
    consumer: &MergeConsumer,
    entry: &MergeEntry,
    resolved: &str,
    conflict_files: Vec<String>,
) -> Result<(), String> {
    let git = &consumer.git;
    let outcome = git
        .cherry_pick(resolved)
        .map_err(|e| format!("cherry-pick of resolved commit failed: {e}"))?;

    match outcome {
        CherryPick::Applied => {
            record_success(state, consumer, entry, true, conflict_files, false);
            Ok(())
        }
        CherryPick::Empty => {
            git.cherry_pick_skip()
                .map_err(|e| format!("cherry-pick --skip failed: {e}"))?;
            record_success(state, consumer, entry, true, conflict_files, true);
            Ok(())
        }
        CherryPick::Conflict => {
            let _ = git.cherry_pick_abort();
            Err("resolved commit conflicted again on integration".to_string())
        }
    }
}

fn record_success(
    state: &Arc<Mutex<MergeState>>,
    consumer: &MergeConsumer,
    entry: &MergeEntry,
    resolved: bool,
    conflict_files: Vec<String>,
    empty: bool,
) {
    if !empty {
        match consumer.git.rev_parse("HEAD").and_then(|head| {
            consumer.git.commit_metadata(&head)
        }) {
            Ok(meta) => {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                state
                    .landed
                    .entry(entry.task_id.clone())
                    .or_default()
                    .push(meta);
            }
            Err(e) => {
                error!(task_id = %entry.task_id, error = %e, "failed to read merged commit metadata");
            }
        }
    }

    consumer.events.emit(EventPayload::MergeSucceeded {
        task_id: entry.task_id.clone(),
        commit: entry.commit.short_hash.clone(),
        resolved,
        conflict_files,
        empty,
    });
}

async fn handle_merge_failure(
    state: &Arc<Mutex<MergeState>>,
    consumer: &MergeConsumer,
    entry: &MergeEntry,
    reason: &str,
) {
    warn!(
        task_id = %entry.task_id,
        commit = %entry.commit.short_hash,
        reason = %reason,
        "merge failed; dropping task's remaining entries"
    );

    let conflict_files = consumer.git.conflicted_files().unwrap_or_default();
    consumer.events.emit(EventPayload::MergeFailed {
        task_id: entry.task_id.clone(),
        commit: entry.commit.short_hash.clone(),
        reason: reason.to_string(),
        conflict_files,
        suggestions: vec![
            format!(
                "inspect the merge workspace at {}",
                consumer.git.workdir().display()
            ),
            format!(
                "cherry-pick {} manually and resolve the conflicts",
                entry.commit.short_hash
            ),
            format!("reopen task {} once integration is clean", entry.task_id),
        ],
    });

    {
        let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
        state.dropped_tasks.insert(entry.task_id.clone());
        state.landed.remove(&entry.task_id);
    }

    consumer
        .sink
        .task_merge_failed(&entry.task_id, &entry.worker_id)
        .await;
}

/// Mark a key processed and decrement the bookkeeping counters.
fn finish_key(state: &Arc<Mutex<MergeState>>, key: &(String, String), task_id: &str) {
    let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
    state.processed.insert(key.clone());
    state.in_queue = state.in_queue.saturating_sub(1);
    if let Some(remaining) = state.remaining.get_mut(task_id) {
        *remaining = remaining.saturating_sub(1);
    }
}
