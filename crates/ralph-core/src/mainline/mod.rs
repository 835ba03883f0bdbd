//! Mainline sync: promotes the integration head to the base branch.
//!
//! The mainline workspace is the repository root. When the base branch is
//! checked out there, promotion is a fast-forward merge (with a documented
//! lossy `reset --hard` fallback and stash handling for dirty trees);
//! when it is not, the branch ref is moved directly. The base ref only
//! ever advances to the integration head, so mainline never leaves the
//! integration history.
//!
//! Failed promotions park their tasks in the pending-main map, mirrored to
//! the tracker as `pending_main`, and retry with exponential backoff from
//! the dispatch loop's quiescence sequence.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::events::{EventBus, EventPayload};
use crate::git::GitDriver;
use crate::tracker::Tracker;

/// First retry delay; doubles per attempt.
pub const INITIAL_BACKOFF_MS: u64 = 2_000;
/// Upper bound for a retry delay.
pub const BACKOFF_CAP_MS: u64 = 30_000;
/// Retries stop (and an alert fires) past this many failed attempts.
pub const MAX_SYNC_ATTEMPTS: u32 = 10;
/// Minimum spacing between `main-sync-skipped` emissions.
const SKIP_THROTTLE: Duration = Duration::from_secs(5);

/// Delay before retry number `attempts` (1-based).
pub fn backoff_delay_ms(attempts: u32) -> u64 {
    let doubled = INITIAL_BACKOFF_MS.saturating_mul(1u64 << attempts.min(16));
    doubled.min(BACKOFF_CAP_MS)
}

#[derive(Debug, Default)]
struct SyncState {
    /// Task id -> integration commits awaiting mainline.
    pending: BTreeMap<String, Vec<String>>,
    /// Consecutive failed attempts.
    attempts: u32,
    next_retry_at: Option<Instant>,
    last_skip_emit: Option<Instant>,
    alerted: bool,
}

/// Fast-forwards the base branch to integration, with backoff and retry.
pub struct MainlineSync {
    git: GitDriver,
    base_branch: String,
    integration_branch: String,
    events: EventBus,
    tracker: Arc<dyn Tracker>,
    state: Mutex<SyncState>,
}

impl std::fmt::Debug for MainlineSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainlineSync")
            .field("base_branch", &self.base_branch)
            .field("integration_branch", &self.integration_branch)
            .finish()
    }
}

impl MainlineSync {
    pub fn new(
        git: GitDriver,
        base_branch: impl Into<String>,
        integration_branch: impl Into<String>,
        events: EventBus,
        tracker: Arc<dyn Tracker>,
    ) -> Self {
        Self {
            git,
            base_branch: base_branch.into(),
            integration_branch: integration_branch.into(),
            events,
            tracker,
            state: Mutex::new(SyncState::default()),
        }
    }

    /// Whether any task is parked awaiting mainline.
    pub fn has_pending(&self) -> bool {
        !self.state.lock().unwrap_or_else(|e| e.into_inner()).pending.is_empty()
    }

    /// Whether pending tasks still have retry budget.
    pub fn has_retryable_pending(&self) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        !state.pending.is_empty() && state.attempts < MAX_SYNC_ATTEMPTS
    }

    /// Attempt a sync for newly landed tasks. On failure the tasks join
    /// the pending-main map. Returns `true` on success.
    pub async fn sync_for_tasks(&self, newly: Vec<(String, Vec<String>)>) -> bool {
        match self.attempt() {
            Ok(head) => {
                self.on_success(head, newly).await;
                true
            }
            Err(reason) => {
                self.on_failure(newly, &reason).await;
                false
            }
        }
    }

    /// Retry path driven by the dispatch loop's quiescence sequence.
    /// Returns `true` when a retry ran and succeeded.
    pub async fn retry_pending(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.pending.is_empty() || state.attempts >= MAX_SYNC_ATTEMPTS {
                return false;
            }
            if let Some(at) = state.next_retry_at {
                if Instant::now() < at {
                    let throttled = state
                        .last_skip_emit
                        .is_some_and(|last| last.elapsed() < SKIP_THROTTLE);
                    if !throttled {
                        state.last_skip_emit = Some(Instant::now());
                        drop(state);
                        self.events.emit(EventPayload::MainSyncSkipped {
                            reason: "backoff active".to_string(),
                        });
                    }
                    return false;
                }
            }
        }

        self.sync_for_tasks(Vec::new()).await
    }

    /// One promotion attempt. `Err` carries the failure reason.
    fn attempt(&self) -> Result<String, String> {
        let integration_head = self
            .git
            .rev_parse(&self.integration_branch)
            .map_err(|e| format!("failed to resolve integration head: {e}"))?;

        let on_base = self
            .git
            .current_branch()
            .map_err(|e| format!("failed to read checked-out branch: {e}"))?
            .is_some_and(|b| b == self.base_branch);

        if !on_base {
            self.git
                .update_ref(&self.base_branch, &integration_head)
                .map_err(|e| format!("update-ref failed: {e}"))?;
            return Ok(integration_head);
        }

        let stash = if self.git.is_dirty().map_err(|e| e.to_string())? {
            self.git
                .stash_push("mainline sync")
                .map_err(|e| format!("stash push failed: {e}"))?
        } else {
            None
        };

        let ff_result = self.fast_forward(&integration_head);

        if let Some(reference) = stash {
            match self.git.stash_apply(&reference) {
                Ok(true) => {
                    if let Err(e) = self.git.stash_drop(&reference) {
                        warn!(reference = %reference, error = %e, "stash drop failed");
                    }
                }
                Ok(false) => {
                    warn!(
                        reference = %reference,
                        "stash apply conflicted after mainline sync; stash kept for the operator"
                    );
                    if let Some(hub) = self.events.log_hub() {
                        hub.runtime_warn(&format!(
                            "stash {reference} conflicted while restoring the mainline workspace"
                        ));
                    }
                }
                Err(e) => {
                    warn!(reference = %reference, error = %e, "stash apply failed");
                }
            }
        }

        ff_result.map(|()| integration_head)
    }

    fn fast_forward(&self, integration_head: &str) -> Result<(), String> {
        match self.git.merge_ff_only(integration_head) {
            Ok(true) => Ok(()),
            Ok(false) => {
                let old = self.git.rev_parse("HEAD").unwrap_or_default();
                warn!(
                    base = %self.base_branch,
                    previous_head = %old,
                    "fast-forward not possible; hard-resetting base to integration head"
                );
                self.git
                    .reset_hard(integration_head)
                    .map_err(|e| format!("reset --hard fallback failed: {e}"))
            }
            Err(e) => Err(format!("merge --ff-only failed: {e}")),
        }
    }

    async fn on_success(&self, head: String, newly: Vec<(String, Vec<String>)>) {
        let mut task_ids: Vec<String> = Vec::new();
        let drained: Vec<String> = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.attempts = 0;
            state.next_retry_at = None;
            state.alerted = false;
            state.pending.keys().cloned().collect()
        };

        for task_id in drained {
            if let Err(e) = self.tracker.clear_pending_main(&task_id).await {
                warn!(task_id = %task_id, error = %e, "failed to clear pending-main");
            }
            if let Err(e) = self.tracker.complete_task(&task_id).await {
                warn!(task_id = %task_id, error = %e, "failed to complete task");
            }
            task_ids.push(task_id);
        }
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .clear();

        for (task_id, _commits) in newly {
            if let Err(e) = self.tracker.complete_task(&task_id).await {
                warn!(task_id = %task_id, error = %e, "failed to complete task");
            }
            task_ids.push(task_id);
        }

        info!(commit = %head, tasks = ?task_ids, "mainline advanced to integration head");
        self.events.emit(EventPayload::MainSyncSucceeded {
            commit: head,
            task_ids,
        });
    }

    async fn on_failure(&self, newly: Vec<(String, Vec<String>)>, reason: &str) {
        let (attempts, pending_count, alert) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.attempts += 1;
            for (task_id, commits) in &newly {
                state.pending.insert(task_id.clone(), commits.clone());
            }
            let delay = backoff_delay_ms(state.attempts);
            state.next_retry_at = Some(Instant::now() + Duration::from_millis(delay));
            let alert = state.attempts >= MAX_SYNC_ATTEMPTS && !state.alerted;
            if alert {
                state.alerted = true;
            }
            (state.attempts, state.pending.len(), alert)
        };

        warn!(attempt = attempts, reason = %reason, "mainline sync failed");
        self.events.emit(EventPayload::MainSyncFailed {
            reason: reason.to_string(),
            attempt: attempts,
        });

        for (task_id, commits) in &newly {
            if let Err(e) = self
                .tracker
                .mark_pending_main(task_id, attempts, commits)
                .await
            {
                warn!(task_id = %task_id, error = %e, "failed to mark pending-main");
            }
        }

        if attempts < MAX_SYNC_ATTEMPTS {
            self.events.emit(EventPayload::MainSyncRetrying {
                delay_ms: backoff_delay_ms(attempts),
                attempt: attempts,
            });
        } else if alert {
            self.events.emit(EventPayload::MainSyncAlert {
                pending_tasks: pending_count,
            });
        }
    }
}
