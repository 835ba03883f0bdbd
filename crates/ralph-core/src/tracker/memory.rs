//! In-memory tracker: the reference [`Tracker`] implementation.
//!
//! Holds tasks in a mutex-guarded map. Used by the CLI for TOML-defined
//! task lists and by every integration test. Readiness here is the
//! tracker's own (possibly stale) view; the coordinator re-checks
//! dependencies after claiming.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;

use super::{Task, TaskStatus, Tracker};

#[derive(Debug, Default)]
struct Store {
    tasks: BTreeMap<String, Task>,
    claims: BTreeMap<String, String>,
    pending_main: BTreeMap<String, PendingMain>,
}

#[derive(Debug, Clone)]
struct PendingMain {
    attempt_count: u32,
    commits: Vec<String>,
}

/// Mutex-guarded in-process task store.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    store: Mutex<Store>,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker with a batch of tasks.
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let tracker = Self::new();
        {
            let mut store = tracker.store.lock().unwrap_or_else(|e| e.into_inner());
            for task in tasks {
                store.tasks.insert(task.id.clone(), task);
            }
        }
        tracker
    }

    /// Insert or replace a single task.
    pub fn insert(&self, task: Task) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.tasks.insert(task.id.clone(), task);
    }

    /// The worker currently holding a claim on the task, if any.
    pub fn claimed_by(&self, task_id: &str) -> Option<String> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.claims.get(task_id).cloned()
    }

    /// Recorded pending-main commit list for a task, if any.
    pub fn pending_main_commits(&self, task_id: &str) -> Option<Vec<String>> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.pending_main.get(task_id).map(|p| p.commits.clone())
    }

    /// Recorded pending-main sync attempt count for a task, if any.
    pub fn pending_main_attempts(&self, task_id: &str) -> Option<u32> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        store.pending_main.get(task_id).map(|p| p.attempt_count)
    }

    fn deps_satisfied(store: &Store, task: &Task) -> bool {
        task.depends_on.iter().all(|dep| {
            store
                .tasks
                .get(dep)
                .is_some_and(|t| t.status.is_terminal())
        })
    }
}

#[async_trait]
impl Tracker for MemoryTracker {
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        Ok(store
            .tasks
            .values()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .cloned()
            .collect())
    }

    async fn next_ready_task(&self, exclude: &HashSet<String>) -> Result<Option<Task>> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<&Task> = store
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open)
            .filter(|t| !exclude.contains(&t.id))
            .filter(|t| Self::deps_satisfied(&store, t))
            .collect();
        candidates.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));
        Ok(candidates.first().map(|t| (*t).clone()))
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        Ok(store.tasks.get(task_id).cloned())
    }

    async fn claim_task(&self, task_id: &str, worker_id: &str) -> Result<bool> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = store.tasks.get_mut(task_id) else {
            bail!("task {task_id} not found");
        };
        if task.status != TaskStatus::Open {
            return Ok(false);
        }
        task.status = TaskStatus::InProgress;
        task.updated_at = Some(Utc::now());
        store.claims.insert(task_id.to_string(), worker_id.to_string());
        Ok(true)
    }

    async fn release_task(&self, task_id: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = store.tasks.get_mut(task_id) else {
            bail!("task {task_id} not found");
        };
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Open;
            task.updated_at = Some(Utc::now());
        }
        store.claims.remove(task_id);
        Ok(())
    }

    async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = store.tasks.get_mut(task_id) else {
            bail!("task {task_id} not found");
        };
        task.status = status;
        task.updated_at = Some(Utc::now());
        if status != TaskStatus::InProgress {
            store.claims.remove(task_id);
        }
        Ok(())
    }

    async fn complete_task(&self, task_id: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = store.tasks.get_mut(task_id) else {
            bail!("task {task_id} not found");
        };
        task.status = TaskStatus::Completed;
        task.updated_at = Some(Utc::now());
        store.claims.remove(task_id);
        store.pending_main.remove(task_id);
        Ok(())
    }

    async fn mark_pending_main(
        &self,
        task_id: &str,
        attempt_count: u32,
        commits: &[String],
    ) -> Result<()> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        let Some(task) = store.tasks.get_mut(task_id) else {
            bail!("task {task_id} not found");
        };
        task.status = TaskStatus::PendingMain;
        task.updated_at = Some(Utc::now());
        store.pending_main.insert(
            task_id.to_string(),
            PendingMain {
                attempt_count,
                commits: commits.to_vec(),
            },
        );
        Ok(())
    }

    async fn clear_pending_main(&self, task_id: &str) -> Result<()> {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = store.tasks.get_mut(task_id) {
            if task.status == TaskStatus::PendingMain {
                task.status = TaskStatus::InProgress;
                task.updated_at = Some(Utc::now());
            }
        }
        store.pending_main.remove(task_id);
        Ok(())
    }
}
