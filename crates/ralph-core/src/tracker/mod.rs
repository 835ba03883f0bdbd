//! The task tracker boundary.
//!
//! The tracker owns task identity and persistent status; the coordinator
//! only holds transient references plus an in-memory lease. Everything the
//! coordinator needs from a tracker is expressed by the object-safe
//! [`Tracker`] trait, so stores of any shape can be plugged in. The crate
//! ships [`MemoryTracker`] as the in-process reference implementation.

pub mod memory;

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryTracker;

/// Persistent task status, owned by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    PendingMain,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are never dispatched again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::PendingMain => "pending_main",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A declared path-change-purpose triple from a task's impact plan or
/// impact table. Validation uses the paths to pick relevant checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactEntry {
    pub path: String,
    #[serde(default)]
    pub change: String,
    #[serde(default)]
    pub purpose: String,
}

/// A tracker-owned task, as seen by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub impact_plan: Option<Vec<ImpactEntry>>,
    #[serde(default)]
    pub impact_table: Option<Vec<ImpactEntry>>,
    /// Last mutation time, when the tracker records one. Tasks without it
    /// are never eligible for the stale in-progress reset.
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
    /// A fresh open task with no dependencies.
    pub fn open(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            status: TaskStatus::Open,
            priority: 0,
            depends_on: BTreeSet::new(),
            impact_plan: None,
            impact_table: None,
            updated_at: None,
        }
    }

    /// Impact entries from the plan and table combined.
    pub fn impact_entries(&self) -> Vec<ImpactEntry> {
        let mut entries = Vec::new();
        if let Some(plan) = &self.impact_plan {
            entries.extend(plan.iter().cloned());
        }
        if let Some(table) = &self.impact_table {
            entries.extend(table.iter().cloned());
        }
        entries
    }

    /// Whether the task declares any impact information.
    pub fn has_impact(&self) -> bool {
        self.impact_plan.as_ref().is_some_and(|p| !p.is_empty())
            || self.impact_table.as_ref().is_some_and(|t| !t.is_empty())
    }
}

/// Operations the coordinator requires from a task tracker.
///
/// Implementations must be safe to call concurrently; the coordinator
/// issues tracker calls from the dispatch loop, the merge consumer, the
/// validation consumer, and the mainline-sync path.
#[async_trait]
pub trait Tracker: Send + Sync {
    /// All tasks with the given status, or every task when `None`.
    async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>>;

    /// The next open task whose dependencies the tracker believes are
    /// satisfied, excluding the given ids. Highest priority first, then
    /// stable id order.
    async fn next_ready_task(&self, exclude: &HashSet<String>) -> Result<Option<Task>>;

    /// A single task by id.
    async fn get_task(&self, task_id: &str) -> Result<Option<Task>>;

    /// Atomically claim an open task for a worker. Returns `false` when the
    /// task is no longer open (lost race, external mutation).
    async fn claim_task(&self, task_id: &str, worker_id: &str) -> Result<bool>;

    /// Return a claimed task to `open` for another attempt.
    async fn release_task(&self, task_id: &str) -> Result<()>;

    /// Force a status. Used for blocking, stale resets, and cancellation.
    async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<()>;

    /// Mark a task terminally completed.
    async fn complete_task(&self, task_id: &str) -> Result<()>;

    /// Record that a task's commits are on integration but not yet on
    /// mainline.
    async fn mark_pending_main(
        &self,
        task_id: &str,
        attempt_count: u32,
        commits: &[String],
    ) -> Result<()>;

    /// Clear the pending-main marker after a successful sync.
    async fn clear_pending_main(&self, task_id: &str) -> Result<()>;
}

// Object safety is load-bearing: the coordinator stores Arc<dyn Tracker>.
const _: () = {
    fn _assert_object_safe(_: &dyn Tracker) {}
};
