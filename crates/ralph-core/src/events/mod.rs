//! Typed event stream and structured log ownership.
//!
//! Every coordinator subsystem reports through the [`EventBus`]: a typed,
//! tagged-variant stream delivered synchronously to registered listeners
//! and appended to the on-disk event log. Listener panics are swallowed;
//! a misbehaving consumer must never stall the merge queue.

pub mod logs;

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use logs::{LogHub, TaskLog};

/// Which output stream a captured segment came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// An emitted event: payload plus emission timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// ISO-8601 emission time.
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

/// The complete set of coordinator events.
///
/// Wire names (the `type` field in the events log) use the `parallel:`
/// prefix; see [`EventPayload::kind`].
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Started {
        worker_count: usize,
        base_branch: String,
        integration_branch: String,
    },
    Stopped {
        reason: String,
    },
    TaskClaimed {
        task_id: String,
        title: String,
        worker_id: String,
    },
    TaskStarted {
        task_id: String,
        worker_id: String,
    },
    TaskOutput {
        task_id: String,
        worker_id: String,
        stream: StreamKind,
        chunk: String,
    },
    TaskSegments {
        task_id: String,
        worker_id: String,
        segments: Vec<String>,
    },
    TaskFinished {
        task_id: String,
        worker_id: String,
        completed: bool,
        exit_code: Option<i32>,
        duration_ms: u64,
        commits: usize,
    },
    TaskReleased {
        task_id: String,
        worker_id: String,
        reason: String,
    },
    WorkerIdle {
        worker_id: String,
    },
    ImpactMissing {
        task_id: String,
    },
    MergeQueued {
        task_id: String,
        commit: String,
        worker_id: String,
    },
    MergeSucceeded {
        task_id: String,
        commit: String,
        resolved: bool,
        conflict_files: Vec<String>,
        empty: bool,
    },
    MergeFailed {
        task_id: String,
        commit: String,
        reason: String,
        conflict_files: Vec<String>,
        suggestions: Vec<String>,
    },
    ValidationQueued {
        plan_id: Uuid,
        task_ids: Vec<String>,
    },
    ValidationStarted {
        plan_id: Uuid,
        checks: Vec<String>,
    },
    ValidationCheckStarted {
        plan_id: Uuid,
        check_id: String,
        rerun: u32,
    },
    ValidationCheckFinished {
        plan_id: Uuid,
        check_id: String,
        exit_code: Option<i32>,
        duration_ms: u64,
        rerun: u32,
        passed: bool,
    },
    ValidationPassed {
        plan_id: Uuid,
        flaky: bool,
    },
    ValidationFailed {
        plan_id: Uuid,
        check_id: String,
        reason: String,
    },
    ValidationBlocked {
        plan_id: Uuid,
        reason: String,
    },
    ValidationFixStarted {
        plan_id: Uuid,
        attempt: u32,
    },
    ValidationFixSucceeded {
        plan_id: Uuid,
        attempt: u32,
        commit: String,
    },
    ValidationFixFailed {
        plan_id: Uuid,
        attempt: u32,
        reason: String,
    },
    ValidationReverted {
        plan_id: Uuid,
        commits: Vec<String>,
    },
    MainSyncSucceeded {
        commit: String,
        task_ids: Vec<String>,
    },
    MainSyncSkipped {
        reason: String,
    },
    MainSyncFailed {
        reason: String,
        attempt: u32,
    },
    MainSyncRetrying {
        delay_ms: u64,
        attempt: u32,
    },
    MainSyncAlert {
        pending_tasks: usize,
    },
}

impl EventPayload {
    /// The wire name of this event, as written to the events log.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "parallel:started",
            Self::Stopped { .. } => "parallel:stopped",
            Self::TaskClaimed { .. } => "parallel:task-claimed",
            Self::TaskStarted { .. } => "parallel:task-started",
            Self::TaskOutput { .. } => "parallel:task-output",
            Self::TaskSegments { .. } => "parallel:task-segments",
            Self::TaskFinished { .. } => "parallel:task-finished",
            Self::TaskReleased { .. } => "parallel:task-released",
            Self::WorkerIdle { .. } => "parallel:worker-idle",
            Self::ImpactMissing { .. } => "parallel:impact-missing",
            Self::MergeQueued { .. } => "parallel:merge-queued",
            Self::MergeSucceeded { .. } => "parallel:merge-succeeded",
            Self::MergeFailed { .. } => "parallel:merge-failed",
            Self::ValidationQueued { .. } => "parallel:validation-queued",
            Self::ValidationStarted { .. } => "parallel:validation-started",
            Self::ValidationCheckStarted { .. } => "parallel:validation-check-started",
            Self::ValidationCheckFinished { .. } => "parallel:validation-check-finished",
            Self::ValidationPassed { .. } => "parallel:validation-passed",
            Self::ValidationFailed { .. } => "parallel:validation-failed",
            Self::ValidationBlocked { .. } => "parallel:validation-blocked",
            Self::ValidationFixStarted { .. } => "parallel:validation-fix-started",
            Self::ValidationFixSucceeded { .. } => "parallel:validation-fix-succeeded",
            Self::ValidationFixFailed { .. } => "parallel:validation-fix-failed",
            Self::ValidationReverted { .. } => "parallel:validation-reverted",
            Self::MainSyncSucceeded { .. } => "parallel:main-sync-succeeded",
            Self::MainSyncSkipped { .. } => "parallel:main-sync-skipped",
            Self::MainSyncFailed { .. } => "parallel:main-sync-failed",
            Self::MainSyncRetrying { .. } => "parallel:main-sync-retrying",
            Self::MainSyncAlert { .. } => "parallel:main-sync-alert",
        }
    }
}

impl Event {
    /// Serialize for the events log. Large payloads are summarized: output
    /// chunks become a length plus a short preview, segment lists become a
    /// count.
    pub fn to_log_json(&self) -> serde_json::Value {
        let mut value = match &self.payload {
            EventPayload::TaskOutput {
                task_id,
                worker_id,
                stream,
                chunk,
            } => serde_json::json!({
                "taskId": task_id,
                "workerId": worker_id,
                "stream": stream.as_str(),
                "outputLength": chunk.len(),
                "preview": preview(chunk, 120),
            }),
            EventPayload::TaskSegments {
                task_id,
                worker_id,
                segments,
            } => serde_json::json!({
                "taskId": task_id,
                "workerId": worker_id,
                "segmentCount": segments.len(),
            }),
            other => serde_json::to_value(other).unwrap_or_else(|_| serde_json::json!({})),
        };

        if let Some(map) = value.as_object_mut() {
            map.insert(
                "type".to_string(),
                serde_json::Value::String(self.payload.kind().to_string()),
            );
            map.insert(
                "timestamp".to_string(),
                serde_json::Value::String(self.timestamp.to_rfc3339()),
            );
        }
        value
    }
}

/// First `max` characters of a string, marked when truncated.
fn preview(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}…")
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_id: HashMap<u64, Listener>,
}

/// Synchronous fan-out of coordinator events plus ownership of the
/// append-only logs.
///
/// Delivery is best-effort in-order; a panicking listener is swallowed and
/// the remaining listeners still run.
#[derive(Clone)]
pub struct EventBus {
    listeners: Arc<Mutex<Listeners>>,
    counts: Arc<Mutex<BTreeMap<String, u64>>>,
    hub: Option<Arc<LogHub>>,
}

impl EventBus {
    /// A bus with no log hub attached; used by unit tests.
    pub fn detached() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners::default())),
            counts: Arc::new(Mutex::new(BTreeMap::new())),
            hub: None,
        }
    }

    /// A bus that appends every event to the hub's events log.
    pub fn new(hub: Arc<LogHub>) -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Listeners::default())),
            counts: Arc::new(Mutex::new(BTreeMap::new())),
            hub: Some(hub),
        }
    }

    pub fn log_hub(&self) -> Option<&Arc<LogHub>> {
        self.hub.as_ref()
    }

    /// Register a listener. Dropping the returned [`Subscription`] keeps it
    /// registered; call [`Subscription::unsubscribe`] to remove it.
    pub fn on(&self, listener: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        let mut guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let id = guard.next_id;
        guard.next_id += 1;
        guard.by_id.insert(id, Arc::new(listener));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Emit an event: stamp it, append it to the events log, count it, and
    /// deliver it to every listener in registration order.
    pub fn emit(&self, payload: EventPayload) {
        let event = Event {
            timestamp: Utc::now(),
            payload,
        };

        {
            let mut counts = self.counts.lock().unwrap_or_else(|e| e.into_inner());
            *counts.entry(event.payload.kind().to_string()).or_insert(0) += 1;
        }

        if let Some(hub) = &self.hub {
            hub.append_event(&event);
        }

        // Snapshot under the lock, deliver outside it: a listener that
        // registers, unsubscribes, or emits must not deadlock the bus.
        let snapshot: Vec<(u64, Listener)> = {
            let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            let mut entries: Vec<(u64, Listener)> = guard
                .by_id
                .iter()
                .map(|(id, l)| (*id, Arc::clone(l)))
                .collect();
            entries.sort_unstable_by_key(|(id, _)| *id);
            entries
        };
        for (_id, listener) in snapshot {
            // Listener faults are isolated by policy: no log, no crash.
            let _ = catch_unwind(AssertUnwindSafe(|| listener(&event)));
        }
    }

    /// Event counts by wire name, accumulated since construction.
    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.counts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("EventBus")
            .field("listeners", &guard.by_id.len())
            .finish()
    }
}

/// Handle to a registered listener.
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    /// Remove the listener from the bus.
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut guard = listeners.lock().unwrap_or_else(|e| e.into_inner());
            guard.by_id.remove(&self.id);
        }
    }
}
