//! Append-only log files owned by the event bus.
//!
//! Layout under the coordinator state dir:
//!
//! ```text
//! <state-dir>/logs/
//!   parallel-runtime.log
//!   parallel-events.jsonl
//!   parallel-tasks/<taskId>-<epochMs>-<workerId>.log
//!   parallel-summary/summary-<epochMs>.json
//!   validations/<planId>/...
//! ```
//!
//! Files are created on demand and only ever appended to. Log write
//! failures are reported through `tracing` and otherwise ignored; logging
//! must never take the coordinator down.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use uuid::Uuid;

use super::Event;

/// Owner of the coordinator's on-disk logs.
#[derive(Debug)]
pub struct LogHub {
    logs_dir: PathBuf,
    runtime: Mutex<Option<File>>,
    events: Mutex<Option<File>>,
}

impl LogHub {
    /// Create a hub rooted at `<state_dir>/logs`. Directories are created
    /// lazily on first write.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            logs_dir: state_dir.join("logs"),
            runtime: Mutex::new(None),
            events: Mutex::new(None),
        }
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Append an INFO line to the runtime log.
    pub fn runtime_info(&self, message: &str) {
        self.runtime_line("INFO", message);
    }

    /// Append a WARN line to the runtime log.
    pub fn runtime_warn(&self, message: &str) {
        self.runtime_line("WARN", message);
    }

    fn runtime_line(&self, level: &str, message: &str) {
        let line = format!("[{}] {level} {message}\n", Utc::now().to_rfc3339());
        let mut guard = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = append_line(
            &mut guard,
            &self.logs_dir,
            &self.logs_dir.join("parallel-runtime.log"),
            &line,
        ) {
            tracing::warn!(error = %e, "failed to write runtime log line");
        }
    }

    /// Append one summarized JSON object per event.
    pub fn append_event(&self, event: &Event) {
        let json = event.to_log_json();
        let line = format!("{json}\n");
        let mut guard = self.events.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = append_line(
            &mut guard,
            &self.logs_dir,
            &self.logs_dir.join("parallel-events.jsonl"),
            &line,
        ) {
            tracing::warn!(error = %e, "failed to write events log line");
        }
    }

    /// Open a per-task log with a header.
    pub fn task_log(&self, task_id: &str, worker_id: &str) -> Result<TaskLog> {
        let dir = self.logs_dir.join("parallel-tasks");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create task log dir {}", dir.display()))?;
        let path = dir.join(format!(
            "{task_id}-{}-{worker_id}.log",
            Utc::now().timestamp_millis()
        ));
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open task log {}", path.display()))?;
        writeln!(
            file,
            "# task {task_id} on {worker_id} started {}",
            Utc::now().to_rfc3339()
        )?;
        Ok(TaskLog {
            path,
            file: Mutex::new(file),
        })
    }

    /// Directory for a validation plan's artifacts, created on demand.
    pub fn validation_dir(&self, plan_id: Uuid) -> Result<PathBuf> {
        let dir = self.logs_dir.join("validations").join(plan_id.to_string());
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create validation dir {}", dir.display()))?;
        Ok(dir)
    }

    /// Write the shutdown summary. Returns the file path.
    pub fn write_summary(&self, summary: &serde_json::Value) -> Result<PathBuf> {
        let dir = self.logs_dir.join("parallel-summary");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create summary dir {}", dir.display()))?;
        let path = dir.join(format!("summary-{}.json", Utc::now().timestamp_millis()));
        let body = serde_json::to_string_pretty(summary).context("failed to encode summary")?;
        std::fs::write(&path, body)
            .with_context(|| format!("failed to write summary {}", path.display()))?;
        Ok(path)
    }
}

fn append_line(
    slot: &mut Option<File>,
    dir: &Path,
    path: &Path,
    line: &str,
) -> Result<()> {
    if slot.is_none() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create log dir {}", dir.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        *slot = Some(file);
    }
    if let Some(file) = slot.as_mut() {
        file.write_all(line.as_bytes())?;
    }
    Ok(())
}

/// Append-only per-task log: header plus a timestamped stream interleave.
#[derive(Debug)]
pub struct TaskLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl TaskLog {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a tagged, timestamped segment.
    pub fn append(&self, stream: &str, text: &str) {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let stamp = Utc::now().to_rfc3339();
        for line in text.lines() {
            if let Err(e) = writeln!(guard, "[{stamp}] {stream}> {line}") {
                tracing::warn!(error = %e, path = %self.path.display(), "task log write failed");
                return;
            }
        }
    }
}
