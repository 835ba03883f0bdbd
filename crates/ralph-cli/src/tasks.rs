//! TOML task-list loading for the in-memory tracker.
//!
//! The CLI seeds a [`MemoryTracker`] from a file of `[[task]]` tables:
//!
//! ```toml
//! [[task]]
//! id = "T1"
//! title = "Add retry handling"
//! priority = 1
//! depends_on = ["T0"]
//!
//! [[task.impact]]
//! path = "src/retry.rs"
//! change = "add"
//! purpose = "retry loop"
//! ```

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use ralph_core::tracker::{ImpactEntry, Task, TaskStatus};

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default, rename = "task")]
    tasks: Vec<TaskEntry>,
}

#[derive(Debug, Deserialize)]
struct TaskEntry {
    id: String,
    title: String,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    depends_on: Vec<String>,
    #[serde(default)]
    impact: Vec<ImpactEntry>,
}

/// Load tasks from a TOML file, validating ids and dependency references.
pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file {}", path.display()))?;
    let file: TaskFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse task file {}", path.display()))?;

    if file.tasks.is_empty() {
        bail!("task file {} defines no tasks", path.display());
    }

    let mut tasks = Vec::new();
    for entry in file.tasks {
        if entry.id.trim().is_empty() {
            bail!("task with empty id in {}", path.display());
        }
        if tasks.iter().any(|t: &Task| t.id == entry.id) {
            bail!("duplicate task id {:?} in {}", entry.id, path.display());
        }
        tasks.push(Task {
            id: entry.id,
            title: entry.title,
            status: TaskStatus::Open,
            priority: entry.priority,
            depends_on: entry.depends_on.into_iter().collect(),
            impact_plan: None,
            impact_table: (!entry.impact.is_empty()).then_some(entry.impact),
            updated_at: None,
        });
    }

    for task in &tasks {
        for dep in &task.depends_on {
            if !tasks.iter().any(|t| &t.id == dep) {
                bail!(
                    "task {:?} depends on unknown task {:?}",
                    task.id,
                    dep
                );
            }
        }
    }

    Ok(tasks)
}
