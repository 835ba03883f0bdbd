//! The agent boundary: adapter interface for external code-generation
//! agents.
//!
//! Each concrete agent plugin wraps a specific CLI and translates its I/O
//! into the common [`AgentRunResult`] shape. The trait is object-safe so
//! workers can hold `Arc<dyn Agent>`.

pub mod command;
pub mod registry;

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

pub use command::CommandAgent;
pub use registry::AgentRegistry;

/// Callback invoked with each ANSI-stripped output line as it arrives.
pub type OutputHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Streaming callbacks for a single agent run.
#[derive(Clone, Default)]
pub struct StreamHooks {
    pub on_stdout: Option<OutputHook>,
    pub on_stderr: Option<OutputHook>,
}

impl StreamHooks {
    /// No streaming; output is still collected in the result.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn emit_stdout(&self, line: &str) {
        if let Some(hook) = &self.on_stdout {
            hook(line);
        }
    }

    pub fn emit_stderr(&self, line: &str) {
        if let Some(hook) = &self.on_stderr {
            hook(line);
        }
    }
}

impl std::fmt::Debug for StreamHooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHooks")
            .field("on_stdout", &self.on_stdout.is_some())
            .field("on_stderr", &self.on_stderr.is_some())
            .finish()
    }
}

/// Result of a single agent execution.
#[derive(Debug, Clone)]
pub struct AgentRunResult {
    /// Full captured stdout, ANSI-stripped.
    pub stdout: String,
    /// Full captured stderr, ANSI-stripped.
    pub stderr: String,
    /// Process exit code; `None` when killed (timeout or signal).
    pub exit_code: Option<i32>,
    /// Whether the agent signalled completion (sentinel or clean exit).
    pub completed: bool,
    pub duration_ms: u64,
}

impl AgentRunResult {
    /// Last `n` lines of stdout, for recovery prompts and failure context.
    pub fn stdout_tail(&self, n: usize) -> String {
        let lines: Vec<&str> = self.stdout.lines().collect();
        let start = lines.len().saturating_sub(n);
        lines[start..].join("\n")
    }
}

/// Adapter interface for executing a prompt inside a workspace.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Plugin name (e.g. "command").
    fn name(&self) -> &str;

    /// Run the agent with the given prompt, working directory, and
    /// streaming hooks, and wait for it to finish.
    async fn execute_task(
        &self,
        prompt: &str,
        workspace: &Path,
        hooks: &StreamHooks,
    ) -> Result<AgentRunResult>;
}

// Compile-time assertion: Agent must remain object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Agent) {}
};

/// Case-insensitive scan of a run's output for credit-exhaustion markers.
///
/// A hit is a non-retriable operator condition: the coordinator blocks the
/// task and pauses itself.
pub fn detect_credit_exhaustion(result: &AgentRunResult, markers: &[String]) -> bool {
    if markers.is_empty() {
        return false;
    }
    let stdout = result.stdout.to_lowercase();
    let stderr = result.stderr.to_lowercase();
    markers.iter().any(|marker| {
        let needle = marker.to_lowercase();
        !needle.is_empty() && (stdout.contains(&needle) || stderr.contains(&needle))
    })
}
