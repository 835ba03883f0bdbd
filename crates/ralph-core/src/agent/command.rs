//! Generic subprocess agent adapter.
//!
//! Spawns the configured agent command, writes the prompt to its stdin,
//! and streams stdout/stderr line by line through the caller's hooks.
//! Completion is signalled by a sentinel substring in stdout or a zero
//! exit code; a timed-out run is terminated with SIGTERM, then SIGKILL.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::ansi::strip_ansi;
use crate::config::AgentConfig;

use super::{Agent, AgentRunResult, StreamHooks};

/// Agent plugin that wraps an arbitrary CLI.
#[derive(Debug, Clone)]
pub struct CommandAgent {
    command: String,
    args: Vec<String>,
    timeout: Duration,
    completion_sentinel: String,
}

impl CommandAgent {
    /// Build from the resolved agent configuration.
    pub fn from_config(config: &AgentConfig) -> Self {
        let mut args = config.default_flags.clone();
        if let Some(model) = &config.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        Self {
            command: config.command.clone(),
            args,
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            completion_sentinel: config.completion_sentinel.clone(),
        }
    }

    /// Terminate a child: SIGTERM first, then SIGKILL after a short grace
    /// period.
    async fn terminate(child: &mut Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                warn!(pid, "SIGTERM failed, proceeding to SIGKILL");
            }
        }

        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(_status)) => {
                debug!("agent exited after SIGTERM");
            }
            _ => {
                debug!("agent did not exit after SIGTERM, sending SIGKILL");
                let _ = child.kill().await;
            }
        }
    }
}

#[async_trait]
impl Agent for CommandAgent {
    fn name(&self) -> &str {
        "command"
    }

    async fn execute_task(
        &self,
        prompt: &str,
        workspace: &Path,
        hooks: &StreamHooks,
    ) -> Result<AgentRunResult> {
        let start = Instant::now();

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| {
                format!(
                    "failed to spawn agent command '{}' -- is it installed and on PATH?",
                    self.command
                )
            })?;

        // The agent reads its prompt from stdin; close it so it starts.
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(error = %e, "failed to write prompt to agent stdin");
            }
            drop(stdin);
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        // Read both pipes concurrently with waiting for exit; a full pipe
        // buffer would otherwise deadlock the child.
        let read_stdout = async {
            let mut collected = String::new();
            if let Some(pipe) = stdout_pipe {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let clean = strip_ansi(&line);
                    hooks.emit_stdout(&clean);
                    collected.push_str(&clean);
                    collected.push('\n');
                }
            }
            collected
        };

        let read_stderr = async {
            let mut collected = String::new();
            if let Some(pipe) = stderr_pipe {
                let mut lines = BufReader::new(pipe).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let clean = strip_ansi(&line);
                    hooks.emit_stderr(&clean);
                    collected.push_str(&clean);
                    collected.push('\n');
                }
            }
            collected
        };

        let waited = tokio::time::timeout(self.timeout, async {
            let (status, stdout, stderr) =
                tokio::join!(child.wait(), read_stdout, read_stderr);
            (status, stdout, stderr)
        })
        .await;

        let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match waited {
            Ok((Ok(status), stdout, stderr)) => {
                let exit_code = status.code();
                let completed =
                    exit_code == Some(0) || stdout.contains(&self.completion_sentinel);
                Ok(AgentRunResult {
                    stdout,
                    stderr,
                    exit_code,
                    completed,
                    duration_ms,
                })
            }
            Ok((Err(e), _, _)) => {
                Err(e).with_context(|| format!("failed to wait on agent '{}'", self.command))
            }
            Err(_elapsed) => {
                warn!(
                    command = %self.command,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "agent run timed out, terminating"
                );
                Self::terminate(&mut child).await;
                Ok(AgentRunResult {
                    stdout: String::new(),
                    stderr: format!(
                        "agent '{}' timed out after {}ms",
                        self.command,
                        self.timeout.as_millis()
                    ),
                    exit_code: None,
                    completed: false,
                    duration_ms,
                })
            }
        }
    }
}
