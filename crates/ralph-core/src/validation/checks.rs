//! Check execution: one supervised subprocess per check.
//!
//! Commands run under `sh -c` in the validator workspace with a per-check
//! soft timeout. Output is ANSI-stripped and captured to
//! `<planDir>/<checkId>[-rerun-<n>].log`; the result records the exit
//! code, duration, and log path.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use serde::Serialize;

use crate::ansi::strip_ansi;

use super::plan::PlannedCheck;

/// The recorded outcome of one check invocation.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub check_id: String,
    /// Exit code, or `None` when the process was killed (timeout/signal).
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output_path: PathBuf,
    pub timed_out: bool,
    /// 0 for the first invocation, `n` for rerun `n`.
    pub rerun: u32,
}

impl CheckResult {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Run one check invocation and capture its output.
pub async fn run_check(
    check: &PlannedCheck,
    workdir: &Path,
    log_dir: &Path,
    rerun: u32,
) -> Result<CheckResult> {
    let start = Instant::now();
    let timeout = Duration::from_millis(check.timeout_ms.max(1));

    let log_name = if rerun == 0 {
        format!("{}.log", check.id)
    } else {
        format!("{}-rerun-{rerun}.log", check.id)
    };
    let output_path = log_dir.join(log_name);

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&check.command)
        .current_dir(workdir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn check {:?} ({})", check.id, check.command))?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    // Read both pipes concurrently with waiting; a full pipe buffer would
    // otherwise deadlock the child.
    let read_stdout = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stdout_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let read_stderr = async {
        let mut buf = Vec::new();
        if let Some(ref mut pipe) = stderr_pipe {
            pipe.read_to_end(&mut buf).await.ok();
        }
        String::from_utf8_lossy(&buf).into_owned()
    };

    let waited = tokio::time::timeout(timeout, async {
        let (status, stdout, stderr) = tokio::join!(child.wait(), read_stdout, read_stderr);
        (status, stdout, stderr)
    })
    .await;

    let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

    let (exit_code, timed_out, stdout, stderr) = match waited {
        Ok((Ok(status), stdout, stderr)) => (status.code(), false, stdout, stderr),
        Ok((Err(e), _, _)) => {
            return Err(e).with_context(|| format!("failed to wait on check {:?}", check.id));
        }
        Err(_elapsed) => {
            let _ = child.kill().await;
            (
                None,
                true,
                String::new(),
                format!("check {:?} timed out after {}ms\n", check.id, check.timeout_ms),
            )
        }
    };

    let mut body = String::new();
    body.push_str(&strip_ansi(&stdout));
    if !stderr.is_empty() {
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str("--- stderr ---\n");
        body.push_str(&strip_ansi(&stderr));
    }
    std::fs::write(&output_path, &body)
        .with_context(|| format!("failed to write check log {}", output_path.display()))?;

    Ok(CheckResult {
        check_id: check.id.clone(),
        exit_code,
        duration_ms,
        output_path,
        timed_out,
        rerun,
    })
}

/// Tail of a check log, for fix prompts and failure events.
pub fn log_tail(path: &Path, max_lines: usize) -> String {
    let Ok(body) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let lines: Vec<&str> = body.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
