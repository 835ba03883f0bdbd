//! Workspace lifecycle: isolated branch-bound checkouts for workers, the
//! merge and validator engines, and ephemeral conflict resolution.
//!
//! Each workspace is a git worktree at a stable, run-scoped path under the
//! coordinator state dir. Branch names are unique per run (time-suffixed),
//! so no two workspaces ever share a branch. Creation failures exclude the
//! affected worker for the run; they never take the other workers down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use tracing::{info, warn};

use crate::git::GitDriver;

/// Request to provision one workspace.
#[derive(Debug, Clone)]
pub struct WorkspaceSpec {
    pub worker_id: String,
    pub branch_name: String,
    pub base_ref: String,
    pub lock_reason: String,
}

/// Outcome of a batch provisioning call.
#[derive(Debug, Default)]
pub struct CreatedWorkspaces {
    /// Worker id -> workspace path for every successful creation.
    pub paths: HashMap<String, PathBuf>,
    /// Worker id -> error description for the rest.
    pub failures: Vec<(String, String)>,
}

/// Owns every isolated checkout of a run.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    git: GitDriver,
    workspaces_dir: PathBuf,
}

impl WorkspaceManager {
    /// A manager rooted at the repository, placing workspaces under
    /// `<state_dir>/workspaces`.
    pub fn new(git: GitDriver, state_dir: &Path) -> Self {
        Self {
            workspaces_dir: state_dir.join("workspaces"),
            git,
        }
    }

    pub fn workspaces_dir(&self) -> &Path {
        &self.workspaces_dir
    }

    /// Run-scoped branch name for a worker: `ralph/worker/<id>-<epochSecs>`.
    pub fn worker_branch_name(worker_id: &str) -> String {
        format!("ralph/worker/{worker_id}-{}", Utc::now().timestamp())
    }

    /// Provision a batch of workspaces in parallel.
    ///
    /// Failures are collected per worker; a failed creation never aborts
    /// the batch.
    pub async fn create_workspaces(&self, specs: Vec<WorkspaceSpec>) -> CreatedWorkspaces {
        let tasks = specs.into_iter().map(|spec| {
            let manager = self.clone();
            tokio::task::spawn_blocking(move || {
                let worker_id = spec.worker_id.clone();
                let result = manager.create_workspace(&spec);
                (worker_id, result)
            })
        });

        let mut created = CreatedWorkspaces::default();
        for joined in join_all(tasks).await {
            match joined {
                Ok((worker_id, Ok(path))) => {
                    created.paths.insert(worker_id, path);
                }
                Ok((worker_id, Err(e))) => {
                    warn!(worker_id = %worker_id, error = %e, "workspace creation failed");
                    created.failures.push((worker_id, format!("{e:#}")));
                }
                Err(join_err) => {
                    warn!(error = %join_err, "workspace creation task panicked");
                    created
                        .failures
                        .push(("<unknown>".to_string(), join_err.to_string()));
                }
            }
        }
        created
    }

    /// Provision a single workspace: `worktree add -B <branch> <path> <ref>`
    /// plus a lock recording the owner.
    pub fn create_workspace(&self, spec: &WorkspaceSpec) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.workspaces_dir).with_context(|| {
            format!(
                "failed to create workspaces dir {}",
                self.workspaces_dir.display()
            )
        })?;

        let dir_name = spec.branch_name.replace('/', "--");
        let path = self.workspaces_dir.join(dir_name);

        self.git
            .worktree_add(&path, Some(&spec.branch_name), &spec.base_ref)
            .with_context(|| {
                format!(
                    "failed to create workspace for {} on {}",
                    spec.worker_id, spec.branch_name
                )
            })?;

        if let Err(e) = self.git.worktree_lock(&path, &spec.lock_reason) {
            warn!(path = %path.display(), error = %e, "failed to lock workspace");
        }

        info!(
            worker_id = %spec.worker_id,
            branch = %spec.branch_name,
            path = %path.display(),
            "workspace created"
        );
        Ok(path)
    }

    /// Forced removal of a workspace directory.
    pub fn remove_workspace(&self, path: &Path) -> Result<()> {
        self.git
            .worktree_remove(path)
            .with_context(|| format!("failed to remove workspace at {}", path.display()))
    }

    /// Reconcile orphaned worktree registrations. Invoked at startup and
    /// after failed creations.
    pub fn prune_workspaces(&self) -> Result<()> {
        self.git.worktree_prune().context("failed to prune worktrees")
    }

    /// Create the run's recovery anchor: an annotated tag on the base
    /// branch head named `parallel-snapshot-<base>-<isoTs>`.
    pub fn snapshot(&self, base_branch: &str) -> Result<String> {
        let head = self
            .git
            .rev_parse(base_branch)
            .with_context(|| format!("failed to resolve base branch {base_branch}"))?;
        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%SZ");
        let name = format!("parallel-snapshot-{base_branch}-{stamp}");
        self.git
            .tag_annotated(&name, "parallel run snapshot", &head)
            .with_context(|| format!("failed to tag snapshot {name}"))?;
        info!(tag = %name, commit = %head, "snapshot tag created");
        Ok(name)
    }
}
