//! Conflict resolution for cherry-picks that stop on conflicts.
//!
//! Resolution runs in a fresh ephemeral workspace branched from the
//! integration head, so a botched attempt never touches the merge
//! workspace. Per conflicted file the resolver tries, in order: the
//! operator's configured merge tool, whitespace-equivalent marker
//! collapse (keep theirs), accept theirs, accept ours. When the automatic
//! ladder fails it hands the workspace to the agent with explicit
//! boundaries. The ephemeral workspace is destroyed on every path.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agent::{Agent, StreamHooks};
use crate::git::{CherryPick, CommitMetadata, GitDriver};

/// Sentinel the resolution agent must print when it believes it is done.
const RESOLUTION_SENTINEL: &str = "RALPH_RESOLVED";

/// Outcome of a resolution attempt.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// A resolved commit exists on the ephemeral branch, ready to be
    /// replayed onto integration.
    Resolved {
        commit: String,
        conflict_files: Vec<String>,
    },
    /// Automatic and agent strategies both failed.
    Unresolved {
        conflict_files: Vec<String>,
        reason: String,
    },
}

/// Resolves conflicted cherry-picks in ephemeral workspaces.
pub struct ConflictResolver {
    git: GitDriver,
    workspaces_dir: PathBuf,
    integration_branch: String,
    agent: Option<Arc<dyn Agent>>,
}

impl std::fmt::Debug for ConflictResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictResolver")
            .field("integration_branch", &self.integration_branch)
            .field("agent", &self.agent.is_some())
            .finish()
    }
}

impl ConflictResolver {
    pub fn new(
        git: GitDriver,
        workspaces_dir: PathBuf,
        integration_branch: impl Into<String>,
        agent: Option<Arc<dyn Agent>>,
    ) -> Self {
        Self {
            git,
            workspaces_dir,
            integration_branch: integration_branch.into(),
            agent,
        }
    }

    /// Attempt to resolve a conflicted commit. The ephemeral workspace is
    /// destroyed before returning, on every path.
    pub async fn resolve(&self, commit: &CommitMetadata) -> Result<Resolution> {
        std::fs::create_dir_all(&self.workspaces_dir).with_context(|| {
            format!(
                "failed to create workspaces dir {}",
                self.workspaces_dir.display()
            )
        })?;

        let stamp = Utc::now().timestamp_millis();
        let branch = format!("ralph/resolve/{}-{stamp}", commit.short_hash);
        let path = self
            .workspaces_dir
            .join(format!("resolve-{}-{stamp}", commit.short_hash));

        self.git
            .worktree_add(&path, Some(&branch), &self.integration_branch)
            .with_context(|| format!("failed to create resolution workspace for {}", commit.short_hash))?;

        let ws = self.git.at(&path);
        let result = self.resolve_in_workspace(&ws, commit).await;

        // Destruction is unconditional; a stuck pick must not leak a
        // workspace or its branch.
        if ws.rev_parse("CHERRY_PICK_HEAD").is_ok() {
            let _ = ws.cherry_pick_abort();
        }
        if let Err(e) = self.git.worktree_remove(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove resolution workspace");
        }
        if let Err(e) = self.git.branch_delete(&branch) {
            warn!(branch = %branch, error = %e, "failed to delete resolution branch");
        }

        result
    }

    async fn resolve_in_workspace(
        &self,
        ws: &GitDriver,
        commit: &CommitMetadata,
    ) -> Result<Resolution> {
        let integration_head = ws.rev_parse("HEAD")?;

        match ws.cherry_pick(&commit.hash)? {
            CherryPick::Applied => {
                // Conflicted on integration but clean here; take the commit.
                return Ok(Resolution::Resolved {
                    commit: ws.rev_parse("HEAD")?,
                    conflict_files: Vec::new(),
                });
            }
            CherryPick::Empty => {
                ws.cherry_pick_skip()?;
                return Ok(Resolution::Unresolved {
                    conflict_files: Vec::new(),
                    reason: "cherry-pick became empty in the resolution workspace".to_string(),
                });
            }
            CherryPick::Conflict => {}
        }

        let conflict_files = ws.conflicted_files()?;
        info!(
            commit = %commit.short_hash,
            files = ?conflict_files,
            "attempting automatic conflict resolution"
        );

        let mergetool_available = ws.config_get("merge.tool")?.is_some();

        for file in &conflict_files {
            if self.resolve_file(ws, file, mergetool_available)? {
                continue;
            }
            debug!(file = %file, "automatic strategies failed for file");
        }

        if ws.conflicted_files()?.is_empty() {
            ws.add_all()?;
            if ws.cherry_pick_continue()? {
                let head = ws.rev_parse("HEAD")?;
                if head != integration_head {
                    return Ok(Resolution::Resolved {
                        commit: head,
                        conflict_files,
                    });
                }
            }
        }

        // Automatic ladder failed; hand the workspace to the agent.
        self.agent_resolution(ws, commit, &conflict_files, &integration_head)
            .await
    }

    /// Per-file strategy ladder. Returns `true` when the file no longer
    /// conflicts.
    fn resolve_file(&self, ws: &GitDriver, file: &str, mergetool: bool) -> Result<bool> {
        if mergetool {
            match ws.mergetool(file) {
                Ok(true) => {
                    if !ws.conflicted_files()?.iter().any(|f| f == file) {
                        debug!(file = %file, "resolved by merge tool");
                        return Ok(true);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(file = %file, error = %e, "merge tool invocation failed"),
            }
        }

        let path = ws.workdir().join(file);
        if let Ok(content) = std::fs::read_to_string(&path) {
            if let Some(collapsed) = collapse_whitespace_conflict(&content) {
                std::fs::write(&path, collapsed)
                    .with_context(|| format!("failed to write resolved file {file}"))?;
                ws.add_path(file)?;
                debug!(file = %file, "resolved by whitespace marker collapse");
                return Ok(true);
            }
        }

        if ws.checkout_theirs(file).is_ok() {
            ws.add_path(file)?;
            debug!(file = %file, "resolved by accepting theirs");
            return Ok(true);
        }

        if ws.checkout_ours(file).is_ok() {
            ws.add_path(file)?;
            debug!(file = %file, "resolved by accepting ours");
            return Ok(true);
        }

        Ok(false)
    }

    async fn agent_resolution(
        &self,
        ws: &GitDriver,
        commit: &CommitMetadata,
        conflict_files: &[String],
        integration_head: &str,
    ) -> Result<Resolution> {
        let Some(agent) = &self.agent else {
            return Ok(Resolution::Unresolved {
                conflict_files: conflict_files.to_vec(),
                reason: "automatic strategies failed and no agent is configured".to_string(),
            });
        };

        let prompt = resolution_prompt(commit, conflict_files);
        let result = agent
            .execute_task(&prompt, ws.workdir(), &StreamHooks::none())
            .await
            .context("conflict-resolution agent run failed")?;

        if !result.completed && !result.stdout.contains(RESOLUTION_SENTINEL) {
            return Ok(Resolution::Unresolved {
                conflict_files: conflict_files.to_vec(),
                reason: "resolution agent did not signal completion".to_string(),
            });
        }

        let remaining = ws.conflicted_files()?;
        if !remaining.is_empty() {
            return Ok(Resolution::Unresolved {
                conflict_files: remaining,
                reason: "conflicts remained after agent resolution".to_string(),
            });
        }

        ws.add_all()?;
        if !ws.cherry_pick_continue()? {
            return Ok(Resolution::Unresolved {
                conflict_files: conflict_files.to_vec(),
                reason: "cherry-pick --continue failed after agent resolution".to_string(),
            });
        }

        let head = ws.rev_parse("HEAD")?;
        if head == integration_head {
            return Ok(Resolution::Unresolved {
                conflict_files: conflict_files.to_vec(),
                reason: "agent resolution produced no commit".to_string(),
            });
        }

        Ok(Resolution::Resolved {
            commit: head,
            conflict_files: conflict_files.to_vec(),
        })
    }
}

/// Prompt for the agent-driven resolution pass.
fn resolution_prompt(commit: &CommitMetadata, conflict_files: &[String]) -> String {
    format!(
        "A cherry-pick of commit {short} (\"{subject}\") stopped on conflicts in \
         this workspace.\n\n\
         Conflicted files:\n{files}\n\n\
         Resolve each conflict by editing the files, keeping both sides' intent. \
         Stage every resolved file with `git add`. Boundaries: do not refactor \
         unrelated code, do not switch branches, do not abort or finish the \
         cherry-pick yourself. When every conflict is resolved and staged, print \
         {sentinel} and stop.",
        short = commit.short_hash,
        subject = commit.subject,
        files = conflict_files
            .iter()
            .map(|f| format!("  - {f}"))
            .collect::<Vec<_>>()
            .join("\n"),
        sentinel = RESOLUTION_SENTINEL,
    )
}

/// Collapse a single whitespace-only conflict region, keeping "theirs".
///
/// Returns `None` when the content has no markers, more than one region,
/// diff3-style base sections, or sides that differ beyond whitespace.
pub fn collapse_whitespace_conflict(content: &str) -> Option<String> {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();

    let mut ours_start = None;
    let mut separator = None;
    let mut theirs_end = None;

    for (i, raw) in lines.iter().enumerate() {
        let line = raw.trim_end_matches('\n');
        if line.starts_with("<<<<<<<") {
            if ours_start.is_some() {
                return None;
            }
            ours_start = Some(i);
        } else if line.starts_with("|||||||") {
            // diff3 base section; out of scope for the simple strategy.
            return None;
        } else if line == "=======" || line.starts_with("======= ") {
            if ours_start.is_none() || separator.is_some() {
                return None;
            }
            separator = Some(i);
        } else if line.starts_with(">>>>>>>") {
            if separator.is_none() || theirs_end.is_some() {
                return None;
            }
            theirs_end = Some(i);
        }
    }

    let (start, sep, end) = (ours_start?, separator?, theirs_end?);

    let ours: String = lines[start + 1..sep].concat();
    let theirs: String = lines[sep + 1..end].concat();

    let squash = |s: &str| s.split_whitespace().collect::<String>();
    if squash(&ours) != squash(&theirs) {
        return None;
    }

    let mut out = String::new();
    out.push_str(&lines[..start].concat());
    out.push_str(&theirs);
    out.push_str(&lines[end + 1..].concat());
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CommandAgent;
    use crate::config::AgentConfig;
    use std::path::Path;
    use std::process::Command;
    use tempfile::TempDir;

    // -- pure marker collapse ----------------------------------------------

    #[test]
    fn collapses_whitespace_only_conflict_to_theirs() {
        let content = "fn main() {\n<<<<<<< HEAD\n    let x = 1;\n=======\n\tlet x = 1;\n>>>>>>> side\n}\n";
        let resolved = collapse_whitespace_conflict(content).unwrap();
        assert_eq!(resolved, "fn main() {\n\tlet x = 1;\n}\n");
    }

    #[test]
    fn rejects_semantic_conflicts() {
        let content = "<<<<<<< HEAD\nlet x = 1;\n=======\nlet x = 2;\n>>>>>>> side\n";
        assert!(collapse_whitespace_conflict(content).is_none());
    }

    #[test]
    fn rejects_multiple_regions() {
        let content = "<<<<<<< a\nx\n=======\n x\n>>>>>>> b\n<<<<<<< a\ny\n=======\n y\n>>>>>>> b\n";
        assert!(collapse_whitespace_conflict(content).is_none());
    }

    #[test]
    fn rejects_diff3_base_sections() {
        let content = "<<<<<<< HEAD\nx\n||||||| base\nz\n=======\n x\n>>>>>>> side\n";
        assert!(collapse_whitespace_conflict(content).is_none());
    }

    #[test]
    fn rejects_content_without_markers() {
        assert!(collapse_whitespace_conflict("plain file\n").is_none());
    }

    #[test]
    fn empty_sides_collapse() {
        let content = "a\n<<<<<<< HEAD\n=======\n>>>>>>> side\nb\n";
        assert_eq!(collapse_whitespace_conflict(content).unwrap(), "a\nb\n");
    }

    // -- integration -------------------------------------------------------

    fn run_git(dir: &Path, args: &[&str]) -> String {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
        String::from_utf8_lossy(&output.stdout).into_owned()
    }

    fn create_temp_repo() -> (TempDir, std::path::PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        run_git(&repo_path, &["init", "-b", "main"]);
        run_git(&repo_path, &["config", "user.email", "test@ralph.dev"]);
        run_git(&repo_path, &["config", "user.name", "Ralph Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
        run_git(&repo_path, &["add", "."]);
        run_git(&repo_path, &["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    /// Build: integration branch with one side of a conflict, a task commit
    /// with the other. Returns the conflicting commit's metadata.
    fn conflicting_commit(
        git: &GitDriver,
        repo: &Path,
        integration_content: &str,
        task_content: &str,
    ) -> CommitMetadata {
        std::fs::write(repo.join("x.txt"), "base\n").unwrap();
        git.add_all().unwrap();
        git.commit("seed x", None).unwrap();
        let base = git.rev_parse("HEAD").unwrap();

        // Task commit on a side branch.
        run_git(repo, &["checkout", "-b", "task-branch"]);
        std::fs::write(repo.join("x.txt"), task_content).unwrap();
        git.add_all().unwrap();
        git.commit("T1: task change", Some("Ralph-Task: T1")).unwrap();
        let task_commit = git.rev_parse("HEAD").unwrap();

        // Integration (main) diverges on the same file.
        run_git(repo, &["checkout", "main"]);
        let _ = base;
        std::fs::write(repo.join("x.txt"), integration_content).unwrap();
        git.add_all().unwrap();
        git.commit("integration change", None).unwrap();

        git.commit_metadata(&task_commit).unwrap()
    }

    fn resolver_for(repo: &Path, agent: Option<Arc<dyn Agent>>) -> ConflictResolver {
        let git = GitDriver::open(repo).unwrap();
        ConflictResolver::new(git, repo.join(".ralph/workspaces"), "main", agent)
    }

    #[tokio::test]
    async fn whitespace_conflict_resolves_to_theirs() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        // Same content modulo indentation: integration uses spaces, task
        // uses a tab.
        let commit = conflicting_commit(&git, &repo, "  value\n", "\tvalue\n");

        let resolver = resolver_for(&repo, None);
        let resolution = resolver.resolve(&commit).await.unwrap();

        match resolution {
            Resolution::Resolved {
                commit: resolved,
                conflict_files,
            } => {
                assert_eq!(conflict_files, vec!["x.txt".to_string()]);
                let message = git.commit_message(&resolved).unwrap();
                assert!(message.contains("T1: task change"));
            }
            other => panic!("expected resolution, got {other:?}"),
        }

        // Ephemeral workspace and branch are gone.
        assert!(!repo.join(".ralph/workspaces").join("resolve-").exists());
        let leftover: Vec<String> = std::fs::read_dir(repo.join(".ralph/workspaces"))
            .map(|rd| rd.filter_map(|e| e.ok().map(|e| e.file_name().to_string_lossy().into_owned())).collect())
            .unwrap_or_default();
        assert!(leftover.is_empty(), "leftover workspaces: {leftover:?}");
    }

    #[tokio::test]
    async fn semantic_conflict_falls_back_to_theirs() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        let commit = conflicting_commit(&git, &repo, "integration version\n", "task version\n");

        let resolver = resolver_for(&repo, None);
        let resolution = resolver.resolve(&commit).await.unwrap();

        let Resolution::Resolved { commit: resolved, .. } = resolution else {
            panic!("expected checkout --theirs fallback to resolve");
        };
        // "theirs" during cherry-pick is the task commit's content.
        let show = run_git(&repo, &["show", &format!("{resolved}:x.txt")]);
        assert_eq!(show, "task version\n");
    }

    #[tokio::test]
    async fn agent_fallback_is_used_when_automatic_fails() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        let commit = conflicting_commit(&git, &repo, "integration version\n", "task version\n");

        // Script resolves x.txt by writing merged content and staging it.
        let script = repo.join("resolve-agent.sh");
        std::fs::write(
            &script,
            "#!/bin/sh\necho merged version > x.txt\ngit add x.txt\necho RALPH_RESOLVED\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let agent_config = AgentConfig {
            command: script.to_string_lossy().into_owned(),
            timeout_ms: 30_000,
            ..AgentConfig::default()
        };
        let agent: Arc<dyn Agent> = Arc::new(CommandAgent::from_config(&agent_config));

        // Force the automatic ladder to be skipped by making checkout
        // --theirs/--ours unavailable: delete/modify conflict. Simpler: use
        // a resolver with no automatic win by testing the agent path
        // directly through a workspace primed with a conflict.
        let resolver = ConflictResolver::new(
            GitDriver::open(&repo).unwrap(),
            repo.join(".ralph/workspaces"),
            "main",
            Some(agent),
        );

        // The automatic ladder would normally win here; drive the agent
        // path explicitly.
        let stamp = chrono::Utc::now().timestamp_millis();
        let branch = format!("ralph/resolve/test-{stamp}");
        let path = repo.join(".ralph/workspaces").join(format!("agent-{stamp}"));
        std::fs::create_dir_all(repo.join(".ralph/workspaces")).unwrap();
        let root_git = GitDriver::open(&repo).unwrap();
        root_git.worktree_add(&path, Some(&branch), "main").unwrap();
        let ws = root_git.at(&path);
        assert_eq!(ws.cherry_pick(&commit.hash).unwrap(), CherryPick::Conflict);
        let integration_head = root_git.rev_parse("main").unwrap();

        let resolution = resolver
            .agent_resolution(&ws, &commit, &["x.txt".to_string()], &integration_head)
            .await
            .unwrap();

        let Resolution::Resolved { commit: resolved, .. } = resolution else {
            panic!("agent resolution should succeed");
        };
        let content = run_git(&path, &["show", &format!("{resolved}:x.txt")]);
        assert_eq!(content, "merged version\n");

        root_git.worktree_remove(&path).unwrap();
        root_git.branch_delete(&branch).unwrap();
    }
}
