//! Workers: one isolated workspace plus one agent instance each.
//!
//! A worker owns its branch exclusively. After an agent run it harvests the
//! commits the agent produced (creating one itself when the agent left
//! uncommitted work), normalizes commit messages so every accepted commit
//! correlates back to its task, and advances its remembered base so the
//! next run only reports new commits.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::agent::{Agent, AgentRunResult, StreamHooks, detect_credit_exhaustion};
use crate::git::{CommitMetadata, GitDriver};
use crate::tracker::Task;

/// The commit trailer correlating a commit to its task.
pub const TASK_TRAILER_KEY: &str = "Ralph-Task";

/// Maximum subject title length before truncation.
const TITLE_LIMIT: usize = 60;

/// Result of one worker task run.
#[derive(Debug)]
pub struct WorkerRunResult {
    pub agent: AgentRunResult,
    /// Accepted commits in application order (ancestor first).
    pub commits: Vec<CommitMetadata>,
    /// The agent reported a recognized credit-exhaustion condition.
    pub credit_exhausted: bool,
    /// A commit-recovery prompt was issued during this run.
    pub recovery_attempted: bool,
    /// Completed with no commits and a clean tree: a no-op success.
    pub no_op: bool,
}

/// Commit-message format helpers.
///
/// Subject: `<taskId>: <title truncated to 60 chars>`; trailer:
/// `Ralph-Task: <taskId>`. Commits carrying neither are rejected with a
/// warning; a bare task id in the subject is tolerated but warned about.
pub fn commit_subject(task_id: &str, title: &str) -> String {
    format!("{task_id}: {}", truncate_title(title))
}

pub fn task_trailer(task_id: &str) -> String {
    format!("{TASK_TRAILER_KEY}: {task_id}")
}

/// Truncate a title to [`TITLE_LIMIT`] characters, appending `…` when cut.
pub fn truncate_title(title: &str) -> String {
    if title.chars().count() <= TITLE_LIMIT {
        title.to_string()
    } else {
        let cut: String = title.chars().take(TITLE_LIMIT).collect();
        format!("{cut}…")
    }
}

/// How (or whether) a commit message correlates to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageMatch {
    /// Subject starts with `<taskId>: `.
    Prefix,
    /// Message contains the `Ralph-Task: <taskId>` trailer.
    Trailer,
    /// Subject merely contains the task id; tolerated with a warning.
    SubjectContains,
    /// No correlation; the commit is dropped.
    None,
}

/// Classify a commit message against a task id.
pub fn classify_message(message: &str, task_id: &str) -> MessageMatch {
    let subject = message.lines().next().unwrap_or_default();
    if subject.starts_with(&format!("{task_id}: ")) {
        return MessageMatch::Prefix;
    }
    if message
        .lines()
        .any(|line| line.trim() == task_trailer(task_id))
    {
        return MessageMatch::Trailer;
    }
    if subject.contains(task_id) {
        return MessageMatch::SubjectContains;
    }
    MessageMatch::None
}

/// A worker: identity, workspace, agent, reservation state, and the last
/// integration head it synced from.
pub struct Worker {
    id: String,
    workspace: PathBuf,
    branch: String,
    agent: std::sync::Arc<dyn Agent>,
    git: GitDriver,
    reserved: AtomicBool,
    busy: AtomicBool,
    base_commit: Mutex<String>,
    recovered_tasks: Mutex<HashSet<String>>,
    excluded_paths: Vec<String>,
    credit_markers: Vec<String>,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("workspace", &self.workspace)
            .field("branch", &self.branch)
            .field("reserved", &self.reserved.load(Ordering::SeqCst))
            .field("busy", &self.busy.load(Ordering::SeqCst))
            .finish()
    }
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        workspace: PathBuf,
        branch: impl Into<String>,
        agent: std::sync::Arc<dyn Agent>,
        git: GitDriver,
        base_commit: String,
        excluded_paths: Vec<String>,
        credit_markers: Vec<String>,
    ) -> Self {
        Self {
            id: id.into(),
            workspace,
            branch: branch.into(),
            agent,
            git,
            reserved: AtomicBool::new(false),
            busy: AtomicBool::new(false),
            base_commit: Mutex::new(base_commit),
            recovered_tasks: Mutex::new(HashSet::new()),
            excluded_paths,
            credit_markers,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// Atomically reserve an idle worker for dispatch.
    pub fn try_reserve(&self) -> bool {
        self.reserved
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release_reservation(&self) {
        self.reserved.store(false, Ordering::SeqCst);
    }

    pub fn is_reserved(&self) -> bool {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// The integration head observed when this worker last synced.
    pub fn base_commit(&self) -> String {
        self.base_commit
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run the agent for a task, then harvest its commits.
    pub async fn execute_task(
        &self,
        task: &Task,
        prompt: &str,
        hooks: &StreamHooks,
    ) -> Result<WorkerRunResult> {
        self.busy.store(true, Ordering::SeqCst);
        let result = self.execute_task_inner(task, prompt, hooks).await;
        self.busy.store(false, Ordering::SeqCst);
        result
    }

    async fn execute_task_inner(
        &self,
        task: &Task,
        prompt: &str,
        hooks: &StreamHooks,
    ) -> Result<WorkerRunResult> {
        let agent_result = self
            .agent
            .execute_task(prompt, &self.workspace, hooks)
            .await
            .with_context(|| format!("agent run failed for task {}", task.id))?;

        if detect_credit_exhaustion(&agent_result, &self.credit_markers) {
            warn!(task_id = %task.id, worker_id = %self.id, "credit exhaustion reported by agent");
            return Ok(WorkerRunResult {
                agent: agent_result,
                commits: Vec::new(),
                credit_exhausted: true,
                recovery_attempted: false,
                no_op: false,
            });
        }

        if !agent_result.completed {
            return Ok(WorkerRunResult {
                agent: agent_result,
                commits: Vec::new(),
                credit_exhausted: false,
                recovery_attempted: false,
                no_op: false,
            });
        }

        let mut commits = self.collect_commits(task)?;
        let mut recovery_attempted = false;

        // Completion without commits but with leftover changes gets exactly
        // one recovery attempt.
        if commits.is_empty() && !self.filtered_changes()?.is_empty() {
            let first_attempt = self
                .recovered_tasks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(task.id.clone());
            if first_attempt {
                recovery_attempted = true;
                let recovery_prompt = self.recovery_prompt(task, &agent_result)?;
                info!(task_id = %task.id, worker_id = %self.id, "issuing commit recovery prompt");
                let recovery_result = self
                    .agent
                    .execute_task(&recovery_prompt, &self.workspace, hooks)
                    .await
                    .with_context(|| format!("recovery run failed for task {}", task.id))?;
                if detect_credit_exhaustion(&recovery_result, &self.credit_markers) {
                    return Ok(WorkerRunResult {
                        agent: recovery_result,
                        commits: Vec::new(),
                        credit_exhausted: true,
                        recovery_attempted,
                        no_op: false,
                    });
                }
                commits = self.collect_commits(task)?;
            }
        }

        let no_op = commits.is_empty() && self.filtered_changes()?.is_empty();

        Ok(WorkerRunResult {
            agent: agent_result,
            commits,
            credit_exhausted: false,
            recovery_attempted,
            no_op,
        })
    }

    /// Status entries that are not coordinator-internal.
    fn filtered_changes(&self) -> Result<Vec<String>> {
        let entries = self.git.status_porcelain()?;
        Ok(entries
            .into_iter()
            .filter(|e| !self.is_excluded(&e.path))
            .map(|e| e.path)
            .collect())
    }

    fn is_excluded(&self, path: &str) -> bool {
        self.excluded_paths
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Harvest commits for a task from this worker's branch.
    ///
    /// 1. If filtered changes exist and nothing is staged, stage everything,
    ///    unstage the excluded paths, and commit with the task subject and
    ///    trailer.
    /// 2. List commits since the remembered base, ancestor first.
    /// 3. Normalize HEAD's message if it correlates to the task in no way.
    /// 4. Keep only commits that correlate; warn on bare subject matches.
    /// 5. Advance the remembered base to the new HEAD.
    fn collect_commits(&self, task: &Task) -> Result<Vec<CommitMetadata>> {
        let git = &self.git;

        let filtered = self.filtered_changes()?;
        if !filtered.is_empty() && git.staged_files()?.is_empty() {
            git.add_all()?;
            let excluded: Vec<String> = self
                .excluded_paths
                .iter()
                .map(|p| p.trim_end_matches('/').to_string())
                .collect();
            git.unstage(&excluded)?;
            if !git.staged_files()?.is_empty() {
                git.commit(
                    &commit_subject(&task.id, &task.title),
                    Some(&task_trailer(&task.id)),
                )?;
            }
        }

        let base = self.base_commit();
        let mut hashes = git.rev_list(&base, true)?;

        // Idempotent normalization: a HEAD commit correlating in no way gets
        // the trailer appended.
        if let Some(head) = hashes.last() {
            let message = git.commit_message(head)?;
            if classify_message(&message, &task.id) == MessageMatch::None {
                let amended = format!("{message}\n\n{}", task_trailer(&task.id));
                git.commit_amend(&amended)?;
                hashes = git.rev_list(&base, true)?;
            }
        }

        let mut commits = Vec::new();
        for hash in &hashes {
            let meta = git.commit_metadata(hash)?;
            match classify_message(&meta.message(), &task.id) {
                MessageMatch::Prefix | MessageMatch::Trailer => commits.push(meta),
                MessageMatch::SubjectContains => {
                    warn!(
                        task_id = %task.id,
                        commit = %meta.short_hash,
                        "accepting commit whose subject merely contains the task id"
                    );
                    commits.push(meta);
                }
                MessageMatch::None => {
                    warn!(
                        task_id = %task.id,
                        commit = %meta.short_hash,
                        subject = %meta.subject,
                        "dropping commit with no task correlation"
                    );
                }
            }
        }

        let head = git.rev_parse("HEAD")?;
        *self.base_commit.lock().unwrap_or_else(|e| e.into_inner()) = head;

        Ok(commits)
    }

    /// Prompt for the single-shot commit recovery pass.
    fn recovery_prompt(&self, task: &Task, last: &AgentRunResult) -> Result<String> {
        let files = self.filtered_changes()?;
        Ok(format!(
            "Your previous run for task {id} ({title}) reported completion but \
             left uncommitted changes and created no commits.\n\n\
             Uncommitted files:\n{files}\n\n\
             Last output tail:\n{tail}\n\n\
             Either commit the changes that belong to this task with the \
             subject '{subject}' and the trailer '{trailer}', or restore the \
             working tree so it is clean. Do nothing else.",
            id = task.id,
            title = task.title,
            files = files
                .iter()
                .map(|f| format!("  - {f}"))
                .collect::<Vec<_>>()
                .join("\n"),
            tail = last.stdout_tail(20),
            subject = commit_subject(&task.id, &task.title),
            trailer = task_trailer(&task.id),
        ))
    }

    /// Reset transient run state. The workspace itself is removed by the
    /// workspace manager.
    pub fn dispose(&self) {
        self.release_reservation();
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// The fixed set of workers for a run.
#[derive(Debug, Default)]
pub struct WorkerPool {
    workers: Vec<std::sync::Arc<Worker>>,
}

impl WorkerPool {
    pub fn new(workers: Vec<std::sync::Arc<Worker>>) -> Self {
        Self { workers }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn workers(&self) -> &[std::sync::Arc<Worker>] {
        &self.workers
    }

    pub fn get(&self, worker_id: &str) -> Option<&std::sync::Arc<Worker>> {
        self.workers.iter().find(|w| w.id() == worker_id)
    }

    /// First worker that is neither reserved nor busy.
    pub fn idle_worker(&self) -> Option<&std::sync::Arc<Worker>> {
        self.workers
            .iter()
            .find(|w| !w.is_reserved() && !w.is_busy())
    }

    pub fn any_busy(&self) -> bool {
        self.workers.iter().any(|w| w.is_busy())
    }

    pub fn dispose_all(&self) {
        for worker in &self.workers {
            worker.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::CommandAgent;
    use crate::config::AgentConfig;
    use std::process::Command;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(output.status.success(), "git {} failed", args.join(" "));
        };

        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@ralph.dev"]);
        run(&["config", "user.name", "Ralph Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    /// A worker whose agent is a shell script run in the repo itself.
    fn worker_with_script(repo: &Path, script_body: &str) -> Worker {
        let script = repo.join("fake-agent.sh");
        std::fs::write(&script, format!("#!/bin/sh\n{script_body}")).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let config = AgentConfig {
            command: script.to_string_lossy().into_owned(),
            timeout_ms: 30_000,
            ..AgentConfig::default()
        };
        let git = GitDriver::open(repo).unwrap();
        let base = git.rev_parse("HEAD").unwrap();
        Worker::new(
            "w1",
            repo.to_path_buf(),
            "main",
            Arc::new(CommandAgent::from_config(&config)),
            git,
            base,
            vec![".ralph/".to_string(), "fake-agent.sh".to_string()],
            config.credit_markers.clone(),
        )
    }

    fn task(id: &str, title: &str) -> Task {
        Task::open(id, title)
    }

    #[test]
    fn reservation_is_exclusive() {
        let (_dir, repo) = create_temp_repo();
        let worker = worker_with_script(&repo, "exit 0\n");

        assert!(worker.try_reserve());
        assert!(!worker.try_reserve());
        worker.release_reservation();
        assert!(worker.try_reserve());
    }

    #[tokio::test]
    async fn uncommitted_work_is_auto_committed_with_subject_and_trailer() {
        let (_dir, repo) = create_temp_repo();
        let worker = worker_with_script(&repo, "echo agent output > work.txt\nexit 0\n");

        let result = worker
            .execute_task(&task("T1", "add work file"), "go", &StreamHooks::none())
            .await
            .unwrap();

        assert!(result.agent.completed);
        assert!(!result.recovery_attempted);
        assert_eq!(result.commits.len(), 1);
        let commit = &result.commits[0];
        assert_eq!(commit.subject, "T1: add work file");
        assert!(commit.message().contains("Ralph-Task: T1"));
        assert_eq!(commit.file_names, vec!["work.txt".to_string()]);

        // Base advanced: a second collection sees nothing new.
        assert_eq!(worker.base_commit(), GitDriver::open(&repo).unwrap().rev_parse("HEAD").unwrap());
    }

    #[tokio::test]
    async fn excluded_paths_are_not_committed() {
        let (_dir, repo) = create_temp_repo();
        std::fs::create_dir_all(repo.join(".ralph")).unwrap();
        let worker = worker_with_script(
            &repo,
            "echo internal > .ralph/state.json\necho real > code.txt\nexit 0\n",
        );

        let result = worker
            .execute_task(&task("T2", "real change"), "go", &StreamHooks::none())
            .await
            .unwrap();

        assert_eq!(result.commits.len(), 1);
        assert_eq!(result.commits[0].file_names, vec!["code.txt".to_string()]);

        // The internal file stays uncommitted on disk.
        assert!(repo.join(".ralph/state.json").exists());
    }

    #[tokio::test]
    async fn agent_commit_without_correlation_is_normalized() {
        let (_dir, repo) = create_temp_repo();
        let worker = worker_with_script(
            &repo,
            "echo v > feature.txt\ngit add feature.txt\ngit commit -q -m 'implement feature'\nexit 0\n",
        );

        let result = worker
            .execute_task(&task("T3", "feature"), "go", &StreamHooks::none())
            .await
            .unwrap();

        assert_eq!(result.commits.len(), 1);
        let message = result.commits[0].message();
        assert!(message.contains("Ralph-Task: T3"), "trailer appended: {message}");
        assert_eq!(result.commits[0].subject, "implement feature");
    }

    #[tokio::test]
    async fn normalization_is_idempotent_for_prefixed_commits() {
        let (_dir, repo) = create_temp_repo();
        let worker = worker_with_script(
            &repo,
            "echo v > p.txt\ngit add p.txt\ngit commit -q -m 'T4: already prefixed'\nexit 0\n",
        );

        let result = worker
            .execute_task(&task("T4", "prefixed"), "go", &StreamHooks::none())
            .await
            .unwrap();

        assert_eq!(result.commits.len(), 1);
        assert_eq!(result.commits[0].subject, "T4: already prefixed");
        // No trailer was forced onto an already-correlated commit.
        assert!(!result.commits[0].message().contains("Ralph-Task:"));
    }

    #[tokio::test]
    async fn clean_completion_without_commits_is_a_no_op_success() {
        let (_dir, repo) = create_temp_repo();
        let worker = worker_with_script(&repo, "echo nothing to do\nexit 0\n");

        let result = worker
            .execute_task(&task("T5", "noop"), "go", &StreamHooks::none())
            .await
            .unwrap();

        assert!(result.no_op);
        assert!(result.commits.is_empty());
        assert!(!result.recovery_attempted);
    }

    #[tokio::test]
    async fn staged_but_uncommitted_work_triggers_exactly_one_recovery() {
        let (_dir, repo) = create_temp_repo();
        // First run: stage a file but do not commit. Recovery run: commit it.
        let worker = worker_with_script(
            &repo,
            r#"if [ -f .recovered ]; then
  git commit -q -m "T6: recovered work"
else
  echo staged > staged.txt
  git add staged.txt
  touch .recovered
  git add .recovered
fi
exit 0
"#,
        );

        let result = worker
            .execute_task(&task("T6", "staged work"), "go", &StreamHooks::none())
            .await
            .unwrap();

        assert!(result.recovery_attempted);
        assert_eq!(result.commits.len(), 1);
        assert_eq!(result.commits[0].subject, "T6: recovered work");
    }

    #[tokio::test]
    async fn credit_exhaustion_skips_commit_collection() {
        let (_dir, repo) = create_temp_repo();
        let worker = worker_with_script(
            &repo,
            "echo error: insufficient_credit\necho x > leftover.txt\nexit 0\n",
        );

        let result = worker
            .execute_task(&task("T7", "rate limited"), "go", &StreamHooks::none())
            .await
            .unwrap();

        assert!(result.credit_exhausted);
        assert!(result.commits.is_empty());
    }

    #[tokio::test]
    async fn incomplete_run_collects_nothing() {
        let (_dir, repo) = create_temp_repo();
        let worker = worker_with_script(&repo, "echo gave up\nexit 1\n");

        let result = worker
            .execute_task(&task("T8", "failing"), "go", &StreamHooks::none())
            .await
            .unwrap();

        assert!(!result.agent.completed);
        assert!(result.commits.is_empty());
        assert!(!result.no_op);
    }

    #[test]
    fn pool_finds_idle_workers() {
        let (_dir, repo) = create_temp_repo();
        let w1 = Arc::new(worker_with_script(&repo, "exit 0\n"));
        let w2 = Arc::new(worker_with_script(&repo, "exit 0\n"));
        let pool = WorkerPool::new(vec![Arc::clone(&w1), Arc::clone(&w2)]);

        assert!(w1.try_reserve());
        let idle = pool.idle_worker().expect("one worker should be idle");
        assert_eq!(idle.id(), w2.id());

        assert!(w2.try_reserve());
        assert!(pool.idle_worker().is_none());
        assert!(!pool.any_busy());

        pool.dispose_all();
        assert!(pool.idle_worker().is_some());
    }

    // -- message format helpers --------------------------------------------

    #[test]
    fn subject_truncates_long_titles() {
        let short = commit_subject("T1", "short title");
        assert_eq!(short, "T1: short title");

        let long_title = "x".repeat(80);
        let subject = commit_subject("T1", &long_title);
        assert_eq!(subject, format!("T1: {}…", "x".repeat(60)));
    }

    #[test]
    fn classify_message_variants() {
        assert_eq!(classify_message("T1: did things", "T1"), MessageMatch::Prefix);
        assert_eq!(
            classify_message("did things\n\nRalph-Task: T1", "T1"),
            MessageMatch::Trailer
        );
        assert_eq!(
            classify_message("fix T1 regression", "T1"),
            MessageMatch::SubjectContains
        );
        assert_eq!(classify_message("unrelated", "T1"), MessageMatch::None);
        // Prefix of another task does not match.
        assert_eq!(classify_message("T12: other task", "T1"), MessageMatch::SubjectContains);
    }
}
