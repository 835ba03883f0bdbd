//! Version-control driver.
//!
//! Thin wrappers over the git subprocess primitives the coordinator relies
//! on: worktree lifecycle, staging and commits, cherry-pick with conflict
//! and empty-pick classification, fast-forward merges, ref updates, and
//! stash handling. Outcomes are parsed from exit codes and output, so the
//! exact argument lists matter.
//!
//! Git does not support concurrent mutations of the shared object store
//! (it takes a lock file); all mutating calls are serialised through one
//! process-wide mutex shared by every [`GitDriver`] cloned from the same
//! root.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;

/// Errors from git subprocess calls.
#[derive(Debug, Error)]
pub enum GitError {
    /// The path is not inside a git repository.
    #[error("not a git repository: {0}")]
    NotAGitRepo(PathBuf),

    /// The git binary could not be spawned.
    #[error("git command failed: {message}")]
    Spawn {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// A git command exited with a non-zero status.
    #[error("git {command} failed (exit {code}): {stderr}")]
    Exit {
        command: String,
        code: i32,
        stderr: String,
    },

    /// Output could not be parsed.
    #[error("failed to parse git output: {0}")]
    Parse(String),
}

/// Raw result of a git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    /// Combined stdout + stderr, lowercased, for substring classification.
    fn combined_lower(&self) -> String {
        let mut s = self.stdout.to_lowercase();
        s.push('\n');
        s.push_str(&self.stderr.to_lowercase());
        s
    }
}

/// Outcome of a `cherry-pick <commit>` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPick {
    /// The pick applied and produced a commit.
    Applied,
    /// The pick is empty against the current head; caller should `--skip`.
    Empty,
    /// The pick stopped on conflicts; caller must resolve or `--abort`.
    Conflict,
}

/// Author or committer identity on a commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// ISO-8601 date as git reports it.
    pub date: String,
}

/// Read-only projection of a committed change.
#[derive(Debug, Clone, Serialize)]
pub struct CommitMetadata {
    pub hash: String,
    pub short_hash: String,
    pub subject: String,
    pub body: String,
    pub author: Signature,
    pub committer: Signature,
    pub parents: Vec<String>,
    pub tree: String,
    pub files_changed: usize,
    pub insertions: usize,
    pub deletions: usize,
    pub file_names: Vec<String>,
}

impl CommitMetadata {
    /// Full message: subject plus body.
    pub fn message(&self) -> String {
        if self.body.is_empty() {
            self.subject.clone()
        } else {
            format!("{}\n\n{}", self.subject, self.body)
        }
    }
}

/// One entry of `status --porcelain`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// Two-character XY status code.
    pub code: String,
    pub path: String,
}

impl StatusEntry {
    /// Whether anything is staged for this entry.
    pub fn is_staged(&self) -> bool {
        !matches!(self.code.chars().next(), Some(' ') | Some('?') | None)
    }
}

const EMPTY_PICK_MARKERS: &[&str] = &[
    "cherry-pick is now empty",
    "previous cherry-pick is now empty",
];

/// Handle to a working directory inside one repository.
///
/// Cheap to clone; clones created via [`GitDriver::at`] share the mutation
/// lock of the original.
#[derive(Debug, Clone)]
pub struct GitDriver {
    workdir: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl GitDriver {
    /// Open a driver rooted at a repository (or worktree) directory.
    pub fn open(workdir: impl Into<PathBuf>) -> Result<Self, GitError> {
        let workdir = workdir.into();
        let driver = Self {
            workdir: workdir.clone(),
            lock: Arc::new(Mutex::new(())),
        };
        let out = driver.run(&["rev-parse", "--git-dir"])?;
        if !out.success() {
            return Err(GitError::NotAGitRepo(workdir));
        }
        Ok(driver)
    }

    /// A driver for another directory of the same repository, sharing this
    /// driver's mutation lock.
    pub fn at(&self, workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            lock: Arc::clone(&self.lock),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn run(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_EDITOR", "true")
            .output()
            .map_err(|e| GitError::Spawn {
                message: format!("failed to run git {}", args.join(" ")),
                source: e,
            })?;
        Ok(GitOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn run_checked(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let out = self.run(args)?;
        if !out.success() {
            return Err(GitError::Exit {
                command: args.join(" "),
                code: out.code,
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    fn run_locked(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.run(args)
    }

    fn run_locked_checked(&self, args: &[&str]) -> Result<GitOutput, GitError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = self.run(args)?;
        if !out.success() {
            return Err(GitError::Exit {
                command: args.join(" "),
                code: out.code,
                stderr: out.stderr,
            });
        }
        Ok(out)
    }

    // -- status & staging --------------------------------------------------

    /// Parsed `status --porcelain`.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>, GitError> {
        let out = self.run_checked(&["status", "--porcelain"])?;
        Ok(parse_status_porcelain(&out.stdout))
    }

    /// Whether the working tree has any uncommitted or untracked changes.
    pub fn is_dirty(&self) -> Result<bool, GitError> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    pub fn add_all(&self) -> Result<(), GitError> {
        self.run_locked_checked(&["add", "-A"]).map(|_| ())
    }

    /// Unstage the given paths (`reset -- <paths…>`). No-op for an empty
    /// list.
    pub fn unstage(&self, paths: &[String]) -> Result<(), GitError> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args: Vec<&str> = vec!["reset", "--"];
        args.extend(paths.iter().map(String::as_str));
        // reset -- <path> exits 0 even when paths are unknown.
        self.run_locked_checked(&args).map(|_| ())
    }

    /// Paths currently staged (`diff --name-only --cached`).
    pub fn staged_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run_checked(&["diff", "--name-only", "--cached"])?;
        Ok(lines_of(&out.stdout))
    }

    /// Create a commit with a subject and an optional trailer paragraph.
    pub fn commit(&self, subject: &str, trailer: Option<&str>) -> Result<(), GitError> {
        let mut args = vec!["commit", "-m", subject];
        if let Some(trailer) = trailer {
            args.push("-m");
            args.push(trailer);
        }
        self.run_locked_checked(&args).map(|_| ())
    }

    pub fn commit_amend(&self, message: &str) -> Result<(), GitError> {
        self.run_locked_checked(&["commit", "--amend", "-m", message])
            .map(|_| ())
    }

    /// Full commit message (`log -1 --format=%B`).
    pub fn commit_message(&self, rev: &str) -> Result<String, GitError> {
        let out = self.run_checked(&["log", "-1", "--format=%B", rev])?;
        Ok(out.stdout.trim_end().to_string())
    }

    /// Metadata projection for a commit.
    pub fn commit_metadata(&self, rev: &str) -> Result<CommitMetadata, GitError> {
        const FORMAT: &str =
            "%H%x00%h%x00%s%x00%b%x00%an%x00%ae%x00%aI%x00%cn%x00%ce%x00%cI%x00%P%x00%T";
        let format_arg = format!("--format={FORMAT}");
        let out = self.run_checked(&["log", "-1", &format_arg, rev])?;
        let mut meta = parse_commit_fields(&out.stdout)?;

        let names = self.run_checked(&["diff-tree", "--no-commit-id", "--name-only", "-r", rev])?;
        meta.file_names = lines_of(&names.stdout);

        let stat = self.run_checked(&["diff-tree", "--no-commit-id", "-r", "--stat", rev])?;
        let (files, ins, del) = parse_stat_summary(&stat.stdout);
        meta.files_changed = files;
        meta.insertions = ins;
        meta.deletions = del;

        Ok(meta)
    }

    // -- refs & history ----------------------------------------------------

    pub fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        let out = self.run_checked(&["rev-parse", rev])?;
        Ok(out.stdout.trim().to_string())
    }

    /// The checked-out branch, or `None` for a detached HEAD.
    pub fn current_branch(&self) -> Result<Option<String>, GitError> {
        let out = self.run_checked(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.stdout.trim().to_string();
        Ok((name != "HEAD").then_some(name))
    }

    /// Whether a local branch exists.
    pub fn branch_exists(&self, name: &str) -> Result<bool, GitError> {
        let refname = format!("refs/heads/{name}");
        let out = self.run(&["rev-parse", "--verify", "--quiet", &refname])?;
        Ok(out.success())
    }

    /// Commits reachable from `HEAD` but not from `base`
    /// (`rev-list [--reverse] <base>..HEAD`).
    pub fn rev_list(&self, base: &str, reverse: bool) -> Result<Vec<String>, GitError> {
        let range = format!("{base}..HEAD");
        let out = if reverse {
            self.run_checked(&["rev-list", "--reverse", &range])?
        } else {
            self.run_checked(&["rev-list", &range])?
        };
        Ok(lines_of(&out.stdout))
    }

    /// Files touched by a commit.
    pub fn changed_files(&self, rev: &str) -> Result<Vec<String>, GitError> {
        let out = self.run_checked(&["diff-tree", "--no-commit-id", "--name-only", "-r", rev])?;
        Ok(lines_of(&out.stdout))
    }

    pub fn branch_force(&self, name: &str, rev: &str) -> Result<(), GitError> {
        self.run_locked_checked(&["branch", "-f", name, rev]).map(|_| ())
    }

    /// Force-delete a local branch. Missing branches are a no-op.
    pub fn branch_delete(&self, name: &str) -> Result<(), GitError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let out = self.run(&["branch", "-D", name])?;
        if !out.success() && !out.stderr.contains("not found") {
            return Err(GitError::Exit {
                command: format!("branch -D {name}"),
                code: out.code,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    pub fn tag_annotated(&self, name: &str, message: &str, rev: &str) -> Result<(), GitError> {
        self.run_locked_checked(&["tag", "-a", name, "-m", message, rev])
            .map(|_| ())
    }

    // -- worktrees ---------------------------------------------------------

    /// `worktree add [-B <branch>] <path> <ref>`.
    pub fn worktree_add(
        &self,
        path: &Path,
        branch: Option<&str>,
        start: &str,
    ) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        let mut args: Vec<&str> = vec!["worktree", "add"];
        if let Some(branch) = branch {
            args.push("-B");
            args.push(branch);
        }
        args.push(&path_str);
        args.push(start);
        self.run_locked_checked(&args).map(|_| ())
    }

    /// Forced removal; unregistered paths are cleaned up and locked trees
    /// are unlocked first, so removal is effectively unconditional.
    pub fn worktree_remove(&self, path: &Path) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut out = self.run(&["worktree", "remove", "--force", &path_str])?;
        if !out.success() && out.stderr.contains("locked working tree") {
            let _ = self.run(&["worktree", "unlock", &path_str]);
            out = self.run(&["worktree", "remove", "--force", &path_str])?;
        }
        if !out.success() {
            if out.stderr.contains("is not a working tree") {
                if path.exists() {
                    let _ = std::fs::remove_dir_all(path);
                }
                return Ok(());
            }
            return Err(GitError::Exit {
                command: "worktree remove".to_string(),
                code: out.code,
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    /// Mark a worktree as locked, recording the owner.
    pub fn worktree_lock(&self, path: &Path, reason: &str) -> Result<(), GitError> {
        let path_str = path.to_string_lossy().into_owned();
        self.run_locked_checked(&["worktree", "lock", "--reason", reason, &path_str])
            .map(|_| ())
    }

    pub fn worktree_prune(&self) -> Result<(), GitError> {
        self.run_locked_checked(&["worktree", "prune"]).map(|_| ())
    }

    // -- cherry-pick -------------------------------------------------------

    /// Apply a commit onto the current head, classifying the outcome.
    pub fn cherry_pick(&self, rev: &str) -> Result<CherryPick, GitError> {
        let out = self.run_locked(&["cherry-pick", rev])?;
        if out.success() {
            return Ok(CherryPick::Applied);
        }
        let combined = out.combined_lower();
        if EMPTY_PICK_MARKERS.iter().any(|m| combined.contains(m)) {
            return Ok(CherryPick::Empty);
        }
        if combined.contains("conflict") || !self.conflicted_files()?.is_empty() {
            return Ok(CherryPick::Conflict);
        }
        Err(GitError::Exit {
            command: format!("cherry-pick {rev}"),
            code: out.code,
            stderr: out.stderr,
        })
    }

    pub fn cherry_pick_skip(&self) -> Result<(), GitError> {
        self.run_locked_checked(&["cherry-pick", "--skip"]).map(|_| ())
    }

    pub fn cherry_pick_abort(&self) -> Result<(), GitError> {
        self.run_locked_checked(&["cherry-pick", "--abort"]).map(|_| ())
    }

    /// `cherry-pick --continue`. Returns `false` when git refuses (e.g.
    /// conflicts remain).
    pub fn cherry_pick_continue(&self) -> Result<bool, GitError> {
        let out = self.run_locked(&["cherry-pick", "--continue"])?;
        Ok(out.success())
    }

    /// Conflicted paths (`diff --name-only --diff-filter=U`).
    pub fn conflicted_files(&self) -> Result<Vec<String>, GitError> {
        let out = self.run_checked(&["diff", "--name-only", "--diff-filter=U"])?;
        Ok(lines_of(&out.stdout))
    }

    pub fn checkout_ours(&self, path: &str) -> Result<(), GitError> {
        self.run_locked_checked(&["checkout", "--ours", path]).map(|_| ())
    }

    pub fn checkout_theirs(&self, path: &str) -> Result<(), GitError> {
        self.run_locked_checked(&["checkout", "--theirs", path])
            .map(|_| ())
    }

    /// `mergetool --no-prompt <file>`. Success means the tool resolved the
    /// file; any failure (including no tool configured) reports `false`.
    pub fn mergetool(&self, path: &str) -> Result<bool, GitError> {
        let out = self.run_locked(&["mergetool", "--no-prompt", path])?;
        Ok(out.success())
    }

    pub fn add_path(&self, path: &str) -> Result<(), GitError> {
        self.run_locked_checked(&["add", "--", path]).map(|_| ())
    }

    // -- mainline ----------------------------------------------------------

    /// `merge --ff-only <commit>`. `Ok(false)` when a fast-forward is not
    /// possible.
    pub fn merge_ff_only(&self, rev: &str) -> Result<bool, GitError> {
        let out = self.run_locked(&["merge", "--ff-only", rev])?;
        Ok(out.success())
    }

    pub fn update_ref(&self, branch: &str, rev: &str) -> Result<(), GitError> {
        let refname = format!("refs/heads/{branch}");
        self.run_locked_checked(&["update-ref", &refname, rev])
            .map(|_| ())
    }

    pub fn reset_hard(&self, rev: &str) -> Result<(), GitError> {
        self.run_locked_checked(&["reset", "--hard", rev]).map(|_| ())
    }

    pub fn clean_fdx(&self) -> Result<(), GitError> {
        self.run_locked_checked(&["clean", "-fdx"]).map(|_| ())
    }

    /// Whether `ancestor` is reachable from `descendant`.
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool, GitError> {
        let out = self.run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        Ok(out.success())
    }

    // -- stash -------------------------------------------------------------

    /// `stash push -u -m <msg>`. Returns the stash ref, or `None` when
    /// there was nothing to stash.
    pub fn stash_push(&self, message: &str) -> Result<Option<String>, GitError> {
        let out = self.run_locked(&["stash", "push", "-u", "-m", message])?;
        if !out.success() {
            return Err(GitError::Exit {
                command: "stash push".to_string(),
                code: out.code,
                stderr: out.stderr,
            });
        }
        if out.stdout.contains("No local changes") {
            return Ok(None);
        }
        let list = self.run_checked(&["stash", "list", "-n", "1", "--format=%gd"])?;
        let reference = list.stdout.trim().to_string();
        Ok((!reference.is_empty()).then_some(reference))
    }

    /// `stash apply <ref>`. `Ok(false)` signals apply conflicts.
    pub fn stash_apply(&self, reference: &str) -> Result<bool, GitError> {
        let out = self.run_locked(&["stash", "apply", reference])?;
        Ok(out.success())
    }

    pub fn stash_drop(&self, reference: &str) -> Result<(), GitError> {
        self.run_locked_checked(&["stash", "drop", reference]).map(|_| ())
    }

    pub fn revert_no_edit(&self, rev: &str) -> Result<(), GitError> {
        self.run_locked_checked(&["revert", "--no-edit", rev]).map(|_| ())
    }

    /// Set the local committer identity (worktrees do not always inherit
    /// one).
    pub fn config_user(&self, name: &str, email: &str) -> Result<(), GitError> {
        self.run_checked(&["config", "user.name", name])?;
        self.run_checked(&["config", "user.email", email])?;
        Ok(())
    }

    /// Read a config value, `None` when unset.
    pub fn config_get(&self, key: &str) -> Result<Option<String>, GitError> {
        let out = self.run(&["config", "--get", key])?;
        if !out.success() {
            return Ok(None);
        }
        let value = out.stdout.trim().to_string();
        Ok((!value.is_empty()).then_some(value))
    }
}

// ---------------------------------------------------------------------------
// Parsers
// ---------------------------------------------------------------------------

fn lines_of(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `status --porcelain` output into entries.
fn parse_status_porcelain(stdout: &str) -> Vec<StatusEntry> {
    stdout
        .lines()
        .filter(|line| line.len() > 3)
        .map(|line| {
            let code = line[..2].to_string();
            let rest = line[3..].trim();
            // Renames are shown as "old -> new"; keep the new path.
            let path = rest
                .rsplit_once(" -> ")
                .map_or(rest, |(_, new)| new)
                .to_string();
            StatusEntry { code, path }
        })
        .collect()
}

/// Parse the null-delimited twelve-field `log -1` projection.
fn parse_commit_fields(stdout: &str) -> Result<CommitMetadata, GitError> {
    let trimmed = stdout.strip_suffix('\n').unwrap_or(stdout);
    let fields: Vec<&str> = trimmed.split('\0').collect();
    if fields.len() != 12 {
        return Err(GitError::Parse(format!(
            "expected 12 null-delimited commit fields, got {}",
            fields.len()
        )));
    }
    Ok(CommitMetadata {
        hash: fields[0].to_string(),
        short_hash: fields[1].to_string(),
        subject: fields[2].to_string(),
        body: fields[3].trim_end().to_string(),
        author: Signature {
            name: fields[4].to_string(),
            email: fields[5].to_string(),
            date: fields[6].to_string(),
        },
        committer: Signature {
            name: fields[7].to_string(),
            email: fields[8].to_string(),
            date: fields[9].to_string(),
        },
        parents: fields[10]
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        tree: fields[11].trim().to_string(),
        files_changed: 0,
        insertions: 0,
        deletions: 0,
        file_names: Vec::new(),
    })
}

/// Parse the trailing summary line of `diff-tree --stat`:
/// ` 2 files changed, 3 insertions(+), 1 deletion(-)`.
fn parse_stat_summary(stdout: &str) -> (usize, usize, usize) {
    let Some(line) = stdout
        .lines()
        .rev()
        .find(|l| l.contains("changed"))
    else {
        return (0, 0, 0);
    };

    let mut files = 0;
    let mut insertions = 0;
    let mut deletions = 0;
    for part in line.split(',') {
        let part = part.trim();
        let Some(n) = part
            .split_whitespace()
            .next()
            .and_then(|w| w.parse::<usize>().ok())
        else {
            continue;
        };
        if part.contains("file") {
            files = n;
        } else if part.contains("insertion") {
            insertions = n;
        } else if part.contains("deletion") {
            deletions = n;
        }
    }
    (files, insertions, deletions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Create a temporary git repository with an initial commit.
    fn create_temp_repo() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("failed to create temp dir");
        let repo_path = dir.path().to_path_buf();

        let run = |args: &[&str]| {
            let output = Command::new("git")
                .args(args)
                .current_dir(&repo_path)
                .output()
                .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
            assert!(
                output.status.success(),
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr)
            );
        };

        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@ralph.dev"]);
        run(&["config", "user.name", "Ralph Test"]);
        std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        (dir, repo_path)
    }

    fn write_and_commit(git: &GitDriver, file: &str, content: &str, subject: &str) {
        std::fs::write(git.workdir().join(file), content).unwrap();
        git.add_all().unwrap();
        git.commit(subject, None).unwrap();
    }

    #[test]
    fn open_rejects_non_repo() {
        let dir = TempDir::new().unwrap();
        let result = GitDriver::open(dir.path());
        assert!(matches!(result, Err(GitError::NotAGitRepo(_))));
    }

    #[test]
    fn status_and_staging_round_trip() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        assert!(!git.is_dirty().unwrap());

        std::fs::write(repo.join("a.txt"), "a\n").unwrap();
        std::fs::write(repo.join("b.txt"), "b\n").unwrap();
        let entries = git.status_porcelain().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.code == "??"));
        assert!(entries.iter().all(|e| !e.is_staged()));

        git.add_all().unwrap();
        let staged = git.staged_files().unwrap();
        assert_eq!(staged, vec!["a.txt".to_string(), "b.txt".to_string()]);

        git.unstage(&["b.txt".to_string()]).unwrap();
        assert_eq!(git.staged_files().unwrap(), vec!["a.txt".to_string()]);
    }

    #[test]
    fn commit_with_trailer_lands_in_message() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();

        std::fs::write(repo.join("x.txt"), "x\n").unwrap();
        git.add_all().unwrap();
        git.commit("T1: add x", Some("Ralph-Task: T1")).unwrap();

        let message = git.commit_message("HEAD").unwrap();
        assert!(message.starts_with("T1: add x"));
        assert!(message.contains("Ralph-Task: T1"));
    }

    #[test]
    fn commit_metadata_projection() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        write_and_commit(&git, "meta.txt", "one\ntwo\n", "T2: metadata test");

        let meta = git.commit_metadata("HEAD").unwrap();
        assert_eq!(meta.subject, "T2: metadata test");
        assert_eq!(meta.author.name, "Ralph Test");
        assert_eq!(meta.author.email, "test@ralph.dev");
        assert_eq!(meta.parents.len(), 1);
        assert_eq!(meta.short_hash, meta.hash[..meta.short_hash.len()]);
        assert_eq!(meta.file_names, vec!["meta.txt".to_string()]);
        assert_eq!(meta.files_changed, 1);
        assert_eq!(meta.insertions, 2);
        assert_eq!(meta.deletions, 0);
        assert!(!meta.tree.is_empty());
    }

    #[test]
    fn rev_list_reverse_is_ancestor_first() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        let base = git.rev_parse("HEAD").unwrap();

        write_and_commit(&git, "1.txt", "1\n", "first");
        let first = git.rev_parse("HEAD").unwrap();
        write_and_commit(&git, "2.txt", "2\n", "second");
        let second = git.rev_parse("HEAD").unwrap();

        let commits = git.rev_list(&base, true).unwrap();
        assert_eq!(commits, vec![first, second]);
    }

    #[test]
    fn cherry_pick_applies_and_detects_conflict() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        let base = git.rev_parse("HEAD").unwrap();

        // Commit on a side branch.
        git.run_checked(&["checkout", "-b", "side"]).unwrap();
        write_and_commit(&git, "shared.txt", "side version\n", "side change");
        let side_commit = git.rev_parse("HEAD").unwrap();

        // Clean apply onto main.
        git.run_checked(&["checkout", "main"]).unwrap();
        assert_eq!(git.cherry_pick(&side_commit).unwrap(), CherryPick::Applied);

        // Build a conflicting commit on another branch from base.
        git.run_checked(&["checkout", "-b", "other", &base]).unwrap();
        write_and_commit(&git, "shared.txt", "other version\n", "other change");
        let other_commit = git.rev_parse("HEAD").unwrap();

        git.run_checked(&["checkout", "main"]).unwrap();
        assert_eq!(git.cherry_pick(&other_commit).unwrap(), CherryPick::Conflict);
        assert_eq!(git.conflicted_files().unwrap(), vec!["shared.txt".to_string()]);
        git.cherry_pick_abort().unwrap();
        assert!(!git.is_dirty().unwrap());
    }

    #[test]
    fn cherry_pick_empty_is_classified() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();

        write_and_commit(&git, "same.txt", "same\n", "change");
        let commit = git.rev_parse("HEAD").unwrap();

        // Picking a commit already contained in HEAD is empty.
        assert_eq!(git.cherry_pick(&commit).unwrap(), CherryPick::Empty);
        git.cherry_pick_skip().unwrap();
        assert!(!git.is_dirty().unwrap());
    }

    #[test]
    fn merge_ff_only_and_update_ref() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();

        git.run_checked(&["checkout", "-b", "feature"]).unwrap();
        write_and_commit(&git, "f.txt", "f\n", "feature work");
        let feature_head = git.rev_parse("HEAD").unwrap();

        git.run_checked(&["checkout", "main"]).unwrap();
        assert!(git.merge_ff_only(&feature_head).unwrap());
        assert_eq!(git.rev_parse("HEAD").unwrap(), feature_head);

        // Diverge, then ff must fail.
        git.run_checked(&["checkout", "-b", "diverged", "HEAD~1"]).unwrap();
        write_and_commit(&git, "g.txt", "g\n", "divergent work");
        let diverged_head = git.rev_parse("HEAD").unwrap();
        git.run_checked(&["checkout", "main"]).unwrap();
        write_and_commit(&git, "h.txt", "h\n", "main work");
        assert!(!git.merge_ff_only(&diverged_head).unwrap());

        // update-ref moves a non-checked-out branch.
        git.update_ref("diverged", &feature_head).unwrap();
        assert_eq!(git.rev_parse("diverged").unwrap(), feature_head);
        assert!(git.is_ancestor(&feature_head, "main").unwrap());
    }

    #[test]
    fn stash_round_trip() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();

        assert!(git.stash_push("nothing to save").unwrap().is_none());

        std::fs::write(repo.join("wip.txt"), "wip\n").unwrap();
        let reference = git.stash_push("coordinator sync").unwrap().unwrap();
        assert!(reference.starts_with("stash@{"));
        assert!(!git.is_dirty().unwrap());

        assert!(git.stash_apply(&reference).unwrap());
        assert!(git.is_dirty().unwrap());
        git.stash_drop(&reference).unwrap();
    }

    #[test]
    fn worktree_add_remove_prune() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        let wt_path = repo.join("wt-a");

        git.worktree_add(&wt_path, Some("ralph/worker-a"), "main").unwrap();
        assert!(wt_path.join("README.md").exists());
        assert!(git.branch_exists("ralph/worker-a").unwrap());

        git.worktree_remove(&wt_path).unwrap();
        assert!(!wt_path.exists());
        // Removing again is a no-op.
        git.worktree_remove(&wt_path).unwrap();
        git.worktree_prune().unwrap();
    }

    #[test]
    fn revert_no_edit_creates_inverse_commit() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        write_and_commit(&git, "r.txt", "will vanish\n", "add r");
        let commit = git.rev_parse("HEAD").unwrap();

        git.revert_no_edit(&commit).unwrap();
        assert!(!repo.join("r.txt").exists());
        let message = git.commit_message("HEAD").unwrap();
        assert!(message.starts_with("Revert"));
    }

    #[test]
    fn tag_annotated_is_created() {
        let (_dir, repo) = create_temp_repo();
        let git = GitDriver::open(&repo).unwrap();
        let head = git.rev_parse("HEAD").unwrap();

        git.tag_annotated("parallel-snapshot-main-2026-01-01T00-00-00Z", "anchor", &head)
            .unwrap();
        let out = git.run_checked(&["tag", "-l"]).unwrap();
        assert!(out.stdout.contains("parallel-snapshot-main"));
    }

    // -- pure parser tests -------------------------------------------------

    #[test]
    fn parse_status_handles_rename_and_codes() {
        let entries = parse_status_porcelain(
            " M src/lib.rs\n?? new.txt\nR  old.txt -> new_name.txt\nA  added.rs\n",
        );
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].code, " M");
        assert!(!entries[0].is_staged());
        assert_eq!(entries[1].path, "new.txt");
        assert_eq!(entries[2].path, "new_name.txt");
        assert!(entries[2].is_staged());
        assert!(entries[3].is_staged());
    }

    #[test]
    fn parse_commit_fields_round_trip() {
        let raw = "abc123\0abc\0subject line\0body first\nbody second\0Alice\0a@x.dev\0\
                   2026-01-01T00:00:00+00:00\0Bob\0b@x.dev\02026-01-02T00:00:00+00:00\0\
                   p1 p2\0tree123\n";
        let meta = parse_commit_fields(raw).unwrap();
        assert_eq!(meta.hash, "abc123");
        assert_eq!(meta.subject, "subject line");
        assert_eq!(meta.body, "body first\nbody second");
        assert_eq!(meta.author.name, "Alice");
        assert_eq!(meta.committer.email, "b@x.dev");
        assert_eq!(meta.parents, vec!["p1".to_string(), "p2".to_string()]);
        assert_eq!(meta.tree, "tree123");
        assert_eq!(meta.message(), "subject line\n\nbody first\nbody second");
    }

    #[test]
    fn parse_commit_fields_rejects_wrong_arity() {
        assert!(parse_commit_fields("just\0three\0fields").is_err());
    }

    #[test]
    fn parse_stat_summary_variants() {
        assert_eq!(
            parse_stat_summary(" x | 1 +\n 2 files changed, 3 insertions(+), 1 deletion(-)\n"),
            (2, 3, 1)
        );
        assert_eq!(
            parse_stat_summary(" 1 file changed, 1 insertion(+)\n"),
            (1, 1, 0)
        );
        assert_eq!(parse_stat_summary(""), (0, 0, 0));
    }
}
