//! Git worktree lifecycle for worker checkouts.
//!
//! Each worker gets an additional working directory at
//! `<repo>-worktrees/<workerName>/<taskId>` on branch
//! `ralph/<workerName>/<taskId>`. Operations against the main checkout are
//! serialised on one lock (git is not reentrant on a single working tree);
//! work inside a worker's own checkout is independent.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::paths;

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("not a git repository")]
    NotAGitRepo,
    #[error("merge conflict in: {0:?}")]
    MergeConflict(Vec<String>),
    #[error("branch has no commits beyond the base")]
    NoCommits,
    #[error("transient git failure: {0}")]
    Transient(String),
    #[error("git command failed: {0}")]
    CommandFailed(String),
}

/// A worker's checkout, uniquely identified by `(workerName, taskId)`.
/// Path and branch are deterministic functions of the pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worktree {
    pub worker_name: String,
    pub task_id: String,
    pub path: PathBuf,
    pub branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub had_conflicts: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupOutcome {
    pub success: bool,
    pub had_conflicts: bool,
    pub removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validation {
    pub directory_exists: bool,
    pub git_registered: bool,
    pub branch_exists: bool,
    pub is_valid: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostIterationMerge {
    pub success: bool,
    pub merge: MergeOutcome,
    /// Whether the follow-up rebase succeeded; `None` when it was not
    /// attempted (merge conflict).
    pub rebase: Option<bool>,
    pub message: String,
}

/// Lifecycle controller for all worker worktrees of one repository.
pub struct WorktreeManager {
    repo: PathBuf,
    main_lock: Mutex<()>,
}

impl WorktreeManager {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self {
            repo: repo.into(),
            main_lock: Mutex::new(()),
        }
    }

    pub fn repo(&self) -> &Path {
        &self.repo
    }

    fn lock_main(&self) -> MutexGuard<'_, ()> {
        self.main_lock.lock()
    }

    /// Resolve the repository's default (main) branch.
    pub fn default_branch(&self) -> Result<String, GitError> {
        let output = git(&self.repo, &["worktree", "list", "--porcelain"])?;
        for line in output.lines() {
            if let Some(branch) = line.strip_prefix("branch refs/heads/") {
                return Ok(branch.to_string());
            }
            if line.is_empty() {
                break;
            }
        }
        Err(GitError::CommandFailed(
            "could not determine the default branch".into(),
        ))
    }

    /// Create the worktree and branch for `(workerName, taskId)`.
    ///
    /// Pulls the latest default branch if a remote exists (best-effort),
    /// ensures the worker directory exists, then runs
    /// `git worktree add -b <branch> <path> <base>`.
    pub fn create(
        &self,
        worker_name: &str,
        task_id: &str,
        base_branch: Option<&str>,
    ) -> Result<Worktree, GitError> {
        let _guard = self.lock_main();

        if !git_ok(&self.repo, &["rev-parse", "--git-dir"])? {
            return Err(GitError::NotAGitRepo);
        }

        // Offline operation proceeds on the local base.
        if let Ok(remotes) = git(&self.repo, &["remote"])
            && !remotes.trim().is_empty()
        {
            let _ = git(&self.repo, &["pull", "--ff-only"]);
        }

        let base = match base_branch {
            Some(b) => b.to_string(),
            None => self.default_branch()?,
        };

        let path = paths::worktree_path(&self.repo, worker_name, task_id);
        let branch = paths::branch_name(worker_name, task_id);

        let parent = paths::worktree_base(&self.repo).join(worker_name);
        std::fs::create_dir_all(&parent)
            .map_err(|e| GitError::CommandFailed(format!("failed to create {}: {e}", parent.display())))?;

        let path_str = path_str(&path)?;
        git(
            &self.repo,
            &["worktree", "add", "-b", &branch, path_str, &base],
        )?;

        rsync_ignored(&self.repo, &path);

        Ok(Worktree {
            worker_name: worker_name.to_string(),
            task_id: task_id.to_string(),
            path,
            branch,
        })
    }

    pub fn exists(&self, worker_name: &str, task_id: &str) -> Result<bool, GitError> {
        let branch = paths::branch_name(worker_name, task_id);
        Ok(self.list(None)?.iter().any(|w| w.branch == branch))
    }

    /// List worker worktrees, optionally filtered to one worker.
    ///
    /// Iterates `git worktree list --porcelain` and keeps entries whose
    /// branch follows the `ralph/<name>/<task>` convention.
    pub fn list(&self, worker_name: Option<&str>) -> Result<Vec<Worktree>, GitError> {
        let output = git(&self.repo, &["worktree", "list", "--porcelain"])?;

        let mut worktrees = Vec::new();
        let mut current_path: Option<PathBuf> = None;
        let mut current_branch: Option<String> = None;

        let mut flush = |path: Option<PathBuf>, branch: Option<String>| {
            let (Some(path), Some(branch)) = (path, branch) else {
                return;
            };
            let Some((worker, task)) = paths::parse_branch(&branch) else {
                return;
            };
            if worker_name.is_some_and(|w| w != worker) {
                return;
            }
            worktrees.push(Worktree {
                worker_name: worker.to_string(),
                task_id: task.to_string(),
                path,
                branch: branch.clone(),
            });
        };

        for line in output.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                current_path = Some(PathBuf::from(p));
            } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
                current_branch = Some(b.to_string());
            } else if line.is_empty() {
                flush(current_path.take(), current_branch.take());
            }
        }
        flush(current_path, current_branch);

        Ok(worktrees)
    }

    /// Remove the worktree and (by default) its branch. Idempotent: missing
    /// worktrees succeed.
    pub fn remove(
        &self,
        worker_name: &str,
        task_id: &str,
        delete_branch: bool,
    ) -> Result<(), GitError> {
        let _guard = self.lock_main();

        let path = paths::worktree_path(&self.repo, worker_name, task_id);
        let branch = paths::branch_name(worker_name, task_id);

        if let Ok(path_str) = path_str(&path) {
            let _ = git(&self.repo, &["worktree", "remove", "--force", path_str]);
        }
        let _ = git(&self.repo, &["worktree", "prune"]);
        if delete_branch {
            let _ = git(&self.repo, &["branch", "-D", &branch]);
        }

        // Leftover directories (never-registered or partially removed)
        if path.exists() {
            let _ = std::fs::remove_dir_all(&path);
        }

        Ok(())
    }

    /// Merge the worker branch into the default branch with `--no-ff`.
    ///
    /// On conflict the repository is left in the merging state; resolving is
    /// explicit via [`Self::abort_merge`] or [`Self::complete_merge`].
    pub fn merge(&self, worker_name: &str, task_id: &str) -> Result<MergeOutcome, GitError> {
        let _guard = self.lock_main();
        self.merge_locked(worker_name, task_id)
    }

    fn merge_locked(&self, worker_name: &str, task_id: &str) -> Result<MergeOutcome, GitError> {
        let branch = paths::branch_name(worker_name, task_id);
        if !branch_exists(&self.repo, &branch)? {
            return Err(GitError::NoCommits);
        }

        let default = self.default_branch()?;
        git(&self.repo, &["checkout", &default])?;

        let merge = Command::new("git")
            .arg("-C")
            .arg(&self.repo)
            .args(["merge", "--no-ff", "--no-edit", &branch])
            .output()
            .map_err(|e| GitError::Transient(format!("failed to run git: {e}")))?;

        if merge.status.success() {
            return Ok(MergeOutcome {
                success: true,
                had_conflicts: false,
            });
        }

        let conflicts = self.conflicting_files_locked()?;
        if conflicts.is_empty() {
            let stderr = String::from_utf8_lossy(&merge.stderr);
            return Err(GitError::CommandFailed(format!(
                "merge failed: {}",
                stderr.trim()
            )));
        }

        Ok(MergeOutcome {
            success: false,
            had_conflicts: true,
        })
    }

    /// Replay the worker branch onto the default branch, inside the worker's
    /// own checkout. On conflict the rebase is aborted and
    /// [`GitError::MergeConflict`] lists the conflicting files.
    pub fn rebase(&self, worker_name: &str, task_id: &str) -> Result<(), GitError> {
        let path = paths::worktree_path(&self.repo, worker_name, task_id);
        let default = self.default_branch()?;

        let rebase = Command::new("git")
            .arg("-C")
            .arg(&path)
            .args(["rebase", &default])
            .output()
            .map_err(|e| GitError::Transient(format!("failed to run git: {e}")))?;

        if rebase.status.success() {
            return Ok(());
        }

        let conflicts = git(&path, &["diff", "--name-only", "--diff-filter=U"])
            .map(|out| {
                out.lines()
                    .filter(|l| !l.is_empty())
                    .map(String::from)
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();
        let _ = git(&path, &["rebase", "--abort"]);

        if conflicts.is_empty() {
            let stderr = String::from_utf8_lossy(&rebase.stderr);
            return Err(GitError::CommandFailed(format!(
                "rebase failed: {}",
                stderr.trim()
            )));
        }
        Err(GitError::MergeConflict(conflicts))
    }

    /// Abort an in-progress merge on the default branch.
    pub fn abort_merge(&self) -> Result<(), GitError> {
        let _guard = self.lock_main();
        git(&self.repo, &["merge", "--abort"])?;
        Ok(())
    }

    /// Commit a resolved merge for `(workerName, taskId)`.
    pub fn complete_merge(&self, _worker_name: &str, _task_id: &str) -> Result<(), GitError> {
        let _guard = self.lock_main();
        if !merge_head_exists(&self.repo)? {
            return Err(GitError::CommandFailed("no merge in progress".into()));
        }
        git(&self.repo, &["commit", "--no-edit"])?;
        Ok(())
    }

    pub fn is_merge_in_progress(&self) -> Result<bool, GitError> {
        merge_head_exists(&self.repo)
    }

    pub fn conflicting_files(&self) -> Result<Vec<String>, GitError> {
        let _guard = self.lock_main();
        self.conflicting_files_locked()
    }

    fn conflicting_files_locked(&self) -> Result<Vec<String>, GitError> {
        let output = git(&self.repo, &["diff", "--name-only", "--diff-filter=U"])?;
        Ok(output
            .lines()
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    /// Commit-aware teardown: branches with no commits beyond the base are
    /// removed without merging; branches with work are merged first and
    /// removed only on success. On conflict both worktree and branch stay.
    pub fn cleanup(&self, worker_name: &str, task_id: &str) -> Result<CleanupOutcome, GitError> {
        let branch = paths::branch_name(worker_name, task_id);

        if !branch_exists(&self.repo, &branch)? {
            self.remove(worker_name, task_id, true)?;
            return Ok(CleanupOutcome {
                success: true,
                had_conflicts: false,
                removed: false,
            });
        }

        if !self.has_commits(&branch)? {
            self.remove(worker_name, task_id, true)?;
            return Ok(CleanupOutcome {
                success: true,
                had_conflicts: false,
                removed: true,
            });
        }

        let merge = self.merge(worker_name, task_id)?;
        if merge.had_conflicts {
            return Ok(CleanupOutcome {
                success: false,
                had_conflicts: true,
                removed: false,
            });
        }

        self.remove(worker_name, task_id, true)?;
        Ok(CleanupOutcome {
            success: true,
            had_conflicts: false,
            removed: true,
        })
    }

    /// Check directory, git registration, and branch for a worktree.
    pub fn validate(&self, worker_name: &str, task_id: &str) -> Result<Validation, GitError> {
        let path = paths::worktree_path(&self.repo, worker_name, task_id);
        let branch = paths::branch_name(worker_name, task_id);

        let directory_exists = path.is_dir();
        let git_registered = self.exists(worker_name, task_id)?;
        let branch_exists = branch_exists(&self.repo, &branch)?;
        let is_valid = directory_exists && git_registered && branch_exists;

        let message = if is_valid {
            "worktree is valid".to_string()
        } else {
            let mut missing = Vec::new();
            if !directory_exists {
                missing.push("directory");
            }
            if !git_registered {
                missing.push("git registration");
            }
            if !branch_exists {
                missing.push("branch");
            }
            format!("missing: {}", missing.join(", "))
        };

        Ok(Validation {
            directory_exists,
            git_registered,
            branch_exists,
            is_valid,
            message,
        })
    }

    /// Reconstruct a broken worktree, reusing the branch if it still exists.
    /// Fails if the worktree is already valid.
    pub fn recreate(&self, worker_name: &str, task_id: &str) -> Result<Worktree, GitError> {
        let validation = self.validate(worker_name, task_id)?;
        if validation.is_valid {
            return Err(GitError::CommandFailed(
                "worktree is already valid; nothing to recreate".into(),
            ));
        }

        let _guard = self.lock_main();

        let path = paths::worktree_path(&self.repo, worker_name, task_id);
        let branch = paths::branch_name(worker_name, task_id);

        // Drop stale registrations and leftover directories first
        let _ = git(&self.repo, &["worktree", "prune"]);
        if path.exists() {
            std::fs::remove_dir_all(&path).map_err(|e| {
                GitError::CommandFailed(format!("failed to clear {}: {e}", path.display()))
            })?;
        }

        let parent = paths::worktree_base(&self.repo).join(worker_name);
        std::fs::create_dir_all(&parent)
            .map_err(|e| GitError::CommandFailed(format!("failed to create {}: {e}", parent.display())))?;

        let path_str = path_str(&path)?;
        if validation.branch_exists {
            git(&self.repo, &["worktree", "add", path_str, &branch])?;
        } else {
            let default = self.default_branch()?;
            git(
                &self.repo,
                &["worktree", "add", "-b", &branch, path_str, &default],
            )?;
        }

        Ok(Worktree {
            worker_name: worker_name.to_string(),
            task_id: task_id.to_string(),
            path,
            branch,
        })
    }

    /// Merge the branch to the default branch, then rebase the worktree onto
    /// the new default so the next iteration starts current. On merge
    /// conflict the rebase is not attempted.
    pub fn post_iteration_merge(
        &self,
        worker_name: &str,
        task_id: &str,
    ) -> Result<PostIterationMerge, GitError> {
        let merge = self.merge(worker_name, task_id)?;

        if merge.had_conflicts {
            return Ok(PostIterationMerge {
                success: false,
                merge,
                rebase: None,
                message: format!(
                    "merge of {} hit conflicts; resolve then completeMerge, or abortMerge",
                    paths::branch_name(worker_name, task_id)
                ),
            });
        }

        let (rebase, message) = match self.rebase(worker_name, task_id) {
            Ok(()) => (Some(true), "merged and rebased".to_string()),
            Err(GitError::MergeConflict(files)) => (
                Some(false),
                format!("merged; rebase conflicted and was aborted: {files:?}"),
            ),
            Err(e) => (Some(false), format!("merged; rebase failed: {e}")),
        };

        Ok(PostIterationMerge {
            success: true,
            merge,
            rebase,
            message,
        })
    }

    /// Whether the branch has any commits beyond the default branch.
    pub fn has_commits(&self, branch: &str) -> Result<bool, GitError> {
        let default = self.default_branch()?;
        let output = git(
            &self.repo,
            &["rev-list", "--count", &format!("{default}..{branch}")],
        )?;
        let count: u64 = output
            .trim()
            .parse()
            .map_err(|e| GitError::CommandFailed(format!("failed to parse rev-list count: {e}")))?;
        Ok(count > 0)
    }
}

// ── Internal helpers ────────────────────────────────────────────────────

fn path_str(path: &Path) -> Result<&str, GitError> {
    path.to_str()
        .ok_or_else(|| GitError::CommandFailed("path is not valid UTF-8".into()))
}

/// Run a git command in the given directory and return stdout.
fn git(dir: &Path, args: &[&str]) -> Result<String, GitError> {
    let output = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .map_err(|e| GitError::Transient(format!("failed to run git: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(GitError::CommandFailed(format!(
            "git {} failed: {}",
            args.join(" "),
            stderr.trim()
        )))
    }
}

/// Run a git command and return whether it exited successfully.
fn git_ok(dir: &Path, args: &[&str]) -> Result<bool, GitError> {
    let status = Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| GitError::Transient(format!("failed to run git: {e}")))?;
    Ok(status.success())
}

fn branch_exists(repo: &Path, branch: &str) -> Result<bool, GitError> {
    git_ok(
        repo,
        &[
            "show-ref",
            "--verify",
            "--quiet",
            &format!("refs/heads/{branch}"),
        ],
    )
}

fn merge_head_exists(repo: &Path) -> Result<bool, GitError> {
    let git_dir = git(repo, &["rev-parse", "--git-dir"])?;
    let git_dir = git_dir.trim();
    let dir = if Path::new(git_dir).is_absolute() {
        PathBuf::from(git_dir)
    } else {
        repo.join(git_dir)
    };
    Ok(dir.join("MERGE_HEAD").exists())
}

/// Copy gitignored files (build caches etc.) into a fresh worktree.
/// Best-effort: rsync warnings about vanished files are ignored.
fn rsync_ignored(main_path: &Path, worktree_path: &Path) {
    let Ok(ignored) = git(
        main_path,
        &[
            "ls-files",
            "--others",
            "--ignored",
            "--exclude-standard",
            "--directory",
        ],
    ) else {
        return;
    };

    if ignored.trim().is_empty() {
        return;
    }

    let Ok(mut child) = Command::new("rsync")
        .arg("-a")
        .arg("--files-from=-")
        .arg(format!("{}/", main_path.display()))
        .arg(format!("{}/", worktree_path.display()))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    else {
        return;
    };

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(ignored.as_bytes());
    }
    let _ = child.wait();
}
