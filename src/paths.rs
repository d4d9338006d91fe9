//! Path and branch naming conventions.
//!
//! Every worktree path, branch name, and state-directory location is a pure
//! function of the workspace root and the `(workerName, taskId)` pair. Nothing
//! outside this module builds these strings by hand.

use std::path::{Path, PathBuf};

/// Prefix for all worker branches: `ralph/<workerName>/<taskId>`.
pub const BRANCH_PREFIX: &str = "ralph/";

/// Directory name (under the workspace root) for persistent state.
pub const STATE_DIR: &str = ".ralph";

/// Base directory that holds all worker worktrees for a repository.
///
/// A sibling of the repo: `/path/to/repo` → `/path/to/repo-worktrees`.
pub fn worktree_base(repo: &Path) -> PathBuf {
    let name = repo
        .file_name()
        .map_or_else(|| "repo".into(), |n| n.to_string_lossy().into_owned());
    repo.with_file_name(format!("{name}-worktrees"))
}

/// Worktree path for a `(workerName, taskId)` pair:
/// `<repo>-worktrees/<workerName>/<taskId>`.
pub fn worktree_path(repo: &Path, worker_name: &str, task_id: &str) -> PathBuf {
    worktree_base(repo).join(worker_name).join(task_id)
}

/// Branch name for a `(workerName, taskId)` pair: `ralph/<workerName>/<taskId>`.
pub fn branch_name(worker_name: &str, task_id: &str) -> String {
    format!("{BRANCH_PREFIX}{worker_name}/{task_id}")
}

/// Parse a worker branch back into its `(workerName, taskId)` pair.
///
/// Returns `None` for branches that don't follow the `ralph/<name>/<task>`
/// convention.
pub fn parse_branch(branch: &str) -> Option<(&str, &str)> {
    let rest = branch.strip_prefix(BRANCH_PREFIX)?;
    let (worker, task) = rest.split_once('/')?;
    if worker.is_empty() || task.is_empty() || task.contains('/') {
        return None;
    }
    Some((worker, task))
}

/// Persistent state root: `<workspace>/.ralph/`.
pub fn state_dir(workspace: &Path) -> PathBuf {
    workspace.join(STATE_DIR)
}

/// Session store directory: `<workspace>/.ralph/sessions.db/`.
pub fn sessions_db_dir(workspace: &Path) -> PathBuf {
    state_dir(workspace).join("sessions.db")
}

/// Per-instance latest-session snapshot: `<workspace>/.ralph/sessions/<instanceId>.json`.
pub fn session_snapshot_path(workspace: &Path, instance_id: &str) -> PathBuf {
    state_dir(workspace)
        .join("sessions")
        .join(format!("{instance_id}.json"))
}

/// Project configuration file: `<workspace>/.ralph/config.toml`.
pub fn config_path(workspace: &Path) -> PathBuf {
    state_dir(workspace).join("config.toml")
}
