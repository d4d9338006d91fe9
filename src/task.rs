//! Task store interface: the external issue tracker, consumed read-mostly.
//!
//! The orchestrator only reads readiness and writes claim/close transitions.
//! Failures are reported to the orchestrator and never abort it. The
//! production implementation shells out to the `bd` (beads) CLI with
//! `--json`, the same way git operations wrap the `git` binary.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum TaskStoreError {
    #[error("task store command failed: {0}")]
    CommandFailed(String),
    #[error("task store returned malformed output: {0}")]
    Malformed(String),
    #[error("task store call timed out")]
    Timeout,
    #[error("task store i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Deferred,
    Closed,
}

/// A task as observed from the external tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: u8,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub blocked_by: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
}

impl Task {
    /// Ready means open with no open blockers.
    pub fn is_ready(&self) -> bool {
        self.status == TaskStatus::Open && self.blocked_by.is_empty()
    }
}

/// Read/claim surface over the external tracker.
pub trait TaskStore: Send + Sync + 'static {
    fn ready_tasks_count(&self) -> impl Future<Output = Result<usize, TaskStoreError>> + Send;

    fn next_ready_task(
        &self,
        worker_name: &str,
    ) -> impl Future<Output = Result<Option<Task>, TaskStoreError>> + Send;

    fn claim_task(
        &self,
        task_id: &str,
        worker_name: &str,
    ) -> impl Future<Output = Result<(), TaskStoreError>> + Send;

    fn close_task(
        &self,
        task_id: &str,
        resolution: &str,
    ) -> impl Future<Output = Result<(), TaskStoreError>> + Send;
}

/// `bd` CLI-backed task store.
#[derive(Debug, Clone)]
pub struct BeadsTaskStore {
    workspace: PathBuf,
}

impl BeadsTaskStore {
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
        }
    }

    async fn bd(&self, args: &[&str]) -> Result<String, TaskStoreError> {
        let output = tokio::process::Command::new("bd")
            .args(args)
            .current_dir(&self.workspace)
            .stdin(Stdio::null())
            .output()
            .await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(TaskStoreError::CommandFailed(format!(
                "bd {} failed: {}",
                args.join(" "),
                stderr.trim()
            )))
        }
    }

    async fn ready_tasks(&self) -> Result<Vec<Task>, TaskStoreError> {
        let output = self.bd(&["ready", "--json"]).await?;
        parse_ready_list(&output)
    }
}

impl TaskStore for BeadsTaskStore {
    async fn ready_tasks_count(&self) -> Result<usize, TaskStoreError> {
        Ok(self.ready_tasks().await?.len())
    }

    async fn next_ready_task(&self, _worker_name: &str) -> Result<Option<Task>, TaskStoreError> {
        // `bd ready` already orders by priority; take the front.
        Ok(self.ready_tasks().await?.into_iter().next())
    }

    async fn claim_task(&self, task_id: &str, worker_name: &str) -> Result<(), TaskStoreError> {
        self.bd(&[
            "update",
            task_id,
            "--status",
            "in_progress",
            "--assignee",
            worker_name,
            "--json",
        ])
        .await?;
        Ok(())
    }

    async fn close_task(&self, task_id: &str, resolution: &str) -> Result<(), TaskStoreError> {
        self.bd(&["close", task_id, "--reason", resolution]).await?;
        Ok(())
    }
}

/// Parse `bd ready --json` output: a JSON array of issues, tolerating
/// unknown fields and either `blocked_by` or `dependencies` for blockers.
fn parse_ready_list(output: &str) -> Result<Vec<Task>, TaskStoreError> {
    let value: Value = serde_json::from_str(output.trim())
        .map_err(|e| TaskStoreError::Malformed(e.to_string()))?;
    let Some(items) = value.as_array() else {
        return Err(TaskStoreError::Malformed("expected a JSON array".into()));
    };

    let mut tasks = Vec::new();
    for item in items {
        let Some(id) = item.get("id").and_then(Value::as_str) else {
            continue;
        };
        let blocked_by = item
            .get("blocked_by")
            .or_else(|| item.get("dependencies"))
            .and_then(Value::as_array)
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| {
                        d.as_str()
                            .map(String::from)
                            .or_else(|| d.get("id").and_then(Value::as_str).map(String::from))
                    })
                    .collect()
            })
            .unwrap_or_default();
        tasks.push(Task {
            id: id.to_string(),
            title: item
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            status: item
                .get("status")
                .cloned()
                .and_then(|s| serde_json::from_value(s).ok())
                .unwrap_or_default(),
            priority: item
                .get("priority")
                .and_then(Value::as_u64)
                .and_then(|p| u8::try_from(p).ok())
                .unwrap_or(2),
            labels: item
                .get("labels")
                .and_then(Value::as_array)
                .map(|labels| {
                    labels
                        .iter()
                        .filter_map(|l| l.as_str().map(String::from))
                        .collect()
                })
                .unwrap_or_default(),
            blocked_by,
            assignee: item
                .get("assignee")
                .and_then(Value::as_str)
                .map(String::from),
        });
    }
    Ok(tasks)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn readiness_requires_open_and_unblocked() {
        let mut task = Task {
            id: "bd-1".into(),
            title: "t".into(),
            status: TaskStatus::Open,
            priority: 1,
            labels: BTreeSet::new(),
            blocked_by: BTreeSet::new(),
            assignee: None,
        };
        assert!(task.is_ready());

        task.blocked_by.insert("bd-0".into());
        assert!(!task.is_ready());

        task.blocked_by.clear();
        task.status = TaskStatus::InProgress;
        assert!(!task.is_ready());
    }

    #[test]
    fn parses_a_ready_list() {
        let output = r#"[
            {"id":"bd-abc123","title":"Fix the scroll bug","status":"open","priority":1,"labels":["bug"]},
            {"id":"bd-def456","title":"Add dark mode","status":"open","priority":2,
             "dependencies":[{"id":"bd-abc123"}],"assignee":"homer","extra_field":42}
        ]"#;
        let tasks = parse_ready_list(output).unwrap();
        assert_eq!(tasks.len(), 2);

        assert_eq!(tasks[0].id, "bd-abc123");
        assert_eq!(tasks[0].title, "Fix the scroll bug");
        assert!(tasks[0].labels.contains("bug"));
        assert!(tasks[0].is_ready());

        assert_eq!(tasks[1].blocked_by.len(), 1);
        assert_eq!(tasks[1].assignee.as_deref(), Some("homer"));
        assert!(!tasks[1].is_ready());
    }

    #[test]
    fn entries_without_ids_are_skipped() {
        let tasks = parse_ready_list(r#"[{"title":"no id"},{"id":"bd-1"}]"#).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "bd-1");
    }

    #[test]
    fn malformed_output_is_an_error() {
        assert!(matches!(
            parse_ready_list("not json"),
            Err(TaskStoreError::Malformed(_))
        ));
        assert!(matches!(
            parse_ready_list(r#"{"not":"an array"}"#),
            Err(TaskStoreError::Malformed(_))
        ));
    }
}
