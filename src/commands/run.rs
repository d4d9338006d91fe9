//! `ralph run <iterations>`: single-shot iteration driver.
//!
//! Claims and works tasks one at a time, printing lifecycle events to
//! stdout. With `--watch`, waits for new tasks instead of exiting when the
//! queue drains.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use tracing::warn;

use crate::adapter::{Adapter as _, AnyAdapter};
use crate::config::Config;
use crate::hub::{EventPipeline, Hub};
use crate::orchestrator::{LifecycleEvent, Orchestrator, OrchestratorConfig};
use crate::store::SessionStore;
use crate::task::BeadsTaskStore;
use crate::worktree::WorktreeManager;

pub struct RunOptions {
    pub iterations: u32,
    pub json: bool,
    pub watch: bool,
}

pub async fn run(workspace: PathBuf, config: Config, options: RunOptions) -> Result<u8> {
    let store = Arc::new(SessionStore::open(&workspace)?);
    let pipeline = EventPipeline::new(Arc::clone(&store), Hub::new());

    let adapter = AnyAdapter::by_id(&config.agent).context("unknown agent adapter")?;
    if !adapter.is_available() {
        warn!(agent = %config.agent, "agent binary not found on PATH");
    }

    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let orchestrator = Orchestrator::new(
        adapter,
        BeadsTaskStore::new(&workspace),
        Arc::new(WorktreeManager::new(&workspace)),
        pipeline,
        OrchestratorConfig {
            max_workers: 1,
            workspace_id: config.workspace_id.clone(),
            poll_interval,
            model: config.model.clone(),
            allowed_tools: config.allowed_tools.clone(),
            ..OrchestratorConfig::default()
        },
    );

    let mut events = orchestrator.subscribe();
    let json = options.json;
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if json {
                if let Ok(line) = serde_json::to_string(&event) {
                    println!("{line}");
                }
            } else {
                println!("{}", describe(&event));
            }
        }
    });

    let mut completed: u32 = 0;
    let code = loop {
        if options.iterations > 0 && completed >= options.iterations {
            break 0;
        }
        tokio::select! {
            outcome = orchestrator.run_iteration() => match outcome {
                Some(_) => completed += 1,
                None if options.watch => tokio::time::sleep(poll_interval).await,
                None => break 0,
            },
            _ = tokio::signal::ctrl_c() => break 130,
        }
    };

    printer.abort();
    if let Err(e) = store.filter_noise() {
        warn!(error = %e, "noise filtering failed");
    }
    Ok(code)
}

/// Human-readable one-liner for a lifecycle event.
fn describe(event: &LifecycleEvent) -> String {
    match event {
        LifecycleEvent::WorkerStarted { worker_name, .. } => {
            format!("worker {worker_name} started")
        }
        LifecycleEvent::WorkerStopped {
            worker_name,
            reason,
            error,
            ..
        } => match error {
            Some(error) => format!("worker {worker_name} stopped ({reason:?}): {error}"),
            None => format!("worker {worker_name} stopped ({reason:?})"),
        },
        LifecycleEvent::WorkerPaused { worker_name, .. } => format!("worker {worker_name} paused"),
        LifecycleEvent::WorkerResumed { worker_name, .. } => {
            format!("worker {worker_name} resumed")
        }
        LifecycleEvent::WorkStarted {
            worker_name,
            task_id,
            ..
        } => format!("{worker_name} picked up {task_id}"),
        LifecycleEvent::WorkCompleted {
            worker_name,
            task_id,
            ..
        } => format!("{worker_name} completed {task_id}"),
        LifecycleEvent::SessionCreated {
            worker_name,
            session_id,
            ..
        } => format!("{worker_name} opened session {session_id}"),
        LifecycleEvent::StateChanged { state, .. } => format!("orchestrator is {state:?}"),
        LifecycleEvent::Error { message, .. } => format!("error: {message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::now_ms;
    use crate::orchestrator::StopReason;

    #[test]
    fn describe_covers_the_interesting_shapes() {
        let stopped = LifecycleEvent::WorkerStopped {
            worker_name: "homer".into(),
            reason: StopReason::Error,
            error: Some("merge conflict".into()),
            timestamp: now_ms(),
        };
        assert_eq!(
            describe(&stopped),
            "worker homer stopped (Error): merge conflict"
        );

        let work = LifecycleEvent::WorkStarted {
            worker_name: "homer".into(),
            task_id: "bd-abc123".into(),
            timestamp: now_ms(),
        };
        assert_eq!(describe(&work), "homer picked up bd-abc123");
    }
}
