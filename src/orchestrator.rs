//! Worker orchestrator: admission control, worker lifecycle, fan-out.
//!
//! Ownership is by name and key, never by pointer: the orchestrator owns
//! worker records keyed by worker name; a record holds the session control
//! handle; worktrees are looked up by `(workerName, taskId)`. Cleanup order
//! is adapter, then worktree, then worker record.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{Adapter, Session, SessionControl, SessionExit, StartOptions};
use crate::event::{AgentEvent, EventEnvelope, EventSource, SessionStatus, now_ms};
use crate::hub::EventPipeline;
use crate::names::NamePool;
use crate::store::SessionMeta;
use crate::task::{Task, TaskStore};
use crate::worktree::WorktreeManager;

pub const DEFAULT_MAX_WORKERS: usize = 3;

/// Timeout on every external task-store call.
const EXTERNAL_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive failed claims tolerated inside one admission tick.
const MAX_CLAIM_FAILURES: u32 = 3;

const DEFAULT_TASK_PROMPT: &str = "You are working on task {id}: {title}. \
    Read the full task with `bd show {id}`, implement it in this worktree, \
    and commit your work when you are done.";

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to claim task {0}")]
    TaskClaimFailed(String),
    #[error("worker name pool exhausted")]
    NameExhausted,
    #[error("admission skipped: {0}")]
    AdmissionSkipped(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrchestratorState {
    Idle,
    Running,
    StoppingAfterCurrent,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StopReason {
    Completed,
    Stopped,
    Error,
}

/// Lifecycle events fanned out to orchestrator subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LifecycleEvent {
    #[serde(rename_all = "camelCase")]
    WorkerStarted { worker_name: String, timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    WorkerStopped {
        worker_name: String,
        reason: StopReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    WorkerPaused { worker_name: String, timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    WorkerResumed { worker_name: String, timestamp: u64 },
    #[serde(rename_all = "camelCase")]
    WorkStarted {
        worker_name: String,
        task_id: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    WorkCompleted {
        worker_name: String,
        task_id: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        worker_name: String,
        session_id: String,
        timestamp: u64,
    },
    StateChanged {
        state: OrchestratorState,
        timestamp: u64,
    },
    Error { message: String, timestamp: u64 },
}

/// Per-worker controls routed from observers, plus the aggregate controls.
/// Implemented by [`Orchestrator`]; the websocket server holds it as a trait
/// object so it stays independent of the adapter and task-store types.
pub trait OrchestratorControl: Send + Sync + 'static {
    fn start(&self);
    fn stop(&self);
    fn stop_after_current(&self);
    fn cancel_stop_after_current(&self);
    fn pause_worker(&self, worker: &str);
    fn resume_worker(&self, worker: &str);
    fn stop_worker(&self, worker: &str);
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_workers: usize,
    pub workspace_id: Option<String>,
    pub poll_interval: Duration,
    pub model: Option<String>,
    pub allowed_tools: Vec<String>,
    pub extra_args: Vec<String>,
    /// Prompt template; `{id}` and `{title}` are substituted per task.
    pub task_prompt: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            workspace_id: None,
            poll_interval: Duration::from_secs(5),
            model: None,
            allowed_tools: Vec::new(),
            extra_args: Vec::new(),
            task_prompt: DEFAULT_TASK_PROMPT.to_string(),
        }
    }
}

struct WorkerRecord {
    task_id: String,
    session_id: String,
    control: SessionControl,
}

/// One active worker as reported to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveWorker {
    pub worker_name: String,
    pub task_id: String,
    pub session_id: String,
}

struct Inner<A, T> {
    adapter: A,
    tasks: T,
    worktrees: Arc<WorktreeManager>,
    pipeline: EventPipeline,
    names: NamePool,
    config: OrchestratorConfig,
    workers: Mutex<HashMap<String, WorkerRecord>>,
    phase: watch::Sender<OrchestratorState>,
    events_tx: broadcast::Sender<LifecycleEvent>,
    admission: Notify,
    cancel: CancellationToken,
    loop_started: AtomicBool,
}

pub struct Orchestrator<A, T> {
    inner: Arc<Inner<A, T>>,
}

impl<A, T> Clone for Orchestrator<A, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// What one admission attempt produced.
enum Prepare {
    Ready(Box<PreparedWorker>),
    /// Claim failed; the next candidate may still work.
    Skip,
    /// Nothing to admit right now.
    NoTask,
}

struct PreparedWorker {
    name: String,
    task: Task,
    session: Session,
    session_id: String,
}

impl<A: Adapter, T: TaskStore> Orchestrator<A, T> {
    pub fn new(
        adapter: A,
        tasks: T,
        worktrees: Arc<WorktreeManager>,
        pipeline: EventPipeline,
        config: OrchestratorConfig,
    ) -> Self {
        let (phase, _) = watch::channel(OrchestratorState::Idle);
        let (events_tx, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                adapter,
                tasks,
                worktrees,
                pipeline,
                names: NamePool::new(),
                config,
                workers: Mutex::new(HashMap::new()),
                phase,
                events_tx,
                admission: Notify::new(),
                cancel: CancellationToken::new(),
                loop_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        *self.inner.phase.borrow()
    }

    pub fn active_worker_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    /// Snapshot of the active workers, for observers.
    pub fn active_workers(&self) -> Vec<ActiveWorker> {
        self.inner
            .workers
            .lock()
            .iter()
            .map(|(name, record)| ActiveWorker {
                worker_name: name.clone(),
                task_id: record.task_id.clone(),
                session_id: record.session_id.clone(),
            })
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Kick the admission loop (e.g. on an external task-availability signal).
    pub fn notify_admission(&self) {
        self.inner.admission.notify_one();
    }

    /// Wait until the aggregate state reaches `Stopped`.
    pub async fn wait_for_stopped(&self) {
        let mut rx = self.inner.phase.subscribe();
        while *rx.borrow_and_update() != OrchestratorState::Stopped {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        let _ = self.inner.events_tx.send(event.clone());
        if let Ok(value) = serde_json::to_value(&event) {
            self.inner.pipeline.hub.publish_orchestrator(&value);
        }
    }

    fn emit_error(&self, message: String) {
        warn!("{message}");
        self.emit(LifecycleEvent::Error {
            message,
            timestamp: now_ms(),
        });
    }

    fn set_phase(&self, state: OrchestratorState) {
        let changed = self.inner.phase.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            info!(?state, "orchestrator state changed");
            self.emit(LifecycleEvent::StateChanged {
                state,
                timestamp: now_ms(),
            });
        }
    }

    fn maybe_finish_stop(&self) {
        let stopping = matches!(
            self.state(),
            OrchestratorState::Stopping | OrchestratorState::StoppingAfterCurrent
        );
        if stopping && self.inner.workers.lock().is_empty() {
            self.set_phase(OrchestratorState::Stopped);
        }
    }

    fn prompt_for(&self, task: &Task) -> String {
        self.inner
            .config
            .task_prompt
            .replace("{id}", &task.id)
            .replace("{title}", &task.title)
    }

    /// One admission pass: spawn workers while capacity and ready tasks both
    /// allow. At every instant `activeWorkers ≤ min(maxWorkers, readyTasks)`.
    pub async fn admission_tick(&self) {
        let mut claim_failures: u32 = 0;
        loop {
            if self.state() != OrchestratorState::Running {
                return;
            }
            if self.active_worker_count() >= self.inner.config.max_workers {
                return;
            }
            let ready = match external(self.inner.tasks.ready_tasks_count()).await {
                Ok(n) => n,
                Err(e) => {
                    self.emit_error(format!("ready-task query failed: {e}"));
                    return;
                }
            };
            if ready == 0 {
                return;
            }

            match self.prepare_worker().await {
                Prepare::Ready(prepared) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.run_worker(*prepared).await;
                    });
                }
                Prepare::Skip => {
                    claim_failures += 1;
                    if claim_failures >= MAX_CLAIM_FAILURES {
                        return;
                    }
                }
                Prepare::NoTask => return,
            }
        }
    }

    /// Steps 2–7 of the spawn loop: name, task, claim, worktree, session,
    /// record, lifecycle events.
    async fn prepare_worker(&self) -> Prepare {
        let Some(name) = self.inner.names.allocate() else {
            self.emit_error(OrchestratorError::NameExhausted.to_string());
            return Prepare::NoTask;
        };

        let task = match external(self.inner.tasks.next_ready_task(&name)).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                self.inner.names.release(&name);
                return Prepare::NoTask;
            }
            Err(e) => {
                self.inner.names.release(&name);
                self.emit_error(format!("next-ready-task query failed: {e}"));
                return Prepare::NoTask;
            }
        };

        if let Err(e) = external(self.inner.tasks.claim_task(&task.id, &name)).await {
            self.inner.names.release(&name);
            self.emit_error(format!(
                "{}: {e}",
                OrchestratorError::TaskClaimFailed(task.id.clone())
            ));
            return Prepare::Skip;
        }

        let worktrees = Arc::clone(&self.inner.worktrees);
        let (wt_name, wt_task) = (name.clone(), task.id.clone());
        let created =
            tokio::task::spawn_blocking(move || worktrees.create(&wt_name, &wt_task, None)).await;
        let worktree = match created {
            Ok(Ok(worktree)) => worktree,
            Ok(Err(e)) => {
                self.inner.names.release(&name);
                self.emit_error(format!("worktree create failed for {}: {e}", task.id));
                return Prepare::Skip;
            }
            Err(e) => {
                self.inner.names.release(&name);
                self.emit_error(format!("worktree create panicked: {e}"));
                return Prepare::NoTask;
            }
        };

        let mut options = StartOptions::new(&worktree.path);
        options.prompt = Some(self.prompt_for(&task));
        options.model = self.inner.config.model.clone();
        options.allowed_tools = self.inner.config.allowed_tools.clone();
        options.extra_args = self.inner.config.extra_args.clone();

        let session = match self.inner.adapter.start(options) {
            Ok(session) => session,
            Err(e) => {
                // Don't leak the worktree on a failed start
                let worktrees = Arc::clone(&self.inner.worktrees);
                let (wt_name, wt_task) = (name.clone(), task.id.clone());
                let _ = tokio::task::spawn_blocking(move || {
                    worktrees.remove(&wt_name, &wt_task, true)
                })
                .await;
                self.inner.names.release(&name);
                self.emit_error(format!("adapter start failed: {e}"));
                return Prepare::NoTask;
            }
        };

        let session_id = session.id.to_string();
        let mut meta = SessionMeta::new(
            &session_id,
            self.inner.adapter.info().id,
            worktree.path.display().to_string(),
        );
        meta.worker_name = Some(name.clone());
        meta.task_id = Some(task.id.clone());
        meta.task_title = Some(task.title.clone());
        meta.workspace_id = self.inner.config.workspace_id.clone();
        meta.status = SessionStatus::Starting;
        meta.allowed_toolset = self.inner.config.allowed_tools.clone();
        if let Err(e) = self.inner.pipeline.store.save_session(meta.clone()) {
            warn!(session = %session_id, error = %e, "failed to persist session row");
        }
        if let Err(e) = self.inner.pipeline.store.save_snapshot(&name, &meta) {
            warn!(worker = %name, error = %e, "failed to write session snapshot");
        }

        self.inner.workers.lock().insert(
            name.clone(),
            WorkerRecord {
                task_id: task.id.clone(),
                session_id: session_id.clone(),
                control: session.control.clone(),
            },
        );

        // A stop that raced this admission would have missed the record;
        // re-check so the new session is signalled too.
        if self.state() == OrchestratorState::Stopping {
            session.control.stop();
        }

        info!(worker = %name, task = %task.id, session = %session_id, "worker admitted");
        self.emit(LifecycleEvent::SessionCreated {
            worker_name: name.clone(),
            session_id: session_id.clone(),
            timestamp: now_ms(),
        });
        self.emit(LifecycleEvent::WorkerStarted {
            worker_name: name.clone(),
            timestamp: now_ms(),
        });
        self.emit(LifecycleEvent::WorkStarted {
            worker_name: name.clone(),
            task_id: task.id.clone(),
            timestamp: now_ms(),
        });

        Prepare::Ready(Box::new(PreparedWorker {
            name,
            task,
            session,
            session_id,
        }))
    }

    /// Drive one worker's session to completion and tear it down.
    async fn run_worker(&self, prepared: PreparedWorker) -> StopReason {
        let PreparedWorker {
            name,
            task,
            mut session,
            session_id,
        } = prepared;

        let mut fatal_message: Option<String> = None;
        while let Some(event) = session.events.next_event().await {
            if let AgentEvent::Error {
                message,
                fatal: true,
                ..
            } = &event
            {
                fatal_message = Some(message.clone());
            }
            if let AgentEvent::Status { status, .. } = &event {
                let _ = self.inner.pipeline.store.set_status(&session_id, *status);
            }
            let envelope = EventEnvelope::new(
                EventSource::Ralph,
                name.clone(),
                self.inner.config.workspace_id.clone(),
                event,
            );
            if let Err(e) = self.inner.pipeline.ingest(&session_id, envelope) {
                warn!(session = %session_id, error = %e, "failed to persist event");
            }
        }

        let exit = session.events.exit_reason().unwrap_or(SessionExit::Failed);
        self.finish_worker(&name, &task, exit, fatal_message).await
    }

    async fn finish_worker(
        &self,
        name: &str,
        task: &Task,
        exit: SessionExit,
        fatal: Option<String>,
    ) -> StopReason {
        let (reason, error) = match exit {
            SessionExit::Completed => self.land_worker(name, task).await,
            SessionExit::Stopped => (StopReason::Stopped, None),
            // Fatal adapter error: no merge, the worktree stays for inspection.
            SessionExit::Failed => (
                StopReason::Error,
                Some(fatal.unwrap_or_else(|| "adapter session failed".to_string())),
            ),
        };

        // Cleanup order: adapter (exited above), worktree (landed or
        // preserved), then the worker record and name.
        self.inner.workers.lock().remove(name);
        self.inner.names.release(name);

        info!(worker = %name, ?reason, "worker stopped");
        self.emit(LifecycleEvent::WorkerStopped {
            worker_name: name.to_string(),
            reason,
            error,
            timestamp: now_ms(),
        });

        self.maybe_finish_stop();
        self.inner.admission.notify_one();
        reason
    }

    /// Merge a cleanly finished worker: on success close the task and remove
    /// the worktree; on conflict leave everything for the operator.
    async fn land_worker(&self, name: &str, task: &Task) -> (StopReason, Option<String>) {
        let worktrees = Arc::clone(&self.inner.worktrees);
        let (wt_name, wt_task) = (name.to_string(), task.id.clone());
        let merged = tokio::task::spawn_blocking(move || {
            worktrees.post_iteration_merge(&wt_name, &wt_task)
        })
        .await;

        match merged {
            Ok(Ok(outcome)) if outcome.success => {
                if let Err(e) = external(self.inner.tasks.close_task(&task.id, "completed")).await {
                    self.emit_error(format!("failed to close task {}: {e}", task.id));
                }
                let worktrees = Arc::clone(&self.inner.worktrees);
                let (wt_name, wt_task) = (name.to_string(), task.id.clone());
                if let Ok(Err(e)) =
                    tokio::task::spawn_blocking(move || worktrees.remove(&wt_name, &wt_task, true))
                        .await
                {
                    warn!(worker = %name, error = %e, "failed to remove merged worktree");
                }
                self.emit(LifecycleEvent::WorkCompleted {
                    worker_name: name.to_string(),
                    task_id: task.id.clone(),
                    timestamp: now_ms(),
                });
                (StopReason::Completed, None)
            }
            Ok(Ok(outcome)) => (StopReason::Error, Some(outcome.message)),
            Ok(Err(e)) => (StopReason::Error, Some(e.to_string())),
            Err(e) => (StopReason::Error, Some(format!("merge task panicked: {e}"))),
        }
    }

    async fn admission_loop(self) {
        let mut poll = tokio::time::interval(self.inner.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = poll.tick() => {}
                () = self.inner.admission.notified() => {}
                () = self.inner.cancel.cancelled() => return,
            }
            if self.state() == OrchestratorState::Running {
                self.admission_tick().await;
            }
        }
    }

    /// Single-shot driver for `ralph run`: admit one worker and wait for it.
    /// Returns `None` when there is nothing to do.
    pub async fn run_iteration(&self) -> Option<StopReason> {
        if matches!(
            self.state(),
            OrchestratorState::Idle | OrchestratorState::Stopped
        ) {
            self.set_phase(OrchestratorState::Running);
        }
        match self.prepare_worker().await {
            Prepare::Ready(prepared) => Some(self.run_worker(*prepared).await),
            Prepare::Skip | Prepare::NoTask => None,
        }
    }

    fn worker_control(&self, worker: &str) -> Option<SessionControl> {
        self.inner
            .workers
            .lock()
            .get(worker)
            .map(|record| record.control.clone())
    }

    /// Stop every adapter concurrently and wait for their exits.
    pub async fn stop_and_wait(&self) {
        OrchestratorControl::stop(self);
        self.wait_for_stopped().await;
    }
}

impl<A: Adapter, T: TaskStore> OrchestratorControl for Orchestrator<A, T> {
    /// Enter `running` and begin admission ticks.
    fn start(&self) {
        self.set_phase(OrchestratorState::Running);
        if !self.inner.loop_started.swap(true, Ordering::SeqCst) {
            let this = self.clone();
            tokio::spawn(this.admission_loop());
        }
        self.inner.admission.notify_one();
    }

    /// Signal all adapters to stop; the state reaches `stopped` once every
    /// worker's exit has been processed.
    fn stop(&self) {
        self.set_phase(OrchestratorState::Stopping);
        let controls: Vec<SessionControl> = self
            .inner
            .workers
            .lock()
            .values()
            .map(|record| record.control.clone())
            .collect();
        for control in controls {
            control.stop();
        }
        self.maybe_finish_stop();
    }

    /// Cease admission and let every worker's current work item complete
    /// naturally.
    fn stop_after_current(&self) {
        self.set_phase(OrchestratorState::StoppingAfterCurrent);
        self.maybe_finish_stop();
    }

    fn cancel_stop_after_current(&self) {
        if self.state() == OrchestratorState::StoppingAfterCurrent {
            self.set_phase(OrchestratorState::Running);
            self.inner.admission.notify_one();
        }
    }

    fn pause_worker(&self, worker: &str) {
        let Some(control) = self.worker_control(worker) else {
            return;
        };
        match control.pause() {
            Ok(()) => self.emit(LifecycleEvent::WorkerPaused {
                worker_name: worker.to_string(),
                timestamp: now_ms(),
            }),
            Err(e) => self.emit_error(format!("pause {worker} failed: {e}")),
        }
    }

    fn resume_worker(&self, worker: &str) {
        let Some(control) = self.worker_control(worker) else {
            return;
        };
        match control.resume() {
            Ok(()) => self.emit(LifecycleEvent::WorkerResumed {
                worker_name: worker.to_string(),
                timestamp: now_ms(),
            }),
            Err(e) => self.emit_error(format!("resume {worker} failed: {e}")),
        }
    }

    /// Immediate stop for one worker.
    fn stop_worker(&self, worker: &str) {
        if let Some(control) = self.worker_control(worker) {
            control.stop();
        }
    }
}

async fn external<V, F>(call: F) -> Result<V, crate::task::TaskStoreError>
where
    F: std::future::Future<Output = Result<V, crate::task::TaskStoreError>>,
{
    tokio::time::timeout(EXTERNAL_CALL_TIMEOUT, call)
        .await
        .map_err(|_| crate::task::TaskStoreError::Timeout)?
}
