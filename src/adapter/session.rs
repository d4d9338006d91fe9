//! Session runtime shared by every adapter.
//!
//! A session owns a queue of user requests and drives them through a
//! [`Backend`] one at a time. All status transitions happen here, atomically
//! under the session lock; retries wrap the whole request, with events
//! streaming out as they are produced.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::{AgentEvent, SessionStatus};

use super::retry::{self, RetryConfig};
use super::{AdapterError, AdapterFeatures};

/// Why a session's event stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// In-flight work finished cleanly and the session wound down.
    Completed,
    /// Stopped by request.
    Stopped,
    /// A fatal adapter error terminated the session.
    Failed,
}

/// Error from a single backend request attempt.
#[derive(Debug)]
pub struct QueryError {
    pub message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Sink for canonical events produced by a backend. Sends never fail; a
/// closed receiver just drops the event.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl EventSink {
    pub fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

/// One concrete agent integration: runs a single request to completion,
/// emitting canonical events along the way. Must observe `cancel` and return
/// promptly once it fires.
pub(crate) trait Backend: Send + 'static {
    fn run_request(
        &mut self,
        prompt: String,
        emit: EventSink,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<(), QueryError>> + Send;
}

/// Loop parameters fixed at session start.
pub(crate) struct SessionLoopConfig {
    pub retry: RetryConfig,
    pub initial_prompt: Option<String>,
    /// Keep idling for follow-up `send`s after the queue drains. Orchestrator
    /// workers run single-shot (`false`): the session completes once its
    /// first request finishes.
    pub keep_alive: bool,
}

struct Shared {
    status: Mutex<SessionStatus>,
    exit: Mutex<Option<SessionExit>>,
    cancel: CancellationToken,
    features: AdapterFeatures,
}

enum Command {
    Send(String),
    Pause,
    Resume,
    Stop,
    StopAfterCurrent,
}

/// A running agent session: a server-generated id, the event stream, and a
/// cloneable control handle.
pub struct Session {
    pub id: Uuid,
    pub events: SessionEvents,
    pub control: SessionControl,
}

/// Receiving half of a session: canonical events in emission order. The
/// stream ends (returns `None`) exactly once, after the exit reason is set.
pub struct SessionEvents {
    rx: mpsc::UnboundedReceiver<AgentEvent>,
    shared: Arc<Shared>,
}

impl SessionEvents {
    pub async fn next_event(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Set before the stream ends; `None` while the session is live.
    pub fn exit_reason(&self) -> Option<SessionExit> {
        *self.shared.exit.lock()
    }
}

/// Control half of a session. Cheap to clone; safe to use from any task.
#[derive(Clone)]
pub struct SessionControl {
    shared: Arc<Shared>,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl SessionControl {
    /// Queue a user message behind any in-flight request.
    pub fn send(&self, text: impl Into<String>) {
        let _ = self.cmd_tx.send(Command::Send(text.into()));
    }

    pub fn pause(&self) -> Result<(), AdapterError> {
        if !self.shared.features.pause_resume {
            return Err(AdapterError::Unsupported("pause"));
        }
        let _ = self.cmd_tx.send(Command::Pause);
        Ok(())
    }

    pub fn resume(&self) -> Result<(), AdapterError> {
        if !self.shared.features.pause_resume {
            return Err(AdapterError::Unsupported("resume"));
        }
        let _ = self.cmd_tx.send(Command::Resume);
        Ok(())
    }

    /// Stop immediately: cancels any in-flight request.
    pub fn stop(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
        self.shared.cancel.cancel();
    }

    /// Let the in-flight request finish, then stop without starting queued work.
    pub fn stop_after_current(&self) {
        let _ = self.cmd_tx.send(Command::StopAfterCurrent);
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.lock()
    }
}

/// Spawn the session loop for a backend and hand back the session.
pub(crate) fn spawn_session<B: Backend>(
    backend: B,
    features: AdapterFeatures,
    config: SessionLoopConfig,
    id: Option<Uuid>,
) -> Session {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        status: Mutex::new(SessionStatus::Idle),
        exit: Mutex::new(None),
        cancel: CancellationToken::new(),
        features,
    });

    tokio::spawn(session_loop(
        backend,
        config,
        EventSink { tx: event_tx },
        cmd_rx,
        Arc::clone(&shared),
    ));

    Session {
        id: id.unwrap_or_else(Uuid::new_v4),
        events: SessionEvents {
            rx: event_rx,
            shared: Arc::clone(&shared),
        },
        control: SessionControl { shared, cmd_tx },
    }
}

fn set_status(shared: &Shared, emit: &EventSink, status: SessionStatus) {
    *shared.status.lock() = status;
    emit.emit(AgentEvent::status(status));
}

/// Mutable loop state threaded through command handling.
struct LoopState {
    queue: VecDeque<String>,
    paused: bool,
    stop_after_current: bool,
    cmd_open: bool,
}

fn apply_command(
    cmd: Option<Command>,
    state: &mut LoopState,
    shared: &Shared,
    emit: &EventSink,
    in_flight: bool,
) {
    match cmd {
        Some(Command::Send(text)) => state.queue.push_back(text),
        Some(Command::Pause) => {
            state.paused = true;
            let status = if in_flight {
                SessionStatus::Pausing
            } else {
                SessionStatus::Paused
            };
            set_status(shared, emit, status);
        }
        Some(Command::Resume) => {
            state.paused = false;
            set_status(shared, emit, SessionStatus::Running);
        }
        Some(Command::Stop) => {
            // The cancel token is already tripped by the control handle.
            set_status(shared, emit, SessionStatus::Stopping);
        }
        Some(Command::StopAfterCurrent) => {
            state.stop_after_current = true;
            set_status(shared, emit, SessionStatus::StoppingAfterCurrent);
        }
        None => state.cmd_open = false,
    }
}

async fn session_loop<B: Backend>(
    mut backend: B,
    config: SessionLoopConfig,
    emit: EventSink,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    set_status(&shared, &emit, SessionStatus::Starting);

    let mut state = LoopState {
        queue: VecDeque::new(),
        paused: false,
        stop_after_current: false,
        cmd_open: true,
    };
    if let Some(prompt) = config.initial_prompt {
        state.queue.push_back(prompt);
    }
    set_status(&shared, &emit, SessionStatus::Running);

    let cancel = shared.cancel.clone();
    let mut served = 0usize;

    let exit = loop {
        if cancel.is_cancelled() {
            break SessionExit::Stopped;
        }
        if state.stop_after_current {
            break SessionExit::Completed;
        }

        let next = if state.paused {
            None
        } else {
            state.queue.pop_front()
        };

        let Some(prompt) = next else {
            if !config.keep_alive && served > 0 && !state.paused && state.queue.is_empty() {
                break SessionExit::Completed;
            }
            if !state.cmd_open {
                // No control handle left and nothing to do.
                break SessionExit::Stopped;
            }
            tokio::select! {
                cmd = cmd_rx.recv() => apply_command(cmd, &mut state, &shared, &emit, false),
                () = cancel.cancelled() => {
                    set_status(&shared, &emit, SessionStatus::Stopping);
                    break SessionExit::Stopped;
                }
            }
            continue;
        };

        match run_with_retry(
            &mut backend,
            prompt,
            &emit,
            &cancel,
            &config.retry,
            &mut state,
            &mut cmd_rx,
            &shared,
        )
        .await
        {
            RequestOutcome::Completed => {
                served += 1;
                if state.paused {
                    set_status(&shared, &emit, SessionStatus::Paused);
                }
            }
            RequestOutcome::Cancelled => {
                set_status(&shared, &emit, SessionStatus::Stopping);
                break SessionExit::Stopped;
            }
            RequestOutcome::Fatal(message) => {
                emit.emit(AgentEvent::fatal_error(message));
                set_status(&shared, &emit, SessionStatus::Error);
                break SessionExit::Failed;
            }
        }
    };

    if exit != SessionExit::Failed {
        set_status(&shared, &emit, SessionStatus::Stopped);
    }
    *shared.exit.lock() = Some(exit);
    // Dropping `emit` (and the loop) closes the event stream.
}

enum RequestOutcome {
    Completed,
    Cancelled,
    Fatal(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_with_retry<B: Backend>(
    backend: &mut B,
    prompt: String,
    emit: &EventSink,
    cancel: &CancellationToken,
    retry_config: &RetryConfig,
    state: &mut LoopState,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shared: &Arc<Shared>,
) -> RequestOutcome {
    let mut attempt: u32 = 0;
    loop {
        let result = drive_request(backend, prompt.clone(), emit, cancel, state, cmd_rx, shared).await;
        if cancel.is_cancelled() {
            return RequestOutcome::Cancelled;
        }
        let err = match result {
            Ok(()) => return RequestOutcome::Completed,
            Err(err) => AdapterError::from_query(err),
        };
        match err {
            AdapterError::Retry(_) if attempt < retry_config.max_retries => {
                let delay = retry_config.delay(attempt);
                emit.emit(AgentEvent::retry_notice(retry::retry_message(delay)));
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = cancel.cancelled() => return RequestOutcome::Cancelled,
                }
                attempt += 1;
            }
            AdapterError::Retry(message) | AdapterError::Fatal(message) => {
                return RequestOutcome::Fatal(message);
            }
            other => return RequestOutcome::Fatal(other.to_string()),
        }
    }
}

/// Drive one backend attempt while continuing to service control commands.
async fn drive_request<B: Backend>(
    backend: &mut B,
    prompt: String,
    emit: &EventSink,
    cancel: &CancellationToken,
    state: &mut LoopState,
    cmd_rx: &mut mpsc::UnboundedReceiver<Command>,
    shared: &Arc<Shared>,
) -> Result<(), QueryError> {
    let run = backend.run_request(prompt, emit.clone(), cancel.clone());
    tokio::pin!(run);
    loop {
        tokio::select! {
            res = &mut run => return res,
            cmd = cmd_rx.recv(), if state.cmd_open => {
                apply_command(cmd, state, shared, emit, true);
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::event::{RETRY_CODE, Usage, now_ms};

    /// Backend that replays a script of per-request outcomes.
    struct ScriptedBackend {
        script: VecDeque<Result<Vec<AgentEvent>, String>>,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<Result<Vec<AgentEvent>, String>>) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    script: script.into(),
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }
    }

    impl Backend for ScriptedBackend {
        async fn run_request(
            &mut self,
            _prompt: String,
            emit: EventSink,
            _cancel: CancellationToken,
        ) -> Result<(), QueryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script.pop_front() {
                Some(Ok(events)) => {
                    for event in events {
                        emit.emit(event);
                    }
                    Ok(())
                }
                Some(Err(message)) => Err(QueryError::new(message)),
                None => Ok(()),
            }
        }
    }

    const FEATURES: AdapterFeatures = AdapterFeatures {
        streaming: true,
        tools: true,
        pause_resume: true,
        system_prompt: true,
    };

    fn result_event(content: &str) -> AgentEvent {
        AgentEvent::Result {
            content: content.to_string(),
            usage: Usage::new(10, 20),
            timestamp: now_ms(),
        }
    }

    fn test_retry_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            backoff_multiplier: 2.0,
        }
    }

    async fn drain(events: &mut SessionEvents) -> Vec<AgentEvent> {
        let mut collected = Vec::new();
        while let Some(event) = events.next_event().await {
            collected.push(event);
        }
        collected
    }

    fn retry_notices(events: &[AgentEvent]) -> Vec<&AgentEvent> {
        events
            .iter()
            .filter(|e| {
                matches!(e, AgentEvent::Error { code: Some(c), fatal: false, .. } if c == RETRY_CODE)
            })
            .collect()
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let (backend, calls) = ScriptedBackend::new(vec![
            Err("Connection error".into()),
            Ok(vec![result_event("Success after retry")]),
        ]);
        let mut session = spawn_session(
            backend,
            FEATURES,
            SessionLoopConfig {
                retry: test_retry_config(),
                initial_prompt: Some("go".into()),
                keep_alive: false,
            },
            None,
        );

        let events = drain(&mut session.events).await;

        let notices = retry_notices(&events);
        assert_eq!(notices.len(), 1);
        let AgentEvent::Error { message, .. } = notices[0] else {
            unreachable!()
        };
        assert!(message.contains("Retrying in 0 seconds"), "got: {message}");

        let results: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Result { .. }))
            .collect();
        assert_eq!(results.len(), 1);
        let AgentEvent::Result { content, .. } = results[0] else {
            unreachable!()
        };
        assert_eq!(content, "Success after retry");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(session.events.exit_reason(), Some(SessionExit::Completed));
    }

    #[tokio::test]
    async fn retries_exhaust_into_fatal_error() {
        let (backend, calls) = ScriptedBackend::new(vec![
            Err("Connection error".into()),
            Err("Connection error".into()),
            Err("Connection error".into()),
            Err("Connection error".into()),
        ]);
        let mut session = spawn_session(
            backend,
            FEATURES,
            SessionLoopConfig {
                retry: test_retry_config(),
                initial_prompt: Some("go".into()),
                keep_alive: false,
            },
            None,
        );

        let events = drain(&mut session.events).await;

        assert_eq!(retry_notices(&events).len(), 3);
        let fatals: Vec<_> = events.iter().filter(|e| e.is_fatal_error()).collect();
        assert_eq!(fatals.len(), 1);
        assert!(!events.iter().any(|e| matches!(e, AgentEvent::Result { .. })));

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(session.events.exit_reason(), Some(SessionExit::Failed));
        assert_eq!(session.control.status(), SessionStatus::Error);
    }

    #[tokio::test]
    async fn non_retryable_error_is_fatal_on_first_attempt() {
        let (backend, calls) = ScriptedBackend::new(vec![Err("invalid api key".into())]);
        let mut session = spawn_session(
            backend,
            FEATURES,
            SessionLoopConfig {
                retry: test_retry_config(),
                initial_prompt: Some("go".into()),
                keep_alive: false,
            },
            None,
        );

        let events = drain(&mut session.events).await;
        assert!(retry_notices(&events).is_empty());
        assert_eq!(events.iter().filter(|e| e.is_fatal_error()).count(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.events.exit_reason(), Some(SessionExit::Failed));
    }

    #[tokio::test]
    async fn stop_while_idle_yields_stopped() {
        let (backend, calls) = ScriptedBackend::new(vec![]);
        let mut session = spawn_session(
            backend,
            FEATURES,
            SessionLoopConfig {
                retry: RetryConfig::default(),
                initial_prompt: None,
                keep_alive: true,
            },
            None,
        );

        session.control.stop();
        let events = drain(&mut session.events).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(session.events.exit_reason(), Some(SessionExit::Stopped));
        assert_eq!(session.control.status(), SessionStatus::Stopped);
        // The last observable statuses wind down through stopping
        assert!(events.iter().any(
            |e| matches!(e, AgentEvent::Status { status: SessionStatus::Stopping, .. })
        ));
    }

    #[tokio::test]
    async fn stop_after_current_while_idle_completes() {
        let (backend, _calls) = ScriptedBackend::new(vec![]);
        let mut session = spawn_session(
            backend,
            FEATURES,
            SessionLoopConfig {
                retry: RetryConfig::default(),
                initial_prompt: None,
                keep_alive: true,
            },
            None,
        );

        session.control.stop_after_current();
        drain(&mut session.events).await;
        assert_eq!(session.events.exit_reason(), Some(SessionExit::Completed));
    }

    #[tokio::test]
    async fn pause_holds_queued_requests_until_resume() {
        let (backend, calls) = ScriptedBackend::new(vec![
            Ok(vec![result_event("one")]),
            Ok(vec![result_event("two")]),
        ]);
        let mut session = spawn_session(
            backend,
            FEATURES,
            SessionLoopConfig {
                retry: RetryConfig::default(),
                initial_prompt: None,
                keep_alive: true,
            },
            None,
        );

        session.control.pause().unwrap();
        session.control.send("held");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0, "paused session ran work");
        assert_eq!(session.control.status(), SessionStatus::Paused);

        session.control.resume().unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.control.status(), SessionStatus::Running);

        session.control.stop();
        drain(&mut session.events).await;
    }

    #[tokio::test]
    async fn pause_is_unsupported_without_the_feature() {
        let features = AdapterFeatures {
            pause_resume: false,
            ..FEATURES
        };
        let (backend, _calls) = ScriptedBackend::new(vec![]);
        let session = spawn_session(
            backend,
            features,
            SessionLoopConfig {
                retry: RetryConfig::default(),
                initial_prompt: None,
                keep_alive: true,
            },
            None,
        );

        assert!(matches!(
            session.control.pause(),
            Err(AdapterError::Unsupported("pause"))
        ));
        session.control.stop();
    }

    #[tokio::test]
    async fn send_queues_behind_in_flight_request() {
        let (backend, calls) = ScriptedBackend::new(vec![
            Ok(vec![result_event("first")]),
            Ok(vec![result_event("second")]),
        ]);
        let mut session = spawn_session(
            backend,
            FEATURES,
            SessionLoopConfig {
                retry: RetryConfig::default(),
                initial_prompt: Some("a".into()),
                keep_alive: true,
            },
            None,
        );

        session.control.send("b");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        session.control.stop();
        let events = drain(&mut session.events).await;
        let contents: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::Result { content, .. } => Some(content.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(contents, vec!["first", "second"]);
    }
}
