//! Uniform session abstraction over heterogeneous agent subprocesses.
//!
//! Each concrete adapter translates its agent's native frames into canonical
//! [`crate::event::AgentEvent`]s and exposes the same session surface:
//! start, send, pause/resume, stop, stop-after-current.

use std::path::PathBuf;
use std::pin::Pin;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::process::{ProcessEvent, ProcessHandle, Signal};

pub mod claude;
pub mod codex;
pub mod retry;
mod session;

pub use session::{EventSink, QueryError, Session, SessionControl, SessionEvents, SessionExit};
pub(crate) use session::{Backend, SessionLoopConfig, spawn_session};

use retry::RetryConfig;

/// Capabilities advertised by an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterFeatures {
    pub streaming: bool,
    pub tools: bool,
    pub pause_resume: bool,
    pub system_prompt: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AdapterInfo {
    pub id: &'static str,
    pub name: &'static str,
    pub features: AdapterFeatures,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("adapter `{0}` is not available")]
    Unavailable(String),
    #[error("unknown adapter `{0}`")]
    UnknownAdapter(String),
    #[error("operation not supported by this adapter: {0}")]
    Unsupported(&'static str),
    #[error("retryable adapter error: {0}")]
    Retry(String),
    #[error("fatal adapter error: {0}")]
    Fatal(String),
}

impl AdapterError {
    /// Classify a request failure by its message: transient failures become
    /// `Retry`, everything else `Fatal`.
    pub(crate) fn from_query(err: QueryError) -> Self {
        if retry::is_retryable(&err.message) {
            Self::Retry(err.message)
        } else {
            Self::Fatal(err.message)
        }
    }
}

/// Options for starting a session.
#[derive(Debug, Clone)]
pub struct StartOptions {
    /// Initial user message, queued before anything sent later.
    pub prompt: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    /// Working directory for the agent subprocess (the worker's worktree).
    pub cwd: PathBuf,
    pub allowed_tools: Vec<String>,
    /// Extra arguments passed through to the agent binary.
    pub extra_args: Vec<String>,
    pub retry: RetryConfig,
    /// Keep idling for follow-up messages after the queue drains.
    pub keep_alive: bool,
    /// Accept a client-supplied session id (only honored when the server has
    /// no record of it; the caller checks the store).
    pub session_id: Option<Uuid>,
}

impl StartOptions {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            prompt: None,
            model: None,
            system_prompt: None,
            cwd: cwd.into(),
            allowed_tools: Vec::new(),
            extra_args: Vec::new(),
            retry: RetryConfig::default(),
            keep_alive: false,
            session_id: None,
        }
    }
}

/// A concrete agent integration.
pub trait Adapter: Clone + Send + Sync + 'static {
    fn info(&self) -> AdapterInfo;
    /// Non-destructive probe (binary presence).
    fn is_available(&self) -> bool;
    fn start(&self, options: StartOptions) -> Result<Session, AdapterError>;
}

/// Registry over the known adapters; `--agent` selects by id.
#[derive(Debug, Clone)]
pub enum AnyAdapter {
    Claude(claude::ClaudeAdapter),
    Codex(codex::CodexAdapter),
}

pub const DEFAULT_ADAPTER: &str = "claude";

impl AnyAdapter {
    pub fn by_id(id: &str) -> Result<Self, AdapterError> {
        match id {
            "claude" => Ok(Self::Claude(claude::ClaudeAdapter)),
            "codex" => Ok(Self::Codex(codex::CodexAdapter)),
            other => Err(AdapterError::UnknownAdapter(other.to_string())),
        }
    }

    pub fn ids() -> &'static [&'static str] {
        &["claude", "codex"]
    }
}

impl Adapter for AnyAdapter {
    fn info(&self) -> AdapterInfo {
        match self {
            Self::Claude(a) => a.info(),
            Self::Codex(a) => a.info(),
        }
    }

    fn is_available(&self) -> bool {
        match self {
            Self::Claude(a) => a.is_available(),
            Self::Codex(a) => a.is_available(),
        }
    }

    fn start(&self, options: StartOptions) -> Result<Session, AdapterError> {
        match self {
            Self::Claude(a) => a.start(options),
            Self::Codex(a) => a.start(options),
        }
    }
}

/// Check whether a binary is reachable through `PATH`.
pub(crate) fn binary_on_path(name: &str) -> bool {
    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| dir.join(name).is_file())
}

/// Window inside which a complete message matching a just-finished stream is
/// suppressed.
pub(crate) const DEDUP_WINDOW: Duration = Duration::from_millis(1000);

/// Suppresses the complete assistant message that follows a streamed copy of
/// the same content.
///
/// Deltas accumulate into a buffer; `note_stream_end` stamps the buffer when
/// the stream closes. A complete message equal to the accumulated content
/// arriving within [`DEDUP_WINDOW`] of that stamp is dropped (once).
#[derive(Debug, Default)]
pub(crate) struct StreamDedup {
    buf: String,
    finished: Option<(String, Instant)>,
}

impl StreamDedup {
    pub fn push_delta(&mut self, text: &str) {
        self.buf.push_str(text);
    }

    pub fn note_stream_end(&mut self, now: Instant) {
        if !self.buf.is_empty() {
            self.finished = Some((std::mem::take(&mut self.buf), now));
        }
    }

    pub fn should_suppress(&mut self, content: &str, now: Instant) -> bool {
        if let Some((streamed, stamped)) = &self.finished
            && streamed == content
            && now.duration_since(*stamped) <= DEDUP_WINDOW
        {
            self.finished = None;
            return true;
        }
        false
    }
}

/// Result of pumping a child process to completion.
pub(crate) struct PumpOutcome {
    pub exit_code: Option<i32>,
    pub stderr_tail: String,
    pub cancelled: bool,
}

/// Cap on retained stderr (kept for error context, not emitted as events).
const STDERR_TAIL_CAP: usize = 4096;

/// Drive a child's event stream to its `Exit`, handing stdout lines to the
/// caller. On cancellation the child is signalled `term`, then `kill` after a
/// 2 s grace, and the pipes are still drained to EOF before returning.
pub(crate) async fn pump_process(
    handle: &mut ProcessHandle,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(String) + Send,
) -> PumpOutcome {
    let Some(mut rx) = handle.take_events() else {
        return PumpOutcome {
            exit_code: None,
            stderr_tail: String::new(),
            cancelled: cancel.is_cancelled(),
        };
    };

    let mut stderr_tail = String::new();
    let mut exit_code = None;
    let mut termed = false;
    let mut kill_deadline: Option<Pin<Box<tokio::time::Sleep>>> = None;

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(ProcessEvent::StdoutLine(line)) => on_line(line),
                Some(ProcessEvent::StderrChunk(chunk)) => {
                    stderr_tail.push_str(&chunk);
                    if stderr_tail.len() > STDERR_TAIL_CAP {
                        let cut = stderr_tail.len() - STDERR_TAIL_CAP;
                        stderr_tail.drain(..cut);
                    }
                }
                Some(ProcessEvent::Exit { code, .. }) => {
                    exit_code = code;
                    break;
                }
                None => break,
            },
            () = cancel.cancelled(), if !termed => {
                handle.signal(Signal::Term);
                termed = true;
                kill_deadline = Some(Box::pin(tokio::time::sleep(Duration::from_secs(2))));
            }
            () = async {
                match kill_deadline.as_mut() {
                    Some(deadline) => deadline.await,
                    None => std::future::pending().await,
                }
            }, if kill_deadline.is_some() => {
                handle.signal(Signal::Kill);
                kill_deadline = None;
            }
        }
    }

    PumpOutcome {
        exit_code,
        stderr_tail,
        cancelled: cancel.is_cancelled(),
    }
}

/// Surface an unparseable subprocess line as opaque stderr output: a
/// non-fatal error envelope that never terminates the session.
pub(crate) fn opaque_stderr(line: String) -> crate::event::AgentEvent {
    crate::event::AgentEvent::Error {
        message: line,
        code: Some("STDERR".to_string()),
        fatal: false,
        timestamp: crate::event::now_ms(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn dedup_suppresses_final_within_window() {
        let mut dedup = StreamDedup::default();
        let t0 = Instant::now();
        dedup.push_delta("Hello ");
        dedup.push_delta("world");
        dedup.note_stream_end(t0);

        assert!(dedup.should_suppress("Hello world", t0 + Duration::from_millis(500)));
        // Suppression is one-shot
        assert!(!dedup.should_suppress("Hello world", t0 + Duration::from_millis(600)));
    }

    #[test]
    fn dedup_lets_late_final_through() {
        let mut dedup = StreamDedup::default();
        let t0 = Instant::now();
        dedup.push_delta("Hello");
        dedup.note_stream_end(t0);

        assert!(!dedup.should_suppress("Hello", t0 + Duration::from_millis(1500)));
    }

    #[test]
    fn dedup_lets_different_content_through() {
        let mut dedup = StreamDedup::default();
        let t0 = Instant::now();
        dedup.push_delta("streamed");
        dedup.note_stream_end(t0);

        assert!(!dedup.should_suppress("different", t0 + Duration::from_millis(100)));
        // A mismatch does not consume the pending stream
        assert!(dedup.should_suppress("streamed", t0 + Duration::from_millis(200)));
    }

    #[test]
    fn dedup_without_stream_never_suppresses() {
        let mut dedup = StreamDedup::default();
        assert!(!dedup.should_suppress("anything", Instant::now()));
    }

    #[test]
    fn registry_knows_both_adapters() {
        for id in AnyAdapter::ids() {
            let adapter = AnyAdapter::by_id(id).unwrap();
            assert_eq!(adapter.info().id, *id);
        }
        assert!(matches!(
            AnyAdapter::by_id("gpt-in-a-box"),
            Err(AdapterError::UnknownAdapter(_))
        ));
    }

    #[test]
    fn binary_on_path_finds_sh() {
        assert!(binary_on_path("sh"));
        assert!(!binary_on_path("definitely-not-a-real-binary-xyz"));
    }
}
