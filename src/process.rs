//! Child process lifetime and stream plumbing.
//!
//! Owns spawning, stdin writes, signal delivery, and a single finite event
//! stream per child: framed stdout lines, raw stderr chunks, and exactly one
//! `Exit`. Lines are not parsed here; translation is the adapter's job.

use std::os::unix::process::ExitStatusExt as _;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWriteExt as _};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

/// Grace period between SIGTERM and SIGKILL when tearing a child down.
const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("child stdin is closed")]
    NotWritable,
    #[error("i/o error on child stdin: {0}")]
    Io(#[from] std::io::Error),
}

/// Termination signal kinds. Delivery is idempotent; signalling an exited
/// child is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Term,
    Kill,
}

/// One element of a child's event stream. The stream is finite: it ends
/// after `Exit`, which is emitted exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    StdoutLine(String),
    StderrChunk(String),
    Exit {
        code: Option<i32>,
        signal: Option<i32>,
    },
}

/// Splits a byte stream into `\n`-framed lines.
///
/// A partial trailing buffer is preserved across reads, so a line is never
/// split mid-way regardless of read chunking. `finish` drains the remainder
/// at EOF.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    /// Feed a chunk and return every newly completed line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            line.pop(); // the \n
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Drain the trailing partial line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.buf);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Handle to a spawned child: stdin writes, signals, and the event stream.
pub struct ProcessHandle {
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    events: Option<mpsc::UnboundedReceiver<ProcessEvent>>,
    exited: Arc<AtomicBool>,
}

/// Spawn a child with piped stdio and start its reader tasks.
///
/// Returns as soon as the spawn succeeds. Fails with [`ProcessError::Spawn`]
/// when the binary is missing, the cwd is invalid, or the pipes cannot be
/// created.
pub fn start(
    command: &str,
    args: &[String],
    cwd: &Path,
    env: &[(String, String)],
) -> Result<ProcessHandle, ProcessError> {
    if !cwd.is_dir() {
        return Err(ProcessError::Spawn {
            command: command.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("working directory does not exist: {}", cwd.display()),
            ),
        });
    }

    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(cwd)
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
        command: command.to_string(),
        source,
    })?;

    let missing_pipe = |name: &str| ProcessError::Spawn {
        command: command.to_string(),
        source: std::io::Error::other(format!("{name} pipe was not created")),
    };
    let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
    let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
    let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;

    let (tx, rx) = mpsc::unbounded_channel();
    let exited = Arc::new(AtomicBool::new(false));
    let pid = child.id();

    tokio::spawn(reap(child, stdout, stderr, tx, Arc::clone(&exited), pid));

    Ok(ProcessHandle {
        pid,
        stdin: Some(stdin),
        events: Some(rx),
        exited,
    })
}

impl ProcessHandle {
    /// Append bytes to the child's stdin.
    pub async fn write(&mut self, bytes: &[u8]) -> Result<(), ProcessError> {
        let stdin = self.stdin.as_mut().ok_or(ProcessError::NotWritable)?;
        stdin.write_all(bytes).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin, signalling EOF to the child.
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Deliver a termination signal. No-op after exit; safe to call twice.
    pub fn signal(&self, kind: Signal) {
        if self.exited.load(Ordering::SeqCst) {
            return;
        }
        signal_pid(self.pid, kind);
    }

    /// Take the event stream. Finite, ends after `Exit`; not restartable.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<ProcessEvent>> {
        self.events.take()
    }

    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Drain both pipes, then wait for the child and emit the single `Exit`.
///
/// On a reader I/O error the child is signalled `term`, then `kill` after
/// the grace period.
async fn reap(
    mut child: Child,
    stdout: impl AsyncRead + Unpin + Send + 'static,
    stderr: impl AsyncRead + Unpin + Send + 'static,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
) {
    let (out_res, err_res) = tokio::join!(
        read_stdout_lines(stdout, tx.clone()),
        read_stderr_chunks(stderr, tx.clone()),
    );

    if out_res.is_err() || err_res.is_err() {
        signal_pid(pid, Signal::Term);
        let grace = tokio::time::sleep(KILL_GRACE);
        tokio::select! {
            _ = child.wait() => {}
            () = grace => signal_pid(pid, Signal::Kill),
        }
    }

    let status = child.wait().await;
    exited.store(true, Ordering::SeqCst);
    let (code, signal) = match status {
        Ok(s) => (s.code(), s.signal()),
        Err(_) => (None, None),
    };
    let _ = tx.send(ProcessEvent::Exit { code, signal });
}

async fn read_stdout_lines(
    mut stdout: impl AsyncRead + Unpin,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) -> std::io::Result<()> {
    let mut framer = LineFramer::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = stdout.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        for line in framer.push(&buf[..n]) {
            if tx.send(ProcessEvent::StdoutLine(line)).is_err() {
                return Ok(());
            }
        }
    }
    if let Some(rest) = framer.finish() {
        let _ = tx.send(ProcessEvent::StdoutLine(rest));
    }
    Ok(())
}

async fn read_stderr_chunks(
    mut stderr: impl AsyncRead + Unpin,
    tx: mpsc::UnboundedSender<ProcessEvent>,
) -> std::io::Result<()> {
    let mut buf = [0u8; 8192];
    loop {
        let n = stderr.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
        if tx.send(ProcessEvent::StderrChunk(chunk)).is_err() {
            return Ok(());
        }
    }
}

fn signal_pid(pid: Option<u32>, kind: Signal) {
    let Some(pid) = pid else { return };
    let sig = match kind {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    // SAFETY: kill(2) with a known pid; ESRCH after exit is ignored.
    unsafe {
        libc::kill(pid.cast_signed(), sig);
    }
}
