//! Codex adapter: `codex exec --json`.
//!
//! Codex prints one JSON object per line with the payload under `msg`.
//! Shell executions map to tool events under the fixed tool name `shell`;
//! pause/resume is not supported by the codex CLI.

use std::path::PathBuf;
use std::time::Instant;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::event::{AgentEvent, Usage, now_ms};
use crate::process;

use super::{
    Adapter, AdapterError, AdapterFeatures, AdapterInfo, Backend, EventSink, QueryError, Session,
    SessionLoopConfig, StartOptions, StreamDedup, binary_on_path, opaque_stderr, pump_process,
    spawn_session,
};

#[derive(Debug, Clone)]
pub struct CodexAdapter;

const FEATURES: AdapterFeatures = AdapterFeatures {
    streaming: true,
    tools: true,
    pause_resume: false,
    system_prompt: false,
};

impl Adapter for CodexAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "codex",
            name: "Codex CLI",
            features: FEATURES,
        }
    }

    fn is_available(&self) -> bool {
        binary_on_path("codex")
    }

    fn start(&self, options: StartOptions) -> Result<Session, AdapterError> {
        if !self.is_available() {
            return Err(AdapterError::Unavailable("codex".to_string()));
        }
        let backend = CodexBackend {
            cwd: options.cwd.clone(),
            model: options.model.clone(),
            extra_args: options.extra_args.clone(),
        };
        Ok(spawn_session(
            backend,
            FEATURES,
            SessionLoopConfig {
                retry: options.retry,
                initial_prompt: options.prompt,
                keep_alive: options.keep_alive,
            },
            options.session_id,
        ))
    }
}

struct CodexBackend {
    cwd: PathBuf,
    model: Option<String>,
    extra_args: Vec<String>,
}

impl CodexBackend {
    fn build_args(&self, prompt: &str) -> Vec<String> {
        let mut args = vec!["exec".to_string(), "--json".to_string()];
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args.push(prompt.to_string());
        args
    }
}

impl Backend for CodexBackend {
    async fn run_request(
        &mut self,
        prompt: String,
        emit: EventSink,
        cancel: CancellationToken,
    ) -> Result<(), QueryError> {
        let args = self.build_args(&prompt);
        let mut handle = process::start("codex", &args, &self.cwd, &[])
            .map_err(|e| QueryError::new(e.to_string()))?;

        let mut translator = CodexTranslator::default();
        let outcome = pump_process(&mut handle, &cancel, |line| {
            match parse_line(&line) {
                Ok(Some(msg)) => {
                    for event in translator.translate(msg, Instant::now()) {
                        emit.emit(event);
                    }
                }
                Ok(None) => {}
                Err(_) => emit.emit(opaque_stderr(line)),
            }
        })
        .await;

        if outcome.cancelled {
            return Err(QueryError::new("request cancelled"));
        }
        if let Some(error) = translator.turn_error.take() {
            return Err(QueryError::new(error));
        }
        if !translator.completed {
            let stderr = outcome.stderr_tail.trim();
            let code = outcome
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(QueryError::new(if stderr.is_empty() {
                format!("codex exited ({code}) without completing the task")
            } else {
                format!("codex exited ({code}): {stderr}")
            }));
        }
        Ok(())
    }
}

// ── Inbound frames ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct CodexLine {
    msg: CodexMsg,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CodexMsg {
    AgentMessageDelta {
        delta: String,
    },
    AgentMessage {
        message: String,
    },
    AgentReasoning {
        text: String,
    },
    ExecCommandBegin {
        call_id: String,
        #[serde(default)]
        command: Value,
    },
    ExecCommandEnd {
        call_id: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        exit_code: i64,
    },
    TokenCount {
        #[serde(default)]
        input_tokens: u64,
        #[serde(default)]
        output_tokens: u64,
    },
    TaskComplete {
        #[serde(default)]
        last_agent_message: Option<String>,
    },
    Error {
        message: String,
    },
    #[serde(other)]
    Other,
}

fn parse_line(line: &str) -> serde_json::Result<Option<CodexMsg>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str::<CodexLine>(line).map(|l| Some(l.msg))
}

// ── Translation ─────────────────────────────────────────────────────────

#[derive(Default)]
struct CodexTranslator {
    dedup: StreamDedup,
    usage: Usage,
    completed: bool,
    turn_error: Option<String>,
}

impl CodexTranslator {
    fn translate(&mut self, msg: CodexMsg, now: Instant) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        match msg {
            CodexMsg::AgentMessageDelta { delta } => {
                self.dedup.push_delta(&delta);
                out.push(AgentEvent::Message {
                    content: delta,
                    is_partial: true,
                    timestamp: now_ms(),
                });
            }
            CodexMsg::AgentMessage { message } => {
                self.dedup.note_stream_end(now);
                if !self.dedup.should_suppress(&message, now) {
                    out.push(AgentEvent::Message {
                        content: message,
                        is_partial: false,
                        timestamp: now_ms(),
                    });
                }
            }
            CodexMsg::AgentReasoning { text } => {
                out.push(AgentEvent::Thinking {
                    content: text,
                    timestamp: now_ms(),
                });
            }
            CodexMsg::ExecCommandBegin { call_id, command } => {
                out.push(AgentEvent::ToolUse {
                    tool_use_id: call_id,
                    tool: "shell".to_string(),
                    input: command,
                    timestamp: now_ms(),
                });
            }
            CodexMsg::ExecCommandEnd {
                call_id,
                stdout,
                stderr,
                exit_code,
            } => {
                let is_error = exit_code != 0;
                out.push(AgentEvent::ToolResult {
                    tool_use_id: call_id,
                    output: if is_error && stdout.is_empty() {
                        stderr
                    } else {
                        stdout
                    },
                    is_error,
                    timestamp: now_ms(),
                });
            }
            CodexMsg::TokenCount {
                input_tokens,
                output_tokens,
            } => {
                self.usage = Usage::new(input_tokens, output_tokens);
            }
            CodexMsg::TaskComplete { last_agent_message } => {
                self.completed = true;
                out.push(AgentEvent::Result {
                    content: last_agent_message.unwrap_or_default(),
                    usage: self.usage,
                    timestamp: now_ms(),
                });
            }
            CodexMsg::Error { message } => {
                self.turn_error = Some(message);
            }
            CodexMsg::Other => {}
        }
        out
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn msg(line: &str) -> CodexMsg {
        parse_line(line).unwrap().unwrap()
    }

    #[test]
    fn deltas_then_final_message_is_deduplicated() {
        let mut translator = CodexTranslator::default();
        let t0 = Instant::now();

        translator.translate(
            msg(r#"{"id":"0","msg":{"type":"agent_message_delta","delta":"par"}}"#),
            t0,
        );
        translator.translate(
            msg(r#"{"id":"0","msg":{"type":"agent_message_delta","delta":"tial"}}"#),
            t0,
        );
        let events = translator.translate(
            msg(r#"{"id":"0","msg":{"type":"agent_message","message":"partial"}}"#),
            t0,
        );
        assert!(events.is_empty(), "duplicate final should be suppressed");
    }

    #[test]
    fn exec_commands_become_shell_tool_events() {
        let mut translator = CodexTranslator::default();
        let now = Instant::now();

        let begin = translator.translate(
            msg(
                r#"{"id":"0","msg":{"type":"exec_command_begin","call_id":"c1","command":["ls","-la"]}}"#,
            ),
            now,
        );
        let AgentEvent::ToolUse {
            tool_use_id, tool, ..
        } = &begin[0]
        else {
            unreachable!()
        };
        assert_eq!(tool_use_id, "c1");
        assert_eq!(tool, "shell");

        let end = translator.translate(
            msg(
                r#"{"id":"0","msg":{"type":"exec_command_end","call_id":"c1","stdout":"file.txt\n","exit_code":0}}"#,
            ),
            now,
        );
        let AgentEvent::ToolResult {
            tool_use_id,
            is_error,
            ..
        } = &end[0]
        else {
            unreachable!()
        };
        assert_eq!(tool_use_id, "c1");
        assert!(!is_error);
    }

    #[test]
    fn failing_command_reports_stderr() {
        let mut translator = CodexTranslator::default();
        let events = translator.translate(
            msg(
                r#"{"id":"0","msg":{"type":"exec_command_end","call_id":"c2","stderr":"no such file","exit_code":1}}"#,
            ),
            Instant::now(),
        );
        let AgentEvent::ToolResult {
            output, is_error, ..
        } = &events[0]
        else {
            unreachable!()
        };
        assert!(is_error);
        assert_eq!(output, "no such file");
    }

    #[test]
    fn task_complete_carries_accumulated_usage() {
        let mut translator = CodexTranslator::default();
        let now = Instant::now();
        translator.translate(
            msg(r#"{"id":"0","msg":{"type":"token_count","input_tokens":30,"output_tokens":12}}"#),
            now,
        );
        let events = translator.translate(
            msg(r#"{"id":"0","msg":{"type":"task_complete","last_agent_message":"all done"}}"#),
            now,
        );
        let AgentEvent::Result { content, usage, .. } = &events[0] else {
            unreachable!()
        };
        assert_eq!(content, "all done");
        assert_eq!(usage.total_tokens, 42);
        assert!(translator.completed);
    }

    #[test]
    fn errors_set_the_turn_error() {
        let mut translator = CodexTranslator::default();
        let events = translator.translate(
            msg(r#"{"id":"0","msg":{"type":"error","message":"rate_limit exceeded"}}"#),
            Instant::now(),
        );
        assert!(events.is_empty());
        assert_eq!(translator.turn_error.as_deref(), Some("rate_limit exceeded"));
    }

    #[test]
    fn unknown_msg_types_are_ignored() {
        let parsed = parse_line(r#"{"id":"0","msg":{"type":"session_configured","weird":true}}"#);
        assert!(matches!(parsed, Ok(Some(CodexMsg::Other))));
    }

    #[test]
    fn prompt_is_the_trailing_argument() {
        let backend = CodexBackend {
            cwd: PathBuf::from("/tmp"),
            model: Some("o4-mini".into()),
            extra_args: vec![],
        };
        let args = backend.build_args("fix the bug");
        assert_eq!(args[0], "exec");
        assert!(args.contains(&"--json".to_string()));
        assert_eq!(args.last().unwrap(), "fix the bug");
    }
}
