//! Claude Code adapter: `claude -p` with bidirectional stream-json.
//!
//! Each request spawns one `claude` subprocess, writes the user message to
//! its stdin, and translates the NDJSON frames it prints into canonical
//! events. Follow-up requests resume the same claude-native session via
//! `--resume`.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
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
pub struct ClaudeAdapter;

const FEATURES: AdapterFeatures = AdapterFeatures {
    streaming: true,
    tools: true,
    pause_resume: true,
    system_prompt: true,
};

impl Adapter for ClaudeAdapter {
    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            id: "claude",
            name: "Claude Code",
            features: FEATURES,
        }
    }

    fn is_available(&self) -> bool {
        binary_on_path("claude")
    }

    fn start(&self, options: StartOptions) -> Result<Session, AdapterError> {
        if !self.is_available() {
            return Err(AdapterError::Unavailable("claude".to_string()));
        }
        let backend = ClaudeBackend {
            cwd: options.cwd.clone(),
            model: options.model.clone(),
            system_prompt: options.system_prompt.clone(),
            allowed_tools: options.allowed_tools.clone(),
            extra_args: options.extra_args.clone(),
            resume: None,
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

struct ClaudeBackend {
    cwd: PathBuf,
    model: Option<String>,
    system_prompt: Option<String>,
    allowed_tools: Vec<String>,
    extra_args: Vec<String>,
    /// Claude-native session id, captured from `init` for follow-ups.
    resume: Option<String>,
}

impl ClaudeBackend {
    fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--input-format".to_string(),
            "stream-json".to_string(),
        ];
        if let Some(ref model) = self.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(ref system_prompt) = self.system_prompt {
            args.push("--append-system-prompt".to_string());
            args.push(system_prompt.clone());
        }
        if !self.allowed_tools.is_empty() {
            args.push("--allowedTools".to_string());
            args.push(self.allowed_tools.join(","));
        }
        if let Some(ref resume) = self.resume {
            args.push("--resume".to_string());
            args.push(resume.clone());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

impl Backend for ClaudeBackend {
    async fn run_request(
        &mut self,
        prompt: String,
        emit: EventSink,
        cancel: CancellationToken,
    ) -> Result<(), QueryError> {
        let args = self.build_args();
        let mut handle = process::start("claude", &args, &self.cwd, &[])
            .map_err(|e| QueryError::new(e.to_string()))?;

        let message = user_message(&prompt).map_err(|e| QueryError::new(e.to_string()))?;
        handle
            .write(format!("{message}\n").as_bytes())
            .await
            .map_err(|e| QueryError::new(e.to_string()))?;
        handle.close_stdin();

        let mut translator = Translator::default();
        let outcome = pump_process(&mut handle, &cancel, |line| {
            match parse_frame(&line) {
                Ok(Some(frame)) => {
                    for event in translator.translate(frame, Instant::now()) {
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
        if !translator.result_seen {
            let stderr = outcome.stderr_tail.trim();
            let code = outcome
                .exit_code
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(QueryError::new(if stderr.is_empty() {
                format!("claude exited ({code}) without a result")
            } else {
                format!("claude exited ({code}): {stderr}")
            }));
        }

        if translator.claude_session_id.is_some() {
            self.resume = translator.claude_session_id.take();
        }
        Ok(())
    }
}

/// Serialize a user message for claude's stdin wire: one JSON object per line.
fn user_message(text: &str) -> serde_json::Result<String> {
    #[derive(Serialize)]
    struct Outbound<'a> {
        r#type: &'a str,
        message: OutboundBody<'a>,
    }
    #[derive(Serialize)]
    struct OutboundBody<'a> {
        role: &'a str,
        content: &'a str,
    }
    serde_json::to_string(&Outbound {
        r#type: "user",
        message: OutboundBody {
            role: "user",
            content: text,
        },
    })
}

// ── Inbound frames ──────────────────────────────────────────────────────

/// Top-level frame from claude's stream-json output.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ClaudeFrame {
    #[serde(rename = "system")]
    System(SystemFrame),
    #[serde(rename = "stream_event")]
    Stream(Box<StreamFrame>),
    #[serde(rename = "assistant")]
    Assistant(AssistantFrame),
    #[serde(rename = "user")]
    User(UserFrame),
    #[serde(rename = "result")]
    Result(ResultFrame),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "subtype")]
enum SystemFrame {
    #[serde(rename = "init")]
    Init {
        #[serde(default)]
        session_id: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamFrame {
    #[serde(default)]
    event: StreamEventBody,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct StreamEventBody {
    #[serde(default)]
    r#type: String,
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Clone, Deserialize)]
struct Delta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AssistantFrame {
    message: AssistantBody,
}

#[derive(Debug, Clone, Deserialize)]
struct AssistantBody {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    #[serde(rename = "thinking")]
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
struct UserFrame {
    #[serde(default)]
    tool_use_result: Option<ToolUseResult>,
}

#[derive(Debug, Clone, Deserialize)]
struct ToolUseResult {
    #[serde(default)]
    tool_use_id: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    content: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct ResultFrame {
    #[serde(default)]
    subtype: String,
    #[serde(default)]
    result: String,
    #[serde(default)]
    session_id: String,
    #[serde(default)]
    usage: Option<UsageBody>,
}

#[derive(Debug, Clone, Deserialize)]
struct UsageBody {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Parse a single NDJSON line. `Ok(None)` for empty lines; `Err` for
/// malformed JSON (the caller surfaces it, never crashes).
fn parse_frame(line: &str) -> serde_json::Result<Option<ClaudeFrame>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

// ── Translation ─────────────────────────────────────────────────────────

/// Per-request translation state: stream dedup, turn outcome, session id.
#[derive(Default)]
struct Translator {
    dedup: StreamDedup,
    result_seen: bool,
    turn_error: Option<String>,
    claude_session_id: Option<String>,
}

impl Translator {
    fn translate(&mut self, frame: ClaudeFrame, now: Instant) -> Vec<AgentEvent> {
        let mut out = Vec::new();
        match frame {
            ClaudeFrame::System(SystemFrame::Init { session_id }) => {
                if !session_id.is_empty() {
                    self.claude_session_id = Some(session_id);
                }
            }
            ClaudeFrame::System(SystemFrame::Other) => {}
            ClaudeFrame::Stream(stream) => self.translate_stream(&stream.event, now, &mut out),
            ClaudeFrame::Assistant(assistant) => {
                for block in assistant.message.content {
                    match block {
                        ContentBlock::Text { text } => {
                            if !self.dedup.should_suppress(&text, now) {
                                out.push(AgentEvent::Message {
                                    content: text,
                                    is_partial: false,
                                    timestamp: now_ms(),
                                });
                            }
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            out.push(AgentEvent::ToolUse {
                                tool_use_id: id,
                                tool: name,
                                input,
                                timestamp: now_ms(),
                            });
                        }
                        ContentBlock::Thinking { thinking } => {
                            out.push(AgentEvent::Thinking {
                                content: thinking,
                                timestamp: now_ms(),
                            });
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            ClaudeFrame::User(user) => {
                if let Some(result) = user.tool_use_result {
                    out.push(AgentEvent::ToolResult {
                        tool_use_id: result.tool_use_id,
                        output: result.content.map(render_tool_output).unwrap_or_default(),
                        is_error: result.is_error,
                        timestamp: now_ms(),
                    });
                }
            }
            ClaudeFrame::Result(result) => {
                self.result_seen = true;
                if !result.session_id.is_empty() {
                    self.claude_session_id = Some(result.session_id);
                }
                if result.subtype == "success" {
                    let usage = result
                        .usage
                        .map(|u| Usage::new(u.input_tokens, u.output_tokens))
                        .unwrap_or_default();
                    out.push(AgentEvent::Result {
                        content: result.result,
                        usage,
                        timestamp: now_ms(),
                    });
                } else {
                    self.turn_error = Some(if result.result.is_empty() {
                        format!("claude turn failed: {}", result.subtype)
                    } else {
                        result.result
                    });
                }
            }
        }
        out
    }

    fn translate_stream(
        &mut self,
        event: &StreamEventBody,
        now: Instant,
        out: &mut Vec<AgentEvent>,
    ) {
        match event.r#type.as_str() {
            "content_block_delta" => {
                let Some(delta) = &event.delta else { return };
                if let Some(text) = &delta.text {
                    self.dedup.push_delta(text);
                    out.push(AgentEvent::Message {
                        content: text.clone(),
                        is_partial: true,
                        timestamp: now_ms(),
                    });
                }
                if let Some(thinking) = &delta.thinking {
                    out.push(AgentEvent::Thinking {
                        content: thinking.clone(),
                        timestamp: now_ms(),
                    });
                }
            }
            "message_stop" => self.dedup.note_stream_end(now),
            _ => {}
        }
    }
}

/// Render a tool result payload as display text: strings pass through,
/// anything else stays JSON.
fn render_tool_output(content: Value) -> String {
    match content {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
