//! `ralph replay <file>`: deterministic re-emission of a persisted event
//! log. Output depends only on the file contents, so two replays of the same
//! log are byte-identical.

use std::io::Write;
use std::path::Path;

use anyhow::{Context as _, Result, bail};

use crate::event::{AgentEvent, EventEnvelope};

#[derive(Debug)]
pub struct ReplayStats {
    pub events: usize,
    pub last_index: Option<u64>,
}

/// Replay a session-store events file (`.jsonl`, one envelope per line).
///
/// Validates that event indices are strictly increasing; a malformed line or
/// a regressed index aborts the replay.
pub fn replay(file: &Path, json: bool, out: &mut impl Write) -> Result<ReplayStats> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;

    let mut last_index: Option<u64> = None;
    let mut events = 0usize;

    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let envelope: EventEnvelope = serde_json::from_str(line)
            .with_context(|| format!("malformed envelope at line {}", line_no + 1))?;

        if let (Some(prev), Some(index)) = (last_index, envelope.event_index)
            && index <= prev
        {
            bail!(
                "event index regressed at line {} ({prev} then {index})",
                line_no + 1
            );
        }
        if envelope.event_index.is_some() {
            last_index = envelope.event_index;
        }

        if json {
            writeln!(out, "{}", serde_json::to_string(&envelope)?)?;
        } else {
            writeln!(out, "{}", describe(&envelope))?;
        }
        events += 1;
    }

    Ok(ReplayStats { events, last_index })
}

fn describe(envelope: &EventEnvelope) -> String {
    let index = envelope
        .event_index
        .map_or_else(|| "-".to_string(), |i| i.to_string());
    let instance = &envelope.instance_id;
    let body = match &envelope.event {
        AgentEvent::Message {
            content,
            is_partial,
            ..
        } => {
            let marker = if *is_partial { "…" } else { "" };
            format!("message{marker}: {content}")
        }
        AgentEvent::Thinking { content, .. } => format!("thinking: {content}"),
        AgentEvent::ToolUse {
            tool, tool_use_id, ..
        } => format!("tool_use {tool} ({tool_use_id})"),
        AgentEvent::ToolResult {
            tool_use_id,
            is_error,
            ..
        } => {
            let suffix = if *is_error { " [error]" } else { "" };
            format!("tool_result ({tool_use_id}){suffix}")
        }
        AgentEvent::Result { content, usage, .. } => {
            format!("result [{} tokens]: {content}", usage.total_tokens)
        }
        AgentEvent::Error {
            message,
            fatal,
            code,
            ..
        } => {
            let code = code.as_deref().unwrap_or("-");
            let kind = if *fatal { "fatal" } else { "non-fatal" };
            format!("error [{kind}/{code}]: {message}")
        }
        AgentEvent::Status { status, .. } => format!("status: {status:?}"),
    };
    format!("#{index} {instance} {body}")
}
