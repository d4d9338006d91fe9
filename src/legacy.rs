//! Legacy wire-shape translation.
//!
//! Older observers speak per-source message shapes (`ralph:event`,
//! `task-chat:message`, `task-chat:chunk`, ...). Inbound messages are
//! normalised to canonical envelopes before routing; outbound, the hub emits
//! both the canonical envelope and its legacy mirror for the duration of the
//! compatibility window. Messages with no `type` or no event payload are
//! dropped silently (`None`).

use serde_json::{Value, json};

use crate::event::{AgentEvent, EventEnvelope, EventSource, now_ms};
use crate::event::SessionStatus;

/// Map a legacy status string to canonical.
///
/// `idle→idle`, `processing|streaming→running`, `error→stopped`; anything
/// unknown falls back to `idle`.
pub fn map_legacy_status(status: &str) -> SessionStatus {
    match status {
        "processing" | "streaming" => SessionStatus::Running,
        "error" => SessionStatus::Stopped,
        _ => SessionStatus::Idle,
    }
}

/// Representative legacy name for a canonical status (the reverse of
/// [`map_legacy_status`] where one exists).
pub fn legacy_status_name(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Running => "processing",
        SessionStatus::Stopped => "error",
        _ => "idle",
    }
}

/// Normalise an inbound message (canonical or legacy) to a canonical
/// envelope. `None` means the message carries no envelope: either it is a
/// control message the caller handles separately, or it is malformed and is
/// dropped silently.
pub fn to_canonical(msg: &Value) -> Option<EventEnvelope> {
    let kind = msg.get("type")?.as_str()?;
    let timestamp = msg
        .get("timestamp")
        .and_then(Value::as_u64)
        .unwrap_or_else(now_ms);

    match kind {
        "agent:event" => serde_json::from_value(msg.clone()).ok(),
        "ralph:event" => wrap(EventSource::Ralph, msg, event_payload(msg, timestamp)?),
        "task-chat:event" => wrap(EventSource::TaskChat, msg, event_payload(msg, timestamp)?),
        "task-chat:message" => {
            let content = string_field(msg, &["message", "content"])?;
            wrap(
                EventSource::TaskChat,
                msg,
                AgentEvent::Message {
                    content,
                    is_partial: false,
                    timestamp,
                },
            )
        }
        "task-chat:chunk" => {
            let content = string_field(msg, &["chunk", "content"])?;
            wrap(
                EventSource::TaskChat,
                msg,
                AgentEvent::Message {
                    content,
                    is_partial: true,
                    timestamp,
                },
            )
        }
        "task-chat:status" => {
            let status = string_field(msg, &["status"])?;
            wrap(
                EventSource::TaskChat,
                msg,
                AgentEvent::Status {
                    status: map_legacy_status(&status),
                    timestamp,
                },
            )
        }
        "task-chat:error" => {
            let message = string_field(msg, &["error", "message"])?;
            wrap(
                EventSource::TaskChat,
                msg,
                AgentEvent::Error {
                    message,
                    code: msg
                        .get("code")
                        .and_then(Value::as_str)
                        .map(String::from),
                    fatal: true,
                    timestamp,
                },
            )
        }
        // An in-progress tool update and the initial tool use translate to
        // the same canonical event; observers don't distinguish them.
        "task-chat:tool_use" | "task-chat:tool_update" => {
            let tool = string_field(msg, &["tool", "name"])?;
            wrap(
                EventSource::TaskChat,
                msg,
                AgentEvent::ToolUse {
                    tool_use_id: string_field(msg, &["toolUseId", "id"]).unwrap_or_default(),
                    tool,
                    input: msg.get("input").cloned().unwrap_or(Value::Null),
                    timestamp,
                },
            )
        }
        "task-chat:tool_result" => {
            let tool_use_id = string_field(msg, &["toolUseId", "id"])?;
            wrap(
                EventSource::TaskChat,
                msg,
                AgentEvent::ToolResult {
                    tool_use_id,
                    output: string_field(msg, &["output"]).unwrap_or_default(),
                    is_error: msg
                        .get("isError")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                    timestamp,
                },
            )
        }
        _ => None,
    }
}

/// Legacy mirror of a canonical envelope, emitted alongside the canonical
/// shape during the compatibility window. `None` when the event has no
/// legacy equivalent for its source.
pub fn to_legacy(envelope: &EventEnvelope) -> Option<Value> {
    match envelope.source {
        EventSource::Ralph => {
            let mut out = json!({
                "type": "ralph:event",
                "instanceId": envelope.instance_id,
                "event": envelope.event,
                "timestamp": envelope.timestamp,
            });
            if let Some(ref workspace) = envelope.workspace_id {
                out["workspaceId"] = json!(workspace);
            }
            if let Some(index) = envelope.event_index {
                out["eventIndex"] = json!(index);
            }
            Some(out)
        }
        EventSource::TaskChat => task_chat_legacy(envelope),
    }
}

fn task_chat_legacy(envelope: &EventEnvelope) -> Option<Value> {
    let base = |kind: &str| {
        json!({
            "type": kind,
            "instanceId": envelope.instance_id,
            "timestamp": envelope.timestamp,
        })
    };
    let mut out = match &envelope.event {
        AgentEvent::Message {
            content,
            is_partial: true,
            ..
        } => {
            let mut v = base("task-chat:chunk");
            v["chunk"] = json!(content);
            v
        }
        AgentEvent::Message { content, .. } => {
            let mut v = base("task-chat:message");
            v["message"] = json!(content);
            v
        }
        AgentEvent::Status { status, .. } => {
            let mut v = base("task-chat:status");
            v["status"] = json!(legacy_status_name(*status));
            v
        }
        AgentEvent::Error { message, code, .. } => {
            let mut v = base("task-chat:error");
            v["error"] = json!(message);
            if let Some(code) = code {
                v["code"] = json!(code);
            }
            v
        }
        AgentEvent::ToolUse {
            tool_use_id,
            tool,
            input,
            ..
        } => {
            let mut v = base("task-chat:tool_use");
            v["toolUseId"] = json!(tool_use_id);
            v["tool"] = json!(tool);
            v["input"] = input.clone();
            v
        }
        AgentEvent::ToolResult {
            tool_use_id,
            output,
            is_error,
            ..
        } => {
            let mut v = base("task-chat:tool_result");
            v["toolUseId"] = json!(tool_use_id);
            v["output"] = json!(output);
            v["isError"] = json!(is_error);
            v
        }
        // Thinking and Result have no task-chat legacy shape
        AgentEvent::Thinking { .. } | AgentEvent::Result { .. } => return None,
    };
    if let Some(index) = envelope.event_index {
        out["eventIndex"] = json!(index);
    }
    Some(out)
}

fn wrap(source: EventSource, msg: &Value, event: AgentEvent) -> Option<EventEnvelope> {
    let instance_id = msg.get("instanceId").and_then(Value::as_str)?;
    let workspace_id = msg
        .get("workspaceId")
        .and_then(Value::as_str)
        .map(String::from);
    let mut envelope = EventEnvelope::new(source, instance_id, workspace_id, event);
    if let Some(index) = msg.get("eventIndex").and_then(Value::as_u64) {
        envelope.event_index = Some(index);
    }
    Some(envelope)
}

/// Extract a legacy `event` payload, injecting the outer timestamp when the
/// inner object lacks one.
fn event_payload(msg: &Value, timestamp: u64) -> Option<AgentEvent> {
    let mut event = msg.get("event")?.clone();
    if let Value::Object(ref mut map) = event
        && !map.contains_key("timestamp")
    {
        map.insert("timestamp".to_string(), json!(timestamp));
    }
    serde_json::from_value(event).ok()
}

fn string_field(msg: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| msg.get(*k).and_then(Value::as_str))
        .map(String::from)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn round_trip(legacy: Value) {
        let envelope = to_canonical(&legacy).unwrap();
        let back = to_legacy(&envelope).unwrap();
        assert_eq!(back, legacy, "round trip changed the message");
    }

    #[test]
    fn message_round_trips() {
        round_trip(json!({
            "type": "task-chat:message",
            "instanceId": "chat-1",
            "message": "hello there",
            "timestamp": 1000,
        }));
    }

    #[test]
    fn chunk_round_trips() {
        round_trip(json!({
            "type": "task-chat:chunk",
            "instanceId": "chat-1",
            "chunk": "hel",
            "timestamp": 1001,
        }));
    }

    #[test]
    fn status_round_trips_for_representative_names() {
        round_trip(json!({
            "type": "task-chat:status",
            "instanceId": "chat-1",
            "status": "idle",
            "timestamp": 1002,
        }));
        round_trip(json!({
            "type": "task-chat:status",
            "instanceId": "chat-1",
            "status": "processing",
            "timestamp": 1003,
        }));
    }

    #[test]
    fn error_round_trips() {
        round_trip(json!({
            "type": "task-chat:error",
            "instanceId": "chat-1",
            "error": "it broke",
            "timestamp": 1004,
        }));
    }

    #[test]
    fn tool_use_round_trips() {
        round_trip(json!({
            "type": "task-chat:tool_use",
            "instanceId": "chat-1",
            "toolUseId": "tu-1",
            "tool": "bash",
            "input": {"command": "ls"},
            "timestamp": 1005,
        }));
    }

    #[test]
    fn tool_result_round_trips() {
        round_trip(json!({
            "type": "task-chat:tool_result",
            "instanceId": "chat-1",
            "toolUseId": "tu-1",
            "output": "done",
            "isError": false,
            "timestamp": 1006,
        }));
    }

    #[test]
    fn ralph_event_round_trips() {
        round_trip(json!({
            "type": "ralph:event",
            "instanceId": "homer",
            "workspaceId": "ws-1",
            "event": {
                "type": "message",
                "content": "working on it",
                "isPartial": false,
                "timestamp": 1007,
            },
            "timestamp": 1007,
            "eventIndex": 12,
        }));
    }

    #[test]
    fn streaming_status_normalises_to_running() {
        let envelope = to_canonical(&json!({
            "type": "task-chat:status",
            "instanceId": "chat-1",
            "status": "streaming",
        }))
        .unwrap();
        assert!(matches!(
            envelope.event,
            AgentEvent::Status {
                status: SessionStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn unknown_status_falls_back_to_idle() {
        assert_eq!(map_legacy_status("sparkling"), SessionStatus::Idle);
        assert_eq!(map_legacy_status("error"), SessionStatus::Stopped);
    }

    #[test]
    fn tool_update_translates_like_tool_use() {
        let update = to_canonical(&json!({
            "type": "task-chat:tool_update",
            "instanceId": "chat-1",
            "toolUseId": "tu-2",
            "tool": "edit",
            "input": {},
            "timestamp": 5,
        }))
        .unwrap();
        assert!(matches!(update.event, AgentEvent::ToolUse { .. }));
    }

    #[test]
    fn canonical_envelopes_pass_through() {
        let envelope = EventEnvelope::new(
            EventSource::Ralph,
            "homer",
            None,
            AgentEvent::status(SessionStatus::Running),
        );
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(to_canonical(&value), Some(envelope));
    }

    #[test]
    fn malformed_messages_are_dropped() {
        // No type
        assert!(to_canonical(&json!({"event": {}})).is_none());
        // Unknown type
        assert!(to_canonical(&json!({"type": "task-chat:telepathy"})).is_none());
        // No event payload
        assert!(to_canonical(&json!({"type": "ralph:event", "instanceId": "h"})).is_none());
        // No instance id
        assert!(to_canonical(&json!({"type": "task-chat:message", "message": "hi"})).is_none());
        // Not even an object
        assert!(to_canonical(&json!("ping")).is_none());
    }

    #[test]
    fn thinking_has_no_task_chat_mirror() {
        let envelope = EventEnvelope::new(
            EventSource::TaskChat,
            "chat-1",
            None,
            AgentEvent::Thinking {
                content: "hmm".into(),
                timestamp: 1,
            },
        );
        assert!(to_legacy(&envelope).is_none());
    }

    #[test]
    fn ralph_mirror_keeps_every_event_kind() {
        let envelope = EventEnvelope::new(
            EventSource::Ralph,
            "homer",
            None,
            AgentEvent::Thinking {
                content: "hmm".into(),
                timestamp: 1,
            },
        );
        let legacy = to_legacy(&envelope).unwrap();
        assert_eq!(legacy["type"], "ralph:event");
        assert_eq!(legacy["event"]["type"], "thinking");
    }
}
