//! Canonical agent events and the routing envelope.
//!
//! Every adapter translates its native frames into [`AgentEvent`]; every
//! observer-facing wire shape is an [`EventEnvelope`]. Both are tagged sums
//! matched exhaustively at each boundary.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// Session status as observed over the wire.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    #[default]
    Idle,
    Starting,
    Running,
    Pausing,
    Paused,
    Stopping,
    StoppingAfterCurrent,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

/// Token usage reported at end of turn.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Error code attached to planned retry notifications.
pub const RETRY_CODE: &str = "RETRY";

/// A canonical agent event. Every variant carries a millisecond timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    #[serde(rename_all = "camelCase")]
    Message {
        content: String,
        /// True for streaming deltas; the final complete message is not
        /// re-emitted when it duplicates a just-finished stream.
        is_partial: bool,
        timestamp: u64,
    },
    Thinking {
        content: String,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    ToolUse {
        tool_use_id: String,
        tool: String,
        input: Value,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_use_id: String,
        output: String,
        is_error: bool,
        timestamp: u64,
    },
    Result {
        content: String,
        usage: Usage,
        timestamp: u64,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        fatal: bool,
        timestamp: u64,
    },
    Status {
        status: SessionStatus,
        timestamp: u64,
    },
}

impl AgentEvent {
    pub fn timestamp(&self) -> u64 {
        match self {
            Self::Message { timestamp, .. }
            | Self::Thinking { timestamp, .. }
            | Self::ToolUse { timestamp, .. }
            | Self::ToolResult { timestamp, .. }
            | Self::Result { timestamp, .. }
            | Self::Error { timestamp, .. }
            | Self::Status { timestamp, .. } => *timestamp,
        }
    }

    /// A non-fatal retry notification preceding the next attempt.
    pub fn retry_notice(message: String) -> Self {
        Self::Error {
            message,
            code: Some(RETRY_CODE.to_string()),
            fatal: false,
            timestamp: now_ms(),
        }
    }

    pub fn fatal_error(message: String) -> Self {
        Self::Error {
            message,
            code: None,
            fatal: true,
            timestamp: now_ms(),
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        Self::Status {
            status,
            timestamp: now_ms(),
        }
    }

    pub fn is_fatal_error(&self) -> bool {
        matches!(self, Self::Error { fatal: true, .. })
    }
}

/// Origin of an envelope: the orchestrator's workers or the task chat surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventSource {
    #[serde(rename = "ralph")]
    Ralph,
    #[serde(rename = "task-chat")]
    TaskChat,
}

/// Routing-annotated wrapper around a single [`AgentEvent`].
///
/// `event_index` is assigned at persistence time and is the replay cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub source: EventSource,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
    pub event: AgentEvent,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_index: Option<u64>,
}

/// Envelope wire tag.
pub const ENVELOPE_TYPE: &str = "agent:event";

impl EventEnvelope {
    pub fn new(
        source: EventSource,
        instance_id: impl Into<String>,
        workspace_id: Option<String>,
        event: AgentEvent,
    ) -> Self {
        let timestamp = event.timestamp();
        Self {
            kind: ENVELOPE_TYPE.to_string(),
            source,
            instance_id: instance_id.into(),
            workspace_id,
            event,
            timestamp,
            event_index: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_wire_field_names() {
        let event = AgentEvent::Message {
            content: "hi".into(),
            is_partial: true,
            timestamp: 42,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["isPartial"], true);
        assert_eq!(json["timestamp"], 42);
    }

    #[test]
    fn tool_events_share_the_tool_use_id_key() {
        let use_event = AgentEvent::ToolUse {
            tool_use_id: "tu-1".into(),
            tool: "bash".into(),
            input: serde_json::json!({"command": "ls"}),
            timestamp: 1,
        };
        let result_event = AgentEvent::ToolResult {
            tool_use_id: "tu-1".into(),
            output: "ok".into(),
            is_error: false,
            timestamp: 2,
        };
        let u = serde_json::to_value(&use_event).unwrap();
        let r = serde_json::to_value(&result_event).unwrap();
        assert_eq!(u["toolUseId"], r["toolUseId"]);
    }

    #[test]
    fn status_uses_kebab_case() {
        let json = serde_json::to_value(SessionStatus::StoppingAfterCurrent).unwrap();
        assert_eq!(json, "stopping-after-current");
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = EventEnvelope::new(
            EventSource::Ralph,
            "homer",
            Some("ws-1".into()),
            AgentEvent::status(SessionStatus::Running),
        );
        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);

        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "agent:event");
        assert_eq!(value["source"], "ralph");
        assert_eq!(value["instanceId"], "homer");
        // Unassigned index stays off the wire
        assert!(value.get("eventIndex").is_none());
    }

    #[test]
    #[allow(clippy::panic)]
    fn retry_notice_is_non_fatal() {
        let event = AgentEvent::retry_notice("Retrying in 0 seconds".into());
        let AgentEvent::Error { code, fatal, .. } = &event else {
            panic!("expected error event");
        };
        assert_eq!(code.as_deref(), Some(RETRY_CODE));
        assert!(!fatal);
        assert!(!event.is_fatal_error());
    }
}
