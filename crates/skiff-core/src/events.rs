use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{PermissionRequestId, SessionId, StepId, SubagentId, ToolCallId, TurnId};
use crate::stream::{FinishReason, TokenUsage};

/// The published event envelope. `id` is the process-wide monotonic event id,
/// `seq` the per-session monotonic sequence; both are assigned at persist
/// time, before the event reaches any subscriber.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: i64,
    pub seq: i64,
    pub ts: f64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub session_id: SessionId,
    pub turn_id: Option<TurnId>,
    pub step_id: Option<StepId>,
    pub payload: Value,
}

impl EventEnvelope {
    /// Decode the payload into the typed event vocabulary. Unrecognized
    /// `type` strings come back as [`EventPayload::Unknown`] with the raw
    /// payload preserved.
    pub fn decode(&self) -> EventPayload {
        EventPayload::decode(&self.event_type, self.payload.clone())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    PermissionRequired,
    Running,
    Completed,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingStatus {
    Start,
    Delta,
    End,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubagentStatus {
    Start,
    End,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageDeltaPayload {
    pub role: String,
    pub message_id: crate::ids::MessageId,
    pub delta: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThinkingPayload {
    pub status: ThinkingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub input: Value,
    pub status: ToolCallStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permission_request_id: Option<PermissionRequestId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolResultPayload {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TerminalChunkPayload {
    pub tool_call_id: ToolCallId,
    pub stream: TerminalStream,
    pub text: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiffPayload {
    pub tool_call_id: ToolCallId,
    pub path: String,
    pub diff: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubagentPayload {
    pub parent_tool_call_id: ToolCallId,
    pub subagent_id: SubagentId,
    pub status: SubagentStatus,
    pub label: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubagentBlockPayload {
    pub parent_tool_call_id: ToolCallId,
    pub subagent_id: SubagentId,
    pub block: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FinalPayload {
    pub role: String,
    pub message_id: crate::ids::MessageId,
    pub text: String,
    pub finish_reason: FinishReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Typed event vocabulary. The wire envelope carries `type` as a sibling of
/// `payload`, so this enum encodes/decodes the pair rather than a single
/// tagged object.
#[derive(Clone, Debug)]
pub enum EventPayload {
    Status(StatusPayload),
    MessageDelta(MessageDeltaPayload),
    Thinking(ThinkingPayload),
    ToolCall(ToolCallPayload),
    ToolResult(ToolResultPayload),
    TerminalChunk(TerminalChunkPayload),
    Diff(DiffPayload),
    Subagent(SubagentPayload),
    SubagentBlock(SubagentBlockPayload),
    Final(FinalPayload),
    Error(ErrorPayload),
    Unknown { kind: String, payload: Value },
}

impl EventPayload {
    pub fn kind(&self) -> &str {
        match self {
            Self::Status(_) => "status",
            Self::MessageDelta(_) => "message_delta",
            Self::Thinking(_) => "thinking",
            Self::ToolCall(_) => "tool_call",
            Self::ToolResult(_) => "tool_result",
            Self::TerminalChunk(_) => "terminal_chunk",
            Self::Diff(_) => "diff",
            Self::Subagent(_) => "subagent",
            Self::SubagentBlock(_) => "subagent_block",
            Self::Final(_) => "final",
            Self::Error(_) => "error",
            Self::Unknown { kind, .. } => kind,
        }
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Status(p) => serde_json::to_value(p),
            Self::MessageDelta(p) => serde_json::to_value(p),
            Self::Thinking(p) => serde_json::to_value(p),
            Self::ToolCall(p) => serde_json::to_value(p),
            Self::ToolResult(p) => serde_json::to_value(p),
            Self::TerminalChunk(p) => serde_json::to_value(p),
            Self::Diff(p) => serde_json::to_value(p),
            Self::Subagent(p) => serde_json::to_value(p),
            Self::SubagentBlock(p) => serde_json::to_value(p),
            Self::Final(p) => serde_json::to_value(p),
            Self::Error(p) => serde_json::to_value(p),
            Self::Unknown { payload, .. } => Ok(payload.clone()),
        }
    }

    pub fn decode(kind: &str, payload: Value) -> Self {
        fn parse<T: serde::de::DeserializeOwned>(v: &Value) -> Option<T> {
            serde_json::from_value(v.clone()).ok()
        }

        let decoded = match kind {
            "status" => parse(&payload).map(Self::Status),
            "message_delta" => parse(&payload).map(Self::MessageDelta),
            "thinking" => parse(&payload).map(Self::Thinking),
            "tool_call" => parse(&payload).map(Self::ToolCall),
            "tool_result" => parse(&payload).map(Self::ToolResult),
            "terminal_chunk" => parse(&payload).map(Self::TerminalChunk),
            "diff" => parse(&payload).map(Self::Diff),
            "subagent" => parse(&payload).map(Self::Subagent),
            "subagent_block" => parse(&payload).map(Self::SubagentBlock),
            "final" => parse(&payload).map(Self::Final),
            "error" => parse(&payload).map(Self::Error),
            _ => None,
        };

        decoded.unwrap_or(Self::Unknown {
            kind: kind.to_string(),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::MessageId;

    #[test]
    fn kind_strings() {
        let p = EventPayload::MessageDelta(MessageDeltaPayload {
            role: "assistant".into(),
            message_id: MessageId::new(),
            delta: "hi".into(),
        });
        assert_eq!(p.kind(), "message_delta");

        let p = EventPayload::Error(ErrorPayload {
            code: "cancelled".into(),
            message: "Run cancelled by user".into(),
        });
        assert_eq!(p.kind(), "error");
    }

    #[test]
    fn roundtrip_tool_call() {
        let p = EventPayload::ToolCall(ToolCallPayload {
            tool_call_id: ToolCallId::from_raw("tc_1"),
            tool_name: "read_file".into(),
            input: serde_json::json!({"path": "README.md"}),
            status: ToolCallStatus::PermissionRequired,
            permission_request_id: Some(PermissionRequestId::from_raw("pr_1")),
        });
        let value = p.to_value().unwrap();
        assert_eq!(value["status"], "permission_required");

        match EventPayload::decode("tool_call", value) {
            EventPayload::ToolCall(tc) => {
                assert_eq!(tc.tool_name, "read_file");
                assert_eq!(tc.status, ToolCallStatus::PermissionRequired);
            }
            other => panic!("expected ToolCall, got {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_preserved() {
        let raw = serde_json::json!({"anything": [1, 2, 3]});
        let p = EventPayload::decode("future_event", raw.clone());
        match &p {
            EventPayload::Unknown { kind, payload } => {
                assert_eq!(kind, "future_event");
                assert_eq!(payload, &raw);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        assert_eq!(p.kind(), "future_event");
        assert_eq!(p.to_value().unwrap(), raw);
    }

    #[test]
    fn malformed_known_kind_degrades_to_unknown() {
        let raw = serde_json::json!({"not": "a tool call"});
        match EventPayload::decode("tool_call", raw) {
            EventPayload::Unknown { kind, .. } => assert_eq!(kind, "tool_call"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn optional_fields_omitted() {
        let p = EventPayload::ToolResult(ToolResultPayload {
            tool_call_id: ToolCallId::from_raw("tc_1"),
            tool_name: "write_file".into(),
            ok: true,
            output: Some("done".into()),
            error: None,
            duration_ms: 12,
        });
        let value = p.to_value().unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["output"], "done");
    }

    #[test]
    fn envelope_serde() {
        let env = EventEnvelope {
            id: 7,
            seq: 3,
            ts: 1700000000.25,
            event_type: "final".into(),
            session_id: SessionId::from_raw("sess_1"),
            turn_id: Some(TurnId::from_raw("turn_1")),
            step_id: Some(StepId::from_raw("step_1")),
            payload: serde_json::json!({
                "role": "assistant",
                "message_id": "msg_1",
                "text": "hi",
                "finish_reason": "stop",
            }),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""type":"final""#));
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 7);
        match back.decode() {
            EventPayload::Final(f) => assert_eq!(f.text, "hi"),
            other => panic!("expected Final, got {other:?}"),
        }
    }
}
