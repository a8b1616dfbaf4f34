use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProtocolError;

/// Streamed run events, discriminated by `type`.
///
/// Follows the AG-UI event vocabulary:
/// - lifecycle: `RUN_STARTED`, `RUN_FINISHED`, `RUN_ERROR`, step markers
/// - text: `TEXT_MESSAGE_START` / `_CONTENT` / `_END` / `_CHUNK`
/// - tools: `TOOL_CALL_START` / `_ARGS` / `_END` / `_RESULT`
/// - state: `STATE_SNAPSHOT`, `STATE_DELTA` (RFC 6902), `MESSAGES_SNAPSHOT`
///
/// Any other `type` decodes to [`ProtocolEvent::Unknown`] so newer servers
/// can add event kinds without breaking older clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProtocolEvent {
    #[serde(rename_all = "camelCase")]
    RunStarted { thread_id: String, run_id: String },
    #[serde(rename_all = "camelCase")]
    RunFinished {
        thread_id: String,
        run_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
    },
    RunError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    StepStarted { step_name: String },
    #[serde(rename_all = "camelCase")]
    StepFinished { step_name: String },
    #[serde(rename_all = "camelCase")]
    TextMessageStart {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TextMessageContent { message_id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    TextMessageEnd { message_id: String },
    #[serde(rename_all = "camelCase")]
    TextMessageChunk {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallStart {
        tool_call_id: String,
        tool_call_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_message_id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallArgs { tool_call_id: String, delta: String },
    #[serde(rename_all = "camelCase")]
    ToolCallEnd { tool_call_id: String },
    #[serde(rename_all = "camelCase")]
    ToolCallResult {
        #[serde(default)]
        message_id: String,
        tool_call_id: String,
        content: String,
    },
    StateSnapshot { snapshot: Value },
    /// Array of JSON Patch operations.
    StateDelta { delta: Vec<Value> },
    MessagesSnapshot { messages: Vec<Value> },
    Custom {
        name: String,
        #[serde(default)]
        value: Value,
    },
    Raw {
        #[serde(default)]
        event: Value,
    },
    #[serde(other)]
    Unknown,
}

impl ProtocolEvent {
    /// Wire name of the event kind, `"UNKNOWN"` for unrecognised kinds.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "RUN_STARTED",
            Self::RunFinished { .. } => "RUN_FINISHED",
            Self::RunError { .. } => "RUN_ERROR",
            Self::StepStarted { .. } => "STEP_STARTED",
            Self::StepFinished { .. } => "STEP_FINISHED",
            Self::TextMessageStart { .. } => "TEXT_MESSAGE_START",
            Self::TextMessageContent { .. } => "TEXT_MESSAGE_CONTENT",
            Self::TextMessageEnd { .. } => "TEXT_MESSAGE_END",
            Self::TextMessageChunk { .. } => "TEXT_MESSAGE_CHUNK",
            Self::ToolCallStart { .. } => "TOOL_CALL_START",
            Self::ToolCallArgs { .. } => "TOOL_CALL_ARGS",
            Self::ToolCallEnd { .. } => "TOOL_CALL_END",
            Self::ToolCallResult { .. } => "TOOL_CALL_RESULT",
            Self::StateSnapshot { .. } => "STATE_SNAPSHOT",
            Self::StateDelta { .. } => "STATE_DELTA",
            Self::MessagesSnapshot { .. } => "MESSAGES_SNAPSHOT",
            Self::Custom { .. } => "CUSTOM",
            Self::Raw { .. } => "RAW",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// `RUN_FINISHED` and `RUN_ERROR` end a run.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::RunFinished { .. } | Self::RunError { .. })
    }

    pub fn text_delta(message_id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextMessageContent {
            message_id: message_id.into(),
            delta: delta.into(),
        }
    }

    pub fn run_finished(thread_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self::RunFinished {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            result: None,
        }
    }

    pub fn run_error(message: impl Into<String>) -> Self {
        Self::RunError {
            message: message.into(),
            code: None,
        }
    }
}

/// Encode an event to the JSON carried in an SSE `data:` field.
pub fn encode_event(event: &ProtocolEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

/// Decode one SSE `data:` payload into an event.
pub fn decode_event(data: &str) -> Result<ProtocolEvent, ProtocolError> {
    let trimmed = data.trim();
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyPayload);
    }
    let value: Value = serde_json::from_str(trimmed)?;
    if value.get("type").and_then(Value::as_str).is_none() {
        return Err(ProtocolError::MissingType);
    }
    Ok(serde_json::from_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_text_content_with_camel_case_fields() {
        let evt =
            decode_event(r#"{"type":"TEXT_MESSAGE_CONTENT","messageId":"m1","delta":"hi"}"#)
                .unwrap();
        assert_eq!(evt, ProtocolEvent::text_delta("m1", "hi"));
        assert_eq!(evt.kind(), "TEXT_MESSAGE_CONTENT");
    }

    #[test]
    fn unknown_kind_decodes_to_unknown() {
        let evt = decode_event(r#"{"type":"REASONING_START","messageId":"r1"}"#).unwrap();
        assert_eq!(evt, ProtocolEvent::Unknown);
        assert!(!evt.is_terminal());
    }

    #[test]
    fn extra_fields_are_ignored() {
        let evt = decode_event(
            r#"{"type":"RUN_FINISHED","threadId":"t","runId":"r","timestamp":12,"rawEvent":{}}"#,
        )
        .unwrap();
        assert_eq!(evt, ProtocolEvent::run_finished("t", "r"));
        assert!(evt.is_terminal());
    }

    #[test]
    fn run_error_code_is_optional() {
        let evt = decode_event(r#"{"type":"RUN_ERROR","message":"boom"}"#).unwrap();
        assert_eq!(evt, ProtocolEvent::run_error("boom"));
    }

    #[test]
    fn state_delta_keeps_patch_operations() {
        let evt = decode_event(
            r#"{"type":"STATE_DELTA","delta":[{"op":"add","path":"/a","value":1}]}"#,
        )
        .unwrap();
        let ProtocolEvent::StateDelta { delta } = evt else {
            panic!("expected state delta");
        };
        assert_eq!(delta, vec![json!({"op": "add", "path": "/a", "value": 1})]);
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(matches!(decode_event("  \n"), Err(ProtocolError::EmptyPayload)));
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(matches!(
            decode_event(r#"{"delta":"x"}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn encoded_event_carries_type_tag() {
        let json_str = encode_event(&ProtocolEvent::run_error("nope")).unwrap();
        assert!(json_str.contains("\"type\":\"RUN_ERROR\""));
        assert!(!json_str.contains("\"code\""));
    }
}
