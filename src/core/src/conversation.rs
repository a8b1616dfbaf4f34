use std::collections::HashMap;

use runplex_protocol::InputMessage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Ordered messages of one thread plus per-user-message derived state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCallInfo>,
    /// user message id → state derived from the run it triggered
    #[serde(default)]
    pub message_states: HashMap<String, MessageState>,
    /// Protocol state snapshot; always a JSON object.
    #[serde(default = "empty_object")]
    pub state: Value,
}

impl Default for Conversation {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            tool_calls: Vec::new(),
            message_states: HashMap::new(),
            state: empty_object(),
        }
    }
}

impl Conversation {
    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn tool_call_mut(&mut self, id: &str) -> Option<&mut ToolCallInfo> {
        self.tool_calls.iter_mut().find(|c| c.id == id)
    }

    /// Text of the most recent assistant message, if any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|m| match m {
            ChatMessage::Assistant { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }

    pub fn protocol_state(&self) -> Map<String, Value> {
        match &self.state {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        }
    }

    /// History in the shape the event source replays to the agent.
    /// Error markers are local-only and are skipped.
    pub fn to_input_messages(&self) -> Vec<InputMessage> {
        let mut out = Vec::with_capacity(self.messages.len());
        for message in &self.messages {
            match message {
                ChatMessage::User { id, text } => out.push(InputMessage::user(id, text)),
                ChatMessage::Assistant { id, text } => {
                    out.push(InputMessage::assistant(id, text))
                }
                ChatMessage::ToolCalls { calls, .. } => {
                    for call in calls {
                        if let Some(result) = call.result.as_ref() {
                            out.push(InputMessage {
                                id: format!("{}-result", call.id),
                                role: "tool".into(),
                                content: result.clone(),
                                tool_call_id: Some(call.id.clone()),
                            });
                        }
                    }
                }
                ChatMessage::Error { .. } => {}
            }
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatMessage {
    User { id: String, text: String },
    Assistant { id: String, text: String },
    ToolCalls { id: String, calls: Vec<ToolCallInfo> },
    Error { id: String, message: String },
}

impl ChatMessage {
    pub fn id(&self) -> &str {
        match self {
            Self::User { id, .. }
            | Self::Assistant { id, .. }
            | Self::ToolCalls { id, .. }
            | Self::Error { id, .. } => id,
        }
    }

    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::User {
            id: id.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    /// Arguments are still arriving.
    Streaming,
    /// Arguments complete, waiting for a result.
    Ready,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub arguments: String,
    pub status: ToolCallStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ToolCallInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments: String::new(),
            status: ToolCallStatus::Streaming,
            result: None,
        }
    }
}

/// Derived state for one user message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageState {
    pub user_message_id: String,
    pub run_id: String,
    #[serde(default)]
    pub citations: Vec<Value>,
}

/// Text of the assistant message currently being streamed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StreamingState {
    #[default]
    AwaitingText,
    Streaming { message_id: String, text: String },
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}
