//! Folds protocol events into conversation state.
//!
//! Everything here is pure: no I/O, no blocking, no clocks.

use runplex_protocol::ProtocolEvent;
use serde_json::{Map, Value};

use crate::conversation::{
    ChatMessage, Conversation, MessageState, StreamingState, ToolCallInfo, ToolCallStatus,
};

/// `RUN_ERROR` code that reports a server-side cancellation.
pub const CANCELLED_ERROR_CODE: &str = "cancelled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FoldStatus {
    Running,
    Completed,
    Failed(String),
    Cancelled(String),
}

impl FoldStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventProcessingResult {
    pub conversation: Conversation,
    pub streaming: StreamingState,
    pub status: FoldStatus,
}

pub fn process_event(
    conversation: Conversation,
    streaming: StreamingState,
    event: &ProtocolEvent,
) -> EventProcessingResult {
    let mut conversation = conversation;
    let mut streaming = streaming;
    let status = apply_event(&mut conversation, &mut streaming, event);
    EventProcessingResult {
        conversation,
        streaming,
        status,
    }
}

/// In-place form of [`process_event`].
pub fn apply_event(
    conversation: &mut Conversation,
    streaming: &mut StreamingState,
    event: &ProtocolEvent,
) -> FoldStatus {
    match event {
        ProtocolEvent::TextMessageStart { message_id, .. } => {
            flush_text(conversation, streaming);
            *streaming = StreamingState::Streaming {
                message_id: message_id.clone(),
                text: String::new(),
            };
        }
        ProtocolEvent::TextMessageContent { message_id, delta } => {
            append_text(conversation, streaming, message_id, delta);
        }
        ProtocolEvent::TextMessageChunk { message_id, delta } => {
            let id = match (message_id, &*streaming) {
                (Some(id), _) => id.clone(),
                (None, StreamingState::Streaming { message_id, .. }) => message_id.clone(),
                (None, StreamingState::AwaitingText) => {
                    format!("assistant-{}", conversation.messages.len())
                }
            };
            if let Some(delta) = delta {
                append_text(conversation, streaming, &id, delta);
            }
        }
        ProtocolEvent::TextMessageEnd { .. } => flush_text(conversation, streaming),
        ProtocolEvent::ToolCallStart {
            tool_call_id,
            tool_call_name,
            ..
        } => {
            if conversation.tool_call_mut(tool_call_id).is_none() {
                conversation
                    .tool_calls
                    .push(ToolCallInfo::new(tool_call_id, tool_call_name));
            }
        }
        ProtocolEvent::ToolCallArgs {
            tool_call_id,
            delta,
        } => match conversation.tool_call_mut(tool_call_id) {
            Some(call) if call.status == ToolCallStatus::Streaming => {
                call.arguments.push_str(delta);
            }
            Some(_) => {}
            None => tracing::debug!(%tool_call_id, "args for unknown tool call"),
        },
        ProtocolEvent::ToolCallEnd { tool_call_id } => {
            if let Some(call) = conversation
                .tool_call_mut(tool_call_id)
                .filter(|call| call.status == ToolCallStatus::Streaming)
            {
                call.status = ToolCallStatus::Ready;
                let call = call.clone();
                conversation.push(ChatMessage::ToolCalls {
                    id: format!("tools-{tool_call_id}"),
                    calls: vec![call],
                });
            }
        }
        ProtocolEvent::ToolCallResult {
            tool_call_id,
            content,
            ..
        } => record_tool_result(conversation, tool_call_id, content),
        ProtocolEvent::StateSnapshot { snapshot } => {
            if snapshot.is_object() {
                conversation.state = snapshot.clone();
            } else {
                tracing::warn!("ignoring non-object state snapshot");
            }
        }
        ProtocolEvent::StateDelta { delta } => {
            apply_state_delta(&mut conversation.state, delta);
        }
        ProtocolEvent::RunFinished { .. } => {
            flush_text(conversation, streaming);
            return FoldStatus::Completed;
        }
        ProtocolEvent::RunError { message, code } => {
            flush_text(conversation, streaming);
            if code.as_deref() == Some(CANCELLED_ERROR_CODE) {
                return FoldStatus::Cancelled(message.clone());
            }
            let id = format!("error-{}", conversation.messages.len());
            conversation.push(ChatMessage::Error {
                id,
                message: message.clone(),
            });
            return FoldStatus::Failed(message.clone());
        }
        ProtocolEvent::RunStarted { .. }
        | ProtocolEvent::StepStarted { .. }
        | ProtocolEvent::StepFinished { .. }
        | ProtocolEvent::MessagesSnapshot { .. }
        | ProtocolEvent::Custom { .. }
        | ProtocolEvent::Raw { .. }
        | ProtocolEvent::Unknown => {}
    }
    FoldStatus::Running
}

/// Flush text left in the streaming buffer when a run ends without
/// `TEXT_MESSAGE_END`.
pub fn finalize(mut conversation: Conversation, mut streaming: StreamingState) -> Conversation {
    flush_text(&mut conversation, &mut streaming);
    conversation
}

/// Record the run that a user message triggered.
pub fn record_message_state(conversation: &mut Conversation, user_message_id: &str, run_id: &str) {
    conversation
        .message_states
        .entry(user_message_id.to_string())
        .and_modify(|s| s.run_id = run_id.to_string())
        .or_insert_with(|| MessageState {
            user_message_id: user_message_id.to_string(),
            run_id: run_id.to_string(),
            citations: Vec::new(),
        });
}

/// Citations in `state["citations"]` that were not in the prior snapshot.
pub fn citations_since(prior: &Map<String, Value>, state: &Value) -> Vec<Value> {
    let before = prior
        .get("citations")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    state
        .get("citations")
        .and_then(Value::as_array)
        .map(|now| {
            now.iter()
                .filter(|c| !before.contains(*c))
                .cloned()
                .collect()
        })
        .unwrap_or_default()
}

/// Apply an RFC 6902 delta. A rejected delta leaves `state` untouched.
fn apply_state_delta(state: &mut Value, delta: &[Value]) {
    let patch: json_patch::Patch = match serde_json::from_value(Value::Array(delta.to_vec())) {
        Ok(patch) => patch,
        Err(e) => {
            tracing::warn!(error = %e, "malformed state delta");
            return;
        }
    };
    if let Err(e) = json_patch::patch(state, &patch) {
        tracing::warn!(error = %e, "state delta rejected");
    }
}

fn append_text(
    conversation: &mut Conversation,
    streaming: &mut StreamingState,
    message_id: &str,
    delta: &str,
) {
    if let StreamingState::Streaming { message_id: id, text } = streaming {
        if *id == message_id {
            text.push_str(delta);
            return;
        }
    }
    flush_text(conversation, streaming);
    *streaming = StreamingState::Streaming {
        message_id: message_id.to_string(),
        text: delta.to_string(),
    };
}

fn flush_text(conversation: &mut Conversation, streaming: &mut StreamingState) {
    let StreamingState::Streaming { message_id, text } = std::mem::take(streaming) else {
        return;
    };
    if text.is_empty() {
        return;
    }
    conversation.push(ChatMessage::Assistant {
        id: message_id,
        text,
    });
}

fn record_tool_result(conversation: &mut Conversation, tool_call_id: &str, content: &str) {
    let Some(call) = conversation.tool_call_mut(tool_call_id) else {
        tracing::debug!(%tool_call_id, "result for unknown tool call");
        return;
    };
    call.status = ToolCallStatus::Completed;
    call.result = Some(content.to_string());
    let updated = call.clone();
    for message in &mut conversation.messages {
        if let ChatMessage::ToolCalls { calls, .. } = message {
            for existing in calls.iter_mut().filter(|c| c.id == updated.id) {
                *existing = updated.clone();
            }
        }
    }
}
