use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body that opens an event stream for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAgentInput {
    pub thread_id: String,
    pub run_id: String,
    /// Protocol state the run resumes from.
    #[serde(default)]
    pub state: Value,
    #[serde(default)]
    pub messages: Vec<InputMessage>,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(default)]
    pub context: Vec<Value>,
    #[serde(default)]
    pub forwarded_props: Value,
}

impl RunAgentInput {
    pub fn new(
        thread_id: impl Into<String>,
        run_id: impl Into<String>,
        messages: Vec<InputMessage>,
        state: Value,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            run_id: run_id.into(),
            state,
            messages,
            tools: Vec::new(),
            context: Vec::new(),
            forwarded_props: Value::Object(Default::default()),
        }
    }
}

/// One history message replayed to the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMessage {
    pub id: String,
    /// `user`, `assistant`, or `tool`.
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl InputMessage {
    pub fn user(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: "user".into(),
            content: content.into(),
            tool_call_id: None,
        }
    }

    pub fn assistant(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: "assistant".into(),
            content: content.into(),
            tool_call_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn input_serializes_camel_case() {
        let input = RunAgentInput::new(
            "t1",
            "run-1",
            vec![InputMessage::user("u1", "hello")],
            json!({"k": 1}),
        );
        let value = serde_json::to_value(&input).unwrap();
        assert_eq!(value["threadId"], "t1");
        assert_eq!(value["runId"], "run-1");
        assert_eq!(value["forwardedProps"], json!({}));
        assert_eq!(value["messages"][0]["role"], "user");
        assert!(value["messages"][0].get("toolCallId").is_none());
    }
}
