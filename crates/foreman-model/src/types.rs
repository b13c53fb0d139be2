use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// The function half of a tool call.  `arguments` is carried as the raw JSON
/// string produced by the model — never re-encoded — so the exact bytes
/// survive a round trip through history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// One tool call requested by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    pub function: FunctionCall,
}

fn function_type() -> String {
    "function".into()
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: function_type(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }

    /// Parse `arguments` into a JSON value; malformed payloads collapse to `{}`.
    pub fn parsed_args(&self) -> serde_json::Value {
        serde_json::from_str(&self.function.arguments)
            .unwrap_or(serde_json::Value::Object(Default::default()))
    }
}

/// A single message in the conversation history.
///
/// This is the flat chat-completions shape: `tool` messages carry the id and
/// name of the call they answer; assistant messages may carry an ordered list
/// of tool calls.  Every `tool` message must answer a tool-call id that
/// appeared in the immediately preceding assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(text.into()),
            tool_calls: vec![],
            tool_call_id: None,
            name: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(text.into()),
            tool_calls: vec![],
            tool_call_id: None,
            name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(text.into()),
            tool_calls: vec![],
            tool_call_id: None,
            name: None,
        }
    }

    /// Assistant message that carries tool calls (content may be empty).
    pub fn assistant_with_calls(content: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
            name: None,
        }
    }

    /// Result of a tool call, answering `tool_call_id`.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: vec![],
            tool_call_id: Some(tool_call_id.into()),
            name: Some(name.into()),
        }
    }

    /// Accept a loosely-shaped JSON message (a raw provider object, a logged
    /// dict, …) and return the canonical form.  Unknown fields are dropped.
    pub fn from_value(value: serde_json::Value) -> anyhow::Result<Self> {
        serde_json::from_value(value).map_err(|e| anyhow::anyhow!("not a message: {e}"))
    }

    /// Serialize to the wire dict, omitting empty optional fields.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    pub fn text(&self) -> &str {
        self.content.as_deref().unwrap_or("")
    }
}

/// A tool schema handed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// Token usage from one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }
}

/// One event from a streaming chat completion, as seen by gateway consumers.
///
/// `Chunk` carries only newly arrived *displayable* text — tool-call syntax
/// never reaches a chunk; it arrives only inside the terminal `Done` message.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(String),
    Done { message: Message, usage: Usage },
    Error(String),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
        assert_eq!(Message::tool_result("id", "read_file", "x").role, Role::Tool);
    }

    #[test]
    fn tool_result_links_call_id_and_name() {
        let m = Message::tool_result("call_1", "read_file", "contents");
        assert_eq!(m.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(m.name.as_deref(), Some("read_file"));
        assert_eq!(m.text(), "contents");
    }

    #[test]
    fn serialization_omits_empty_fields() {
        let m = Message::user("hi");
        let v = m.to_value();
        let obj = v.as_object().unwrap();
        assert!(!obj.contains_key("tool_calls"));
        assert!(!obj.contains_key("tool_call_id"));
        assert!(!obj.contains_key("name"));
    }

    #[test]
    fn tool_call_arguments_survive_round_trip_byte_exact() {
        let raw = r#"{"path":  "a.txt", "n": 1.50}"#;
        let tc = ToolCall::new("id", "read_file", raw);
        let v = serde_json::to_value(&tc).unwrap();
        let back: ToolCall = serde_json::from_value(v).unwrap();
        assert_eq!(back.function.arguments, raw);
    }

    #[test]
    fn parsed_args_falls_back_to_empty_object() {
        let tc = ToolCall::new("id", "f", "not json");
        assert_eq!(tc.parsed_args(), json!({}));
    }

    #[test]
    fn from_value_accepts_foreign_dict() {
        let v = json!({
            "role": "assistant",
            "content": "hello",
            "tool_calls": [
                {"id": "c1", "type": "function",
                 "function": {"name": "glob", "arguments": "{\"pattern\":\"*.rs\"}"}}
            ],
            "provider_extra": {"ignored": true}
        });
        let m = Message::from_value(v).unwrap();
        assert_eq!(m.role, Role::Assistant);
        assert_eq!(m.tool_calls.len(), 1);
        assert_eq!(m.tool_calls[0].function.name, "glob");
    }

    #[test]
    fn from_value_rejects_non_message() {
        assert!(Message::from_value(json!({"not": "a message"})).is_err());
    }

    #[test]
    fn from_value_defaults_missing_type_tag() {
        let v = json!({
            "role": "assistant",
            "tool_calls": [
                {"id": "c1", "function": {"name": "f", "arguments": "{}"}}
            ]
        });
        let m = Message::from_value(v).unwrap();
        assert_eq!(m.tool_calls[0].kind, "function");
    }

    #[test]
    fn usage_total_prefers_reported_total() {
        let u = Usage { prompt_tokens: 3, completion_tokens: 4, total_tokens: 10 };
        assert_eq!(u.total(), 10);
        let u = Usage { prompt_tokens: 3, completion_tokens: 4, total_tokens: 0 };
        assert_eq!(u.total(), 7);
    }
}
