//! Per-model adapter strategies.
//!
//! An adapter translates between the canonical message shape and what a given
//! model can actually honour.  Native models receive structured tool schemas
//! and return structured calls; text-protocol models receive a system-prompt
//! appendix describing the textual protocol and return calls embedded in
//! their response text.

use serde_json::json;

use crate::extract::extract_tool_calls;
use crate::types::{Message, Role, ToolCall, ToolSchema};

/// Tool-calling dialect spoken by a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adapter {
    /// Structured tool calls over the provider API; message preparation is a
    /// no-op and parsing wraps the already-structured calls.
    Native,
    /// Bare-JSON protocol for local models that follow instructions but lack
    /// reliable native tool support (Qwen-class).
    TextJson,
    /// `<tool_code>`-tagged protocol for models that hold XML tags better
    /// than bare JSON (Mistral-class).
    TextXml,
}

/// Normalized model response: display text plus extracted tool calls.
#[derive(Debug, Clone)]
pub struct ParsedResponse {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl Adapter {
    /// Pick the adapter for a model id.  GPT/OpenAI-family ids are native;
    /// Mistral-family models prefer the XML dialect; everything else gets the
    /// JSON dialect.
    pub fn for_model(model_id: &str) -> Self {
        let id = model_id.to_lowercase();
        if id.contains("gpt") || id.contains("openai") {
            Self::Native
        } else if id.contains("mistral") {
            Self::TextXml
        } else {
            Self::TextJson
        }
    }

    /// Prepare `history` for transmission.  For native models this is a
    /// clone; for text protocols the tool catalog and protocol instructions
    /// are appended to the system message (one is inserted when absent).
    pub fn prepare_messages(&self, history: &[Message], tools: &[ToolSchema]) -> Vec<Message> {
        let mut messages = history.to_vec();
        if matches!(self, Self::Native) || tools.is_empty() {
            return messages;
        }

        let instruction = self.protocol_instruction(tools);
        if let Some(sys) = messages.iter_mut().find(|m| m.role == Role::System) {
            let current = sys.content.take().unwrap_or_default();
            sys.content = Some(format!("{current}{instruction}"));
        } else {
            messages.insert(0, Message::system(instruction.trim_start().to_string()));
        }
        messages
    }

    /// Normalize a raw response.  `native_tool_calls` is what the provider
    /// returned structurally (empty for text protocols).
    pub fn parse_response(&self, raw_content: &str, native_tool_calls: &[ToolCall]) -> ParsedResponse {
        match self {
            Self::Native => ParsedResponse {
                content: if raw_content.is_empty() {
                    None
                } else {
                    Some(raw_content.to_string())
                },
                tool_calls: native_tool_calls.to_vec(),
            },
            Self::TextJson | Self::TextXml => {
                // Upstream layers (the gateway's fallback path) may already
                // have extracted the calls into structured form; trust those
                // and fall back to extracting from the text.
                let tool_calls = if native_tool_calls.is_empty() {
                    extract_tool_calls(raw_content)
                } else {
                    native_tool_calls.to_vec()
                };
                ParsedResponse {
                    content: Some(raw_content.to_string()),
                    tool_calls,
                }
            }
        }
    }

    fn protocol_instruction(&self, tools: &[ToolSchema]) -> String {
        let catalog = serde_json::to_string_pretty(
            &tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    })
                })
                .collect::<Vec<_>>(),
        )
        .unwrap_or_else(|_| "[]".into());

        match self {
            Self::Native => String::new(),
            Self::TextJson => format!(
                "\n\n[TOOL USE PROTOCOL]\n\
                 You have access to the following tools. To use a tool, output a single VALID JSON object.\n\
                 Do not use XML tags. Do not wrap the JSON in Markdown code blocks.\n\
                 Format: {{ \"name\": \"tool_name\", \"arguments\": {{ \"arg1\": \"value1\" }} }}\n\
                 \nAvailable Tools:\n{catalog}\n"
            ),
            Self::TextXml => format!(
                "\n\n[TOOL USE PROTOCOL]\n\
                 You have access to tools. To use one, wrap the JSON call inside <tool_code> tags:\n\
                 <tool_code>\n{{\n  \"name\": \"tool_name\",\n  \"arguments\": {{\"arg\": \"val\"}}\n}}\n</tool_code>\n\
                 Rules: call at most one tool at a time; output ONLY the tagged block when calling; \
                 do not use Markdown code fences inside the tags.\n\
                 \nAvailable Tools:\n{catalog}\n"
            ),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolSchema {
        ToolSchema {
            name: name.into(),
            description: format!("{name} tool"),
            parameters: json!({"type": "object"}),
        }
    }

    #[test]
    fn model_selection_heuristics() {
        assert_eq!(Adapter::for_model("gpt-4o"), Adapter::Native);
        assert_eq!(Adapter::for_model("openai/custom"), Adapter::Native);
        assert_eq!(Adapter::for_model("mistral:7b"), Adapter::TextXml);
        assert_eq!(Adapter::for_model("qwen2.5-coder:latest"), Adapter::TextJson);
    }

    #[test]
    fn native_prepare_is_identity() {
        let history = vec![Message::system("sys"), Message::user("hi")];
        let out = Adapter::Native.prepare_messages(&history, &[tool("read_file")]);
        assert_eq!(out, history);
    }

    #[test]
    fn text_prepare_appends_to_existing_system_message() {
        let history = vec![Message::system("base prompt"), Message::user("hi")];
        let out = Adapter::TextJson.prepare_messages(&history, &[tool("read_file")]);
        assert_eq!(out.len(), 2);
        let sys = out[0].text();
        assert!(sys.starts_with("base prompt"));
        assert!(sys.contains("[TOOL USE PROTOCOL]"));
        assert!(sys.contains("read_file"));
    }

    #[test]
    fn text_prepare_inserts_system_message_when_absent() {
        let history = vec![Message::user("hi")];
        let out = Adapter::TextXml.prepare_messages(&history, &[tool("glob")]);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].role, Role::System);
        assert!(out[0].text().contains("<tool_code>"));
    }

    #[test]
    fn text_prepare_without_tools_is_identity() {
        let history = vec![Message::user("hi")];
        let out = Adapter::TextJson.prepare_messages(&history, &[]);
        assert_eq!(out, history);
    }

    #[test]
    fn native_parse_passes_structured_calls_through() {
        let native = vec![ToolCall::new("c1", "glob", r#"{"pattern":"*"}"#)];
        let parsed = Adapter::Native.parse_response("checking", &native);
        assert_eq!(parsed.content.as_deref(), Some("checking"));
        assert_eq!(parsed.tool_calls, native);
    }

    #[test]
    fn native_parse_empty_content_is_none() {
        let parsed = Adapter::Native.parse_response("", &[]);
        assert!(parsed.content.is_none());
    }

    #[test]
    fn text_parse_extracts_from_content() {
        let text = r#"<tool_code>{"name": "read_file", "arguments": {"path": "a"}}</tool_code>"#;
        let parsed = Adapter::TextXml.parse_response(text, &[]);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].function.name, "read_file");
        // Full raw text remains the content at this layer.
        assert_eq!(parsed.content.as_deref(), Some(text));
    }

    #[test]
    fn text_parse_prefers_structured_calls_when_present() {
        let native = vec![ToolCall::new("c1", "glob", "{}")];
        let parsed = Adapter::TextJson.parse_response("no calls here", &native);
        assert_eq!(parsed.tool_calls, native);
    }

    #[test]
    fn text_parse_extracts_when_no_structured_calls() {
        let text = r#"{"name": "read_file", "arguments": {"path": "x"}}"#;
        let parsed = Adapter::TextJson.parse_response(text, &[]);
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].function.name, "read_file");
    }
}
