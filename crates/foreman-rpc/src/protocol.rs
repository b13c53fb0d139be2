use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP-style protocol version sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// One tool advertised by a server via `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "inputSchema", default = "empty_schema")]
    pub input_schema: Value,
}

fn empty_schema() -> Value {
    serde_json::json!({})
}

/// Parse a `tools/list` result payload.
pub fn parse_tool_list(result: &Value) -> Vec<ToolDescriptor> {
    result["tools"]
        .as_array()
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| serde_json::from_value(t.clone()).ok())
                .collect()
        })
        .unwrap_or_default()
}

/// Join the text parts of a `tools/call` result, returning the combined text
/// and the server's `isError` flag.
pub fn parse_call_result(result: &Value) -> (String, bool) {
    let mut text = String::new();
    if let Some(content) = result["content"].as_array() {
        for item in content {
            if item["type"].as_str() == Some("text") {
                text.push_str(item["text"].as_str().unwrap_or(""));
            }
        }
    }
    let is_error = result["isError"].as_bool().unwrap_or(false);
    (text, is_error)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
