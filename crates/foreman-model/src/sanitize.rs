//! Message sanitization for the text-embedded tool-call fallback.
//!
//! Local models driven through `xml_fallback` rarely honour structured tool
//! fields in the transmitted history, so before sending, every message is
//! rewritten into plain text: assistant tool calls become `<tool_code>` blocks
//! appended to content, and tool-result messages become user messages tagged
//! with the originating tool name.  Native mode never calls into this module;
//! the canonical form round-trips untouched.

use crate::types::{Message, Role};

pub const TOOL_CODE_OPEN: &str = "<tool_code>";
pub const TOOL_CODE_CLOSE: &str = "</tool_code>";

impl Message {
    /// Rewrite this message in place so it is safe for fallback transport.
    ///
    /// After this call no assistant message carries structured tool calls and
    /// no message has role `tool`; the same information exists as tagged text
    /// spans inside assistant/user content.
    pub fn sanitize_for_fallback(&mut self) {
        if self.role == Role::Assistant && !self.tool_calls.is_empty() {
            let blocks: Vec<String> = self
                .tool_calls
                .iter()
                .map(|tc| {
                    format!(
                        "{TOOL_CODE_OPEN}\n{{\n    \"name\": \"{}\",\n    \"arguments\": {}\n}}\n{TOOL_CODE_CLOSE}",
                        tc.function.name, tc.function.arguments
                    )
                })
                .collect();

            let current = self.content.take().unwrap_or_default();
            let separator = if current.is_empty() { "" } else { "\n\n" };
            self.content = Some(format!("{current}{separator}{}", blocks.join("\n")));
            self.tool_calls.clear();
        }

        if self.role == Role::Tool {
            let tool_name = self.name.take().unwrap_or_else(|| "unknown".into());
            let body = self.content.take().unwrap_or_default();
            self.role = Role::User;
            self.content = Some(format!("[Tool Result: {tool_name}]\n{body}"));
            self.tool_call_id = None;
        }
    }
}

/// Sanitize a whole history for fallback transport.
pub fn sanitize_history(history: &[Message]) -> Vec<Message> {
    let mut out = history.to_vec();
    for m in &mut out {
        m.sanitize_for_fallback();
    }
    out
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
