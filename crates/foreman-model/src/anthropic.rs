//! Driver for the Anthropic Messages API.
//!
//! Anthropic does not speak the chat-completions format: the system prompt is
//! a top-level field, tool calls are `tool_use` content blocks, and tool
//! results are `tool_result` blocks inside user messages.  This driver maps
//! the canonical history into that shape and translates the SSE event
//! vocabulary (`content_block_start` / `content_block_delta` /
//! `message_delta` / `message_stop`) back into [`RawEvent`]s.

use anyhow::{bail, Context};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::driver::{ChatDriver, RawEvent, RawStream, WireRequest};
use crate::types::{Message, Role, Usage};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 8192;

pub struct AnthropicDriver {
    name: String,
    messages_url: String,
    api_key_env: Option<String>,
    client: reqwest::Client,
}

impl AnthropicDriver {
    pub fn new(name: impl Into<String>, base_url: Option<&str>, api_key_env: Option<String>) -> Self {
        let base = base_url.unwrap_or("https://api.anthropic.com").trim_end_matches('/');
        Self {
            name: name.into(),
            messages_url: format!("{base}/v1/messages"),
            api_key_env,
            client: reqwest::Client::new(),
        }
    }

    fn resolve_key(&self) -> anyhow::Result<String> {
        let var = self
            .api_key_env
            .as_deref()
            .unwrap_or("ANTHROPIC_API_KEY");
        match std::env::var(var) {
            Ok(k) if !k.is_empty() => Ok(k),
            _ => bail!(
                "credential env var {var} is not set (required by provider {})",
                self.name
            ),
        }
    }
}

#[async_trait::async_trait]
impl ChatDriver for AnthropicDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, req: WireRequest) -> anyhow::Result<RawStream> {
        let (system, messages) = build_anthropic_messages(&req.messages);

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "temperature": req.temperature,
            "stream": true,
        });
        if !system.is_empty() {
            body["system"] = json!(system);
        }
        if req.native_tools && !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
            body["tools"] = json!(tools);
        }

        debug!(
            driver = %self.name,
            model = %req.model,
            message_count = messages.as_array().map(|a| a.len()).unwrap_or(0),
            "sending messages request"
        );

        let key = self.resolve_key()?;
        let resp = self
            .client
            .post(&self.messages_url)
            .header("x-api-key", key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("{} request failed", self.name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.name);
        }

        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<RawEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_anthropic_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

fn drain_anthropic_lines(buf: &mut String) -> Vec<anyhow::Result<RawEvent>> {
    let mut events = Vec::new();
    while let Some(nl) = buf.find('\n') {
        let line: String = buf.drain(..=nl).collect();
        let line = line.trim_end();
        let Some(data) = line.strip_prefix("data: ") else { continue };
        let Ok(value) = serde_json::from_str::<Value>(data) else { continue };
        if let Some(ev) = parse_anthropic_event(&value) {
            events.push(Ok(ev));
        }
    }
    events
}

/// Map one Anthropic SSE payload to a [`RawEvent`].
///
/// Returns `None` for event types that carry nothing the gateway needs
/// (`ping`, `message_start`, signature deltas, …).
fn parse_anthropic_event(value: &Value) -> Option<RawEvent> {
    match value["type"].as_str()? {
        "content_block_start" => {
            let index = value["index"].as_u64().unwrap_or(0) as u32;
            let block = &value["content_block"];
            if block["type"].as_str() == Some("tool_use") {
                Some(RawEvent::ToolCallDelta {
                    index,
                    id: block["id"].as_str().unwrap_or("").to_string(),
                    name: block["name"].as_str().unwrap_or("").to_string(),
                    arguments: String::new(),
                })
            } else {
                None
            }
        }
        "content_block_delta" => {
            let index = value["index"].as_u64().unwrap_or(0) as u32;
            let delta = &value["delta"];
            match delta["type"].as_str() {
                Some("text_delta") => delta["text"]
                    .as_str()
                    .filter(|t| !t.is_empty())
                    .map(|t| RawEvent::Text(t.to_string())),
                Some("input_json_delta") => delta["partial_json"]
                    .as_str()
                    .filter(|j| !j.is_empty())
                    .map(|j| RawEvent::ToolCallDelta {
                        index,
                        id: String::new(),
                        name: String::new(),
                        arguments: j.to_string(),
                    }),
                _ => None,
            }
        }
        "message_delta" => {
            let usage = &value["usage"];
            if usage.is_object() {
                let input = usage["input_tokens"].as_u64().unwrap_or(0) as u32;
                let output = usage["output_tokens"].as_u64().unwrap_or(0) as u32;
                Some(RawEvent::Usage(Usage {
                    prompt_tokens: input,
                    completion_tokens: output,
                    total_tokens: input + output,
                }))
            } else {
                None
            }
        }
        "message_stop" => Some(RawEvent::Done),
        _ => None,
    }
}

/// Split the canonical history into Anthropic's `(system, messages)` shape.
///
/// - system messages are concatenated into the top-level system string;
/// - assistant tool calls become `tool_use` blocks;
/// - `tool` messages become `tool_result` blocks inside a user message.
fn build_anthropic_messages(history: &[Message]) -> (String, Value) {
    let mut system = String::new();
    let mut out: Vec<Value> = Vec::new();

    for m in history {
        match m.role {
            Role::System => {
                if !system.is_empty() {
                    system.push_str("\n\n");
                }
                system.push_str(m.text());
            }
            Role::User => {
                out.push(json!({ "role": "user", "content": m.text() }));
            }
            Role::Assistant => {
                let mut blocks: Vec<Value> = Vec::new();
                if !m.text().is_empty() {
                    blocks.push(json!({ "type": "text", "text": m.text() }));
                }
                for tc in &m.tool_calls {
                    // Anthropic requires tool_use.id to match `^[a-zA-Z0-9_-]+$`;
                    // an empty id would 400 the whole request.
                    let safe_id = if tc.id.is_empty() {
                        warn!(tool_name = %tc.function.name,
                              "tool call has empty id; substituting fallback");
                        "tc_fallback".to_string()
                    } else {
                        tc.id.clone()
                    };
                    blocks.push(json!({
                        "type": "tool_use",
                        "id": safe_id,
                        "name": tc.function.name,
                        "input": serde_json::from_str::<Value>(&tc.function.arguments)
                            .unwrap_or(json!({})),
                    }));
                }
                if blocks.is_empty() {
                    blocks.push(json!({ "type": "text", "text": "" }));
                }
                out.push(json!({ "role": "assistant", "content": blocks }));
            }
            Role::Tool => {
                out.push(json!({
                    "role": "user",
                    "content": [{
                        "type": "tool_result",
                        "tool_use_id": m.tool_call_id.as_deref().unwrap_or(""),
                        "content": m.text(),
                    }]
                }));
            }
        }
    }
    (system, json!(out))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
