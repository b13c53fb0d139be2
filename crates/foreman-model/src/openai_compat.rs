//! Driver for OpenAI-compatible `/chat/completions` endpoints.
//!
//! OpenAI, DeepSeek, Ollama, and most local servers speak the same SSE
//! streaming wire format; this single driver covers all of them, configured
//! with a base URL and an optional bearer credential.

use anyhow::{bail, Context};
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use crate::driver::{ChatDriver, RawEvent, RawStream, WireRequest};
use crate::types::Usage;

pub struct OpenAiCompatDriver {
    name: String,
    chat_url: String,
    /// Environment variable holding the credential, resolved per call so a
    /// missing key fails the call, not construction.
    api_key_env: Option<String>,
    client: reqwest::Client,
}

impl OpenAiCompatDriver {
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        api_key_env: Option<String>,
    ) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            name: name.into(),
            chat_url: format!("{base}/chat/completions"),
            api_key_env,
            client: reqwest::Client::new(),
        }
    }

    fn resolve_key(&self) -> anyhow::Result<Option<String>> {
        match &self.api_key_env {
            None => Ok(None),
            Some(var) => match std::env::var(var) {
                Ok(k) if !k.is_empty() => Ok(Some(k)),
                _ => bail!(
                    "credential env var {var} is not set (required by provider {})",
                    self.name
                ),
            },
        }
    }
}

#[async_trait::async_trait]
impl ChatDriver for OpenAiCompatDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, req: WireRequest) -> anyhow::Result<RawStream> {
        let messages: Vec<Value> = req.messages.iter().map(|m| m.to_value()).collect();

        let mut body = json!({
            "model": req.model,
            "messages": messages,
            "temperature": req.temperature,
            "stream": true,
            "stream_options": { "include_usage": true },
        });
        if req.native_tools && !req.tools.is_empty() {
            let tools: Vec<Value> = req
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = json!(tools);
            body["tool_choice"] = json!("auto");
        }

        debug!(
            driver = %self.name,
            model = %req.model,
            message_count = req.messages.len(),
            tool_count = req.tools.len(),
            "sending chat completion request"
        );

        let mut http_req = self.client.post(&self.chat_url).json(&body);
        if let Some(key) = self.resolve_key()? {
            http_req = http_req.bearer_auth(key);
        }

        let resp = http_req
            .send()
            .await
            .with_context(|| format!("{} request failed", self.name))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            bail!("{} error {status}: {text}", self.name);
        }

        // SSE events can be split across TCP packets; keep a line buffer
        // across chunks and emit events only for complete lines.
        let byte_stream = resp.bytes_stream();
        let event_stream = byte_stream
            .scan(String::new(), |buf, chunk| {
                let events: Vec<anyhow::Result<RawEvent>> = match chunk {
                    Ok(b) => {
                        buf.push_str(&String::from_utf8_lossy(&b));
                        drain_complete_sse_lines(buf)
                    }
                    Err(e) => vec![Err(anyhow::anyhow!(e))],
                };
                std::future::ready(Some(events))
            })
            .flat_map(futures::stream::iter);

        Ok(Box::pin(event_stream))
    }
}

/// Split off every complete line in `buf` and parse the `data:` ones.
fn drain_complete_sse_lines(buf: &mut String) -> Vec<anyhow::Result<RawEvent>> {
    let mut events = Vec::new();
    while let Some(nl) = buf.find('\n') {
        let line: String = buf.drain(..=nl).collect();
        if let Some(ev) = parse_sse_data_line(line.trim_end()) {
            events.push(ev);
        }
    }
    events
}

/// Parse a single complete SSE `data:` line into a [`RawEvent`].
///
/// Returns `None` for empty lines, comments, and unparseable payloads (the
/// stream tolerates keep-alive noise).
fn parse_sse_data_line(line: &str) -> Option<anyhow::Result<RawEvent>> {
    let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data = data.trim();
    if data.is_empty() {
        return None;
    }
    if data == "[DONE]" {
        return Some(Ok(RawEvent::Done));
    }
    let value: Value = serde_json::from_str(data).ok()?;

    // The final usage-only chunk has an empty choices array.
    if let Some(usage) = value.get("usage").filter(|u| u.is_object()) {
        let usage = Usage {
            prompt_tokens: usage["prompt_tokens"].as_u64().unwrap_or(0) as u32,
            completion_tokens: usage["completion_tokens"].as_u64().unwrap_or(0) as u32,
            total_tokens: usage["total_tokens"].as_u64().unwrap_or(0) as u32,
        };
        if value["choices"].as_array().map(|c| c.is_empty()).unwrap_or(true) {
            return Some(Ok(RawEvent::Usage(usage)));
        }
    }

    let delta = &value["choices"][0]["delta"];
    if let Some(calls) = delta["tool_calls"].as_array() {
        // One delta line carries at most one tool-call fragment in practice;
        // emit the first and let argument fragments accumulate upstream.
        if let Some(tc) = calls.first() {
            return Some(Ok(RawEvent::ToolCallDelta {
                index: tc["index"].as_u64().unwrap_or(0) as u32,
                id: tc["id"].as_str().unwrap_or("").to_string(),
                name: tc["function"]["name"].as_str().unwrap_or("").to_string(),
                arguments: tc["function"]["arguments"].as_str().unwrap_or("").to_string(),
            }));
        }
    }
    if let Some(text) = delta["content"].as_str() {
        if !text.is_empty() {
            return Some(Ok(RawEvent::Text(text.to_string())));
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_text_delta_line() {
        let line = r#"data: {"choices":[{"delta":{"content":"hel"}}]}"#;
        let ev = parse_sse_data_line(line).unwrap().unwrap();
        assert!(matches!(ev, RawEvent::Text(t) if t == "hel"));
    }

    #[test]
    fn parse_done_marker() {
        let ev = parse_sse_data_line("data: [DONE]").unwrap().unwrap();
        assert!(matches!(ev, RawEvent::Done));
    }

    #[test]
    fn parse_tool_call_delta() {
        let line = r#"data: {"choices":[{"delta":{"tool_calls":[{"index":0,"id":"c1","function":{"name":"glob","arguments":"{\"pa"}}]}}]}"#;
        let ev = parse_sse_data_line(line).unwrap().unwrap();
        match ev {
            RawEvent::ToolCallDelta { index, id, name, arguments } => {
                assert_eq!(index, 0);
                assert_eq!(id, "c1");
                assert_eq!(name, "glob");
                assert_eq!(arguments, "{\"pa");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn parse_usage_only_chunk() {
        let line = r#"data: {"choices":[],"usage":{"prompt_tokens":12,"completion_tokens":3,"total_tokens":15}}"#;
        let ev = parse_sse_data_line(line).unwrap().unwrap();
        match ev {
            RawEvent::Usage(u) => assert_eq!(u.total(), 15),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn non_data_lines_are_ignored() {
        assert!(parse_sse_data_line(": keep-alive").is_none());
        assert!(parse_sse_data_line("").is_none());
        assert!(parse_sse_data_line("event: ping").is_none());
    }

    #[test]
    fn drain_handles_split_lines() {
        let mut buf = String::from("data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: {\"cho");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert_eq!(buf, "data: {\"cho", "incomplete tail stays buffered");

        buf.push_str("ices\":[{\"delta\":{\"content\":\"b\"}}]}\n");
        let events = drain_complete_sse_lines(&mut buf);
        assert_eq!(events.len(), 1);
        assert!(buf.is_empty());
    }

    #[test]
    fn missing_credential_fails_per_call() {
        let d = OpenAiCompatDriver::new(
            "openai",
            "https://api.openai.com/v1",
            Some("FOREMAN_TEST_UNSET_KEY_VAR".into()),
        );
        let err = d.resolve_key().unwrap_err().to_string();
        assert!(err.contains("FOREMAN_TEST_UNSET_KEY_VAR"));
    }

    #[test]
    fn keyless_provider_resolves_to_none() {
        let d = OpenAiCompatDriver::new("ollama", "http://localhost:11434/v1", None);
        assert!(d.resolve_key().unwrap().is_none());
    }
}
