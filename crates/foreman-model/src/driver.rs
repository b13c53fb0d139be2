//! The raw wire seam between the gateway and provider HTTP APIs.
//!
//! A [`ChatDriver`] speaks one provider's protocol and yields low-level
//! [`RawEvent`]s.  All strategy logic — fallback sanitization, tool-syntax
//! stream filtering, textual extraction — lives above this seam in the
//! gateway, so drivers stay dumb pipes and tests can swap in
//! [`ScriptedDriver`] without touching the strategy code.

use std::pin::Pin;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::{stream, Stream};

use crate::types::{Message, ToolSchema, Usage};

/// A request as handed to a driver, after the gateway has applied strategy
/// preparation.  `native_tools` controls whether `tools` is sent as a
/// structured API parameter.
#[derive(Debug, Clone)]
pub struct WireRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub temperature: f32,
    pub native_tools: bool,
}

/// Low-level streaming event from a provider.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// A text delta.
    Text(String),
    /// A (possibly partial) structured tool call.  OpenAI interleaves deltas
    /// for parallel calls by `index`; the id/name arrive once, arguments
    /// accumulate across deltas.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    Usage(Usage),
    Done,
}

pub type RawStream = Pin<Box<dyn Stream<Item = anyhow::Result<RawEvent>> + Send>>;

#[async_trait]
pub trait ChatDriver: Send + Sync {
    /// Provider name for diagnostics.
    fn name(&self) -> &str;

    /// Send one completion request and stream raw events until `Done`.
    async fn stream(&self, req: WireRequest) -> anyhow::Result<RawStream>;
}

// ─── Scripted driver (tests) ─────────────────────────────────────────────────

/// A pre-scripted driver.  Each `stream` call pops the next script from the
/// front of the queue; tests can inspect every request the gateway sent.
pub struct ScriptedDriver {
    name: String,
    scripts: Mutex<Vec<Script>>,
    pub requests: Arc<Mutex<Vec<WireRequest>>>,
}

/// One scripted call: either a sequence of events or a hard failure.
pub enum Script {
    Events(Vec<RawEvent>),
    Fail(String),
}

impl ScriptedDriver {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            name: "scripted".into(),
            scripts: Mutex::new(scripts),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Driver that replies to every call with a single text message.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![Script::text(r)])
    }

    /// Driver whose every call fails, for failover tests.
    pub fn always_fail(error: impl Into<String>) -> Self {
        Self::new(vec![Script::Fail(error.into())])
    }
}

impl Script {
    /// Script emitting `text` as one delta followed by usage and `Done`.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Events(vec![
            RawEvent::Text(text.into()),
            RawEvent::Usage(Usage {
                prompt_tokens: 5,
                completion_tokens: 5,
                total_tokens: 10,
            }),
            RawEvent::Done,
        ])
    }

    /// Script emitting `text` split into per-character deltas, for chunk
    /// ordering and filtering tests.
    pub fn text_chars(text: &str) -> Self {
        let mut events: Vec<RawEvent> = text
            .chars()
            .map(|c| RawEvent::Text(c.to_string()))
            .collect();
        events.push(RawEvent::Done);
        Self::Events(events)
    }

    /// Script emitting one structured tool call (native protocol).
    pub fn tool_call(id: &str, name: &str, arguments: &str) -> Self {
        Self::Events(vec![
            RawEvent::ToolCallDelta {
                index: 0,
                id: id.into(),
                name: name.into(),
                arguments: arguments.into(),
            },
            RawEvent::Done,
        ])
    }
}

#[async_trait]
impl ChatDriver for ScriptedDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stream(&self, req: WireRequest) -> anyhow::Result<RawStream> {
        self.requests.lock().unwrap().push(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Script::text("[no more scripts]")
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Script::Fail(msg) => Err(anyhow::anyhow!(msg)),
            Script::Events(events) => {
                let wrapped: Vec<anyhow::Result<RawEvent>> = events.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(wrapped)))
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
