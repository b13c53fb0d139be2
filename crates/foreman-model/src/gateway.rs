//! Uniform chat API over heterogeneous providers.
//!
//! The gateway owns strategy selection (native structured tool calls vs. the
//! `<tool_code>` text fallback), prepares the transmitted history
//! accordingly, and normalizes every provider stream into the
//! [`StreamEvent`] vocabulary: `Chunk` events carry only displayable text —
//! tool-call syntax is filtered out of the stream and surfaces solely in the
//! terminal `Done` message.
//!
//! The gateway exposes failures; failover *selection* is the session's
//! policy, not the gateway's.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use foreman_config::{ProviderConfig, ProviderFamily, ToolMode};

use crate::adapter::Adapter;
use crate::driver::{ChatDriver, RawEvent, WireRequest};
use crate::extract::{extract_tool_calls, strip_tool_code_spans};
use crate::sanitize::{sanitize_history, TOOL_CODE_CLOSE, TOOL_CODE_OPEN};
use crate::types::{ChatStream, Message, StreamEvent, ToolCall, ToolSchema, Usage};

/// Effective tool-calling strategy for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStrategy {
    Native,
    XmlFallback,
}

/// Honour the provider's configured mode; with `auto`, trust native tool
/// calling only for the families empirically reliable at it.
pub fn resolve_strategy(provider: &ProviderConfig) -> ToolStrategy {
    match provider.tool_mode {
        ToolMode::Native => ToolStrategy::Native,
        ToolMode::XmlFallback => ToolStrategy::XmlFallback,
        ToolMode::Auto => match provider.family {
            ProviderFamily::Openai | ProviderFamily::Anthropic | ProviderFamily::Deepseek => {
                ToolStrategy::Native
            }
            ProviderFamily::Ollama => ToolStrategy::XmlFallback,
            ProviderFamily::Other => ToolStrategy::Native,
        },
    }
}

type DriverFactory =
    Box<dyn Fn(&ProviderConfig) -> anyhow::Result<Arc<dyn ChatDriver>> + Send + Sync>;

pub struct Gateway {
    factory: DriverFactory,
    drivers: Mutex<HashMap<String, Arc<dyn ChatDriver>>>,
}

impl Gateway {
    /// Gateway backed by real HTTP drivers.
    pub fn new() -> Self {
        Self::with_factory(Box::new(|cfg| crate::driver_from_config(cfg)))
    }

    /// Gateway with a custom driver factory (tests inject scripted drivers).
    pub fn with_factory(factory: DriverFactory) -> Self {
        Self {
            factory,
            drivers: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-register a driver under a provider name.
    pub fn insert_driver(&self, provider_name: impl Into<String>, driver: Arc<dyn ChatDriver>) {
        self.drivers
            .lock()
            .unwrap()
            .insert(provider_name.into(), driver);
    }

    fn driver_for(&self, provider: &ProviderConfig) -> anyhow::Result<Arc<dyn ChatDriver>> {
        if let Some(d) = self.drivers.lock().unwrap().get(&provider.name) {
            return Ok(Arc::clone(d));
        }
        let d = (self.factory)(provider)?;
        self.drivers
            .lock()
            .unwrap()
            .insert(provider.name.clone(), Arc::clone(&d));
        Ok(d)
    }

    /// Non-streaming completion surface: drains the streaming path so both
    /// operations share strategy, filtering, and parsing.
    pub async fn chat_complete(
        &self,
        provider: &ProviderConfig,
        model: &str,
        history: &[Message],
        tools: &[ToolSchema],
        temperature: f32,
        abort: Arc<AtomicBool>,
    ) -> anyhow::Result<(Message, Usage)> {
        let mut stream = self
            .chat_complete_stream(provider, model, history, tools, temperature, abort)
            .await;
        while let Some(ev) = stream.next().await {
            match ev {
                StreamEvent::Chunk(_) => {}
                StreamEvent::Done { message, usage } => return Ok((message, usage)),
                StreamEvent::Error(e) => anyhow::bail!(e),
            }
        }
        anyhow::bail!("stream ended without a final message")
    }

    /// Streaming completion.  The returned stream yields `Chunk` events with
    /// newly arrived display text, then exactly one `Done` or `Error`.
    pub async fn chat_complete_stream(
        &self,
        provider: &ProviderConfig,
        model: &str,
        history: &[Message],
        tools: &[ToolSchema],
        temperature: f32,
        abort: Arc<AtomicBool>,
    ) -> ChatStream {
        let strategy = resolve_strategy(provider);

        // Prepare the transmitted history.  Fallback transport first rewrites
        // structured tool fields into text, then injects the textual protocol
        // via the model's text adapter.
        let (messages, native_tools) = match strategy {
            ToolStrategy::Native => (history.to_vec(), true),
            ToolStrategy::XmlFallback => {
                let sanitized = sanitize_history(history);
                let adapter = match Adapter::for_model(model) {
                    Adapter::Native => Adapter::TextXml,
                    text => text,
                };
                (adapter.prepare_messages(&sanitized, tools), false)
            }
        };

        let req = WireRequest {
            model: model.to_string(),
            messages,
            tools: tools.to_vec(),
            temperature,
            native_tools,
        };

        let driver = match self.driver_for(provider) {
            Ok(d) => d,
            Err(e) => return error_stream(format!("{e:#}")),
        };

        let raw = match driver.stream(req).await {
            Ok(s) => s,
            Err(e) => return error_stream(format!("{e:#}")),
        };

        let (tx, rx) = tokio::sync::mpsc::channel::<StreamEvent>(64);
        tokio::spawn(drive_stream(raw, strategy, tx, abort));
        Box::pin(ReceiverStream::new(rx))
    }
}

impl Default for Gateway {
    fn default() -> Self {
        Self::new()
    }
}

fn error_stream(message: String) -> ChatStream {
    Box::pin(futures::stream::iter(vec![StreamEvent::Error(message)]))
}

/// Pump raw driver events into consumer-facing [`StreamEvent`]s.
///
/// The abort flag is checked between raw events; on abort an `Error` event is
/// emitted and the stream ends.
async fn drive_stream(
    mut raw: crate::driver::RawStream,
    strategy: ToolStrategy,
    tx: tokio::sync::mpsc::Sender<StreamEvent>,
    abort: Arc<AtomicBool>,
) {
    let mut assembler = Assembler::new(strategy);

    while let Some(event) = raw.next().await {
        if abort.load(Ordering::Relaxed) {
            let _ = tx.send(StreamEvent::Error("cancelled".into())).await;
            return;
        }
        match event {
            Ok(RawEvent::Text(delta)) => {
                let visible = assembler.push_text(&delta);
                if !visible.is_empty() {
                    let _ = tx.send(StreamEvent::Chunk(visible)).await;
                }
            }
            Ok(RawEvent::ToolCallDelta {
                index,
                id,
                name,
                arguments,
            }) => assembler.push_tool_delta(index, id, name, arguments),
            Ok(RawEvent::Usage(u)) => assembler.usage = u,
            Ok(RawEvent::Done) => {
                let tail = assembler.release_tail();
                if !tail.is_empty() {
                    let _ = tx.send(StreamEvent::Chunk(tail)).await;
                }
                let (message, usage) = assembler.finish();
                let _ = tx.send(StreamEvent::Done { message, usage }).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(format!("{e:#}"))).await;
                return;
            }
        }
    }

    // Stream ended without a Done marker; treat whatever accumulated as the
    // final message rather than dropping a partial response.
    let tail = assembler.release_tail();
    if !tail.is_empty() {
        let _ = tx.send(StreamEvent::Chunk(tail)).await;
    }
    let (message, usage) = assembler.finish();
    let _ = tx.send(StreamEvent::Done { message, usage }).await;
}

// ─── Response assembly ────────────────────────────────────────────────────────

struct PendingToolCall {
    id: String,
    name: String,
    args: String,
}

/// Accumulates raw events into the final assistant [`Message`].
struct Assembler {
    strategy: ToolStrategy,
    filter: ChunkFilter,
    full_text: String,
    pending: BTreeMap<u32, PendingToolCall>,
    usage: Usage,
}

impl Assembler {
    fn new(strategy: ToolStrategy) -> Self {
        Self {
            strategy,
            filter: ChunkFilter::new(),
            full_text: String::new(),
            pending: BTreeMap::new(),
            usage: Usage::default(),
        }
    }

    /// Record a text delta and return the part safe to display now.
    fn push_text(&mut self, delta: &str) -> String {
        self.full_text.push_str(delta);
        match self.strategy {
            ToolStrategy::Native => delta.to_string(),
            ToolStrategy::XmlFallback => self.filter.push(delta),
        }
    }

    /// Flush the chunk filter at end of stream.  A held-back suffix that
    /// never completed into an opening tag is real text and must still reach
    /// the chunk stream so chunk concatenation matches the final content.
    fn release_tail(&mut self) -> String {
        std::mem::take(&mut self.filter).finish()
    }

    fn push_tool_delta(&mut self, index: u32, id: String, name: String, arguments: String) {
        let slot = self.pending.entry(index).or_insert_with(|| PendingToolCall {
            id: String::new(),
            name: String::new(),
            args: String::new(),
        });
        if !id.is_empty() {
            slot.id = id;
        }
        if !name.is_empty() {
            slot.name = name;
        }
        slot.args.push_str(&arguments);
    }

    fn finish(self) -> (Message, Usage) {
        let message = match self.strategy {
            ToolStrategy::Native => {
                let mut tool_calls: Vec<ToolCall> = Vec::new();
                for (i, (_, p)) in self.pending.into_iter().enumerate() {
                    // A call with no name cannot be dispatched; storing it
                    // would corrupt the history sent back on the next turn.
                    if p.name.is_empty() {
                        warn!(tool_call_id = %p.id, "dropping tool call with empty name");
                        continue;
                    }
                    let id = if p.id.is_empty() {
                        warn!(tool_name = %p.name, "tool call had empty id; generating one");
                        format!("tc_synthetic_{i}")
                    } else {
                        p.id
                    };
                    let args = if p.args.is_empty() { "{}".into() } else { p.args };
                    tool_calls.push(ToolCall::new(id, p.name, args));
                }
                let content = if self.full_text.is_empty() {
                    None
                } else {
                    Some(self.full_text)
                };
                Message::assistant_with_calls(content, tool_calls)
            }
            ToolStrategy::XmlFallback => {
                let tool_calls = extract_tool_calls(&self.full_text);
                let content = strip_tool_code_spans(&self.full_text);
                let content = if content.is_empty() { None } else { Some(content) };
                Message::assistant_with_calls(content, tool_calls)
            }
        };
        (message, self.usage)
    }
}

// ─── Streaming tool-syntax filter ─────────────────────────────────────────────

/// Removes `<tool_code>…</tool_code>` spans from a chunk stream.
///
/// Text is released in byte order as soon as it provably lies outside a tool
/// block; a suffix that could still grow into an opening tag is held back
/// until the next chunk decides.  Spans may straddle any number of chunk
/// boundaries.
pub struct ChunkFilter {
    buf: String,
    inside: bool,
}

impl ChunkFilter {
    pub fn new() -> Self {
        Self {
            buf: String::new(),
            inside: false,
        }
    }

    /// Feed one chunk; returns the display text this chunk releases.
    pub fn push(&mut self, chunk: &str) -> String {
        self.buf.push_str(chunk);
        let mut out = String::new();
        loop {
            if self.inside {
                match self.buf.find(TOOL_CODE_CLOSE) {
                    Some(pos) => {
                        self.buf.drain(..pos + TOOL_CODE_CLOSE.len());
                        self.inside = false;
                    }
                    // Closing tag may arrive in a later chunk; hold everything.
                    None => break,
                }
            } else {
                match self.buf.find(TOOL_CODE_OPEN) {
                    Some(pos) => {
                        out.push_str(&self.buf[..pos]);
                        self.buf.drain(..pos + TOOL_CODE_OPEN.len());
                        self.inside = true;
                    }
                    None => {
                        let hold = longest_open_tag_prefix(&self.buf);
                        let emit = self.buf.len() - hold;
                        out.push_str(&self.buf[..emit]);
                        self.buf.drain(..emit);
                        break;
                    }
                }
            }
        }
        out
    }

    /// End of stream: a held-back partial tag that never completed is real
    /// text and is released; an unterminated open block is dropped as syntax.
    pub fn finish(self) -> String {
        if self.inside {
            String::new()
        } else {
            self.buf
        }
    }
}

impl Default for ChunkFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Length of the longest suffix of `s` that is a proper prefix of the opening
/// tag.  The tag is ASCII so byte slicing is boundary-safe.
fn longest_open_tag_prefix(s: &str) -> usize {
    let max = TOOL_CODE_OPEN.len().saturating_sub(1).min(s.len());
    for k in (1..=max).rev() {
        if s.ends_with(&TOOL_CODE_OPEN[..k]) {
            return k;
        }
    }
    0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
