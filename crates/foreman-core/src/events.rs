use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event kinds emitted on the session stream.
///
/// Consumers (the headless runner, an embedding UI) subscribe to these to
/// drive their output; every emitted event also produces one line in the
/// JSONL session log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Log,
    Text,
    Streaming,
    ToolCall,
    ToolResult,
    Reasoning,
    Question,
    Error,
    Stats,
    TodoAdd,
    TodoUpdate,
}

/// One observable step of a session turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl SessionEvent {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            metadata: Map::new(),
        }
    }

    /// Event with metadata; `metadata` must serialize to a JSON object.
    pub fn with_meta(kind: EventKind, content: impl Into<String>, metadata: Value) -> Self {
        let metadata = match metadata {
            Value::Object(m) => m,
            other => {
                let mut m = Map::new();
                m.insert("value".into(), other);
                m
            }
        };
        Self {
            kind,
            content: content.into(),
            metadata,
        }
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self::new(EventKind::Status, content)
    }

    pub fn log(content: impl Into<String>) -> Self {
        Self::new(EventKind::Log, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(EventKind::Error, content)
    }

    pub fn streaming(content: impl Into<String>) -> Self {
        Self::new(EventKind::Streaming, content)
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
