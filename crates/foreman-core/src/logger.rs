//! Append-only JSONL session log.  Every event emitted on the session stream
//! produces exactly one timestamped line.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::events::SessionEvent;

pub struct SessionLogger {
    log_file: PathBuf,
}

impl SessionLogger {
    /// Create a logger writing to `<log_dir>/session_<timestamp>.jsonl`.
    pub fn new(log_dir: impl AsRef<Path>) -> Self {
        let dir = log_dir.as_ref().to_path_buf();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("cannot create log dir {}: {e}", dir.display());
        }
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let log_file = dir.join(format!("session_{stamp}.jsonl"));
        let logger = Self { log_file };
        logger.write(&json!({ "event": "session_start", "timestamp": Utc::now().timestamp_millis() }));
        logger
    }

    pub fn path(&self) -> &Path {
        &self.log_file
    }

    /// Log one session event.
    pub fn log_event(&self, event: &SessionEvent) {
        self.write(&json!({
            "timestamp": Utc::now().timestamp_millis(),
            "datetime": Utc::now().to_rfc3339(),
            "type": event.kind,
            "content": event.content,
            "metadata": event.metadata,
        }));
    }

    /// Log a line outside the event vocabulary (user input, lifecycle marks).
    pub fn log_raw(&self, kind: &str, content: &str) {
        self.write(&json!({
            "timestamp": Utc::now().timestamp_millis(),
            "datetime": Utc::now().to_rfc3339(),
            "type": kind,
            "content": content,
            "metadata": {},
        }));
    }

    fn write(&self, value: &serde_json::Value) {
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .and_then(|mut f| writeln!(f, "{value}"));
        if let Err(e) = result {
            // Logging must never take the session down.
            warn!("session log write failed: {e}");
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
