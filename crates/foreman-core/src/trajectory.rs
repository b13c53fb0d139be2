//! Trajectory log: decision points (tool selections, error recoveries,
//! failovers, delegation verdicts) recorded for post-mortem analysis and
//! saved as one JSON file per session.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Single decision point in the session trajectory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub timestamp: DateTime<Utc>,
    pub decision_point: String,
    pub options: Vec<String>,
    pub chosen: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

pub struct TrajectoryLogger {
    session_id: String,
    log_dir: PathBuf,
    started: DateTime<Utc>,
    steps: Vec<TrajectoryStep>,
}

impl TrajectoryLogger {
    pub fn new(session_id: impl Into<String>, log_dir: impl AsRef<Path>) -> Self {
        Self {
            session_id: session_id.into(),
            log_dir: log_dir.as_ref().to_path_buf(),
            started: Utc::now(),
            steps: Vec::new(),
        }
    }

    pub fn log_decision(
        &mut self,
        decision_point: &str,
        options: &[&str],
        chosen: &str,
        reasoning: &str,
        metadata: Value,
    ) {
        let metadata = match metadata {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        self.steps.push(TrajectoryStep {
            timestamp: Utc::now(),
            decision_point: decision_point.into(),
            options: options.iter().map(|s| s.to_string()).collect(),
            chosen: chosen.into(),
            reasoning: reasoning.into(),
            metadata,
        });
    }

    /// Record the selection of one tool call.
    pub fn log_tool_call(&mut self, tool_name: &str, arguments: Value) {
        self.log_decision(
            "tool_selection",
            &[tool_name],
            tool_name,
            "",
            serde_json::json!({ "arguments": arguments }),
        );
    }

    /// Record an error and the recovery action taken.
    pub fn log_error(&mut self, error_kind: &str, message: &str, recovery: &str) {
        self.log_decision(
            "error_handling",
            &["retry", "skip", "abort", "escalate", "failover"],
            recovery,
            message,
            serde_json::json!({ "error_kind": error_kind }),
        );
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Write the trajectory JSON and return its path.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.log_dir)
            .with_context(|| format!("creating {}", self.log_dir.display()))?;
        let path = self.log_dir.join(format!("trajectory_{}.json", self.session_id));
        let body = serde_json::json!({
            "session_id": self.session_id,
            "session_start": self.started.to_rfc3339(),
            "session_duration_ms": (Utc::now() - self.started).num_milliseconds(),
            "total_steps": self.steps.len(),
            "trajectory": self.steps,
        });
        std::fs::write(&path, serde_json::to_string_pretty(&body)?)
            .with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
