use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::warn;

use foreman_config::{Config, ProviderConfig, RoleConfig, ToolServerConfig};
use foreman_model::{Gateway, Message, ToolSchema, Usage};
use foreman_rpc::{ToolDescriptor, ToolTransport};

use crate::events::{EventKind, SessionEvent};
use crate::logger::SessionLogger;
use crate::prompts;
use crate::trajectory::TrajectoryLogger;

/// Three-phase workflow state.  PLAN researches and proposes, EXECUTE
/// delegates and implements, REVIEW verifies.  Transitions form the DAG
/// PLAN → EXECUTE → REVIEW; EXECUTE is entered only through an approved
/// plan_approval question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    Plan,
    Execute,
    Review,
}

pub const READ_ONLY_TOOLS: &[&str] =
    &["list_directory", "read_file", "glob", "search_file_content"];
pub const WRITE_TOOLS: &[&str] = &["write_file", "run_shell_command"];
pub const CONTROL_TOOLS: &[&str] = &["delegate_task", "ask_user", "request_admin_privileges"];

pub(crate) const MAX_ROUNDS: usize = 15;
pub(crate) const MAX_ASK_USER_PER_TASK: u32 = 2;
pub(crate) const MAX_DELEGATIONS_PER_ROLE: u32 = 3;
pub(crate) const DELEGATION_RETRIES: u32 = 3;
pub(crate) const DEVELOPER_INNER_ITERATIONS: u32 = 5;

/// Structured delegation envelope.  Immutable once created; lives only for
/// its delegation sub-loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub id: String,
    pub goal: String,
    pub constraints: Vec<String>,
    pub focus_files: Vec<String>,
    pub verification_steps: Vec<String>,
}

impl TaskSpec {
    /// Serialize the spec into the prompt handed to the Developer and echoed
    /// to the Reviewer.
    pub fn to_prompt(&self) -> String {
        let mut out = format!("Goal: {}\n", self.goal);
        if !self.constraints.is_empty() {
            out.push_str("Constraints:\n");
            for c in &self.constraints {
                out.push_str(&format!("- {c}\n"));
            }
        }
        if !self.focus_files.is_empty() {
            out.push_str("Focus Files:\n");
            for f in &self.focus_files {
                out.push_str(&format!("- {f}\n"));
            }
        }
        if !self.verification_steps.is_empty() {
            out.push_str("Verification Steps:\n");
            for v in &self.verification_steps {
                out.push_str(&format!("- {v}\n"));
            }
        }
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Success,
    Failure,
}

/// Outcome of one delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskStatus,
    pub summary: String,
    pub verification_text: String,
}

impl TaskResult {
    pub fn success(summary: impl Into<String>, verification: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Success,
            summary: summary.into(),
            verification_text: verification.into(),
        }
    }

    pub fn failure(summary: impl Into<String>, verification: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failure,
            summary: summary.into(),
            verification_text: verification.into(),
        }
    }
}

/// Seam between the session and a tool-server process.
///
/// The production implementation is [`ToolTransport`]; tests substitute an
/// in-memory server.
#[async_trait::async_trait]
pub trait ToolServer: Send + Sync {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>>;
    async fn call_tool(&self, name: &str, args: Value) -> anyhow::Result<String>;
    async fn stop(&self);
}

#[async_trait::async_trait]
impl ToolServer for ToolTransport {
    async fn list_tools(&self) -> anyhow::Result<Vec<ToolDescriptor>> {
        Ok(ToolTransport::list_tools(self).await?)
    }

    async fn call_tool(&self, name: &str, args: Value) -> anyhow::Result<String> {
        Ok(ToolTransport::call_tool(self, name, args).await?)
    }

    async fn stop(&self) {
        ToolTransport::stop(self).await;
    }
}

/// One agent session: mode state machine, conversation history, counters,
/// tool servers, and the per-turn driver loop (see `turn.rs`) plus the
/// delegation engine (see `delegation.rs`).
///
/// All mutable turn state lives here; there is no module-level state.
pub struct Session {
    pub(crate) config: Config,
    pub(crate) role_name: String,
    pub(crate) role: RoleConfig,
    pub(crate) gateway: Arc<Gateway>,

    pub(crate) servers: HashMap<String, Arc<dyn ToolServer>>,
    /// Tool name → server name.
    pub(crate) tools_map: HashMap<String, String>,
    /// Tools discovered from servers, unfiltered.
    pub(crate) static_tools: Vec<ToolSchema>,
    /// Active tool set: role-filtered static + dynamic tools.
    pub(crate) llm_tools: Vec<ToolSchema>,
    /// Held-back definitions unlocked by `request_admin_privileges`.
    pub(crate) sudo_tools: Vec<ToolSchema>,

    pub(crate) history: Vec<Message>,
    pub(crate) mode: SessionMode,
    pub(crate) active_provider: ProviderConfig,
    pub(crate) active_model: String,

    pub(crate) stats: HashMap<String, u64>,
    pub(crate) stats_by_role: HashMap<String, u64>,
    pub(crate) delegation_counts: HashMap<String, u32>,
    pub(crate) ask_user_count: u32,
    pub(crate) post_approval_asks: u32,

    pub(crate) waiting_tool_id: Option<String>,
    pub(crate) question_context: Option<String>,
    pub(crate) pending_text_question: bool,
    pub(crate) plan_approved: bool,
    pub(crate) auto_approve: bool,

    pub(crate) abort: Arc<AtomicBool>,
    pub(crate) logger: SessionLogger,
    pub(crate) trajectory: TrajectoryLogger,
    /// Per-turn memory of delegation outcomes.
    pub(crate) global_memory: Vec<String>,
    /// Conventional path Developers write their final report to.
    pub(crate) result_file: PathBuf,

    notif_tx: mpsc::UnboundedSender<SessionEvent>,
    notif_rx: mpsc::UnboundedReceiver<SessionEvent>,
}

impl Session {
    /// Build a session for `role_name` (the config's active role when
    /// `None`).  Tool servers are started separately via [`initialize`].
    pub fn new(
        config: Config,
        role_name: Option<&str>,
        gateway: Arc<Gateway>,
        auto_approve: bool,
        log_dir: impl AsRef<Path>,
    ) -> anyhow::Result<Self> {
        let role_name = role_name.unwrap_or(&config.active_role).to_string();
        let role = config
            .role(&role_name)
            .with_context(|| format!("unknown role: {role_name}"))?
            .clone();
        let active_provider = config
            .provider(&role.provider)
            .with_context(|| format!("role {role_name} references unknown provider {}", role.provider))?
            .clone();
        let active_model = role.model.clone();

        let session_id = format!("session_{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        let logger = SessionLogger::new(log_dir.as_ref());
        let trajectory = TrajectoryLogger::new(session_id, log_dir.as_ref());
        logger.log_raw("init", &format!("Session initialized for role: {role_name}"));

        let history = vec![Message::system(role.system_prompt.clone())];
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();

        Ok(Self {
            config,
            role_name,
            role,
            gateway,
            servers: HashMap::new(),
            tools_map: HashMap::new(),
            static_tools: Vec::new(),
            llm_tools: Vec::new(),
            sudo_tools: Vec::new(),
            history,
            mode: SessionMode::Plan,
            active_provider,
            active_model,
            stats: HashMap::new(),
            stats_by_role: HashMap::new(),
            delegation_counts: HashMap::new(),
            ask_user_count: 0,
            post_approval_asks: 0,
            waiting_tool_id: None,
            question_context: None,
            pending_text_question: false,
            plan_approved: false,
            auto_approve,
            abort: Arc::new(AtomicBool::new(false)),
            logger,
            trajectory,
            global_memory: Vec::new(),
            result_file: PathBuf::from("_task_result.txt"),
            notif_tx,
            notif_rx,
        })
    }

    /// Launch and handshake every tool server configured for the active role,
    /// then compute the active tool set.
    pub async fn initialize(&mut self, tx: &mpsc::Sender<SessionEvent>) -> anyhow::Result<()> {
        self.emit(tx, SessionEvent::status("Initializing tool servers...")).await;

        let server_configs: Vec<ToolServerConfig> = self
            .role
            .tool_servers
            .iter()
            .filter_map(|name| self.config.tool_servers.get(name))
            .filter(|c| c.enabled)
            .cloned()
            .collect();

        for server_conf in server_configs {
            let notif = self.notification_handler();
            let transport = ToolTransport::new(
                server_conf.command.clone(),
                server_conf.args.clone(),
                server_conf.env.clone(),
                Some(notif),
            );
            match transport.start().await {
                Ok(()) => {
                    let count = self
                        .register_tool_server(&server_conf.name, Arc::new(transport))
                        .await?;
                    self.emit(
                        tx,
                        SessionEvent::status(format!(
                            "Connected to {} ({count} tools)",
                            server_conf.name
                        )),
                    )
                    .await;
                }
                Err(e) => {
                    self.emit(
                        tx,
                        SessionEvent::error(format!(
                            "Failed to connect to {}: {e}",
                            server_conf.name
                        )),
                    )
                    .await;
                }
            }
        }

        self.refresh_dynamic_tools();
        Ok(())
    }

    /// Register an already-started tool server and record its tools.
    /// Returns the number of tools discovered.
    pub async fn register_tool_server(
        &mut self,
        name: &str,
        server: Arc<dyn ToolServer>,
    ) -> anyhow::Result<usize> {
        let tools = server.list_tools().await?;
        let count = tools.len();
        for t in tools {
            self.tools_map.insert(t.name.clone(), name.to_string());
            self.static_tools.push(ToolSchema {
                name: t.name,
                description: t.description,
                parameters: t.input_schema,
            });
        }
        self.servers.insert(name.to_string(), server);
        self.refresh_dynamic_tools();
        Ok(count)
    }

    /// Handler given to transports: tool-progress notifications surface as
    /// `streaming` events.  Runs on the transport's reader task, so it only
    /// enqueues; the turn driver drains the queue between steps.
    fn notification_handler(&self) -> foreman_rpc::NotificationHandler {
        let tx = self.notif_tx.clone();
        Arc::new(move |method, params| {
            if method == "notifications/tool_progress" {
                let output = params["output"].as_str().unwrap_or("").to_string();
                let _ = tx.send(SessionEvent::streaming(output));
            }
        })
    }

    /// Rebuild the active tool set: role-filtered static tools plus the
    /// dynamic control tools (delegation, questions, privilege escalation).
    pub(crate) fn refresh_dynamic_tools(&mut self) {
        let mut combined = self.static_tools.clone();

        let other_roles: Vec<&String> = self
            .config
            .roles
            .keys()
            .filter(|r| **r != self.role_name)
            .collect();
        if !other_roles.is_empty() {
            combined.push(delegate_task_schema());
        }
        combined.push(ask_user_schema());
        if !self.sudo_tools.is_empty() {
            combined.push(request_admin_schema());
        }

        self.llm_tools = filter_tools_by_role(&combined, &self.role);
    }

    /// Tools available for the current mode (mode filter over the active
    /// set).  The Architect in EXECUTE is forbidden direct writes: it sees
    /// only delegation and read-only tools.
    pub(crate) fn tools_for_mode(&self) -> Vec<ToolSchema> {
        match self.mode {
            SessionMode::Plan => self
                .llm_tools
                .iter()
                .filter(|t| READ_ONLY_TOOLS.contains(&t.name.as_str()) || t.name == "ask_user")
                .cloned()
                .collect(),
            SessionMode::Execute => {
                if self.role_name == "architect" {
                    self.llm_tools
                        .iter()
                        .filter(|t| {
                            READ_ONLY_TOOLS.contains(&t.name.as_str()) || t.name == "delegate_task"
                        })
                        .cloned()
                        .collect()
                } else {
                    self.llm_tools
                        .iter()
                        .filter(|t| t.name != "ask_user")
                        .cloned()
                        .collect()
                }
            }
            SessionMode::Review => self
                .llm_tools
                .iter()
                .filter(|t| READ_ONLY_TOOLS.contains(&t.name.as_str()))
                .cloned()
                .collect(),
        }
    }

    /// Stash tool definitions behind the `request_admin_privileges` gate.
    pub fn set_sudo_tools(&mut self, tools: Vec<ToolSchema>) {
        self.sudo_tools = tools;
        self.refresh_dynamic_tools();
    }

    /// Move stashed sudo tools into the active set.  Returns `false` when
    /// there was nothing to unlock.
    pub fn enable_emergency_tools(&mut self) -> bool {
        if self.sudo_tools.is_empty() {
            return false;
        }
        self.logger.log_raw("action", "Emergency tools unlocked");
        let unlocked = std::mem::take(&mut self.sudo_tools);
        self.static_tools.extend(unlocked);
        self.refresh_dynamic_tools();
        true
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Explicit mode override.  No code path transitions into REVIEW today;
    /// this is the hook an embedding application (or a future post-review
    /// step) uses to enter it.
    pub fn set_mode(&mut self, mode: SessionMode) {
        self.mode = mode;
    }

    pub fn role_name(&self) -> &str {
        &self.role_name
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn log_path(&self) -> &Path {
        self.logger.path()
    }

    /// Shared abort flag; setting it cancels the turn at the next checkpoint.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Request cancellation and persist the trajectory collected so far.
    pub fn abort(&mut self) {
        self.abort.store(true, Ordering::SeqCst);
        self.logger.log_raw("action", "Abort signal received");
        if let Err(e) = self.trajectory.save() {
            warn!("failed to save trajectory on abort: {e:#}");
        }
    }

    pub(crate) fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Override the Developer result-file path (tests point this at a
    /// temporary directory).
    pub fn set_result_file(&mut self, path: PathBuf) {
        self.result_file = path;
    }

    /// Terminate tool servers and persist the trajectory.
    pub async fn shutdown(&mut self) {
        self.logger.log_raw("shutdown", "Session ended");
        if let Err(e) = self.trajectory.save() {
            warn!("failed to save trajectory on shutdown: {e:#}");
        }
        for server in self.servers.values() {
            server.stop().await;
        }
    }

    /// Restore user/assistant turns from a prior session's JSONL log and
    /// inject the resume warning.  Returns `false` when the log is missing.
    pub fn resume(&mut self, log_path: &Path) -> bool {
        let Ok(text) = std::fs::read_to_string(log_path) else {
            return false;
        };
        let mut restored: Vec<Message> = Vec::new();
        for line in text.lines() {
            let Ok(entry) = serde_json::from_str::<Value>(line) else { continue };
            let kind = entry["type"].as_str().unwrap_or("");
            let content = entry["content"].as_str().unwrap_or("");
            match kind {
                "user_msg" => restored.push(Message::user(content)),
                "text" if entry["metadata"]["role"].as_str() == Some(self.role_name.as_str()) => {
                    restored.push(Message::assistant(content))
                }
                _ => {}
            }
        }
        // Bound restored context; the tail carries the live task.
        if restored.len() > 20 {
            restored.drain(..restored.len() - 20);
        }
        self.history.extend(restored);
        self.history.push(Message::system(prompts::RESUME_WARNING));
        true
    }

    // ── Event plumbing ────────────────────────────────────────────────────────

    /// Log and deliver one event.  Every emitted event produces exactly one
    /// session-log line.
    pub(crate) async fn emit(&self, tx: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
        self.logger.log_event(&event);
        let _ = tx.send(event).await;
    }

    /// Forward queued transport notifications (tool progress) to the stream.
    pub(crate) async fn drain_notifications(&mut self, tx: &mpsc::Sender<SessionEvent>) {
        while let Ok(ev) = self.notif_rx.try_recv() {
            self.emit(tx, ev).await;
        }
    }

    /// Update token counters and emit a `stats` event.
    pub(crate) async fn record_usage(
        &mut self,
        tx: &mpsc::Sender<SessionEvent>,
        model_id: &str,
        usage: &Usage,
        role: &str,
    ) {
        let total = usage.total() as u64;
        if total == 0 {
            return;
        }
        *self.stats.entry(model_id.to_string()).or_insert(0) += total;
        *self
            .stats_by_role
            .entry(format!("{role}:{model_id}"))
            .or_insert(0) += total;

        let event = SessionEvent::with_meta(
            EventKind::Stats,
            "",
            json!({ "stats": { "by_model": self.stats, "by_role": self.stats_by_role } }),
        );
        self.emit(tx, event).await;
    }
}

/// Keep only tools the role's `allowed_tools` names; an empty allow-list
/// means no tools.
pub(crate) fn filter_tools_by_role(tools: &[ToolSchema], role: &RoleConfig) -> Vec<ToolSchema> {
    if role.allowed_tools.is_empty() {
        return Vec::new();
    }
    tools
        .iter()
        .filter(|t| role.allowed_tools.iter().any(|a| a == &t.name))
        .cloned()
        .collect()
}

// ── Dynamic tool schemas ──────────────────────────────────────────────────────

pub(crate) fn delegate_task_schema() -> ToolSchema {
    ToolSchema {
        name: "delegate_task".into(),
        description: "Delegate a structured task to the Development Team. \
                      Provide a clear specification."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "goal": { "type": "string", "description": "High-level goal of the task" },
                "constraints": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "List of constraints (e.g. 'Use React', 'No external libs')"
                },
                "focus_files": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "List of files to modify or focus on"
                },
                "verification_steps": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Steps the Reviewer should take to verify success"
                }
            },
            "required": ["goal", "constraints", "verification_steps"]
        }),
    }
}

pub(crate) fn ask_user_schema() -> ToolSchema {
    ToolSchema {
        name: "ask_user".into(),
        description: "Ask the user ONLY for: initial plan approval (ONE time), strategic \
                      decisions, destructive operations, or genuinely ambiguous requirements. \
                      DO NOT ask about implementation details, file paths, continuation of an \
                      approved plan, or routine operations."
            .into(),
        parameters: json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "Clear, concise question for the user" },
                "reason": {
                    "type": "string",
                    "enum": ["plan_approval", "strategic_decision", "destructive_operation", "ambiguous_requirement"],
                    "description": "Why user input is needed - enforces autonomy rules"
                },
                "options": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Suggested short answers (e.g. ['Yes', 'No'])"
                }
            },
            "required": ["question", "reason"]
        }),
    }
}

pub(crate) fn request_admin_schema() -> ToolSchema {
    ToolSchema {
        name: "request_admin_privileges".into(),
        description: "Unlock write permissions (write_file, run_shell). USE ONLY IF USER APPROVES."
            .into(),
        parameters: json!({ "type": "object", "properties": {} }),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
