//! The per-turn driver loop: one user input in, a bounded number of
//! reasoning rounds, tool dispatch, question gating, and provider failover.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;

use foreman_config::{AutonomyLevel, ProviderFamily};
use foreman_model::{Message, ToolCall, Usage};

use crate::events::{EventKind, SessionEvent};
use crate::history::prune;
use crate::prompts;
use crate::session::{
    Session, SessionMode, TaskSpec, TaskStatus, MAX_DELEGATIONS_PER_ROLE, MAX_ASK_USER_PER_TASK,
    MAX_ROUNDS, DELEGATION_RETRIES,
};

/// How a turn ended: either the model produced a final answer, or the turn is
/// suspended waiting for the user to answer a question (resume by calling
/// `process_user_input` with the answer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Suspended,
}

enum Dispatch {
    Continue,
    Suspend,
}

impl Session {
    /// Service one user input.  Emits events on `tx` throughout; the event
    /// stream for the turn ends when this returns.
    pub async fn process_user_input(
        &mut self,
        user_input: &str,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> anyhow::Result<TurnOutcome> {
        self.abort.store(false, std::sync::atomic::Ordering::SeqCst);
        self.delegation_counts.clear();
        self.post_approval_asks = 0;
        self.logger.log_raw("user_msg", user_input);

        if let Some(waiting_id) = self.waiting_tool_id.take() {
            self.resume_from_question(waiting_id, user_input, tx).await;
        } else {
            self.accept_new_input(user_input, tx).await;
        }

        self.run_turn_loop(tx).await
    }

    /// The pending question's answer arrives as this turn's input: record it
    /// as the tool result and apply the mode transition rules.
    async fn resume_from_question(
        &mut self,
        waiting_id: String,
        user_input: &str,
        tx: &mpsc::Sender<SessionEvent>,
    ) {
        let mut answer = user_input.to_string();
        if self.auto_approve && self.question_context.as_deref() == Some("plan_approval") {
            answer = "yes".into();
            self.emit(
                tx,
                SessionEvent::log("[AUTO-APPROVE] Plan automatically approved by flag."),
            )
            .await;
        }

        self.history
            .push(Message::tool_result(waiting_id, "ask_user", answer.clone()));

        let context = self.question_context.take();
        if context.as_deref() == Some("plan_approval") {
            if prompts::is_approval(&answer) {
                self.mode = SessionMode::Execute;
                self.plan_approved = true;
                self.emit(tx, SessionEvent::status("Plan approved. Entering EXECUTE mode."))
                    .await;
                self.emit(
                    tx,
                    SessionEvent::with_meta(
                        EventKind::Log,
                        format!("[MODE TRANSITION] PLAN -> EXECUTE (user said: {answer})"),
                        json!({ "from": "plan", "to": "execute" }),
                    ),
                )
                .await;
                self.history
                    .push(Message::system(prompts::EXECUTE_MODE_INSTRUCTION));
            } else {
                self.emit(tx, SessionEvent::log(format!("User answered: {answer}")))
                    .await;
                self.history
                    .push(Message::system(prompts::plan_revise_instruction(&answer)));
            }
        }
    }

    /// A fresh user input (no question pending).  A bare approval word may
    /// still answer a question the model asked in text instead of through the
    /// ask_user tool.
    async fn accept_new_input(&mut self, user_input: &str, tx: &mpsc::Sender<SessionEvent>) {
        if self.pending_text_question
            && self.mode == SessionMode::Plan
            && prompts::is_approval(user_input)
        {
            self.mode = SessionMode::Execute;
            self.plan_approved = true;
            self.pending_text_question = false;

            self.emit(
                tx,
                SessionEvent::status("Plan approved (via text). Entering EXECUTE mode."),
            )
            .await;
            self.emit(
                tx,
                SessionEvent::with_meta(
                    EventKind::Log,
                    format!("[MODE TRANSITION] PLAN -> EXECUTE (text-question approval: '{user_input}')"),
                    json!({ "from": "plan", "to": "execute" }),
                ),
            )
            .await;

            self.history.push(Message::user(user_input));
            self.history
                .push(Message::system(prompts::EXECUTE_MODE_INSTRUCTION));
        } else {
            self.pending_text_question = false;
            self.history.push(Message::user(user_input));
        }
    }

    /// Iteration-bounded reasoning loop.
    async fn run_turn_loop(
        &mut self,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> anyhow::Result<TurnOutcome> {
        for _round in 0..MAX_ROUNDS {
            if self.aborted() {
                self.emit(tx, SessionEvent::error("Operation cancelled by user.")).await;
                return Ok(TurnOutcome::Completed);
            }
            self.drain_notifications(tx).await;
            self.emit(
                tx,
                SessionEvent::status(format!("Thinking ({})...", self.active_provider.name)),
            )
            .await;

            let Some((response, usage)) = self.complete_with_failover(tx).await else {
                // Providers exhausted or cancelled; events already emitted.
                return Ok(TurnOutcome::Completed);
            };

            let model = self.active_model.clone();
            let role = self.role_name.clone();
            self.record_usage(tx, &model, &usage, &role).await;
            self.history.push(response.clone());

            let mut blocked_text_question = false;
            if !response.text().is_empty() {
                self.emit(
                    tx,
                    SessionEvent::with_meta(
                        EventKind::Text,
                        response.text(),
                        json!({
                            "role": self.role_name,
                            "model_id": self.active_model,
                            "provider": self.active_provider.name,
                        }),
                    ),
                )
                .await;

                if let Some(pattern) = prompts::detect_text_question(response.text()) {
                    match self.mode {
                        SessionMode::Plan => {
                            // The next user input may serve as plan approval.
                            self.pending_text_question = true;
                            self.emit(
                                tx,
                                SessionEvent::log(format!(
                                    "Detected text-based question in PLAN mode (pattern: '{pattern}')"
                                )),
                            )
                            .await;
                        }
                        SessionMode::Execute => {
                            // Questions are forbidden here: rebuke and force
                            // the model to act in the next round.
                            self.post_approval_asks += 1;
                            self.emit(
                                tx,
                                SessionEvent::log(format!(
                                    "Blocked text-based question in EXECUTE mode (pattern: '{pattern}')"
                                )),
                            )
                            .await;
                            self.history
                                .push(Message::system(prompts::EXECUTE_TEXT_QUESTION_REBUKE));
                            if self.post_approval_asks >= 3 {
                                self.emit(
                                    tx,
                                    SessionEvent::error(
                                        "Model keeps asking questions in EXECUTE mode - forcing action",
                                    ),
                                )
                                .await;
                            }
                            blocked_text_question = true;
                        }
                        SessionMode::Review => {}
                    }
                }
            }
            if blocked_text_question {
                continue;
            }

            if response.tool_calls.is_empty() {
                break;
            }

            for tc in &response.tool_calls {
                if self.aborted() {
                    self.emit(tx, SessionEvent::error("Operation cancelled by user.")).await;
                    return Ok(TurnOutcome::Completed);
                }
                match self.dispatch_tool_call(tc, tx).await {
                    Dispatch::Continue => {}
                    Dispatch::Suspend => return Ok(TurnOutcome::Suspended),
                }
            }
        }

        Ok(TurnOutcome::Completed)
    }

    /// Ask the gateway for the next assistant message, switching providers on
    /// failure until none remain untried.  The model id is preserved across
    /// failovers; `None` means the turn must end (events already emitted).
    async fn complete_with_failover(
        &mut self,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> Option<(Message, Usage)> {
        let mut tried: Vec<String> = Vec::new();
        loop {
            if self.aborted() {
                self.emit(tx, SessionEvent::error("Operation cancelled by user.")).await;
                return None;
            }

            let mut transmitted = prune(&self.history, 6);
            transmitted.push(Message::system(prompts::mode_banner(self.mode)));
            let tools = self.tools_for_mode();
            let provider = self.active_provider.clone();
            let model = self.active_model.clone();
            let temperature = self.role.temperature;

            // Slow local providers stream so the user sees progress; hosted
            // providers complete in one await.
            let use_streaming = provider.family == ProviderFamily::Ollama;
            let result = if use_streaming {
                self.stream_completion(tx, &transmitted, &tools, temperature).await
            } else {
                self.gateway
                    .chat_complete(
                        &provider,
                        &model,
                        &transmitted,
                        &tools,
                        temperature,
                        Arc::clone(&self.abort),
                    )
                    .await
            };

            match result {
                Ok(pair) => return Some(pair),
                Err(e) => {
                    if self.aborted() {
                        self.emit(tx, SessionEvent::error("Operation cancelled by user.")).await;
                        return None;
                    }
                    self.emit(tx, SessionEvent::error(format!("Provider error: {e:#}"))).await;
                    tried.push(provider.name.clone());

                    let fallback = self
                        .config
                        .fallback_provider(&provider.name, &tried)
                        .cloned();
                    match fallback {
                        Some(fallback) => {
                            self.emit(
                                tx,
                                SessionEvent::with_meta(
                                    EventKind::Log,
                                    format!(
                                        "Failover: switching provider {} -> {}, keeping model {}",
                                        provider.name, fallback.name, model
                                    ),
                                    json!({
                                        "from_provider": provider.name,
                                        "to_provider": fallback.name,
                                        "model_id": model,
                                    }),
                                ),
                            )
                            .await;
                            self.trajectory
                                .log_error("provider-rejected", &format!("{e:#}"), "failover");
                            self.active_provider = fallback;
                            // active_model intentionally unchanged.
                        }
                        None => {
                            self.emit(
                                tx,
                                SessionEvent::error("No fallback available (all providers tried)."),
                            )
                            .await;
                            self.trajectory
                                .log_error("provider-rejected", &format!("{e:#}"), "abort");
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Streaming completion for the top-level loop: chunks surface as
    /// `streaming` events, the final message is returned whole.
    async fn stream_completion(
        &mut self,
        tx: &mpsc::Sender<SessionEvent>,
        transmitted: &[Message],
        tools: &[foreman_model::ToolSchema],
        temperature: f32,
    ) -> anyhow::Result<(Message, Usage)> {
        let provider = self.active_provider.clone();
        let model = self.active_model.clone();
        let role = self.role_name.clone();
        self.stream_as_role(tx, &provider, &model, transmitted, tools, temperature, &role)
            .await
    }

    // ── Tool-call dispatch ────────────────────────────────────────────────────

    async fn dispatch_tool_call(
        &mut self,
        tc: &ToolCall,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> Dispatch {
        let name = tc.function.name.clone();
        let args = tc.parsed_args();

        if name == "ask_user" {
            return self.handle_ask_user(tc, &args, tx).await;
        }

        self.emit(
            tx,
            SessionEvent::with_meta(
                EventKind::ToolCall,
                format!("Using tool: {name}"),
                json!({
                    "name": name,
                    "role": self.role_name,
                    "model_id": self.active_model,
                    "arguments": args,
                }),
            ),
        )
        .await;
        self.trajectory.log_tool_call(&name, args.clone());

        let result_str = if name == "request_admin_privileges" {
            if self.enable_emergency_tools() {
                self.emit(tx, SessionEvent::log("Admin privileges unlocked")).await;
                "SYSTEM: Admin privileges GRANTED.".to_string()
            } else {
                "SYSTEM: You already have admin privileges.".to_string()
            }
        } else if name == "delegate_task" {
            self.handle_delegate_task(&args, tx).await
        } else {
            self.execute_server_tool(&name, args, tx).await
        };

        self.history.push(Message::tool_result(&tc.id, &name, result_str));
        self.drain_notifications(tx).await;
        Dispatch::Continue
    }

    /// Clean arguments and dispatch to the transport whose registry contains
    /// the tool.  No events; callers attribute the call to their own role.
    pub(crate) async fn call_tool_raw(&self, name: &str, mut args: Value) -> String {
        clean_path_args(&mut args);

        let Some(server_name) = self.tools_map.get(name).cloned() else {
            return "Error: Tool not found".to_string();
        };
        let server = Arc::clone(&self.servers[&server_name]);
        match server.call_tool(name, args).await {
            Ok(out) => out,
            Err(e) => format!("Tool Execution Error: {e:#}"),
        }
    }

    /// Dispatch to a tool server and emit the result event for the active
    /// role.
    pub(crate) async fn execute_server_tool(
        &mut self,
        name: &str,
        args: Value,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> String {
        let result = self.call_tool_raw(name, args).await;

        let preview: String = result.chars().take(100).collect();
        self.emit(
            tx,
            SessionEvent::with_meta(
                EventKind::ToolResult,
                format!("Result: {preview}..."),
                json!({
                    "role": self.role_name,
                    "model_id": self.active_model,
                    "name": name,
                    "full_result": result,
                }),
            ),
        )
        .await;
        result
    }

    /// The ask_user gating matrix: mode gates first, then autonomy, then the
    /// per-turn question budget.  Only a surviving call suspends the turn.
    async fn handle_ask_user(
        &mut self,
        tc: &ToolCall,
        args: &Value,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> Dispatch {
        let question = args["question"].as_str().unwrap_or("").to_string();
        let reason = args["reason"].as_str().unwrap_or("unknown").to_string();
        let options = args["options"].clone();

        if self.mode == SessionMode::Execute {
            self.post_approval_asks += 1;
            let result = if self.post_approval_asks >= 3 {
                self.emit(
                    tx,
                    SessionEvent::error("Model keeps asking in EXECUTE mode - forcing stop"),
                )
                .await;
                "[CRITICAL] EXECUTE MODE - ask_user is DISABLED. You have tried 3 times. \
                 Execute the plan NOW using delegate_task."
                    .to_string()
            } else {
                "[SYSTEM] You are in EXECUTE MODE. The ask_user tool is disabled. \
                 Proceed with the plan using delegate_task or other tools."
                    .to_string()
            };
            self.emit(
                tx,
                SessionEvent::log(format!("Blocked ask_user in EXECUTE mode: {question}")),
            )
            .await;
            self.history.push(Message::tool_result(&tc.id, "ask_user", result));
            return Dispatch::Continue;
        }

        if self.mode == SessionMode::Review {
            self.emit(
                tx,
                SessionEvent::log(format!("Blocked ask_user in REVIEW mode: {question}")),
            )
            .await;
            self.history.push(Message::tool_result(
                &tc.id,
                "ask_user",
                "[SYSTEM] You are in REVIEW MODE. No questions allowed. \
                 Use read-only tools to verify and report findings.",
            ));
            return Dispatch::Continue;
        }

        if self.mode == SessionMode::Plan && reason != "plan_approval" {
            self.emit(
                tx,
                SessionEvent::log(format!("Blocked non-plan_approval question: {question}")),
            )
            .await;
            self.history.push(Message::tool_result(
                &tc.id,
                "ask_user",
                "[SYSTEM] In PLAN MODE, only ask_user(reason='plan_approval') is allowed. \
                 Use tools to gather information instead of asking clarifying questions.",
            ));
            return Dispatch::Continue;
        }

        if self.role.autonomy == AutonomyLevel::Autonomous {
            self.emit(
                tx,
                SessionEvent::log(format!("Skipped question (autonomous mode): {question}")),
            )
            .await;
            self.history.push(Message::tool_result(
                &tc.id,
                "ask_user",
                "[SYSTEM] Autonomous mode - proceeding without user input. Making best judgment.",
            ));
            return Dispatch::Continue;
        }

        self.ask_user_count += 1;
        if self.ask_user_count > MAX_ASK_USER_PER_TASK {
            self.emit(
                tx,
                SessionEvent::log(format!("Question limit reached, skipping: {question}")),
            )
            .await;
            self.history.push(Message::tool_result(
                &tc.id,
                "ask_user",
                format!(
                    "[SYSTEM] Question limit ({MAX_ASK_USER_PER_TASK}) reached - proceeding with best judgment."
                ),
            ));
            return Dispatch::Continue;
        }

        self.waiting_tool_id = Some(tc.id.clone());
        self.question_context = Some(reason.clone());
        self.emit(
            tx,
            SessionEvent::with_meta(
                EventKind::Question,
                question,
                json!({ "role": self.role_name, "options": options, "reason": reason }),
            ),
        )
        .await;
        Dispatch::Suspend
    }

    /// Construct a TaskSpec and hand it to the delegation engine, enforcing
    /// the per-turn delegation quota first.
    async fn handle_delegate_task(
        &mut self,
        args: &Value,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> String {
        let target = "developer";

        let count = {
            let c = self.delegation_counts.entry(target.to_string()).or_insert(0);
            *c += 1;
            *c
        };
        if count > MAX_DELEGATIONS_PER_ROLE {
            self.emit(
                tx,
                SessionEvent::with_meta(
                    EventKind::Error,
                    format!("Delegation limit reached for {target}"),
                    json!({ "role": self.role_name }),
                ),
            )
            .await;
            return format!(
                "ERROR: Exceeded maximum delegations to {target} ({MAX_DELEGATIONS_PER_ROLE})."
            );
        }

        let spec = TaskSpec {
            id: format!("task_{count}"),
            goal: args["goal"].as_str().unwrap_or("").to_string(),
            constraints: string_vec(&args["constraints"]),
            focus_files: string_vec(&args["focus_files"]),
            verification_steps: string_vec(&args["verification_steps"]),
        };

        self.emit(
            tx,
            SessionEvent::with_meta(
                EventKind::Log,
                format!("Refining plan -> Developer: {}", spec.goal),
                json!({ "role": self.role_name }),
            ),
        )
        .await;

        let summary_line: String = if spec.goal.chars().count() > 50 {
            let head: String = spec.goal.chars().take(50).collect();
            format!("{head}...")
        } else {
            spec.goal.clone()
        };
        self.emit(
            tx,
            SessionEvent::with_meta(
                EventKind::TodoAdd,
                summary_line,
                json!({ "id": spec.id, "status": "pending" }),
            ),
        )
        .await;
        self.emit(
            tx,
            SessionEvent::with_meta(
                EventKind::TodoUpdate,
                "",
                json!({ "id": spec.id, "status": "in_progress" }),
            ),
        )
        .await;

        let result = self
            .run_delegation(target, &spec, DELEGATION_RETRIES, tx)
            .await;

        self.global_memory.push(format!(
            "[Task {} Result]: {} (Verification: {})",
            spec.id, result.summary, result.verification_text
        ));

        let ui_status = match result.status {
            TaskStatus::Success => "completed",
            TaskStatus::Failure => "failed",
        };
        self.emit(
            tx,
            SessionEvent::with_meta(
                EventKind::TodoUpdate,
                "",
                json!({ "id": spec.id, "status": ui_status }),
            ),
        )
        .await;
        self.emit(
            tx,
            SessionEvent::with_meta(
                EventKind::Text,
                format!("FINAL REPORT ({target}):\n{}", result.summary),
                json!({ "role": target }),
            ),
        )
        .await;

        format!(
            "Final Report from Developer/Reviewer Team:\n{}\n\nVerification: {}",
            result.summary, result.verification_text
        )
    }
}

/// Collect a JSON array of strings, ignoring non-string entries.
fn string_vec(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

/// Clean path arguments of model artifacts before they reach a tool server:
/// surrounding whitespace and quote pairs are stripped.
fn clean_path_args(args: &mut Value) {
    let Some(obj) = args.as_object_mut() else { return };
    if let Some(Value::String(path)) = obj.get_mut("path") {
        *path = clean_arg(path);
    }
}

fn clean_arg(raw: &str) -> String {
    let mut s = raw.trim();
    loop {
        let stripped = s
            .strip_prefix('"')
            .and_then(|rest| rest.strip_suffix('"'))
            .or_else(|| s.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')));
        match stripped {
            Some(inner) => s = inner.trim(),
            None => break,
        }
    }
    s.to_string()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
