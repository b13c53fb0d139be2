//! The delegation engine: a Developer↔Reviewer handoff loop with feedback,
//! bounded retries, and goal-oriented verification.
//!
//! A delegation runs in context isolation — the target role gets a fresh
//! conversation built from its system prompt and the serialized TaskSpec,
//! never the Architect's history.  Success requires the Reviewer's explicit
//! `APPROVED`; placeholder output short-circuits the attempt as rejected.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use foreman_config::ProviderConfig;
use foreman_model::{Adapter, Message, StreamEvent, ToolSchema, Usage};
use futures::StreamExt;

use crate::events::{EventKind, SessionEvent};
use crate::session::{
    filter_tools_by_role, Session, TaskResult, TaskSpec, DEVELOPER_INNER_ITERATIONS,
};

/// Stub phrases that betray placeholder output.  Deliberately a conservative
/// fixed list, scanned case-insensitively; not a similarity heuristic.
pub const PLACEHOLDER_PHRASES: &[&str] = &[
    "hello world",
    "lorem ipsum",
    "todo:",
    "fixme:",
    "placeholder",
    "template content",
    "your content here",
    "add your",
    "replace this",
];

/// Return the first placeholder phrase found in `text`.
pub fn contains_placeholder(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    PLACEHOLDER_PHRASES.iter().copied().find(|p| lower.contains(p))
}

/// Marker carried in the summary of a placeholder-rejected delegation.
pub const PLACEHOLDER_REJECTION: &str = "[BLOCKED] Placeholder content detected. Work REJECTED.";

/// State of a single delegation.  Terminals are `Approved` and `Exhausted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationPhase {
    Idle,
    Developing,
    Reviewing,
    Approved,
    Feedback,
    Exhausted,
}

impl DelegationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Developing => "developing",
            Self::Reviewing => "reviewing",
            Self::Approved => "approved",
            Self::Feedback => "feedback",
            Self::Exhausted => "exhausted",
        }
    }
}

impl Session {
    /// Run one delegation to `target_role` with up to `max_retries` attempts.
    /// The quota check happens in the dispatcher before this is called.
    pub(crate) async fn run_delegation(
        &mut self,
        target_role: &str,
        spec: &TaskSpec,
        max_retries: u32,
        tx: &mpsc::Sender<SessionEvent>,
    ) -> TaskResult {
        let Some(dev_cfg) = self.config.role(target_role).cloned() else {
            return TaskResult::failure(
                format!("No role named '{target_role}' is configured."),
                "Not run",
            );
        };
        let Some(dev_provider) = self.config.provider(&dev_cfg.provider).cloned() else {
            return TaskResult::failure(
                format!("Role '{target_role}' references unknown provider '{}'.", dev_cfg.provider),
                "Not run",
            );
        };

        // Stale reports from a previous delegation must not be mistaken for
        // this task's output.
        let _ = std::fs::remove_file(&self.result_file);

        // Context isolation: the sub-conversation starts from scratch.
        let mut history = vec![
            Message::system(dev_cfg.system_prompt.clone()),
            Message::user(format!(
                "TASK SPECIFICATION:\n{}\nExecute this task. Use tools. When done, write your \
                 final report to '{}' and make sure that file exists.",
                spec.to_prompt(),
                self.result_file.display()
            )),
        ];

        let excluded = ["ask_user", "request_admin_privileges", "delegate_task"];
        let mut pool = self.static_tools.clone();
        pool.extend(self.sudo_tools.clone());
        let dev_tools: Vec<ToolSchema> = filter_tools_by_role(&pool, &dev_cfg)
            .into_iter()
            .filter(|t| !excluded.contains(&t.name.as_str()))
            .collect();

        let adapter = Adapter::for_model(&dev_cfg.model);
        let mut last_output = String::new();

        for attempt in 1..=max_retries {
            if self.aborted() {
                return TaskResult::failure("Cancelled by user.", "Not run");
            }

            let mut phase = DelegationPhase::Developing;
            let mut placeholder_hit: Option<&'static str> = None;
            let mut captured_stdout = String::new();

            // ── Developer phase ──────────────────────────────────────────────
            for iteration in 1..=DEVELOPER_INNER_ITERATIONS {
                if self.aborted() {
                    return TaskResult::failure("Cancelled by user.", "Not run");
                }
                self.emit(
                    tx,
                    SessionEvent::with_meta(
                        EventKind::Status,
                        format!("Developer attempt {attempt}/{max_retries} (iter {iteration})"),
                        json!({
                            "role": target_role,
                            "model_id": dev_cfg.model,
                            "iteration": attempt,
                            "max_iterations": max_retries,
                            "phase": phase.as_str(),
                        }),
                    ),
                )
                .await;

                let turn = self
                    .stream_as_role(
                        tx,
                        &dev_provider,
                        &dev_cfg.model,
                        &history,
                        &dev_tools,
                        dev_cfg.temperature,
                        target_role,
                    )
                    .await;
                let (message, usage) = match turn {
                    Ok(pair) => pair,
                    Err(e) => {
                        self.emit(
                            tx,
                            SessionEvent::with_meta(
                                EventKind::Error,
                                format!("Developer error: {e:#}"),
                                json!({ "role": target_role }),
                            ),
                        )
                        .await;
                        break;
                    }
                };
                self.record_usage(tx, &dev_cfg.model, &usage, target_role).await;

                let parsed = adapter.parse_response(message.text(), &message.tool_calls);
                if let Some(content) = &parsed.content {
                    if !content.is_empty() {
                        self.emit(
                            tx,
                            SessionEvent::with_meta(
                                EventKind::Reasoning,
                                content.clone(),
                                json!({ "role": target_role, "model_id": dev_cfg.model }),
                            ),
                        )
                        .await;
                    }
                }
                history.push(Message::assistant_with_calls(
                    parsed.content.clone(),
                    parsed.tool_calls.clone(),
                ));

                if parsed.tool_calls.is_empty() {
                    break;
                }

                // Execute every requested call in listed order; results are
                // appended in the same order.
                for tc in &parsed.tool_calls {
                    if self.aborted() {
                        return TaskResult::failure("Cancelled by user.", "Not run");
                    }
                    let args = tc.parsed_args();
                    let preview = args
                        .as_object()
                        .map(|o| {
                            o.iter()
                                .take(2)
                                .map(|(k, v)| {
                                    let val: String =
                                        v.to_string().chars().take(25).collect();
                                    format!("{k}={val}")
                                })
                                .collect::<Vec<_>>()
                                .join(", ")
                        })
                        .unwrap_or_default();
                    self.emit(
                        tx,
                        SessionEvent::with_meta(
                            EventKind::ToolCall,
                            format!("{target_role} -> {}({preview})", tc.function.name),
                            json!({
                                "role": target_role,
                                "name": tc.function.name,
                                "arguments": args,
                            }),
                        ),
                    )
                    .await;
                    self.trajectory.log_tool_call(&tc.function.name, args.clone());

                    let result = self.call_tool_raw(&tc.function.name, args).await;

                    // Goal-oriented verification gate: stub content read back
                    // from disk poisons the whole attempt.
                    if tc.function.name == "read_file" {
                        if let Some(phrase) = contains_placeholder(&result) {
                            placeholder_hit = Some(phrase);
                            self.emit(
                                tx,
                                SessionEvent::with_meta(
                                    EventKind::Log,
                                    format!("Placeholder content detected! (phrase: '{phrase}')"),
                                    json!({ "role": "system" }),
                                ),
                            )
                            .await;
                        }
                    }
                    if tc.function.name == "run_shell_command" && result.contains("STDOUT") {
                        captured_stdout = result.clone();
                    }

                    let result_preview: String = result.chars().take(100).collect();
                    self.emit(
                        tx,
                        SessionEvent::with_meta(
                            EventKind::ToolResult,
                            format!("Result: {result_preview}..."),
                            json!({
                                "role": target_role,
                                "name": tc.function.name,
                                "full_result": result,
                            }),
                        ),
                    )
                    .await;
                    history.push(Message::tool_result(&tc.id, &tc.function.name, result));
                }

                self.drain_notifications(tx).await;
            }

            // ── Output collection (priority order) ───────────────────────────
            last_output = self
                .collect_developer_output(&history, &captured_stdout)
                .unwrap_or_else(|| "No result produced.".to_string());

            // ── Placeholder rejection: forced retry, Reviewer not consulted ──
            if let Some(phrase) = placeholder_hit {
                phase = DelegationPhase::Feedback;
                self.trajectory.log_decision(
                    "delegation_verdict",
                    &["approved", "feedback", "exhausted"],
                    phase.as_str(),
                    &format!("placeholder phrase '{phrase}' in produced file"),
                    json!({ "task_id": spec.id }),
                );
                self.emit(
                    tx,
                    SessionEvent::with_meta(
                        EventKind::Log,
                        format!(
                            "Attempt {attempt} rejected: placeholder content. Retrying ({attempt}/{max_retries})..."
                        ),
                        json!({ "role": "system" }),
                    ),
                )
                .await;
                history.push(Message::system(
                    "[SYSTEM] Placeholder content was detected in the files you produced. \
                     This attempt is REJECTED and must NOT be reported as success. \
                     Replace the placeholder content with the real, complete result and redo \
                     the verification steps.",
                ));
                if attempt == max_retries {
                    return TaskResult::failure(PLACEHOLDER_REJECTION, "Rejected by placeholder gate");
                }
                continue;
            }

            // ── Reviewer phase ───────────────────────────────────────────────
            phase = DelegationPhase::Reviewing;
            let Some(rev_cfg) = self.config.role("reviewer").cloned() else {
                // No reviewer configured: auto-accept.
                return TaskResult::success(last_output, "Skipped (No Reviewer)");
            };
            let Some(rev_provider) = self.config.provider(&rev_cfg.provider).cloned() else {
                return TaskResult::failure(
                    last_output,
                    format!("Reviewer references unknown provider '{}'.", rev_cfg.provider),
                );
            };

            self.emit(
                tx,
                SessionEvent::with_meta(
                    EventKind::Log,
                    "Reviewing work...",
                    json!({ "role": "system", "phase": phase.as_str() }),
                ),
            )
            .await;

            let verification_prompt = format!(
                "ORIGINAL SPEC:\n{}\n\nDEVELOPER OUTPUT:\n{}\n\n\
                 Verify if the goal and constraints are met.\n\
                 If YES, start your response with 'APPROVED'.\n\
                 If NO, provide constructive feedback to fix the issues.",
                spec.to_prompt(),
                last_output
            );
            let rev_history = vec![
                Message::system(rev_cfg.system_prompt.clone()),
                Message::user(verification_prompt),
            ];

            let review = self
                .stream_as_role(
                    tx,
                    &rev_provider,
                    &rev_cfg.model,
                    &rev_history,
                    &[],
                    rev_cfg.temperature,
                    "reviewer",
                )
                .await;
            let (review_msg, review_usage) = match review {
                Ok(pair) => pair,
                Err(e) => {
                    self.emit(
                        tx,
                        SessionEvent::with_meta(
                            EventKind::Error,
                            format!("Reviewer error: {e:#}"),
                            json!({ "role": "reviewer" }),
                        ),
                    )
                    .await;
                    break;
                }
            };
            self.record_usage(tx, &rev_cfg.model, &review_usage, "reviewer").await;

            let feedback = review_msg.text().to_string();
            if feedback.trim_start().starts_with("APPROVED") {
                self.trajectory.log_decision(
                    "delegation_verdict",
                    &["approved", "feedback", "exhausted"],
                    DelegationPhase::Approved.as_str(),
                    "",
                    json!({ "task_id": spec.id, "attempt": attempt }),
                );
                self.emit(
                    tx,
                    SessionEvent::with_meta(
                        EventKind::Log,
                        "Task verified & approved!",
                        json!({ "role": "system" }),
                    ),
                )
                .await;
                return TaskResult::success(last_output, feedback);
            }

            // Feedback loop: the Developer conversation continues with the
            // Reviewer's objections.
            self.trajectory.log_decision(
                "delegation_verdict",
                &["approved", "feedback", "exhausted"],
                DelegationPhase::Feedback.as_str(),
                &feedback,
                json!({ "task_id": spec.id, "attempt": attempt }),
            );
            self.emit(
                tx,
                SessionEvent::with_meta(
                    EventKind::Log,
                    format!("Verification failed. Retrying ({attempt}/{max_retries})..."),
                    json!({ "role": "system" }),
                ),
            )
            .await;
            history.push(Message::user(format!(
                "[REVIEWER FEEDBACK]: {feedback}\n\nPlease fix these issues and provide the updated output."
            )));
        }

        self.trajectory.log_decision(
            "delegation_verdict",
            &["approved", "feedback", "exhausted"],
            DelegationPhase::Exhausted.as_str(),
            "max retries reached",
            json!({ "task_id": spec.id }),
        );
        TaskResult::failure(last_output, "Max retries reached")
    }

    /// Developer output, in priority order: the conventional result file, the
    /// captured stdout of the last shell command, the last assistant text.
    fn collect_developer_output(
        &self,
        history: &[Message],
        captured_stdout: &str,
    ) -> Option<String> {
        if let Ok(text) = std::fs::read_to_string(&self.result_file) {
            if !text.trim().is_empty() {
                return Some(text);
            }
        }
        if !captured_stdout.is_empty() {
            return Some(captured_stdout.to_string());
        }
        history
            .iter()
            .rev()
            .find(|m| m.role == foreman_model::Role::Assistant && !m.text().is_empty())
            .map(|m| m.text().to_string())
    }

    /// One streaming completion attributed to an arbitrary role, used by both
    /// halves of the delegation loop (and the top-level driver when the
    /// active provider streams).
    pub(crate) async fn stream_as_role(
        &mut self,
        tx: &mpsc::Sender<SessionEvent>,
        provider: &ProviderConfig,
        model: &str,
        history: &[Message],
        tools: &[ToolSchema],
        temperature: f32,
        role_label: &str,
    ) -> anyhow::Result<(Message, Usage)> {
        let mut stream = self
            .gateway
            .chat_complete_stream(
                provider,
                model,
                history,
                tools,
                temperature,
                Arc::clone(&self.abort),
            )
            .await;

        while let Some(event) = stream.next().await {
            match event {
                StreamEvent::Chunk(chunk) => {
                    self.emit(
                        tx,
                        SessionEvent::with_meta(
                            EventKind::Streaming,
                            chunk,
                            json!({ "role": role_label, "model_id": model }),
                        ),
                    )
                    .await;
                }
                StreamEvent::Done { message, usage } => return Ok((message, usage)),
                StreamEvent::Error(e) => anyhow::bail!(e),
            }
        }
        anyhow::bail!("streaming completed without final message")
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
