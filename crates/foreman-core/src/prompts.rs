//! Mode banners, canned instructions, and phrase tables.

use crate::session::SessionMode;

/// Per-round system banner describing the current mode's rules.  Injected
/// into the transmitted history only, never stored.
pub fn mode_banner(mode: SessionMode) -> &'static str {
    match mode {
        SessionMode::Plan => {
            "[MODE: PLAN] You are in PLAN MODE. \
             Research the task using read-only tools (list_directory, read_file, glob, search_file_content). \
             Create a brief 3-5 step plan. \
             CRITICAL: When ready for approval, you MUST use the ask_user tool with reason='plan_approval'. \
             DO NOT ask questions in your text response like 'Would you like to proceed?' - use the ask_user TOOL instead. \
             You can ONLY use read-only tools and ask_user in this mode."
        }
        SessionMode::Execute => {
            "[MODE: EXECUTE] Plan approved. You are in EXECUTE MODE. \
             You MUST use delegate_task to assign work to the developer - DO NOT execute tasks yourself. \
             You only have access to delegate_task and read-only tools. \
             The write_file and run_shell_command tools are NOT available to you - the developer has them. \
             DO NOT ask questions. Proceed autonomously by delegating work."
        }
        SessionMode::Review => {
            "[MODE: REVIEW] You are in REVIEW MODE. \
             Verify the completed work using read-only tools. \
             Report findings and status."
        }
    }
}

/// Instruction stored in history when the plan is approved.
pub const EXECUTE_MODE_INSTRUCTION: &str =
    "[MODE: EXECUTE] Plan approved by user. You are NOW in EXECUTE mode. \
     The ask_user tool is DISABLED. Execute the plan step-by-step using delegate_task and other tools. \
     DO NOT ask any more questions. Proceed autonomously until completion.";

/// Rebuke stored in history when the model asks a textual question in EXECUTE.
pub const EXECUTE_TEXT_QUESTION_REBUKE: &str =
    "[SYSTEM] EXECUTE MODE - Questions are NOT allowed. \
     You asked a question in text which is forbidden. \
     Execute the plan NOW using delegate_task. DO NOT ask anything else.";

/// Instruction appended after a session log is restored into history.
pub const RESUME_WARNING: &str = "[SYSTEM]: SESSION RESUMED. \
     1. You are continuing a previous task. Review the context above. \
     2. WARNING: The environment (files, directories) may have changed since this session was saved. \
     3. CRITICAL: Before using any file path, VERIFY it exists using list_directory or glob. \
     4. If a project directory is missing, DO NOT recreate it immediately. SEARCH for it. If not found, ASK the user.";

/// Build the stay-in-PLAN instruction after a non-approval answer.
pub fn plan_revise_instruction(answer: &str) -> String {
    format!(
        "[MODE: PLAN] User response: '{answer}'. Adjust your plan based on this feedback. \
         Use ask_user(reason='plan_approval') again when ready to propose an updated plan."
    )
}

/// Words accepted as plan approval (case-insensitive, trimmed).
pub const APPROVAL_WORDS: &[&str] = &[
    "yes", "ok", "proceed", "go", "start", "approve", "approved", "y", "tak", "sure",
];

pub fn is_approval(input: &str) -> bool {
    let normalized = input.trim().to_lowercase();
    APPROVAL_WORDS.iter().any(|w| *w == normalized)
}

/// Interrogative phrases that betray a textual question the model should
/// have routed through the ask_user tool.
pub const QUESTION_PATTERNS: &[&str] = &[
    "would you like to proceed",
    "shall i proceed",
    "do you want me to",
    "should i continue",
    "can i proceed",
    "proceed with this plan",
    "approve this plan",
    "is this ok",
    "is that ok",
    "czy mogę kontynuować",
    "czy kontynuować",
    "czy zatwierdzasz",
    "czy chcesz",
];

/// Return the matched pattern when `content` contains a textual question.
pub fn detect_text_question(content: &str) -> Option<&'static str> {
    let lower = content.to_lowercase();
    QUESTION_PATTERNS.iter().copied().find(|p| lower.contains(p))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn approval_words_match_case_insensitively() {
        assert!(is_approval("yes"));
        assert!(is_approval("  YES  "));
        assert!(is_approval("Tak"));
        assert!(is_approval("y"));
    }

    #[test]
    fn non_approval_answers_are_rejected() {
        assert!(!is_approval("no"));
        assert!(!is_approval("yes please change step 2"));
        assert!(!is_approval(""));
    }

    #[test]
    fn detects_english_text_question() {
        let content = "Here is my plan.\n\nWould you like to proceed?";
        assert_eq!(detect_text_question(content), Some("would you like to proceed"));
    }

    #[test]
    fn detects_polish_text_question() {
        assert_eq!(
            detect_text_question("Plan gotowy. Czy mogę kontynuować?"),
            Some("czy mogę kontynuować")
        );
    }

    #[test]
    fn plain_statements_are_not_questions() {
        assert!(detect_text_question("Proceeding with step 1 now.").is_none());
    }

    #[test]
    fn banners_name_their_mode() {
        assert!(mode_banner(SessionMode::Plan).starts_with("[MODE: PLAN]"));
        assert!(mode_banner(SessionMode::Execute).starts_with("[MODE: EXECUTE]"));
        assert!(mode_banner(SessionMode::Review).starts_with("[MODE: REVIEW]"));
    }
}
