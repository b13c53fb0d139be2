//! Conversation-history pruning.
//!
//! Keeps transmitted histories inside the context budget of small local
//! models without ever reordering or coalescing messages: system messages
//! survive verbatim, the recent tail survives verbatim, and only *old tool
//! outputs* are squeezed down to a head-and-tail excerpt.

use foreman_model::{Message, Role};

/// Content length above which an old tool result is truncated.
const TOOL_TRUNCATE_THRESHOLD: usize = 500;
/// Characters kept from each end of a truncated tool result.
const TOOL_KEEP_CHARS: usize = 200;

/// Prune `history` for transmission.
///
/// Rules:
/// 1. system messages are always kept, in original order;
/// 2. the last `keep_last_n` non-system messages are kept verbatim;
/// 3. older `tool` messages longer than 500 characters are replaced by a
///    head-and-tail excerpt recording the original length;
/// 4. older non-tool messages are kept intact.
pub fn prune(history: &[Message], keep_last_n: usize) -> Vec<Message> {
    let non_system_total = history.iter().filter(|m| m.role != Role::System).count();
    let tail_start = non_system_total.saturating_sub(keep_last_n);

    let mut pruned = Vec::with_capacity(history.len());
    let mut non_system_seen = 0usize;

    for msg in history {
        if msg.role == Role::System {
            pruned.push(msg.clone());
            continue;
        }

        let in_tail = non_system_seen >= tail_start;
        non_system_seen += 1;

        if in_tail {
            pruned.push(msg.clone());
            continue;
        }

        if msg.role == Role::Tool {
            let content = msg.text();
            if content.chars().count() > TOOL_TRUNCATE_THRESHOLD {
                let mut truncated = msg.clone();
                truncated.content = Some(truncate_middle(content));
                pruned.push(truncated);
                continue;
            }
        }

        pruned.push(msg.clone());
    }

    pruned
}

/// `head(200) … [TRUNCATED: n chars] … tail(200)`, on char boundaries.
fn truncate_middle(content: &str) -> String {
    let total = content.chars().count();
    let head: String = content.chars().take(TOOL_KEEP_CHARS).collect();
    let tail: String = {
        let skip = total.saturating_sub(TOOL_KEEP_CHARS);
        content.chars().skip(skip).collect()
    };
    format!("{head}... [TRUNCATED: {total} chars] ...{tail}")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn long_tool(id: usize, len: usize) -> Message {
        let body: String = "x".repeat(len);
        Message::tool_result(format!("c{id}"), "read_file", body)
    }

    #[test]
    fn recent_tail_is_kept_verbatim() {
        let mut history = vec![Message::system("sys")];
        for i in 0..10 {
            history.push(long_tool(i, 2000));
        }
        let pruned = prune(&history, 6);
        // Last 6 non-system messages untouched.
        for m in &pruned[pruned.len() - 6..] {
            assert_eq!(m.text().len(), 2000);
        }
    }

    #[test]
    fn old_tool_messages_get_head_tail_excerpt() {
        let mut history = vec![Message::system("sys")];
        for i in 0..10 {
            history.push(long_tool(i, 2000));
        }
        let pruned = prune(&history, 6);
        // First 4 non-system messages (indices 1..=4) are old and truncated.
        for m in &pruned[1..5] {
            let text = m.text();
            assert!(text.contains("[TRUNCATED: 2000 chars]"), "got: {text}");
            assert!(text.len() < 500);
        }
    }

    #[test]
    fn old_short_tool_messages_are_untouched() {
        let mut history = vec![long_tool(0, 100)];
        for i in 0..6 {
            history.push(Message::user(format!("u{i}")));
        }
        let pruned = prune(&history, 6);
        assert_eq!(pruned[0].text().len(), 100);
    }

    #[test]
    fn old_non_tool_messages_are_kept_intact() {
        let big = "y".repeat(3000);
        let mut history = vec![Message::assistant(big.clone())];
        for i in 0..6 {
            history.push(Message::user(format!("u{i}")));
        }
        let pruned = prune(&history, 6);
        assert_eq!(pruned[0].text(), big);
    }

    #[test]
    fn system_messages_survive_wherever_positioned() {
        let mut history = Vec::new();
        for i in 0..20 {
            if i % 5 == 0 {
                history.push(Message::system(format!("sys{i}")));
            } else {
                history.push(long_tool(i, 1000));
            }
        }
        let pruned = prune(&history, 6);
        let systems: Vec<&str> = pruned
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.text())
            .collect();
        assert_eq!(systems, vec!["sys0", "sys5", "sys10", "sys15"]);
    }

    #[test]
    fn never_reorders_messages() {
        let history = vec![
            Message::user("one"),
            Message::system("sys"),
            Message::assistant("two"),
            Message::user("three"),
        ];
        let pruned = prune(&history, 2);
        let texts: Vec<&str> = pruned.iter().map(|m| m.text()).collect();
        assert_eq!(texts, vec!["one", "sys", "two", "three"]);
    }

    #[test]
    fn prune_is_idempotent() {
        let mut history = vec![Message::system("sys")];
        for i in 0..12 {
            history.push(long_tool(i, 2000));
            history.push(Message::user(format!("u{i}")));
        }
        let once = prune(&history, 6);
        let twice = prune(&once, 6);
        assert_eq!(once, twice);
    }

    #[test]
    fn truncation_is_char_safe_on_multibyte_content() {
        let body = "ż".repeat(1000);
        let history = vec![
            Message::tool_result("c0", "read_file", body),
            Message::user("u1"),
            Message::user("u2"),
        ];
        let pruned = prune(&history, 2);
        let text = pruned[0].text();
        assert!(text.contains("[TRUNCATED: 1000 chars]"));
        assert!(text.starts_with(&"ż".repeat(10)));
    }

    #[test]
    fn spec_scenario_thirty_message_history() {
        // Messages 5–10 are tool messages with 2000-char bodies; 25–30 are
        // recent and must be untouched; system messages survive.
        let mut history: Vec<Message> = Vec::new();
        history.push(Message::system("prompt"));
        for i in 0..29 {
            if (4..10).contains(&i) {
                history.push(long_tool(i, 2000));
            } else {
                history.push(Message::user(format!("msg{i}")));
            }
        }
        let pruned = prune(&history, 6);
        assert_eq!(pruned.len(), history.len());
        for m in &pruned[5..11] {
            assert!(m.text().contains("[TRUNCATED: 2000 chars]"));
        }
        for (a, b) in history[24..].iter().zip(&pruned[24..]) {
            assert_eq!(a, b);
        }
        assert_eq!(pruned[0].text(), "prompt");
    }
}
