//! Textual tool-call extraction for models that cannot emit structured calls.
//!
//! Extraction rules, in order, first match wins:
//! 1. `<tool_code> … </tool_code>` blocks — take the tightest `{…}` inside
//!    each block.
//! 2. The first JSON object containing both a `"name"` and an `"arguments"`
//!    key anywhere in the text.
//! 3. Name-specific regex fallbacks for the canonical toolset (file read /
//!    write, directory listing, shell).
//!
//! Before any JSON parse the candidate text is repaired: triple-quoted string
//! literals become properly-escaped JSON strings, trailing commas inside
//! objects/arrays are dropped, and Markdown code fences are stripped.  When
//! parsing still fails the regex fallbacks run on the original text.

use regex::Regex;
use serde_json::json;

use crate::sanitize::TOOL_CODE_OPEN;
use crate::types::ToolCall;

/// Extract tool calls from raw model text.
pub fn extract_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    let tool_code_re = Regex::new(r"(?s)<tool_code>(.*?)</tool_code>").unwrap();
    let mut saw_block = false;
    for cap in tool_code_re.captures_iter(text) {
        saw_block = true;
        let inner = cap[1].trim();
        // The block may carry preamble/postscript around the JSON — take the
        // tightest object.
        let candidate = tightest_object(inner).unwrap_or(inner);
        if !push_parsed_call(candidate, "call_xml", &mut calls) {
            fallback_regex_calls(inner, &mut calls);
        }
    }
    if saw_block {
        return calls;
    }

    // No tags: look for the first generic JSON object with name + arguments.
    let generic_re =
        Regex::new(r#"(?s)\{.*"name"\s*:\s*".*?".*"arguments"\s*:\s*\{.*?\}.*\}"#).unwrap();
    if let Some(m) = generic_re.find(text) {
        if push_parsed_call(m.as_str(), "call_json", &mut calls) {
            return calls;
        }
        // Parse failed on the matched span: fall through to regex recovery on
        // the original text.
    }

    fallback_regex_calls(text, &mut calls);
    calls
}

/// Strip any `<tool_code>…</tool_code>` spans out of `text`, returning the
/// displayable remainder.  An unterminated trailing block is removed as well.
pub fn strip_tool_code_spans(text: &str) -> String {
    let re = Regex::new(r"(?s)<tool_code>.*?</tool_code>").unwrap();
    let cleaned = re.replace_all(text, "");
    let cleaned = match cleaned.find(TOOL_CODE_OPEN) {
        Some(pos) => cleaned[..pos].to_string(),
        None => cleaned.into_owned(),
    };
    cleaned.trim().to_string()
}

/// Repair common model artifacts so a candidate parses as JSON: convert
/// Python-style triple-quoted strings, drop trailing commas, strip Markdown
/// fences.
pub fn sanitize_json_text(s: &str) -> String {
    let mut out = s.trim().to_string();

    // ```json ... ``` wrappers around the object.
    let fence_open = Regex::new(r"^```[a-zA-Z]*\s*").unwrap();
    let fence_close = Regex::new(r"\s*```$").unwrap();
    out = fence_open.replace(&out, "").into_owned();
    out = fence_close.replace(&out, "").into_owned();

    // """…""" → a properly escaped JSON string.
    let triple = Regex::new(r#"(?s)"{3}(.*?)"{3}"#).unwrap();
    out = triple
        .replace_all(&out, |caps: &regex::Captures<'_>| {
            let body = caps[1]
                .replace('\\', "\\\\")
                .replace('\n', "\\n")
                .replace('"', "\\\"");
            format!("\"{body}\"")
        })
        .into_owned();

    // Trailing commas before a closing brace/bracket.
    let trailing = Regex::new(r",\s*([}\]])").unwrap();
    out = trailing.replace_all(&out, "$1").into_owned();

    out.trim().to_string()
}

/// First `{` through last `}` of `s`, when both exist in order.
fn tightest_object(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&s[start..=end])
}

/// Try to parse `candidate` as a `{name, arguments}` object and append the
/// resulting call.  Returns `true` on success.
fn push_parsed_call(candidate: &str, id_prefix: &str, calls: &mut Vec<ToolCall>) -> bool {
    let sanitized = sanitize_json_text(candidate);
    let Ok(data) = serde_json::from_str::<serde_json::Value>(&sanitized) else {
        return false;
    };
    // Models occasionally hallucinate {"tool": …, "parameters": …} instead of
    // the documented keys.
    let name = data["name"].as_str().or_else(|| data["tool"].as_str());
    let Some(name) = name else { return false };
    let args = if data["arguments"].is_object() {
        data["arguments"].clone()
    } else if data["parameters"].is_object() {
        data["parameters"].clone()
    } else {
        json!({})
    };
    let args_str = serde_json::to_string(&args).unwrap_or_else(|_| "{}".into());
    calls.push(ToolCall::new(synthetic_id(id_prefix), name, args_str));
    true
}

/// Last-resort recovery: name-specific patterns for the canonical toolset.
fn fallback_regex_calls(text: &str, calls: &mut Vec<ToolCall>) {
    let write_re = Regex::new(
        r#"(?s)"name"\s*:\s*"write_file".*?"path"\s*:\s*"([^"]+)".*?"content"\s*:\s*["']{1,3}(.*?)["']{1,3}\s*\}"#,
    )
    .unwrap();
    let read_re = Regex::new(r#"(?s)"name"\s*:\s*"read_file".*?"path"\s*:\s*"([^"]+)""#).unwrap();
    let list_re =
        Regex::new(r#"(?s)"name"\s*:\s*"list_directory".*?"path"\s*:\s*"([^"]+)""#).unwrap();
    let shell_re =
        Regex::new(r#"(?s)"name"\s*:\s*"run_shell_command".*?"command"\s*:\s*"([^"]+)""#).unwrap();

    if let Some(cap) = write_re.captures(text) {
        let args = json!({"path": &cap[1], "content": &cap[2]});
        calls.push(ToolCall::new(
            synthetic_id("call_rx_write"),
            "write_file",
            args.to_string(),
        ));
    }
    if let Some(cap) = read_re.captures(text) {
        let args = json!({"path": &cap[1]});
        calls.push(ToolCall::new(
            synthetic_id("call_rx_read"),
            "read_file",
            args.to_string(),
        ));
    }
    if let Some(cap) = list_re.captures(text) {
        let args = json!({"path": &cap[1]});
        calls.push(ToolCall::new(
            synthetic_id("call_rx_list"),
            "list_directory",
            args.to_string(),
        ));
    }
    if let Some(cap) = shell_re.captures(text) {
        let args = json!({"command": &cap[1]});
        calls.push(ToolCall::new(
            synthetic_id("call_rx_shell"),
            "run_shell_command",
            args.to_string(),
        ));
    }
}

fn synthetic_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &suffix[..8])
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
