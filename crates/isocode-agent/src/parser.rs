//! Model-output interpretation.
//!
//! Stage one is strict: find the largest balanced JSON object in the raw
//! reply (after stripping known wrappers) and parse it as a directive.
//! Stage two salvages `action="x" args={...}` key-value shapes; stage three
//! maps imperative English onto an action or thought. Whatever survives none
//! of these is handed back for the JSON-format nudge.

use isocode_core::{Directive, ToolCall};
use regex::Regex;
use std::sync::OnceLock;

#[derive(Clone, Debug, PartialEq)]
pub enum Interpretation {
    Directives(Vec<Directive>),
    Unparsed(String),
}

/// Interpret one model reply. Native tool calls take precedence over the
/// text body; each becomes an action directive in order.
pub fn interpret(raw: &str, native_tool_calls: &[ToolCall]) -> Interpretation {
    if !native_tool_calls.is_empty() {
        let directives = native_tool_calls
            .iter()
            .map(|call| Directive::Action {
                tool: call.name.clone(),
                args: call.arguments.clone(),
            })
            .collect();
        return Interpretation::Directives(directives);
    }

    let stripped = strip_wrappers(raw);

    for candidate in extract_json_objects(&stripped) {
        if let Some(directive) = Directive::parse_strict(candidate) {
            return Interpretation::Directives(vec![directive]);
        }
    }

    if let Some(directive) = regex_salvage(&stripped) {
        return Interpretation::Directives(vec![directive]);
    }

    if let Some(directive) = heuristic_salvage(&stripped) {
        return Interpretation::Directives(vec![directive]);
    }

    Interpretation::Unparsed(raw.to_string())
}

/// Remove fenced code blocks and assistant-channel markers around the JSON.
fn strip_wrappers(raw: &str) -> String {
    let mut text = raw.trim().to_string();

    // ```json ... ``` (or bare fences)
    if let Some(start) = text.find("```") {
        let after = &text[start + 3..];
        let body_start = after.find('\n').map(|i| i + 1).unwrap_or(0);
        if let Some(end) = after[body_start..].find("```") {
            text = after[body_start..body_start + end].trim().to_string();
        }
    }

    // Assistant-channel markers some local models leak.
    for marker in ["<|channel|>final", "<|message|>", "<|start|>assistant", "assistantfinal"] {
        if let Some(at) = text.find(marker) {
            text = text[at + marker.len()..].trim().to_string();
        }
    }
    text
}

/// Top-level balanced `{...}` spans, largest first.
fn extract_json_objects(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = balanced_end(bytes, i) {
                spans.push(&text[i..=end]);
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    spans.sort_by_key(|s| std::cmp::Reverse(s.len()));
    spans
}

fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

fn salvage_regexes() -> &'static (Regex, Regex) {
    static CELL: OnceLock<(Regex, Regex)> = OnceLock::new();
    CELL.get_or_init(|| {
        (
            Regex::new(r#"(?:action|tool)\s*[:=]\s*"([\w-]+)""#).unwrap_or_else(|_| unreachable!()),
            Regex::new(r"args\s*[:=]\s*(\{[^}]*\})").unwrap_or_else(|_| unreachable!()),
        )
    })
}

/// Key-value salvage: `action="read_file" args={"path": "a.ts"}`.
fn regex_salvage(text: &str) -> Option<Directive> {
    let (action_re, args_re) = salvage_regexes();
    let tool = action_re.captures(text)?.get(1)?.as_str().to_string();
    let args = args_re
        .captures(text)
        .and_then(|c| c.get(1))
        .and_then(|m| serde_json::from_str(m.as_str()).ok())
        .unwrap_or_else(|| serde_json::json!({}));
    Some(Directive::Action { tool, args })
}

struct HeuristicRules {
    read: Regex,
    run: Regex,
    search: Regex,
    list: Regex,
    thought: Regex,
}

fn heuristics() -> &'static HeuristicRules {
    static CELL: OnceLock<HeuristicRules> = OnceLock::new();
    CELL.get_or_init(|| HeuristicRules {
        read: Regex::new(r#"(?i)read (?:the )?file\s+[`'"]?([\w./~-]+)"#)
            .unwrap_or_else(|_| unreachable!()),
        run: Regex::new(r"(?i)\brun\s+`([^`]+)`").unwrap_or_else(|_| unreachable!()),
        search: Regex::new(r#"(?i)search for\s+[`'"]?([^`'".\n]+)"#)
            .unwrap_or_else(|_| unreachable!()),
        list: Regex::new(r#"(?i)list (?:the )?files in\s+[`'"]?([\w./~-]+)"#)
            .unwrap_or_else(|_| unreachable!()),
        thought: Regex::new(r"(?i)^(let me|my plan|i will|i'll|first,)")
            .unwrap_or_else(|_| unreachable!()),
    })
}

/// Imperative-English salvage, lowest precedence.
fn heuristic_salvage(text: &str) -> Option<Directive> {
    let rules = heuristics();

    if let Some(captures) = rules.read.captures(text) {
        return Some(Directive::Action {
            tool: "read_file".to_string(),
            args: serde_json::json!({ "path": captures.get(1)?.as_str() }),
        });
    }
    if let Some(captures) = rules.run.captures(text) {
        return Some(Directive::Action {
            tool: "run_command".to_string(),
            args: serde_json::json!({ "command": captures.get(1)?.as_str() }),
        });
    }
    if let Some(captures) = rules.list.captures(text) {
        return Some(Directive::Action {
            tool: "list_files".to_string(),
            args: serde_json::json!({ "path": captures.get(1)?.as_str() }),
        });
    }
    if let Some(captures) = rules.search.captures(text) {
        return Some(Directive::Action {
            tool: "grep_search".to_string(),
            args: serde_json::json!({ "pattern": captures.get(1)?.as_str().trim() }),
        });
    }
    if rules.thought.is_match(text.trim()) {
        return Some(Directive::Thought {
            content: text.trim().to_string(),
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single(raw: &str) -> Directive {
        match interpret(raw, &[]) {
            Interpretation::Directives(mut d) => d.remove(0),
            Interpretation::Unparsed(text) => panic!("unparsed: {}", text),
        }
    }

    #[test]
    fn clean_json_parses() {
        let d = single(r#"{"type":"thought","content":"PLAN:\n1. read"}"#);
        assert!(matches!(d, Directive::Thought { .. }));
    }

    #[test]
    fn fenced_json_is_unwrapped() {
        let d = single("```json\n{\"type\":\"final\",\"content\":\"done\"}\n```");
        assert_eq!(
            d,
            Directive::Final {
                content: "done".into()
            }
        );
    }

    #[test]
    fn json_embedded_in_prose() {
        let d = single(
            "Sure! Here is my next step: {\"type\":\"action\",\"tool\":\"read_file\",\"args\":{\"path\":\"a.ts\"}} hope that helps",
        );
        match d {
            Directive::Action { tool, args } => {
                assert_eq!(tool, "read_file");
                assert_eq!(args["path"], "a.ts");
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn channel_markers_are_stripped() {
        let d = single("<|channel|>final{\"type\":\"final\",\"content\":\"ok\"}");
        assert!(matches!(d, Directive::Final { .. }));
    }

    #[test]
    fn regex_salvage_key_value() {
        let d = single(r#"action="grep_search" args={"pattern": "foo"}"#);
        match d {
            Directive::Action { tool, args } => {
                assert_eq!(tool, "grep_search");
                assert_eq!(args["pattern"], "foo");
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn heuristic_read_file() {
        let d = single("I need to read the file src/main.rs to understand it.");
        match d {
            Directive::Action { tool, args } => {
                assert_eq!(tool, "read_file");
                assert_eq!(args["path"], "src/main.rs");
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn heuristic_run_command() {
        let d = single("Next I'd run `cargo test` to verify.");
        match d {
            Directive::Action { tool, args } => {
                assert_eq!(tool, "run_command");
                assert_eq!(args["command"], "cargo test");
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn heuristic_plan_prose_becomes_thought() {
        let d = single("Let me start by examining the project layout.");
        assert!(matches!(d, Directive::Thought { .. }));
    }

    #[test]
    fn garbage_stays_unparsed() {
        match interpret("42 towels", &[]) {
            Interpretation::Unparsed(text) => assert_eq!(text, "42 towels"),
            other => panic!("expected unparsed, got {:?}", other),
        }
    }

    #[test]
    fn native_tool_calls_win() {
        let calls = vec![
            ToolCall {
                name: "read_file".into(),
                arguments: json!({"path": "a"}),
            },
            ToolCall {
                name: "list_files".into(),
                arguments: json!({}),
            },
        ];
        match interpret("ignored text", &calls) {
            Interpretation::Directives(directives) => {
                assert_eq!(directives.len(), 2);
                assert!(matches!(&directives[0], Directive::Action { tool, .. } if tool == "read_file"));
            }
            other => panic!("expected directives, got {:?}", other),
        }
    }
}
