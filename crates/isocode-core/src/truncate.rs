//! Observation and string truncation.
//!
//! Tool outputs and long messages are cut down before they reach the model;
//! the in-memory conversation is never truncated, only the view handed to
//! the provider and the persisted records.

use serde_json::Value;

/// Slack allowed over the serialised-size cap before falling back to
/// whole-JSON truncation.
const JSON_SLACK: usize = 512;
const JSON_CAP: usize = 3_000;

/// Largest byte index `<= at` that is a char boundary.
fn floor_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut i = at;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

/// Smallest byte index `>= at` that is a char boundary.
fn ceil_char_boundary(s: &str, at: usize) -> usize {
    if at >= s.len() {
        return s.len();
    }
    let mut i = at;
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

/// Truncate keeping the head (70% of `max`) and tail (20% of `max`) with an
/// omission marker in between. Strings within budget are returned unchanged.
pub fn smart_truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let head_len = floor_char_boundary(s, max * 7 / 10);
    let tail_len = max / 5;
    let tail_start = ceil_char_boundary(s, s.len().saturating_sub(tail_len));
    let omitted = s.len() - head_len - (s.len() - tail_start);
    format!(
        "{}\n… [{} characters omitted] …\n{}",
        &s[..head_len],
        omitted,
        &s[tail_start..]
    )
}

/// Truncate a tool observation before it is appended to the conversation.
///
/// Object results get per-field caps first (`content` 4,000 chars, `stdout`
/// 2,000, `stderr` 1,000, `files` 80 items, `matches` 30 items with a note);
/// if the serialised object still exceeds the cap plus slack, the whole JSON
/// is smart-truncated into a string.
pub fn truncate_tool_result(result: Value) -> Value {
    let mut result = result;

    if let Value::Object(ref mut map) = result {
        for (key, cap) in [("content", 4_000), ("stdout", 2_000), ("stderr", 1_000)] {
            if let Some(Value::String(s)) = map.get(key) {
                if s.len() > cap {
                    let truncated = smart_truncate(s, cap);
                    map.insert(key.to_string(), Value::String(truncated));
                }
            }
        }
        if let Some(Value::Array(files)) = map.get_mut("files") {
            if files.len() > 80 {
                files.truncate(80);
            }
        }
        let matches_over = match map.get("matches") {
            Some(Value::Array(m)) if m.len() > 30 => Some(m.len()),
            _ => None,
        };
        if let Some(total) = matches_over {
            if let Some(Value::Array(matches)) = map.get_mut("matches") {
                matches.truncate(30);
            }
            map.insert(
                "note".to_string(),
                Value::String(format!("showing 30 of {} matches", total)),
            );
        }
    }

    let serialised = result.to_string();
    if serialised.len() > JSON_CAP + JSON_SLACK {
        Value::String(smart_truncate(&serialised, JSON_CAP))
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn within_budget_is_identity() {
        assert_eq!(smart_truncate("short", 100), "short");
    }

    #[test]
    fn over_budget_keeps_head_and_tail() {
        let s = "a".repeat(500) + &"z".repeat(500);
        let t = smart_truncate(&s, 100);
        assert!(t.len() < s.len());
        assert!(t.starts_with("aaaa"));
        assert!(t.ends_with("zzzz"));
        assert!(t.contains("characters omitted"));
    }

    #[test]
    fn truncation_respects_utf8_boundaries() {
        let s = "é".repeat(400);
        let t = smart_truncate(&s, 100);
        assert!(t.contains("characters omitted"));
    }

    #[test]
    fn tool_result_field_caps() {
        let v = truncate_tool_result(json!({
            "content": "x".repeat(10_000),
            "stderr": "e".repeat(50),
        }));
        let content = v["content"].as_str().unwrap();
        assert!(content.len() < 5_000);
        assert!(content.contains("characters omitted"));
        assert_eq!(v["stderr"].as_str().unwrap().len(), 50);
    }

    #[test]
    fn tool_result_match_cap_adds_note() {
        let matches: Vec<_> = (0..100).map(|i| json!(format!("m{}", i))).collect();
        let v = truncate_tool_result(json!({ "matches": matches }));
        assert_eq!(v["matches"].as_array().unwrap().len(), 30);
        assert!(v["note"].as_str().unwrap().contains("100"));
    }

    #[test]
    fn tool_result_small_object_untouched() {
        let v = truncate_tool_result(json!({"ok": true}));
        assert_eq!(v, json!({"ok": true}));
    }

    #[test]
    fn oversized_json_falls_back_to_string() {
        let files: Vec<_> = (0..79)
            .map(|i| json!(format!("dir/file-{}.rs padded padded padded padded padded", i)))
            .collect();
        let v = truncate_tool_result(json!({ "files": files }));
        match v {
            Value::String(s) => assert!(s.contains("characters omitted")),
            other => panic!("expected string fallback, got {}", other),
        }
    }
}
