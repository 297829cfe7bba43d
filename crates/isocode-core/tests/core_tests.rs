//! Tests for isocode-core: diff laws, truncation behaviour, config
//! persistence, and event wire shapes.

use isocode_core::diff::{apply_unified_diff, create_unified_diff, try_apply_patch};
use isocode_core::{smart_truncate, AgentEvent, Directive, RuntimeConfig};
use serde_json::json;

// ===========================================================================
// Diff round-trip law: apply(original, create(original, after)) == after
// ===========================================================================

#[test]
fn diff_round_trip_on_realistic_edit() {
    let original = "\
use std::fmt;

fn foo(x: u32) -> u32 {
    x + 1
}

fn main() {
    println!(\"{}\", foo(41));
}
";
    let after = original.replace("foo", "bar").replace("x + 1", "x + 2");
    let diff = create_unified_diff("src/main.rs", original, &after);
    assert!(diff.starts_with("--- a/src/main.rs"));
    assert_eq!(apply_unified_diff(original, &diff).unwrap(), after);
}

#[test]
fn diff_round_trip_large_file_many_hunks() {
    let original: String = (0..300).map(|i| format!("fn f{}() {{}}\n", i)).collect();
    let mut after = original.clone();
    for i in [3, 80, 150, 299] {
        after = after.replace(&format!("fn f{}()", i), &format!("fn renamed_{}()", i));
    }
    let diff = create_unified_diff("lib.rs", &original, &after);
    assert_eq!(apply_unified_diff(&original, &diff).unwrap(), after);
}

#[test]
fn try_apply_patch_returns_none_without_side_channel() {
    // The pure function has no side effects by construction; the law here
    // is that failure is None, never a partial result.
    let diff = create_unified_diff("f", "a\nb\nc\n", "a\nX\nc\n");
    assert!(try_apply_patch("unrelated\ncontent\n", &diff).is_none());
    assert_eq!(
        try_apply_patch("a\nb\nc\n", &diff).as_deref(),
        Some("a\nX\nc\n")
    );
}

// ===========================================================================
// Truncation
// ===========================================================================

#[test]
fn smart_truncate_is_bounded() {
    let s = "word ".repeat(5_000);
    let t = smart_truncate(&s, 1_000);
    // head (70%) + tail (20%) + marker stays in the same ballpark
    assert!(t.len() < 1_100);
    assert!(t.contains("characters omitted"));
}

#[test]
fn smart_truncate_idempotent_under_budget() {
    let s = "short enough";
    assert_eq!(smart_truncate(&smart_truncate(s, 100), 100), s);
}

// ===========================================================================
// Config persistence
// ===========================================================================

#[test]
fn config_save_and_load_round_trip() {
    let dir = std::env::temp_dir().join(format!(
        "isocode-core-test-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    let path = dir.join("user-config.json");

    let mut config = RuntimeConfig::default();
    config.merge_value(&json!({
        "model": "qwen2.5-coder:7b",
        "maxWorkers": 4,
        "toolServers": [{"name": "fs", "command": "fs-server", "args": ["--stdio"]}],
    }));
    config.save(&path).unwrap();

    let loaded = RuntimeConfig::load(&path);
    assert_eq!(loaded.model.as_deref(), Some("qwen2.5-coder:7b"));
    assert_eq!(loaded.max_workers, 4);
    assert_eq!(loaded.tool_servers.len(), 1);
    assert_eq!(loaded.tool_servers[0].command, "fs-server");

    let _ = std::fs::remove_dir_all(dir);
}

// ===========================================================================
// Wire shapes
// ===========================================================================

#[test]
fn directive_survives_serde_round_trip() {
    let directives = vec![
        Directive::Thought {
            content: "PLAN:\n1. x".into(),
        },
        Directive::Action {
            tool: "grep_search".into(),
            args: json!({"pattern": "foo"}),
        },
        Directive::DiffRequest {
            file_path: "a/b.rs".into(),
            diff: "--- a\n+++ b\n".into(),
        },
        Directive::Final {
            content: "done".into(),
        },
    ];
    for directive in directives {
        let text = serde_json::to_string(&directive).unwrap();
        assert_eq!(Directive::parse_strict(&text), Some(directive));
    }
}

#[test]
fn event_frames_match_editor_contract() {
    let frames = [
        (
            AgentEvent::Chunk {
                content: "hi".into(),
            },
            r#"{"type":"chunk","content":"hi"}"#,
        ),
        (AgentEvent::Done, r#"{"type":"done"}"#),
        (
            AgentEvent::OpenFile {
                path: "src/x.rs".into(),
            },
            r#"{"type":"open_file","path":"src/x.rs"}"#,
        ),
    ];
    for (event, expected) in frames {
        assert_eq!(serde_json::to_string(&event).unwrap(), expected);
    }
}
