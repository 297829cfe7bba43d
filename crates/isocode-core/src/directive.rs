//! The per-turn directive emitted by the model.
//!
//! Wire format is a single JSON object discriminated by `type`:
//!
//!   { "type": "thought", "content": "PLAN:\n1. ..." }
//!   { "type": "action", "tool": "read_file", "args": { "path": "src/a.ts" } }
//!   { "type": "diff_request", "filePath": "src/a.ts", "diff": "--- a\n+++ b\n..." }
//!   { "type": "delegate", "tasks": ["...", {"task": "...", "model": "..."}] }
//!   { "type": "final", "content": "Done." }
//!
//! Parsing is strict here; the lower-precedence salvage heuristics live in
//! the agent crate.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Directive {
    Thought {
        content: String,
    },
    Action {
        tool: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    DiffRequest {
        #[serde(rename = "filePath", alias = "file_path")]
        file_path: String,
        diff: String,
    },
    /// Agent-plus only. Task elements may be bare strings or objects with an
    /// optional model hint; see [`DelegateTask::normalise`].
    Delegate {
        tasks: Vec<serde_json::Value>,
    },
    Final {
        content: String,
    },
}

impl Directive {
    /// Strict parse of a directive JSON object. Returns `None` for valid JSON
    /// that is not a directive.
    pub fn parse_strict(json: &str) -> Option<Directive> {
        serde_json::from_str(json).ok()
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Directive::Thought { .. } => "thought",
            Directive::Action { .. } => "action",
            Directive::DiffRequest { .. } => "diff_request",
            Directive::Delegate { .. } => "delegate",
            Directive::Final { .. } => "final",
        }
    }
}

/// A normalised delegated subtask.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DelegateTask {
    pub task: String,
    pub model: Option<String>,
}

impl DelegateTask {
    /// Normalise a raw task element: a bare string, or an object carrying the
    /// task text under `task`/`taskText`/`description` and an optional model
    /// hint under `model`. Elements with no usable text are dropped.
    pub fn normalise(raw: &serde_json::Value) -> Option<DelegateTask> {
        match raw {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(DelegateTask {
                task: s.trim().to_string(),
                model: None,
            }),
            serde_json::Value::Object(map) => {
                let text = map
                    .get("task")
                    .or_else(|| map.get("taskText"))
                    .or_else(|| map.get("description"))
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())?;
                let model = map
                    .get("model")
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from);
                Some(DelegateTask {
                    task: text.to_string(),
                    model,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_action() {
        let d = Directive::parse_strict(r#"{"type":"action","tool":"read_file","args":{"path":"a.ts"}}"#)
            .unwrap();
        match d {
            Directive::Action { tool, args } => {
                assert_eq!(tool, "read_file");
                assert_eq!(args["path"], "a.ts");
            }
            other => panic!("expected action, got {:?}", other),
        }
    }

    #[test]
    fn parse_diff_request_accepts_both_key_styles() {
        let camel = Directive::parse_strict(
            r#"{"type":"diff_request","filePath":"src/a.ts","diff":"--- a"}"#,
        )
        .unwrap();
        let snake = Directive::parse_strict(
            r#"{"type":"diff_request","file_path":"src/a.ts","diff":"--- a"}"#,
        )
        .unwrap();
        assert_eq!(camel, snake);
    }

    #[test]
    fn parse_rejects_non_directive_json() {
        assert!(Directive::parse_strict(r#"{"kind":"thought"}"#).is_none());
        assert!(Directive::parse_strict("not json").is_none());
    }

    #[test]
    fn normalise_task_variants() {
        assert_eq!(
            DelegateTask::normalise(&json!("fix the tests")),
            Some(DelegateTask {
                task: "fix the tests".into(),
                model: None
            })
        );
        assert_eq!(
            DelegateTask::normalise(&json!({"task": "describe screenshot", "model": "llava"})),
            Some(DelegateTask {
                task: "describe screenshot".into(),
                model: Some("llava".into())
            })
        );
        assert_eq!(DelegateTask::normalise(&json!(42)), None);
        assert_eq!(DelegateTask::normalise(&json!({"model": "x"})), None);
    }
}
