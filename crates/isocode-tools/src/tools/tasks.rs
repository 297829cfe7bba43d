//! Task list tool — per-session scratch list, in memory only

use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Clone, Debug)]
struct TaskItem {
    text: String,
    done: bool,
}

#[derive(Default)]
pub struct TaskListTool {
    // session id -> tasks; dropped with the process
    lists: Mutex<HashMap<String, Vec<TaskItem>>>,
}

impl TaskListTool {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Tool for TaskListTool {
    fn name(&self) -> &str {
        "task_list"
    }

    fn description(&self) -> &str {
        "Per-session task list. Actions: add, complete (by 1-based index), \
         list, clear. Keeps multi-step work on track."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Tasks
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["add", "complete", "list", "clear"],
                    "description": "Operation to perform"
                },
                "task": {
                    "type": "string",
                    "description": "Task text (for add)"
                },
                "index": {
                    "type": "integer",
                    "description": "1-based task index (for complete)"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let action = match args["action"].as_str() {
            Some(a) => a,
            None => return ToolResult::error("Missing required parameter: action"),
        };
        let mut lists = self.lists.lock().unwrap();
        let tasks = lists.entry(ctx.session_id.clone()).or_default();

        match action {
            "add" => {
                let Some(text) = args["task"].as_str().filter(|t| !t.trim().is_empty()) else {
                    return ToolResult::error("add requires task");
                };
                tasks.push(TaskItem {
                    text: text.trim().to_string(),
                    done: false,
                });
                ToolResult::json(json!({ "added": text.trim(), "total": tasks.len() }))
            }
            "complete" => {
                let Some(index) = args["index"].as_u64().map(|i| i as usize) else {
                    return ToolResult::error("complete requires index");
                };
                if index == 0 || index > tasks.len() {
                    return ToolResult::error(format!(
                        "index {} out of range (1..={})",
                        index,
                        tasks.len()
                    ));
                }
                tasks[index - 1].done = true;
                let remaining = tasks.iter().filter(|t| !t.done).count();
                ToolResult::json(json!({ "completed": index, "remaining": remaining }))
            }
            "list" => {
                let rendered: Vec<String> = tasks
                    .iter()
                    .enumerate()
                    .map(|(i, t)| {
                        format!("{}. [{}] {}", i + 1, if t.done { "x" } else { " " }, t.text)
                    })
                    .collect();
                ToolResult::json(json!({ "tasks": rendered }))
            }
            "clear" => {
                let removed = tasks.len();
                tasks.clear();
                ToolResult::json(json!({ "cleared": removed }))
            }
            other => ToolResult::error(format!("Unknown action: {}", other)),
        }
    }
}
