//! Tool registry and dispatcher.
//!
//! Each tool is a self-contained module implementing the Tool trait. The
//! registry owns lookup, permission policy, workspace path confinement, and
//! observation truncation; tools only implement their own behaviour.

use isocode_core::{truncate_tool_result, PermissionPolicy, Permissions};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::confine;

/// Per-invocation context handed to every tool.
#[derive(Clone, Debug)]
pub struct ToolCtx {
    pub workspace_root: PathBuf,
    pub session_id: String,
    /// Set when the caller may execute `ask`-gated tools without prompting
    /// (agent-plus runs and approved resumptions).
    pub auto_mode: bool,
}

impl ToolCtx {
    pub fn new(workspace_root: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            session_id: session_id.into(),
            auto_mode: false,
        }
    }

    pub fn auto(mut self) -> Self {
        self.auto_mode = true;
        self
    }
}

/// Category used for the system-prompt listing and permission mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ToolCategory {
    File,
    Search,
    Shell,
    Git,
    Check,
    Memory,
    Tasks,
    Vision,
    External,
}

impl ToolCategory {
    pub fn label(&self) -> &'static str {
        match self {
            ToolCategory::File => "File",
            ToolCategory::Search => "Search & navigation",
            ToolCategory::Shell => "Shell",
            ToolCategory::Git => "Git",
            ToolCategory::Check => "Lint & test",
            ToolCategory::Memory => "Memory",
            ToolCategory::Tasks => "Task list",
            ToolCategory::Vision => "Vision",
            ToolCategory::External => "External tool servers",
        }
    }
}

#[derive(Clone, Debug)]
pub enum ToolResult {
    Text(String),
    Json(Value),
    Error { message: String, hint: Option<String> },
}

impl ToolResult {
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    pub fn json(v: Value) -> Self {
        Self::Json(v)
    }

    pub fn error(s: impl Into<String>) -> Self {
        Self::Error {
            message: s.into(),
            hint: None,
        }
    }

    pub fn error_with_hint(message: impl Into<String>, hint: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
            hint: Some(hint.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// The observation object pushed into the conversation, truncated to the
    /// dispatcher's caps.
    pub fn into_observation(self) -> Value {
        let raw = match self {
            Self::Text(s) => json!({ "content": s }),
            Self::Json(v) => v,
            Self::Error { message, hint } => match hint {
                Some(hint) => json!({ "error": message, "hint": hint }),
                None => json!({ "error": message }),
            },
        };
        truncate_tool_result(raw)
    }
}

/// The Tool trait - implement this to add a new capability.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name (e.g. "read_file", "run_command").
    fn name(&self) -> &str;

    /// Human-readable description listed in the system prompt.
    fn description(&self) -> &str;

    fn category(&self) -> ToolCategory;

    /// JSON Schema for input parameters.
    fn input_schema(&self) -> Value;

    /// Whether this tool only reads state (no side effects).
    fn is_read_only(&self) -> bool {
        false
    }

    /// Permission policy under the current table. Read-only tools are always
    /// allowed; mutating tools default to the category policies.
    fn policy(&self, perms: &Permissions) -> PermissionPolicy {
        if self.is_read_only() {
            return PermissionPolicy::Always;
        }
        match self.category() {
            ToolCategory::Shell | ToolCategory::Git | ToolCategory::Check | ToolCategory::External => {
                perms.shell
            }
            ToolCategory::File => perms.write,
            _ => PermissionPolicy::Always,
        }
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult;
}

pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Validate, permission-check, execute, and truncate one tool call.
    pub async fn run(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolCtx,
        perms: &Permissions,
    ) -> ToolResult {
        let Some(tool) = self.tools.get(name) else {
            return ToolResult::error_with_hint(
                format!("Unknown tool: {}", name),
                format!("known tools: {}", self.names().join(", ")),
            );
        };

        match tool.policy(perms) {
            PermissionPolicy::Never => {
                return ToolResult::error(format!(
                    "Tool '{}' is disabled by the permission policy",
                    name
                ));
            }
            PermissionPolicy::Ask if !ctx.auto_mode => {
                return ToolResult::error(format!(
                    "Tool '{}' requires approval and auto mode is off",
                    name
                ));
            }
            _ => {}
        }

        if let Err(e) = confine::check_args(&ctx.workspace_root, &args) {
            return ToolResult::error_with_hint(e, "paths must stay inside the workspace root");
        }

        tracing::debug!(tool = name, session = %ctx.session_id, "dispatch");
        tool.execute(args, ctx).await
    }

    /// Categorised listing with parameter signatures, for the system prompt.
    pub fn render_listing(&self) -> String {
        let mut by_category: Vec<(ToolCategory, Vec<&Arc<dyn Tool>>)> = Vec::new();
        let mut tools: Vec<&Arc<dyn Tool>> = self.tools.values().collect();
        tools.sort_by_key(|t| (t.category(), t.name().to_string()));
        for tool in tools {
            match by_category.last_mut() {
                Some((category, group)) if *category == tool.category() => group.push(tool),
                _ => by_category.push((tool.category(), vec![tool])),
            }
        }

        let mut out = String::new();
        for (category, group) in by_category {
            out.push_str(&format!("### {} tools\n", category.label()));
            for tool in group {
                out.push_str(&format!(
                    "- {}({}): {}\n",
                    tool.name(),
                    signature(&tool.input_schema()),
                    tool.description()
                ));
            }
            out.push('\n');
        }
        out.trim_end().to_string()
    }
}

/// "a, b?, c?" parameter signature from a JSON schema.
fn signature(schema: &Value) -> String {
    let required: Vec<&str> = schema["required"]
        .as_array()
        .map(|r| r.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    let Some(properties) = schema["properties"].as_object() else {
        return String::new();
    };
    let mut params: Vec<String> = properties
        .keys()
        .map(|k| {
            if required.contains(&k.as_str()) {
                k.clone()
            } else {
                format!("{}?", k)
            }
        })
        .collect();
    // required first, then optional, both alphabetical
    params.sort_by_key(|p| (p.ends_with('?'), p.clone()));
    params.join(", ")
}
