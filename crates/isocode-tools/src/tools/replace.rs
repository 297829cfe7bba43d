//! Replace tool — exact-string surgical edits

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use isocode_core::{PermissionPolicy, Permissions};
use serde_json::{json, Value};
use tokio::fs;
use tracing::debug;

pub struct ReplaceInFileTool;

#[async_trait::async_trait]
impl Tool for ReplaceInFileTool {
    fn name(&self) -> &str {
        "replace_in_file"
    }

    fn description(&self) -> &str {
        "Edit a file by replacing an exact string match. The old_string must \
         appear exactly once unless replace_all is set. Read the file first."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::File
    }

    fn policy(&self, perms: &Permissions) -> PermissionPolicy {
        perms.edit
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative path to edit"
                },
                "old_string": {
                    "type": "string",
                    "description": "Exact text to find"
                },
                "new_string": {
                    "type": "string",
                    "description": "Replacement text"
                },
                "replace_all": {
                    "type": "boolean",
                    "description": "Replace all occurrences (default: false)"
                }
            },
            "required": ["path", "old_string", "new_string"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let path = match args
            .get("path")
            .or(args.get("file_path"))
            .and_then(|v| v.as_str())
        {
            Some(p) => p,
            None => return ToolResult::error("Missing required parameter: path"),
        };
        let old = match args["old_string"].as_str() {
            Some(s) => s,
            None => return ToolResult::error("Missing required parameter: old_string"),
        };
        let new = match args["new_string"].as_str() {
            Some(s) => s,
            None => return ToolResult::error("Missing required parameter: new_string"),
        };
        let replace_all = args["replace_all"].as_bool().unwrap_or(false);

        let resolved = match confine::resolve(&ctx.workspace_root, path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let content = match fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read {}: {}", path, e)),
        };

        if !content.contains(old) {
            return ToolResult::error_with_hint(
                "old_string not found in file",
                "read the file again - the text must match exactly, including whitespace",
            );
        }

        let (new_content, replacements) = if replace_all {
            let count = content.matches(old).count();
            (content.replace(old, new), count)
        } else {
            let count = content.matches(old).count();
            if count > 1 {
                return ToolResult::error(format!(
                    "old_string found {} times - must be unique. Use replace_all or add context.",
                    count
                ));
            }
            (content.replacen(old, new, 1), 1)
        };

        match fs::write(&resolved, &new_content).await {
            Ok(()) => {
                debug!("replace_in_file: {} ({} replacements)", path, replacements);
                ToolResult::json(json!({
                    "success": true,
                    "path": confine::relative_display(&ctx.workspace_root, &resolved),
                    "replacements": replacements,
                }))
            }
            Err(e) => ToolResult::error(format!("Failed to write {}: {}", path, e)),
        }
    }
}
