//! Write tool — create or overwrite a file

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use serde_json::{json, Value};
use tokio::fs;
use tracing::debug;

pub struct WriteFileTool;

#[async_trait::async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write content to a file, creating parent directories if needed. \
         Overwrites existing content. Prefer replace_in_file for small edits."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::File
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Workspace-relative path to write"
                },
                "content": {
                    "type": "string",
                    "description": "Full file content"
                }
            },
            "required": ["path", "content"]
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
        let content = match args["content"].as_str() {
            Some(c) => c,
            None => return ToolResult::error("Missing required parameter: content"),
        };

        let resolved = match confine::resolve(&ctx.workspace_root, path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        if let Some(parent) = resolved.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolResult::error(format!("Failed to create directories: {}", e));
            }
        }

        match fs::write(&resolved, content).await {
            Ok(()) => {
                debug!("write_file: {} ({} bytes)", path, content.len());
                ToolResult::json(json!({
                    "success": true,
                    "path": confine::relative_display(&ctx.workspace_root, &resolved),
                    "bytes": content.len(),
                }))
            }
            Err(e) => ToolResult::error(format!("Failed to write {}: {}", path, e)),
        }
    }
}
