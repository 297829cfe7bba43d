//! Apply-diff tool — apply a unified diff to one file
//!
//! The file is only written when the whole diff applies cleanly; a context
//! mismatch leaves it untouched.

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use isocode_core::diff::try_apply_patch;
use serde_json::{json, Value};
use tokio::fs;
use tracing::debug;

pub struct ApplyDiffTool;

#[async_trait::async_trait]
impl Tool for ApplyDiffTool {
    fn name(&self) -> &str {
        "apply_diff"
    }

    fn description(&self) -> &str {
        "Apply a unified diff to a file. The diff's context lines must match \
         the current file content exactly."
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
                    "description": "Workspace-relative path to patch"
                },
                "diff": {
                    "type": "string",
                    "description": "Unified diff text"
                }
            },
            "required": ["path", "diff"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let path = match args
            .get("path")
            .or(args.get("file_path"))
            .or(args.get("filePath"))
            .and_then(|v| v.as_str())
        {
            Some(p) => p,
            None => return ToolResult::error("Missing required parameter: path"),
        };
        let diff = match args["diff"].as_str() {
            Some(d) => d,
            None => return ToolResult::error("Missing required parameter: diff"),
        };

        let resolved = match confine::resolve(&ctx.workspace_root, path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        // A diff against a file that does not exist yet starts from empty.
        let original = fs::read_to_string(&resolved).await.unwrap_or_default();

        let Some(patched) = try_apply_patch(&original, diff) else {
            return ToolResult::error_with_hint(
                format!("Diff does not apply cleanly to {}", path),
                "re-read the file and regenerate the diff against its current content",
            );
        };

        if let Some(parent) = resolved.parent() {
            if let Err(e) = fs::create_dir_all(parent).await {
                return ToolResult::error(format!("Failed to create directories: {}", e));
            }
        }
        match fs::write(&resolved, &patched).await {
            Ok(()) => {
                debug!("apply_diff: {} ({} bytes)", path, patched.len());
                ToolResult::json(json!({
                    "success": true,
                    "path": confine::relative_display(&ctx.workspace_root, &resolved),
                    "bytes": patched.len(),
                }))
            }
            Err(e) => ToolResult::error(format!("Failed to write {}: {}", path, e)),
        }
    }
}
