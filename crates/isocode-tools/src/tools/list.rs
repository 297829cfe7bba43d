//! List tool — directory listing

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use serde_json::{json, Value};
use tokio::fs;

pub struct ListFilesTool;

#[async_trait::async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List the entries of a directory. Directories are suffixed with '/'. \
         Use glob for recursive pattern matching."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Search
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Directory to list (default: workspace root)"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let path = args["path"].as_str().unwrap_or(".");
        let resolved = match confine::resolve(&ctx.workspace_root, path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let mut entries = match fs::read_dir(&resolved).await {
            Ok(e) => e,
            Err(e) => return ToolResult::error(format!("Failed to list {}: {}", path, e)),
        };

        let mut files = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry
                .file_type()
                .await
                .map(|t| t.is_dir())
                .unwrap_or(false);
            files.push(if is_dir { format!("{}/", name) } else { name });
        }
        files.sort_unstable();

        ToolResult::json(json!({ "path": path, "files": files }))
    }
}
