//! Read tools — single-file read with auto-pagination, and batched reads

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use serde_json::{json, Value};
use tokio::fs;
use tracing::debug;

/// Lines returned for a large file when no offset/limit is given.
const PAGE_LINES: usize = 200;
/// Files accepted by a single batched read.
const MAX_BATCH: usize = 10;

pub struct ReadFileTool;

#[async_trait::async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file. Large files auto-paginate: without offset/limit only the \
         first 200 lines are returned with a note giving the total."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::File
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
                    "description": "Workspace-relative path to read"
                },
                "offset": {
                    "type": "integer",
                    "description": "Line number to start from (1-indexed)"
                },
                "limit": {
                    "type": "integer",
                    "description": "Maximum number of lines to read"
                }
            },
            "required": ["path"]
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

        let resolved = match confine::resolve(&ctx.workspace_root, path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let content = match fs::read_to_string(&resolved).await {
            Ok(c) => c,
            Err(e) => return ToolResult::error(format!("Failed to read {}: {}", path, e)),
        };

        let lines: Vec<&str> = content.lines().collect();
        let total = lines.len();
        let paginated = args.get("offset").is_none() && args.get("limit").is_none();

        let offset = args["offset"].as_u64().unwrap_or(1).max(1) as usize;
        let limit = args["limit"]
            .as_u64()
            .map(|l| l as usize)
            .unwrap_or(PAGE_LINES);

        let start = (offset - 1).min(total);
        let end = (start + limit).min(total);
        let body = lines[start..end].join("\n");

        debug!("read_file: {} (lines {}-{} of {})", path, start + 1, end, total);

        let mut result = json!({
            "path": path,
            "content": body,
            "totalLines": total,
        });
        if paginated && total > PAGE_LINES {
            result["note"] = json!(format!(
                "Showing lines 1-{} of {}. Pass offset/limit to read more.",
                PAGE_LINES, total
            ));
        }
        ToolResult::json(result)
    }
}

pub struct ReadManyFilesTool;

#[async_trait::async_trait]
impl Tool for ReadManyFilesTool {
    fn name(&self) -> &str {
        "read_many_files"
    }

    fn description(&self) -> &str {
        "Read several files in one call (up to 10). Prefer this over repeated \
         read_file calls when you already know the paths."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::File
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "paths": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Workspace-relative paths to read"
                }
            },
            "required": ["paths"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let Some(paths) = args["paths"].as_array() else {
            return ToolResult::error("Missing required parameter: paths");
        };
        if paths.len() > MAX_BATCH {
            return ToolResult::error(format!(
                "Too many paths ({}); at most {} per call",
                paths.len(),
                MAX_BATCH
            ));
        }

        let mut files = Vec::new();
        for path in paths.iter().filter_map(|v| v.as_str()) {
            let entry = match confine::resolve(&ctx.workspace_root, path) {
                Ok(resolved) => match fs::read_to_string(&resolved).await {
                    Ok(content) => json!({ "path": path, "content": content }),
                    Err(e) => json!({ "path": path, "error": e.to_string() }),
                },
                Err(e) => json!({ "path": path, "error": e }),
            };
            files.push(entry);
        }
        ToolResult::json(json!({ "files": files }))
    }
}
