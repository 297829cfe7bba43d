//! Glob tool — fast file pattern matching

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use globset::GlobBuilder;
use serde_json::{json, Value};
use tracing::debug;
use walkdir::WalkDir;

pub struct GlobTool;

#[async_trait::async_trait]
impl Tool for GlobTool {
    fn name(&self) -> &str {
        "glob"
    }

    fn description(&self) -> &str {
        "Find files matching a glob pattern. Supports ** for recursive \
         matching. Returns paths sorted by modification time (newest first)."
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
                "pattern": {
                    "type": "string",
                    "description": "Glob pattern (e.g. '**/*.rs', 'src/**/*.ts')"
                },
                "path": {
                    "type": "string",
                    "description": "Directory to search in (default: workspace root)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let pattern = match args["pattern"].as_str() {
            Some(p) => p,
            None => return ToolResult::error("Missing required parameter: pattern"),
        };

        let search_root = match confine::resolve(&ctx.workspace_root, args["path"].as_str().unwrap_or(".")) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };

        let glob = match GlobBuilder::new(pattern).literal_separator(false).build() {
            Ok(g) => g.compile_matcher(),
            Err(e) => return ToolResult::error(format!("Invalid glob pattern: {}", e)),
        };

        let mut matches: Vec<(String, std::time::SystemTime)> = Vec::new();
        for entry in WalkDir::new(&search_root)
            .into_iter()
            .filter_entry(|e| {
                let name = e.file_name().to_string_lossy();
                !name.starts_with('.') && name != "node_modules" && name != "target"
            })
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let rel_path = entry.path().strip_prefix(&search_root).unwrap_or(entry.path());
            if glob.is_match(rel_path) {
                let mtime = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                matches.push((
                    confine::relative_display(&ctx.workspace_root, entry.path()),
                    mtime,
                ));
            }
        }

        matches.sort_by(|a, b| b.1.cmp(&a.1));
        debug!("glob: '{}' -> {} matches", pattern, matches.len());

        let files: Vec<String> = matches.into_iter().map(|(p, _)| p).collect();
        ToolResult::json(json!({ "pattern": pattern, "files": files }))
    }
}
