//! Grep tool — content search with regex support

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use regex::Regex;
use serde_json::{json, Value};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;

/// Hard cap on collected matches before the dispatcher's own truncation.
const MAX_MATCHES: usize = 500;

pub struct GrepSearchTool;

#[async_trait::async_trait]
impl Tool for GrepSearchTool {
    fn name(&self) -> &str {
        "grep_search"
    }

    fn description(&self) -> &str {
        "Search file contents with a regex. Returns matching lines with file \
         and line number. Use glob to filter which files are searched."
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
                    "description": "Regex pattern to search for"
                },
                "path": {
                    "type": "string",
                    "description": "File or directory to search (default: workspace root)"
                },
                "glob": {
                    "type": "string",
                    "description": "Glob pattern to filter files (e.g. '*.rs')"
                },
                "case_insensitive": {
                    "type": "boolean",
                    "description": "Case insensitive search (default: false)"
                }
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let pattern_str = match args["pattern"].as_str() {
            Some(p) => p,
            None => return ToolResult::error("Missing required parameter: pattern"),
        };

        let regex_pattern = if args["case_insensitive"].as_bool().unwrap_or(false) {
            format!("(?i){}", pattern_str)
        } else {
            pattern_str.to_string()
        };
        let regex = match Regex::new(&regex_pattern) {
            Ok(r) => r,
            Err(e) => return ToolResult::error(format!("Invalid regex: {}", e)),
        };

        let search_root =
            match confine::resolve(&ctx.workspace_root, args["path"].as_str().unwrap_or(".")) {
                Ok(p) => p,
                Err(e) => return ToolResult::error(e),
            };

        let file_glob = args["glob"].as_str().and_then(|g| {
            globset::GlobBuilder::new(g)
                .literal_separator(false)
                .build()
                .ok()
                .map(|g| g.compile_matcher())
        });

        let mut matches = Vec::new();

        if search_root.is_file() {
            search_file(&ctx.workspace_root, &search_root, &regex, &mut matches);
        } else {
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
                if let Some(ref glob) = file_glob {
                    let name = entry.file_name().to_string_lossy();
                    if !glob.is_match(name.as_ref()) {
                        continue;
                    }
                }
                search_file(&ctx.workspace_root, entry.path(), &regex, &mut matches);
                if matches.len() >= MAX_MATCHES {
                    break;
                }
            }
        }

        debug!("grep_search: '{}' -> {} matches", pattern_str, matches.len());
        ToolResult::json(json!({ "pattern": pattern_str, "matches": matches }))
    }
}

fn search_file(root: &Path, path: &Path, regex: &Regex, matches: &mut Vec<Value>) {
    // Skip binary files (NUL byte in the first 512 bytes).
    let Ok(bytes) = std::fs::read(path) else {
        return;
    };
    if bytes.iter().take(512).any(|b| *b == 0) {
        return;
    }
    let content = String::from_utf8_lossy(&bytes);
    let display = confine::relative_display(root, path);

    for (i, line) in content.lines().enumerate() {
        if regex.is_match(line) {
            matches.push(json!({
                "file": display,
                "line": i + 1,
                "text": line.trim_end(),
            }));
            if matches.len() >= MAX_MATCHES {
                return;
            }
        }
    }
}
