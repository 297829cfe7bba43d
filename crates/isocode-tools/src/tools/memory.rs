//! Agent memory tool — durable key-value notes
//!
//! One JSON file per workspace under `.isocode/agent-memory.json`. At most
//! 200 keys; values are capped at 8,000 chars; the oldest entry is evicted
//! on overflow. Writes are last-write-wins across sessions.

use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tokio::fs;

const MAX_KEYS: usize = 200;
const MAX_VALUE_CHARS: usize = 8_000;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct MemoryFile {
    entries: Vec<MemoryEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct MemoryEntry {
    key: String,
    value: String,
    #[serde(rename = "updatedAt")]
    updated_at: String,
}

fn memory_path(root: &Path) -> PathBuf {
    root.join(".isocode").join("agent-memory.json")
}

async fn load(root: &Path) -> MemoryFile {
    match fs::read_to_string(memory_path(root)).await {
        Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
        Err(_) => MemoryFile::default(),
    }
}

async fn save(root: &Path, file: &MemoryFile) -> Result<(), String> {
    let path = memory_path(root);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| e.to_string())?;
    }
    let text = serde_json::to_string_pretty(file).map_err(|e| e.to_string())?;
    fs::write(path, text).await.map_err(|e| e.to_string())
}

pub struct AgentMemoryTool;

#[async_trait::async_trait]
impl Tool for AgentMemoryTool {
    fn name(&self) -> &str {
        "agent_memory"
    }

    fn description(&self) -> &str {
        "Durable key-value memory shared across sessions. Actions: set, get, \
         delete, list. Use it for facts worth remembering between runs."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Memory
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["set", "get", "delete", "list"],
                    "description": "Operation to perform"
                },
                "key": {
                    "type": "string",
                    "description": "Entry key (required for set/get/delete)"
                },
                "value": {
                    "type": "string",
                    "description": "Entry value (required for set)"
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
        let root = &ctx.workspace_root;

        match action {
            "set" => {
                let (Some(key), Some(value)) = (args["key"].as_str(), args["value"].as_str())
                else {
                    return ToolResult::error("set requires key and value");
                };
                let value: String = value.chars().take(MAX_VALUE_CHARS).collect();
                let mut file = load(root).await;
                file.entries.retain(|e| e.key != key);
                file.entries.push(MemoryEntry {
                    key: key.to_string(),
                    value,
                    updated_at: chrono::Utc::now().to_rfc3339(),
                });
                while file.entries.len() > MAX_KEYS {
                    file.entries.remove(0);
                }
                match save(root, &file).await {
                    Ok(()) => ToolResult::json(json!({ "saved": key, "keys": file.entries.len() })),
                    Err(e) => ToolResult::error(format!("Failed to save memory: {}", e)),
                }
            }
            "get" => {
                let Some(key) = args["key"].as_str() else {
                    return ToolResult::error("get requires key");
                };
                let file = load(root).await;
                match file.entries.iter().find(|e| e.key == key) {
                    Some(entry) => ToolResult::json(json!({
                        "key": key,
                        "value": entry.value,
                        "updatedAt": entry.updated_at,
                    })),
                    None => ToolResult::error(format!("No memory entry for key '{}'", key)),
                }
            }
            "delete" => {
                let Some(key) = args["key"].as_str() else {
                    return ToolResult::error("delete requires key");
                };
                let mut file = load(root).await;
                let before = file.entries.len();
                file.entries.retain(|e| e.key != key);
                if file.entries.len() == before {
                    return ToolResult::error(format!("No memory entry for key '{}'", key));
                }
                match save(root, &file).await {
                    Ok(()) => ToolResult::json(json!({ "deleted": key })),
                    Err(e) => ToolResult::error(format!("Failed to save memory: {}", e)),
                }
            }
            "list" => {
                let file = load(root).await;
                let keys: Vec<&str> = file.entries.iter().map(|e| e.key.as_str()).collect();
                ToolResult::json(json!({ "keys": keys }))
            }
            other => ToolResult::error(format!("Unknown action: {}", other)),
        }
    }
}
