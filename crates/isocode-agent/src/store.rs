//! On-disk session state under `<workspace>/.isocode/`.
//!
//! Conversations persist the last 100 messages with contents truncated to
//! 4,000 chars each; the in-memory history is never truncated. Project
//! context is a small key-value file capped at 100 keys, oldest evicted.

use isocode_core::{Message, Mode, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

const MESSAGE_CONTENT_CAP: usize = 4_000;
const PROJECT_CONTEXT_MAX_KEYS: usize = 100;

/// Replace everything outside `[A-Za-z0-9._-]` and cap the length.
/// Idempotent: sanitising a sanitised id is a no-op.
pub fn sanitize_session_id(id: &str) -> String {
    let cleaned: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    cleaned.chars().take(64).collect()
}

pub fn isocode_dir(workspace: &Path) -> PathBuf {
    workspace.join(".isocode")
}

fn conversations_dir(workspace: &Path) -> PathBuf {
    isocode_dir(workspace).join("conversations")
}

fn conversation_path(workspace: &Path, session_id: &str) -> PathBuf {
    conversations_dir(workspace).join(format!("{}.json", sanitize_session_id(session_id)))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    #[serde(rename = "messageCount")]
    pub message_count: usize,
    pub metadata: ConversationMetadata,
    pub messages: Vec<Message>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConversationMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub compacted: bool,
}

/// Persist the last `max_history` messages of a conversation.
pub fn save_conversation(
    workspace: &Path,
    session_id: &str,
    messages: &[Message],
    metadata: ConversationMetadata,
    max_history: usize,
) -> Result<()> {
    let start = messages.len().saturating_sub(max_history.min(100));
    let tail: Vec<Message> = messages[start..]
        .iter()
        .map(|m| Message {
            role: m.role,
            content: isocode_core::smart_truncate(&m.content, MESSAGE_CONTENT_CAP),
        })
        .collect();

    let record = ConversationRecord {
        updated_at: chrono::Utc::now().to_rfc3339(),
        message_count: messages.len(),
        metadata,
        messages: tail,
    };

    let path = conversation_path(workspace, session_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, serde_json::to_string_pretty(&record)?)?;
    debug!("saved conversation {} ({} messages)", session_id, record.message_count);
    Ok(())
}

pub fn load_conversation(workspace: &Path, session_id: &str) -> Option<ConversationRecord> {
    let text = std::fs::read_to_string(conversation_path(workspace, session_id)).ok()?;
    serde_json::from_str(&text).ok()
}

pub fn delete_conversation(workspace: &Path, session_id: &str) -> bool {
    std::fs::remove_file(conversation_path(workspace, session_id)).is_ok()
}

/// Saved session ids, newest first by mtime.
pub fn list_conversations(workspace: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(conversations_dir(workspace)) else {
        return Vec::new();
    };
    let mut found: Vec<(String, std::time::SystemTime)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            let id = name.strip_suffix(".json")?.to_string();
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            Some((id, mtime))
        })
        .collect();
    found.sort_by(|a, b| b.1.cmp(&a.1));
    found.into_iter().map(|(id, _)| id).collect()
}

// ---------------------------------------------------------------------------
// Project context
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize)]
struct ProjectContextEntry {
    key: String,
    value: String,
    #[serde(rename = "updatedAt")]
    updated_at: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct ProjectContextFile {
    entries: Vec<ProjectContextEntry>,
}

fn project_context_path(workspace: &Path) -> PathBuf {
    isocode_dir(workspace).join("project-context.json")
}

fn load_project_context_file(workspace: &Path) -> ProjectContextFile {
    std::fs::read_to_string(project_context_path(workspace))
        .ok()
        .and_then(|text| serde_json::from_str(&text).ok())
        .unwrap_or_default()
}

pub fn set_project_context(workspace: &Path, key: &str, value: &str) -> Result<()> {
    let mut file = load_project_context_file(workspace);
    file.entries.retain(|e| e.key != key);
    file.entries.push(ProjectContextEntry {
        key: key.to_string(),
        value: value.to_string(),
        updated_at: chrono::Utc::now().to_rfc3339(),
    });
    while file.entries.len() > PROJECT_CONTEXT_MAX_KEYS {
        file.entries.remove(0);
    }
    let path = project_context_path(workspace);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
    Ok(())
}

/// Short rendering of the project context for the system prompt.
pub fn project_context_summary(workspace: &Path, cap: usize) -> Option<String> {
    let file = load_project_context_file(workspace);
    if file.entries.is_empty() {
        return None;
    }
    let mut out = String::from("Project context:\n");
    for entry in file.entries.iter().rev() {
        let line = format!(
            "- {}: {}\n",
            entry.key,
            isocode_core::smart_truncate(&entry.value, 200)
        );
        if out.len() + line.len() > cap {
            break;
        }
        out.push_str(&line);
    }
    Some(out.trim_end().to_string())
}

/// Project rules text, when the workspace carries one.
pub fn load_rules(workspace: &Path) -> Option<String> {
    let text = std::fs::read_to_string(isocode_dir(workspace).join("rules.md")).ok()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| isocode_core::smart_truncate(trimmed, 4_000))
}

// ---------------------------------------------------------------------------
// Nudge texts shared by the engine
// ---------------------------------------------------------------------------

/// Reminder injected after an unparsable reply. Agent-plus sessions may
/// also delegate, so the listed type union depends on the mode.
pub fn json_format_nudge(mode: Mode) -> Message {
    let types = if mode.is_agent_plus() {
        "{\"type\":\"thought\"|\"action\"|\"diff_request\"|\"delegate\"|\"final\", ...}"
    } else {
        "{\"type\":\"thought\"|\"action\"|\"diff_request\"|\"final\", ...}"
    };
    Message::user(format!(
        "Your last reply was not a valid directive. Reply with exactly one \
         JSON object: {}.",
        types
    ))
}
