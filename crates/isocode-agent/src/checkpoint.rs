//! Checkpoints and cross-session memory.
//!
//! Checkpoints are human-readable markdown snapshots written at session
//! start, every eighth step, after compaction, and on every termination
//! path. Session memory files hold an LLM-generated summary; the three most
//! recent feed the primer appended to new sessions' system prompts.

use crate::session::SessionState;
use crate::store::{isocode_dir, sanitize_session_id};
use isocode_core::{Directive, Result, Role};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Cap applied when a prior checkpoint is injected into a system prompt.
pub const CHECKPOINT_RESUME_CAP: usize = 1_500;
const PRIMER_SOURCES: usize = 3;

fn checkpoints_dir(workspace: &Path) -> PathBuf {
    isocode_dir(workspace).join("checkpoints")
}

fn memory_dir(workspace: &Path) -> PathBuf {
    isocode_dir(workspace).join("memory")
}

fn checkpoint_path(workspace: &Path, session_id: &str) -> PathBuf {
    checkpoints_dir(workspace).join(format!("{}.md", sanitize_session_id(session_id)))
}

/// Write the markdown snapshot for a session.
pub fn write_checkpoint(workspace: &Path, session_id: &str, state: &SessionState) -> Result<()> {
    let mut out = String::new();
    out.push_str(&format!("# Session {}\n\n", session_id));
    out.push_str(&format!(
        "Updated: {}\nStep: {}\nMode: {:?}\n\n",
        chrono::Utc::now().to_rfc3339(),
        state.steps,
        state.mode
    ));

    out.push_str("## User requests\n\n");
    for message in state
        .messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::User)
        .take(5)
    {
        out.push_str(&format!(
            "- {}\n",
            isocode_core::smart_truncate(&message.content, 200)
        ));
    }

    out.push_str("\n## Recent thoughts\n\n");
    for message in state
        .messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .take(5)
    {
        if let Some(Directive::Thought { content }) = Directive::parse_strict(&message.content) {
            out.push_str(&format!("- {}\n", isocode_core::smart_truncate(&content, 200)));
        }
    }

    out.push_str("\n## Tool actions\n\n");
    for message in state
        .messages
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .take(20)
    {
        if let Some(Directive::Action { tool, args }) = Directive::parse_strict(&message.content) {
            let arg = args
                .as_object()
                .and_then(|o| o.values().next())
                .and_then(|v| v.as_str())
                .unwrap_or("");
            out.push_str(&format!("- {} {}\n", tool, arg));
        }
    }

    if let Some(ref plan) = state.plan {
        out.push_str(&format!(
            "\n## Current plan ({}/{} done)\n\n{}\n",
            state.completed_tasks,
            state.total_tasks,
            isocode_core::smart_truncate(plan, 1_000)
        ));
    }

    let path = checkpoint_path(workspace, session_id);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, out)?;
    debug!("checkpoint written for {}", session_id);
    Ok(())
}

/// Prior checkpoint text for resuming, capped for prompt injection.
pub fn load_checkpoint(workspace: &Path, session_id: &str) -> Option<String> {
    let text = std::fs::read_to_string(checkpoint_path(workspace, session_id)).ok()?;
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| isocode_core::smart_truncate(trimmed, CHECKPOINT_RESUME_CAP))
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemorySummary {
    pub summary: String,
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
}

pub fn save_memory_summary(workspace: &Path, session_id: &str, summary: &str) -> Result<()> {
    let path = memory_dir(workspace).join(format!("{}.json", sanitize_session_id(session_id)));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let record = MemorySummary {
        summary: summary.to_string(),
        updated_at: chrono::Utc::now().to_rfc3339(),
    };
    std::fs::write(path, serde_json::to_string_pretty(&record)?)?;
    Ok(())
}

/// Primer built from the three most recent session summaries.
pub fn memory_primer(workspace: &Path) -> Option<String> {
    let Ok(entries) = std::fs::read_dir(memory_dir(workspace)) else {
        return None;
    };
    let mut files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .map(|entry| {
            let mtime = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            (entry.path(), mtime)
        })
        .collect();
    files.sort_by(|a, b| b.1.cmp(&a.1));

    let summaries: Vec<String> = files
        .into_iter()
        .take(PRIMER_SOURCES)
        .filter_map(|(path, _)| {
            let text = std::fs::read_to_string(path).ok()?;
            let record: MemorySummary = serde_json::from_str(&text).ok()?;
            Some(isocode_core::smart_truncate(&record.summary, 300))
        })
        .collect();

    if summaries.is_empty() {
        return None;
    }
    Some(format!(
        "Recent session summaries:\n{}",
        summaries
            .iter()
            .map(|s| format!("- {}", s))
            .collect::<Vec<_>>()
            .join("\n")
    ))
}
