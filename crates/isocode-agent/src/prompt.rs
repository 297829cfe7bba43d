//! System prompt rendering.
//!
//! Deterministically assembled: directive-format preamble, planning clause,
//! mode-dependent permissions clause, the categorised tool listing, workflow
//! rules, then whatever workspace context the session manager gathered.

use isocode_core::Mode;

/// Workspace context gathered at session creation.
#[derive(Clone, Debug, Default)]
pub struct PromptContext {
    /// The caller attached explicit context files to the request.
    pub context_files_attached: bool,
    pub project_context: Option<String>,
    pub project_map: Option<String>,
    pub rules: Option<String>,
    pub memory_primer: Option<String>,
    /// Prior checkpoint, already capped for injection.
    pub checkpoint: Option<String>,
}

const PREAMBLE: &str = "\
You are a coding agent working inside the user's workspace. On every turn \
you reply with exactly one JSON object, a directive, and nothing else:\n\
- {\"type\":\"thought\",\"content\":\"...\"} - reasoning, planning, progress notes\n\
- {\"type\":\"action\",\"tool\":\"<name>\",\"args\":{...}} - invoke one tool\n\
- {\"type\":\"diff_request\",\"filePath\":\"<path>\",\"diff\":\"<unified diff>\"} - propose a file change\n\
- {\"type\":\"delegate\",\"tasks\":[\"...\"]} - split independent subtasks to parallel workers\n\
- {\"type\":\"final\",\"content\":\"...\"} - finish with a summary for the user";

const PLANNING: &str = "\
On your first turn emit a single thought starting with PLAN: followed by a \
numbered list of the tasks you will do. On later turns emit thoughts \
starting with PROGRESS: noting which numbered task you completed. Only emit \
final once every planned task is done.";

const PERMISSIONS_AGENT: &str = "\
You do not have write permission. Propose every file mutation as a \
diff_request and wait for the user's decision; after an approval or \
rejection observation, continue from there.";

const PERMISSIONS_AGENT_PLUS: &str = "\
All permissions are granted: write files and run commands directly through \
actions. Do not emit diff_request. You may delegate independent subtasks.";

const WORKFLOW: &str = "\
Workflow rules:\n\
- Read a file before writing or editing it.\n\
- Prefer surgical edits (replace_in_file) over whole-file rewrites.\n\
- Batch reads with read_many_files when you already know the paths.\n\
- Keep observations in mind; do not re-read unchanged files.\n\
- If a path is missing, probe with list_files before retrying.";

pub fn render_system_prompt(mode: Mode, tool_listing: &str, context: &PromptContext) -> String {
    let permissions = match mode {
        Mode::AgentPlus => PERMISSIONS_AGENT_PLUS,
        _ => PERMISSIONS_AGENT,
    };

    let mut out = format!(
        "{}\n\n{}\n\n{}\n\n## Available tools\n\n{}\n\n{}",
        PREAMBLE, PLANNING, permissions, tool_listing, WORKFLOW
    );

    if context.context_files_attached {
        out.push_str(
            "\n\nThe user attached context files to this request; they are \
             included in the first message. Prefer them over re-reading.",
        );
    }
    if let Some(ref project_context) = context.project_context {
        out.push_str("\n\n");
        out.push_str(project_context);
    }
    if let Some(ref map) = context.project_map {
        out.push_str(&format!("\n\nWorkspace map: {}", map));
    }
    if let Some(ref rules) = context.rules {
        out.push_str(&format!("\n\nProject rules:\n{}", rules));
    }
    if let Some(ref primer) = context.memory_primer {
        out.push_str("\n\n");
        out.push_str(primer);
    }
    if let Some(ref checkpoint) = context.checkpoint {
        out.push_str(&format!(
            "\n\nResuming from a prior checkpoint:\n{}",
            checkpoint
        ));
    }
    out
}
