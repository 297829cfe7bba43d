//! Isocode Tools — the tool dispatcher and builtin tools
//!
//! Each tool is a self-contained file in src/tools/. To add a tool: create
//! the file, implement the Tool trait, register it in
//! create_default_registry().

pub mod confine;
pub mod mcp;
pub mod registry;
pub mod tools;

pub use mcp::{ServerStatus, ToolServerPool};
pub use registry::{Tool, ToolCategory, ToolCtx, ToolRegistry, ToolResult};
pub use tools::index::{FileIndex, FileIndexCache};

use isocode_llm::LlmProvider;
use std::sync::Arc;

/// Create the default tool registry with all builtin tools.
///
/// Shared services (the file-index cache and the tool-server pool) are
/// process-wide and live beyond any one session; the provider handle feeds
/// the vision tool.
pub fn create_default_registry(
    provider: Arc<dyn LlmProvider>,
    vision_model: Option<String>,
    index_cache: Arc<FileIndexCache>,
    server_pool: Arc<ToolServerPool>,
) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    // --- File tools ---
    registry.register(tools::read::ReadFileTool);
    registry.register(tools::read::ReadManyFilesTool);
    registry.register(tools::write::WriteFileTool);
    registry.register(tools::replace::ReplaceInFileTool);
    registry.register(tools::patch::ApplyDiffTool);

    // --- Search & navigation ---
    registry.register(tools::list::ListFilesTool);
    registry.register(tools::glob::GlobTool);
    registry.register(tools::grep::GrepSearchTool);
    registry.register(tools::index::CodebaseSearchTool::new(index_cache));

    // --- Shell, git, checks ---
    registry.register(tools::shell::RunCommandTool);
    registry.register(tools::git::GitStatusTool);
    registry.register(tools::git::GitDiffTool);
    registry.register(tools::git::GitLogTool);
    registry.register(tools::git::GitCommitTool);
    registry.register(tools::git::GitBranchTool);
    registry.register(tools::check::RunLintTool);
    registry.register(tools::check::RunTestsTool);

    // --- Memory, tasks, vision, external servers ---
    registry.register(tools::memory::AgentMemoryTool);
    registry.register(tools::tasks::TaskListTool::new());
    registry.register(tools::vision::AnalyzeImageTool::new(provider, vision_model));
    registry.register(tools::external::UseMcpTool::new(server_pool));

    registry
}
