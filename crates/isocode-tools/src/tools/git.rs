//! Git tools — guarded subprocess invocations
//!
//! Arguments are passed as argv, never through a shell, so commit messages
//! and pathspecs cannot smuggle shell syntax.

use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use serde_json::{json, Value};
use std::path::Path;
use tokio::process::Command;

const GIT_TIMEOUT_SECS: u64 = 30;

async fn run_git(cwd: &Path, args: &[&str]) -> ToolResult {
    let output = match tokio::time::timeout(
        std::time::Duration::from_secs(GIT_TIMEOUT_SECS),
        Command::new("git")
            .args(args)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return ToolResult::error(format!("Failed to run git: {}", e)),
        Err(_) => return ToolResult::error(format!("git timed out after {}s", GIT_TIMEOUT_SECS)),
    };

    ToolResult::json(json!({
        "exitCode": output.status.code().unwrap_or(-1),
        "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
        "stderr": String::from_utf8_lossy(&output.stderr).trim_end(),
    }))
}

fn empty_schema() -> Value {
    json!({ "type": "object", "properties": {} })
}

pub struct GitStatusTool;

#[async_trait::async_trait]
impl Tool for GitStatusTool {
    fn name(&self) -> &str {
        "git_status"
    }

    fn description(&self) -> &str {
        "Show the working tree status (git status --short)."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Git
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        empty_schema()
    }

    async fn execute(&self, _args: Value, ctx: &ToolCtx) -> ToolResult {
        run_git(&ctx.workspace_root, &["status", "--short", "--branch"]).await
    }
}

pub struct GitDiffTool;

#[async_trait::async_trait]
impl Tool for GitDiffTool {
    fn name(&self) -> &str {
        "git_diff"
    }

    fn description(&self) -> &str {
        "Show unstaged changes, or a single file's changes when path is given."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Git
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
                    "description": "Limit the diff to one file"
                },
                "staged": {
                    "type": "boolean",
                    "description": "Diff the index instead of the working tree"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let mut git_args = vec!["diff"];
        if args["staged"].as_bool().unwrap_or(false) {
            git_args.push("--cached");
        }
        if let Some(path) = args["path"].as_str() {
            git_args.push("--");
            git_args.push(path);
        }
        run_git(&ctx.workspace_root, &git_args).await
    }
}

pub struct GitLogTool;

#[async_trait::async_trait]
impl Tool for GitLogTool {
    fn name(&self) -> &str {
        "git_log"
    }

    fn description(&self) -> &str {
        "Show recent commits (one line each, default 20)."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Git
    }

    fn is_read_only(&self) -> bool {
        true
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "count": {
                    "type": "integer",
                    "description": "Number of commits to show (default 20)"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let count = args["count"].as_u64().unwrap_or(20).min(200);
        let count_arg = format!("-{}", count);
        run_git(&ctx.workspace_root, &["log", "--oneline", count_arg.as_str()]).await
    }
}

pub struct GitCommitTool;

#[async_trait::async_trait]
impl Tool for GitCommitTool {
    fn name(&self) -> &str {
        "git_commit"
    }

    fn description(&self) -> &str {
        "Stage all changes and commit with the given message."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Git
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {
                    "type": "string",
                    "description": "Commit message"
                }
            },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let message = match args["message"].as_str() {
            Some(m) if !m.trim().is_empty() => m,
            _ => return ToolResult::error("Missing required parameter: message"),
        };
        let add = run_git(&ctx.workspace_root, &["add", "-A"]).await;
        if add.is_error() {
            return add;
        }
        run_git(&ctx.workspace_root, &["commit", "-m", message]).await
    }
}

pub struct GitBranchTool;

#[async_trait::async_trait]
impl Tool for GitBranchTool {
    fn name(&self) -> &str {
        "git_branch"
    }

    fn description(&self) -> &str {
        "List branches, or create and switch to a new one when name is given."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Git
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "name": {
                    "type": "string",
                    "description": "Branch to create and switch to"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        match args["name"].as_str() {
            Some(name) => run_git(&ctx.workspace_root, &["checkout", "-b", name]).await,
            None => run_git(&ctx.workspace_root, &["branch", "--list"]).await,
        }
    }
}
