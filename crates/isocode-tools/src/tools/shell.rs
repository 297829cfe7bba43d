//! Shell tool — execute commands with timeout and output caps

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use serde_json::{json, Value};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MAX_TIMEOUT_SECS: u64 = 600;

pub struct RunCommandTool;

#[async_trait::async_trait]
impl Tool for RunCommandTool {
    fn name(&self) -> &str {
        "run_command"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace. Captures stdout and \
         stderr. Set timeout in seconds (default 30). Prefer the dedicated \
         file and search tools over shell equivalents."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Shell
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory, workspace-relative (default: workspace root)"
                },
                "timeout": {
                    "type": "integer",
                    "description": "Timeout in seconds (default 30, max 600)"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let command = match args["command"].as_str() {
            Some(c) => c,
            None => return ToolResult::error("Missing required parameter: command"),
        };
        let timeout_secs = args["timeout"]
            .as_u64()
            .unwrap_or(DEFAULT_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);
        let cwd = match args["cwd"].as_str() {
            Some(dir) => match confine::resolve(&ctx.workspace_root, dir) {
                Ok(p) => p,
                Err(e) => return ToolResult::error(e),
            },
            None => ctx.workspace_root.clone(),
        };

        debug!("run_command: {}", &command[..command.len().min(80)]);
        run_shell(command, &cwd, timeout_secs).await
    }
}

/// Shared runner for shell-backed tools.
pub(crate) async fn run_shell(command: &str, cwd: &Path, timeout_secs: u64) -> ToolResult {
    let output = match tokio::time::timeout(
        std::time::Duration::from_secs(timeout_secs),
        Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(cwd)
            .kill_on_drop(true)
            .output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return ToolResult::error(format!("Failed to execute: {}", e)),
        Err(_) => {
            return ToolResult::error(format!("Command timed out after {}s", timeout_secs))
        }
    };

    ToolResult::json(json!({
        "exitCode": output.status.code().unwrap_or(-1),
        "stdout": String::from_utf8_lossy(&output.stdout).trim_end(),
        "stderr": String::from_utf8_lossy(&output.stderr).trim_end(),
    }))
}
