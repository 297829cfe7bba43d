//! Lint and test tools — project-type detection picks the command

use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use crate::tools::shell::run_shell;
use serde_json::{json, Value};
use std::path::Path;
use tracing::debug;

const LINT_TIMEOUT_SECS: u64 = 45;
const TEST_TIMEOUT_SECS: u64 = 90;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProjectKind {
    Rust,
    Node,
    Python,
    Go,
}

fn detect_project(root: &Path) -> Option<ProjectKind> {
    if root.join("Cargo.toml").exists() {
        Some(ProjectKind::Rust)
    } else if root.join("package.json").exists() {
        Some(ProjectKind::Node)
    } else if root.join("pyproject.toml").exists() || root.join("setup.py").exists() {
        Some(ProjectKind::Python)
    } else if root.join("go.mod").exists() {
        Some(ProjectKind::Go)
    } else {
        None
    }
}

pub struct RunLintTool;

#[async_trait::async_trait]
impl Tool for RunLintTool {
    fn name(&self) -> &str {
        "run_lint"
    }

    fn description(&self) -> &str {
        "Run the project's linter. The command is picked from the detected \
         project type (cargo clippy, npm run lint, ruff, go vet)."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Check
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, ctx: &ToolCtx) -> ToolResult {
        let command = match detect_project(&ctx.workspace_root) {
            Some(ProjectKind::Rust) => "cargo clippy --no-deps -q 2>&1",
            Some(ProjectKind::Node) => "npm run lint --if-present",
            Some(ProjectKind::Python) => "ruff check .",
            Some(ProjectKind::Go) => "go vet ./...",
            None => {
                return ToolResult::error_with_hint(
                    "Could not detect project type",
                    "no Cargo.toml, package.json, pyproject.toml, or go.mod found",
                )
            }
        };
        debug!("run_lint: {}", command);
        run_shell(command, &ctx.workspace_root, LINT_TIMEOUT_SECS).await
    }
}

pub struct RunTestsTool;

#[async_trait::async_trait]
impl Tool for RunTestsTool {
    fn name(&self) -> &str {
        "run_tests"
    }

    fn description(&self) -> &str {
        "Run the project's test suite. The command is picked from the \
         detected project type (cargo test, npm test, pytest, go test)."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Check
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "filter": {
                    "type": "string",
                    "description": "Test name filter, passed through to the runner"
                }
            }
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let filter = args["filter"].as_str().unwrap_or("");
        let command = match detect_project(&ctx.workspace_root) {
            Some(ProjectKind::Rust) => format!("cargo test -q {}", filter),
            Some(ProjectKind::Node) => {
                if filter.is_empty() {
                    "npm test".to_string()
                } else {
                    format!("npm test -- {}", filter)
                }
            }
            Some(ProjectKind::Python) => format!("python -m pytest -q {}", filter),
            Some(ProjectKind::Go) => {
                if filter.is_empty() {
                    "go test ./...".to_string()
                } else {
                    format!("go test -run {} ./...", filter)
                }
            }
            None => {
                return ToolResult::error_with_hint(
                    "Could not detect project type",
                    "no Cargo.toml, package.json, pyproject.toml, or go.mod found",
                )
            }
        };
        debug!("run_tests: {}", command);
        run_shell(command.trim(), &ctx.workspace_root, TEST_TIMEOUT_SECS).await
    }
}
