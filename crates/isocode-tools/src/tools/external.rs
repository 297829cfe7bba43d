//! External tool bridge — invoke tools on configured tool servers

use crate::mcp::ToolServerPool;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct UseMcpTool {
    pool: Arc<ToolServerPool>,
}

impl UseMcpTool {
    pub fn new(pool: Arc<ToolServerPool>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl Tool for UseMcpTool {
    fn name(&self) -> &str {
        "use_mcp_tool"
    }

    fn description(&self) -> &str {
        "Invoke a tool exposed by a configured external tool server. Check \
         the server list first if unsure which tools exist."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::External
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "server": {
                    "type": "string",
                    "description": "Configured server name"
                },
                "tool": {
                    "type": "string",
                    "description": "Tool name on that server"
                },
                "arguments": {
                    "type": "object",
                    "description": "Arguments object passed through to the tool"
                }
            },
            "required": ["server", "tool"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolCtx) -> ToolResult {
        let server = match args["server"].as_str() {
            Some(s) => s,
            None => return ToolResult::error("Missing required parameter: server"),
        };
        let tool = match args["tool"].as_str() {
            Some(t) => t,
            None => return ToolResult::error("Missing required parameter: tool"),
        };
        let arguments = args.get("arguments").cloned().unwrap_or(json!({}));

        match self.pool.call(server, tool, arguments).await {
            Ok(result) => ToolResult::json(result),
            Err(e) => ToolResult::error(e),
        }
    }
}
