//! Vision tool — load an image and describe it through the provider

use crate::confine;
use crate::registry::{Tool, ToolCategory, ToolCtx, ToolResult};
use base64::Engine;
use isocode_llm::{CallOptions, LlmProvider};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct AnalyzeImageTool {
    provider: Arc<dyn LlmProvider>,
    /// Preferred vision model; falls back to whatever the caller names.
    default_model: Option<String>,
}

impl AnalyzeImageTool {
    pub fn new(provider: Arc<dyn LlmProvider>, default_model: Option<String>) -> Self {
        Self {
            provider,
            default_model,
        }
    }
}

fn mime_for(path: &str) -> &'static str {
    match path.rsplit('.').next().map(|e| e.to_lowercase()).as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

#[async_trait::async_trait]
impl Tool for AnalyzeImageTool {
    fn name(&self) -> &str {
        "analyze_image"
    }

    fn description(&self) -> &str {
        "Load an image from the workspace and describe it with a vision \
         model. Pass a prompt to ask something specific about the image."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Vision
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
                    "description": "Workspace-relative image path (png/jpg/gif/webp)"
                },
                "prompt": {
                    "type": "string",
                    "description": "Question about the image (default: describe it)"
                },
                "model": {
                    "type": "string",
                    "description": "Vision model to use (default: configured vision model)"
                }
            },
            "required": ["path"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolCtx) -> ToolResult {
        let path = match args["path"].as_str() {
            Some(p) => p,
            None => return ToolResult::error("Missing required parameter: path"),
        };
        let resolved = match confine::resolve(&ctx.workspace_root, path) {
            Ok(p) => p,
            Err(e) => return ToolResult::error(e),
        };
        let bytes = match tokio::fs::read(&resolved).await {
            Ok(b) => b,
            Err(e) => return ToolResult::error(format!("Failed to read {}: {}", path, e)),
        };

        let Some(model) = args["model"]
            .as_str()
            .map(String::from)
            .or_else(|| self.default_model.clone())
        else {
            return ToolResult::error_with_hint(
                "No vision model configured",
                "set visionModel in the runtime config or pass model explicitly",
            );
        };

        let prompt = args["prompt"].as_str().unwrap_or("Describe this image.");
        let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);

        match self
            .provider
            .call_vision(&model, prompt, &encoded, mime_for(path), &CallOptions::default())
            .await
        {
            Ok(answer) => ToolResult::json(json!({ "path": path, "content": answer })),
            Err(e) => ToolResult::error(format!("Vision call failed: {}", e)),
        }
    }
}
