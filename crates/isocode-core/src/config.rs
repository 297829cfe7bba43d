//! Runtime configuration.
//!
//! Merge order, later wins: built-in defaults, process environment,
//! `user-config.json`, then `/config` endpoint updates. The merged result is
//! persisted back to `user-config.json` on every update.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Permission policy for a tool category.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PermissionPolicy {
    Always,
    #[default]
    Ask,
    Never,
}

/// Per-category permission table, configurable at runtime.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permissions {
    #[serde(default)]
    pub shell: PermissionPolicy,
    #[serde(default)]
    pub write: PermissionPolicy,
    #[serde(default)]
    pub edit: PermissionPolicy,
}

/// An external tool server: a child process speaking JSON-RPC 2.0 over
/// newline-delimited stdin/stdout.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ToolServerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub provider: String,
    pub api_base: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub port: u16,
    pub permissions: Permissions,
    /// Total context window in tokens.
    pub context_budget: usize,
    /// Tokens reserved for the model's reply.
    pub reserved_reply_tokens: usize,
    /// Messages kept in a persisted conversation record.
    pub max_history: usize,
    pub temperature: Option<f32>,
    /// Delegation worker cap, clamped to 1..=5 at use sites.
    pub max_workers: usize,
    pub vision_model: Option<String>,
    pub tool_servers: Vec<ToolServerConfig>,
    pub system_prompt_override: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            provider: "local".to_string(),
            api_base: "http://127.0.0.1:11434".to_string(),
            api_key: None,
            model: None,
            port: 7420,
            permissions: Permissions::default(),
            context_budget: 16_384,
            reserved_reply_tokens: 1_024,
            max_history: 100,
            temperature: None,
            max_workers: 2,
            vision_model: None,
            tool_servers: Vec::new(),
            system_prompt_override: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with environment, overlaid with `user-config.json`.
    pub fn load(path: &Path) -> Self {
        let mut config = Self::default();
        config.apply_env();
        if let Ok(text) = std::fs::read_to_string(path) {
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                config.merge_value(&value);
            }
        }
        config
    }

    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ISOCODE_PROVIDER") {
            self.provider = v;
        }
        if let Ok(v) = std::env::var("ISOCODE_API_BASE") {
            self.api_base = v;
        }
        if let Ok(v) = std::env::var("ISOCODE_API_KEY") {
            self.api_key = Some(v);
        }
        if let Ok(v) = std::env::var("ISOCODE_MODEL") {
            self.model = Some(v);
        }
        if let Ok(v) = std::env::var("ISOCODE_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = std::env::var("ISOCODE_CONTEXT_BUDGET") {
            if let Ok(budget) = v.parse() {
                self.context_budget = budget;
            }
        }
    }

    /// Merge a partial JSON update (a `/config` payload or the on-disk file).
    /// Unknown keys are ignored; present keys replace current values.
    pub fn merge_value(&mut self, value: &serde_json::Value) {
        let Some(map) = value.as_object() else {
            return;
        };
        if let Some(v) = map.get("provider").and_then(|v| v.as_str()) {
            self.provider = v.to_string();
        }
        if let Some(v) = map.get("apiBase").or(map.get("api_base")).and_then(|v| v.as_str()) {
            self.api_base = v.to_string();
        }
        if let Some(v) = map.get("apiKey").or(map.get("api_key")).and_then(|v| v.as_str()) {
            self.api_key = Some(v.to_string());
        }
        if let Some(v) = map.get("model").and_then(|v| v.as_str()) {
            self.model = Some(v.to_string());
        }
        if let Some(v) = map.get("port").and_then(|v| v.as_u64()) {
            self.port = v as u16;
        }
        if let Some(v) = map.get("permissions") {
            if let Ok(p) = serde_json::from_value(v.clone()) {
                self.permissions = p;
            }
        }
        if let Some(v) = map
            .get("contextBudget")
            .or(map.get("context_budget"))
            .and_then(|v| v.as_u64())
        {
            self.context_budget = v as usize;
        }
        if let Some(v) = map
            .get("maxHistory")
            .or(map.get("max_history"))
            .and_then(|v| v.as_u64())
        {
            self.max_history = v as usize;
        }
        if let Some(v) = map.get("temperature").and_then(|v| v.as_f64()) {
            self.temperature = Some(v as f32);
        }
        if let Some(v) = map
            .get("maxWorkers")
            .or(map.get("max_workers"))
            .and_then(|v| v.as_u64())
        {
            self.max_workers = (v as usize).clamp(1, 5);
        }
        if let Some(v) = map
            .get("visionModel")
            .or(map.get("vision_model"))
            .and_then(|v| v.as_str())
        {
            self.vision_model = Some(v.to_string());
        }
        if let Some(v) = map.get("toolServers").or(map.get("tool_servers")) {
            if let Ok(servers) = serde_json::from_value(v.clone()) {
                self.tool_servers = servers;
            }
        }
        if let Some(v) = map
            .get("systemPrompt")
            .or(map.get("system_prompt_override"))
            .and_then(|v| v.as_str())
        {
            self.system_prompt_override = Some(v.to_string());
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Context budget with the reply reservation subtracted.
    pub fn effective_budget(&self) -> usize {
        self.context_budget
            .saturating_sub(self.reserved_reply_tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults() {
        let c = RuntimeConfig::default();
        assert_eq!(c.context_budget, 16_384);
        assert_eq!(c.effective_budget(), 15_360);
        assert_eq!(c.max_workers, 2);
        assert_eq!(c.permissions.shell, PermissionPolicy::Ask);
    }

    #[test]
    fn merge_partial_update() {
        let mut c = RuntimeConfig::default();
        c.merge_value(&json!({
            "model": "qwen2.5-coder:14b",
            "contextBudget": 32768,
            "maxWorkers": 99,
            "permissions": {"shell": "always", "write": "never", "edit": "ask"}
        }));
        assert_eq!(c.model.as_deref(), Some("qwen2.5-coder:14b"));
        assert_eq!(c.context_budget, 32_768);
        assert_eq!(c.max_workers, 5); // clamped
        assert_eq!(c.permissions.shell, PermissionPolicy::Always);
        assert_eq!(c.permissions.write, PermissionPolicy::Never);
        // untouched keys keep their values
        assert_eq!(c.port, 7420);
    }

    #[test]
    fn merge_ignores_non_object() {
        let mut c = RuntimeConfig::default();
        c.merge_value(&json!("nope"));
        assert_eq!(c.port, 7420);
    }
}
