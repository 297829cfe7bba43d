//! Core types for Isocode

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Session identifier - cheaply cloneable
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct SessionKey(Arc<str>);

impl SessionKey {
    pub fn new(s: impl Into<String>) -> Self {
        Self(Arc::from(s.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionKey {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for SessionKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Message role
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in a conversation. Assistant messages carry the raw directive
/// JSON; tool messages carry a truncated observation payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: content.into(),
        }
    }
}

/// Agent operating mode.
///
/// In `Agent` mode file mutations are proposed as diff requests and wait for
/// user approval; `AgentPlus` auto-applies mutations and may delegate
/// subtasks to the worker pool.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Chat,
    Agent,
    AgentPlus,
}

impl Mode {
    pub fn is_agent_plus(&self) -> bool {
        matches!(self, Mode::AgentPlus)
    }
}

/// A native tool call reported by the provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// A proposed file mutation awaiting approve/reject. At most one per session.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PendingDiff {
    /// Workspace-relative, forward-slash normalised.
    pub file_path: String,
    /// Unified-diff text. This stored diff is the one applied on approve;
    /// any diff echoed back by the client is informational only.
    pub diff: String,
}

/// Approval decision re-entering a waiting session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
}

/// An attached context file sent with a chat request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ContextAttachment {
    pub path: String,
    pub content: String,
}
