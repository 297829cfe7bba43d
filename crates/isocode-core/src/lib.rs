//! Isocode Core - Types, errors, configuration, and pure helpers

pub mod config;
pub mod diff;
pub mod directive;
pub mod error;
pub mod events;
pub mod truncate;
pub mod types;

pub use config::{PermissionPolicy, Permissions, RuntimeConfig, ToolServerConfig};
pub use directive::{DelegateTask, Directive};
pub use error::{Error, Result};
pub use events::AgentEvent;
pub use truncate::{smart_truncate, truncate_tool_result};
pub use types::*;
