//! Isocode LLM - unified provider adapter over local backend dialects

pub mod http;
pub mod mock;
pub mod provider;
pub mod types;

pub use http::HttpProvider;
pub use mock::MockProvider;
pub use provider::{LlmError, LlmProvider, LlmResult, LlmStream};
pub use types::*;
