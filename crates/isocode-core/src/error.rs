//! Error types for Isocode
//!
//! The engine never raises out of its loop: every error path converges on a
//! `final` event (terminating) or an `observation` event (continuing). These
//! variants exist so each layer can decide which of the two it is.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Caller mistake - maps to HTTP 4xx or an SSE `error` frame.
    #[error("{0}")]
    User(String),

    /// Backend is unreachable or the model is missing. Terminates the run
    /// with a descriptive `final`.
    #[error("provider unavailable: {message}")]
    ProviderUnavailable {
        message: String,
        hint: Option<String>,
    },

    /// Recoverable provider failure - retried by the adapter and the engine.
    #[error("provider error: {0}")]
    ProviderTransient(String),

    #[error("tool error: {name} - {message}")]
    Tool { name: String, message: String },

    /// The model's reply could not be parsed as a directive.
    #[error("unparsable model output: {0}")]
    Parse(String),

    /// Worker failure that disables further delegation for the session.
    #[error("delegation failed: {0}")]
    Delegation(String),

    #[error("agent stopped by user")]
    StopRequested,

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn user(message: impl Into<String>) -> Self {
        Self::User(message.into())
    }

    pub fn tool(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>, hint: Option<String>) -> Self {
        Self::ProviderUnavailable {
            message: message.into(),
            hint,
        }
    }

    /// The full user-visible text, with the remediation hint when one exists.
    pub fn user_message(&self) -> String {
        match self {
            Error::ProviderUnavailable {
                message,
                hint: Some(hint),
            } => format!("{} ({})", message, hint),
            other => other.to_string(),
        }
    }
}
