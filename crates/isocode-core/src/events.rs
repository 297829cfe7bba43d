//! Server-sent event frames consumed by the editor extension.
//!
//! Every frame is one `data: <json>\n\n` SSE record whose JSON carries a
//! `type` discriminator.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// Streaming-chat token delta.
    Chunk { content: String },
    /// Streaming-chat terminator.
    Done,
    Thought {
        content: String,
    },
    Action {
        tool: String,
        args: serde_json::Value,
    },
    Observation {
        content: String,
    },
    Final {
        content: String,
    },
    /// Approval request; the run ends and the session waits for a decision.
    DiffRequest {
        #[serde(rename = "filePath")]
        file_path: String,
        diff: String,
        #[serde(rename = "sessionId")]
        session_id: String,
    },
    /// Hint for the editor to reveal a file the agent just wrote.
    OpenFile {
        path: String,
    },
    /// Out-of-band error.
    Error {
        content: String,
    },
}

impl AgentEvent {
    pub fn observation(content: impl Into<String>) -> Self {
        AgentEvent::Observation {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        AgentEvent::Error {
            content: content.into(),
        }
    }

    pub fn final_text(content: impl Into<String>) -> Self {
        AgentEvent::Final {
            content: content.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_carry_type_discriminator() {
        let json = serde_json::to_string(&AgentEvent::Chunk {
            content: "hi".into(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"chunk""#));

        let json = serde_json::to_string(&AgentEvent::Done).unwrap();
        assert_eq!(json, r#"{"type":"done"}"#);
    }

    #[test]
    fn diff_request_uses_camel_case_fields() {
        let json = serde_json::to_string(&AgentEvent::DiffRequest {
            file_path: "src/a.ts".into(),
            diff: "--- a".into(),
            session_id: "s1".into(),
        })
        .unwrap();
        assert!(json.contains(r#""filePath":"src/a.ts""#));
        assert!(json.contains(r#""sessionId":"s1""#));
    }
}
