//! Isocode Agent — the session-oriented ReAct engine
//!
//! Sessions, the step loop, context budgeting, conversation persistence,
//! checkpoints, and the delegation pool.

pub mod checkpoint;
pub mod context;
pub mod delegate;
pub mod engine;
pub mod parser;
pub mod prompt;
pub mod session;
pub mod store;

pub use context::ContextManager;
pub use engine::{AgentRuntime, EventSink, TurnRequest};
pub use session::{Session, SessionRegistry, SessionState};
pub use store::sanitize_session_id;

pub use isocode_core::SessionKey;
