//! Isocode Gateway — the HTTP + SSE server boundary

pub mod server;

pub use server::{build_state, router, serve, AppState};
