//! Arbor HTTP API
//!
//! JSON over axum. Engine calls are synchronous and run on tokio's blocking
//! pool; failures come back as `{code, message}` with the engine's stable
//! error code.

pub mod server;

pub use server::{build_router, start_server, AppState, SharedState};
