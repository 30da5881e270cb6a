//! HTTP/SSE surface: session and turn CRUD, the live event stream with
//! replay, permission resolution, filesystem inspection, and exports.

mod auth;
mod error;
mod handlers;
mod orchestrator;
mod server;
mod sse;

pub use error::ApiError;
pub use orchestrator::Orchestrator;
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
