//! Agent Center server
//!
//! Accepts agent streams on a transport listener and runs one transfer
//! session per stream against a shared admission gate and connection
//! registry, and exposes a manager-facing HTTP API over the same state.

pub mod api;
pub mod config;
pub mod server;

pub use api::{serve_api, ApiState, CommandRequest, ConnectionList, ConnectionView};
pub use config::{ConfigError, ServerConfig};
pub use server::{AgentCenter, ServerError};
