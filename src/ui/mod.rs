//! Local HTTP API for UI layers

pub mod handlers;
pub mod server;

pub use server::{router, AppState, WebServer};
