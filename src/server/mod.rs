//! HTTP server and overlay WebSocket transport

pub mod http;
pub mod overlay_ws;

pub use http::{run, AppState};
