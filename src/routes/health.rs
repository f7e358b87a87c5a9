//! Health check endpoint
//!
//! `/health` always answers 200 while the process runs; the body reports
//! the chat session state and the live overlay connection count.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use crate::chat::PresenceState;
use crate::server::http::json_response;
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    /// Chat bot session state
    pub chat: PresenceState,
    pub addons: usize,
    pub overlay_channels: usize,
    /// Identified overlay sockets
    pub overlay_connections: usize,
    pub dev_mode: bool,
}

async fn build_health_response(state: &AppState) -> HealthResponse {
    HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        chat: state.presence.state(),
        addons: state.catalog.len(),
        overlay_channels: state.channels.channel_count(),
        overlay_connections: state.channels.registry().connection_count().await,
        dev_mode: state.args.dev_mode,
    }
}

/// Handle liveness probe (/health, /healthz)
pub async fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let response = build_health_response(state).await;
    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"healthy":true,"error":"Serialization failed"}"#.to_string());
    json_response(StatusCode::OK, body)
}
