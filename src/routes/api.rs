//! Read-only API
//!
//! - `GET /api/v1/addons` lists the addon catalog
//! - `GET /api/v1/overlay/{overlayId}` returns the public record behind an
//!   overlay URL, the same payload overlays get through `get_overlay_info`

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;

use crate::server::http::{error_response, json_response};
use crate::server::AppState;
use crate::types::RuinousError;

pub fn list_addons(state: &AppState) -> Response<Full<Bytes>> {
    let addons: Vec<_> = state.catalog.iter().map(|a| a.as_ref()).collect();
    match serde_json::to_string(&json!({ "addons": addons })) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => error_response(RuinousError::Internal(e.to_string())),
    }
}

pub async fn overlay_record(state: &AppState, overlay_id: &str) -> Response<Full<Bytes>> {
    if overlay_id.is_empty() || overlay_id.contains('/') {
        return error_response(RuinousError::BadRequest("invalid overlay id".to_string()));
    }

    let lookup = tokio::time::timeout(
        state.args.request_timeout(),
        state.addons.public_overlay_record(overlay_id),
    )
    .await
    .map_err(RuinousError::from)
    .and_then(|r| r);

    match lookup {
        Ok(record) => json_response(StatusCode::OK, record.to_string()),
        Err(e) => error_response(e),
    }
}
