//! HTTP server implementation
//!
//! One listener serves the health probe, the read-only API and the overlay
//! WebSocket upgrades.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::addons::AddonCatalog;
use crate::chat::ChatPresence;
use crate::config::Args;
use crate::overlay::OverlayChannels;
use crate::routes;
use crate::server::overlay_ws;
use crate::services::AddonService;
use crate::types::{Result, RuinousError};

pub(crate) type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Prefix of the overlay WebSocket path; the addon id follows it
pub const OVERLAY_WS_PREFIX: &str = "/overlay/ws/";

/// Prefix of the public overlay record path; the overlay id follows it
pub const OVERLAY_API_PREFIX: &str = "/api/v1/overlay/";

/// Shared application state
pub struct AppState {
    pub args: Args,
    pub catalog: Arc<AddonCatalog>,
    pub addons: Arc<AddonService>,
    pub channels: Arc<OverlayChannels>,
    pub presence: ChatPresence,
}

/// Accept connections until the listener fails to bind
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.args.listen).await?;
    serve(listener, state).await
}

/// Serve on an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    let local = listener.local_addr()?;
    info!(
        "Ruinous listening on {} (overlays at {}{}<addonId>)",
        local,
        state.args.effective_root_url(),
        OVERLAY_WS_PREFIX
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - relaxed configuration checks");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .serve_connection(io, service)
                        .with_upgrades()
                        .await
                    {
                        debug!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    if method == Method::GET {
        if let Some(addon_id) = path.strip_prefix(OVERLAY_WS_PREFIX) {
            return Ok(to_boxed(overlay_upgrade(&state, addon_id, req)));
        }
        if let Some(overlay_id) = path.strip_prefix(OVERLAY_API_PREFIX) {
            return Ok(to_boxed(routes::overlay_record(&state, overlay_id).await));
        }
    }

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            routes::health_check(&state).await
        }
        (Method::GET, "/api/v1/addons") => routes::list_addons(&state),
        (Method::OPTIONS, _) => preflight_response(),
        _ => error_response(RuinousError::NotFound(format!("no route for {}", path))),
    };

    Ok(to_boxed(response))
}

fn overlay_upgrade(state: &AppState, addon_id: &str, req: Request<Incoming>) -> Response<Full<Bytes>> {
    if !hyper_tungstenite::is_upgrade_request(&req) {
        return error_response(RuinousError::BadRequest(
            "overlay endpoint requires a WebSocket upgrade".to_string(),
        ));
    }

    match state.channels.get(addon_id) {
        Some(channel) => overlay_ws::handle_upgrade(channel, req),
        None => error_response(RuinousError::NotFound(format!(
            "no overlay channel for addon '{}'",
            addon_id
        ))),
    }
}

/// JSON response with the given status
pub(crate) fn json_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

/// `{success:false, reason}` response with the error's status
pub(crate) fn error_response(err: RuinousError) -> Response<Full<Bytes>> {
    let (status, body) = err.into_status_code_and_body();
    json_response(status, body)
}

fn preflight_response() -> Response<Full<Bytes>> {
    let mut response = json_response(StatusCode::NO_CONTENT, String::new());
    let headers = response.headers_mut();
    headers.insert(
        "Access-Control-Allow-Methods",
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        "Access-Control-Allow-Headers",
        HeaderValue::from_static("Content-Type"),
    );
    response
}

fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}
