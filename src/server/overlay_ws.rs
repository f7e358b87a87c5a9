//! Overlay WebSocket transport
//!
//! Bridges an upgraded socket to an [`OverlaySession`]: text frames are
//! decoded into client messages, replies and registry pushes are written
//! back as JSON text frames.

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use crate::overlay::{ConnectionHandle, OverlayChannel, OverlaySession, ServerMessage};
use crate::server::http::error_response;
use crate::types::{Result, RuinousError};

/// WebSocket type after upgrade
type HyperWebSocket =
    hyper_tungstenite::WebSocketStream<hyper_util::rt::TokioIo<hyper::upgrade::Upgraded>>;

/// Complete the upgrade and hand the socket to the channel
pub fn handle_upgrade(channel: Arc<OverlayChannel>, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(pair) => pair,
        Err(e) => {
            error!("WebSocket upgrade failed: {}", e);
            return error_response(RuinousError::WebSocket(e.to_string()));
        }
    };

    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => {
                let (handle, outbound) = ConnectionHandle::new();
                let session = channel.connect(handle);
                if let Err(e) = drive(session, ws, outbound).await {
                    warn!("Overlay socket ended with error: {}", e);
                }
            }
            Err(e) => error!("WebSocket handshake failed: {}", e),
        }
    });

    let (parts, _body) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}

async fn drive(
    mut session: OverlaySession,
    ws: HyperWebSocket,
    outbound: mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<()> {
    let (mut sender, receiver) = ws.split();
    let result = pump(&mut session, &mut sender, receiver, outbound).await;

    info!(socket_id = %session.socket_id(), "Overlay disconnected");
    session.close().await;
    if let Err(e) = sender.close().await {
        debug!("Closing overlay socket: {}", e);
    }
    result
}

/// Forward frames until either side goes away
pub(crate) async fn pump<S, R>(
    session: &mut OverlaySession,
    sender: &mut S,
    mut receiver: R,
    mut outbound: mpsc::UnboundedReceiver<ServerMessage>,
) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
    R: Stream<Item = std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            pushed = outbound.recv() => {
                match pushed {
                    Some(message) => send_json(sender, &message).await?,
                    None => break,
                }
            }

            frame = receiver.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if let Some(reply) = session.handle_text(&text).await {
                            send_json(sender, &reply).await?;
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        write(sender, WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(socket_id = %session.socket_id(), "WebSocket error: {}", e);
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

async fn send_json<S>(sender: &mut S, message: &ServerMessage) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(message)?;
    write(sender, WsMessage::Text(json)).await
}

async fn write<S>(sender: &mut S, frame: WsMessage) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::fmt::Display,
{
    sender
        .send(frame)
        .await
        .map_err(|e| RuinousError::WebSocket(e.to_string()))
}
