//! Overlay connections
//!
//! Overlays are browser sources that keep a WebSocket open to the server on
//! their addon's channel. A socket is anonymous until it sends a `helo`
//! carrying `{overlayId, addonId, owner}`; only then is it recorded in the
//! [`ConnectionRegistry`].
//!
//! ## Protocol
//!
//! Messages (client → server):
//! - `helo` - identify this overlay instance
//! - `get_overlay_info` - fetch the installation behind an overlay id
//! - `event` - addon-specific named event, answered with `ack`
//!
//! Messages (server → client):
//! - `overlay_info` - reply to `get_overlay_info`
//! - `ack` - reply to `event`
//! - `push` - server initiated message for this overlay
//! - `error` - the request could not be handled
//!
//! ```json
//! {"type": "helo", "overlayId": "8d4c..", "addonId": "2C0u..", "owner": {"userId": "42", "displayName": "Zeke"}}
//! {"type": "get_overlay_info", "overlayId": "8d4c..", "requestId": 1}
//! {"type": "overlay_info", "requestId": 1, "data": {"success": false, "reason": "no such overlay"}}
//! ```

pub mod channel;
pub mod registry;

pub use channel::{
    AddonThreeEcho, ConnectionHook, EventContext, EventHandler, OverlayChannel, OverlayChannels,
    OverlayDirectory, OverlaySession, SessionState,
};
pub use registry::{ConnectionRegistry, RegisterResult};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;

/// Message received from an overlay
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    Helo(Identification),
    GetOverlayInfo {
        overlay_id: String,
        #[serde(default)]
        request_id: Option<Value>,
    },
    Event {
        event: String,
        #[serde(default)]
        request_id: Option<Value>,
        #[serde(default)]
        data: Value,
    },
}

/// Message sent to an overlay
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    OverlayInfo {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        data: Value,
    },
    Ack {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        data: Value,
    },
    Push {
        event: String,
        data: Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Value>,
        reason: String,
    },
}

/// Snapshot of the user who owns an overlay, as announced by the overlay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OverlayOwner {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of the `helo` handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identification {
    pub overlay_id: String,
    pub addon_id: String,
    pub owner: OverlayOwner,
}

/// Sending side of a live overlay socket
///
/// Messages are queued and written by the socket's own task, so sending
/// never blocks on the network.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    socket_id: String,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ConnectionHandle {
    /// Create a handle with a fresh socket id and the receiver to drain
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(socket_id: impl Into<String>) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                socket_id: socket_id.into(),
                tx,
            },
            rx,
        )
    }

    pub fn socket_id(&self) -> &str {
        &self.socket_id
    }

    /// Queue a message; false once the socket has gone away
    pub fn send(&self, message: ServerMessage) -> bool {
        self.tx.send(message).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A tracked overlay connection
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub socket_id: String,
    pub overlay_id: String,
    pub addon_id: String,
    pub owner: OverlayOwner,
    pub handle: ConnectionHandle,
}

impl ConnectionRecord {
    /// Key of the owner-and-addon index
    pub fn owner_addon_key(&self) -> String {
        owner_addon_key(&self.owner.user_id, &self.addon_id)
    }
}

pub(crate) fn owner_addon_key(user_id: &str, addon_id: &str) -> String {
    format!("{user_id}:{addon_id}")
}
