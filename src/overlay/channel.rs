//! Per-addon overlay channels and the handshake
//!
//! Every addon with an overlay gets one [`OverlayChannel`]. Each socket on a
//! channel is driven through an [`OverlaySession`]: it starts `Pending`,
//! becomes `Identified` after a `helo`, and is unregistered on close.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{
    ClientMessage, ConnectionHandle, ConnectionRegistry, Identification, RegisterResult,
    ServerMessage,
};
use crate::addons::catalog::ADDON_THREE_ID;
use crate::addons::{AddonCatalog, AddonDefinition};
use crate::types::{Result, RuinousError};

/// Source of the public record behind an overlay id
#[async_trait]
pub trait OverlayDirectory: Send + Sync {
    async fn overlay_info(&self, overlay_id: &str) -> Result<Value>;
}

/// What an event handler knows about the socket it is serving
#[derive(Debug, Clone)]
pub struct EventContext {
    pub socket_id: String,
    pub addon_id: String,
    pub identity: Option<Identification>,
}

/// Handler for one named addon event
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Returns the payload of the `ack` reply
    async fn handle(&self, ctx: &EventContext, data: Value) -> Result<Value>;
}

/// Addon-specific setup run for every new socket on a channel
///
/// Runs after the base handshake handlers are in place.
pub trait ConnectionHook: Send + Sync {
    fn on_connect(&self, session: &mut OverlaySession);
}

/// Built-in hook of the `addon-three` sample: acknowledges `message` events
pub struct AddonThreeEcho;

struct Acknowledge;

#[async_trait]
impl EventHandler for Acknowledge {
    async fn handle(&self, ctx: &EventContext, data: Value) -> Result<Value> {
        debug!(socket_id = %ctx.socket_id, %data, "addon-three message");
        Ok(json!("message acknowledged"))
    }
}

impl ConnectionHook for AddonThreeEcho {
    fn on_connect(&self, session: &mut OverlaySession) {
        session.on("message", Arc::new(Acknowledge));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// Transport is up, no `helo` yet; invisible to the registry
    Pending,
    Identified(Identification),
}

/// Protocol state of a single overlay socket
pub struct OverlaySession {
    channel: Arc<OverlayChannel>,
    handle: ConnectionHandle,
    state: SessionState,
    handlers: HashMap<String, Arc<dyn EventHandler>>,
}

impl OverlaySession {
    pub fn socket_id(&self) -> &str {
        self.handle.socket_id()
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn addon_id(&self) -> &str {
        self.channel.addon_id()
    }

    /// Register a handler for a named event, replacing any previous one
    pub fn on(&mut self, event: &str, handler: Arc<dyn EventHandler>) {
        self.handlers.insert(event.to_string(), handler);
    }

    /// Handle one raw text frame, returning the reply to send if any
    pub async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                debug!(socket_id = %self.socket_id(), "Unparseable overlay message: {}", e);
                Some(ServerMessage::Error {
                    request_id: None,
                    reason: format!("invalid message: {e}"),
                })
            }
        }
    }

    pub async fn handle(&mut self, msg: ClientMessage) -> Option<ServerMessage> {
        match msg {
            ClientMessage::Helo(ident) => self.identify(ident).await,
            ClientMessage::GetOverlayInfo {
                overlay_id,
                request_id,
            } => Some(ServerMessage::OverlayInfo {
                request_id,
                data: self.channel.overlay_info(&overlay_id).await,
            }),
            ClientMessage::Event {
                event,
                request_id,
                data,
            } => Some(self.dispatch(event, request_id, data).await),
        }
    }

    async fn identify(&mut self, ident: Identification) -> Option<ServerMessage> {
        if ident.addon_id != self.channel.addon_id() {
            warn!(
                socket_id = %self.socket_id(),
                channel = %self.channel.addon_id(),
                claimed = %ident.addon_id,
                "Overlay identified for a different addon"
            );
            return Some(ServerMessage::Error {
                request_id: None,
                reason: format!(
                    "this channel serves addon '{}', not '{}'",
                    self.channel.addon_id(),
                    ident.addon_id
                ),
            });
        }

        let result = self
            .channel
            .registry
            .register(self.handle.clone(), ident.clone())
            .await;

        if result == RegisterResult::Registered {
            info!(
                socket_id = %self.socket_id(),
                overlay_id = %ident.overlay_id,
                owner = %ident.owner.user_id,
                "Overlay identified"
            );
            self.state = SessionState::Identified(ident);
        }
        None
    }

    async fn dispatch(&self, event: String, request_id: Option<Value>, data: Value) -> ServerMessage {
        let Some(handler) = self.handlers.get(&event) else {
            return ServerMessage::Error {
                request_id,
                reason: format!("unknown event '{event}'"),
            };
        };

        let ctx = EventContext {
            socket_id: self.socket_id().to_string(),
            addon_id: self.addon_id().to_string(),
            identity: match &self.state {
                SessionState::Identified(ident) => Some(ident.clone()),
                SessionState::Pending => None,
            },
        };

        match handler.handle(&ctx, data).await {
            Ok(data) => ServerMessage::Ack { request_id, data },
            Err(e) => ServerMessage::Error {
                request_id,
                reason: e.to_string(),
            },
        }
    }

    /// Tear down after the transport closed
    pub async fn close(self) {
        match self.state {
            SessionState::Pending => {
                debug!(socket_id = %self.handle.socket_id(), "Unidentified overlay disconnected");
            }
            SessionState::Identified(_) => {
                self.channel.registry.unregister(self.handle.socket_id()).await;
            }
        }
    }
}

/// The communication channel of one overlay addon
pub struct OverlayChannel {
    addon: Arc<AddonDefinition>,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn OverlayDirectory>,
    hook: Option<Arc<dyn ConnectionHook>>,
    lookup_timeout: Duration,
}

impl OverlayChannel {
    pub fn addon_id(&self) -> &str {
        &self.addon.addon_id
    }

    pub fn addon(&self) -> &Arc<AddonDefinition> {
        &self.addon
    }

    /// Start a session for a freshly connected socket
    pub fn connect(self: &Arc<Self>, handle: ConnectionHandle) -> OverlaySession {
        info!(
            socket_id = %handle.socket_id(),
            addon = %self.addon.slug,
            "Overlay connected, waiting for identification"
        );

        let mut session = OverlaySession {
            channel: Arc::clone(self),
            handle,
            state: SessionState::Pending,
            handlers: HashMap::new(),
        };

        if let Some(hook) = &self.hook {
            hook.on_connect(&mut session);
        }
        session
    }

    /// Public record for an overlay id, or a `success: false` body
    pub async fn overlay_info(&self, overlay_id: &str) -> Value {
        let lookup = tokio::time::timeout(
            self.lookup_timeout,
            self.directory.overlay_info(overlay_id),
        )
        .await
        .map_err(RuinousError::from)
        .and_then(|r| r);

        match lookup {
            Ok(record) => record,
            Err(e) => {
                debug!(overlay_id, "Overlay info lookup failed: {}", e);
                e.to_failure_json()
            }
        }
    }
}

/// Owner of every overlay channel in the process
pub struct OverlayChannels {
    catalog: Arc<AddonCatalog>,
    registry: Arc<ConnectionRegistry>,
    directory: Arc<dyn OverlayDirectory>,
    lookup_timeout: Duration,
    hooks: DashMap<String, Arc<dyn ConnectionHook>>,
    channels: DashMap<String, Arc<OverlayChannel>>,
}

impl OverlayChannels {
    pub fn new(
        catalog: Arc<AddonCatalog>,
        registry: Arc<ConnectionRegistry>,
        directory: Arc<dyn OverlayDirectory>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            registry,
            directory,
            lookup_timeout,
            hooks: DashMap::new(),
            channels: DashMap::new(),
        }
    }

    /// Install the hooks of the addons that ship with the server
    pub fn with_builtin_hooks(self) -> Self {
        self.set_hook(ADDON_THREE_ID, Arc::new(AddonThreeEcho));
        self
    }

    /// Attach a hook to an addon; applies to channels opened afterwards
    pub fn set_hook(&self, addon_id: &str, hook: Arc<dyn ConnectionHook>) {
        self.hooks.insert(addon_id.to_string(), hook);
    }

    /// Open (or return the already open) channel of an overlay addon
    pub fn open_channel(&self, addon_id: &str) -> Result<Arc<OverlayChannel>> {
        if let Some(channel) = self.channels.get(addon_id) {
            return Ok(Arc::clone(channel.value()));
        }

        let addon = self.catalog.require(addon_id)?;
        if !addon.requires_overlay {
            return Err(RuinousError::BadRequest(format!(
                "addon '{}' has no overlay",
                addon.slug
            )));
        }

        let channel = self
            .channels
            .entry(addon_id.to_string())
            .or_insert_with(|| {
                debug!(addon = %addon.slug, "Opening overlay channel /{}", addon.addon_id);
                Arc::new(OverlayChannel {
                    addon: Arc::clone(addon),
                    registry: Arc::clone(&self.registry),
                    directory: Arc::clone(&self.directory),
                    hook: self.hooks.get(addon_id).map(|h| Arc::clone(h.value())),
                    lookup_timeout: self.lookup_timeout,
                })
            });
        Ok(Arc::clone(channel.value()))
    }

    /// Open a channel for every overlay addon in the catalog
    pub fn open_all(&self) -> Result<usize> {
        let ids: Vec<String> = self
            .catalog
            .overlay_addons()
            .map(|a| a.addon_id.clone())
            .collect();
        for id in &ids {
            self.open_channel(id)?;
        }
        info!("Opened {} overlay channel(s)", ids.len());
        Ok(ids.len())
    }

    pub fn get(&self, addon_id: &str) -> Option<Arc<OverlayChannel>> {
        self.channels.get(addon_id).map(|c| Arc::clone(c.value()))
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }
}
