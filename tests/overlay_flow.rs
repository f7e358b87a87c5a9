//! End-to-end overlay flow over a real socket
//!
//! Starts the HTTP server on an ephemeral port backed by the in-memory store,
//! installs an overlay addon, then drives the overlay protocol through a
//! WebSocket client.

use async_trait::async_trait;
use clap::Parser;
use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use ruinous::addons::catalog::{ADDON_THREE_ID, ADDON_TWO_ID};
use ruinous::addons::AddonCatalog;
use ruinous::chat::{
    BotCredentials, ChatConnector, ChatLink, ChatPresence, PresenceConfig, PresenceDeps,
    TokenRefresher,
};
use ruinous::crypto::TokenCipher;
use ruinous::db::{MemoryStore, Store, User};
use ruinous::overlay::{ConnectionRegistry, OverlayChannels};
use ruinous::server::{http::serve, AppState};
use ruinous::services::AddonService;
use ruinous::{Args, Result, RuinousError};

struct Offline;

#[async_trait]
impl ChatConnector for Offline {
    async fn connect(&self, _credentials: &BotCredentials) -> Result<ChatLink> {
        Err(RuinousError::Chat("offline".into()))
    }
}

#[async_trait]
impl TokenRefresher for Offline {
    async fn refresh(&self, _refresh_token: &str) -> Result<BotCredentials> {
        Err(RuinousError::Auth("offline".into()))
    }
}

struct Harness {
    addr: std::net::SocketAddr,
    addons: Arc<AddonService>,
    registry: Arc<ConnectionRegistry>,
}

async fn start() -> Harness {
    let store = Arc::new(MemoryStore::new());
    tokio_test::assert_ok!(
        store
            .upsert_user(User {
                user_id: "u1".into(),
                username: "zeke".into(),
                display_name: "Zeke".into(),
                profile_picture_url: String::new(),
                is_bot: true,
            })
            .await
    );

    let catalog = Arc::new(AddonCatalog::builtin().unwrap());
    let (presence, _task) = ChatPresence::start(
        PresenceConfig {
            bot_user_id: "bot".into(),
            ..PresenceConfig::default()
        },
        PresenceDeps {
            store: store.clone(),
            catalog: Arc::clone(&catalog),
            cipher: Arc::new(TokenCipher::new(&[9u8; 32]).unwrap()),
            connector: Arc::new(Offline),
            refresher: Arc::new(Offline),
        },
    )
    .await
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let root = format!("http://{}", addr);

    let addons = Arc::new(AddonService::new(
        Arc::clone(&catalog),
        store.clone(),
        presence.clone(),
        &root,
    ));
    let registry = Arc::new(ConnectionRegistry::new());
    let channels = OverlayChannels::new(
        Arc::clone(&catalog),
        Arc::clone(&registry),
        addons.clone(),
        Duration::from_secs(1),
    )
    .with_builtin_hooks();
    assert_eq!(channels.open_all().unwrap(), 2);

    let args = Args::try_parse_from(["ruinous", "--dev-mode", "--root-url", root.as_str()]).unwrap();
    let state = Arc::new(AppState {
        args,
        catalog,
        addons: addons.clone(),
        channels: Arc::new(channels),
        presence,
    });
    tokio::spawn(serve(listener, state));

    Harness {
        addr,
        addons,
        registry,
    }
}

async fn next_json<S>(ws: &mut S) -> Value
where
    S: Stream<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        if let Message::Text(text) = frame {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn wait_for_connections(registry: &ConnectionRegistry, expected: usize) {
    for _ in 0..100 {
        if registry.connection_count().await == expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("expected {} overlay connection(s)", expected);
}

#[tokio::test]
async fn test_overlay_handshake_and_info_lookup() {
    let harness = start().await;
    let view = harness.addons.install("u1", ADDON_TWO_ID).await.unwrap();

    let url = format!("ws://{}/overlay/ws/{}", harness.addr, ADDON_TWO_ID);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    // Pending connections stay out of the registry
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.registry.connection_count().await, 0);

    ws.send(Message::Text(
        json!({
            "type": "helo",
            "overlayId": view.overlay_id,
            "addonId": ADDON_TWO_ID,
            "owner": {"userId": "u1", "displayName": "Zeke"}
        })
        .to_string(),
    ))
    .await
    .unwrap();
    wait_for_connections(&harness.registry, 1).await;

    let found = harness
        .registry
        .lookup_by_owner_and_addon("u1", ADDON_TWO_ID)
        .await;
    assert_eq!(found.len(), 1);

    ws.send(Message::Text(
        json!({"type": "get_overlay_info", "overlayId": view.overlay_id, "requestId": "r1"})
            .to_string(),
    ))
    .await
    .unwrap();

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "overlay_info");
    assert_eq!(reply["requestId"], "r1");
    let data = &reply["data"];
    assert_eq!(data["addon"]["installed"], true);
    assert_eq!(data["addon"]["overlayUrl"], json!(view.overlay_url));
    assert_eq!(data["config"]["nickname"], "Curmudgeon");
    assert!(data["owner"].get("isBot").is_none());

    ws.close(None).await.unwrap();
    wait_for_connections(&harness.registry, 0).await;
}

#[tokio::test]
async fn test_unknown_overlay_is_reported_not_thrown() {
    let harness = start().await;

    let url = format!("ws://{}/overlay/ws/{}", harness.addr, ADDON_TWO_ID);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(Message::Text(
        json!({"type": "get_overlay_info", "overlayId": "nope", "requestId": 3}).to_string(),
    ))
    .await
    .unwrap();

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["data"]["success"], false);
    assert!(reply["data"]["reason"].as_str().unwrap().contains("nope"));
    assert_eq!(harness.registry.connection_count().await, 0);
}

#[tokio::test]
async fn test_addon_three_echo_event() {
    let harness = start().await;

    let url = format!("ws://{}/overlay/ws/{}", harness.addr, ADDON_THREE_ID);
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();

    ws.send(Message::Text(
        json!({"type": "event", "event": "message", "requestId": 1, "data": "hi"}).to_string(),
    ))
    .await
    .unwrap();

    let reply = next_json(&mut ws).await;
    assert_eq!(reply["type"], "ack");
    assert_eq!(reply["data"], "message acknowledged");
}

#[tokio::test]
async fn test_http_routes() {
    let harness = start().await;
    let view = harness.addons.install("u1", ADDON_TWO_ID).await.unwrap();
    let client = reqwest::Client::new();
    let base = format!("http://{}", harness.addr);

    let health: Value = client
        .get(format!("{}/health", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["healthy"], true);
    assert_eq!(health["chat"], "uninitialized");
    assert_eq!(health["overlayChannels"], 2);

    let addons: Value = client
        .get(format!("{}/api/v1/addons", base))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(addons["addons"].as_array().unwrap().len(), 3);

    let record = client
        .get(format!("{}/api/v1/overlay/{}", base, view.overlay_id))
        .send()
        .await
        .unwrap();
    assert_eq!(record.status(), 200);

    let missing = client
        .get(format!("{}/api/v1/overlay/missing", base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["success"], false);

    let no_channel = client
        .get(format!("{}/overlay/ws/unknown-addon", base))
        .send()
        .await
        .unwrap();
    assert_eq!(no_channel.status(), 400);
}
