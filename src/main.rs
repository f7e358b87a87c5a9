//! Ruinous server entry point

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

use ruinous::{
    addons::AddonCatalog,
    chat::{ChatPresence, PresenceConfig, PresenceDeps, TwitchIrcConnector, TwitchTokenRefresher},
    config::Args,
    crypto::TokenCipher,
    db::{MemoryStore, MongoClient, MongoStore, Store},
    logging,
    overlay::{ConnectionRegistry, OverlayChannels},
    server::{self, AppState},
    services::AddonService,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    logging::init(&args.log_level, args.log_json);

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  Ruinous - channel addon runtime");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Root URL: {}", args.effective_root_url());
    info!("Mode: {}", if args.dev_mode { "DEVELOPMENT" } else { "PRODUCTION" });
    info!("MongoDB: {} (db {})", args.mongodb_uri, args.mongodb_db);
    info!("Chat: {}:{} as {}", args.irc_host, args.irc_port, args.twitch_bot_login);
    info!("======================================");

    let catalog = match &args.addons_file {
        Some(path) => AddonCatalog::from_file(path)?,
        None => AddonCatalog::builtin()?,
    };
    let catalog = Arc::new(catalog);
    info!("Loaded {} addon(s)", catalog.len());

    let store: Arc<dyn Store> = match MongoClient::new(&args.mongodb_uri, &args.mongodb_db).await {
        Ok(client) => {
            info!("MongoDB connected successfully");
            Arc::new(MongoStore::open(&client).await?)
        }
        Err(e) => {
            if args.dev_mode {
                warn!("MongoDB connection failed (dev mode, using in-memory store): {}", e);
                Arc::new(MemoryStore::new())
            } else {
                error!("MongoDB connection failed: {}", e);
                std::process::exit(1);
            }
        }
    };

    let cipher = Arc::new(TokenCipher::new(&args.crypt_secret())?);

    let connector = Arc::new(TwitchIrcConnector::new(
        args.irc_host.clone(),
        args.irc_port,
        args.twitch_bot_login.clone(),
        args.request_timeout(),
    ));
    let refresher = Arc::new(TwitchTokenRefresher::new(
        args.twitch_token_url.clone(),
        args.twitch_client_id.clone(),
        args.twitch_client_secret.clone(),
        args.request_timeout(),
    )?);

    let presence_config = PresenceConfig {
        bot_user_id: args.twitch_bot_user_id.clone(),
        sentinel: args.chat_sentinel.clone(),
        log_chat: args.log_chat,
        refresh_margin: std::time::Duration::from_secs(args.token_refresh_margin_secs),
        retry_backoff: std::time::Duration::from_secs(args.chat_retry_secs),
        ..PresenceConfig::default()
    };
    let (presence, presence_task) = ChatPresence::start(
        presence_config,
        PresenceDeps {
            store: Arc::clone(&store),
            catalog: Arc::clone(&catalog),
            cipher,
            connector,
            refresher,
        },
    )
    .await?;
    info!("Chat presence started ({:?})", presence.state());

    let addons = Arc::new(AddonService::new(
        Arc::clone(&catalog),
        Arc::clone(&store),
        presence.clone(),
        &args.effective_root_url(),
    ));

    let channels = OverlayChannels::new(
        Arc::clone(&catalog),
        Arc::new(ConnectionRegistry::new()),
        addons.clone(),
        args.request_timeout(),
    )
    .with_builtin_hooks();
    channels.open_all()?;

    let state = Arc::new(AppState {
        args,
        catalog,
        addons,
        channels: Arc::new(channels),
        presence: presence.clone(),
    });

    tokio::select! {
        result = server::run(state) => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
        }
    }

    if let Err(e) = presence.stop().await {
        warn!("Chat presence did not stop cleanly: {}", e);
    }
    if let Err(e) = presence_task.await {
        warn!("Chat presence task failed: {}", e);
    }

    info!("Ruinous stopped");
    Ok(())
}
