//! Chat presence controller
//!
//! One actor task owns the bot's chat session, the intended channel
//! membership and the credential lifecycle. Everything that changes
//! membership arrives on its command queue, so no two membership changes
//! are ever in flight at once. Callers hold a cheap [`ChatPresence`] handle.
//!
//! States: `Uninitialized → Connecting → Connected → Disconnected`. A lost
//! session is retried after a back-off, but only with freshly refreshed
//! credentials; if the refresh fails the controller stays `Disconnected`
//! until it is handed new credentials or told to reconnect.

use std::collections::BTreeSet;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{
    normalize_channel, BotCredentials, ChatConnector, ChatEvent, ChatLink, ChatSession,
    TokenRefresher,
};
use crate::addons::AddonCatalog;
use crate::crypto::TokenCipher;
use crate::db::Store;
use crate::types::{Result, RuinousError};

/// Reply to the sentinel phrase
pub const SENTINEL_REPLY: &str = "I'm the ruinous addon bot and I can confirm your chat is ruinous";

/// Lifecycle of the shared chat session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceState {
    /// No credentials yet
    Uninitialized,
    Connecting,
    Connected,
    Disconnected,
}

/// Tunables of the controller
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// User id of the configured bot account
    pub bot_user_id: String,
    /// Phrase the broadcaster can type to check the bot is there
    pub sentinel: String,
    /// Log every chat message seen
    pub log_chat: bool,
    /// Refresh this long before the access token expires
    pub refresh_margin: Duration,
    /// Wait before retrying a lost session
    pub retry_backoff: Duration,
    /// Upper bound on a caller waiting for the controller
    pub command_timeout: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            bot_user_id: String::new(),
            sentinel: "$ruinous".to_string(),
            log_chat: false,
            refresh_margin: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(10),
            command_timeout: Duration::from_secs(30),
        }
    }
}

/// Collaborators the controller needs
pub struct PresenceDeps {
    pub store: Arc<dyn Store>,
    pub catalog: Arc<AddonCatalog>,
    pub cipher: Arc<TokenCipher>,
    pub connector: Arc<dyn ChatConnector>,
    pub refresher: Arc<dyn TokenRefresher>,
}

enum Command {
    Join {
        username: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    Leave {
        username: String,
        reply: oneshot::Sender<Result<bool>>,
    },
    SetCredentials {
        credentials: BotCredentials,
        reply: oneshot::Sender<Result<PresenceState>>,
    },
    Reconnect {
        reply: oneshot::Sender<Result<PresenceState>>,
    },
    Membership {
        reply: oneshot::Sender<Vec<String>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to the chat presence controller
#[derive(Clone)]
pub struct ChatPresence {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<PresenceState>,
    timeout: Duration,
}

impl ChatPresence {
    /// Reconcile stored bot state, then start the controller task
    ///
    /// Stored tokens of any account other than the configured bot are
    /// deleted and the bot flag is cleared on every other user before the
    /// first connection attempt.
    pub async fn start(config: PresenceConfig, deps: PresenceDeps) -> Result<(Self, JoinHandle<()>)> {
        let deleted = deps.store.delete_bot_tokens_except(&config.bot_user_id).await?;
        let cleared = deps.store.clear_bot_flag_except(&config.bot_user_id).await?;
        if deleted > 0 || cleared > 0 {
            info!(
                tokens = deleted,
                users = cleared,
                "Pruned bot state left by a previous bot account"
            );
        }

        let credentials = load_credentials(&config, &deps).await;
        info!(
            "Chat logging is {}",
            if config.log_chat { "enabled" } else { "disabled" }
        );

        let (commands, rx) = mpsc::channel(64);
        let (state_tx, state) = watch::channel(PresenceState::Uninitialized);
        let timeout = config.command_timeout;

        let actor = Controller {
            config,
            deps,
            state: state_tx,
            membership: BTreeSet::new(),
            session: None,
            events: None,
            credentials,
            refresh_at: None,
            retry_at: None,
        };
        let task = tokio::spawn(actor.run(rx));

        Ok((
            Self {
                commands,
                state,
                timeout,
            },
            task,
        ))
    }

    pub fn state(&self) -> PresenceState {
        *self.state.borrow()
    }

    /// Wait until the controller reaches `target`, or the timeout passes
    pub async fn wait_for(&self, target: PresenceState, timeout: Duration) -> bool {
        let mut state = self.state.clone();
        tokio::time::timeout(timeout, state.wait_for(|s| *s == target))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }

    /// Put the bot in a channel; true if it was not a member yet
    pub async fn join(&self, username: &str) -> Result<bool> {
        let username = username.to_string();
        self.request(|reply| Command::Join { username, reply }).await?
    }

    /// Leave a channel unless its owner still has a chat addon installed
    ///
    /// Returns true if the channel was dropped from the membership.
    pub async fn leave(&self, username: &str) -> Result<bool> {
        let username = username.to_string();
        self.request(|reply| Command::Leave { username, reply }).await?
    }

    pub async fn notify_installed(&self, user_id: &str, username: &str, requires_chat: bool) -> Result<()> {
        if !requires_chat {
            return Ok(());
        }
        debug!(user_id, username, "Chat addon installed");
        self.join(username).await.map(|_| ())
    }

    pub async fn notify_uninstalled(&self, user_id: &str, username: &str) -> Result<()> {
        debug!(user_id, username, "Addon uninstalled");
        self.leave(username).await.map(|_| ())
    }

    /// Hand the controller new bot credentials; they are persisted first
    pub async fn set_credentials(&self, credentials: BotCredentials) -> Result<PresenceState> {
        self.request(|reply| Command::SetCredentials { credentials, reply })
            .await?
    }

    /// Drop the current session, if any, and connect again
    pub async fn reconnect(&self) -> Result<PresenceState> {
        self.request(|reply| Command::Reconnect { reply }).await?
    }

    /// Channels the bot is meant to be in, sorted
    pub async fn membership(&self) -> Result<Vec<String>> {
        self.request(|reply| Command::Membership { reply }).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(|reply| Command::Stop { reply }).await
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RuinousError::Chat("chat controller is not running".into()))?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(RuinousError::Chat("chat controller dropped the request".into())),
            Err(_) => Err(RuinousError::Timeout("chat controller did not answer".into())),
        }
    }
}

async fn load_credentials(config: &PresenceConfig, deps: &PresenceDeps) -> Option<BotCredentials> {
    let stored = match deps.store.find_bot_token(&config.bot_user_id).await {
        Ok(Some(stored)) => stored,
        Ok(None) => {
            warn!("No chat credentials available for the bot; cannot start chat");
            return None;
        }
        Err(e) => {
            error!("Failed to load bot credentials: {}", e);
            return None;
        }
    };

    match BotCredentials::open(&stored, &deps.cipher) {
        Ok(credentials) => Some(credentials),
        Err(e) => {
            error!("Stored bot credentials cannot be decrypted: {}", e);
            None
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<ChatEvent>>) -> ChatEvent {
    match events {
        Some(rx) => rx.recv().await.unwrap_or(ChatEvent::Closed(None)),
        None => pending().await,
    }
}

struct Controller {
    config: PresenceConfig,
    deps: PresenceDeps,
    state: watch::Sender<PresenceState>,
    /// Channels the bot should be in, whether or not a session is up
    membership: BTreeSet<String>,
    session: Option<Box<dyn ChatSession>>,
    events: Option<mpsc::UnboundedReceiver<ChatEvent>>,
    credentials: Option<BotCredentials>,
    refresh_at: Option<Instant>,
    retry_at: Option<Instant>,
}

impl Controller {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        if self.credentials.is_some() {
            self.connect().await;
        }

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                event = next_event(&mut self.events) => self.handle_event(event).await,
                _ = sleep_until(self.refresh_at) => {
                    self.refresh_at = None;
                    self.refresh().await;
                }
                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    self.retry().await;
                }
            }
        }

        self.drop_session().await;
        info!("Chat presence controller stopped");
    }

    fn set_state(&self, state: PresenceState) {
        if *self.state.borrow() != state {
            debug!(?state, "Chat presence state changed");
        }
        self.state.send_replace(state);
    }

    fn current_state(&self) -> PresenceState {
        *self.state.borrow()
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Join { username, reply } => {
                let _ = reply.send(self.join(&username).await);
            }
            Command::Leave { username, reply } => {
                let _ = reply.send(self.leave(&username).await);
            }
            Command::SetCredentials { credentials, reply } => {
                let result = self.adopt_credentials(credentials).await;
                let result = match result {
                    Ok(()) => {
                        self.drop_session().await;
                        self.connect().await;
                        Ok(self.current_state())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            Command::Reconnect { reply } => {
                let result = if self.credentials.is_some() {
                    self.drop_session().await;
                    self.connect().await;
                    Ok(self.current_state())
                } else {
                    Err(RuinousError::Auth("no bot credentials available".into()))
                };
                let _ = reply.send(result);
            }
            Command::Membership { reply } => {
                let _ = reply.send(self.membership.iter().cloned().collect());
            }
            Command::Stop { reply } => {
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn join(&mut self, username: &str) -> Result<bool> {
        let channel = normalize_channel(username);
        if !self.membership.insert(channel.clone()) {
            return Ok(false);
        }

        match self.session.as_mut() {
            Some(session) => {
                debug!(%channel, "Joining channel");
                if let Err(e) = session.join(&channel).await {
                    warn!(%channel, "Join failed, will retry on reconnect: {}", e);
                    self.lose_session(Some(e.to_string())).await;
                }
            }
            None => debug!(%channel, "Not connected; join deferred"),
        }
        Ok(true)
    }

    async fn leave(&mut self, username: &str) -> Result<bool> {
        let channel = normalize_channel(username);
        if self.chat_channels().await?.contains(&channel) {
            debug!(%channel, "Channel still has a chat addon; staying");
            return Ok(false);
        }
        if !self.membership.remove(&channel) {
            return Ok(false);
        }

        if let Some(session) = self.session.as_mut() {
            debug!(%channel, "Leaving channel");
            if let Err(e) = session.part(&channel).await {
                warn!(%channel, "Part failed: {}", e);
                self.lose_session(Some(e.to_string())).await;
            }
        }
        Ok(true)
    }

    /// Channels of every user with at least one chat addon installed
    async fn chat_channels(&self) -> Result<BTreeSet<String>> {
        let addon_ids = self.deps.catalog.chat_addon_ids();
        let users = self.deps.store.users_with_addons(&addon_ids).await?;
        Ok(users
            .iter()
            .map(|u| normalize_channel(&u.username))
            .collect())
    }

    async fn connect(&mut self) {
        let Some(credentials) = self.credentials.clone() else {
            self.set_state(PresenceState::Uninitialized);
            return;
        };
        self.set_state(PresenceState::Connecting);

        match self.chat_channels().await {
            Ok(channels) => self.membership.extend(channels),
            Err(e) => warn!("Could not load chat channels, using known membership: {}", e),
        }
        if self.membership.is_empty() {
            info!("No users currently have chat addons installed; not joining any channel");
        } else {
            info!(channels = ?self.membership, "Joining chat channels");
        }

        let ChatLink {
            mut session,
            events,
        } = match self.deps.connector.connect(&credentials).await {
            Ok(link) => link,
            Err(RuinousError::Auth(reason)) => {
                error!("Chat authentication failed: {}", reason);
                self.set_disconnected(true);
                return;
            }
            Err(e) => {
                error!("Chat connection failed: {}", e);
                self.set_disconnected(true);
                return;
            }
        };

        let channels: Vec<String> = self.membership.iter().cloned().collect();
        for channel in &channels {
            if let Err(e) = session.join(channel).await {
                error!(%channel, "Failed to join channel: {}", e);
                session.quit().await;
                self.set_disconnected(true);
                return;
            }
        }

        info!(nick = %session.nick(), "Chat connection established");
        self.session = Some(session);
        self.events = Some(events);
        self.retry_at = None;
        self.schedule_refresh(&credentials, Duration::ZERO);
        self.set_state(PresenceState::Connected);
    }

    /// Arm the refresh timer, never sooner than `floor` from now
    fn schedule_refresh(&mut self, credentials: &BotCredentials, floor: Duration) {
        self.refresh_at = credentials
            .refresh_in(self.config.refresh_margin, Utc::now())
            .map(|wait| Instant::now() + wait.max(floor));
        if let Some(at) = self.refresh_at {
            debug!(in_secs = at.saturating_duration_since(Instant::now()).as_secs(), "Token refresh scheduled");
        }
    }

    fn set_disconnected(&mut self, retry: bool) {
        self.refresh_at = None;
        self.retry_at = if retry {
            Some(Instant::now() + self.config.retry_backoff)
        } else {
            None
        };
        self.set_state(PresenceState::Disconnected);
    }

    async fn drop_session(&mut self) {
        self.events = None;
        if let Some(mut session) = self.session.take() {
            session.quit().await;
        }
    }

    async fn lose_session(&mut self, reason: Option<String>) {
        info!(?reason, "Chat has been disconnected");
        self.drop_session().await;
        self.set_disconnected(true);
    }

    async fn handle_event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Message {
                channel,
                user,
                text,
                is_broadcaster,
            } => {
                if self.config.log_chat {
                    info!("#{}:<{}> {}", channel, user, text);
                }
                if is_broadcaster && text.contains(&self.config.sentinel) {
                    if let Some(session) = self.session.as_mut() {
                        if let Err(e) = session.say(&channel, SENTINEL_REPLY).await {
                            error!(%channel, "Message send failed: {}", e);
                        }
                    }
                }
            }
            ChatEvent::Joined { channel, user } => {
                if self.session.as_ref().is_some_and(|s| s.nick() == user) {
                    info!("{} joined channel {}", user, channel);
                }
            }
            ChatEvent::Parted { channel, user } => {
                if self.session.as_ref().is_some_and(|s| s.nick() == user) {
                    info!("{} left channel {}", user, channel);
                }
            }
            ChatEvent::AuthFailed(reason) => {
                error!("Chat authentication failed: {}", reason);
                self.lose_session(Some(reason)).await;
            }
            ChatEvent::Closed(reason) => self.lose_session(reason).await,
        }
    }

    /// Encrypt and store credentials, then make them current
    ///
    /// Nothing changes in memory unless the store accepted them.
    async fn adopt_credentials(&mut self, credentials: BotCredentials) -> Result<()> {
        let sealed = credentials.seal(&self.config.bot_user_id, &self.deps.cipher)?;
        self.deps.store.save_bot_token(sealed).await?;
        self.credentials = Some(credentials);
        Ok(())
    }

    async fn refresh_credentials(&mut self) -> Result<BotCredentials> {
        let refresh_token = self
            .credentials
            .as_ref()
            .map(|c| c.refresh_token.clone())
            .ok_or_else(|| RuinousError::Auth("no bot credentials to refresh".into()))?;

        let fresh = self.deps.refresher.refresh(&refresh_token).await?;
        Ok(fresh)
    }

    /// Scheduled refresh while connected
    async fn refresh(&mut self) {
        let fresh = match self.refresh_credentials().await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!("Bot token refresh failed, trying again later: {}", e);
                self.refresh_at = Some(Instant::now() + self.config.retry_backoff);
                return;
            }
        };

        if let Err(e) = self.adopt_credentials(fresh.clone()).await {
            error!("Refreshed bot token could not be persisted; ending chat session: {}", e);
            self.drop_session().await;
            self.set_disconnected(false);
            return;
        }

        debug!("Bot token refreshed");
        self.schedule_refresh(&fresh, self.config.retry_backoff);
    }

    /// Back-off expired after losing the session
    async fn retry(&mut self) {
        if self.current_state() != PresenceState::Disconnected {
            return;
        }

        let fresh = match self.refresh_credentials().await {
            Ok(fresh) => fresh,
            Err(e) => {
                error!("Cannot reconnect to chat without fresh credentials: {}", e);
                return;
            }
        };
        if let Err(e) = self.adopt_credentials(fresh).await {
            error!("Refreshed bot token could not be persisted: {}", e);
            return;
        }

        info!("Reconnecting to chat with refreshed credentials");
        self.connect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addons::catalog::{ADDON_ONE_ID, ADDON_THREE_ID, ADDON_TWO_ID};
    use crate::db::{Installation, MemoryStore, StoredBotToken, User};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const SECRET: &[u8] = b"0123456789abcdef0123456789abcdef";

    #[derive(Default)]
    struct Wire {
        lines: Vec<String>,
        events: Option<mpsc::UnboundedSender<ChatEvent>>,
        connects: usize,
    }

    #[derive(Default)]
    struct FakeConnector {
        wire: Arc<Mutex<Wire>>,
        reject: bool,
    }

    struct FakeSession {
        wire: Arc<Mutex<Wire>>,
    }

    #[async_trait]
    impl ChatSession for FakeSession {
        fn nick(&self) -> &str {
            "ruinousbot"
        }

        async fn join(&mut self, channel: &str) -> Result<()> {
            self.wire.lock().unwrap().lines.push(format!("JOIN #{channel}"));
            Ok(())
        }

        async fn part(&mut self, channel: &str) -> Result<()> {
            self.wire.lock().unwrap().lines.push(format!("PART #{channel}"));
            Ok(())
        }

        async fn say(&mut self, channel: &str, text: &str) -> Result<()> {
            self.wire
                .lock()
                .unwrap()
                .lines
                .push(format!("PRIVMSG #{channel} :{text}"));
            Ok(())
        }

        async fn quit(&mut self) {
            self.wire.lock().unwrap().lines.push("QUIT".into());
        }
    }

    #[async_trait]
    impl ChatConnector for FakeConnector {
        async fn connect(&self, _credentials: &BotCredentials) -> Result<ChatLink> {
            let mut wire = self.wire.lock().unwrap();
            wire.connects += 1;
            if self.reject {
                return Err(RuinousError::Auth("Login authentication failed".into()));
            }
            let (tx, events) = mpsc::unbounded_channel();
            wire.events = Some(tx);
            Ok(ChatLink {
                session: Box::new(FakeSession {
                    wire: Arc::clone(&self.wire),
                }),
                events,
            })
        }
    }

    struct FakeRefresher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, _refresh_token: &str) -> Result<BotCredentials> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(RuinousError::Auth("invalid refresh token".into()));
            }
            Ok(credentials(&format!("access-{n}"), Some(3600)))
        }
    }

    fn credentials(access: &str, expires_in: Option<i64>) -> BotCredentials {
        BotCredentials {
            access_token: access.to_string(),
            refresh_token: "refresh".into(),
            scopes: vec!["chat:read".into()],
            obtained_at: Utc::now(),
            expires_in,
        }
    }

    /// Token issued long enough ago that its refresh is already due
    fn stale(access: &str, expires_in: i64) -> BotCredentials {
        BotCredentials {
            obtained_at: Utc::now() - chrono::Duration::seconds(expires_in * 2),
            ..credentials(access, Some(expires_in))
        }
    }

    /// Memory store that refuses to save bot tokens
    struct ReadOnlyTokens(Arc<MemoryStore>);

    #[async_trait]
    impl Store for ReadOnlyTokens {
        async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
            self.0.find_user(user_id).await
        }

        async fn upsert_user(&self, user: User) -> Result<()> {
            self.0.upsert_user(user).await
        }

        async fn find_installation(
            &self,
            user_id: &str,
            addon_id: &str,
        ) -> Result<Option<Installation>> {
            self.0.find_installation(user_id, addon_id).await
        }

        async fn find_installations_by_overlay(&self, overlay_id: &str) -> Result<Vec<Installation>> {
            self.0.find_installations_by_overlay(overlay_id).await
        }

        async fn list_installations(&self, user_id: &str) -> Result<Vec<Installation>> {
            self.0.list_installations(user_id).await
        }

        async fn create_installation(&self, installation: Installation) -> Result<()> {
            self.0.create_installation(installation).await
        }

        async fn update_installation_config(
            &self,
            user_id: &str,
            addon_id: &str,
            config: serde_json::Value,
        ) -> Result<()> {
            self.0.update_installation_config(user_id, addon_id, config).await
        }

        async fn delete_installation(&self, user_id: &str, addon_id: &str) -> Result<Installation> {
            self.0.delete_installation(user_id, addon_id).await
        }

        async fn users_with_addons(&self, addon_ids: &[String]) -> Result<Vec<User>> {
            self.0.users_with_addons(addon_ids).await
        }

        async fn find_bot_token(&self, user_id: &str) -> Result<Option<StoredBotToken>> {
            self.0.find_bot_token(user_id).await
        }

        async fn save_bot_token(&self, _token: StoredBotToken) -> Result<()> {
            Err(RuinousError::Database("write refused".into()))
        }

        async fn delete_bot_tokens_except(&self, user_id: &str) -> Result<u64> {
            self.0.delete_bot_tokens_except(user_id).await
        }

        async fn clear_bot_flag_except(&self, user_id: &str) -> Result<u64> {
            self.0.clear_bot_flag_except(user_id).await
        }
    }

    fn user(id: &str, name: &str) -> User {
        User {
            user_id: id.into(),
            username: name.into(),
            display_name: name.into(),
            profile_picture_url: String::new(),
            is_bot: false,
        }
    }

    async fn install(store: &MemoryStore, user_id: &str, addon_id: &str) {
        store
            .create_installation(Installation {
                user_id: user_id.into(),
                addon_id: addon_id.into(),
                overlay_id: String::new(),
                config: json!({}),
            })
            .await
            .unwrap();
    }

    struct Harness {
        presence: ChatPresence,
        store: Arc<MemoryStore>,
        wire: Arc<Mutex<Wire>>,
        refresher: Arc<FakeRefresher>,
    }

    impl Harness {
        fn lines(&self) -> Vec<String> {
            self.wire.lock().unwrap().lines.clone()
        }

        fn inject(&self, event: ChatEvent) {
            let wire = self.wire.lock().unwrap();
            wire.events.as_ref().unwrap().send(event).unwrap();
        }
    }

    async fn harness_with(
        store: Arc<MemoryStore>,
        token: Option<BotCredentials>,
        reject: bool,
        refresh_fails: bool,
        config: PresenceConfig,
    ) -> Harness {
        let cipher = Arc::new(TokenCipher::new(SECRET).unwrap());
        if let Some(token) = token {
            store
                .save_bot_token(token.seal("bot", &cipher).unwrap())
                .await
                .unwrap();
        }

        let connector = Arc::new(FakeConnector {
            wire: Arc::new(Mutex::new(Wire::default())),
            reject,
        });
        let wire = Arc::clone(&connector.wire);
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicUsize::new(0),
            fail: refresh_fails,
        });

        let (presence, _task) = ChatPresence::start(
            config,
            PresenceDeps {
                store: store.clone(),
                catalog: Arc::new(AddonCatalog::builtin().unwrap()),
                cipher,
                connector,
                refresher: refresher.clone(),
            },
        )
        .await
        .unwrap();

        Harness {
            presence,
            store,
            wire,
            refresher,
        }
    }

    fn config() -> PresenceConfig {
        PresenceConfig {
            bot_user_id: "bot".into(),
            retry_backoff: Duration::from_millis(20),
            ..PresenceConfig::default()
        }
    }

    async fn connected() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(store, Some(credentials("access", None)), false, false, config()).await;
        assert!(
            h.presence
                .wait_for(PresenceState::Connected, Duration::from_secs(2))
                .await
        );
        h
    }

    #[tokio::test]
    async fn test_no_credentials_stays_uninitialized() {
        let h = harness_with(Arc::new(MemoryStore::new()), None, false, false, config()).await;

        assert!(h.presence.join("zeke").await.unwrap());
        assert_eq!(h.presence.state(), PresenceState::Uninitialized);
        assert_eq!(h.presence.membership().await.unwrap(), vec!["zeke"]);
        assert!(h.lines().is_empty());
    }

    #[tokio::test]
    async fn test_initial_join_set_from_installed_chat_addons() {
        let store = Arc::new(MemoryStore::new());
        store.upsert_user(user("u1", "Zeke")).await.unwrap();
        store.upsert_user(user("u2", "dana")).await.unwrap();
        store.upsert_user(user("u3", "overlayonly")).await.unwrap();
        install(&store, "u1", ADDON_ONE_ID).await;
        install(&store, "u1", ADDON_THREE_ID).await;
        install(&store, "u2", ADDON_THREE_ID).await;
        install(&store, "u3", ADDON_TWO_ID).await;

        let h = harness_with(store, Some(credentials("access", None)), false, false, config()).await;
        assert!(
            h.presence
                .wait_for(PresenceState::Connected, Duration::from_secs(2))
                .await
        );

        assert_eq!(h.presence.membership().await.unwrap(), vec!["dana", "zeke"]);
        let lines = h.lines();
        assert!(lines.contains(&"JOIN #zeke".to_string()));
        assert!(lines.contains(&"JOIN #dana".to_string()));
        assert_eq!(lines.len(), 2);
    }

    #[tokio::test]
    async fn test_join_is_idempotent() {
        let h = connected().await;

        assert!(h.presence.join("zeke").await.unwrap());
        assert!(!h.presence.join("Zeke").await.unwrap());
        assert_eq!(h.presence.membership().await.unwrap().len(), 1);
        assert_eq!(h.lines(), vec!["JOIN #zeke"]);
    }

    #[tokio::test]
    async fn test_install_and_uninstall_drive_membership() {
        let h = connected().await;
        h.store.upsert_user(user("u1", "zeke")).await.unwrap();

        install(&h.store, "u1", ADDON_ONE_ID).await;
        h.presence.notify_installed("u1", "zeke", true).await.unwrap();
        assert_eq!(h.presence.membership().await.unwrap(), vec!["zeke"]);

        install(&h.store, "u1", ADDON_THREE_ID).await;
        h.presence.notify_installed("u1", "zeke", true).await.unwrap();

        h.store.delete_installation("u1", ADDON_ONE_ID).await.unwrap();
        h.presence.notify_uninstalled("u1", "zeke").await.unwrap();
        assert_eq!(h.presence.membership().await.unwrap(), vec!["zeke"]);

        h.store.delete_installation("u1", ADDON_THREE_ID).await.unwrap();
        h.presence.notify_uninstalled("u1", "zeke").await.unwrap();
        assert!(h.presence.membership().await.unwrap().is_empty());

        assert_eq!(h.lines(), vec!["JOIN #zeke", "PART #zeke"]);
    }

    #[tokio::test]
    async fn test_non_chat_install_is_ignored() {
        let h = connected().await;
        h.presence.notify_installed("u1", "zeke", false).await.unwrap();
        assert!(h.presence.membership().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sentinel_from_broadcaster_gets_reply() {
        let h = connected().await;
        h.presence.join("zeke").await.unwrap();

        h.inject(ChatEvent::Message {
            channel: "zeke".into(),
            user: "viewer".into(),
            text: "$ruinous".into(),
            is_broadcaster: false,
        });
        h.inject(ChatEvent::Message {
            channel: "zeke".into(),
            user: "Zeke".into(),
            text: "is the bot here? $ruinous".into(),
            is_broadcaster: true,
        });
        // Round trip through the queue so both events have been handled
        h.presence.membership().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let replies: Vec<String> = h
            .lines()
            .into_iter()
            .filter(|l| l.starts_with("PRIVMSG"))
            .collect();
        assert_eq!(replies, vec![format!("PRIVMSG #zeke :{SENTINEL_REPLY}")]);
    }

    #[tokio::test]
    async fn test_rejected_login_ends_disconnected() {
        let store = Arc::new(MemoryStore::new());
        let h = harness_with(store, Some(credentials("access", None)), true, true, config()).await;

        assert!(
            h.presence
                .wait_for(PresenceState::Disconnected, Duration::from_secs(2))
                .await
        );

        // One retry attempt, which fails to refresh, then nothing more
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.wire.lock().unwrap().connects, 1);
        assert_eq!(h.presence.state(), PresenceState::Disconnected);
    }

    #[tokio::test]
    async fn test_auth_failure_mid_session_reconnects_after_refresh() {
        let h = connected().await;
        h.presence.join("zeke").await.unwrap();

        h.inject(ChatEvent::AuthFailed("Login authentication failed".into()));

        let reconnected = async {
            loop {
                if h.wire.lock().unwrap().connects == 2
                    && h.presence.state() == PresenceState::Connected
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), reconnected)
            .await
            .unwrap();
        assert_eq!(h.wire.lock().unwrap().connects, 2);
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);

        // The refreshed token was persisted encrypted
        let stored: StoredBotToken = h.store.find_bot_token("bot").await.unwrap().unwrap();
        let cipher = TokenCipher::new(SECRET).unwrap();
        assert_eq!(cipher.decrypt(&stored.access_token).unwrap(), "access-0");

        // Membership survived the reconnect
        assert_eq!(h.lines().iter().filter(|l| *l == "JOIN #zeke").count(), 2);
    }

    #[tokio::test]
    async fn test_deferred_join_applied_on_connect() {
        let h = harness_with(Arc::new(MemoryStore::new()), None, false, false, config()).await;
        h.presence.join("zeke").await.unwrap();

        let state = h
            .presence
            .set_credentials(credentials("fresh", None))
            .await
            .unwrap();
        assert_eq!(state, PresenceState::Connected);
        assert_eq!(h.lines(), vec!["JOIN #zeke"]);
        assert!(h.store.find_bot_token("bot").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_startup_prunes_foreign_bot_state() {
        let store = Arc::new(MemoryStore::new());
        let cipher = TokenCipher::new(SECRET).unwrap();
        let mut old = user("old", "oldbot");
        old.is_bot = true;
        store.upsert_user(old).await.unwrap();
        store
            .save_bot_token(credentials("x", None).seal("old", &cipher).unwrap())
            .await
            .unwrap();

        let h = harness_with(store, None, false, false, config()).await;

        assert!(h.store.find_bot_token("old").await.unwrap().is_none());
        assert!(!h.store.find_user("old").await.unwrap().unwrap().is_bot);
        assert_eq!(h.presence.state(), PresenceState::Uninitialized);
    }

    #[tokio::test]
    async fn test_scheduled_refresh_persists_new_token() {
        let store = Arc::new(MemoryStore::new());
        // Already past the refresh margin, so the first refresh is due at once
        let h = harness_with(store, Some(stale("access", 3600)), false, false, config()).await;
        assert!(
            h.presence
                .wait_for(PresenceState::Connected, Duration::from_secs(2))
                .await
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.refresher.calls.load(Ordering::SeqCst) >= 1);

        let stored = h.store.find_bot_token("bot").await.unwrap().unwrap();
        let cipher = TokenCipher::new(SECRET).unwrap();
        assert!(cipher
            .decrypt(&stored.access_token)
            .unwrap()
            .starts_with("access-"));
        assert_eq!(h.presence.state(), PresenceState::Connected);
    }

    #[tokio::test]
    async fn test_margin_beyond_lifetime_refreshes_once() {
        let config = PresenceConfig {
            refresh_margin: Duration::from_secs(4000),
            ..config()
        };
        let h = harness_with(
            Arc::new(MemoryStore::new()),
            Some(stale("access", 3600)),
            false,
            false,
            config,
        )
        .await;
        assert!(
            h.presence
                .wait_for(PresenceState::Connected, Duration::from_secs(2))
                .await
        );

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.presence.state(), PresenceState::Connected);
    }

    #[tokio::test]
    async fn test_unpersisted_refresh_ends_session_without_retry() {
        let memory = Arc::new(MemoryStore::new());
        let cipher = Arc::new(TokenCipher::new(SECRET).unwrap());
        memory
            .save_bot_token(stale("access", 3600).seal("bot", &cipher).unwrap())
            .await
            .unwrap();

        let wire = Arc::new(Mutex::new(Wire::default()));
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicUsize::new(0),
            fail: false,
        });
        let (presence, _task) = ChatPresence::start(
            config(),
            PresenceDeps {
                store: Arc::new(ReadOnlyTokens(memory.clone())),
                catalog: Arc::new(AddonCatalog::builtin().unwrap()),
                cipher: cipher.clone(),
                connector: Arc::new(FakeConnector {
                    wire: Arc::clone(&wire),
                    reject: false,
                }),
                refresher: refresher.clone(),
            },
        )
        .await
        .unwrap();

        let ended = async {
            loop {
                if wire.lock().unwrap().lines.iter().any(|l| l == "QUIT")
                    && presence.state() == PresenceState::Disconnected
                {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(2), ended)
            .await
            .unwrap();

        // Well past the back-off: no reconnect and no further refresh
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(presence.state(), PresenceState::Disconnected);
        assert_eq!(wire.lock().unwrap().connects, 1);
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let stored = memory.find_bot_token("bot").await.unwrap().unwrap();
        assert_eq!(cipher.decrypt(&stored.access_token).unwrap(), "access");
    }

    #[tokio::test]
    async fn test_reconnect_without_credentials_fails() {
        let h = harness_with(Arc::new(MemoryStore::new()), None, false, false, config()).await;
        assert!(matches!(
            h.presence.reconnect().await,
            Err(RuinousError::Auth(_))
        ));
    }
}
