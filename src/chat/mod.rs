//! Chat presence of the shared bot account
//!
//! A single bot session sits in the chat of every user that has at least
//! one chat addon installed. [`presence`] owns that session and its channel
//! membership, [`irc`] is the Twitch IRC transport and [`token`] handles the
//! bot's OAuth credentials.

pub mod irc;
pub mod presence;
pub mod token;

pub use irc::TwitchIrcConnector;
pub use presence::{ChatPresence, PresenceConfig, PresenceDeps, PresenceState};
pub use token::{BotCredentials, TokenRefresher, TwitchTokenRefresher};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::Result;

/// Something that happened on the chat connection
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    Message {
        channel: String,
        user: String,
        text: String,
        /// Sender owns the channel
        is_broadcaster: bool,
    },
    Joined {
        channel: String,
        user: String,
    },
    Parted {
        channel: String,
        user: String,
    },
    /// The server rejected our credentials
    AuthFailed(String),
    /// The connection is gone
    Closed(Option<String>),
}

/// A logged-in chat connection
#[async_trait]
pub trait ChatSession: Send + Sync {
    /// Name the bot is known by in chat
    fn nick(&self) -> &str;

    async fn join(&mut self, channel: &str) -> Result<()>;

    async fn part(&mut self, channel: &str) -> Result<()>;

    async fn say(&mut self, channel: &str, text: &str) -> Result<()>;

    async fn quit(&mut self);
}

/// A session together with the events it produces
pub struct ChatLink {
    pub session: Box<dyn ChatSession>,
    pub events: mpsc::UnboundedReceiver<ChatEvent>,
}

/// Opens chat sessions
#[async_trait]
pub trait ChatConnector: Send + Sync {
    /// Connect and log in; `Auth` when the credentials are refused
    async fn connect(&self, credentials: &BotCredentials) -> Result<ChatLink>;
}

/// Canonical form of a channel name: lowercase, no leading `#`
pub fn normalize_channel(value: &str) -> String {
    value.trim().trim_start_matches('#').to_ascii_lowercase()
}
