//! Configuration for Ruinous
//!
//! CLI arguments and environment variable handling using clap.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::chat::irc::{DEFAULT_IRC_HOST, DEFAULT_IRC_PORT};
use crate::chat::token::TWITCH_TOKEN_URL;
use crate::crypto::KEY_LEN;

/// Ruinous - addon runtime for streaming channels
#[derive(Parser, Debug, Clone)]
#[command(name = "ruinous")]
#[command(about = "Chat bot and overlay runtime for channel addons")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Public base URL; overlay URLs are built from it
    #[arg(long, env = "ROOT_URL", default_value = "")]
    pub root_url: String,

    /// Enable development mode (relaxed validation, in-memory fallback store)
    #[arg(long, env = "DEV_MODE", default_value = "false")]
    pub dev_mode: bool,

    /// MongoDB connection URI
    #[arg(long, env = "MONGODB_URI", default_value = "mongodb://localhost:27017")]
    pub mongodb_uri: String,

    /// MongoDB database name
    #[arg(long, env = "MONGODB_DB", default_value = "ruinous")]
    pub mongodb_db: String,

    /// Secret used to encrypt stored tokens; exactly 32 bytes
    #[arg(long, env = "CRYPT_SECRET", default_value = "", hide_env_values = true)]
    pub crypt_secret: String,

    /// JSON file with addon definitions (built-in addons when unset)
    #[arg(long, env = "ADDONS_FILE")]
    pub addons_file: Option<PathBuf>,

    /// Twitch application client id
    #[arg(long, env = "TWITCH_CLIENT_ID", default_value = "")]
    pub twitch_client_id: String,

    /// Twitch application client secret
    #[arg(long, env = "TWITCH_CLIENT_SECRET", default_value = "", hide_env_values = true)]
    pub twitch_client_secret: String,

    /// User id of the account the chat bot runs as
    #[arg(long, env = "TWITCH_BOT_USER_ID", default_value = "")]
    pub twitch_bot_user_id: String,

    /// Login name of the bot account
    #[arg(long, env = "TWITCH_BOT_LOGIN", default_value = "ruinousbot")]
    pub twitch_bot_login: String,

    /// OAuth token endpoint used to refresh the bot token
    #[arg(long, env = "TWITCH_TOKEN_URL", default_value = TWITCH_TOKEN_URL)]
    pub twitch_token_url: String,

    /// Chat server host
    #[arg(long, env = "IRC_HOST", default_value = DEFAULT_IRC_HOST)]
    pub irc_host: String,

    /// Chat server port
    #[arg(long, env = "IRC_PORT", default_value_t = DEFAULT_IRC_PORT)]
    pub irc_port: u16,

    /// Phrase the broadcaster can type to check the bot is present
    #[arg(long, env = "CHAT_SENTINEL", default_value = "$ruinous")]
    pub chat_sentinel: String,

    /// Log every chat message the bot sees
    #[arg(long, env = "LOG_CHAT", default_value = "false")]
    pub log_chat: bool,

    /// Refresh the bot token this many seconds before it expires
    #[arg(long, env = "TOKEN_REFRESH_MARGIN_SECS", default_value = "300")]
    pub token_refresh_margin_secs: u64,

    /// Wait this long before reconnecting a lost chat session
    #[arg(long, env = "CHAT_RETRY_SECS", default_value = "10")]
    pub chat_retry_secs: u64,

    /// Timeout for external calls (store lookups, token refresh, chat login)
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value = "5000")]
    pub request_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,
}

impl Args {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Root URL without a trailing slash, defaulting to the listen address in dev mode
    pub fn effective_root_url(&self) -> String {
        if self.root_url.is_empty() {
            format!("http://{}", self.listen)
        } else {
            self.root_url.trim_end_matches('/').to_string()
        }
    }

    /// Crypt secret, with a fixed insecure key in dev mode when unset
    pub fn crypt_secret(&self) -> Vec<u8> {
        if self.dev_mode && self.crypt_secret.is_empty() {
            b"dev-only-insecure-crypt-secret!!".to_vec()
        } else {
            self.crypt_secret.as_bytes().to_vec()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if !self.dev_mode {
            if self.root_url.is_empty() {
                return Err("ROOT_URL is required in production mode".to_string());
            }
            if self.twitch_bot_user_id.is_empty() {
                return Err("TWITCH_BOT_USER_ID is required in production mode".to_string());
            }
        }

        let secret = self.crypt_secret();
        if secret.len() != KEY_LEN {
            return Err(format!(
                "CRYPT_SECRET must be exactly {} bytes, got {}",
                KEY_LEN,
                secret.len()
            ));
        }

        if !self.root_url.is_empty()
            && !(self.root_url.starts_with("http://") || self.root_url.starts_with("https://"))
        {
            return Err("ROOT_URL must be an http(s) URL".to_string());
        }

        if self.request_timeout_ms == 0 {
            return Err("REQUEST_TIMEOUT_MS must be greater than zero".to_string());
        }

        Ok(())
    }
}
