//! Persistence boundary
//!
//! The runtime treats storage as an opaque record store. [`Store`] exposes
//! the handful of lookups and writes the core needs; [`MemoryStore`] backs
//! tests and dev mode, [`MongoStore`] backs production.

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::{MongoClient, MongoStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::Result;

/// A streaming-service user known to the platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    /// Login name; also the name of the user's chat channel
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub profile_picture_url: String,
    #[serde(default)]
    pub is_bot: bool,
}

/// A user having added an addon to their channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Installation {
    pub user_id: String,
    pub addon_id: String,
    /// Empty when the addon has no overlay
    pub overlay_id: String,
    pub config: Value,
}

/// Bot chat credentials as persisted; both tokens are encrypted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBotToken {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub obtained_at: DateTime<Utc>,
    /// Lifetime in seconds; `None` for tokens that do not expire
    pub expires_in: Option<i64>,
}

/// Record store used by the addon runtime
#[async_trait]
pub trait Store: Send + Sync {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>>;

    async fn upsert_user(&self, user: User) -> Result<()>;

    async fn find_installation(&self, user_id: &str, addon_id: &str)
        -> Result<Option<Installation>>;

    /// Every installation carrying this overlay id (normally at most one)
    async fn find_installations_by_overlay(&self, overlay_id: &str) -> Result<Vec<Installation>>;

    async fn list_installations(&self, user_id: &str) -> Result<Vec<Installation>>;

    /// Insert a new installation; `Duplicate` if the user already has it
    async fn create_installation(&self, installation: Installation) -> Result<()>;

    /// Replace an installation's config; `NotFound` if it does not exist
    async fn update_installation_config(
        &self,
        user_id: &str,
        addon_id: &str,
        config: Value,
    ) -> Result<()>;

    /// Remove an installation, returning it; `NotFound` if it does not exist
    async fn delete_installation(&self, user_id: &str, addon_id: &str) -> Result<Installation>;

    /// Distinct users that have at least one of the given addons installed
    async fn users_with_addons(&self, addon_ids: &[String]) -> Result<Vec<User>>;

    async fn find_bot_token(&self, user_id: &str) -> Result<Option<StoredBotToken>>;

    /// Insert or replace the token record for `token.user_id`
    async fn save_bot_token(&self, token: StoredBotToken) -> Result<()>;

    /// Delete every token that does not belong to `user_id`
    async fn delete_bot_tokens_except(&self, user_id: &str) -> Result<u64>;

    /// Clear the bot flag on every user other than `user_id`
    async fn clear_bot_flag_except(&self, user_id: &str) -> Result<u64>;
}
