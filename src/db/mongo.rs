//! MongoDB client and record store

use bson::{doc, Bson, Document};
use futures_util::TryStreamExt;
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::IndexOptions,
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{Installation, Store, StoredBotToken, User};
use crate::types::{Result, RuinousError};

const USERS: &str = "users";
const INSTALLATIONS: &str = "user_addons";
const BOT_TOKENS: &str = "bot_tokens";

/// Duplicate key error code reported by the server
const DUPLICATE_KEY: i32 = 11000;

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Connect and verify the server answers a ping
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        info!("Connecting to MongoDB");

        // Fail fast when the server is unreachable
        let timeout_uri = if uri.contains('?') {
            format!("{uri}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000")
        } else {
            format!("{uri}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000")
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| RuinousError::Database(format!("Failed to connect to MongoDB: {e}")))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| RuinousError::Database(format!("MongoDB ping failed: {e}")))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    fn collection<T>(&self, name: &str) -> Collection<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        self.client.database(&self.db_name).collection::<T>(name)
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }
}

/// [`Store`] backed by three collections: users, installations, bot tokens
pub struct MongoStore {
    users: Collection<User>,
    installations: Collection<Installation>,
    tokens: Collection<StoredBotToken>,
}

impl MongoStore {
    /// Open the collections and make sure their unique indexes exist
    pub async fn open(client: &MongoClient) -> Result<Self> {
        let store = Self {
            users: client.collection(USERS),
            installations: client.collection(INSTALLATIONS),
            tokens: client.collection(BOT_TOKENS),
        };
        store.apply_indexes().await?;
        debug!(db = client.db_name(), "MongoDB store ready");
        Ok(store)
    }

    async fn apply_indexes(&self) -> Result<()> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.users
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "userId": 1 })
                    .options(unique())
                    .build(),
            )
            .await
            .map_err(|e| RuinousError::Database(format!("Failed to create indexes: {e}")))?;

        self.installations
            .create_indexes([
                IndexModel::builder()
                    .keys(doc! { "userId": 1, "addonId": 1 })
                    .options(unique())
                    .build(),
                IndexModel::builder().keys(doc! { "overlayId": 1 }).build(),
                IndexModel::builder().keys(doc! { "addonId": 1 }).build(),
            ])
            .await
            .map_err(|e| RuinousError::Database(format!("Failed to create indexes: {e}")))?;

        self.tokens
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "userId": 1 })
                    .options(unique())
                    .build(),
            )
            .await
            .map_err(|e| RuinousError::Database(format!("Failed to create indexes: {e}")))?;

        Ok(())
    }
}

fn installation_filter(user_id: &str, addon_id: &str) -> Document {
    doc! { "userId": user_id, "addonId": addon_id }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    matches!(
        err.kind.as_ref(),
        ErrorKind::Write(WriteFailure::WriteError(e)) if e.code == DUPLICATE_KEY
    )
}

#[async_trait::async_trait]
impl Store for MongoStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.users.find_one(doc! { "userId": user_id }).await?)
    }

    async fn upsert_user(&self, user: User) -> Result<()> {
        self.users
            .replace_one(doc! { "userId": user.user_id.as_str() }, &user)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn find_installation(
        &self,
        user_id: &str,
        addon_id: &str,
    ) -> Result<Option<Installation>> {
        Ok(self
            .installations
            .find_one(installation_filter(user_id, addon_id))
            .await?)
    }

    async fn find_installations_by_overlay(&self, overlay_id: &str) -> Result<Vec<Installation>> {
        if overlay_id.is_empty() {
            return Ok(Vec::new());
        }
        let cursor = self
            .installations
            .find(doc! { "overlayId": overlay_id })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn list_installations(&self, user_id: &str) -> Result<Vec<Installation>> {
        let cursor = self.installations.find(doc! { "userId": user_id }).await?;
        Ok(cursor.try_collect().await?)
    }

    async fn create_installation(&self, installation: Installation) -> Result<()> {
        match self.installations.insert_one(&installation).await {
            Ok(_) => Ok(()),
            Err(e) if is_duplicate_key(&e) => Err(RuinousError::Duplicate(format!(
                "addon '{}' is already installed",
                installation.addon_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn update_installation_config(
        &self,
        user_id: &str,
        addon_id: &str,
        config: Value,
    ) -> Result<()> {
        let config = bson::to_bson(&config)
            .map_err(|e| RuinousError::Internal(format!("config is not storable: {e}")))?;

        let result = self
            .installations
            .update_one(
                installation_filter(user_id, addon_id),
                doc! { "$set": { "config": config } },
            )
            .await?;

        if result.matched_count == 0 {
            return Err(RuinousError::NotFound("addon not installed".into()));
        }
        Ok(())
    }

    async fn delete_installation(&self, user_id: &str, addon_id: &str) -> Result<Installation> {
        self.installations
            .find_one_and_delete(installation_filter(user_id, addon_id))
            .await?
            .ok_or_else(|| RuinousError::NotFound("addon not installed".into()))
    }

    async fn users_with_addons(&self, addon_ids: &[String]) -> Result<Vec<User>> {
        if addon_ids.is_empty() {
            return Ok(Vec::new());
        }

        let user_ids: Vec<Bson> = self
            .installations
            .distinct("userId", doc! { "addonId": { "$in": addon_ids } })
            .await?;

        if user_ids.is_empty() {
            return Ok(Vec::new());
        }

        let cursor = self
            .users
            .find(doc! { "userId": { "$in": user_ids } })
            .await?;
        Ok(cursor.try_collect().await?)
    }

    async fn find_bot_token(&self, user_id: &str) -> Result<Option<StoredBotToken>> {
        Ok(self.tokens.find_one(doc! { "userId": user_id }).await?)
    }

    async fn save_bot_token(&self, token: StoredBotToken) -> Result<()> {
        self.tokens
            .replace_one(doc! { "userId": token.user_id.as_str() }, &token)
            .upsert(true)
            .await?;
        Ok(())
    }

    async fn delete_bot_tokens_except(&self, user_id: &str) -> Result<u64> {
        let result = self
            .tokens
            .delete_many(doc! { "userId": { "$ne": user_id } })
            .await?;
        Ok(result.deleted_count)
    }

    async fn clear_bot_flag_except(&self, user_id: &str) -> Result<u64> {
        let result = self
            .users
            .update_many(
                doc! { "userId": { "$ne": user_id }, "isBot": true },
                doc! { "$set": { "isBot": false } },
            )
            .await?;
        Ok(result.modified_count)
    }
}
