//! In-memory store for tests and dev mode

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{Installation, Store, StoredBotToken, User};
use crate::types::{Result, RuinousError};

#[derive(Default)]
struct MemoryState {
    users: HashMap<String, User>,
    /// (user_id, addon_id) -> installation
    installations: HashMap<(String, String), Installation>,
    tokens: HashMap<String, StoredBotToken>,
}

/// Store that keeps everything in process memory
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(user_id: &str, addon_id: &str) -> (String, String) {
    (user_id.to_string(), addon_id.to_string())
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_user(&self, user_id: &str) -> Result<Option<User>> {
        Ok(self.state.read().await.users.get(user_id).cloned())
    }

    async fn upsert_user(&self, user: User) -> Result<()> {
        self.state
            .write()
            .await
            .users
            .insert(user.user_id.clone(), user);
        Ok(())
    }

    async fn find_installation(
        &self,
        user_id: &str,
        addon_id: &str,
    ) -> Result<Option<Installation>> {
        Ok(self
            .state
            .read()
            .await
            .installations
            .get(&key(user_id, addon_id))
            .cloned())
    }

    async fn find_installations_by_overlay(&self, overlay_id: &str) -> Result<Vec<Installation>> {
        if overlay_id.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .state
            .read()
            .await
            .installations
            .values()
            .filter(|i| i.overlay_id == overlay_id)
            .cloned()
            .collect())
    }

    async fn list_installations(&self, user_id: &str) -> Result<Vec<Installation>> {
        Ok(self
            .state
            .read()
            .await
            .installations
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn create_installation(&self, installation: Installation) -> Result<()> {
        let mut state = self.state.write().await;
        let k = key(&installation.user_id, &installation.addon_id);
        if state.installations.contains_key(&k) {
            return Err(RuinousError::Duplicate(format!(
                "addon '{}' is already installed",
                installation.addon_id
            )));
        }
        state.installations.insert(k, installation);
        Ok(())
    }

    async fn update_installation_config(
        &self,
        user_id: &str,
        addon_id: &str,
        config: Value,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        match state.installations.get_mut(&key(user_id, addon_id)) {
            Some(installation) => {
                installation.config = config;
                Ok(())
            }
            None => Err(RuinousError::NotFound("addon not installed".into())),
        }
    }

    async fn delete_installation(&self, user_id: &str, addon_id: &str) -> Result<Installation> {
        self.state
            .write()
            .await
            .installations
            .remove(&key(user_id, addon_id))
            .ok_or_else(|| RuinousError::NotFound("addon not installed".into()))
    }

    async fn users_with_addons(&self, addon_ids: &[String]) -> Result<Vec<User>> {
        let state = self.state.read().await;
        let user_ids: BTreeSet<&String> = state
            .installations
            .values()
            .filter(|i| addon_ids.contains(&i.addon_id))
            .map(|i| &i.user_id)
            .collect();

        Ok(user_ids
            .into_iter()
            .filter_map(|id| state.users.get(id).cloned())
            .collect())
    }

    async fn find_bot_token(&self, user_id: &str) -> Result<Option<StoredBotToken>> {
        Ok(self.state.read().await.tokens.get(user_id).cloned())
    }

    async fn save_bot_token(&self, token: StoredBotToken) -> Result<()> {
        self.state
            .write()
            .await
            .tokens
            .insert(token.user_id.clone(), token);
        Ok(())
    }

    async fn delete_bot_tokens_except(&self, user_id: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let before = state.tokens.len();
        state.tokens.retain(|id, _| id == user_id);
        Ok((before - state.tokens.len()) as u64)
    }

    async fn clear_bot_flag_except(&self, user_id: &str) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut cleared = 0;
        for user in state.users.values_mut() {
            if user.user_id != user_id && user.is_bot {
                user.is_bot = false;
                cleared += 1;
            }
        }
        Ok(cleared)
    }
}
