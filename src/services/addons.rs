//! Addon installation and configuration

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::addons::{AddonCatalog, AddonDefinition, FieldSpec};
use crate::chat::ChatPresence;
use crate::db::{Installation, Store, User};
use crate::overlay::OverlayDirectory;
use crate::types::{Result, RuinousError};

/// An installation as returned to callers
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallationView {
    pub user_id: String,
    pub addon_id: String,
    pub overlay_id: String,
    /// Empty when the addon has no overlay
    pub overlay_url: String,
    pub config: Value,
    /// Schema for rendering the settings form
    pub schema: Vec<FieldSpec>,
}

pub struct AddonService {
    catalog: Arc<AddonCatalog>,
    store: Arc<dyn Store>,
    presence: ChatPresence,
    root_url: String,
}

impl AddonService {
    pub fn new(
        catalog: Arc<AddonCatalog>,
        store: Arc<dyn Store>,
        presence: ChatPresence,
        root_url: &str,
    ) -> Self {
        Self {
            catalog,
            store,
            presence,
            root_url: root_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn catalog(&self) -> &Arc<AddonCatalog> {
        &self.catalog
    }

    pub fn overlay_url(&self, overlay_id: &str) -> String {
        if overlay_id.is_empty() {
            String::new()
        } else {
            format!("{}/overlay/{}", self.root_url, overlay_id)
        }
    }

    fn view(&self, installation: Installation, addon: &AddonDefinition) -> InstallationView {
        InstallationView {
            overlay_url: self.overlay_url(&installation.overlay_id),
            user_id: installation.user_id,
            addon_id: installation.addon_id,
            overlay_id: installation.overlay_id,
            config: installation.config,
            schema: addon.config_schema.clone(),
        }
    }

    async fn require_user(&self, user_id: &str) -> Result<User> {
        self.store
            .find_user(user_id)
            .await?
            .ok_or_else(|| RuinousError::NotFound(format!("no such user '{user_id}'")))
    }

    /// Install an addon for a user with its default config
    ///
    /// Overlay addons get a fresh overlay id. Installing twice is `Duplicate`.
    pub async fn install(&self, user_id: &str, addon_id: &str) -> Result<InstallationView> {
        let addon = Arc::clone(self.catalog.require(addon_id)?);
        let user = self.require_user(user_id).await?;

        let overlay_id = if addon.requires_overlay {
            uuid::Uuid::new_v4().simple().to_string()
        } else {
            String::new()
        };

        let installation = Installation {
            user_id: user.user_id.clone(),
            addon_id: addon.addon_id.clone(),
            overlay_id,
            config: addon.default_config(),
        };
        self.store.create_installation(installation.clone()).await?;

        info!(user = %user.username, addon = %addon.slug, "Addon installed");

        if let Err(e) = self
            .presence
            .notify_installed(&user.user_id, &user.username, addon.requires_chat)
            .await
        {
            warn!(user = %user.username, "Chat presence not updated after install: {}", e);
        }

        Ok(self.view(installation, &addon))
    }

    pub async fn uninstall(&self, user_id: &str, addon_id: &str) -> Result<()> {
        let removed = self.store.delete_installation(user_id, addon_id).await?;
        info!(user_id, addon_id = %removed.addon_id, "Addon uninstalled");

        let requires_chat = self
            .catalog
            .get(addon_id)
            .map(|a| a.requires_chat)
            .unwrap_or(false);
        if !requires_chat {
            return Ok(());
        }

        match self.store.find_user(user_id).await {
            Ok(Some(user)) => {
                if let Err(e) = self
                    .presence
                    .notify_uninstalled(&user.user_id, &user.username)
                    .await
                {
                    warn!(user = %user.username, "Chat presence not updated after uninstall: {}", e);
                }
            }
            Ok(None) => warn!(user_id, "Uninstalled addon for an unknown user"),
            Err(e) => warn!(user_id, "Could not look up user after uninstall: {}", e),
        }
        Ok(())
    }

    /// Every installation of a user
    pub async fn list(&self, user_id: &str) -> Result<Vec<InstallationView>> {
        let installations = self.store.list_installations(user_id).await?;
        Ok(installations
            .into_iter()
            .filter_map(|i| {
                let addon = Arc::clone(self.catalog.get(&i.addon_id)?);
                Some(self.view(i, &addon))
            })
            .collect())
    }

    pub async fn get_config(&self, user_id: &str, addon_id: &str) -> Result<InstallationView> {
        let addon = Arc::clone(self.catalog.require(addon_id)?);
        let installation = self
            .store
            .find_installation(user_id, addon_id)
            .await?
            .ok_or_else(|| RuinousError::NotFound("addon not installed".into()))?;
        Ok(self.view(installation, &addon))
    }

    /// Validate and store a complete new config, replacing the old one
    pub async fn set_config(
        &self,
        user_id: &str,
        addon_id: &str,
        config: Value,
    ) -> Result<InstallationView> {
        let addon = Arc::clone(self.catalog.require(addon_id)?);
        let mut installation = self
            .store
            .find_installation(user_id, addon_id)
            .await?
            .ok_or_else(|| RuinousError::NotFound("addon not installed".into()))?;

        let validator = self
            .catalog
            .validator(addon_id)
            .ok_or_else(|| RuinousError::Internal(format!("addon '{addon_id}' has no validator")))?;
        validator.validate(&config).into_result()?;

        self.store
            .update_installation_config(user_id, addon_id, config.clone())
            .await?;
        installation.config = config;
        Ok(self.view(installation, &addon))
    }

    /// Public record of the installation behind an overlay id
    ///
    /// Includes the addon (flagged as installed, with its overlay URL) and
    /// the owner, minus the bot flag.
    pub async fn public_overlay_record(&self, overlay_id: &str) -> Result<Value> {
        let mut found = self.store.find_installations_by_overlay(overlay_id).await?;
        if found.len() != 1 {
            return Err(RuinousError::NotFound(format!("no such overlay '{overlay_id}'")));
        }
        let installation = found.remove(0);

        let addon = self.catalog.require(&installation.addon_id)?;
        let owner = self.require_user(&installation.user_id).await?;

        let mut addon_json = serde_json::to_value(addon.as_ref())?;
        addon_json["installed"] = json!(true);
        addon_json["overlayId"] = json!(overlay_id);
        addon_json["overlayUrl"] = json!(self.overlay_url(overlay_id));

        let mut owner_json = serde_json::to_value(&owner)?;
        if let Some(owner) = owner_json.as_object_mut() {
            owner.remove("isBot");
        }

        Ok(json!({
            "userId": installation.user_id,
            "addonId": installation.addon_id,
            "overlayId": installation.overlay_id,
            "config": installation.config,
            "addon": addon_json,
            "owner": owner_json,
        }))
    }
}

#[async_trait]
impl OverlayDirectory for AddonService {
    async fn overlay_info(&self, overlay_id: &str) -> Result<Value> {
        self.public_overlay_record(overlay_id).await
    }
}
