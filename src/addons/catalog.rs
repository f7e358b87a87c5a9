//! The set of addons known to this deployment
//!
//! Loaded once at startup, either from the built-in definitions or from a
//! JSON file. Every addon's schema is compiled while loading so a malformed
//! definition stops the process before it serves a single request.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use super::schema::{compile, Validator};
use super::AddonDefinition;
use crate::types::{Result, RuinousError};

/// Addon definitions with their compiled validators
pub struct AddonCatalog {
    addons: Vec<Arc<AddonDefinition>>,
    by_id: HashMap<String, usize>,
    validators: HashMap<String, Arc<Validator>>,
}

impl AddonCatalog {
    /// Build a catalog, compiling every addon's schema
    pub fn new(definitions: Vec<AddonDefinition>) -> Result<Self> {
        let mut addons = Vec::with_capacity(definitions.len());
        let mut by_id = HashMap::new();
        let mut validators = HashMap::new();

        for definition in definitions {
            if by_id.contains_key(&definition.addon_id) {
                return Err(RuinousError::Config(format!(
                    "addon id '{}' is declared more than once",
                    definition.addon_id
                )));
            }

            let validator = compile(&definition)?;
            debug!(
                addon = %definition.slug,
                fields = validator.fields().len(),
                "Compiled addon config schema"
            );

            by_id.insert(definition.addon_id.clone(), addons.len());
            validators.insert(definition.addon_id.clone(), Arc::new(validator));
            addons.push(Arc::new(definition));
        }

        info!("Loaded {} addon definition(s)", addons.len());

        Ok(Self {
            addons,
            by_id,
            validators,
        })
    }

    /// Catalog of the addons that ship with the server
    pub fn builtin() -> Result<Self> {
        Self::new(builtin_definitions()?)
    }

    /// Load definitions from a JSON file containing an array of addons
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            RuinousError::Config(format!("failed to read addons file {}: {e}", path.display()))
        })?;
        let definitions: Vec<AddonDefinition> = serde_json::from_str(&raw).map_err(|e| {
            RuinousError::Config(format!("failed to parse addons file {}: {e}", path.display()))
        })?;
        Self::new(definitions)
    }

    pub fn get(&self, addon_id: &str) -> Option<&Arc<AddonDefinition>> {
        self.by_id.get(addon_id).map(|&idx| &self.addons[idx])
    }

    /// Look up an addon, failing with `NotFound` when it is unknown
    pub fn require(&self, addon_id: &str) -> Result<&Arc<AddonDefinition>> {
        self.get(addon_id)
            .ok_or_else(|| RuinousError::NotFound(format!("no such addon '{addon_id}'")))
    }

    pub fn validator(&self, addon_id: &str) -> Option<&Arc<Validator>> {
        self.validators.get(addon_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AddonDefinition>> {
        self.addons.iter()
    }

    pub fn len(&self) -> usize {
        self.addons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addons.is_empty()
    }

    /// Ids of every addon that needs the bot in the owner's chat
    pub fn chat_addon_ids(&self) -> Vec<String> {
        self.addons
            .iter()
            .filter(|a| a.requires_chat)
            .map(|a| a.addon_id.clone())
            .collect()
    }

    /// Addons that render an overlay and therefore get a channel
    pub fn overlay_addons(&self) -> impl Iterator<Item = &Arc<AddonDefinition>> {
        self.addons.iter().filter(|a| a.requires_overlay)
    }
}

/// Stable id of the chat-only sample addon
pub const ADDON_ONE_ID: &str = "2BNIO9lVnPY9lKgIMsBVQICBLAM";
/// Stable id of the overlay-only sample addon
pub const ADDON_TWO_ID: &str = "2BNIa2BOEP7kF10eeOdObXjNsQk";
/// Stable id of the chat + overlay sample addon
pub const ADDON_THREE_ID: &str = "2C0usq54Rpo4TZtuQa7mDADAhjV";

fn builtin_definitions() -> Result<Vec<AddonDefinition>> {
    let nickname = json!({
        "type": "string",
        "field": "nickname",
        "default": "Curmudgeon",
        "name": "Nickname of a guy somewhere",
        "description": "This sets the nickname to use for whatever it is that this addon is actually doing.",
        "placeholder": "nickname of the guy"
    });

    let raw = json!([
        {
            "addonId": ADDON_ONE_ID,
            "name": "Addon The First",
            "slug": "addon-one",
            "iconPic": "/icons/addons/skull.png",
            "blurb": "A simple addon that does something cool.",
            "description": "Requires an integration with the channel chat, but displays nothing and needs no overlay.",
            "requiresChat": true,
            "requiresOverlay": false,
            "overlayFile": "",
            "configSchema": [
                nickname.clone(),
                {
                    "type": "boolean",
                    "field": "kickTheZed",
                    "default": false,
                    "name": "Should we kick people whose nicks include a Z?",
                    "labels": ["Zed is a cool dude", "Zed's Dead, baby."]
                },
                {
                    "type": "enum",
                    "field": "placeOfZeke",
                    "default": "third",
                    "name": "What place to give people named Zeke",
                    "placeholder": "Select Zeke's Winnability",
                    "values": [
                        {"label": "The first option", "value": "first"},
                        {"label": "The middle option", "value": "second"},
                        {"label": "The non sequiter option", "value": "third"}
                    ]
                },
                {
                    "type": "integer",
                    "field": "toadsSprocketed",
                    "default": 69,
                    "name": "Number of Toads to Sprocket",
                    "placeholder": "Toads to be sprocketed",
                    "minValue": 0,
                    "maxValue": 100
                },
                {
                    "type": "integer-slider",
                    "field": "wetnessFactor",
                    "default": 10,
                    "name": "Wetness Level",
                    "minValue": 0,
                    "maxValue": 10,
                    "stepValue": 1
                },
                {
                    "type": "float",
                    "field": "gigawatts",
                    "default": 1.21,
                    "name": "1.21 Gigawatts?!",
                    "placeholder": "Ride the lightning",
                    "minValue": 0,
                    "maxValue": 10
                },
                {
                    "type": "float-slider",
                    "field": "lightningCount",
                    "default": 1,
                    "name": "Lightning Bolt Count",
                    "minValue": 0,
                    "maxValue": 1,
                    "stepValue": 0.01
                }
            ]
        },
        {
            "addonId": ADDON_TWO_ID,
            "name": "Addon Part Two",
            "slug": "addon-two",
            "iconPic": "/icons/addons/witch_hat.png",
            "blurb": "A second addon. This one does something different than the first one does.",
            "description": "Displays content in stream via an overlay, with no chat integration.",
            "requiresChat": false,
            "requiresOverlay": true,
            "overlayFile": "addon_two.html",
            "configSchema": [nickname]
        },
        {
            "addonId": ADDON_THREE_ID,
            "name": "Addon Numero Troi",
            "slug": "addon-three",
            "iconPic": "/icons/addons/power_plug.png",
            "blurb": "The third of the sample addons; it uses both the chat AND an overlay.",
            "description": "Displays something through an overlay and also talks to the channel chat.",
            "requiresChat": true,
            "requiresOverlay": true,
            "overlayFile": "addon_three.html",
            "configSchema": [
                {
                    "type": "float-slider",
                    "field": "coolnessFactor",
                    "default": 10,
                    "name": "Coolness Level",
                    "minValue": 0,
                    "maxValue": 10,
                    "stepValue": 0.1
                }
            ]
        }
    ]);

    serde_json::from_value(raw)
        .map_err(|e| RuinousError::Config(format!("invalid built-in addon definitions: {e}")))
}
