//! Addon definitions and their configuration schemas
//!
//! An addon is an optional feature a user can enable for their channel. It
//! may need a chat presence, an overlay (browser source), both, or neither.
//! Each addon declares the settings it understands as an ordered list of
//! [`FieldSpec`]s; [`schema::compile`] turns that list into a reusable
//! [`Validator`].
//!
//! Definitions are immutable once loaded. The [`AddonCatalog`] owns them and
//! their compiled validators for the lifetime of the process.

pub mod catalog;
pub mod schema;

pub use catalog::AddonCatalog;
pub use schema::{compile, FieldRule, FieldType, ValidationResult, Validator};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Static description of one addon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddonDefinition {
    /// Stable identifier; never changes once an addon is published
    pub addon_id: String,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub blurb: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub icon_pic: String,
    pub requires_chat: bool,
    pub requires_overlay: bool,
    /// Overlay asset served to the browser source (empty without an overlay)
    #[serde(default)]
    pub overlay_file: String,
    #[serde(default)]
    pub config_schema: Vec<FieldSpec>,
}

impl AddonDefinition {
    /// Build the configuration a fresh installation starts with
    pub fn default_config(&self) -> Value {
        let config: Map<String, Value> = self
            .config_schema
            .iter()
            .map(|spec| (spec.field.clone(), spec.default.clone()))
            .collect();
        Value::Object(config)
    }
}

/// Declarative description of a single setting, as authored and stored
///
/// The `type` tag stays a string here so that an unknown tag is reported by
/// the compiler with the addon and field it came from, instead of surfacing
/// as an opaque deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub field: String,
    pub default: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_value: Option<f64>,
    /// Allowed values (enum only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<EnumChoice>>,
    /// Display strings for the true and false states (boolean only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Vec<String>>,
}

/// One allowed value of an enum setting
///
/// Accepts both `{"value": .., "label": ..}` and a bare value, in which case
/// the label is the value itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ChoiceRepr")]
pub struct EnumChoice {
    pub value: Value,
    pub label: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChoiceRepr {
    Labeled {
        value: Value,
        #[serde(default)]
        label: Option<String>,
    },
    Bare(Value),
}

impl From<ChoiceRepr> for EnumChoice {
    fn from(repr: ChoiceRepr) -> Self {
        let (value, label) = match repr {
            ChoiceRepr::Labeled { value, label } => (value, label),
            ChoiceRepr::Bare(value) => (value, None),
        };
        let label = label.unwrap_or_else(|| schema::display_value(&value));
        Self { value, label }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_choices_accept_bare_and_labeled_values() {
        let spec: FieldSpec = serde_json::from_value(json!({
            "type": "enum",
            "field": "place",
            "default": "third",
            "values": ["first", {"value": "second", "label": "The middle option"}]
        }))
        .unwrap();

        let values = spec.values.unwrap();
        assert_eq!(values[0].label, "first");
        assert_eq!(values[1].value, json!("second"));
        assert_eq!(values[1].label, "The middle option");
    }

    #[test]
    fn test_default_config_collects_field_defaults() {
        let addon: AddonDefinition = serde_json::from_value(json!({
            "addonId": "a1",
            "name": "Test",
            "slug": "test",
            "requiresChat": false,
            "requiresOverlay": true,
            "configSchema": [
                {"type": "string", "field": "nickname", "default": "Curmudgeon"},
                {"type": "integer", "field": "x", "default": 5, "minValue": 0, "maxValue": 10}
            ]
        }))
        .unwrap();

        assert_eq!(
            addon.default_config(),
            json!({"nickname": "Curmudgeon", "x": 5})
        );
    }
}
