//! Configuration schema compiler
//!
//! [`compile`] checks an addon's declared settings once, at load time, and
//! produces a [`Validator`] that can judge any number of submitted
//! configurations. Every violation in a submission is reported, one message
//! per offending field, in schema order.
//!
//! | type             | accepted values                                  |
//! |------------------|--------------------------------------------------|
//! | `string`         | any JSON string                                  |
//! | `boolean`        | `true` / `false`                                 |
//! | `integer`        | integral numbers, optional inclusive bounds      |
//! | `integer-slider` | as `integer`, bounds required, step is UI only   |
//! | `float`          | any number, optional inclusive bounds            |
//! | `float-slider`   | as `float`, bounds required, step is UI only     |
//! | `enum`           | one of the configured values                     |

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value};

use super::{AddonDefinition, FieldSpec};
use crate::types::{Result, RuinousError};

/// The recognised `type` tags of a [`FieldSpec`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Boolean,
    Integer,
    IntegerSlider,
    Float,
    FloatSlider,
    Enum,
}

impl FromStr for FieldType {
    type Err = RuinousError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "string" => Ok(Self::String),
            "boolean" | "bool" => Ok(Self::Boolean),
            "integer" | "int" => Ok(Self::Integer),
            "integer-slider" | "int-slider" => Ok(Self::IntegerSlider),
            "float" => Ok(Self::Float),
            "float-slider" => Ok(Self::FloatSlider),
            "enum" => Ok(Self::Enum),
            other => Err(RuinousError::Config(format!("unknown field type '{other}'"))),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Integer => "integer",
            Self::IntegerSlider => "integer-slider",
            Self::Float => "float",
            Self::FloatSlider => "float-slider",
            Self::Enum => "enum",
        };
        f.write_str(tag)
    }
}

/// Compiled validation rule for one setting
#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    String,
    Boolean {
        labels: Option<Vec<String>>,
    },
    Integer {
        min: Option<f64>,
        max: Option<f64>,
    },
    IntegerSlider {
        min: f64,
        max: f64,
        step: f64,
    },
    Float {
        min: Option<f64>,
        max: Option<f64>,
    },
    FloatSlider {
        min: f64,
        max: f64,
        step: f64,
    },
    Enum {
        allowed: Vec<Value>,
    },
}

impl FieldRule {
    /// Check a single value, returning the reason it is rejected
    pub fn check(&self, value: &Value) -> Option<String> {
        match self {
            Self::String => (!value.is_string()).then(|| "is not a string".to_string()),
            Self::Boolean { .. } => (!value.is_boolean()).then(|| "is not a boolean".to_string()),
            Self::Integer { min, max } => {
                if !is_integral(value) {
                    return Some("is not an integer".to_string());
                }
                check_bounds(value, *min, *max)
            }
            Self::IntegerSlider { min, max, .. } => {
                if !is_integral(value) {
                    return Some("is not an integer".to_string());
                }
                check_bounds(value, Some(*min), Some(*max))
            }
            Self::Float { min, max } => {
                if !value.is_number() {
                    return Some("is not a number".to_string());
                }
                check_bounds(value, *min, *max)
            }
            Self::FloatSlider { min, max, .. } => {
                if !value.is_number() {
                    return Some("is not a number".to_string());
                }
                check_bounds(value, Some(*min), Some(*max))
            }
            Self::Enum { allowed } => {
                if allowed.iter().any(|candidate| values_equal(candidate, value)) {
                    return None;
                }
                let listed: Vec<String> = allowed.iter().map(display_value).collect();
                Some(format!("is not one of: [{}]", listed.join(", ")))
            }
        }
    }
}

/// A compiled setting: its key, rule and default
#[derive(Debug, Clone)]
pub struct CompiledField {
    pub field: String,
    pub rule: FieldRule,
    pub default: Value,
}

/// Outcome of validating one candidate configuration
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid,
    Invalid(Vec<String>),
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Field errors, empty when valid
    pub fn errors(&self) -> &[String] {
        match self {
            Self::Valid => &[],
            Self::Invalid(errors) => errors,
        }
    }

    pub fn into_result(self) -> Result<()> {
        match self {
            Self::Valid => Ok(()),
            Self::Invalid(errors) => Err(RuinousError::Validation(errors)),
        }
    }
}

/// Reusable, immutable validator for one addon's configuration
#[derive(Debug, Clone)]
pub struct Validator {
    addon_id: String,
    fields: Vec<CompiledField>,
}

impl Validator {
    pub fn addon_id(&self) -> &str {
        &self.addon_id
    }

    pub fn fields(&self) -> &[CompiledField] {
        &self.fields
    }

    /// Validate a candidate configuration, collecting every violation
    pub fn validate(&self, candidate: &Value) -> ValidationResult {
        let Some(object) = candidate.as_object() else {
            return ValidationResult::Invalid(vec!["config is not an object".to_string()]);
        };

        let mut errors = Vec::new();
        for compiled in &self.fields {
            match object.get(&compiled.field) {
                None => errors.push(format!("{} is required", compiled.field)),
                Some(value) => {
                    if let Some(reason) = compiled.rule.check(value) {
                        errors.push(format!("{} {}", compiled.field, reason));
                    }
                }
            }
        }

        // Writes replace the stored config wholesale, so unknown keys would
        // otherwise be persisted forever
        for key in object.keys() {
            if !self.fields.iter().any(|compiled| &compiled.field == key) {
                errors.push(format!("{key} is not a known setting"));
            }
        }

        if errors.is_empty() {
            ValidationResult::Valid
        } else {
            ValidationResult::Invalid(errors)
        }
    }

    /// The configuration built from every field's default
    pub fn defaults(&self) -> Value {
        let config: Map<String, Value> = self
            .fields
            .iter()
            .map(|compiled| (compiled.field.clone(), compiled.default.clone()))
            .collect();
        Value::Object(config)
    }
}

/// Compile an addon's declared settings into a validator
///
/// Fails on the first malformed [`FieldSpec`], naming the addon and field.
pub fn compile(addon: &AddonDefinition) -> Result<Validator> {
    let mut seen = HashSet::new();
    let mut fields = Vec::with_capacity(addon.config_schema.len());

    for spec in &addon.config_schema {
        let compiled = compile_field(spec).map_err(|e| {
            RuinousError::Config(format!(
                "addon '{}' field '{}': {}",
                addon.slug,
                spec.field,
                config_reason(e)
            ))
        })?;

        if !seen.insert(compiled.field.clone()) {
            return Err(RuinousError::Config(format!(
                "addon '{}' declares field '{}' more than once",
                addon.slug, compiled.field
            )));
        }
        fields.push(compiled);
    }

    Ok(Validator {
        addon_id: addon.addon_id.clone(),
        fields,
    })
}

fn compile_field(spec: &FieldSpec) -> Result<CompiledField> {
    if spec.field.trim().is_empty() {
        return Err(RuinousError::Config("field name is empty".into()));
    }

    let kind: FieldType = spec.kind.parse()?;
    let rule = match kind {
        FieldType::String => FieldRule::String,
        FieldType::Boolean => {
            if let Some(labels) = &spec.labels {
                if labels.len() != 2 {
                    return Err(RuinousError::Config(format!(
                        "boolean labels need exactly two entries, got {}",
                        labels.len()
                    )));
                }
            }
            FieldRule::Boolean {
                labels: spec.labels.clone(),
            }
        }
        FieldType::Integer => FieldRule::Integer {
            min: spec.min_value,
            max: spec.max_value,
        },
        FieldType::Float => FieldRule::Float {
            min: spec.min_value,
            max: spec.max_value,
        },
        FieldType::IntegerSlider | FieldType::FloatSlider => {
            let (Some(min), Some(max), Some(step)) =
                (spec.min_value, spec.max_value, spec.step_value)
            else {
                return Err(RuinousError::Config(format!(
                    "{kind} requires minValue, maxValue and stepValue"
                )));
            };
            if step <= 0.0 {
                return Err(RuinousError::Config("stepValue must be positive".into()));
            }
            if kind == FieldType::IntegerSlider {
                FieldRule::IntegerSlider { min, max, step }
            } else {
                FieldRule::FloatSlider { min, max, step }
            }
        }
        FieldType::Enum => {
            let allowed: Vec<Value> = spec
                .values
                .as_deref()
                .unwrap_or_default()
                .iter()
                .map(|choice| choice.value.clone())
                .collect();
            if allowed.is_empty() {
                return Err(RuinousError::Config("enum requires at least one value".into()));
            }
            FieldRule::Enum { allowed }
        }
    };

    if let (Some(min), Some(max)) = (spec.min_value, spec.max_value) {
        if min > max {
            return Err(RuinousError::Config(format!(
                "minValue {} is greater than maxValue {}",
                display_number(min),
                display_number(max)
            )));
        }
    }

    if let Some(reason) = rule.check(&spec.default) {
        return Err(RuinousError::Config(format!("default value {reason}")));
    }

    Ok(CompiledField {
        field: spec.field.clone(),
        rule,
        default: spec.default.clone(),
    })
}

fn config_reason(err: RuinousError) -> String {
    match err {
        RuinousError::Config(reason) => reason,
        other => other.to_string(),
    }
}

fn is_integral(value: &Value) -> bool {
    match value {
        Value::Number(n) if n.is_i64() || n.is_u64() => true,
        Value::Number(n) => n.as_f64().is_some_and(|f| f.is_finite() && f.fract() == 0.0),
        _ => false,
    }
}

fn check_bounds(value: &Value, min: Option<f64>, max: Option<f64>) -> Option<String> {
    let number = value.as_f64()?;
    if let Some(min) = min {
        if number < min {
            return Some(format!("needs to be at least {}", display_number(min)));
        }
    }
    if let Some(max) = max {
        if number > max {
            return Some(format!("needs to be at most {}", display_number(max)));
        }
    }
    None
}

/// Numbers compare by value so that `5` and `5.0` are the same enum entry
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn display_number(n: f64) -> String {
    format!("{n}")
}

/// Render a JSON value for error messages and labels (strings unquoted)
pub(crate) fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
