//! Declarative validation of driver-specific task config.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::DriverError;

/// Expected JSON type of a config field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    String,
    Bool,
    Integer,
    StringList,
    StringMap,
    /// Map of string to list of strings.
    StringListMap,
}

impl FieldKind {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldKind::String => value.is_string(),
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::StringList => value
                .as_array()
                .is_some_and(|items| items.iter().all(Value::is_string)),
            FieldKind::StringMap => value
                .as_object()
                .is_some_and(|map| map.values().all(Value::is_string)),
            FieldKind::StringListMap => value.as_object().is_some_and(|map| {
                map.values()
                    .all(|v| FieldKind::StringList.matches(v))
            }),
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            FieldKind::String => "a string",
            FieldKind::Bool => "a boolean",
            FieldKind::Integer => "an integer",
            FieldKind::StringList => "a list of strings",
            FieldKind::StringMap => "a map of strings",
            FieldKind::StringListMap => "a map of string lists",
        }
    }
}

/// One accepted config field.
#[derive(Debug, Clone, Copy)]
pub struct ConfigField {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl ConfigField {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

/// Check `config` against `fields`.
///
/// Rejects, naming the offending field: keys not in `fields`, missing
/// required keys, values of the wrong type, and empty required strings.
pub fn validate_config(
    driver: &str,
    config: &Map<String, Value>,
    fields: &[ConfigField],
) -> Result<(), DriverError> {
    let mut unknown: Vec<&String> = config
        .keys()
        .filter(|key| !fields.iter().any(|f| f.name == key.as_str()))
        .collect();
    unknown.sort();
    if let Some(key) = unknown.first() {
        return Err(DriverError::validation(driver, key.as_str(), "unknown field"));
    }

    for field in fields {
        match config.get(field.name) {
            None if field.required => {
                return Err(DriverError::validation(
                    driver,
                    field.name,
                    "missing required field",
                ));
            }
            None => {}
            Some(value) if !field.kind.matches(value) => {
                return Err(DriverError::validation(
                    driver,
                    field.name,
                    format!("expected {}", field.kind.describe()),
                ));
            }
            Some(Value::String(s)) if field.required && s.trim().is_empty() => {
                return Err(DriverError::validation(driver, field.name, "must not be empty"));
            }
            Some(_) => {}
        }
    }
    Ok(())
}

/// Validate and then decode `config` into a typed driver config.
pub fn decode_config<T: DeserializeOwned>(
    driver: &str,
    config: &Map<String, Value>,
    fields: &[ConfigField],
) -> Result<T, DriverError> {
    validate_config(driver, config, fields)?;
    serde_json::from_value(Value::Object(config.clone()))
        .map_err(|e| DriverError::validation(driver, "config", e.to_string()))
}
