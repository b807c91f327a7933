//! Enumerated bot-configuration schema (§4.5, §9 "dynamic config →
//! enumerated schema"). Each `BotType` publishes one of these; instance
//! creation/update validates the caller's JSON config against it once, up
//! front, rather than trusting a free-form map at call time.

use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigValueType {
    String,
    Int,
    Bool,
    Enum(Vec<&'static str>),
    ListString,
    ListEnum(Vec<&'static str>),
}

#[derive(Debug, Clone)]
pub struct ConfigFieldSchema {
    pub value_type: ConfigValueType,
    pub default: serde_json::Value,
    pub required: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigSchema(pub BTreeMap<&'static str, ConfigFieldSchema>);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("missing required config key: {0}")]
    MissingRequired(String),
    #[error("config key `{key}` expects {expected}, got {got}")]
    WrongType {
        key: String,
        expected: String,
        got: String,
    },
}

impl ConfigSchema {
    pub fn new(fields: impl IntoIterator<Item = (&'static str, ConfigFieldSchema)>) -> Self {
        Self(fields.into_iter().collect())
    }

    /// Validates `input` against this schema and returns the config with
    /// defaults filled in for any field the caller omitted. Unknown keys in
    /// `input` are rejected outright.
    pub fn validate(&self, input: &serde_json::Value) -> Result<serde_json::Value, ConfigError> {
        let input_obj = input.as_object().cloned().unwrap_or_default();

        for key in input_obj.keys() {
            if !self.0.contains_key(key.as_str()) {
                return Err(ConfigError::UnknownKey(key.clone()));
            }
        }

        let mut result = serde_json::Map::new();
        for (key, field) in &self.0 {
            match input_obj.get(*key) {
                Some(value) => {
                    check_type(key, &field.value_type, value)?;
                    result.insert(key.to_string(), value.clone());
                }
                None if field.required => {
                    return Err(ConfigError::MissingRequired(key.to_string()));
                }
                None => {
                    result.insert(key.to_string(), field.default.clone());
                }
            }
        }

        Ok(serde_json::Value::Object(result))
    }
}

fn check_type(
    key: &str,
    value_type: &ConfigValueType,
    value: &serde_json::Value,
) -> Result<(), ConfigError> {
    let matches = match value_type {
        ConfigValueType::String => value.is_string(),
        ConfigValueType::Int => value.is_i64() || value.is_u64(),
        ConfigValueType::Bool => value.is_boolean(),
        ConfigValueType::Enum(variants) => value
            .as_str()
            .map(|s| variants.contains(&s))
            .unwrap_or(false),
        ConfigValueType::ListString => value
            .as_array()
            .map(|arr| arr.iter().all(|v| v.is_string()))
            .unwrap_or(false),
        ConfigValueType::ListEnum(variants) => value
            .as_array()
            .map(|arr| {
                arr.iter()
                    .all(|v| v.as_str().map(|s| variants.contains(&s)).unwrap_or(false))
            })
            .unwrap_or(false),
    };

    if matches {
        Ok(())
    } else {
        Err(ConfigError::WrongType {
            key: key.to_string(),
            expected: format!("{value_type:?}"),
            got: value.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> ConfigSchema {
        ConfigSchema::new([
            (
                "prefix",
                ConfigFieldSchema {
                    value_type: ConfigValueType::String,
                    default: serde_json::json!("[ai]"),
                    required: false,
                },
            ),
            (
                "translate_images",
                ConfigFieldSchema {
                    value_type: ConfigValueType::Bool,
                    default: serde_json::json!(false),
                    required: false,
                },
            ),
            (
                "source_languages",
                ConfigFieldSchema {
                    value_type: ConfigValueType::ListString,
                    default: serde_json::json!(["en", "pt"]),
                    required: false,
                },
            ),
        ])
    }

    #[test]
    fn fills_defaults_for_omitted_keys() {
        let schema = sample_schema();
        let result = schema.validate(&serde_json::json!({})).unwrap();
        assert_eq!(result["prefix"], serde_json::json!("[ai]"));
        assert_eq!(result["translate_images"], serde_json::json!(false));
    }

    #[test]
    fn rejects_unknown_keys() {
        let schema = sample_schema();
        let err = schema
            .validate(&serde_json::json!({"nonexistent": true}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownKey(k) if k == "nonexistent"));
    }

    #[test]
    fn rejects_wrong_type() {
        let schema = sample_schema();
        let err = schema
            .validate(&serde_json::json!({"translate_images": "yes"}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::WrongType { .. }));
    }

    #[test]
    fn accepts_valid_override() {
        let schema = sample_schema();
        let result = schema
            .validate(&serde_json::json!({"prefix": "[bot]"}))
            .unwrap();
        assert_eq!(result["prefix"], serde_json::json!("[bot]"));
    }

    #[test]
    fn enum_field_rejects_non_member_value() {
        let schema = ConfigSchema::new([(
            "mode",
            ConfigFieldSchema {
                value_type: ConfigValueType::Enum(vec!["en", "pt"]),
                default: serde_json::json!("en"),
                required: false,
            },
        )]);
        assert!(schema.validate(&serde_json::json!({"mode": "fr"})).is_err());
        assert!(schema.validate(&serde_json::json!({"mode": "pt"})).is_ok());
    }

    #[test]
    fn list_enum_rejects_non_member_entries() {
        let schema = ConfigSchema::new([(
            "source_languages",
            ConfigFieldSchema {
                value_type: ConfigValueType::ListEnum(vec!["en", "pt"]),
                default: serde_json::json!(["en", "pt"]),
                required: false,
            },
        )]);
        assert!(
            schema
                .validate(&serde_json::json!({"source_languages": ["en", "fr"]}))
                .is_err()
        );
        assert!(
            schema
                .validate(&serde_json::json!({"source_languages": ["pt"]}))
                .is_ok()
        );
    }

    #[test]
    fn missing_required_key_is_an_error() {
        let schema = ConfigSchema::new([(
            "prefix",
            ConfigFieldSchema {
                value_type: ConfigValueType::String,
                default: serde_json::json!(null),
                required: true,
            },
        )]);
        assert!(matches!(
            schema.validate(&serde_json::json!({})),
            Err(ConfigError::MissingRequired(_))
        ));
    }
}
