use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

/// Longest callback wait a behavior may configure (ten years).
pub const MAX_TIMEOUT_SECS: i64 = 315_360_000;

pub const MAX_EXPIRATION_DELAY_SECS: i64 = 86_400;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub registry: Registry,
    #[serde(default)]
    pub audit: Audit,
    pub behaviors: BTreeMap<String, Behavior>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registry {
    #[serde(default = "default_expiration_delay_secs")]
    pub expiration_delay_secs: i64,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            expiration_delay_secs: default_expiration_delay_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Audit {
    #[serde(default)]
    pub jsonl_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Behavior {
    pub timeout_secs: i64,
    /// Key in the action params whose integer value replaces `timeout_secs`.
    #[serde(default)]
    pub timeout_param: Option<String>,
    pub success: ActionSpec,
    pub fail: ActionSpec,
    pub timeout: ActionSpec,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Noop,
    Log,
    Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionSpec {
    pub kind: ActionKind,
    #[serde(default)]
    pub reason_code: Option<String>,
}

fn default_expiration_delay_secs() -> i64 {
    1
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    parse_and_validate(&config_text)
}

pub fn parse_and_validate(config_text: &str) -> Result<Config, ConfigError> {
    let value: serde_yaml::Value =
        serde_yaml::from_str(config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.behaviors.is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "behaviors must declare at least one behavior".to_string(),
        ));
    }
    if !(0..=MAX_EXPIRATION_DELAY_SECS).contains(&cfg.registry.expiration_delay_secs) {
        return Err(ConfigError::UnsupportedConfig(format!(
            "registry.expiration_delay_secs must be within 0..={MAX_EXPIRATION_DELAY_SECS}"
        )));
    }
    let audit_configured = cfg
        .audit
        .jsonl_path
        .as_ref()
        .map(|v| !v.trim().is_empty())
        .unwrap_or(false);

    for (name, behavior) in &cfg.behaviors {
        if !(0..=MAX_TIMEOUT_SECS).contains(&behavior.timeout_secs) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "behaviors.{name}.timeout_secs must be within 0..={MAX_TIMEOUT_SECS}"
            )));
        }
        if let Some(param) = &behavior.timeout_param {
            if param.trim().is_empty() {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "behaviors.{name}.timeout_param must not be empty"
                )));
            }
        }
        let actions = [
            ("success", &behavior.success),
            ("fail", &behavior.fail),
            ("timeout", &behavior.timeout),
        ];
        for (slot, spec) in actions {
            if spec.kind == ActionKind::Audit && !audit_configured {
                return Err(ConfigError::UnsupportedConfig(format!(
                    "behaviors.{name}.{slot} uses kind=audit but audit.jsonl_path is not set"
                )));
            }
        }
    }
    Ok(())
}
