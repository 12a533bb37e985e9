use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

pub const CONTRACT_VERSION: &str = "1.0.0";

/// Extra arguments handed to a behavior's timeout and to the resolving action.
pub type ActionParams = Map<String, Value>;

/// Persisted registry snapshot: callback id -> record.
pub type RawCallbacks = BTreeMap<String, CallbackRecord>;

#[derive(Debug, Clone)]
pub struct SchemaManifest {
    pub name: &'static str,
    pub sha256: &'static str,
    pub body: &'static str,
}

#[derive(Debug, Clone)]
pub struct ContractsManifest {
    pub version: &'static str,
    pub schema_set_sha256: &'static str,
    pub generated_at: &'static str,
    pub schemas: Vec<SchemaManifest>,
}

include!(concat!(env!("OUT_DIR"), "/generated_schemas.rs"));

pub fn contracts_manifest_v1() -> ContractsManifest {
    ContractsManifest {
        version: CONTRACT_VERSION,
        schema_set_sha256: GENERATED_SCHEMA_SET_SHA256,
        generated_at: GENERATED_AT_RFC3339,
        schemas: GENERATED_SCHEMAS
            .iter()
            .map(|(name, sha256, body)| SchemaManifest { name, sha256, body })
            .collect(),
    }
}

pub fn schema_body(name: &str) -> Option<&'static str> {
    GENERATED_SCHEMAS
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, _, body)| *body)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Success,
    Fail,
    Timeout,
}

impl Resolution {
    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::Success => "success",
            Resolution::Fail => "fail",
            Resolution::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One pending callback as stored between session turns.
///
/// `action_params` stays `None` when a record is registered without params;
/// [`CallbackRecord::normalized`] fills both optional payloads with `{}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CallbackRecord {
    pub behavior_id: String,
    pub expire_time: i64,
    #[serde(default)]
    pub scenario_id: Option<String>,
    #[serde(default = "empty_payload", deserialize_with = "payload_or_empty")]
    pub text_preprocessing_result: Value,
    #[serde(default)]
    pub action_params: Option<ActionParams>,
}

impl CallbackRecord {
    pub fn new(behavior_id: impl Into<String>, expire_time: i64) -> Self {
        Self {
            behavior_id: behavior_id.into(),
            expire_time,
            scenario_id: None,
            text_preprocessing_result: empty_payload(),
            action_params: None,
        }
    }

    pub fn normalized(&self) -> Self {
        let text_preprocessing_result = if self.text_preprocessing_result.is_null() {
            empty_payload()
        } else {
            self.text_preprocessing_result.clone()
        };
        Self {
            behavior_id: self.behavior_id.clone(),
            expire_time: self.expire_time,
            scenario_id: self.scenario_id.clone(),
            text_preprocessing_result,
            action_params: Some(self.action_params.clone().unwrap_or_default()),
        }
    }

    pub fn params_or_empty(&self) -> ActionParams {
        self.action_params.clone().unwrap_or_default()
    }
}

pub fn empty_payload() -> Value {
    Value::Object(Map::new())
}

fn payload_or_empty<'de, D>(deserializer: D) -> Result<Value, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(if value.is_null() {
        empty_payload()
    } else {
        value
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_optional_fields_take_defaults() {
        let record: CallbackRecord =
            serde_json::from_value(json!({"behavior_id": "test", "expire_time": 1548079039}))
                .unwrap();
        assert_eq!(record.scenario_id, None);
        assert_eq!(record.text_preprocessing_result, json!({}));
        assert_eq!(record.action_params, None);
    }

    #[test]
    fn null_payload_reads_as_empty_object() {
        let record: CallbackRecord = serde_json::from_value(json!({
            "behavior_id": "test",
            "expire_time": 1,
            "scenario_id": null,
            "text_preprocessing_result": null,
            "action_params": null
        }))
        .unwrap();
        assert_eq!(record.text_preprocessing_result, json!({}));
        assert_eq!(record.action_params, None);
    }

    #[test]
    fn normalized_fills_action_params() {
        let record = CallbackRecord::new("test", 10).normalized();
        assert_eq!(record.action_params, Some(Map::new()));
        let encoded = serde_json::to_value(&record).unwrap();
        assert_eq!(
            encoded,
            json!({
                "behavior_id": "test",
                "expire_time": 10,
                "scenario_id": null,
                "text_preprocessing_result": {},
                "action_params": {}
            })
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = serde_json::from_value::<CallbackRecord>(json!({
            "behavior_id": "test",
            "expire_time": 1,
            "deadline": 5
        }));
        assert!(err.is_err());
    }

    #[test]
    fn embedded_schemas_are_valid_and_accept_snapshots() {
        let manifest = contracts_manifest_v1();
        assert!(!manifest.schemas.is_empty());
        assert_eq!(manifest.schema_set_sha256.len(), 64);
        for schema in &manifest.schemas {
            let value: Value = serde_json::from_str(schema.body).unwrap();
            jsonschema::validator_for(&value)
                .unwrap_or_else(|err| panic!("invalid schema {}: {err}", schema.name));
        }

        let schema: Value =
            serde_json::from_str(schema_body("raw_callbacks.schema.json").unwrap()).unwrap();
        let validator = jsonschema::validator_for(&schema).unwrap();
        let mut raw = RawCallbacks::new();
        let mut record = CallbackRecord::new("test", 2554416000);
        record.scenario_id = Some("test_scen".to_string());
        raw.insert("123".to_string(), record.normalized());
        let instance = serde_json::to_value(&raw).unwrap();
        assert!(validator.is_valid(&instance));

        let broken = json!({"123": {"behavior_id": "test", "expire_time": "soon"}});
        assert!(!validator.is_valid(&broken));
    }

    #[test]
    fn snapshot_schema_wraps_record_schema() {
        let record: Value = serde_json::from_str(CALLBACK_RECORD_SCHEMA).unwrap();
        let snapshot: Value = serde_json::from_str(RAW_CALLBACKS_SCHEMA).unwrap();
        assert_eq!(
            snapshot["additionalProperties"]["properties"],
            record["properties"]
        );
        assert_eq!(
            snapshot["additionalProperties"]["required"],
            record["required"]
        );
        assert_eq!(snapshot["$schema"], record["$schema"]);
        assert_eq!(
            schema_body("raw_callbacks.schema.json"),
            Some(RAW_CALLBACKS_SCHEMA)
        );

        let validator = jsonschema::validator_for(&snapshot).unwrap();
        assert!(!validator.is_valid(&json!({"cb": {"behavior_id": "", "expire_time": 1}})));
    }
}
