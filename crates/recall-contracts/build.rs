use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;

const RECORD_SCHEMA: &str = "callback_record.schema.json";
const SNAPSHOT_SCHEMA: &str = "raw_callbacks.schema.json";

fn main() {
    let manifest_dir =
        PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").expect("CARGO_MANIFEST_DIR"));
    let record_path = manifest_dir.join("../../contracts/v1").join(RECORD_SCHEMA);
    println!("cargo:rerun-if-changed={}", record_path.display());

    let record_text = fs::read_to_string(&record_path)
        .unwrap_or_else(|e| panic!("failed to read {}: {e}", record_path.display()));
    let record: Value = serde_json::from_str(&record_text)
        .unwrap_or_else(|e| panic!("{RECORD_SCHEMA} is not json: {e}"));
    let snapshot = snapshot_schema(&record);

    // Digests cover the rendered bodies, not the source bytes.
    let docs = [
        (RECORD_SCHEMA, render(&record)),
        (SNAPSHOT_SCHEMA, render(&snapshot)),
    ];

    let mut set_hasher = Sha256::new();
    let mut out = String::new();
    out.push_str("pub const GENERATED_SCHEMAS: &[(&str, &str, &str)] = &[\n");
    for (name, body) in &docs {
        set_hasher.update(name.as_bytes());
        set_hasher.update([0]);
        set_hasher.update(body.as_bytes());
        set_hasher.update([0]);
        out.push_str(&format!(
            "    ({name:?}, {:?}, {body:?}),\n",
            sha256_hex(body.as_bytes())
        ));
    }
    out.push_str("];\n");
    out.push_str(&format!(
        "pub const CALLBACK_RECORD_SCHEMA: &str = {:?};\n",
        docs[0].1
    ));
    out.push_str(&format!(
        "pub const RAW_CALLBACKS_SCHEMA: &str = {:?};\n",
        docs[1].1
    ));
    out.push_str(&format!(
        "pub const GENERATED_SCHEMA_SET_SHA256: &str = {:?};\n",
        to_hex(&set_hasher.finalize())
    ));
    out.push_str(&format!(
        "pub const GENERATED_AT_RFC3339: &str = {:?};\n",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
    ));

    let out_path = PathBuf::from(std::env::var("OUT_DIR").expect("OUT_DIR"));
    fs::write(out_path.join("generated_schemas.rs"), out).expect("write generated_schemas.rs");
}

/// Wraps the record schema as the value type of a callback-id keyed map.
fn snapshot_schema(record: &Value) -> Value {
    let mut entry = record.clone();
    if let Some(obj) = entry.as_object_mut() {
        obj.remove("$schema");
        obj.remove("$id");
    }
    let id = record
        .get("$id")
        .and_then(Value::as_str)
        .map(|id| id.replace(RECORD_SCHEMA, SNAPSHOT_SCHEMA))
        .unwrap_or_else(|| SNAPSHOT_SCHEMA.to_string());
    json!({
        "$schema": record.get("$schema").cloned().unwrap_or(Value::Null),
        "$id": id,
        "title": "RawCallbacks",
        "type": "object",
        "additionalProperties": entry,
    })
}

fn render(schema: &Value) -> String {
    serde_json::to_string_pretty(schema).expect("schema renders")
}

fn sha256_hex(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
