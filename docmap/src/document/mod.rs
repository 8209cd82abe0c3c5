// Raw documents as exchanged with the backing store

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::Value as JsonValue;

/// A raw stored document: a JSON object keyed by field name.
pub type Document = serde_json::Map<String, JsonValue>;

pub const ID: &str = "id";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const DELETED_AT: &str = "deleted_at";

/// The document's id, when it has a string one.
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID).and_then(JsonValue::as_str)
}

/// True when the document carries a non-null `deleted_at`.
pub fn is_soft_deleted(doc: &Document) -> bool {
    doc.get(DELETED_AT).map_or(false, |v| !v.is_null())
}

pub fn encode_timestamp(value: Option<DateTime<Utc>>) -> JsonValue {
    match value {
        Some(ts) => JsonValue::String(ts.to_rfc3339_opts(SecondsFormat::Micros, true)),
        None => JsonValue::Null,
    }
}

/// Decode an RFC 3339 timestamp; null or absent yields `None`.
pub fn decode_timestamp(value: Option<&JsonValue>) -> std::result::Result<Option<DateTime<Utc>>, String> {
    match value {
        None | Some(JsonValue::Null) => Ok(None),
        Some(JsonValue::String(s)) => DateTime::parse_from_rfc3339(s)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| format!("invalid timestamp '{s}': {e}")),
        Some(other) => Err(format!("expected timestamp string, got {other}")),
    }
}

/// Short name of a JSON value's kind, for error messages.
pub fn json_type_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "list",
        JsonValue::Object(_) => "object",
    }
}
