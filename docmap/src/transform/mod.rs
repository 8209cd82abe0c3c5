//! Record → storage document.
//!
//! Linked records are flattened to their id, embedded records become nested
//! objects without any system field, lists are handled element-wise.

use crate::document::{self, Document, CREATED_AT, DELETED_AT, ID, UPDATED_AT};
use crate::error::{DocMapError, Result};
use crate::record::{Record, Value};
use crate::schema::{FieldDescriptor, RecordSchema};
use serde_json::Value as JsonValue;

/// The storage form of a top-level record. `id` is only present once assigned.
pub fn to_document(record: &Record) -> Result<Document> {
    let mut doc = encode_fields(record)?;
    if let Some(id) = record.id() {
        doc.insert(ID.into(), JsonValue::String(id.to_string()));
    }
    doc.insert(CREATED_AT.into(), document::encode_timestamp(record.created_at()));
    doc.insert(UPDATED_AT.into(), document::encode_timestamp(record.updated_at()));
    doc.insert(DELETED_AT.into(), document::encode_timestamp(record.deleted_at()));
    Ok(doc)
}

/// The stored representation of a single field value.
pub fn encode_field(owner: &RecordSchema, field: &FieldDescriptor, value: &Value) -> Result<JsonValue> {
    match value {
        Value::Null => Ok(JsonValue::Null),
        Value::Bool(b) => Ok(JsonValue::Bool(*b)),
        Value::Int(i) => Ok(JsonValue::from(*i)),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .ok_or_else(|| DocMapError::TypeMismatch {
                record: owner.name().to_string(),
                field: field.name.clone(),
                expected: "finite float".into(),
                found: f.to_string(),
            }),
        Value::String(s) => Ok(JsonValue::String(s.clone())),
        Value::DateTime(ts) => Ok(document::encode_timestamp(Some(*ts))),
        Value::Json(raw) => Ok(raw.clone()),
        Value::List(items) => items
            .iter()
            .map(|item| encode_field(owner, field, item))
            .collect::<Result<Vec<_>>>()
            .map(JsonValue::Array),
        Value::Record(target) if field.is_linked() => match target.id() {
            Some(id) => Ok(JsonValue::String(id.to_string())),
            None => Err(DocMapError::UnsavedLink {
                record: owner.name().to_string(),
                field: field.name.clone(),
            }),
        },
        Value::Record(target) => encode_fields(target).map(JsonValue::Object),
    }
}

/// Declared fields only; used directly for embedded records.
fn encode_fields(record: &Record) -> Result<Document> {
    let mut doc = Document::new();
    for (field, value) in record.fields() {
        doc.insert(field.name.clone(), encode_field(record.schema(), field, value)?);
    }
    Ok(doc)
}
