//! Storage document → record, the inverse of [`crate::transform`].
//!
//! Nested objects are built as embedded records; scalar values in a record
//! typed field are treated as linked ids and fetched through a
//! [`LinkResolver`]. A dangling id becomes null (or is dropped from a list).

use crate::document::{self, json_type_name, Document, CREATED_AT, DELETED_AT, ID, UPDATED_AT};
use crate::error::{DocMapError, Result};
use crate::record::{Record, Value};
use crate::schema::{BaseType, FieldDescriptor, RecordSchema, ScalarType, Schema, SYSTEM_FIELDS};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Point reads of linked records during a build.
pub trait LinkResolver {
    fn resolve(&self, type_name: &str, id: &str) -> Result<Option<Record>>;
}

/// Build a top-level record of `type_name` from a stored document.
pub fn from_document(
    schema: &Schema,
    type_name: &str,
    doc: &Document,
    resolver: &dyn LinkResolver,
) -> Result<Record> {
    let record_schema = schema.get(type_name)?;
    build_record(schema, record_schema, doc, resolver, false)
}

fn build_record(
    schema: &Schema,
    record_schema: &Arc<RecordSchema>,
    doc: &Document,
    resolver: &dyn LinkResolver,
    embedded: bool,
) -> Result<Record> {
    let mut record = Record::empty(record_schema.clone());

    if !embedded {
        let id = match doc.get(ID) {
            None | Some(JsonValue::Null) => None,
            Some(JsonValue::String(s)) => Some(s.clone()),
            Some(JsonValue::Number(n)) => Some(n.to_string()),
            Some(other) => return Err(system_mismatch(record_schema, ID, "string", other)),
        };
        record.set_system(
            id,
            timestamp(record_schema, doc, CREATED_AT)?,
            timestamp(record_schema, doc, UPDATED_AT)?,
            timestamp(record_schema, doc, DELETED_AT)?,
        );
    }

    for (index, field) in record_schema.fields().iter().enumerate() {
        let raw = doc.get(&field.name).unwrap_or(&JsonValue::Null);
        let value = decode_field(schema, record_schema, field, raw, resolver)?;
        record.put(index, value);
    }

    for key in doc.keys() {
        if record_schema.field(key).is_none() && !SYSTEM_FIELDS.contains(&key.as_str()) {
            log::warn!("Ignoring undeclared key '{key}' in {} document", record_schema.name());
        }
    }

    Ok(record)
}

fn timestamp(
    owner: &RecordSchema,
    doc: &Document,
    key: &str,
) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    document::decode_timestamp(doc.get(key)).map_err(|found| DocMapError::TypeMismatch {
        record: owner.name().to_string(),
        field: key.to_string(),
        expected: "datetime".into(),
        found,
    })
}

fn decode_field(
    schema: &Schema,
    owner: &RecordSchema,
    field: &FieldDescriptor,
    raw: &JsonValue,
    resolver: &dyn LinkResolver,
) -> Result<Value> {
    if raw.is_null() {
        return Ok(Value::Null);
    }

    if field.is_list() {
        let items = raw
            .as_array()
            .ok_or_else(|| field_mismatch(owner, field, raw))?;
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            if let Some(value) = decode_element(schema, owner, field, item, resolver)? {
                values.push(value);
            }
        }
        return Ok(Value::List(values));
    }

    Ok(decode_element(schema, owner, field, raw, resolver)?.unwrap_or(Value::Null))
}

/// `None` means a linked id that no longer resolves.
fn decode_element(
    schema: &Schema,
    owner: &RecordSchema,
    field: &FieldDescriptor,
    raw: &JsonValue,
    resolver: &dyn LinkResolver,
) -> Result<Option<Value>> {
    let target = match &field.base {
        BaseType::Scalar(scalar) => return decode_scalar(owner, field, *scalar, raw).map(Some),
        BaseType::Record(target) => target,
    };

    let id = match raw {
        JsonValue::Object(nested) => {
            let target_schema = schema.get(target)?;
            let embedded = build_record(schema, target_schema, nested, resolver, true)?;
            return Ok(Some(Value::from(embedded)));
        }
        JsonValue::String(s) => s.clone(),
        JsonValue::Number(n) => n.to_string(),
        other => return Err(field_mismatch(owner, field, other)),
    };

    match resolver.resolve(target, &id)? {
        Some(linked) => Ok(Some(Value::from(linked))),
        None => {
            log::warn!(
                "Linked {target} '{id}' referenced by {}.{} no longer exists",
                owner.name(),
                field.name
            );
            Ok(None)
        }
    }
}

fn decode_scalar(
    owner: &RecordSchema,
    field: &FieldDescriptor,
    scalar: ScalarType,
    raw: &JsonValue,
) -> Result<Value> {
    let value = match (scalar, raw) {
        (ScalarType::String, JsonValue::String(s)) => Some(Value::String(s.clone())),
        (ScalarType::Int, JsonValue::Number(n)) => n.as_i64().map(Value::Int),
        (ScalarType::Float, JsonValue::Number(n)) => n.as_f64().map(Value::Float),
        (ScalarType::Bool, JsonValue::Bool(b)) => Some(Value::Bool(*b)),
        (ScalarType::DateTime, JsonValue::String(_)) => {
            document::decode_timestamp(Some(raw)).ok().flatten().map(Value::DateTime)
        }
        (ScalarType::Json, other) => Some(Value::Json(other.clone())),
        _ => None,
    };
    value.ok_or_else(|| field_mismatch(owner, field, raw))
}

fn field_mismatch(owner: &RecordSchema, field: &FieldDescriptor, raw: &JsonValue) -> DocMapError {
    DocMapError::TypeMismatch {
        record: owner.name().to_string(),
        field: field.name.clone(),
        expected: field.type_label(),
        found: format!("stored {}", json_type_name(raw)),
    }
}

fn system_mismatch(owner: &RecordSchema, key: &str, expected: &str, raw: &JsonValue) -> DocMapError {
    DocMapError::TypeMismatch {
        record: owner.name().to_string(),
        field: key.to_string(),
        expected: expected.to_string(),
        found: format!("stored {}", json_type_name(raw)),
    }
}
