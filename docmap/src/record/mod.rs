//! In-memory record instances and their field values.

use crate::error::{DocMapError, Result};
use crate::schema::{BaseType, FieldDescriptor, RecordSchema, ScalarType};
use crate::validation;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A field value held by a [`Record`].
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<Utc>),
    Json(serde_json::Value),
    List(Vec<Value>),
    Record(Box<Record>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(ts) => Some(*ts),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    /// Name of the value's runtime type, for error messages.
    pub fn kind_name(&self) -> String {
        match self {
            Value::Null => "null".into(),
            Value::Bool(_) => "bool".into(),
            Value::Int(_) => "int".into(),
            Value::Float(_) => "float".into(),
            Value::String(_) => "string".into(),
            Value::DateTime(_) => "datetime".into(),
            Value::Json(_) => "json".into(),
            Value::List(_) => "list".into(),
            Value::Record(r) => r.type_name().to_string(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl From<Record> for Value {
    fn from(v: Record) -> Self {
        Value::Record(Box::new(v))
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A typed record: one value per declared field plus the system fields.
///
/// A record starts transient (`id` is `None`) and becomes persisted once a
/// [`crate::Session`] saves it.
#[derive(Debug, Clone)]
pub struct Record {
    schema: Arc<RecordSchema>,
    id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    values: Vec<Value>,
    /// Collections attached by `Session::join`, keyed by collection name. Never persisted.
    joined: BTreeMap<String, Vec<Record>>,
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.schema.name() == other.schema.name()
            && self.id == other.id
            && self.created_at == other.created_at
            && self.updated_at == other.updated_at
            && self.deleted_at == other.deleted_at
            && self.values == other.values
    }
}

impl Record {
    /// A record with every declared field set to null.
    pub(crate) fn empty(schema: Arc<RecordSchema>) -> Self {
        let values = vec![Value::Null; schema.fields().len()];
        Record {
            schema,
            id: None,
            created_at: None,
            updated_at: None,
            deleted_at: None,
            values,
            joined: BTreeMap::new(),
        }
    }

    pub fn schema(&self) -> &Arc<RecordSchema> {
        &self.schema
    }

    pub fn type_name(&self) -> &str {
        self.schema.name()
    }

    pub fn collection(&self) -> &str {
        self.schema.collection()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }

    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    pub fn get(&self, name: &str) -> Result<&Value> {
        let index = self.position(name)?;
        Ok(&self.values[index])
    }

    /// Assign one field. The value is type-checked first; on failure the
    /// record is left exactly as it was.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.position(name)?;
        let descriptor = &self.schema.fields()[index];
        let value = coerce(descriptor, value.into());
        validation::check_type(&self.schema, descriptor, &value)?;
        self.values[index] = value;
        Ok(())
    }

    /// Declared fields paired with their current values, in declaration order.
    pub fn fields(&self) -> impl Iterator<Item = (&FieldDescriptor, &Value)> {
        self.schema.fields().iter().zip(self.values.iter())
    }

    /// Records attached by a join, by the joined type's collection name.
    pub fn joined(&self, collection: &str) -> Option<&[Record]> {
        self.joined.get(collection).map(Vec::as_slice)
    }

    fn position(&self, name: &str) -> Result<usize> {
        self.schema
            .position(name)
            .ok_or_else(|| DocMapError::UnknownField {
                record: self.schema.name().to_string(),
                field: name.to_string(),
            })
    }

    pub(crate) fn put(&mut self, index: usize, value: Value) {
        self.values[index] = value;
    }

    pub(crate) fn set_system(
        &mut self,
        id: Option<String>,
        created_at: Option<DateTime<Utc>>,
        updated_at: Option<DateTime<Utc>>,
        deleted_at: Option<DateTime<Utc>>,
    ) {
        self.id = id;
        self.created_at = created_at;
        self.updated_at = updated_at;
        self.deleted_at = deleted_at;
    }

    pub(crate) fn mark_inserted(&mut self, id: String, at: DateTime<Utc>) {
        self.id = Some(id);
        self.created_at = Some(at);
        self.updated_at = None;
        self.deleted_at = None;
    }

    pub(crate) fn mark_updated(&mut self, at: DateTime<Utc>) {
        self.updated_at = Some(at);
    }

    pub(crate) fn mark_deleted(&mut self, at: Option<DateTime<Utc>>) {
        if at.is_some() {
            self.deleted_at = at;
        }
        self.id = None;
    }

    pub(crate) fn set_joined(&mut self, collection: &str, records: Vec<Record>) {
        self.joined.insert(collection.to_string(), records);
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name(), self.id().unwrap_or("unsaved"))
    }
}

/// Ints assigned to float fields are stored as floats so that a save/fetch
/// cycle returns the same value.
fn coerce(descriptor: &FieldDescriptor, value: Value) -> Value {
    if descriptor.base != BaseType::Scalar(ScalarType::Float) {
        return value;
    }
    match value {
        Value::Int(i) => Value::Float(i as f64),
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| match item {
                    Value::Int(i) => Value::Float(i as f64),
                    other => other,
                })
                .collect(),
        ),
        other => other,
    }
}

/// Collects field values and validates them once in [`RecordBuilder::build`].
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    schema: Arc<RecordSchema>,
    id: Option<String>,
    values: Vec<(String, Value)>,
}

impl RecordBuilder {
    pub fn new(schema: Arc<RecordSchema>) -> Self {
        RecordBuilder {
            schema,
            id: None,
            values: Vec::new(),
        }
    }

    /// Refer to an already stored record.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.push((name.into(), value.into()));
        self
    }

    pub fn build(self) -> Result<Record> {
        let mut record = Record::empty(self.schema);
        record.id = self.id;
        for (name, value) in self.values {
            record.set(&name, value)?;
        }
        Ok(record)
    }
}
