use super::types::{FieldDecl, Modifier, RecordDecl, SchemaDecl};
use crate::error::{DocMapError, Result};
use crate::record::RecordBuilder;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Fields every record carries implicitly. They cannot be declared.
pub const SYSTEM_FIELDS: [&str; 4] = ["id", "created_at", "updated_at", "deleted_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    String,
    Int,
    Float,
    Bool,
    DateTime,
    /// Free-form JSON, stored as-is.
    Json,
}

impl ScalarType {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "string" | "str" => Some(ScalarType::String),
            "int" | "integer" => Some(ScalarType::Int),
            "float" | "number" => Some(ScalarType::Float),
            "bool" | "boolean" => Some(ScalarType::Bool),
            "datetime" => Some(ScalarType::DateTime),
            "json" => Some(ScalarType::Json),
            _ => None,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ScalarType::String => "string",
            ScalarType::Int => "int",
            ScalarType::Float => "float",
            ScalarType::Bool => "bool",
            ScalarType::DateTime => "datetime",
            ScalarType::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BaseType {
    Scalar(ScalarType),
    /// Another record type, embedded or linked by id.
    Record(String),
}

impl fmt::Display for BaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BaseType::Scalar(scalar) => f.write_str(scalar.name()),
            BaseType::Record(name) => f.write_str(name),
        }
    }
}

/// Normalized declaration of one field: base type plus modifiers in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub base: BaseType,
    pub modifiers: Vec<Modifier>,
}

impl FieldDescriptor {
    pub fn has(&self, modifier: Modifier) -> bool {
        self.modifiers.contains(&modifier)
    }

    pub fn is_linked(&self) -> bool {
        self.has(Modifier::Linked)
    }

    pub fn is_list(&self) -> bool {
        self.has(Modifier::List)
    }

    pub fn record_type(&self) -> Option<&str> {
        match &self.base {
            BaseType::Record(name) => Some(name),
            BaseType::Scalar(_) => None,
        }
    }

    /// Human readable type, e.g. `list<User>`.
    pub fn type_label(&self) -> String {
        if self.is_list() {
            format!("list<{}>", self.base)
        } else {
            self.base.to_string()
        }
    }
}

/// The normalized schema of one record type.
#[derive(Debug, Clone)]
pub struct RecordSchema {
    name: String,
    collection: String,
    parent: Option<String>,
    fields: Vec<FieldDescriptor>,
    indexes: Vec<String>,
}

impl RecordSchema {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Physical collection the records are stored in.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn indexes(&self) -> &[String] {
        &self.indexes
    }

    /// The first linked field whose record type is `target`.
    pub fn field_targeting(&self, target: &str) -> Option<&FieldDescriptor> {
        self.fields
            .iter()
            .find(|f| f.is_linked() && f.record_type() == Some(target))
    }
}

/// All normalized record types, built once and shared behind an `Arc`.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    records: HashMap<String, Arc<RecordSchema>>,
    order: Vec<String>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::new()
    }

    pub fn from_decl(decl: SchemaDecl) -> Result<Self> {
        let mut builder = SchemaBuilder::new();
        for (name, record) in decl.records {
            builder = builder.record(name, record);
        }
        builder.build()
    }

    /// Parse and normalize a YAML schema document.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Self::from_decl(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    pub fn get(&self, name: &str) -> Result<&Arc<RecordSchema>> {
        self.records
            .get(name)
            .ok_or_else(|| DocMapError::UnknownRecordType(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    /// Record types in declaration order.
    pub fn records(&self) -> impl Iterator<Item = &Arc<RecordSchema>> {
        self.order.iter().filter_map(|name| self.records.get(name))
    }

    /// Start building an in-memory record of the given type.
    pub fn record(&self, name: &str) -> Result<RecordBuilder> {
        Ok(RecordBuilder::new(self.get(name)?.clone()))
    }
}

/// Collects record declarations and normalizes them in one pass.
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    decls: Vec<(String, RecordDecl)>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(mut self, name: impl Into<String>, decl: RecordDecl) -> Self {
        self.decls.push((name.into(), decl));
        self
    }

    pub fn build(self) -> Result<Schema> {
        let mut decls: HashMap<&str, &RecordDecl> = HashMap::new();
        for (name, decl) in &self.decls {
            if name.trim().is_empty() {
                return Err(DocMapError::Schema("record type name cannot be empty".into()));
            }
            if decls.insert(name.as_str(), decl).is_some() {
                return Err(DocMapError::Schema(format!(
                    "record type '{name}' is declared twice"
                )));
            }
        }

        let mut resolved: HashMap<String, Vec<FieldDescriptor>> = HashMap::new();
        for (name, _) in &self.decls {
            resolve_fields(name, &decls, &mut resolved, &mut Vec::new())?;
        }

        let mut records = HashMap::new();
        let mut order = Vec::new();
        let mut collections: HashSet<String> = HashSet::new();

        for (name, decl) in &self.decls {
            let collection = match &decl.collection {
                Some(explicit) if explicit.trim().is_empty() => {
                    return Err(DocMapError::Schema(format!(
                        "record type '{name}' declares an empty collection name"
                    )));
                }
                Some(explicit) => explicit.to_lowercase(),
                None => collection_name(name)?,
            };
            if !collections.insert(collection.clone()) {
                return Err(DocMapError::Schema(format!(
                    "collection '{collection}' is used by more than one record type"
                )));
            }

            let fields = resolved.remove(name).unwrap_or_default();

            for index in &decl.indexes {
                let known = fields.iter().any(|f| &f.name == index)
                    || SYSTEM_FIELDS.contains(&index.as_str());
                if !known {
                    return Err(DocMapError::Schema(format!(
                        "index '{index}' of '{name}' is not a declared field"
                    )));
                }
            }

            for field in &fields {
                if field.has(Modifier::Cascade) && !field.is_linked() {
                    log::warn!(
                        "Field '{}' of '{name}' is marked cascade but not linked; it will never cascade",
                        field.name
                    );
                }
            }

            records.insert(
                name.clone(),
                Arc::new(RecordSchema {
                    name: name.clone(),
                    collection,
                    parent: decl.extends.clone(),
                    fields,
                    indexes: decl.indexes.clone(),
                }),
            );
            order.push(name.clone());
        }

        Ok(Schema { records, order })
    }
}

/// Resolve the field list of `name`, parent fields first. Child fields with the
/// same name replace the inherited ones in place.
fn resolve_fields(
    name: &str,
    decls: &HashMap<&str, &RecordDecl>,
    resolved: &mut HashMap<String, Vec<FieldDescriptor>>,
    stack: &mut Vec<String>,
) -> Result<()> {
    if resolved.contains_key(name) {
        return Ok(());
    }
    if stack.iter().any(|s| s == name) {
        stack.push(name.to_string());
        return Err(DocMapError::Schema(format!(
            "inheritance cycle: {}",
            stack.join(" -> ")
        )));
    }

    let decl = decls
        .get(name)
        .ok_or_else(|| DocMapError::Schema(format!("unknown parent record type '{name}'")))?;

    stack.push(name.to_string());
    let mut fields = match &decl.extends {
        Some(parent) => {
            resolve_fields(parent, decls, resolved, stack)?;
            resolved.get(parent.as_str()).cloned().unwrap_or_default()
        }
        None => Vec::new(),
    };
    stack.pop();

    for (field_name, field_decl) in &decl.fields {
        let descriptor = normalize_field(name, field_name, field_decl, decls)?;
        match fields.iter_mut().find(|f| f.name == *field_name) {
            Some(existing) => *existing = descriptor,
            None => fields.push(descriptor),
        }
    }

    resolved.insert(name.to_string(), fields);
    Ok(())
}

fn normalize_field(
    owner: &str,
    name: &str,
    decl: &FieldDecl,
    decls: &HashMap<&str, &RecordDecl>,
) -> Result<FieldDescriptor> {
    if SYSTEM_FIELDS.contains(&name) {
        return Err(DocMapError::Schema(format!(
            "'{name}' is a system field and cannot be declared on '{owner}'"
        )));
    }

    let mut scalars = Vec::new();
    let mut record_types = Vec::new();
    for type_name in decl.types.names() {
        match ScalarType::parse(type_name) {
            Some(scalar) => scalars.push(scalar),
            None if decls.contains_key(type_name) => record_types.push(type_name),
            None => {
                return Err(DocMapError::Schema(format!(
                    "field '{name}' of '{owner}' references unknown type '{type_name}'"
                )));
            }
        }
    }

    if record_types.len() > 1 {
        return Err(DocMapError::Schema(format!(
            "field '{name}' of '{owner}' references more than one record type: {}",
            record_types.join(", ")
        )));
    }

    let base = match (scalars.as_slice(), record_types.as_slice()) {
        ([scalar], []) => BaseType::Scalar(*scalar),
        ([], [record]) => BaseType::Record(record.to_string()),
        _ => {
            return Err(DocMapError::Schema(format!(
                "field '{name}' of '{owner}' must declare exactly one base type"
            )));
        }
    };

    let mut modifiers: Vec<Modifier> = Vec::with_capacity(decl.modifiers.len());
    for modifier in &decl.modifiers {
        if !modifiers.contains(modifier) {
            modifiers.push(*modifier);
        }
    }

    if modifiers.contains(&Modifier::Linked) && matches!(base, BaseType::Scalar(_)) {
        return Err(DocMapError::Schema(format!(
            "field '{name}' of '{owner}' is linked but its type '{base}' is not a record type"
        )));
    }

    Ok(FieldDescriptor {
        name: name.to_string(),
        base,
        modifiers,
    })
}

/// Derive a collection name from a record type name.
///
/// - `gallery` → `galleries`
/// - `matrix`  → `matrices`
/// - `user`    → `users`
/// - `analysis`, `item2` → unchanged
pub fn collection_name(type_name: &str) -> Result<String> {
    let mut name = type_name.trim().to_lowercase();
    let last = name.chars().last().ok_or_else(|| {
        DocMapError::Schema(format!(
            "cannot derive a collection name from '{type_name}'"
        ))
    })?;

    if last.is_numeric() {
        return Ok(name);
    }

    match last {
        'x' => {
            name.pop();
            name.push_str("ces");
        }
        'y' => {
            name.pop();
            name.push_str("ies");
        }
        's' => {}
        _ => name.push('s'),
    }
    Ok(name)
}
