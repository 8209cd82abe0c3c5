use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::marker::PhantomData;

/// Top-level schema declaration parsed from schema.yaml
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDecl {
    #[serde(default, with = "ordered_map")]
    pub records: Vec<(String, RecordDecl)>,
}

/// Declaration of a single record type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordDecl {
    /// Explicit collection name; derived from the type name when absent.
    #[serde(default)]
    pub collection: Option<String>,
    /// Parent record type whose fields are inherited.
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub indexes: Vec<String>,
    #[serde(default, with = "ordered_map")]
    pub fields: Vec<(String, FieldDecl)>,
}

impl RecordDecl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collection = Some(name.into());
        self
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.extends = Some(parent.into());
        self
    }

    pub fn index(mut self, field: impl Into<String>) -> Self {
        self.indexes.push(field.into());
        self
    }

    pub fn field(mut self, name: impl Into<String>, decl: FieldDecl) -> Self {
        self.fields.push((name.into(), decl));
        self
    }
}

/// Declaration of a single field: one or more type names plus modifiers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDecl {
    #[serde(rename = "type")]
    pub types: TypeRef,
    #[serde(default)]
    pub modifiers: Vec<Modifier>,
}

impl FieldDecl {
    pub fn of(type_name: impl Into<String>) -> Self {
        FieldDecl {
            types: TypeRef::Single(type_name.into()),
            modifiers: Vec::new(),
        }
    }

    /// A declaration naming several types; only valid when it resolves to a single base type.
    pub fn of_any<I, S>(type_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldDecl {
            types: TypeRef::Multiple(type_names.into_iter().map(Into::into).collect()),
            modifiers: Vec::new(),
        }
    }

    pub fn with(mut self, modifier: Modifier) -> Self {
        self.modifiers.push(modifier);
        self
    }
}

/// Type reference - single name or several
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TypeRef {
    Single(String),
    Multiple(Vec<String>),
}

impl TypeRef {
    pub fn names(&self) -> Vec<&str> {
        match self {
            TypeRef::Single(name) => vec![name.as_str()],
            TypeRef::Multiple(names) => names.iter().map(|s| s.as_str()).collect(),
        }
    }
}

/// Behavioral modifiers a field can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Modifier {
    NonNull,
    Unique,
    Linked,
    Cascade,
    List,
}

/// Which engine a modifier is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifierKind {
    /// Run by the validation engine at save time.
    Checker,
    /// Applied by the transform pipeline and the build engine.
    Transform,
    /// Fired by the action dispatcher on lifecycle events.
    Action,
    /// Changes the shape of the value (repeated base type).
    Shape,
}

impl Modifier {
    pub const fn kind(self) -> ModifierKind {
        match self {
            Modifier::NonNull | Modifier::Unique => ModifierKind::Checker,
            Modifier::Linked => ModifierKind::Transform,
            Modifier::Cascade => ModifierKind::Action,
            Modifier::List => ModifierKind::Shape,
        }
    }
}

impl fmt::Display for Modifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Modifier::NonNull => "non_null",
            Modifier::Unique => "unique",
            Modifier::Linked => "linked",
            Modifier::Cascade => "cascade",
            Modifier::List => "list",
        };
        f.write_str(name)
    }
}

/// (De)serialize a YAML mapping as an ordered list of entries.
mod ordered_map {
    use super::*;

    pub fn serialize<S, T>(entries: &[(String, T)], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (key, value) in entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Vec<(String, T)>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = Vec<(String, T)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping")
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(Vec::new())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, T>()? {
                    if entries.iter().any(|(k, _): &(String, T)| *k == key) {
                        return Err(serde::de::Error::custom(format!("duplicate key '{key}'")));
                    }
                    entries.push((key, value));
                }
                Ok(entries)
            }
        }

        deserializer.deserialize_any(EntriesVisitor(PhantomData))
    }
}
