//! Record type declarations and their normalized, cached form.

mod model;
mod types;

pub use model::{
    collection_name, BaseType, FieldDescriptor, RecordSchema, ScalarType, Schema, SchemaBuilder,
    SYSTEM_FIELDS,
};
pub use types::{FieldDecl, Modifier, ModifierKind, RecordDecl, SchemaDecl, TypeRef};
