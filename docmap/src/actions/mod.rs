//! Modifiers that react to lifecycle events, and user lifecycle hooks.
//!
//! `Cascade` is the only action modifier: when the owner is deleted, every
//! record referenced by the field is fetched again and deleted through the
//! same lifecycle, so the target's own cascades run too. Cycles between
//! cascading types are not detected.

use crate::error::Result;
use crate::record::{Record, Value};
use crate::schema::{FieldDescriptor, Modifier, ModifierKind};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleEvent {
    Create,
    Update,
    Delete,
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Create => write!(f, "create"),
            LifecycleEvent::Update => write!(f, "update"),
            LifecycleEvent::Delete => write!(f, "delete"),
        }
    }
}

/// What an action needs from the lifecycle controller.
pub trait ActionContext {
    /// Fetch a live record of `type_name` by id.
    fn fetch(&mut self, type_name: &str, id: &str) -> Result<Option<Record>>;

    /// Delete through the full lifecycle, including the target's own actions.
    fn delete(&mut self, record: &mut Record) -> Result<()>;
}

/// Run every action modifier of one field for `event`.
pub fn dispatch(
    ctx: &mut dyn ActionContext,
    field: &FieldDescriptor,
    value: &Value,
    event: LifecycleEvent,
) -> Result<()> {
    for modifier in &field.modifiers {
        if modifier.kind() != ModifierKind::Action {
            continue;
        }
        match modifier {
            Modifier::Cascade => cascade(ctx, field, value, event)?,
            Modifier::NonNull | Modifier::Unique | Modifier::Linked | Modifier::List => {}
        }
    }
    Ok(())
}

/// Dispatch `event` for every field of `record`, in declaration order.
pub fn dispatch_all(ctx: &mut dyn ActionContext, record: &Record, event: LifecycleEvent) -> Result<()> {
    for (field, value) in record.fields() {
        dispatch(ctx, field, value, event)?;
    }
    Ok(())
}

fn cascade(
    ctx: &mut dyn ActionContext,
    field: &FieldDescriptor,
    value: &Value,
    event: LifecycleEvent,
) -> Result<()> {
    if event != LifecycleEvent::Delete || !field.is_linked() {
        return Ok(());
    }
    let Some(target) = field.record_type() else {
        return Ok(());
    };

    let mut ids = Vec::new();
    collect_ids(value, &mut ids);
    for id in ids {
        // an id that no longer resolves ends this branch
        match ctx.fetch(target, &id)? {
            Some(mut linked) => {
                log::debug!("Cascading delete from '{}' to {linked}", field.name);
                ctx.delete(&mut linked)?;
            }
            None => log::debug!("Cascade target {target}({id}) already gone"),
        }
    }
    Ok(())
}

fn collect_ids(value: &Value, ids: &mut Vec<String>) {
    match value {
        Value::Record(record) => {
            if let Some(id) = record.id() {
                ids.push(id.to_string());
            }
        }
        Value::String(id) => ids.push(id.clone()),
        Value::List(items) => {
            for item in items {
                collect_ids(item, ids);
            }
        }
        _ => {}
    }
}

/// Callbacks fired by a session after a write has succeeded.
///
/// Registered per record type with [`crate::Session::register_hook`].
pub trait LifecycleHook: Send + Sync {
    fn on_created(&self, _record: &Record) {}

    fn on_modified(&self, _record: &Record) {}

    /// Called with the record's id still set.
    fn on_deleted(&self, _record: &Record) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;
    use std::collections::HashMap;

    fn test_schema() -> Schema {
        Schema::from_yaml_str(
            r#"
records:
  Comment:
    fields:
      text: { type: string }
  Post:
    fields:
      title: { type: string }
      comments: { type: Comment, modifiers: [linked, list, cascade] }
      pinned: { type: Comment, modifiers: [linked, cascade] }
      related: { type: Comment, modifiers: [linked] }
"#,
        )
        .unwrap()
    }

    /// In-memory context: fetch looks up `stored`, delete removes from it.
    struct FakeContext {
        stored: HashMap<String, Record>,
        deleted: Vec<String>,
    }

    impl FakeContext {
        fn new(records: Vec<Record>) -> Self {
            FakeContext {
                stored: records
                    .into_iter()
                    .map(|r| (r.id().unwrap().to_string(), r))
                    .collect(),
                deleted: Vec::new(),
            }
        }
    }

    impl ActionContext for FakeContext {
        fn fetch(&mut self, _type_name: &str, id: &str) -> Result<Option<Record>> {
            Ok(self.stored.get(id).cloned())
        }

        fn delete(&mut self, record: &mut Record) -> Result<()> {
            let id = record.id().unwrap().to_string();
            self.stored.remove(&id);
            self.deleted.push(id);
            record.mark_deleted(None);
            Ok(())
        }
    }

    fn comment(schema: &Schema, id: &str) -> Record {
        schema
            .record("Comment")
            .unwrap()
            .id(id)
            .field("text", id)
            .build()
            .unwrap()
    }

    #[test]
    fn test_cascade_deletes_linked_targets() {
        let schema = test_schema();
        let mut ctx = FakeContext::new(vec![
            comment(&schema, "c1"),
            comment(&schema, "c2"),
            comment(&schema, "c3"),
            comment(&schema, "c4"),
        ]);
        let post = schema
            .record("Post")
            .unwrap()
            .id("p1")
            .field("comments", vec![Value::from(comment(&schema, "c1")), Value::from("c2")])
            .field("pinned", comment(&schema, "c3"))
            .field("related", comment(&schema, "c4"))
            .build()
            .unwrap();

        dispatch_all(&mut ctx, &post, LifecycleEvent::Delete).unwrap();
        assert_eq!(ctx.deleted, vec!["c1", "c2", "c3"]);
        assert!(ctx.stored.contains_key("c4"));
    }

    #[test]
    fn test_cascade_ignores_other_events() {
        let schema = test_schema();
        let mut ctx = FakeContext::new(vec![comment(&schema, "c1")]);
        let post = schema
            .record("Post")
            .unwrap()
            .field("pinned", "c1")
            .build()
            .unwrap();

        dispatch_all(&mut ctx, &post, LifecycleEvent::Create).unwrap();
        dispatch_all(&mut ctx, &post, LifecycleEvent::Update).unwrap();
        assert!(ctx.deleted.is_empty());
    }

    #[test]
    fn test_missing_target_stops_silently() {
        let schema = test_schema();
        let mut ctx = FakeContext::new(Vec::new());
        let post = schema
            .record("Post")
            .unwrap()
            .field("comments", vec!["gone"])
            .build()
            .unwrap();

        dispatch_all(&mut ctx, &post, LifecycleEvent::Delete).unwrap();
        assert!(ctx.deleted.is_empty());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(LifecycleEvent::Delete.to_string(), "delete");
    }
}
