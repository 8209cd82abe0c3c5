//! Record lifecycle: save, fetch, query, delete and join, over one connection.
//!
//! A [`Session`] owns its connection for as long as it lives; the connection
//! is released by [`Session::close`] or when the session is dropped.

mod reader;

pub(crate) use reader::Reader;

use crate::actions::{self, ActionContext, LifecycleEvent, LifecycleHook};
use crate::backend::{Backend, Connection, Predicate, QueryOptions};
use crate::config::{self, Config};
use crate::document::{self, Document, CREATED_AT, DELETED_AT, ID, UPDATED_AT};
use crate::error::{DocMapError, Result};
use crate::feed::Subscription;
use crate::record::Record;
use crate::schema::{RecordSchema, Schema};
use crate::transform;
use crate::validation::{self, UniqueProbe};
use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

pub struct Session {
    schema: Arc<Schema>,
    backend: Arc<dyn Backend>,
    config: Config,
    conn: Box<dyn Connection>,
    hooks: HashMap<String, Vec<Arc<dyn LifecycleHook>>>,
}

/// Stored timestamps carry microseconds; truncate so a fetched record equals
/// the one that was saved.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl Session {
    /// Connect to the configured database.
    pub fn open(schema: Arc<Schema>, backend: Arc<dyn Backend>, config: Config) -> Result<Self> {
        let conn = backend.connect(&config)?;
        log::debug!(
            "Session opened on '{}' (soft delete: {})",
            config.database,
            config.soft_delete
        );
        Ok(Session {
            schema,
            backend,
            config,
            conn,
            hooks: HashMap::new(),
        })
    }

    /// Open with the process-wide configuration.
    pub fn open_global(schema: Arc<Schema>, backend: Arc<dyn Backend>) -> Result<Self> {
        Self::open(schema, backend, config::global())
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Direct access to the underlying connection, bypassing the soft-delete scope.
    pub fn connection(&self) -> &dyn Connection {
        self.conn.as_ref()
    }

    /// Run `hook` after every successful write of `type_name`.
    pub fn register_hook(&mut self, type_name: &str, hook: Arc<dyn LifecycleHook>) -> Result<()> {
        self.schema.get(type_name)?;
        self.hooks.entry(type_name.to_string()).or_default().push(hook);
        Ok(())
    }

    fn reader(&self) -> Reader<'_> {
        Reader {
            schema: &self.schema,
            conn: self.conn.as_ref(),
            soft_delete: self.config.soft_delete,
        }
    }

    /// Insert a transient record or update a persisted one.
    ///
    /// On any failure the record is left exactly as it was.
    pub fn save(&mut self, record: &mut Record) -> Result<()> {
        let collection = self.schema.get(record.type_name())?.collection().to_string();
        validation::validate_for_save(record, &*self)?;

        let mut doc = transform::to_document(record)?;
        let at = now();
        let event = match record.id().map(str::to_string) {
            None => {
                doc.insert(CREATED_AT.into(), document::encode_timestamp(Some(at)));
                doc.insert(UPDATED_AT.into(), JsonValue::Null);
                doc.insert(DELETED_AT.into(), JsonValue::Null);
                let id = self.conn.insert(&collection, doc)?;
                log::debug!("Inserted {}({id}) into '{collection}'", record.type_name());
                record.mark_inserted(id, at);
                LifecycleEvent::Create
            }
            Some(id) => {
                // An update only stamps updated_at; the stored creation and
                // deletion times stay as they are.
                doc.remove(ID);
                doc.remove(CREATED_AT);
                doc.remove(DELETED_AT);
                doc.insert(UPDATED_AT.into(), document::encode_timestamp(Some(at)));
                self.conn.update(&collection, &id, doc)?;
                log::debug!("Updated {record} in '{collection}'");
                record.mark_updated(at);
                LifecycleEvent::Update
            }
        };

        actions::dispatch_all(self, record, event)?;
        self.fire(event, record);
        Ok(())
    }

    /// Point lookup; `None` when absent (or soft-deleted).
    pub fn get(&self, type_name: &str, id: &str) -> Result<Option<Record>> {
        self.reader().get(type_name, id)
    }

    pub fn get_all(&self, type_name: &str, options: &QueryOptions) -> Result<Vec<Record>> {
        self.filter(type_name, Predicate::All, options)
    }

    pub fn filter(
        &self,
        type_name: &str,
        predicate: Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Record>> {
        self.reader().filter(type_name, predicate, options)
    }

    /// Delete a persisted record, running its cascades first.
    ///
    /// Under soft delete the document stays in the store with `deleted_at`
    /// set. Either way the in-memory id is reset.
    pub fn delete(&mut self, record: &mut Record) -> Result<()> {
        let id = record
            .id()
            .map(str::to_string)
            .ok_or_else(|| DocMapError::NotPersisted {
                record: record.type_name().to_string(),
            })?;
        let collection = self.schema.get(record.type_name())?.collection().to_string();

        actions::dispatch_all(self, record, LifecycleEvent::Delete)?;

        let deleted_at = if self.config.soft_delete {
            let at = now();
            let mut partial = Document::new();
            partial.insert(DELETED_AT.into(), document::encode_timestamp(Some(at)));
            self.conn.update(&collection, &id, partial)?;
            Some(at)
        } else {
            self.conn.delete(&collection, &id)?;
            None
        };
        log::debug!("Deleted {record} from '{collection}'");

        self.fire(LifecycleEvent::Delete, record);
        record.mark_deleted(deleted_at);
        Ok(())
    }

    /// Fetch and delete by id. Returns false when there was nothing to delete.
    pub fn delete_id(&mut self, type_name: &str, id: &str) -> Result<bool> {
        match self.get(type_name, id)? {
            Some(mut record) => {
                self.delete(&mut record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Attach, for each of `types`, the records whose linked field points
    /// back at `record`. Results are keyed by the other type's collection.
    pub fn join(&self, record: &mut Record, types: &[&str], options: &QueryOptions) -> Result<()> {
        let id = record
            .id()
            .map(str::to_string)
            .ok_or_else(|| DocMapError::NotPersisted {
                record: record.type_name().to_string(),
            })?;

        for type_name in types {
            let other = self.schema.get(type_name)?;
            let field = other.field_targeting(record.type_name()).ok_or_else(|| {
                DocMapError::Schema(format!(
                    "{type_name} has no linked field referencing {}",
                    record.type_name()
                ))
            })?;

            let predicate = if field.is_list() {
                let name = field.name.clone();
                let id = id.clone();
                Predicate::func(move |doc| {
                    doc.get(&name)
                        .and_then(JsonValue::as_array)
                        .map_or(false, |ids| ids.iter().any(|v| v.as_str() == Some(id.as_str())))
                })
            } else {
                Predicate::eq(field.name.clone(), id.clone())
            };

            let found = self.filter(type_name, predicate, options)?;
            record.set_joined(other.collection(), found);
        }
        Ok(())
    }

    /// Remove every document of a record type's collection.
    pub fn truncate(&self, type_name: &str) -> Result<()> {
        let collection = self.schema.get(type_name)?.collection();
        log::info!("Truncating '{collection}'");
        self.conn.truncate(collection)
    }

    /// Stream changes to `type_name` over a dedicated connection.
    pub fn subscribe(&self, type_name: &str, predicate: Option<Predicate>) -> Result<Subscription> {
        Subscription::open(
            self.schema.clone(),
            self.backend.as_ref(),
            &self.config,
            type_name,
            predicate,
        )
    }

    pub fn close(&self) -> Result<()> {
        self.conn.close()
    }

    fn fire(&self, event: LifecycleEvent, record: &Record) {
        let Some(hooks) = self.hooks.get(record.type_name()) else {
            return;
        };
        for hook in hooks {
            match event {
                LifecycleEvent::Create => hook.on_created(record),
                LifecycleEvent::Update => hook.on_modified(record),
                LifecycleEvent::Delete => hook.on_deleted(record),
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.conn.close() {
            log::warn!("Failed to close session connection: {e}");
        }
    }
}

impl UniqueProbe for Session {
    fn exists(
        &self,
        schema: &RecordSchema,
        field: &str,
        value: &JsonValue,
        exclude_id: Option<&str>,
    ) -> Result<bool> {
        let predicate = self.reader().scoped(Predicate::eq(field, value.clone()));
        let found = self
            .conn
            .query(schema.collection(), &predicate, &QueryOptions::new())?;
        Ok(found
            .iter()
            .any(|doc| document::document_id(doc) != exclude_id))
    }
}

impl ActionContext for Session {
    fn fetch(&mut self, type_name: &str, id: &str) -> Result<Option<Record>> {
        self.get(type_name, id)
    }

    fn delete(&mut self, record: &mut Record) -> Result<()> {
        Session::delete(self, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryBackend, OrderBy};
    use crate::manage;
    use crate::record::Value;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Mutex;

    const SCHEMA: &str = r#"
records:
  User:
    fields:
      username: { type: string, modifiers: [unique, non_null] }
      age: { type: int }
  Project:
    fields:
      name: { type: string }
      owner: { type: User, modifiers: [linked] }
  Media:
    fields:
      url: { type: string }
  Gallery:
    fields:
      title: { type: string }
      cover: { type: Media, modifiers: [linked, cascade] }
      medias: { type: Media, modifiers: [linked, list, cascade] }
  Album:
    fields:
      gallery: { type: Gallery, modifiers: [linked, cascade] }
  Team:
    fields:
      members: { type: User, modifiers: [linked, list] }
"#;

    fn setup(soft_delete: bool) -> (MemoryBackend, Session) {
        let schema = Arc::new(Schema::from_yaml_str(SCHEMA).unwrap());
        let backend = MemoryBackend::new();
        let config = Config::default().with_soft_delete(soft_delete);
        manage::check_db(&backend, &config).unwrap();
        manage::sync_schema(&backend, &config, &schema).unwrap();
        let session = Session::open(schema, Arc::new(backend.clone()), config).unwrap();
        (backend, session)
    }

    fn user(session: &Session, name: &str) -> Record {
        session
            .schema()
            .record("User")
            .unwrap()
            .field("username", name)
            .build()
            .unwrap()
    }

    fn saved_user(session: &mut Session, name: &str) -> Record {
        let mut u = user(session, name);
        session.save(&mut u).unwrap();
        u
    }

    #[test]
    fn test_save_assigns_id_and_timestamps() {
        let (_backend, mut session) = setup(false);
        let mut u = user(&session, "foo");

        session.save(&mut u).unwrap();
        let id = u.id().unwrap().to_string();
        let created = u.created_at().unwrap();
        assert_eq!(u.updated_at(), None);

        session.save(&mut u).unwrap();
        assert_eq!(u.id(), Some(id.as_str()));
        assert_eq!(u.created_at(), Some(created));
        assert!(u.updated_at().unwrap() >= created);

        let fetched = session.get("User", &id).unwrap().unwrap();
        assert_eq!(fetched, u);
    }

    #[test]
    fn test_unique_violation() {
        let (_backend, mut session) = setup(false);
        saved_user(&mut session, "dup");

        let mut second = user(&session, "dup");
        let err = session.save(&mut second).unwrap_err();
        assert!(matches!(err, DocMapError::Uniqueness { ref field, .. } if field == "username"));
        assert!(!second.is_persisted());
    }

    #[test]
    fn test_resave_does_not_clash_with_itself() {
        let (_backend, mut session) = setup(false);
        let mut u = saved_user(&mut session, "self");
        u.set("age", 3).unwrap();
        session.save(&mut u).unwrap();
        assert_eq!(session.get_all("User", &QueryOptions::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_non_null_checked_on_save() {
        let (_backend, mut session) = setup(false);
        let mut u = session.schema().record("User").unwrap().build().unwrap();
        let err = session.save(&mut u).unwrap_err();
        assert!(matches!(err, DocMapError::NullValue { .. }));
        assert_eq!(u.id(), None);
        assert_eq!(u.created_at(), None);
    }

    #[test]
    fn test_failed_write_leaves_record_unchanged() {
        let (_backend, mut session) = setup(false);
        let mut u = user(&session, "lost");
        let before = u.clone();
        session.connection().close().unwrap();

        assert!(matches!(session.save(&mut u), Err(DocMapError::Persistence(_))));
        assert_eq!(u, before);
    }

    #[test]
    fn test_linked_stored_as_id_and_fetched_as_record() {
        let (_backend, mut session) = setup(false);
        let owner = saved_user(&mut session, "owner");
        let mut project = session
            .schema()
            .record("Project")
            .unwrap()
            .field("name", "p")
            .field("owner", owner.clone())
            .build()
            .unwrap();
        session.save(&mut project).unwrap();

        let raw = session
            .connection()
            .get("projects", project.id().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(raw["owner"], json!(owner.id().unwrap()));

        let fetched = session.get("Project", project.id().unwrap()).unwrap().unwrap();
        assert_eq!(fetched.get("owner").unwrap().as_record(), Some(&owner));
    }

    #[test]
    fn test_get_missing_is_none() {
        let (_backend, session) = setup(false);
        assert!(session.get("User", "nope").unwrap().is_none());
        assert!(matches!(
            session.get("Nobody", "x"),
            Err(DocMapError::UnknownRecordType(_))
        ));
    }

    #[test]
    fn test_hard_delete() {
        let (_backend, mut session) = setup(false);
        let mut u = saved_user(&mut session, "gone");
        let id = u.id().unwrap().to_string();

        session.delete(&mut u).unwrap();
        assert_eq!(u.id(), None);
        assert!(session.get("User", &id).unwrap().is_none());
        assert!(session.connection().get("users", &id).unwrap().is_none());

        assert!(matches!(
            session.delete(&mut u),
            Err(DocMapError::NotPersisted { .. })
        ));
    }

    #[test]
    fn test_soft_delete_hides_record() {
        let (_backend, mut session) = setup(true);
        let mut u = saved_user(&mut session, "soft");
        saved_user(&mut session, "kept");
        let id = u.id().unwrap().to_string();

        session.delete(&mut u).unwrap();
        assert_eq!(u.id(), None);
        assert!(u.deleted_at().is_some());

        assert!(session.get("User", &id).unwrap().is_none());
        let all = session.get_all("User", &QueryOptions::new()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].get("username").unwrap().as_str(), Some("kept"));

        let raw = session.connection().get("users", &id).unwrap().unwrap();
        assert!(document::is_soft_deleted(&raw));
    }

    #[test]
    fn test_soft_deleted_value_is_not_unique_clash() {
        let (_backend, mut session) = setup(true);
        let mut u = saved_user(&mut session, "reuse");
        session.delete(&mut u).unwrap();
        saved_user(&mut session, "reuse");
    }

    #[test]
    fn test_save_after_soft_delete_inserts_live_record() {
        let (_backend, mut session) = setup(true);
        let mut u = saved_user(&mut session, "again");
        session.delete(&mut u).unwrap();

        session.save(&mut u).unwrap();
        assert_eq!(u.deleted_at(), None);
        let id = u.id().unwrap().to_string();

        let fetched = session.get("User", &id).unwrap().unwrap();
        assert_eq!(fetched.deleted_at(), None);
        assert_eq!(fetched, u);
        assert_eq!(session.get_all("User", &QueryOptions::new()).unwrap().len(), 1);
    }

    #[test]
    fn test_save_after_hard_delete_clears_updated_at() {
        let (_backend, mut session) = setup(false);
        let mut u = saved_user(&mut session, "twice");
        session.save(&mut u).unwrap();
        assert!(u.updated_at().is_some());
        session.delete(&mut u).unwrap();

        session.save(&mut u).unwrap();
        assert_eq!(u.updated_at(), None);
        let fetched = session.get("User", u.id().unwrap()).unwrap().unwrap();
        assert_eq!(fetched.updated_at(), None);
    }

    #[test]
    fn test_update_by_id_keeps_stored_created_at() {
        let (_backend, mut session) = setup(false);
        let u = saved_user(&mut session, "a");
        let id = u.id().unwrap().to_string();

        let mut by_id = session
            .schema()
            .record("User")
            .unwrap()
            .id(id.clone())
            .field("username", "b")
            .build()
            .unwrap();
        session.save(&mut by_id).unwrap();

        let fetched = session.get("User", &id).unwrap().unwrap();
        assert_eq!(fetched.created_at(), u.created_at());
        assert!(fetched.updated_at().is_some());
        assert_eq!(fetched.get("username").unwrap().as_str(), Some("b"));
    }

    #[test]
    fn test_update_by_id_keeps_soft_deleted_state() {
        let (_backend, mut session) = setup(true);
        let mut u = saved_user(&mut session, "hidden");
        let id = u.id().unwrap().to_string();
        session.delete(&mut u).unwrap();

        let mut by_id = session
            .schema()
            .record("User")
            .unwrap()
            .id(id.clone())
            .field("username", "hidden")
            .build()
            .unwrap();
        session.save(&mut by_id).unwrap();

        assert!(session.get("User", &id).unwrap().is_none());
        let raw = session.connection().get("users", &id).unwrap().unwrap();
        assert!(document::is_soft_deleted(&raw));
    }

    #[test]
    fn test_cascade_delete() {
        let (_backend, mut session) = setup(false);
        let mut media = Vec::new();
        for url in ["a", "b", "c"] {
            let mut m = session
                .schema()
                .record("Media")
                .unwrap()
                .field("url", url)
                .build()
                .unwrap();
            session.save(&mut m).unwrap();
            media.push(m);
        }
        let mut gallery = session
            .schema()
            .record("Gallery")
            .unwrap()
            .field("cover", media[0].clone())
            .field("medias", vec![media[1].clone(), media[2].clone()])
            .build()
            .unwrap();
        session.save(&mut gallery).unwrap();
        let mut album = session
            .schema()
            .record("Album")
            .unwrap()
            .field("gallery", gallery.clone())
            .build()
            .unwrap();
        session.save(&mut album).unwrap();

        session.delete(&mut album).unwrap();
        assert!(session.get_all("Gallery", &QueryOptions::new()).unwrap().is_empty());
        assert!(session.get_all("Media", &QueryOptions::new()).unwrap().is_empty());
    }

    #[test]
    fn test_cascade_delete_soft() {
        let (_backend, mut session) = setup(true);
        let mut cover = session
            .schema()
            .record("Media")
            .unwrap()
            .field("url", "x")
            .build()
            .unwrap();
        session.save(&mut cover).unwrap();
        let cover_id = cover.id().unwrap().to_string();
        let mut gallery = session
            .schema()
            .record("Gallery")
            .unwrap()
            .field("cover", cover)
            .build()
            .unwrap();
        session.save(&mut gallery).unwrap();

        session.delete(&mut gallery).unwrap();
        assert!(session.get("Media", &cover_id).unwrap().is_none());
        let raw = session.connection().get("medias", &cover_id).unwrap().unwrap();
        assert!(document::is_soft_deleted(&raw));
    }

    #[test]
    fn test_delete_id() {
        let (_backend, mut session) = setup(false);
        let u = saved_user(&mut session, "byid");
        assert!(session.delete_id("User", u.id().unwrap()).unwrap());
        assert!(!session.delete_id("User", u.id().unwrap()).unwrap());
    }

    #[test]
    fn test_filter_or_and_order() {
        let (_backend, mut session) = setup(false);
        for i in 0..4 {
            saved_user(&mut session, &format!("user{i}"));
        }

        let predicate = Predicate::eq("username", "user0").or(Predicate::eq("username", "user2"));
        let found = session
            .filter(
                "User",
                predicate,
                &QueryOptions::new().order_by(OrderBy::desc("username")),
            )
            .unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|u| u.get("username").unwrap().as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["user2", "user0"]);

        let page = session
            .get_all("User", &QueryOptions::new().offset(1).limit(2))
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].get("username").unwrap().as_str(), Some("user1"));
    }

    #[test]
    fn test_join() {
        let (_backend, mut session) = setup(false);
        let mut owner = saved_user(&mut session, "owner");
        let other = saved_user(&mut session, "other");
        for (name, who) in [("a", &owner), ("b", &other), ("c", &owner)] {
            let mut p = session
                .schema()
                .record("Project")
                .unwrap()
                .field("name", name)
                .field("owner", who.clone())
                .build()
                .unwrap();
            session.save(&mut p).unwrap();
        }
        let mut team = session
            .schema()
            .record("Team")
            .unwrap()
            .field("members", vec![Value::from(other.clone()), Value::from(owner.clone())])
            .build()
            .unwrap();
        session.save(&mut team).unwrap();

        session
            .join(&mut owner, &["Project", "Team"], &QueryOptions::new())
            .unwrap();
        let projects = owner.joined("projects").unwrap();
        assert_eq!(projects.len(), 2);
        assert_eq!(projects[1].get("name").unwrap().as_str(), Some("c"));
        assert_eq!(owner.joined("teams").unwrap().len(), 1);

        assert!(matches!(
            session.join(&mut owner, &["Media"], &QueryOptions::new()),
            Err(DocMapError::Schema(_))
        ));
    }

    #[test]
    fn test_truncate() {
        let (_backend, mut session) = setup(false);
        saved_user(&mut session, "a");
        saved_user(&mut session, "b");
        session.truncate("User").unwrap();
        assert!(session.get_all("User", &QueryOptions::new()).unwrap().is_empty());
    }

    #[derive(Default)]
    struct RecordingHook {
        seen: Mutex<Vec<String>>,
    }

    impl LifecycleHook for RecordingHook {
        fn on_created(&self, record: &Record) {
            self.seen.lock().unwrap().push(format!("created {}", record.get("username").unwrap().as_str().unwrap()));
        }

        fn on_modified(&self, _record: &Record) {
            self.seen.lock().unwrap().push("modified".into());
        }

        fn on_deleted(&self, record: &Record) {
            assert!(record.is_persisted());
            self.seen.lock().unwrap().push("deleted".into());
        }
    }

    #[test]
    fn test_hooks_fire_after_writes() {
        let (_backend, mut session) = setup(false);
        let hook = Arc::new(RecordingHook::default());
        session.register_hook("User", hook.clone()).unwrap();
        assert!(session.register_hook("Nobody", hook.clone()).is_err());

        let mut u = saved_user(&mut session, "hooked");
        session.save(&mut u).unwrap();
        session.delete(&mut u).unwrap();

        assert_eq!(
            hook.seen.lock().unwrap().as_slice(),
            &["created hooked", "modified", "deleted"]
        );
    }
}
