//! In-process document store.
//!
//! Databases hold named collections of documents kept in insertion order.
//! Cloning a [`MemoryBackend`] shares the same data, so several sessions
//! (and their subscriptions) observe each other's writes.

use super::query::run_query;
use super::{closed_error, Backend, Connection, FeedHub, Predicate, QueryOptions, SharedHub, WatchEvent, WatchStream};
use crate::config::Config;
use crate::document::{document_id, Document, ID};
use crate::error::{DocMapError, Result};
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct MemoryCollection {
    documents: Vec<Document>,
    indexes: BTreeSet<String>,
}

impl MemoryCollection {
    fn position(&self, id: &str) -> Option<usize> {
        self.documents.iter().position(|d| document_id(d) == Some(id))
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    databases: BTreeMap<String, BTreeMap<String, MemoryCollection>>,
}

impl MemoryState {
    fn database(&mut self, name: &str) -> Result<&mut BTreeMap<String, MemoryCollection>> {
        self.databases
            .get_mut(name)
            .ok_or_else(|| DocMapError::persistence(format!("database '{name}' does not exist")))
    }

    fn collection(&mut self, database: &str, name: &str) -> Result<&mut MemoryCollection> {
        self.database(database)?
            .get_mut(name)
            .ok_or_else(|| {
                DocMapError::persistence(format!("collection '{database}.{name}' does not exist"))
            })
    }
}

struct Inner {
    state: Mutex<MemoryState>,
    hub: SharedHub,
}

/// Shared in-memory store.
#[derive(Clone)]
pub struct MemoryBackend {
    inner: Arc<Inner>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// An empty store without any database.
    pub fn new() -> Self {
        MemoryBackend {
            inner: Arc::new(Inner {
                state: Mutex::new(MemoryState::default()),
                hub: FeedHub::new(),
            }),
        }
    }

    /// A store with one empty database already created.
    pub fn with_database(name: &str) -> Self {
        let backend = Self::new();
        backend
            .inner
            .lock()
            .databases
            .insert(name.to_string(), BTreeMap::new());
        backend
    }

    /// Fail every open change stream, as a lost server connection would.
    pub fn disconnect_feeds(&self) {
        self.inner.hub.disconnect_all("connection to the store was lost");
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Backend for MemoryBackend {
    fn connect(&self, config: &Config) -> Result<Box<dyn Connection>> {
        log::debug!("Opening in-memory connection to database '{}'", config.database);
        Ok(Box::new(MemoryConnection {
            inner: self.inner.clone(),
            database: config.database.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    inner: Arc<Inner>,
    database: String,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(closed_error())
        } else {
            Ok(())
        }
    }

    fn publish(&self, collection: &str, old: Option<Document>, new: Option<Document>) {
        self.inner
            .hub
            .publish(&self.database, collection, WatchEvent { old, new });
    }
}

impl Connection for MemoryConnection {
    fn insert(&self, collection: &str, mut document: Document) -> Result<String> {
        self.check_open()?;
        let mut state = self.inner.lock();
        let coll = state.collection(&self.database, collection)?;

        let id = match document.get(ID) {
            Some(JsonValue::String(id)) => id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        if coll.position(&id).is_some() {
            return Err(DocMapError::persistence(format!(
                "duplicate primary key '{id}' in '{collection}'"
            )));
        }
        document.insert(ID.into(), JsonValue::String(id.clone()));
        coll.documents.push(document.clone());

        self.publish(collection, None, Some(document));
        Ok(id)
    }

    fn update(&self, collection: &str, id: &str, partial: Document) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.lock();
        let coll = state.collection(&self.database, collection)?;
        let index = coll.position(id).ok_or_else(|| {
            DocMapError::persistence(format!("no document '{id}' in '{collection}'"))
        })?;

        let stored = &mut coll.documents[index];
        let old = stored.clone();
        for (key, value) in partial {
            if key != ID {
                stored.insert(key, value);
            }
        }
        let new = stored.clone();

        self.publish(collection, Some(old), Some(new));
        Ok(())
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.check_open()?;
        let mut state = self.inner.lock();
        let coll = state.collection(&self.database, collection)?;
        Ok(coll.position(id).map(|i| coll.documents[i].clone()))
    }

    fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.lock();
        let coll = state.collection(&self.database, collection)?;
        let index = coll.position(id).ok_or_else(|| {
            DocMapError::persistence(format!("no document '{id}' in '{collection}'"))
        })?;
        let old = coll.documents.remove(index);

        self.publish(collection, Some(old), None);
        Ok(())
    }

    fn query(
        &self,
        collection: &str,
        predicate: &Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Document>> {
        self.check_open()?;
        let mut state = self.inner.lock();
        let coll = state.collection(&self.database, collection)?;
        Ok(run_query(coll.documents.iter().cloned(), predicate, options))
    }

    fn truncate(&self, collection: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.lock();
        let coll = state.collection(&self.database, collection)?;
        let removed = std::mem::take(&mut coll.documents);
        log::debug!("Truncated {} document(s) from '{collection}'", removed.len());
        for old in removed {
            self.publish(collection, Some(old), None);
        }
        Ok(())
    }

    fn list_collections(&self) -> Result<BTreeSet<String>> {
        self.check_open()?;
        let mut state = self.inner.lock();
        Ok(state.database(&self.database)?.keys().cloned().collect())
    }

    fn create_collection(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.lock();
        let db = state.database(&self.database)?;
        if db.contains_key(name) {
            return Err(DocMapError::persistence(format!(
                "collection '{}.{name}' already exists",
                self.database
            )));
        }
        db.insert(name.to_string(), MemoryCollection::default());
        Ok(())
    }

    fn create_database(&self, name: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.lock();
        if state.databases.contains_key(name) {
            return Err(DocMapError::persistence(format!("database '{name}' already exists")));
        }
        state.databases.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    fn list_databases(&self) -> Result<BTreeSet<String>> {
        self.check_open()?;
        Ok(self.inner.lock().databases.keys().cloned().collect())
    }

    fn create_index(&self, collection: &str, field: &str) -> Result<()> {
        self.check_open()?;
        let mut state = self.inner.lock();
        let coll = state.collection(&self.database, collection)?;
        if !coll.indexes.insert(field.to_string()) {
            return Err(DocMapError::persistence(format!(
                "index '{field}' already exists on '{collection}'"
            )));
        }
        Ok(())
    }

    fn list_indexes(&self, collection: &str) -> Result<BTreeSet<String>> {
        self.check_open()?;
        let mut state = self.inner.lock();
        Ok(state.collection(&self.database, collection)?.indexes.clone())
    }

    fn watch(&self, collection: &str, predicate: Option<Predicate>) -> Result<WatchStream> {
        self.check_open()?;
        let mut state = self.inner.lock();
        state.collection(&self.database, collection)?;
        Ok(self.inner.hub.register(&self.database, collection, predicate))
    }

    fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("Closed in-memory connection to '{}'", self.database);
        }
        Ok(())
    }
}
