//! The document store collaborator.
//!
//! The engine only talks to a store through [`Backend`] and [`Connection`].
//! Two implementations ship with the crate: [`MemoryBackend`] (in-process,
//! used by the tests) and [`SqliteBackend`] (documents as JSON rows).

mod hub;
mod memory;
mod query;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

pub(crate) use hub::{FeedHub, SharedHub};

use crate::config::Config;
use crate::document::Document;
use crate::error::{DocMapError, Result};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::mpsc::{Receiver, RecvError};
use std::sync::Arc;

/// Opens connections to a document store.
pub trait Backend: Send + Sync {
    fn connect(&self, config: &Config) -> Result<Box<dyn Connection>>;
}

/// One open connection, bound to the configured database.
///
/// Write failures are reported as [`DocMapError::Persistence`]. A point read
/// of a missing id is `Ok(None)`, never an error.
pub trait Connection: Send + Sync {
    /// Insert a new document and return the id the store assigned.
    fn insert(&self, collection: &str, document: Document) -> Result<String>;

    /// Merge `partial` into the stored document `id`.
    fn update(&self, collection: &str, id: &str, partial: Document) -> Result<()>;

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    fn delete(&self, collection: &str, id: &str) -> Result<()>;

    fn query(
        &self,
        collection: &str,
        predicate: &Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Document>>;

    /// Remove every document of a collection.
    fn truncate(&self, collection: &str) -> Result<()>;

    fn list_collections(&self) -> Result<BTreeSet<String>>;

    fn create_collection(&self, name: &str) -> Result<()>;

    fn create_database(&self, name: &str) -> Result<()>;

    fn list_databases(&self) -> Result<BTreeSet<String>>;

    fn create_index(&self, collection: &str, field: &str) -> Result<()>;

    fn list_indexes(&self, collection: &str) -> Result<BTreeSet<String>>;

    /// Open a change stream on a collection. The predicate is evaluated by
    /// the store; a change is delivered when either side matches.
    fn watch(&self, collection: &str, predicate: Option<Predicate>) -> Result<WatchStream>;

    /// Release the connection. Further calls fail; closing twice is a no-op.
    fn close(&self) -> Result<()>;
}

/// Opaque filter evaluated by the store.
#[derive(Clone)]
pub enum Predicate {
    All,
    /// Every key equals the given value; a missing key counts as null.
    Match(Document),
    Where(Arc<dyn Fn(&Document) -> bool + Send + Sync>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
}

impl Predicate {
    pub fn eq(field: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        let mut doc = Document::new();
        doc.insert(field.into(), value.into());
        Predicate::Match(doc)
    }

    /// Build a `Match` from a JSON object; anything else matches nothing.
    pub fn matching(value: JsonValue) -> Self {
        match value {
            JsonValue::Object(doc) => Predicate::Match(doc),
            _ => Predicate::Where(Arc::new(|_| false)),
        }
    }

    pub fn func(f: impl Fn(&Document) -> bool + Send + Sync + 'static) -> Self {
        Predicate::Where(Arc::new(f))
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::All => other,
            Predicate::And(mut parts) => {
                parts.push(other);
                Predicate::And(parts)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut parts) => {
                parts.push(other);
                Predicate::Or(parts)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    pub fn matches(&self, doc: &Document) -> bool {
        query::evaluate(self, doc)
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Predicate::All
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::All => f.write_str("All"),
            Predicate::Match(doc) => f.debug_tuple("Match").field(doc).finish(),
            Predicate::Where(_) => f.write_str("Where(<fn>)"),
            Predicate::And(parts) => f.debug_tuple("And").field(parts).finish(),
            Predicate::Or(parts) => f.debug_tuple("Or").field(parts).finish(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(field: impl Into<String>) -> Self {
        OrderBy {
            field: field.into(),
            descending: false,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        OrderBy {
            field: field.into(),
            descending: true,
        }
    }
}

/// Paging and ordering for queries. Without `order_by`, results come back in
/// insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub order_by: Option<OrderBy>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by = Some(order);
        self
    }
}

/// One committed write as seen by a watcher.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub old: Option<Document>,
    pub new: Option<Document>,
}

/// What a watch channel carries.
#[derive(Debug, Clone)]
pub enum WatchMessage {
    Change(WatchEvent),
    /// The watch was cancelled by its owner.
    Closed,
    /// The transport went away.
    Dropped(String),
}

/// Receiving side of a change stream. Dropping it cancels the watch.
pub struct WatchStream {
    collection: String,
    receiver: Receiver<WatchMessage>,
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl WatchStream {
    /// `cancel` must be idempotent and must make a blocked `recv` return.
    pub fn new(
        collection: impl Into<String>,
        receiver: Receiver<WatchMessage>,
        cancel: Arc<dyn Fn() + Send + Sync>,
    ) -> Self {
        WatchStream {
            collection: collection.into(),
            receiver,
            cancel,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Block until the next message. A disconnected channel reads as a drop.
    pub fn recv(&self) -> WatchMessage {
        match self.receiver.recv() {
            Ok(message) => message,
            Err(RecvError) => WatchMessage::Dropped("change stream channel disconnected".into()),
        }
    }

    /// A handle that cancels this stream from any thread.
    pub fn canceller(&self) -> Arc<dyn Fn() + Send + Sync> {
        self.cancel.clone()
    }
}

impl Drop for WatchStream {
    fn drop(&mut self) {
        (self.cancel)();
    }
}

impl fmt::Debug for WatchStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchStream")
            .field("collection", &self.collection)
            .finish()
    }
}

pub(crate) fn closed_error() -> DocMapError {
    DocMapError::persistence("connection is closed")
}
