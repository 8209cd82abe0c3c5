//! Change feed: a blocking iterator over committed writes to one record type.
//!
//! Each subscription owns its own connection. Pulling the next change
//! suspends the calling thread until a write arrives, the subscription is
//! closed through a [`FeedCloser`], or the transport drops.

use crate::backend::{Backend, Connection, Predicate, WatchEvent, WatchMessage, WatchStream};
use crate::config::Config;
use crate::document::{self, Document};
use crate::error::{DocMapError, Result};
use crate::record::Record;
use crate::schema::Schema;
use crate::session::Reader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// One observed write: `previous` is `None` for a creation, `current` is
/// `None` for a hard delete.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub previous: Option<Record>,
    pub current: Option<Record>,
}

impl Change {
    pub fn is_create(&self) -> bool {
        self.previous.is_none() && self.current.is_some()
    }

    pub fn is_update(&self) -> bool {
        self.previous.is_some() && self.current.is_some()
    }

    pub fn is_delete(&self) -> bool {
        self.previous.is_some() && self.current.is_none()
    }
}

/// Cancels a subscription from any thread. A blocked `next()` returns `None`.
#[derive(Clone)]
pub struct FeedCloser {
    closed: Arc<AtomicBool>,
    cancel: Arc<dyn Fn() + Send + Sync>,
}

impl FeedCloser {
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("Closing change feed");
        }
        (self.cancel)();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

pub struct Subscription {
    schema: Arc<Schema>,
    type_name: String,
    collection: String,
    soft_delete: bool,
    conn: Box<dyn Connection>,
    stream: Option<WatchStream>,
    closer: FeedCloser,
}

impl Subscription {
    pub(crate) fn open(
        schema: Arc<Schema>,
        backend: &dyn Backend,
        config: &Config,
        type_name: &str,
        predicate: Option<Predicate>,
    ) -> Result<Self> {
        let collection = schema.get(type_name)?.collection().to_string();
        let conn = backend.connect(config)?;
        let stream = conn.watch(&collection, predicate)?;
        log::info!("Subscribed to changes on '{collection}'");

        let closer = FeedCloser {
            closed: Arc::new(AtomicBool::new(false)),
            cancel: stream.canceller(),
        };
        Ok(Subscription {
            schema,
            type_name: type_name.to_string(),
            collection,
            soft_delete: config.soft_delete,
            conn,
            stream: Some(stream),
            closer,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn closer(&self) -> FeedCloser {
        self.closer.clone()
    }

    /// Stop delivery and release the connection.
    pub fn close(&mut self) {
        self.closer.close();
        self.release();
    }

    fn release(&mut self) {
        if self.stream.take().is_some() {
            if let Err(e) = self.conn.close() {
                log::warn!("Failed to close feed connection: {e}");
            }
        }
    }

    /// Soft-deleted documents stay invisible to the feed, except for the
    /// transition that deletes them.
    fn hidden(&self, event: &WatchEvent) -> bool {
        if !self.soft_delete {
            return false;
        }
        match (&event.old, &event.new) {
            (Some(old), _) => document::is_soft_deleted(old),
            (None, Some(new)) => document::is_soft_deleted(new),
            (None, None) => true,
        }
    }

    fn build(&self, doc: Option<&Document>) -> Result<Option<Record>> {
        let reader = Reader {
            schema: &self.schema,
            conn: self.conn.as_ref(),
            soft_delete: self.soft_delete,
        };
        doc.map(|d| reader.build(&self.type_name, d)).transpose()
    }
}

impl Iterator for Subscription {
    type Item = Result<Change>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.closer.is_closed() {
                self.release();
                return None;
            }
            let message = self.stream.as_ref()?.recv();
            match message {
                WatchMessage::Change(event) => {
                    if self.hidden(&event) {
                        continue;
                    }
                    let change = self.build(event.old.as_ref()).and_then(|previous| {
                        let current = self.build(event.new.as_ref())?;
                        Ok(Change { previous, current })
                    });
                    return Some(change);
                }
                WatchMessage::Closed => {
                    self.release();
                    return None;
                }
                WatchMessage::Dropped(reason) => {
                    self.release();
                    if self.closer.is_closed() {
                        return None;
                    }
                    log::warn!("Change feed on '{}' dropped: {reason}", self.collection);
                    return Some(Err(DocMapError::FeedDisconnected {
                        collection: self.collection.clone(),
                        reason,
                    }));
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
