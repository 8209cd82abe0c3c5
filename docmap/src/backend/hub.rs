// Fan-out of committed writes to watch streams.
//
// Every backend owns one hub. Events reach it in commit order: the memory
// backend publishes while still holding its state lock, the SQLite backend
// replays its change log in sequence.

use super::{Predicate, WatchEvent, WatchMessage, WatchStream};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub(crate) type SharedHub = Arc<FeedHub>;

struct Watcher {
    database: String,
    collection: String,
    predicate: Option<Predicate>,
    sender: Sender<WatchMessage>,
}

impl Watcher {
    fn wants(&self, database: &str, collection: &str, event: &WatchEvent) -> bool {
        if self.database != database || self.collection != collection {
            return false;
        }
        match &self.predicate {
            None => true,
            Some(p) => {
                event.old.as_ref().map_or(false, |d| p.matches(d))
                    || event.new.as_ref().map_or(false, |d| p.matches(d))
            }
        }
    }
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    watchers: BTreeMap<u64, Watcher>,
}

#[derive(Default)]
pub(crate) struct FeedHub {
    state: Mutex<HubState>,
}

impl FeedHub {
    pub(crate) fn new() -> SharedHub {
        Arc::new(FeedHub::default())
    }

    fn state(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Open a stream of changes on one collection of one database.
    pub(crate) fn register(
        self: &Arc<Self>,
        database: &str,
        collection: &str,
        predicate: Option<Predicate>,
    ) -> WatchStream {
        let (sender, receiver) = mpsc::channel();
        let id = {
            let mut state = self.state();
            let id = state.next_id;
            state.next_id += 1;
            state.watchers.insert(
                id,
                Watcher {
                    database: database.to_string(),
                    collection: collection.to_string(),
                    predicate,
                    sender,
                },
            );
            id
        };
        log::debug!("Watching {database}.{collection} (watcher {id})");

        let hub: Weak<FeedHub> = Arc::downgrade(self);
        let cancel = Arc::new(move || {
            if let Some(hub) = hub.upgrade() {
                hub.unregister(id);
            }
        });
        WatchStream::new(collection, receiver, cancel)
    }

    fn unregister(&self, id: u64) {
        if let Some(watcher) = self.state().watchers.remove(&id) {
            let _ = watcher.sender.send(WatchMessage::Closed);
            log::debug!("Watcher {id} on {} closed", watcher.collection);
        }
    }

    pub(crate) fn publish(&self, database: &str, collection: &str, event: WatchEvent) {
        let mut state = self.state();
        // receivers that are gone are pruned as we go
        state.watchers.retain(|_, watcher| {
            if !watcher.wants(database, collection, &event) {
                return true;
            }
            watcher
                .sender
                .send(WatchMessage::Change(event.clone()))
                .is_ok()
        });
    }

    /// End every open stream as if the transport had failed.
    pub(crate) fn disconnect_all(&self, reason: &str) {
        let watchers = std::mem::take(&mut self.state().watchers);
        if !watchers.is_empty() {
            log::warn!("Dropping {} change stream(s): {reason}", watchers.len());
        }
        for watcher in watchers.into_values() {
            let _ = watcher.sender.send(WatchMessage::Dropped(reason.to_string()));
        }
    }

    #[cfg(test)]
    fn watcher_count(&self) -> usize {
        self.state().watchers.len()
    }
}

impl Drop for FeedHub {
    fn drop(&mut self) {
        self.disconnect_all("backend shut down");
    }
}
