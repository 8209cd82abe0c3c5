use super::query::run_query;
use super::{closed_error, Backend, Connection, FeedHub, Predicate, QueryOptions, SharedHub, WatchEvent, WatchStream};
use crate::config::Config;
use crate::document::{Document, ID};
use crate::error::{DocMapError, Result};
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde_json::Value as JsonValue;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread;
use std::time::Duration;

type SharedConn = Arc<Mutex<rusqlite::Connection>>;

/// How often the change log is checked for writes from other connections.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Busy timeout for the change-log reader, which has no session config.
const TAIL_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Change-log rows kept behind the newest one. A reader that falls further
/// behind than this loses events and has its streams dropped.
const CHANGE_LOG_RETAIN: i64 = 10_000;

enum Target {
    File(PathBuf),
    /// In-memory databases live as long as this one connection, so every
    /// session shares it.
    Memory(SharedConn),
}

struct SqliteInner {
    target: Target,
    /// Serializes this process's writers; other processes wait on SQLite's lock.
    write_lock: Mutex<()>,
    hub: SharedHub,
    /// Change-log reader, started by the first watch.
    tail: Mutex<Option<Tail>>,
}

/// Cursor into the `changes` table. Every committed write, from any process,
/// appends its events there; the tail publishes them to the hub in `seq` order.
struct Tail {
    conn: SharedConn,
    cursor: i64,
}

/// Documents stored as JSON rows in a single SQLite file.
#[derive(Clone)]
pub struct SqliteBackend {
    inner: Arc<SqliteInner>,
}

impl SqliteBackend {
    /// Open or create the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)?;
        initialize_tables(&conn)?;
        log::info!("Opened document store at {}", path.display());
        Ok(Self::with_target(Target::File(path.to_path_buf())))
    }

    /// Open a private in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        initialize_tables(&conn)?;
        Ok(Self::with_target(Target::Memory(Arc::new(Mutex::new(conn)))))
    }

    fn with_target(target: Target) -> Self {
        SqliteBackend {
            inner: Arc::new(SqliteInner {
                target,
                write_lock: Mutex::new(()),
                hub: FeedHub::new(),
                tail: Mutex::new(None),
            }),
        }
    }

    /// Fail every open change stream, as a lost server connection would.
    pub fn disconnect_feeds(&self) {
        self.inner.hub.disconnect_all("connection to the store was lost");
    }
}

fn initialize_tables(conn: &rusqlite::Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS databases (
            name TEXT PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS collections (
            database TEXT NOT NULL,
            name TEXT NOT NULL,
            PRIMARY KEY (database, name)
        );

        CREATE TABLE IF NOT EXISTS indexes (
            database TEXT NOT NULL,
            collection TEXT NOT NULL,
            field TEXT NOT NULL,
            PRIMARY KEY (database, collection, field)
        );

        CREATE TABLE IF NOT EXISTS documents (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            database TEXT NOT NULL,
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            data_json TEXT NOT NULL,
            UNIQUE (database, collection, id)
        );

        CREATE INDEX IF NOT EXISTS idx_documents_collection ON documents(database, collection);

        CREATE TABLE IF NOT EXISTS changes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            database TEXT NOT NULL,
            collection TEXT NOT NULL,
            old_json TEXT,
            new_json TEXT
        );
        ",
    )?;
    Ok(())
}

impl SqliteInner {
    fn open_tail_conn(&self) -> Result<SharedConn> {
        match &self.target {
            Target::File(path) => {
                let conn = rusqlite::Connection::open(path)?;
                conn.busy_timeout(TAIL_BUSY_TIMEOUT)?;
                Ok(Arc::new(Mutex::new(conn)))
            }
            Target::Memory(shared) => Ok(shared.clone()),
        }
    }
}

/// Lock the change-log tail, starting it (and its polling thread) on first use.
/// The cursor starts at the newest logged change, so only later writes are seen.
fn follow(inner: &Arc<SqliteInner>) -> Result<MutexGuard<'_, Option<Tail>>> {
    let mut tail = lock(&inner.tail);
    if tail.is_none() {
        let conn = inner.open_tail_conn()?;
        let cursor: i64 = lock(&conn).query_row("SELECT COALESCE(MAX(seq), 0) FROM changes", [], |row| {
            row.get(0)
        })?;
        *tail = Some(Tail { conn, cursor });

        let weak = Arc::downgrade(inner);
        thread::Builder::new()
            .name("docmap-sqlite-feed".into())
            .spawn(move || poll_changes(weak))?;
        log::debug!("Following change log from seq {cursor}");
    }
    Ok(tail)
}

fn poll_changes(inner: Weak<SqliteInner>) {
    loop {
        thread::sleep(POLL_INTERVAL);
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let mut tail = lock(&inner.tail);
        if let Some(tail) = tail.as_mut() {
            if let Err(e) = drain(tail, &inner.hub) {
                log::warn!("Failed to read change log: {e}");
            }
        }
    }
    log::debug!("Change log reader stopped");
}

/// Publish every change logged after the cursor and advance it.
fn drain(tail: &mut Tail, hub: &FeedHub) -> Result<()> {
    let conn = lock(&tail.conn);
    let oldest: Option<i64> = conn.query_row("SELECT MIN(seq) FROM changes", [], |row| row.get(0))?;
    if let Some(oldest) = oldest {
        if oldest > tail.cursor + 1 {
            hub.disconnect_all("change log overran its readers");
            tail.cursor = oldest - 1;
        }
    }

    let mut stmt = conn.prepare(
        "SELECT seq, database, collection, old_json, new_json FROM changes WHERE seq > ?1 ORDER BY seq",
    )?;
    let rows = stmt.query_map(params![tail.cursor], |row| {
        Ok((
            row.get::<_, i64>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, Option<String>>(3)?,
            row.get::<_, Option<String>>(4)?,
        ))
    })?;

    for row in rows {
        let (seq, database, collection, old, new) = row?;
        let event = WatchEvent {
            old: old.map(|json| serde_json::from_str::<Document>(&json)).transpose()?,
            new: new.map(|json| serde_json::from_str::<Document>(&json)).transpose()?,
        };
        hub.publish(&database, &collection, event);
        tail.cursor = seq;
    }
    Ok(())
}

fn log_change(conn: &rusqlite::Connection, database: &str, collection: &str, event: &WatchEvent) -> Result<()> {
    let old = event.old.as_ref().map(serde_json::to_string).transpose()?;
    let new = event.new.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO changes (database, collection, old_json, new_json) VALUES (?1, ?2, ?3, ?4)",
        params![database, collection, old, new],
    )?;
    Ok(())
}

impl Backend for SqliteBackend {
    fn connect(&self, config: &Config) -> Result<Box<dyn Connection>> {
        let handle = match &self.inner.target {
            Target::File(path) => {
                let conn = rusqlite::Connection::open(path)?;
                conn.busy_timeout(config.timeout)?;
                Arc::new(Mutex::new(conn))
            }
            Target::Memory(shared) => shared.clone(),
        };
        log::debug!("Opening SQLite connection to database '{}'", config.database);
        Ok(Box::new(SqliteConnection {
            handle: Mutex::new(Some(handle)),
            database: config.database.clone(),
            backend: self.inner.clone(),
        }))
    }
}

struct SqliteConnection {
    handle: Mutex<Option<SharedConn>>,
    database: String,
    backend: Arc<SqliteInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// SQLite failures during an operation are store failures to the caller.
fn into_persistence(err: DocMapError) -> DocMapError {
    match err {
        DocMapError::Sqlite(e) => DocMapError::persistence(e.to_string()),
        other => other,
    }
}

impl SqliteConnection {
    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let handle = lock(&self.handle).clone().ok_or_else(closed_error)?;
        let conn = lock(&handle);
        f(&*conn).map_err(into_persistence)
    }

    /// Run a write in one transaction together with the change-log rows for
    /// its events. Watchers pick the rows up from the log, whichever process
    /// made the write.
    fn write<T>(
        &self,
        collection: &str,
        f: impl FnOnce(&rusqlite::Connection) -> Result<(T, Vec<WatchEvent>)>,
    ) -> Result<T> {
        let _guard = lock(&self.backend.write_lock);
        self.with_conn(|conn| {
            let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
            let (out, events) = f(&*tx)?;
            for event in &events {
                log_change(&tx, &self.database, collection, event)?;
            }
            if !events.is_empty() {
                tx.execute(
                    "DELETE FROM changes WHERE seq <= (SELECT MAX(seq) FROM changes) - ?1",
                    params![CHANGE_LOG_RETAIN],
                )?;
            }
            tx.commit()?;
            Ok(out)
        })
    }

    fn require_database(&self, conn: &rusqlite::Connection) -> Result<()> {
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM databases WHERE name = ?1",
                params![self.database],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            Some(_) => Ok(()),
            None => Err(DocMapError::persistence(format!(
                "database '{}' does not exist",
                self.database
            ))),
        }
    }

    fn require_collection(&self, conn: &rusqlite::Connection, collection: &str) -> Result<()> {
        self.require_database(conn)?;
        let found: Option<String> = conn
            .query_row(
                "SELECT name FROM collections WHERE database = ?1 AND name = ?2",
                params![self.database, collection],
                |row| row.get(0),
            )
            .optional()?;
        match found {
            Some(_) => Ok(()),
            None => Err(DocMapError::persistence(format!(
                "collection '{}.{collection}' does not exist",
                self.database
            ))),
        }
    }

    fn load(&self, conn: &rusqlite::Connection, collection: &str, id: &str) -> Result<Option<Document>> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data_json FROM documents WHERE database = ?1 AND collection = ?2 AND id = ?3",
                params![self.database, collection, id],
                |row| row.get(0),
            )
            .optional()?;
        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    fn load_all(&self, conn: &rusqlite::Connection, collection: &str) -> Result<Vec<Document>> {
        let mut stmt = conn.prepare(
            "SELECT data_json FROM documents WHERE database = ?1 AND collection = ?2 ORDER BY seq",
        )?;
        let rows = stmt.query_map(params![self.database, collection], |row| row.get::<_, String>(0))?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(serde_json::from_str(&row?)?);
        }
        Ok(docs)
    }

    fn missing(&self, collection: &str, id: &str) -> DocMapError {
        DocMapError::persistence(format!("no document '{id}' in '{collection}'"))
    }
}

impl Connection for SqliteConnection {
    fn insert(&self, collection: &str, mut document: Document) -> Result<String> {
        self.write(collection, |conn| {
            self.require_collection(conn, collection)?;
            let id = match document.get(ID) {
                Some(JsonValue::String(id)) => id.clone(),
                _ => ulid::Ulid::new().to_string().to_lowercase(),
            };
            if self.load(conn, collection, &id)?.is_some() {
                return Err(DocMapError::persistence(format!(
                    "duplicate primary key '{id}' in '{collection}'"
                )));
            }
            document.insert(ID.into(), JsonValue::String(id.clone()));
            conn.execute(
                "INSERT INTO documents (database, collection, id, data_json) VALUES (?1, ?2, ?3, ?4)",
                params![self.database, collection, id, serde_json::to_string(&document)?],
            )?;
            Ok((id, vec![WatchEvent { old: None, new: Some(document) }]))
        })
    }

    fn update(&self, collection: &str, id: &str, partial: Document) -> Result<()> {
        self.write(collection, |conn| {
            self.require_collection(conn, collection)?;
            let old = self
                .load(conn, collection, id)?
                .ok_or_else(|| self.missing(collection, id))?;
            let mut new = old.clone();
            for (key, value) in partial {
                if key != ID {
                    new.insert(key, value);
                }
            }
            conn.execute(
                "UPDATE documents SET data_json = ?4 WHERE database = ?1 AND collection = ?2 AND id = ?3",
                params![self.database, collection, id, serde_json::to_string(&new)?],
            )?;
            Ok(((), vec![WatchEvent { old: Some(old), new: Some(new) }]))
        })
    }

    fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.with_conn(|conn| {
            self.require_collection(conn, collection)?;
            self.load(conn, collection, id)
        })
    }

    fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.write(collection, |conn| {
            self.require_collection(conn, collection)?;
            let old = self
                .load(conn, collection, id)?
                .ok_or_else(|| self.missing(collection, id))?;
            conn.execute(
                "DELETE FROM documents WHERE database = ?1 AND collection = ?2 AND id = ?3",
                params![self.database, collection, id],
            )?;
            Ok(((), vec![WatchEvent { old: Some(old), new: None }]))
        })
    }

    fn query(
        &self,
        collection: &str,
        predicate: &Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Document>> {
        self.with_conn(|conn| {
            self.require_collection(conn, collection)?;
            Ok(run_query(self.load_all(conn, collection)?, predicate, options))
        })
    }

    fn truncate(&self, collection: &str) -> Result<()> {
        self.write(collection, |conn| {
            self.require_collection(conn, collection)?;
            let removed = self.load_all(conn, collection)?;
            conn.execute(
                "DELETE FROM documents WHERE database = ?1 AND collection = ?2",
                params![self.database, collection],
            )?;
            log::debug!("Truncated {} document(s) from '{collection}'", removed.len());
            let events = removed
                .into_iter()
                .map(|old| WatchEvent { old: Some(old), new: None })
                .collect();
            Ok(((), events))
        })
    }

    fn list_collections(&self) -> Result<BTreeSet<String>> {
        self.with_conn(|conn| {
            self.require_database(conn)?;
            let mut stmt = conn.prepare("SELECT name FROM collections WHERE database = ?1")?;
            let rows = stmt.query_map(params![self.database], |row| row.get::<_, String>(0))?;
            let mut names = BTreeSet::new();
            for row in rows {
                names.insert(row?);
            }
            Ok(names)
        })
    }

    fn create_collection(&self, name: &str) -> Result<()> {
        self.write(name, |conn| {
            self.require_database(conn)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO collections (database, name) VALUES (?1, ?2)",
                params![self.database, name],
            )?;
            if inserted == 0 {
                return Err(DocMapError::persistence(format!(
                    "collection '{}.{name}' already exists",
                    self.database
                )));
            }
            Ok(((), Vec::new()))
        })
    }

    fn create_database(&self, name: &str) -> Result<()> {
        self.write(name, |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO databases (name) VALUES (?1)",
                params![name],
            )?;
            if inserted == 0 {
                return Err(DocMapError::persistence(format!("database '{name}' already exists")));
            }
            Ok(((), Vec::new()))
        })
    }

    fn list_databases(&self) -> Result<BTreeSet<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM databases")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            let mut names = BTreeSet::new();
            for row in rows {
                names.insert(row?);
            }
            Ok(names)
        })
    }

    fn create_index(&self, collection: &str, field: &str) -> Result<()> {
        self.write(collection, |conn| {
            self.require_collection(conn, collection)?;
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO indexes (database, collection, field) VALUES (?1, ?2, ?3)",
                params![self.database, collection, field],
            )?;
            if inserted == 0 {
                return Err(DocMapError::persistence(format!(
                    "index '{field}' already exists on '{collection}'"
                )));
            }
            Ok(((), Vec::new()))
        })
    }

    fn list_indexes(&self, collection: &str) -> Result<BTreeSet<String>> {
        self.with_conn(|conn| {
            self.require_collection(conn, collection)?;
            let mut stmt = conn.prepare(
                "SELECT field FROM indexes WHERE database = ?1 AND collection = ?2",
            )?;
            let rows = stmt.query_map(params![self.database, collection], |row| {
                row.get::<_, String>(0)
            })?;
            let mut fields = BTreeSet::new();
            for row in rows {
                fields.insert(row?);
            }
            Ok(fields)
        })
    }

    fn watch(&self, collection: &str, predicate: Option<Predicate>) -> Result<WatchStream> {
        self.with_conn(|conn| self.require_collection(conn, collection))?;
        // Changes already logged go to existing watchers before this one joins.
        let mut tail = follow(&self.backend).map_err(into_persistence)?;
        if let Some(tail) = tail.as_mut() {
            drain(tail, &self.backend.hub).map_err(into_persistence)?;
        }
        Ok(self.backend.hub.register(&self.database, collection, predicate))
    }

    fn close(&self) -> Result<()> {
        if lock(&self.handle).take().is_some() {
            log::debug!("Closed SQLite connection to '{}'", self.database);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{OrderBy, WatchMessage};
    use serde_json::json;
    use tempfile::TempDir;

    fn doc(value: JsonValue) -> Document {
        serde_json::from_value(value).unwrap()
    }

    fn provision(backend: &SqliteBackend) -> Box<dyn Connection> {
        let conn = backend.connect(&Config::default()).unwrap();
        conn.create_database("test").unwrap();
        conn.create_collection("users").unwrap();
        conn
    }

    #[test]
    fn test_crud_round_trip() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let conn = provision(&backend);

        let id = conn.insert("users", doc(json!({"name": "alice", "age": 1}))).unwrap();
        assert_eq!(id.len(), 26);
        assert_eq!(id, id.to_lowercase());

        conn.update("users", &id, doc(json!({"age": 2}))).unwrap();
        let stored = conn.get("users", &id).unwrap().unwrap();
        assert_eq!(stored["name"], json!("alice"));
        assert_eq!(stored["age"], json!(2));
        assert_eq!(stored["id"], json!(id));

        conn.delete("users", &id).unwrap();
        assert_eq!(conn.get("users", &id).unwrap(), None);
        assert!(matches!(
            conn.delete("users", &id),
            Err(DocMapError::Persistence(_))
        ));
    }

    #[test]
    fn test_data_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("store.db");

        let id = {
            let backend = SqliteBackend::open(&path).unwrap();
            let conn = provision(&backend);
            conn.create_index("users", "name").unwrap();
            conn.insert("users", doc(json!({"name": "kept"}))).unwrap()
        };

        let backend = SqliteBackend::open(&path).unwrap();
        let conn = backend.connect(&Config::default()).unwrap();
        assert!(conn.list_databases().unwrap().contains("test"));
        assert!(conn.list_indexes("users").unwrap().contains("name"));
        let stored = conn.get("users", &id).unwrap().unwrap();
        assert_eq!(stored["name"], json!("kept"));
    }

    #[test]
    fn test_query_preserves_insertion_order() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let conn = provision(&backend);
        for name in ["c", "a", "b"] {
            conn.insert("users", doc(json!({"name": name}))).unwrap();
        }

        let names = |found: Vec<Document>| -> Vec<JsonValue> {
            found.into_iter().map(|d| d["name"].clone()).collect()
        };
        let all = conn.query("users", &Predicate::All, &QueryOptions::new()).unwrap();
        assert_eq!(names(all), vec![json!("c"), json!("a"), json!("b")]);

        let sorted = conn
            .query(
                "users",
                &Predicate::All,
                &QueryOptions::new().order_by(OrderBy::asc("name")).offset(1),
            )
            .unwrap();
        assert_eq!(names(sorted), vec![json!("b"), json!("c")]);
    }

    #[test]
    fn test_missing_collection_is_persistence_error() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let conn = provision(&backend);
        assert!(matches!(
            conn.insert("posts", Document::new()),
            Err(DocMapError::Persistence(_))
        ));
        assert!(conn.create_database("test").is_err());
    }

    #[test]
    fn test_watch_across_connections() {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(&tmp.path().join("feed.db")).unwrap();
        let writer = provision(&backend);
        let reader = backend.connect(&Config::default()).unwrap();
        let stream = reader
            .watch("users", Some(Predicate::eq("name", "watched")))
            .unwrap();

        writer.insert("users", doc(json!({"name": "ignored"}))).unwrap();
        let id = writer.insert("users", doc(json!({"name": "watched"}))).unwrap();

        match stream.recv() {
            WatchMessage::Change(event) => {
                assert!(event.old.is_none());
                assert_eq!(event.new.unwrap()["id"], json!(id));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_watch_sees_writes_from_another_store_handle() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shared.db");
        let watching = SqliteBackend::open(&path).unwrap();
        let writing = SqliteBackend::open(&path).unwrap();

        let writer = provision(&writing);
        let reader = watching.connect(&Config::default()).unwrap();
        let stream = reader.watch("users", None).unwrap();

        let id = writer.insert("users", doc(json!({"name": "remote"}))).unwrap();
        writer.update("users", &id, doc(json!({"name": "renamed"}))).unwrap();

        match stream.recv() {
            WatchMessage::Change(event) => {
                assert!(event.old.is_none());
                assert_eq!(event.new.unwrap()["name"], json!("remote"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match stream.recv() {
            WatchMessage::Change(event) => {
                assert_eq!(event.old.unwrap()["name"], json!("remote"));
                assert_eq!(event.new.unwrap()["name"], json!("renamed"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_watch_starts_after_existing_changes() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let conn = provision(&backend);
        conn.insert("users", doc(json!({"name": "before"}))).unwrap();

        let stream = conn.watch("users", None).unwrap();
        conn.insert("users", doc(json!({"name": "after"}))).unwrap();

        match stream.recv() {
            WatchMessage::Change(event) => assert_eq!(event.new.unwrap()["name"], json!("after")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_failed_write_logs_no_change() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let conn = provision(&backend);
        let id = conn.insert("users", doc(json!({"name": "one"}))).unwrap();
        assert!(conn.insert("users", doc(json!({"id": id, "name": "two"}))).is_err());

        let logged: i64 = match &backend.inner.target {
            Target::Memory(shared) => lock(shared)
                .query_row("SELECT COUNT(*) FROM changes", [], |row| row.get(0))
                .unwrap(),
            Target::File(_) => unreachable!(),
        };
        assert_eq!(logged, 1);
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = SqliteBackend::open_in_memory().unwrap();
        let conn = provision(&backend);
        conn.close().unwrap();
        conn.close().unwrap();
        assert!(matches!(conn.list_collections(), Err(DocMapError::Persistence(_))));
    }
}
