//! Provisioning: make sure the configured database and every collection and
//! index declared by a schema exist.

use crate::backend::{Backend, Connection};
use crate::config::Config;
use crate::error::Result;
use crate::schema::Schema;

/// Create the configured database if it is missing. Returns true when it
/// had to be created.
pub fn check_db(backend: &dyn Backend, config: &Config) -> Result<bool> {
    let conn = backend.connect(config)?;
    let result = ensure_database(conn.as_ref(), &config.database);
    conn.close()?;
    result
}

fn ensure_database(conn: &dyn Connection, database: &str) -> Result<bool> {
    if conn.list_databases()?.contains(database) {
        log::debug!("Database '{database}' already exists");
        return Ok(false);
    }
    conn.create_database(database)?;
    log::info!("Created database '{database}'");
    Ok(true)
}

/// Create every missing collection and declared index. Returns the names of
/// the collections that were created, in declaration order.
pub fn sync_schema(backend: &dyn Backend, config: &Config, schema: &Schema) -> Result<Vec<String>> {
    let conn = backend.connect(config)?;
    let result = ensure_collections(conn.as_ref(), schema);
    conn.close()?;
    result
}

fn ensure_collections(conn: &dyn Connection, schema: &Schema) -> Result<Vec<String>> {
    let mut existing = conn.list_collections()?;
    let mut created = Vec::new();

    for record in schema.records() {
        let collection = record.collection();
        if existing.insert(collection.to_string()) {
            conn.create_collection(collection)?;
            log::info!("Created collection '{collection}' for {}", record.name());
            created.push(collection.to_string());
        }

        let indexes = conn.list_indexes(collection)?;
        for field in record.indexes() {
            if !indexes.contains(field) {
                conn.create_index(collection, field)?;
                log::info!("Created index '{field}' on '{collection}'");
            }
        }
    }
    Ok(created)
}
