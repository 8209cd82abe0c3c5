use crate::backend::{Connection, Predicate, QueryOptions};
use crate::build::{self, LinkResolver};
use crate::document::{Document, DELETED_AT, ID};
use crate::error::Result;
use crate::record::Record;
use crate::schema::Schema;
use serde_json::Value as JsonValue;

/// Read path shared by sessions and subscriptions: point reads and queries
/// with the soft-delete scope applied, built into records.
pub(crate) struct Reader<'a> {
    pub(crate) schema: &'a Schema,
    pub(crate) conn: &'a dyn Connection,
    pub(crate) soft_delete: bool,
}

impl<'a> Reader<'a> {
    /// Conjoin `deleted_at = null` when soft delete is on.
    pub(crate) fn scoped(&self, predicate: Predicate) -> Predicate {
        if self.soft_delete {
            Predicate::eq(DELETED_AT, JsonValue::Null).and(predicate)
        } else {
            predicate
        }
    }

    pub(crate) fn get_document(&self, type_name: &str, id: &str) -> Result<Option<Document>> {
        let collection = self.schema.get(type_name)?.collection();
        if self.soft_delete {
            let predicate = self.scoped(Predicate::eq(ID, id));
            let found = self
                .conn
                .query(collection, &predicate, &QueryOptions::new().limit(1))?;
            Ok(found.into_iter().next())
        } else {
            self.conn.get(collection, id)
        }
    }

    pub(crate) fn get(&self, type_name: &str, id: &str) -> Result<Option<Record>> {
        self.get_document(type_name, id)?
            .map(|doc| self.build(type_name, &doc))
            .transpose()
    }

    pub(crate) fn filter(
        &self,
        type_name: &str,
        predicate: Predicate,
        options: &QueryOptions,
    ) -> Result<Vec<Record>> {
        let collection = self.schema.get(type_name)?.collection();
        let predicate = self.scoped(predicate);
        log::debug!("Querying '{collection}' with {predicate:?}");
        self.conn
            .query(collection, &predicate, options)?
            .iter()
            .map(|doc| self.build(type_name, doc))
            .collect()
    }

    pub(crate) fn build(&self, type_name: &str, doc: &Document) -> Result<Record> {
        build::from_document(self.schema, type_name, doc, self)
    }
}

impl LinkResolver for Reader<'_> {
    fn resolve(&self, type_name: &str, id: &str) -> Result<Option<Record>> {
        self.get(type_name, id)
    }
}
