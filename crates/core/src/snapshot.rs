use std::sync::Arc;

use redb::Database;
use serde_json::Value;

use crate::error::Result;
use crate::query::{self, Binding};
use crate::schema::Schema;
use crate::types::{TypeRegistry, ValueType};

/// An immutable, txn-bound read view.
///
/// Queries against a snapshot only ever see facts with `txn <= self.txn()`,
/// whatever the writer commits meanwhile. Cloning is cheap.
#[derive(Clone)]
pub struct Snapshot {
    db: Arc<Database>,
    txn: u64,
    types: Arc<TypeRegistry>,
    schema: Arc<Schema>,
}

impl Snapshot {
    pub(crate) fn new(
        db: Arc<Database>,
        txn: u64,
        types: Arc<TypeRegistry>,
        schema: Arc<Schema>,
    ) -> Self {
        Self {
            db,
            txn,
            types,
            schema,
        }
    }

    /// The txn this view is bound to.
    pub fn txn(&self) -> u64 {
        self.txn
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    /// Registered type of an attribute, by name.
    pub(crate) fn type_for_attribute(&self, name: &str) -> Option<&ValueType> {
        self.schema
            .attribute(name)
            .and_then(|def| self.types.get(&def.type_name))
    }

    /// Registered type of an attribute, by the content hash of its name.
    pub(crate) fn type_for_attribute_hash(&self, hash: &str) -> Option<&ValueType> {
        self.schema
            .attribute_for_hash(hash)
            .and_then(|def| self.types.get(&def.type_name))
    }

    /// See [`query::query`].
    pub fn query(&self, pattern: &Value, binding: &Value) -> Result<Vec<Binding>> {
        query::query(self, pattern, binding)
    }

    /// See [`query::q`].
    pub fn q(&self, patterns: &Value, bindings: &Value) -> Result<Vec<Binding>> {
        query::q(self, patterns, bindings)
    }

    /// See [`query::get_entity`].
    pub fn get_entity(&self, entity: &str) -> Result<Option<Binding>> {
        query::get_entity(self, entity)
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("txn", &self.txn)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}
