//! factline: an embedded, append-only fact store.
//!
//! The core primitive is a quintuple `(entity, attribute, value, txn, op)`.
//! Facts are never updated or deleted: a retraction is just another fact with
//! `op = false`, and the current value of anything is derived by letting the
//! latest fact win. Every commit gets the next txn number, so any past state
//! can be read back with [`Connection::as_of`].
//!
//! Attributes must be declared before use, with facts about the attribute
//! itself:
//!
//! ```rust,no_run
//! use factline::Connection;
//! use serde_json::json;
//!
//! let conn = Connection::open("my-facts.factline").unwrap();
//!
//! // Declare `email` as a multi-valued String attribute.
//! conn.transact(&json!([
//!     ["01", "_db/attribute", "email"],
//!     ["01", "_db/type", "String"],
//!     ["01", "_db/is-multi-valued", true]
//! ]), &json!({})).unwrap();
//!
//! // Assert, then retract.
//! conn.transact(&json!([["bob", "email", "bob@example.com"]]), &json!({})).unwrap();
//! let snap = conn
//!     .transact(&json!([["bob", "email", "bob@example.com", false]]), &json!({}))
//!     .unwrap();
//!
//! // Nothing live now...
//! assert!(snap.query(&json!(["bob", "email", "?email"]), &json!({})).unwrap().is_empty());
//!
//! // ...but the txn before still sees it.
//! let then = conn.as_of(snap.txn() - 1).unwrap();
//! let rows = then.query(&json!(["bob", "email", "?email"]), &json!({})).unwrap();
//! assert_eq!(rows[0]["?email"], "bob@example.com");
//! ```

mod error;
mod hash_index;
mod index;
mod query;
mod schema;
mod snapshot;
mod storage;
mod transactor;
mod types;

use std::sync::Arc;

use redb::Database;
use serde_json::Value;

pub use error::{FactlineError, Result};
pub use index::{select_index, IndexOrder, Knowns};
pub use query::{escape, get_entity, q, query, Binding, WILDCARD};
pub use schema::{AttributeDef, Schema, DB_ATTRIBUTE, DB_IS_MULTI_VALUED, DB_TYPE};
pub use snapshot::Snapshot;
pub use storage::TxnRecord;
pub use types::{TypeRegistry, ValueType};

use transactor::Transactor;

/// Built-in value type names.
pub mod type_names {
    pub use crate::types::{BOOLEAN, DATE, ENTITY_ID, INTEGER, NUMBER, STRING};
}

/// Settings for [`Connection::open_with_options`].
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Value types attributes may declare. Defaults to the built-in set.
    pub types: TypeRegistry,
}

/// Open a connection to the store at `path`. Same as
/// [`Connection::open_with_options`].
pub fn open(path: &str, options: Options) -> Result<Connection> {
    Connection::open_with_options(path, options)
}

/// A handle on one fact store: its single writer plus snapshot factories.
///
/// A database file supports one `Connection` at a time. Share it across
/// threads by reference or `Arc`; concurrent [`transact`] calls queue up and
/// commit in arrival order.
///
/// [`transact`]: Connection::transact
pub struct Connection {
    transactor: Transactor,
}

impl Connection {
    /// Open or create a store at the given path with default options.
    pub fn open(path: &str) -> Result<Self> {
        Self::open_with_options(path, Options::default())
    }

    pub fn open_with_options(path: &str, options: Options) -> Result<Self> {
        let db = Database::create(path)?;
        Self::init(db, options)
    }

    /// Create an in-memory store (no file I/O). Data is lost on drop.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_in_memory_with_options(Options::default())
    }

    pub fn open_in_memory_with_options(options: Options) -> Result<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder().create_with_backend(backend)?;
        Self::init(db, options)
    }

    fn init(db: Database, options: Options) -> Result<Self> {
        let transactor = Transactor::open(Arc::new(db), Arc::new(options.types))?;
        Ok(Self { transactor })
    }

    /// Commit a batch of facts atomically under the next txn number.
    ///
    /// `facts` is a list of `[e, a, v]`, `[e, a, v, op]` or
    /// `[e, a, v, null, op]`; `op` defaults to `true` (assert). Any element
    /// equal to a key of `binding` is replaced by the bound value first.
    ///
    /// # Errors
    ///
    /// The whole batch is rejected, and no txn number used, if any fact names
    /// an attribute the catalog does not know ([`FactlineError::AttributeNotFound`]),
    /// carries a value its attribute's type rejects
    /// ([`FactlineError::InvalidValueType`]), or is malformed.
    pub fn transact(&self, facts: &Value, binding: &Value) -> Result<Snapshot> {
        self.transactor.transact(facts, binding)
    }

    /// Snapshot of the latest commit.
    pub fn snap(&self) -> Result<Snapshot> {
        self.transactor.snap()
    }

    /// Snapshot of the store as it was right after `txn` committed.
    pub fn as_of(&self, txn: u64) -> Result<Snapshot> {
        self.transactor.as_of(txn)
    }

    pub fn query(
        &self,
        snapshot: &Snapshot,
        pattern: &Value,
        binding: &Value,
    ) -> Result<Vec<Binding>> {
        query::query(snapshot, pattern, binding)
    }

    pub fn q(
        &self,
        snapshot: &Snapshot,
        patterns: &Value,
        bindings: &Value,
    ) -> Result<Vec<Binding>> {
        query::q(snapshot, patterns, bindings)
    }

    pub fn get_entity(&self, snapshot: &Snapshot, entity: &str) -> Result<Option<Binding>> {
        query::get_entity(snapshot, entity)
    }

    /// When `txn` was committed and how many facts it carried.
    pub fn txn_record(&self, txn: u64) -> Result<Option<TxnRecord>> {
        self.transactor.txn_record(txn)
    }
}
