//! redb table layout.
//!
//! - `facts`: every quintuple under each of the four orderings, value-less.
//! - `hashes` / `values`: the content-address store (see `hash_index`).
//! - `txns`: one JSON [`TxnRecord`] per committed transaction.

use chrono::{DateTime, Utc};
use redb::{Database, ReadTransaction, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::hash_index::HashWriter;
use crate::index::{parse_key, IndexOrder};
use crate::schema::RESERVED_ATTRIBUTES;

pub(crate) const FACTS: TableDefinition<&str, ()> = TableDefinition::new("facts");
pub(crate) const HASHES: TableDefinition<&str, &str> = TableDefinition::new("hashes");
pub(crate) const VALUES: TableDefinition<&str, &str> = TableDefinition::new("values");
pub(crate) const TXNS: TableDefinition<u64, &str> = TableDefinition::new("txns");

/// Audit entry written alongside every commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnRecord {
    pub txn: u64,
    pub committed_at: DateTime<Utc>,
    /// Number of facts in the batch.
    pub fact_count: usize,
}

/// Create every table and the content addresses of the reserved attribute
/// names, so that a fresh file is immediately queryable.
pub(crate) fn init(db: &Database) -> Result<()> {
    let write_txn = db.begin_write()?;
    write_txn.open_table(FACTS)?;
    write_txn.open_table(TXNS)?;
    {
        let mut hashes = HashWriter::open(&write_txn)?;
        for name in RESERVED_ATTRIBUTES {
            hashes.get_or_create(name)?;
        }
    }
    write_txn.commit()?;
    Ok(())
}

/// Highest committed txn, read from the tail of the `teavo` ordering.
/// `0` for an empty store.
pub(crate) fn last_txn(read_txn: &ReadTransaction) -> Result<u64> {
    let facts = read_txn.open_table(FACTS)?;
    let start = IndexOrder::Teav.key_space();
    // '"' is the byte right after the '!' separator.
    let end = format!("{}\"", IndexOrder::Teav.name());
    let mut range = facts.range(start.as_str()..end.as_str())?;
    match range.next_back() {
        Some(entry) => {
            let (key, _) = entry?;
            Ok(parse_key(key.value())?.t)
        }
        None => Ok(0),
    }
}

pub(crate) fn write_txn_record(write_txn: &WriteTransaction, record: &TxnRecord) -> Result<()> {
    let json = serde_json::to_string(record)?;
    let mut txns = write_txn.open_table(TXNS)?;
    txns.insert(record.txn, json.as_str())?;
    Ok(())
}

pub(crate) fn read_txn_record(read_txn: &ReadTransaction, txn: u64) -> Result<Option<TxnRecord>> {
    let txns = read_txn.open_table(TXNS)?;
    let json: Option<String> = txns.get(txn)?.map(|guard| guard.value().to_string());
    match json {
        Some(json) => Ok(Some(serde_json::from_str(&json)?)),
        None => Ok(None),
    }
}
