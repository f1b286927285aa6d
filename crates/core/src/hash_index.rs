//! Content-addressed value store.
//!
//! Maps an encoded value to a short stable hash and back. Hashes are the
//! 16-hex-digit `xxh3` digest of the encoding; on the (unlikely) event that a
//! digest is already taken by a different encoding, the seed is bumped until a
//! free slot is found. The `values` table makes lookups independent of which
//! seed won, so a hash is only ever computed once per encoding.

use redb::{ReadOnlyTable, ReadTransaction, ReadableTable, Table, WriteTransaction};
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::error::{FactlineError, Result};
use crate::storage::{HASHES, VALUES};

fn digest(encoded: &str, seed: u64) -> String {
    format!("{:016x}", xxh3_64_with_seed(encoded.as_bytes(), seed))
}

/// Read side, bound to one read transaction.
pub(crate) struct HashReader {
    hashes: ReadOnlyTable<&'static str, &'static str>,
    values: ReadOnlyTable<&'static str, &'static str>,
}

impl HashReader {
    pub(crate) fn open(read_txn: &ReadTransaction) -> Result<Self> {
        Ok(Self {
            hashes: read_txn.open_table(HASHES)?,
            values: read_txn.open_table(VALUES)?,
        })
    }

    /// Hash of an encoding, or `None` if it was never stored.
    pub(crate) fn hash_of(&self, encoded: &str) -> Result<Option<String>> {
        Ok(self
            .values
            .get(encoded)?
            .map(|guard| guard.value().to_string()))
    }

    /// The encoding behind a hash. Every hash in a fact key must resolve.
    pub(crate) fn encoding_of(&self, hash: &str) -> Result<String> {
        self.hashes
            .get(hash)?
            .map(|guard| guard.value().to_string())
            .ok_or_else(|| FactlineError::Storage(format!("dangling content hash {hash}")))
    }
}

/// Write side, bound to one write transaction.
pub(crate) struct HashWriter<'txn> {
    hashes: Table<'txn, &'static str, &'static str>,
    values: Table<'txn, &'static str, &'static str>,
}

impl<'txn> HashWriter<'txn> {
    pub(crate) fn open(write_txn: &'txn WriteTransaction) -> Result<Self> {
        Ok(Self {
            hashes: write_txn.open_table(HASHES)?,
            values: write_txn.open_table(VALUES)?,
        })
    }

    pub(crate) fn get_or_create(&mut self, encoded: &str) -> Result<String> {
        let existing: Option<String> = self
            .values
            .get(encoded)?
            .map(|guard| guard.value().to_string());
        if let Some(hash) = existing {
            return Ok(hash);
        }
        let mut seed = 0u64;
        let hash = loop {
            let candidate = digest(encoded, seed);
            if self.hashes.get(candidate.as_str())?.is_none() {
                break candidate;
            }
            seed += 1;
        };
        self.hashes.insert(hash.as_str(), encoded)?;
        self.values.insert(encoded, hash.as_str())?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use redb::{Database, ReadableDatabase};

    fn memory_db() -> Database {
        let backend = redb::backends::InMemoryBackend::new();
        Database::builder().create_with_backend(backend).unwrap()
    }

    #[test]
    fn same_encoding_gets_same_hash() {
        let db = memory_db();
        let write_txn = db.begin_write().unwrap();
        let (first, second, other) = {
            let mut writer = HashWriter::open(&write_txn).unwrap();
            (
                writer.get_or_create("blue").unwrap(),
                writer.get_or_create("blue").unwrap(),
                writer.get_or_create("green").unwrap(),
            )
        };
        write_txn.commit().unwrap();

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_eq!(first.len(), 16);
        assert!(!first.contains('!'));

        let read_txn = db.begin_read().unwrap();
        let reader = HashReader::open(&read_txn).unwrap();
        assert_eq!(reader.hash_of("blue").unwrap(), Some(first.clone()));
        assert_eq!(reader.encoding_of(&first).unwrap(), "blue");
        assert_eq!(reader.hash_of("never-stored").unwrap(), None);
    }

    #[test]
    fn rolled_back_writes_leave_no_hashes() {
        let db = memory_db();
        {
            let write_txn = db.begin_write().unwrap();
            HashWriter::open(&write_txn).unwrap();
            write_txn.commit().unwrap();
        }
        {
            let write_txn = db.begin_write().unwrap();
            let mut writer = HashWriter::open(&write_txn).unwrap();
            writer.get_or_create("ghost").unwrap();
            // dropped without commit
        }
        let read_txn = db.begin_read().unwrap();
        let reader = HashReader::open(&read_txn).unwrap();
        assert_eq!(reader.hash_of("ghost").unwrap(), None);
    }
}
