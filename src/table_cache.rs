//! Table cache seam.
//!
//! The version catalog never opens table files itself. Point lookups go
//! through this trait, which the embedding engine implements on top of
//! its real table reader and cache. A table is addressed by its file
//! number, size, and the sequence offset assigned to its first key.

use std::collections::BTreeMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::types::{InternalKey, ReadOptions};
use crate::Result;

/// Opens tables and performs point lookups on behalf of the version
/// catalog.
pub trait TableCache: Send + Sync {
    /// Look up `internal_key` in the identified table and return the
    /// first entry at or after it as `(encoded_internal_key, value)`,
    /// or `None` when the table holds nothing at or after the key.
    fn get(
        &self,
        options: &ReadOptions,
        file_number: u64,
        file_size: u64,
        seq_off: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>>;

    /// Drop any cached state for a table that is being deleted.
    fn evict(&self, file_number: u64);
}

/// An in-memory [`TableCache`] backed by sorted maps.
///
/// Stands in for the real SSTable reader in tests and examples: each
/// "table" is a `BTreeMap` from encoded internal key to value.
#[derive(Default)]
pub struct MemTableCache {
    tables: RwLock<BTreeMap<u64, BTreeMap<Bytes, Bytes>>>,
}

impl MemTableCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install table contents under a file number.
    pub fn insert_table(&self, file_number: u64, entries: BTreeMap<Bytes, Bytes>) {
        self.tables.write().insert(file_number, entries);
    }

    /// Add one entry to a table, creating the table if needed.
    pub fn insert_entry(&self, file_number: u64, internal_key: Bytes, value: Bytes) {
        self.tables
            .write()
            .entry(file_number)
            .or_default()
            .insert(internal_key, value);
    }

    /// Number of tables currently held.
    pub fn num_tables(&self) -> usize {
        self.tables.read().len()
    }
}

impl TableCache for MemTableCache {
    fn get(
        &self,
        _options: &ReadOptions,
        file_number: u64,
        _file_size: u64,
        _seq_off: u64,
        internal_key: &[u8],
    ) -> Result<Option<(Bytes, Bytes)>> {
        let tables = self.tables.read();
        let table = match tables.get(&file_number) {
            Some(t) => t,
            None => return Ok(None),
        };

        // The map is byte-ordered, which differs from internal-key order
        // for entries sharing a user key (the packed tail inverts), so
        // pick the smallest entry at or after the target by internal-key
        // order rather than trusting a range scan.
        let target = match InternalKey::decode(internal_key) {
            Some(k) => k,
            None => return Err(crate::Error::corruption("malformed seek key")),
        };
        let mut best: Option<(InternalKey, &Bytes, &Bytes)> = None;
        for (k, v) in table.iter() {
            let entry = match InternalKey::decode(k) {
                Some(e) => e,
                None => return Err(crate::Error::corruption("malformed table key")),
            };
            if entry < target {
                continue;
            }
            if best.as_ref().map_or(true, |(b, _, _)| entry < *b) {
                best = Some((entry, k, v));
            }
        }

        Ok(best.map(|(_, k, v)| (k.clone(), v.clone())))
    }

    fn evict(&self, file_number: u64) {
        self.tables.write().remove(&file_number);
    }
}
