//! The primary per-bucket ordered index (§4.3): a key→location map supporting
//! point, prefix, and range queries in lexicographic key order.

mod ttl;

pub use ttl::is_expired;

use std::collections::BTreeMap;

use crate::location::Location;

/// What the index knows about one key: where its record lives, and the
/// metadata needed to decide TTL expiry without touching the log.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub location: Location,
    pub timestamp: u64,
    pub ttl: u32,
    /// Populated only in `RamCache` mode; `Mmap` mode always reads through `location`.
    pub cached_value: Option<Vec<u8>>,
}

/// An ordered key→location map for one bucket's kv namespace.
#[derive(Default, Clone)]
pub struct BucketIndex {
    map: BTreeMap<Vec<u8>, IndexEntry>,
}

impl BucketIndex {
    pub fn new() -> Self {
        Self { map: BTreeMap::new() }
    }

    pub fn get(&self, key: &[u8]) -> Option<&IndexEntry> {
        self.map.get(key)
    }

    pub fn put(&mut self, key: Vec<u8>, entry: IndexEntry) {
        self.map.insert(key, entry);
    }

    pub fn delete(&mut self, key: &[u8]) -> Option<IndexEntry> {
        self.map.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &IndexEntry)> {
        self.map.iter()
    }

    /// Up to `limit` entries whose key starts with `prefix`, ascending. `limit <= 0`
    /// returns none.
    pub fn prefix_scan(&self, prefix: &[u8], limit: i64) -> Vec<(Vec<u8>, IndexEntry)> {
        if limit <= 0 {
            return Vec::new();
        }
        self.map
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .take(limit as usize)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// All entries whose key is in `[start, end]`, inclusive both ends, ascending.
    pub fn range_scan(&self, start: &[u8], end: &[u8]) -> Vec<(Vec<u8>, IndexEntry)> {
        if start > end {
            return Vec::new();
        }
        self.map
            .range(start.to_vec()..=end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
