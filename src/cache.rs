//! Two-tier bounded LRU cache. Content-addressing makes the chunk tier
//! trivially coherent — a chunk hash never changes meaning, so those
//! entries are never invalidated, only evicted for space. The table tier
//! is invalidated by table name on every write.
//!
//! No existing crate in this codebase's dependency corpus combines a
//! byte-budgeted cap with hit/miss/eviction statistics the way this needs,
//! so both tiers are a small hand-rolled LRU: an `IndexMap`-free ordered
//! map built from a `HashMap` plus a doubly-linked recency list would be
//! the fully general structure, but since every entry here carries its own
//! size, a simpler `VecDeque`-as-recency-queue with a side `HashMap` index
//! is enough and avoids pulling in a cache crate for one data structure.

use std::collections::{HashMap, VecDeque};

use arrow::array::RecordBatch;
use parking_lot::Mutex;

use crate::table::Table;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub current_bytes: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

fn record_batch_size(batch: &RecordBatch) -> u64 {
    batch.get_array_memory_size() as u64
}

fn table_size(table: &Table) -> u64 {
    table.batches().iter().map(record_batch_size).sum()
}

/// A single bounded LRU keyed by `K`, tracking byte usage against a cap.
/// Oversized single entries are rejected silently (never cached).
struct BoundedLru<K: std::hash::Hash + Eq + Clone, V> {
    capacity_bytes: u64,
    entries: HashMap<K, (V, u64)>,
    recency: VecDeque<K>,
    stats: CacheStats,
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> BoundedLru<K, V> {
    fn new(capacity_bytes: u64) -> Self {
        Self {
            capacity_bytes,
            entries: HashMap::new(),
            recency: VecDeque::new(),
            stats: CacheStats::default(),
        }
    }

    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.recency.iter().position(|k| k == key) {
            self.recency.remove(pos);
        }
        self.recency.push_back(key.clone());
    }

    fn get(&mut self, key: &K) -> Option<V> {
        if let Some((value, _)) = self.entries.get(key).cloned() {
            self.touch(key);
            self.stats.hits += 1;
            Some(value)
        } else {
            self.stats.misses += 1;
            None
        }
    }

    fn insert(&mut self, key: K, value: V, size: u64) {
        if size > self.capacity_bytes {
            return;
        }
        if let Some((_, old_size)) = self.entries.remove(&key) {
            self.stats.current_bytes -= old_size;
            self.recency.retain(|k| k != &key);
        }
        while self.stats.current_bytes + size > self.capacity_bytes {
            match self.recency.pop_front() {
                Some(evict_key) => {
                    if let Some((_, evicted_size)) = self.entries.remove(&evict_key) {
                        self.stats.current_bytes -= evicted_size;
                        self.stats.evictions += 1;
                    }
                }
                None => break,
            }
        }
        self.entries.insert(key.clone(), (value, size));
        self.recency.push_back(key);
        self.stats.current_bytes += size;
    }

    fn invalidate_matching(&mut self, mut matches: impl FnMut(&K) -> bool) {
        let to_remove: Vec<K> = self.entries.keys().filter(|k| matches(k)).cloned().collect();
        for key in to_remove {
            if let Some((_, size)) = self.entries.remove(&key) {
                self.stats.current_bytes -= size;
            }
            self.recency.retain(|k| k != &key);
        }
    }
}

/// `(table_name_lowercase, version, branch)`.
pub type TableKey = (String, u64, String);

pub struct ArrowChunkCache {
    chunks: Mutex<BoundedLru<String, RecordBatch>>,
    tables: Mutex<BoundedLru<TableKey, Table>>,
}

impl ArrowChunkCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            chunks: Mutex::new(BoundedLru::new(capacity_bytes)),
            tables: Mutex::new(BoundedLru::new(capacity_bytes)),
        }
    }

    pub fn get_chunk(&self, hash: &str) -> Option<RecordBatch> {
        self.chunks.lock().get(&hash.to_string())
    }

    pub fn put_chunk(&self, hash: String, batch: RecordBatch) {
        let size = record_batch_size(&batch);
        self.chunks.lock().insert(hash, batch, size);
    }

    pub fn get_table(&self, key: &TableKey) -> Option<Table> {
        self.tables.lock().get(key)
    }

    pub fn put_table(&self, key: TableKey, table: Table) {
        let size = table_size(&table);
        self.tables.lock().insert(key, table, size);
    }

    /// Invalidate every cached table-tier entry for `table_name`, across
    /// all versions and branches — conservative by design.
    pub fn invalidate_table(&self, table_name: &str) {
        self.tables.lock().invalidate_matching(|(name, _, _)| name == table_name);
    }

    pub fn chunk_stats(&self) -> CacheStats {
        self.chunks.lock().stats
    }

    pub fn table_stats(&self) -> CacheStats {
        self.tables.lock().stats
    }
}
