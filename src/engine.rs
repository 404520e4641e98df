//! The Reader/Writer façade: the one type embedders actually hold. Composes
//! every other module into `write`/`read`/branch/transaction operations over
//! a single on-disk database directory.

use std::fs;
use std::path::Path;
use std::sync::Arc;

use arrow::array::RecordBatch;
use arrow::datatypes::SchemaRef;
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::branch::{Branch, BranchDiff, BranchManager, MAIN_BRANCH};
use crate::cache::ArrowChunkCache;
use crate::catalog::{Catalog, TableVersion};
use crate::changelog::{ChangelogEntry, ChangelogQuery};
use crate::chunk_store::ChunkStore;
use crate::chunker::{self, DEFAULT_CHUNK_SIZE_BYTES};
use crate::codec::{self, Filter};
use crate::error::{Error, Result};
use crate::table::{IntoArrow, Table};
use crate::transaction::{RecoveryReport, TransactionManager, TxId};

/// Every row of spec §6's configuration-knobs table. No environment-variable
/// loading lives here — that's the embedder's job.
#[derive(Debug, Clone)]
pub struct Config {
    pub chunk_size_bytes: u64,
    pub chunk_size_rows: Option<u64>,
    pub max_table_size_bytes: u64,
    pub max_columns: usize,
    pub verify_integrity: bool,
    pub enable_chunk_cache: bool,
    pub chunk_cache_size_bytes: u64,
    pub parallel_workers: usize,
    pub enable_branches: bool,
    pub enable_transactions: bool,
    pub auto_recover: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            chunk_size_rows: None,
            max_table_size_bytes: 10 * 1024 * 1024 * 1024,
            max_columns: 1000,
            verify_integrity: true,
            enable_chunk_cache: true,
            chunk_cache_size_bytes: 1024 * 1024 * 1024,
            parallel_workers: 8,
            enable_branches: true,
            enable_transactions: true,
            auto_recover: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub table: String,
    pub version: u64,
    pub chunk_count: usize,
    pub chunk_hashes: Vec<String>,
    pub total_rows: usize,
    pub total_bytes: u64,
}

/// Stops short of a catalog commit — the transactional write path fills in
/// the real version at commit time.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkWriteResult {
    pub next_version: u64,
    pub chunk_hashes: Vec<String>,
    pub total_rows: usize,
    pub total_bytes: u64,
}

fn indices_by_name(schema: &SchemaRef, names: &[String]) -> Result<Vec<usize>> {
    names
        .iter()
        .map(|n| schema.index_of(n).map_err(|_| Error::InvalidColumn(n.clone())))
        .collect()
}

fn project_schema(schema: &SchemaRef, columns: Option<&[String]>) -> Result<SchemaRef> {
    match columns {
        None => Ok(schema.clone()),
        Some(names) => {
            let idx = indices_by_name(schema, names)?;
            Ok(Arc::new(schema.project(&idx)?))
        }
    }
}

pub struct Engine {
    config: Config,
    chunk_store: ChunkStore,
    catalog: Arc<Catalog>,
    branches: Option<Arc<BranchManager>>,
    transactions: Option<Arc<TransactionManager>>,
    cache: Option<Arc<ArrowChunkCache>>,
    /// The single checked-out transaction, if any. Enforces `spec.md`'s
    /// "nested transactions not supported" rule at the engine-instance
    /// level; `TransactionManager` itself permits unlimited concurrent
    /// `Pending` transactions.
    active_tx: Mutex<Option<TxId>>,
}

impl Engine {
    pub fn open(root: impl AsRef<Path>, config: Config) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|e| Error::io(root, e))?;

        let chunk_store = ChunkStore::open(root.join("chunks"))?;
        let catalog = Arc::new(Catalog::open(root.join("catalog"))?);
        let branches = if config.enable_branches {
            Some(Arc::new(BranchManager::open(root.join("branches"))?))
        } else {
            None
        };
        let transactions = if config.enable_transactions {
            Some(Arc::new(TransactionManager::open(
                root.join("transactions"),
                catalog.clone(),
                branches.clone(),
            )?))
        } else {
            None
        };
        let cache = if config.enable_chunk_cache {
            Some(Arc::new(ArrowChunkCache::new(config.chunk_cache_size_bytes)))
        } else {
            None
        };

        let engine = Self {
            config,
            chunk_store,
            catalog,
            branches,
            transactions,
            cache,
            active_tx: Mutex::new(None),
        };

        if engine.config.auto_recover {
            if let Some(manager) = &engine.transactions {
                let report = manager.recover()?;
                tracing::info!(
                    replayed = report.replayed.len(),
                    rolled_back = report.rolled_back.len(),
                    "auto-recovery ran on open"
                );
            }
        }
        Ok(engine)
    }

    fn check_size_limits(&self, table: &Table) -> Result<()> {
        if table.num_columns() > self.config.max_columns {
            return Err(Error::SchemaTooWide {
                actual: table.num_columns(),
                maximum: self.config.max_columns,
            });
        }
        let total_bytes: u64 = table
            .batches()
            .iter()
            .map(|b| b.get_array_memory_size() as u64)
            .sum();
        if total_bytes > self.config.max_table_size_bytes {
            return Err(Error::SizeLimitExceeded {
                actual: total_bytes,
                maximum: self.config.max_table_size_bytes,
                unit: "bytes",
            });
        }
        Ok(())
    }

    /// Chunk, encode, and store a table's data. Writes no catalog or branch
    /// state — shared by `write`, `write_chunks_only`, and transactional
    /// writes, which each decide what to do with the resulting hashes.
    fn chunk_and_store(&self, table: &Table) -> Result<(Vec<String>, usize, u64)> {
        self.check_size_limits(table)?;
        let chunks = chunker::chunk_table(table, self.config.chunk_size_bytes, self.config.chunk_size_rows)?;
        let encoded = if chunks.len() >= 2 {
            codec::encode_batches_parallel(&chunks)?
        } else {
            vec![codec::encode_batch(&chunks[0])?]
        };
        let total_bytes = encoded.iter().map(|e| e.len() as u64).sum();
        let chunk_hashes = self.chunk_store.put_batch(&encoded)?;
        Ok((chunk_hashes, table.num_rows(), total_bytes))
    }

    fn branch_or_main<'a>(&self, branch: Option<&'a str>) -> &'a str {
        branch.unwrap_or(MAIN_BRANCH)
    }

    pub fn write(
        &self,
        table_name: &str,
        data: impl IntoArrow,
        branch: Option<&str>,
        metadata: Option<String>,
    ) -> Result<WriteResult> {
        crate::catalog::validate_table_name(table_name)?;
        let table = data.into_arrow()?;
        let (chunk_hashes, total_rows, total_bytes) = self.chunk_and_store(&table)?;

        let committed = self.catalog.commit(table_name, chunk_hashes.clone(), metadata, None)?;
        if let Some(branches) = &self.branches {
            branches.update_head(self.branch_or_main(branch), table_name, committed.version)?;
        }
        if let Some(cache) = &self.cache {
            cache.invalidate_table(table_name);
        }

        Ok(WriteResult {
            table: table_name.to_string(),
            version: committed.version,
            chunk_count: chunk_hashes.len(),
            chunk_hashes,
            total_rows,
            total_bytes,
        })
    }

    /// Chunk and store without a catalog commit. The transactional write
    /// path uses this and defers the real version assignment to commit.
    pub fn write_chunks_only(&self, table_name: &str, data: impl IntoArrow) -> Result<ChunkWriteResult> {
        crate::catalog::validate_table_name(table_name)?;
        let table = data.into_arrow()?;
        let (chunk_hashes, total_rows, total_bytes) = self.chunk_and_store(&table)?;
        let next_version = self.catalog.latest_version(table_name)?.map_or(1, |v| v + 1);
        Ok(ChunkWriteResult {
            next_version,
            chunk_hashes,
            total_rows,
            total_bytes,
        })
    }

    fn resolve_version(&self, table: &str, version: Option<u64>, branch: Option<&str>) -> Result<u64> {
        if let Some(v) = version {
            return Ok(v);
        }
        if let Some(branches) = &self.branches {
            if let Some(v) = branches.get_table_version(self.branch_or_main(branch), table)? {
                return Ok(v);
            }
        }
        self.catalog
            .latest_version(table)?
            .ok_or_else(|| Error::TableNotFound(table.to_string()))
    }

    fn decode_chunk_cached(&self, hash: &str) -> Result<RecordBatch> {
        if let Some(cache) = &self.cache {
            if let Some(batch) = cache.get_chunk(hash) {
                return Ok(batch);
            }
        }
        let bytes = if self.config.verify_integrity {
            self.chunk_store.get_verified(hash)?
        } else {
            self.chunk_store.get(hash)?
        };
        let batch = codec::decode(bytes)?;
        if let Some(cache) = &self.cache {
            cache.put_chunk(hash.to_string(), batch.clone());
        }
        Ok(batch)
    }

    /// Decode one chunk, apply projection and filters, and report whether
    /// any rows survived. Returns the projected schema regardless, so the
    /// caller can build an empty table when every chunk filters to zero
    /// rows.
    fn decode_one(
        &self,
        hash: &str,
        columns: Option<&[String]>,
        filters: &[Filter],
    ) -> Result<(SchemaRef, Option<RecordBatch>)> {
        let full = self.decode_chunk_cached(hash)?;
        let full_schema = full.schema();
        let projected_schema = project_schema(&full_schema, columns)?;
        let filtered = codec::apply_filters(&full, filters)?;
        let out = match columns {
            Some(names) => {
                let idx = indices_by_name(&full_schema, names)?;
                filtered.project(&idx)?
            }
            None => filtered,
        };
        if out.num_rows() == 0 {
            Ok((projected_schema, None))
        } else {
            Ok((projected_schema, Some(out)))
        }
    }

    fn decode_chunks(
        &self,
        hashes: &[String],
        columns: Option<&[String]>,
        filters: &[Filter],
    ) -> Result<(SchemaRef, Vec<RecordBatch>)> {
        let results: Vec<(SchemaRef, Option<RecordBatch>)> = if hashes.len() >= 2 {
            hashes
                .par_iter()
                .map(|h| self.decode_one(h, columns, filters))
                .collect::<Result<Vec<_>>>()?
        } else {
            hashes
                .iter()
                .map(|h| self.decode_one(h, columns, filters))
                .collect::<Result<Vec<_>>>()?
        };
        let schema = results
            .first()
            .map(|(s, _)| s.clone())
            .ok_or(Error::EmptyTable)?;
        let batches = results.into_iter().filter_map(|(_, b)| b).collect();
        Ok((schema, batches))
    }

    pub fn read(
        &self,
        table_name: &str,
        version: Option<u64>,
        branch: Option<&str>,
        columns: Option<&[String]>,
        filters: &[Filter],
    ) -> Result<Table> {
        let resolved_version = self.resolve_version(table_name, version, branch)?;
        let branch_name = self.branch_or_main(branch).to_string();
        let whole_table_query = columns.is_none() && filters.is_empty();

        if whole_table_query {
            if let Some(cache) = &self.cache {
                let key = (table_name.to_lowercase(), resolved_version, branch_name.clone());
                if let Some(cached) = cache.get_table(&key) {
                    return Ok(cached);
                }
            }
        }

        let tv = self.catalog.get_version(table_name, Some(resolved_version))?;
        let (schema, batches) = self.decode_chunks(&tv.chunk_hashes, columns, filters)?;
        let result = Table::try_new(schema, batches)?;

        if whole_table_query {
            if let Some(cache) = &self.cache {
                let key = (table_name.to_lowercase(), resolved_version, branch_name);
                cache.put_table(key, result.clone());
            }
        }
        Ok(result)
    }

    pub fn iter_chunks<'a>(
        &'a self,
        table_name: &str,
        version: Option<u64>,
        branch: Option<&str>,
        columns: Option<Vec<String>>,
        filters: Vec<Filter>,
    ) -> Result<ChunkIter<'a>> {
        let resolved_version = self.resolve_version(table_name, version, branch)?;
        let tv = self.catalog.get_version(table_name, Some(resolved_version))?;
        Ok(ChunkIter {
            engine: self,
            hashes: tv.chunk_hashes.into_iter(),
            columns,
            filters,
        })
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        self.catalog.list_tables()
    }

    pub fn list_versions(&self, table_name: &str) -> Result<Vec<u64>> {
        self.catalog.list_versions(table_name)
    }

    pub fn get_metadata(&self, table_name: &str, version: Option<u64>) -> Result<TableVersion> {
        self.catalog.get_version(table_name, version)
    }

    /// Most recent versions first, truncated to `limit` if given.
    pub fn get_version_history(&self, table_name: &str, limit: Option<usize>) -> Result<Vec<TableVersion>> {
        let mut versions = self.catalog.list_versions(table_name)?;
        versions.reverse();
        if let Some(limit) = limit {
            versions.truncate(limit);
        }
        versions
            .into_iter()
            .map(|v| self.catalog.get_version(table_name, Some(v)))
            .collect()
    }

    // --- Branches ---
    // `enable_branches = false` makes every branch operation behave as if
    // no branch subsystem exists; `BranchNotFound` is the closest taxonomy
    // entry to "there is nothing here to operate on".

    fn branches(&self) -> Result<&Arc<BranchManager>> {
        self.branches
            .as_ref()
            .ok_or_else(|| Error::BranchNotFound("branches are disabled on this engine".to_string()))
    }

    pub fn create_branch(&self, name: &str, from_branch: Option<&str>, description: Option<String>) -> Result<Branch> {
        self.branches()?.create(name, from_branch, description)
    }

    pub fn list_branches(&self) -> Result<Vec<String>> {
        self.branches()?.list()
    }

    pub fn diff_branches(&self, source: &str, target: &str) -> Result<BranchDiff> {
        self.branches()?.diff(source, target)
    }

    pub fn merge_branches(&self, source: &str, into: &str) -> Result<()> {
        self.branches()?.merge(source, into)
    }

    // --- Transactions ---

    fn transactions(&self) -> Result<&Arc<TransactionManager>> {
        // tx_id 0 never exists; used as a sentinel for "transactions are
        // disabled on this engine".
        self.transactions
            .as_ref()
            .ok_or(Error::TransactionNotFound(0))
    }

    /// Begin the single transaction this engine instance may have active at
    /// once. Fails with `NestedTransactionError` if one is already open.
    pub fn begin_transaction(&self, branch: Option<&str>) -> Result<TransactionGuard<'_>> {
        let manager = self.transactions()?;
        let mut slot = self.active_tx.lock();
        if slot.is_some() {
            return Err(Error::NestedTransactionError);
        }
        let tx_id = manager.begin(branch)?;
        *slot = Some(tx_id);
        Ok(TransactionGuard {
            engine: self,
            tx_id,
            finished: false,
        })
    }

    pub fn get_changelog(&self, query: ChangelogQuery) -> Result<Vec<ChangelogEntry>> {
        self.transactions()?.get_changelog(query)
    }

    pub fn recover(&self) -> Result<RecoveryReport> {
        self.transactions()?.recover()
    }

    /// `(chunk-tier stats, table-tier stats)`, or `None` if the cache is
    /// disabled.
    pub fn cache_stats(&self) -> Option<(crate::cache::CacheStats, crate::cache::CacheStats)> {
        self.cache.as_ref().map(|c| (c.chunk_stats(), c.table_stats()))
    }
}

pub struct ChunkIter<'a> {
    engine: &'a Engine,
    hashes: std::vec::IntoIter<String>,
    columns: Option<Vec<String>>,
    filters: Vec<Filter>,
}

impl<'a> Iterator for ChunkIter<'a> {
    type Item = Result<Table>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let hash = self.hashes.next()?;
            match self.engine.decode_one(&hash, self.columns.as_deref(), &self.filters) {
                Ok((_, None)) => continue,
                Ok((schema, Some(batch))) => return Some(Table::try_new(schema, vec![batch])),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Single-use RAII handle for the engine's one active transaction. Dropping
/// it without calling `commit` aborts the transaction.
pub struct TransactionGuard<'a> {
    engine: &'a Engine,
    tx_id: TxId,
    finished: bool,
}

impl<'a> TransactionGuard<'a> {
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Stage a write. Chunks are stored immediately; the catalog commit is
    /// deferred to `commit()`.
    pub fn write(&self, table_name: &str, data: impl IntoArrow, metadata: Option<String>) -> Result<()> {
        crate::catalog::validate_table_name(table_name)?;
        let manager = self.engine.transactions()?;
        manager.record_read(self.tx_id, table_name)?;
        let tx = manager
            .get_transaction(self.tx_id)
            .ok_or(Error::TransactionNotFound(self.tx_id))?;
        let projected_version = tx.read_snapshot.get(table_name).copied().map_or(1, |v| v + 1);

        let table = data.into_arrow()?;
        let (chunk_hashes, _total_rows, _total_bytes) = self.engine.chunk_and_store(&table)?;
        manager.add_write(self.tx_id, table_name, projected_version, chunk_hashes, metadata)
    }

    /// Record a read so the conflict check at commit covers this table even
    /// if the transaction never writes to it.
    pub fn record_read(&self, table_name: &str) -> Result<()> {
        self.engine.transactions()?.record_read(self.tx_id, table_name)
    }

    /// Read within the transaction: read-your-writes is provided by
    /// treating this transaction's own buffered writes as a shadow over its
    /// snapshot. If `table_name` has a pending write in this transaction,
    /// that write's data is what's read; otherwise this reads the table at
    /// the version captured in the transaction's snapshot.
    pub fn read(&self, table_name: &str, columns: Option<&[String]>, filters: &[Filter]) -> Result<Table> {
        let manager = self.engine.transactions()?;
        manager.record_read(self.tx_id, table_name)?;
        let tx = manager
            .get_transaction(self.tx_id)
            .ok_or(Error::TransactionNotFound(self.tx_id))?;

        if let Some(write) = tx.writes.iter().rev().find(|w| w.table == table_name) {
            let (schema, batches) = self.engine.decode_chunks(&write.chunk_hashes, columns, filters)?;
            return Table::try_new(schema, batches);
        }

        let snapshot_version = tx
            .read_snapshot
            .get(table_name)
            .copied()
            .ok_or_else(|| Error::TableNotFound(table_name.to_string()))?;
        self.engine
            .read(table_name, Some(snapshot_version), Some(tx.branch.as_str()), columns, filters)
    }

    pub fn commit(mut self) -> Result<std::collections::HashMap<String, u64>> {
        self.finished = true;
        let manager = self.engine.transactions()?;
        let result = manager.commit(self.tx_id)?;
        if let Some(cache) = &self.engine.cache {
            for table in result.keys() {
                cache.invalidate_table(table);
            }
        }
        *self.engine.active_tx.lock() = None;
        Ok(result)
    }

    pub fn abort(mut self, reason: Option<String>) -> Result<()> {
        self.finished = true;
        let result = self.engine.transactions()?.abort(self.tx_id, reason);
        *self.engine.active_tx.lock() = None;
        result
    }
}

impl<'a> Drop for TransactionGuard<'a> {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(manager) = &self.engine.transactions {
                let _ = manager.abort(self.tx_id, Some("dropped without commit".to_string()));
            }
            *self.engine.active_tx.lock() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use tempfile::tempdir;

    fn users_batch(rows: &[(i64, &str)]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(rows.iter().map(|r| r.0).collect::<Vec<_>>())),
                Arc::new(StringArray::from(rows.iter().map(|r| r.1).collect::<Vec<_>>())),
            ],
        )
        .unwrap()
    }

    #[test]
    fn s1_write_then_read() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();
        let batch = users_batch(&[(1, "Alice"), (2, "Bob")]);
        let result = engine.write("users", batch, None, None).unwrap();
        assert_eq!(result.version, 1);
        assert_eq!(result.chunk_count, 1);
        assert_eq!(result.total_rows, 2);

        let table = engine.read("users", None, None, None, &[]).unwrap();
        assert_eq!(table.num_rows(), 2);
        assert_eq!(engine.list_versions("users").unwrap(), vec![1]);
    }

    #[test]
    fn s2_time_travel() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();
        engine.write("users", users_batch(&[(1, "Alice")]), None, None).unwrap();
        engine
            .write("users", users_batch(&[(1, "Alice"), (2, "Bob")]), None, None)
            .unwrap();

        let v1 = engine.read("users", Some(1), None, None, &[]).unwrap();
        assert_eq!(v1.num_rows(), 1);
        let latest = engine.read("users", None, None, None, &[]).unwrap();
        assert_eq!(latest.num_rows(), 2);
        assert_eq!(engine.list_versions("users").unwrap(), vec![1, 2]);
    }

    #[test]
    fn s3_branch_diff_and_fast_forward_merge() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();
        engine.write("users", users_batch(&[(1, "Alice"), (2, "Bob")]), None, None).unwrap();
        engine.create_branch("feature", None, None).unwrap();
        engine
            .write(
                "users",
                users_batch(&[(1, "Alice"), (2, "Bob"), (3, "Carol")]),
                Some("feature"),
                None,
            )
            .unwrap();

        let diff = engine.diff_branches("feature", "main").unwrap();
        assert_eq!(diff.modified, vec![("users".to_string(), 2, 1)]);

        engine.merge_branches("feature", "main").unwrap();
        let table = engine.read("users", None, Some("main"), None, &[]).unwrap();
        assert_eq!(table.num_rows(), 3);
    }

    #[test]
    fn nested_transaction_is_rejected_then_commit_succeeds() {
        // The cross-table-conflict scenario itself (two transactions racing
        // to commit the same table) is exercised directly against
        // `TransactionManager` in transaction.rs, where two `Pending`
        // transactions can coexist. This engine enforces a stricter rule on
        // top of that: only one checked-out `TransactionGuard` at a time.
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();

        let tx1 = engine.begin_transaction(None).unwrap();
        tx1.write("orders", users_batch(&[(1, "Alice")]), None).unwrap();

        let result = engine.begin_transaction(None);
        assert!(matches!(result, Err(Error::NestedTransactionError)));

        tx1.commit().unwrap();
        let table = engine.read("orders", None, None, None, &[]).unwrap();
        assert_eq!(table.num_rows(), 1);

        // The guard slot freed up after commit, so a new transaction can begin.
        let tx2 = engine.begin_transaction(None).unwrap();
        tx2.abort(None).unwrap();
    }

    #[test]
    fn transaction_read_sees_its_own_uncommitted_write() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();
        engine.write("users", users_batch(&[(1, "Alice")]), None, None).unwrap();

        let tx = engine.begin_transaction(None).unwrap();
        tx.write("users", users_batch(&[(1, "Alice"), (2, "Bob")]), None).unwrap();

        // read-your-writes: the transaction sees its own buffered write...
        let seen_in_tx = tx.read("users", None, &[]).unwrap();
        assert_eq!(seen_in_tx.num_rows(), 2);

        // ...but nobody outside the transaction does, until commit.
        let seen_outside = engine.read("users", None, None, None, &[]).unwrap();
        assert_eq!(seen_outside.num_rows(), 1);

        tx.commit().unwrap();
        let seen_after_commit = engine.read("users", None, None, None, &[]).unwrap();
        assert_eq!(seen_after_commit.num_rows(), 2);
    }

    #[test]
    fn transaction_read_of_untouched_table_uses_snapshot_version() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();
        engine.write("users", users_batch(&[(1, "Alice")]), None, None).unwrap();

        let tx = engine.begin_transaction(None).unwrap();
        // A concurrent, non-transactional writer advances "users" after the
        // snapshot would be captured by this transaction's first touch.
        let seen = tx.read("users", None, &[]).unwrap();
        assert_eq!(seen.num_rows(), 1);

        engine
            .write("users", users_batch(&[(1, "Alice"), (2, "Bob")]), None, None)
            .unwrap();
        // Still pinned to the snapshot captured on first read.
        let seen_again = tx.read("users", None, &[]).unwrap();
        assert_eq!(seen_again.num_rows(), 1);
        tx.abort(None).unwrap();
    }

    #[test]
    fn s6_projection_and_predicate_pushdown_with_cache_stats() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();
        let ids: Vec<i64> = (0..1000).collect();
        let names: Vec<String> = ids.iter().map(|i| format!("user-{i}")).collect();
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("value", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids)),
                Arc::new(StringArray::from(names.iter().map(|s| s.as_str()).collect::<Vec<_>>())),
            ],
        )
        .unwrap();
        engine.write("wide", batch, None, None).unwrap();

        let filters = vec![Filter {
            column: "id".to_string(),
            op: codec::FilterOp::Lt,
            literal: codec::Literal::Int(500),
        }];
        let projected = engine
            .read("wide", None, None, Some(&["id".to_string()]), &filters)
            .unwrap();
        assert_eq!(projected.num_columns(), 1);
        assert_eq!(projected.num_rows(), 500);

        let hits_before = engine.cache_stats().unwrap().0.hits;
        let _ = engine
            .read("wide", None, None, Some(&["id".to_string()]), &filters)
            .unwrap();
        assert!(engine.cache_stats().unwrap().0.hits > hits_before);
    }

    #[test]
    fn write_chunks_only_stops_before_catalog_commit() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();
        let result = engine.write_chunks_only("staged", users_batch(&[(1, "Alice")])).unwrap();
        assert_eq!(result.next_version, 1);
        assert!(engine.list_tables().unwrap().is_empty());
    }

    #[test]
    fn unknown_table_read_is_not_found() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();
        assert!(matches!(
            engine.read("ghost", None, None, None, &[]),
            Err(Error::TableNotFound(_))
        ));
    }

    #[test]
    fn iter_chunks_skips_empty_filtered_chunks() {
        let dir = tempdir().unwrap();
        let engine = Engine::open(dir.path(), Config::default()).unwrap();
        engine
            .write("users", users_batch(&[(1, "Alice"), (2, "Bob")]), None, None)
            .unwrap();
        let filters = vec![Filter {
            column: "id".to_string(),
            op: codec::FilterOp::Eq,
            literal: codec::Literal::Int(1),
        }];
        let tables: Vec<Table> = engine
            .iter_chunks("users", None, None, None, filters)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].num_rows(), 1);
    }
}
