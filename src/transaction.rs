//! Cross-table ACID transactions under snapshot isolation, with a durable
//! changelog and crash recovery. Conflict yardstick (fixed, see
//! `SPEC_FULL.md` §4): a write conflicts iff the table's current version at
//! commit time differs from the version captured in the transaction's read
//! snapshot.
//!
//! `TransactionManager` itself allows any number of concurrently `Pending`
//! transactions — nothing here enforces "one at a time". The
//! `NestedTransactionError` restriction belongs to the single-guard RAII
//! wrapper in `engine.rs`, which is where "the same engine instance" means
//! "the same checked-out transaction handle".

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::branch::BranchManager;
use crate::catalog::Catalog;
use crate::changelog::{Changelog, ChangelogEntry, ChangelogQuery, TableChange};
use crate::error::{Error, Result};
use crate::record;

pub type TxId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TransactionState {
    Pending,
    Committed,
    Aborted { reason: Option<String> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableWrite {
    pub table: String,
    pub new_version: u64,
    pub chunk_hashes: Vec<String>,
    pub metadata: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Transaction {
    pub tx_id: TxId,
    pub branch: String,
    pub state: TransactionState,
    pub read_snapshot: HashMap<String, u64>,
    pub writes: Vec<TableWrite>,
    pub started_at: i64,
}

impl Transaction {
    fn is_pending(&self) -> bool {
        matches!(self.state, TransactionState::Pending)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub replayed: Vec<TxId>,
    pub rolled_back: Vec<TxId>,
    pub already_committed: Vec<TxId>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyIssue(pub String);

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

pub struct TransactionManager {
    pending_dir: PathBuf,
    changelog: Changelog,
    next_tx_id: AtomicU64,
    next_epoch_id: AtomicU64,
    active: RwLock<HashMap<TxId, Transaction>>,
    commit_lock: Mutex<()>,
    catalog: Arc<Catalog>,
    branches: Option<Arc<BranchManager>>,
}

impl TransactionManager {
    pub fn open(
        transactions_root: impl Into<PathBuf>,
        catalog: Arc<Catalog>,
        branches: Option<Arc<BranchManager>>,
    ) -> Result<Self> {
        let root: PathBuf = transactions_root.into();
        let pending_dir = root.join("pending");
        fs::create_dir_all(&pending_dir).map_err(|e| Error::io(&pending_dir, e))?;
        let changelog = Changelog::open(root.join("log"));

        let mut next_tx_id = changelog.latest_tx_id()?.map_or(1, |id| id + 1);
        for entry in fs::read_dir(&pending_dir).map_err(|e| Error::io(&pending_dir, e))? {
            let entry = entry.map_err(|e| Error::io(&pending_dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(id) = name.parse::<u64>() {
                    next_tx_id = next_tx_id.max(id + 1);
                }
            }
        }

        Ok(Self {
            pending_dir,
            changelog,
            next_tx_id: AtomicU64::new(next_tx_id),
            next_epoch_id: AtomicU64::new(0),
            active: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            catalog,
            branches,
        })
    }

    fn pending_path(&self, tx_id: TxId) -> PathBuf {
        self.pending_dir.join(tx_id.to_string())
    }

    fn persist_pending(&self, tx: &Transaction) -> Result<()> {
        record::write_atomic(&self.pending_path(tx.tx_id), tx)
    }

    fn remove_pending(&self, tx_id: TxId) -> Result<()> {
        let path = self.pending_path(tx_id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        }
        Ok(())
    }

    fn current_version(&self, branch: &str, table: &str) -> Result<Option<u64>> {
        match &self.branches {
            Some(b) => b.get_table_version(branch, table),
            None => self.catalog.latest_version(table),
        }
    }

    /// Allocate a `tx_id`, persist a `Pending` record, and return it. The
    /// read snapshot is populated lazily as tables are touched by
    /// `record_read`/`add_write`.
    pub fn begin(&self, branch: Option<&str>) -> Result<TxId> {
        let branch = branch.unwrap_or(crate::branch::MAIN_BRANCH).to_string();
        let tx_id = self.next_tx_id.fetch_add(1, Ordering::SeqCst);
        let tx = Transaction {
            tx_id,
            branch,
            state: TransactionState::Pending,
            read_snapshot: HashMap::new(),
            writes: Vec::new(),
            started_at: now_unix(),
        };
        self.persist_pending(&tx)?;
        self.active.write().insert(tx_id, tx);
        tracing::debug!(tx_id, "began transaction");
        Ok(tx_id)
    }

    /// Record that this transaction observed `table` at its current
    /// version, if it hasn't already captured a snapshot entry for it.
    pub fn record_read(&self, tx_id: TxId, table: &str) -> Result<()> {
        let mut active = self.active.write();
        let tx = active.get_mut(&tx_id).ok_or(Error::TransactionNotFound(tx_id))?;
        if !tx.read_snapshot.contains_key(table) {
            let current = self.current_version(&tx.branch, table)?;
            if let Some(v) = current {
                tx.read_snapshot.insert(table.to_string(), v);
            }
        }
        Ok(())
    }

    /// Record an intended catalog commit. Does not touch the catalog or
    /// branch; the assignment happens at `commit`.
    pub fn add_write(
        &self,
        tx_id: TxId,
        table: &str,
        new_version: u64,
        chunk_hashes: Vec<String>,
        metadata: Option<String>,
    ) -> Result<()> {
        let mut active = self.active.write();
        let tx = active.get_mut(&tx_id).ok_or(Error::TransactionNotFound(tx_id))?;
        if !tx.is_pending() {
            return Err(Error::TransactionNotFound(tx_id));
        }
        if !tx.read_snapshot.contains_key(table) {
            let current = self.current_version(&tx.branch, table)?;
            if let Some(v) = current {
                tx.read_snapshot.insert(table.to_string(), v);
            }
        }
        tx.writes.push(TableWrite {
            table: table.to_string(),
            new_version,
            chunk_hashes,
            metadata,
        });
        let snapshot = tx.clone();
        drop(active);
        self.persist_pending(&snapshot)
    }

    /// Commit under the global commit lock: conflict check, catalog
    /// commits, branch head updates, changelog append — in that order.
    pub fn commit(&self, tx_id: TxId) -> Result<HashMap<String, u64>> {
        let _commit_guard = self.commit_lock.lock();

        let tx = {
            let active = self.active.read();
            active.get(&tx_id).cloned().ok_or(Error::TransactionNotFound(tx_id))?
        };
        if !tx.is_pending() {
            return Err(Error::TransactionNotFound(tx_id));
        }

        let mut conflicting = Vec::new();
        for write in &tx.writes {
            let current = self.current_version(&tx.branch, &write.table)?;
            let snapshot = tx.read_snapshot.get(&write.table).copied();
            if current != snapshot {
                conflicting.push(write.table.clone());
            }
        }
        if !conflicting.is_empty() {
            self.abort(tx_id, Some(format!("conflict on tables {conflicting:?}")))?;
            return Err(Error::ConflictError { tables: conflicting });
        }

        let mut committed_versions = HashMap::new();
        let mut changes = Vec::new();
        for write in &tx.writes {
            let old_version = tx.read_snapshot.get(&write.table).copied();
            let committed = self.catalog.commit(
                &write.table,
                write.chunk_hashes.clone(),
                write.metadata.clone(),
                Some(tx_id),
            )?;
            changes.push(TableChange {
                table: write.table.clone(),
                old_version,
                new_version: committed.version,
            });
            committed_versions.insert(write.table.clone(), committed.version);
        }

        if let Some(branches) = &self.branches {
            for (table, version) in &committed_versions {
                branches.update_head(&tx.branch, table, *version)?;
            }
        }

        let epoch_id = self.next_epoch_id.fetch_add(1, Ordering::SeqCst);
        let entry = ChangelogEntry {
            tx_id,
            epoch_id,
            committed_at: now_unix(),
            branch: tx.branch.clone(),
            changes,
        };
        self.changelog.append(&entry)?;
        self.remove_pending(tx_id)?;
        self.active.write().remove(&tx_id);
        tracing::info!(tx_id, tables = committed_versions.len(), "committed transaction");
        Ok(committed_versions)
    }

    pub fn abort(&self, tx_id: TxId, reason: Option<String>) -> Result<()> {
        self.remove_pending(tx_id)?;
        self.active.write().remove(&tx_id);
        tracing::warn!(tx_id, ?reason, "aborted transaction");
        Ok(())
    }

    pub fn get_transaction(&self, tx_id: TxId) -> Option<Transaction> {
        self.active.read().get(&tx_id).cloned()
    }

    pub fn active_transactions(&self) -> Vec<TxId> {
        self.active.read().keys().copied().collect()
    }

    pub fn get_changelog(&self, query: ChangelogQuery) -> Result<Vec<ChangelogEntry>> {
        self.changelog.query(&query)
    }

    pub fn latest_tx_id(&self) -> Result<Option<u64>> {
        self.changelog.latest_tx_id()
    }

    pub fn verify_consistency(&self) -> Result<Vec<ConsistencyIssue>> {
        let entries = self.changelog.all()?;
        let mut issues = Vec::new();
        let mut seen = std::collections::HashSet::new();
        let mut prev: Option<u64> = None;
        for entry in &entries {
            if !seen.insert(entry.tx_id) {
                issues.push(ConsistencyIssue(format!("duplicate tx_id {} in changelog", entry.tx_id)));
            }
            if let Some(p) = prev {
                if entry.tx_id <= p {
                    issues.push(ConsistencyIssue(format!(
                        "changelog out of order: tx_id {} follows {}",
                        entry.tx_id, p
                    )));
                }
            }
            prev = Some(entry.tx_id);
        }
        Ok(issues)
    }

    /// Scan on-disk pending records left by a crash: force-abort those
    /// without a terminal changelog entry, replay (idempotently) those the
    /// changelog says were `Committed` but whose effects are missing.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let committed_tx_ids: HashMap<u64, ChangelogEntry> = self
            .changelog
            .all()?
            .into_iter()
            .map(|e| (e.tx_id, e))
            .collect();

        let mut pending_files = Vec::new();
        for entry in fs::read_dir(&self.pending_dir).map_err(|e| Error::io(&self.pending_dir, e))? {
            let entry = entry.map_err(|e| Error::io(&self.pending_dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(tx_id) = name.parse::<u64>() {
                    pending_files.push(tx_id);
                }
            }
        }

        for tx_id in pending_files {
            let path = self.pending_path(tx_id);
            let tx: Transaction = match record::read_one(&path) {
                Ok(tx) => tx,
                Err(e) => {
                    report.warnings.push(format!("unreadable pending record {tx_id}: {e}"));
                    continue;
                }
            };

            match committed_tx_ids.get(&tx_id) {
                Some(changelog_entry) => {
                    let mut replayed_anything = false;
                    for change in &changelog_entry.changes {
                        let present = self
                            .catalog
                            .get_version(&change.table, Some(change.new_version))
                            .is_ok();
                        if !present {
                            let write = tx.writes.iter().find(|w| w.table == change.table);
                            if let Some(write) = write {
                                self.catalog.replay_version(
                                    &write.table,
                                    change.new_version,
                                    write.chunk_hashes.clone(),
                                    write.metadata.clone(),
                                    Some(tx_id),
                                )?;
                                replayed_anything = true;
                            } else {
                                report.warnings.push(format!(
                                    "tx {tx_id}: changelog names {} v{} but no write record to replay",
                                    change.table, change.new_version
                                ));
                            }
                        }
                        let branch_behind = self
                            .branches
                            .as_ref()
                            .map(|b| {
                                b.get_table_version(&changelog_entry.branch, &change.table)
                                    .ok()
                                    .flatten()
                                    != Some(change.new_version)
                            })
                            .unwrap_or(false);
                        if branch_behind {
                            if let Some(branches) = &self.branches {
                                branches.update_head(&changelog_entry.branch, &change.table, change.new_version)?;
                            }
                            replayed_anything = true;
                        }
                    }
                    self.remove_pending(tx_id)?;
                    if replayed_anything {
                        report.replayed.push(tx_id);
                    } else {
                        report.already_committed.push(tx_id);
                    }
                }
                None => {
                    for write in &tx.writes {
                        if let Ok(Some(latest)) = self.catalog.latest_version(&write.table) {
                            if latest == write.new_version {
                                if let Ok(v) = self.catalog.get_version(&write.table, Some(latest)) {
                                    if v.tx_id == Some(tx_id) {
                                        self.catalog.remove_version(&write.table, latest)?;
                                    }
                                }
                            }
                        }
                    }
                    self.remove_pending(tx_id)?;
                    report.rolled_back.push(tx_id);
                }
            }
        }

        self.active.write().clear();
        tracing::info!(
            replayed = report.replayed.len(),
            rolled_back = report.rolled_back.len(),
            already_committed = report.already_committed.len(),
            "transaction recovery complete"
        );
        Ok(report)
    }
}
