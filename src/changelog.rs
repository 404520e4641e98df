//! Append-only, monotone-in-`tx_id` log of committed transactions. The
//! system of record for branch-head evolution and the source for CDC-style
//! subscriber queries.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableChange {
    pub table: String,
    pub old_version: Option<u64>,
    pub new_version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangelogEntry {
    pub tx_id: u64,
    pub epoch_id: u64,
    pub committed_at: i64,
    pub branch: String,
    pub changes: Vec<TableChange>,
}

#[derive(Debug, Clone, Default)]
pub struct ChangelogQuery {
    pub since_tx_id: Option<u64>,
    pub since_timestamp: Option<i64>,
    pub branch: Option<String>,
    pub tables: Option<Vec<String>>,
    pub limit: Option<usize>,
}

pub struct Changelog {
    path: PathBuf,
}

impl Changelog {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, entry: &ChangelogEntry) -> Result<()> {
        record::append(&self.path, entry)
    }

    /// Every entry, in commit (append) order.
    pub fn all(&self) -> Result<Vec<ChangelogEntry>> {
        record::read_all(&self.path).map_err(|e| match e {
            Error::CorruptedManifest { path, reason } => Error::CorruptedLog { path, reason },
            other => other,
        })
    }

    pub fn latest_tx_id(&self) -> Result<Option<u64>> {
        Ok(self.all()?.last().map(|e| e.tx_id))
    }

    pub fn query(&self, q: &ChangelogQuery) -> Result<Vec<ChangelogEntry>> {
        let mut out: Vec<ChangelogEntry> = self
            .all()?
            .into_iter()
            .filter(|e| q.since_tx_id.map_or(true, |since| e.tx_id > since))
            .filter(|e| q.since_timestamp.map_or(true, |since| e.committed_at >= since))
            .filter(|e| q.branch.as_deref().map_or(true, |b| e.branch == b))
            .filter(|e| {
                q.tables.as_ref().map_or(true, |tables| {
                    e.changes.iter().any(|c| tables.contains(&c.table))
                })
            })
            .collect();
        if let Some(limit) = q.limit {
            out.truncate(limit);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(tx_id: u64, branch: &str, table: &str, new_version: u64) -> ChangelogEntry {
        ChangelogEntry {
            tx_id,
            epoch_id: 0,
            committed_at: tx_id as i64,
            branch: branch.to_string(),
            changes: vec![TableChange {
                table: table.to_string(),
                old_version: new_version.checked_sub(1),
                new_version,
            }],
        }
    }

    #[test]
    fn append_and_query_preserve_order() {
        let dir = tempdir().unwrap();
        let log = Changelog::open(dir.path().join("log"));
        for i in 1..=5 {
            log.append(&entry(i, "main", "users", i)).unwrap();
        }
        let all = log.query(&ChangelogQuery::default()).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!(log.latest_tx_id().unwrap(), Some(5));
    }

    #[test]
    fn since_tx_id_is_exclusive() {
        let dir = tempdir().unwrap();
        let log = Changelog::open(dir.path().join("log"));
        for i in 1..=5 {
            log.append(&entry(i, "main", "users", i)).unwrap();
        }
        let recent = log
            .query(&ChangelogQuery { since_tx_id: Some(3), ..Default::default() })
            .unwrap();
        assert_eq!(recent.iter().map(|e| e.tx_id).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn filters_by_table_and_branch() {
        let dir = tempdir().unwrap();
        let log = Changelog::open(dir.path().join("log"));
        log.append(&entry(1, "main", "users", 1)).unwrap();
        log.append(&entry(2, "feature", "orders", 1)).unwrap();
        log.append(&entry(3, "main", "orders", 1)).unwrap();

        let only_orders = log
            .query(&ChangelogQuery { tables: Some(vec!["orders".into()]), ..Default::default() })
            .unwrap();
        assert_eq!(only_orders.iter().map(|e| e.tx_id).collect::<Vec<_>>(), vec![2, 3]);

        let only_main = log
            .query(&ChangelogQuery { branch: Some("main".into()), ..Default::default() })
            .unwrap();
        assert_eq!(only_main.iter().map(|e| e.tx_id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn limit_truncates_results() {
        let dir = tempdir().unwrap();
        let log = Changelog::open(dir.path().join("log"));
        for i in 1..=10 {
            log.append(&entry(i, "main", "users", i)).unwrap();
        }
        let limited = log.query(&ChangelogQuery { limit: Some(3), ..Default::default() }).unwrap();
        assert_eq!(limited.len(), 3);
    }

    #[test]
    fn corrupted_log_file_is_reported_as_corrupted_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        let log = Changelog::open(&path);
        log.append(&entry(1, "main", "users", 1)).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(log.all(), Err(Error::CorruptedLog { .. })));
    }

    #[test]
    fn empty_log_has_no_latest_tx_id() {
        let dir = tempdir().unwrap();
        let log = Changelog::open(dir.path().join("log"));
        assert_eq!(log.latest_tx_id().unwrap(), None);
    }
}
