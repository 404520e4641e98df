//! Durable, append-only registry of table versions. One manifest file per
//! `(table, version)`, named by zero-padded version number so the highest
//! filename in a directory is the latest version without scanning.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record;

/// `table_name` must start with a letter or underscore, contain only
/// ASCII alphanumerics and underscores thereafter, be lowercase, and be
/// at most 128 characters.
pub fn validate_table_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 128 {
        return Err(Error::InvalidTableName(name.to_string()));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(Error::InvalidTableName(name.to_string()));
    }
    if !chars.clone().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::InvalidTableName(name.to_string()));
    }
    if name.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(Error::InvalidTableName(name.to_string()));
    }
    Ok(())
}

// `chunk_hashes` has no refcounts yet — garbage collection is deferred,
// this struct is where a future pass would add them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableVersion {
    pub table_name: String,
    pub version: u64,
    pub chunk_hashes: Vec<String>,
    pub parent_version: Option<u64>,
    pub created_at: i64,
    pub metadata: Option<String>,
    /// The transaction that produced this version, if any. Lets crash
    /// recovery identify and remove a catalog entry that was written but
    /// whose transaction never reached the changelog.
    #[serde(default)]
    pub tx_id: Option<u64>,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_secs() as i64
}

const VERSION_WIDTH: usize = 20;

fn version_filename(version: u64) -> String {
    format!("{version:0width$}", width = VERSION_WIDTH)
}

pub struct Catalog {
    root: PathBuf,
    /// In-memory cache of the latest known version per table, to avoid a
    /// directory scan on every read. Populated lazily and kept current by
    /// `commit`.
    latest_cache: RwLock<HashMap<String, u64>>,
    /// Per-table locks serializing `commit` against itself.
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Catalog {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        Ok(Self {
            root,
            latest_cache: RwLock::new(HashMap::new()),
            table_locks: Mutex::new(HashMap::new()),
        })
    }

    fn table_dir(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    fn manifest_path(&self, table: &str, version: u64) -> PathBuf {
        self.table_dir(table).join(version_filename(version))
    }

    fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        self.table_locks
            .lock()
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Scan the table directory for the highest version filename. Only
    /// used to seed the in-memory cache.
    fn scan_latest(&self, table: &str) -> Result<Option<u64>> {
        let dir = self.table_dir(table);
        if !dir.exists() {
            return Ok(None);
        }
        let mut max_version = None;
        for entry in fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(v) = name.parse::<u64>() {
                    max_version = Some(max_version.map_or(v, |m: u64| m.max(v)));
                }
            }
        }
        Ok(max_version)
    }

    fn cached_latest(&self, table: &str) -> Result<Option<u64>> {
        if let Some(v) = self.latest_cache.read().get(table).copied() {
            return Ok(Some(v));
        }
        let scanned = self.scan_latest(table)?;
        if let Some(v) = scanned {
            self.latest_cache.write().insert(table.to_string(), v);
        }
        Ok(scanned)
    }

    /// The current latest version for `table`, or `None` if the table has
    /// never been committed to.
    pub fn latest_version(&self, table: &str) -> Result<Option<u64>> {
        self.cached_latest(table)
    }

    /// Assign the next dense version for `table`, write its manifest
    /// durably, and return the committed record. Serialized per table.
    pub fn commit(
        &self,
        table: &str,
        chunk_hashes: Vec<String>,
        metadata: Option<String>,
        tx_id: Option<u64>,
    ) -> Result<TableVersion> {
        validate_table_name(table)?;
        if chunk_hashes.is_empty() {
            return Err(Error::EmptyTable);
        }
        let lock = self.table_lock(table);
        let _guard = lock.lock();

        let current = self.cached_latest(table)?;
        let version = current.map_or(1, |v| v + 1);
        let record = TableVersion {
            table_name: table.to_string(),
            version,
            chunk_hashes,
            parent_version: current,
            created_at: now_unix(),
            metadata,
            tx_id,
        };

        let path = self.manifest_path(table, version);
        record::write_atomic(&path, &record)?;
        self.latest_cache.write().insert(table.to_string(), version);
        tracing::info!(table = %table, version, "committed table version");
        Ok(record)
    }

    /// Remove a manifest that crash recovery has determined was never
    /// confirmed by the changelog. Not used in any non-recovery path —
    /// committed versions are otherwise immutable and permanent.
    pub fn remove_version(&self, table: &str, version: u64) -> Result<()> {
        let path = self.manifest_path(table, version);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::io(&path, e))?;
        }
        let mut cache = self.latest_cache.write();
        if cache.get(table).copied() == Some(version) {
            cache.remove(table);
        }
        tracing::warn!(table = %table, version, "removed orphaned catalog entry during recovery");
        Ok(())
    }

    /// Write a manifest at an exact, already-assigned version number if
    /// it isn't already there. Used only by transaction recovery to
    /// replay a commit the changelog confirms happened but whose catalog
    /// side effect never reached disk.
    pub fn replay_version(
        &self,
        table: &str,
        version: u64,
        chunk_hashes: Vec<String>,
        metadata: Option<String>,
        tx_id: Option<u64>,
    ) -> Result<()> {
        let lock = self.table_lock(table);
        let _guard = lock.lock();

        let path = self.manifest_path(table, version);
        if path.exists() {
            return Ok(());
        }
        let record = TableVersion {
            table_name: table.to_string(),
            version,
            chunk_hashes,
            parent_version: version.checked_sub(1),
            created_at: now_unix(),
            metadata,
            tx_id,
        };
        record::write_atomic(&path, &record)?;
        let mut cache = self.latest_cache.write();
        let current = cache.get(table).copied().unwrap_or(0);
        if version > current {
            cache.insert(table.to_string(), version);
        }
        tracing::warn!(table = %table, version, "replayed missing catalog entry during recovery");
        Ok(())
    }

    pub fn list_tables(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }
        let mut tables = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| Error::io(&self.root, e))? {
            let entry = entry.map_err(|e| Error::io(&self.root, e))?;
            if entry.file_type().map_err(|e| Error::io(&self.root, e))?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    tables.push(name.to_string());
                }
            }
        }
        tables.sort();
        Ok(tables)
    }

    pub fn list_versions(&self, table: &str) -> Result<Vec<u64>> {
        let dir = self.table_dir(table);
        if !dir.exists() {
            return Err(Error::TableNotFound(table.to_string()));
        }
        let mut versions = Vec::new();
        for entry in fs::read_dir(&dir).map_err(|e| Error::io(&dir, e))? {
            let entry = entry.map_err(|e| Error::io(&dir, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if let Ok(v) = name.parse::<u64>() {
                    versions.push(v);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// `version = None` resolves to the latest version.
    pub fn get_version(&self, table: &str, version: Option<u64>) -> Result<TableVersion> {
        let version = match version {
            Some(v) => v,
            None => self
                .cached_latest(table)?
                .ok_or_else(|| Error::TableNotFound(table.to_string()))?,
        };
        let path = self.manifest_path(table, version);
        if !path.exists() {
            if !self.table_dir(table).exists() {
                return Err(Error::TableNotFound(table.to_string()));
            }
            return Err(Error::VersionNotFound {
                table: table.to_string(),
                version,
            });
        }
        record::read_one(&path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn commit_assigns_dense_versions() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        let v1 = catalog.commit("users", vec!["h1".into()], None, None).unwrap();
        let v2 = catalog.commit("users", vec!["h2".into()], None, None).unwrap();
        assert_eq!(v1.version, 1);
        assert_eq!(v2.version, 2);
        assert_eq!(v2.parent_version, Some(1));
    }

    #[test]
    fn list_versions_is_ascending() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        for i in 0..5 {
            catalog.commit("orders", vec![format!("h{i}")], None, None).unwrap();
        }
        assert_eq!(catalog.list_versions("orders").unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn get_version_latest_and_explicit() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.commit("users", vec!["h1".into()], None, None).unwrap();
        catalog.commit("users", vec!["h2".into()], None, None).unwrap();

        let latest = catalog.get_version("users", None).unwrap();
        assert_eq!(latest.version, 2);
        let v1 = catalog.get_version("users", Some(1)).unwrap();
        assert_eq!(v1.chunk_hashes, vec!["h1".to_string()]);
    }

    #[test]
    fn unknown_table_and_version_errors() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        assert!(matches!(
            catalog.get_version("ghost", None),
            Err(Error::TableNotFound(_))
        ));
        catalog.commit("users", vec!["h1".into()], None, None).unwrap();
        assert!(matches!(
            catalog.get_version("users", Some(99)),
            Err(Error::VersionNotFound { .. })
        ));
    }

    #[test]
    fn list_tables_is_sorted() {
        let dir = tempdir().unwrap();
        let catalog = Catalog::open(dir.path()).unwrap();
        catalog.commit("zebra", vec!["h".into()], None, None).unwrap();
        catalog.commit("alpha", vec!["h".into()], None, None).unwrap();
        assert_eq!(catalog.list_tables().unwrap(), vec!["alpha".to_string(), "zebra".to_string()]);
    }

    #[test]
    fn invalid_table_names_are_rejected() {
        assert!(validate_table_name("").is_err());
        assert!(validate_table_name("Users").is_err());
        assert!(validate_table_name("1users").is_err());
        assert!(validate_table_name("user-name").is_err());
        assert!(validate_table_name("users").is_ok());
        assert!(validate_table_name("_private").is_ok());
    }

    #[test]
    fn commit_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let catalog = Catalog::open(dir.path()).unwrap();
            catalog.commit("users", vec!["h1".into()], None, None).unwrap();
        }
        let catalog = Catalog::open(dir.path()).unwrap();
        assert_eq!(catalog.latest_version("users").unwrap(), Some(1));
    }
}
