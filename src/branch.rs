//! Mutable branch heads over the immutable catalog. Each branch is a
//! `table_name -> version` map, persisted as one framed record per branch
//! file, mutated only via `update_head` and `merge`.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::record;

pub const MAIN_BRANCH: &str = "main";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub name: String,
    pub description: Option<String>,
    pub parent: Option<String>,
    pub head: HashMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BranchDiff {
    pub unchanged: Vec<String>,
    pub modified: Vec<(String, u64, u64)>, // (table, source_version, target_version)
    pub added_in_source: Vec<String>,
    pub added_in_target: Vec<String>,
    pub has_conflicts: bool,
}

pub struct BranchManager {
    root: PathBuf,
    branch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cache: RwLock<HashMap<String, Branch>>,
}

impl BranchManager {
    /// Opens the branch store, autocreating `main` if this is a fresh
    /// database directory.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        let manager = Self {
            root,
            branch_locks: Mutex::new(HashMap::new()),
            cache: RwLock::new(HashMap::new()),
        };
        if !manager.branch_path(MAIN_BRANCH).exists() {
            manager.persist(&Branch {
                name: MAIN_BRANCH.to_string(),
                description: None,
                parent: None,
                head: HashMap::new(),
            })?;
        }
        Ok(manager)
    }

    fn branch_path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn branch_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.branch_locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn persist(&self, branch: &Branch) -> Result<()> {
        record::write_atomic(&self.branch_path(&branch.name), branch)?;
        self.cache.write().insert(branch.name.clone(), branch.clone());
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Branch> {
        if let Some(b) = self.cache.read().get(name).cloned() {
            return Ok(b);
        }
        let path = self.branch_path(name);
        if !path.exists() {
            return Err(Error::BranchNotFound(name.to_string()));
        }
        let branch: Branch = record::read_one(&path)?;
        self.cache.write().insert(name.to_string(), branch.clone());
        Ok(branch)
    }

    pub fn create(
        &self,
        name: &str,
        from_branch: Option<&str>,
        description: Option<String>,
    ) -> Result<Branch> {
        if self.branch_path(name).exists() {
            return Err(Error::BranchExists(name.to_string()));
        }
        let source_name = from_branch.unwrap_or(MAIN_BRANCH);
        let source = self.get(source_name)?;
        let branch = Branch {
            name: name.to_string(),
            description,
            parent: Some(source_name.to_string()),
            head: source.head.clone(),
        };
        let _guard = self.branch_lock(name).lock();
        self.persist(&branch)?;
        tracing::info!(branch = %name, from = %source_name, "created branch");
        Ok(branch)
    }

    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(|e| Error::io(&self.root, e))? {
            let entry = entry.map_err(|e| Error::io(&self.root, e))?;
            if let Some(name) = entry.file_name().to_str() {
                if !name.ends_with(".tmp") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    /// Atomically advance `branch`'s pointer for `table` to `new_version`.
    pub fn update_head(&self, branch: &str, table: &str, new_version: u64) -> Result<()> {
        let lock = self.branch_lock(branch);
        let _guard = lock.lock();
        let mut b = self.get(branch)?;
        b.head.insert(table.to_string(), new_version);
        self.persist(&b)?;
        Ok(())
    }

    pub fn get_table_version(&self, branch: &str, table: &str) -> Result<Option<u64>> {
        Ok(self.get(branch)?.head.get(table).copied())
    }

    pub fn diff(&self, source: &str, target: &str) -> Result<BranchDiff> {
        let source_branch = self.get(source)?;
        let target_branch = self.get(target)?;

        let mut diff = BranchDiff::default();
        for (table, &source_version) in &source_branch.head {
            match target_branch.head.get(table) {
                Some(&target_version) if target_version == source_version => {
                    diff.unchanged.push(table.clone());
                }
                Some(&target_version) => {
                    diff.modified.push((table.clone(), source_version, target_version));
                    if target_version > source_version {
                        diff.has_conflicts = true;
                    }
                }
                None => diff.added_in_source.push(table.clone()),
            }
        }
        for table in target_branch.head.keys() {
            if !source_branch.head.contains_key(table) {
                diff.added_in_target.push(table.clone());
            }
        }
        diff.unchanged.sort();
        diff.modified.sort_by(|a, b| a.0.cmp(&b.0));
        diff.added_in_source.sort();
        diff.added_in_target.sort();
        Ok(diff)
    }

    /// Fast-forward `into` to match `source` for every table `source` has
    /// advanced past (or introduced). Fails with `MergeConflict` — and
    /// changes neither branch — the instant any table has diverged.
    pub fn merge(&self, source: &str, into: &str) -> Result<()> {
        let lock = self.branch_lock(into);
        let _guard = lock.lock();

        let source_branch = self.get(source)?;
        let mut into_branch = self.get(into)?;

        for (table, &source_version) in &source_branch.head {
            if let Some(&into_version) = into_branch.head.get(table) {
                if into_version > source_version {
                    return Err(Error::MergeConflict {
                        table: table.clone(),
                        source_version,
                        into_version,
                    });
                }
            }
        }

        for (table, &source_version) in &source_branch.head {
            into_branch.head.insert(table.clone(), source_version);
        }
        self.persist(&into_branch)?;
        tracing::info!(source = %source, into = %into, "merged branch (fast-forward)");
        Ok(())
    }
}
