//! Content-addressable chunk store: a durable map from a BLAKE3 hash to an
//! opaque byte blob, sharded on disk to keep directories bounded.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::hash::{compute_hash, is_well_formed};

pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).map_err(|e| Error::io(&root, e))?;
        Ok(Self { root })
    }

    fn chunk_path(&self, hash: &str) -> Result<PathBuf> {
        if !is_well_formed(hash) {
            return Err(Error::ChunkNotFound(hash.to_string()));
        }
        Ok(self.root.join(&hash[0..2]).join(&hash[2..4]).join(hash))
    }

    /// Compute `H(bytes)`, write atomically if not already present, return
    /// the hash. Idempotent.
    pub fn put(&self, bytes: &[u8]) -> Result<String> {
        let hash = compute_hash(bytes);
        let path = self.chunk_path(&hash)?;
        if path.exists() {
            return Ok(hash);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
        }
        let tmp_path = path.with_extension(format!("tmp-{}", std::process::id()));
        {
            let mut f = File::create(&tmp_path).map_err(|e| Error::io(&tmp_path, e))?;
            f.write_all(bytes).map_err(|e| Error::io(&tmp_path, e))?;
            f.sync_all().map_err(|e| Error::io(&tmp_path, e))?;
        }
        // rename-if-not-exists semantics: a concurrent writer of identical
        // bytes is harmless since the content (and therefore the hash) is
        // the same either way.
        match fs::rename(&tmp_path, &path) {
            Ok(()) => {}
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                if !path.exists() {
                    return Err(Error::io(&path, e));
                }
            }
        }
        tracing::debug!(hash = %hash, bytes = bytes.len(), "wrote chunk");
        Ok(hash)
    }

    /// Parallel write, order-preserving result.
    pub fn put_batch(&self, items: &[Vec<u8>]) -> Result<Vec<String>> {
        items.par_iter().map(|b| self.put(b)).collect()
    }

    /// Read the blob for `hash` without verifying its content hash.
    pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
        let path = self.chunk_path(hash)?;
        if !path.exists() {
            return Err(Error::ChunkNotFound(hash.to_string()));
        }
        let mut file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        let mut content = Vec::new();
        file.read_to_end(&mut content).map_err(|e| Error::io(&path, e))?;
        tracing::debug!(hash = %hash, bytes = content.len(), "read chunk");
        Ok(content)
    }

    /// Like `get`, but recomputes the hash on the read bytes.
    pub fn get_verified(&self, hash: &str) -> Result<Vec<u8>> {
        let content = self.get(hash)?;
        let actual = compute_hash(&content);
        if actual != hash {
            return Err(Error::CorruptedChunk {
                hash: hash.to_string(),
                expected: hash.to_string(),
                actual,
            });
        }
        Ok(content)
    }

    pub fn get_batch(&self, hashes: &[String]) -> Result<Vec<Vec<u8>>> {
        hashes.par_iter().map(|h| self.get(h)).collect()
    }

    pub fn get_batch_verified(&self, hashes: &[String]) -> Result<Vec<Vec<u8>>> {
        hashes.par_iter().map(|h| self.get_verified(h)).collect()
    }

    /// Memory-mapped read. Same contract as `get`, without the owned-copy cost.
    pub fn get_mmap(&self, hash: &str) -> Result<memmap2::Mmap> {
        let path = self.chunk_path(hash)?;
        if !path.exists() {
            return Err(Error::ChunkNotFound(hash.to_string()));
        }
        let file = File::open(&path).map_err(|e| Error::io(&path, e))?;
        // SAFETY: the chunk store never mutates a blob once written, so the
        // mapping cannot observe a concurrent write.
        unsafe { memmap2::Mmap::map(&file) }.map_err(|e| Error::io(&path, e))
    }

    pub fn get_mmap_batch(&self, hashes: &[String]) -> Result<Vec<memmap2::Mmap>> {
        hashes.iter().map(|h| self.get_mmap(h)).collect()
    }

    pub fn exists(&self, hash: &str) -> Result<bool> {
        Ok(self.chunk_path(hash)?.exists())
    }
}
