//! Unified error taxonomy for the engine.
//!
//! Every component returns `crate::error::Result<T>`. Validation errors never
//! leave durable side effects; not-found errors never mutate; conflict
//! errors leave the system in a clean, already-rolled-back state; integrity
//! errors are never swallowed.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // --- Validation errors (caller's fault, pre-I/O) ---
    #[error("invalid table name: {0:?}")]
    InvalidTableName(String),

    #[error("table is empty")]
    EmptyTable,

    #[error("size limit exceeded: {actual} {unit} > {maximum} {unit} maximum")]
    SizeLimitExceeded {
        actual: u64,
        maximum: u64,
        unit: &'static str,
    },

    #[error("schema too wide: {actual} columns > {maximum} maximum")]
    SchemaTooWide { actual: usize, maximum: usize },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid column: {0:?}")]
    InvalidColumn(String),

    // --- Not-found errors ---
    #[error("table not found: {0:?}")]
    TableNotFound(String),

    #[error("version {version} not found for table {table:?}")]
    VersionNotFound { table: String, version: u64 },

    #[error("branch not found: {0:?}")]
    BranchNotFound(String),

    #[error("transaction not found or no longer active: {0}")]
    TransactionNotFound(u64),

    #[error("chunk not found: {0}")]
    ChunkNotFound(String),

    // --- Conflict errors ---
    #[error("branch already exists: {0:?}")]
    BranchExists(String),

    #[error("merge conflict on table {table:?}: source={source_version}, into={into_version}")]
    MergeConflict {
        table: String,
        source_version: u64,
        into_version: u64,
    },

    #[error("transaction conflict on tables {tables:?}")]
    ConflictError { tables: Vec<String> },

    #[error("a transaction is already active on this engine instance")]
    NestedTransactionError,

    // --- Integrity errors ---
    #[error("corrupted chunk {hash}: expected hash {expected}, got {actual}")]
    CorruptedChunk {
        hash: String,
        expected: String,
        actual: String,
    },

    #[error("corrupted manifest at {path:?}: {reason}")]
    CorruptedManifest { path: PathBuf, reason: String },

    #[error("corrupted transaction log at {path:?}: {reason}")]
    CorruptedLog { path: PathBuf, reason: String },

    // --- I/O & wrapped library errors ---
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    // --- Emptiness (internal signal, converted before reaching callers) ---
    #[error("query returned empty result")]
    EmptyResult,
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}
