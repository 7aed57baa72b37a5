use crate::value::{ColumnType, Scalar};
use crate::DetId;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Identifies one stored property row when reporting consistency problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowSpan {
    pub time0: i64,
    pub time1: i64,
}

impl std::fmt::Display for RowSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.time0, self.time1)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("unknown observation: {0}")]
    UnknownObservation(String),
    #[error("unknown detset: {0}")]
    UnknownDetset(String),
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error("unknown detector: {0}")]
    UnknownDetector(String),
    #[error("column name {0} matches more than one property table")]
    AmbiguousColumn(String),
    #[error("duplicate column {0}")]
    DuplicateColumn(String),

    #[error("file {name} is already registered for {obs_id}/{detset}")]
    DuplicateFile {
        name: String,
        obs_id: String,
        detset: String,
    },
    #[error("invalid path {0}: catalog file names must be relative")]
    InvalidPath(String),
    #[error("invalid range: {0}")]
    InvalidRange(String),
    #[error("row has {found} values but the table has {expected} columns")]
    RowArity { expected: usize, found: usize },
    #[error("row index {index} out of range for table of {len} rows")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("column {column} expects {expected}, got {found}")]
    TypeMismatch {
        column: String,
        expected: ColumnType,
        found: Scalar,
    },

    #[error("overlapping intervals in table {table} for det_id {det_id}: {row_a} and {row_b}")]
    OverlapDetected {
        table: String,
        det_id: DetId,
        row_a: RowSpan,
        row_b: RowSpan,
    },
    #[error("table {table} has {} rows covering {detector} at {at}", rows.len())]
    AmbiguousProperty {
        table: String,
        detector: String,
        at: String,
        rows: Vec<RowSpan>,
    },
    #[error("merge key {key} matches more than one row on the right-hand side")]
    AmbiguousMatch { key: String },
    #[error("manifest entries for {first} and {second} match the same index data")]
    ManifestOverlap { first: String, second: String },
    #[error("missing required parameter {0}")]
    MissingParameter(String),

    #[error("schema error: {0}")]
    Schema(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for CatalogError {
    fn from(e: redb::DatabaseError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for CatalogError {
    fn from(e: redb::TransactionError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for CatalogError {
    fn from(e: redb::TableError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for CatalogError {
    fn from(e: redb::StorageError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for CatalogError {
    fn from(e: redb::CommitError) -> Self {
        CatalogError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;
