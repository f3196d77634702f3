//! Error types for the cache engine

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    /// Payload does not match the query selection's expected kind at a field.
    /// Fatal to the single write; nothing is committed for that write.
    #[error("shape mismatch at {path}: expected {expected}, got {actual}")]
    ShapeMismatch {
        path: String,
        expected: &'static str,
        actual: String,
    },

    /// Range concatenation found the same edge identifier in both segments.
    /// The operation is atomic: no partial segment mutation is retained.
    #[error("duplicate edge in range concatenation: {0}")]
    DuplicateEdge(String),

    #[error("transaction not found: {0}")]
    TransactionNotFound(u64),

    #[error("transaction {id} cannot {action} while {status}")]
    InvalidTransactionState {
        id: u64,
        status: &'static str,
        action: &'static str,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}
