use thiserror::Error;

use crate::taxonomy::{CategoryId, Level};
use crate::vector_store::BookId;

#[derive(Error, Debug)]
pub enum TaxonomyError {
    /// Too few books for clustering to mean anything. Wait for more input.
    #[error("Insufficient data: {found} books present, at least {required} required")]
    InsufficientData { found: usize, required: usize },

    /// Upstream embedding generation produced vectors of different lengths.
    #[error("Dimension mismatch for book {book}: expected {expected}, found {found}")]
    DimensionMismatch {
        book: BookId,
        expected: usize,
        found: usize,
    },

    #[error("Book {0} has an empty embedding")]
    EmptyEmbedding(BookId),

    #[error("Book {0} has a non-finite value in its embedding")]
    NonFiniteEmbedding(BookId),

    #[error("Book {0} is already present")]
    DuplicateBook(BookId),

    /// Matching cannot pick an identity without guessing. Needs manual resolution.
    #[error(
        "Stability conflict at level {level}: new node {new_node} ties at similarity {similarity:.6} with {} persisted categories ({})",
        .candidates.len(),
        format_ids(.candidates)
    )]
    StabilityConflict {
        level: Level,
        new_node: usize,
        candidates: Vec<CategoryId>,
        similarity: f32,
    },

    #[error("Taxonomy changed since the run started: expected revision {expected}, found {found}")]
    StaleRevision { expected: u64, found: u64 },

    #[error("Taxonomy invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Corrupt stored data: {0}")]
    CorruptData(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl TaxonomyError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        TaxonomyError::InvalidConfig(message.into())
    }

    /// Whether waiting for more input (rather than fixing something) resolves the error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TaxonomyError::InsufficientData { .. })
    }
}

fn format_ids(ids: &[CategoryId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, TaxonomyError>;
