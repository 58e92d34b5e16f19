//! Incremental semantic taxonomy for a personal book library.
//!
//! Books arrive as embeddings. Each run clusters them, builds a two-level
//! category tree, assigns every book to one or more categories and keeps
//! category ids stable across runs.

pub mod clustering;
pub mod db;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod logging;
pub mod membership;
pub mod neighbors;
pub mod settings;
pub mod similarity;
pub mod stability;
pub mod taxonomy;
pub mod union_find;
pub mod vector_store;

pub use db::TaxonomyStore;
pub use engine::{RunOutcome, RunReport, TaxonomyEngine};
pub use error::{Result, TaxonomyError};
pub use settings::{EngineConfig, Settings};
pub use taxonomy::{CategoryId, Level, TaxonomyState};
pub use vector_store::{Book, BookId, VectorStore};
