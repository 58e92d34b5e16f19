//! Book identity and embedding storage for one run.
//!
//! The store owns every book record exclusively. A book appears once no matter
//! how many categories it ends up in; only membership rows multiply.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use crate::error::{Result, TaxonomyError};
use crate::taxonomy::CategoryId;

/// Stable, caller-owned book identifier. Opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookId(String);

impl BookId {
    pub fn new(id: impl Into<String>) -> Self {
        BookId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier from file content (SHA-256, first 16 bytes as hex).
    pub fn from_content(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        BookId(hex::encode(&digest[..16]))
    }

    /// Identifier from a file path. Separators are normalized so the same
    /// library scanned on different platforms yields the same ids.
    pub fn from_path(path: &Path) -> Self {
        let normalized = path.to_string_lossy().replace('\\', "/");
        let mut hasher = Sha256::new();
        hasher.update(b"path|");
        hasher.update(normalized.trim_end_matches('/').as_bytes());
        let digest = hasher.finalize();
        BookId(hex::encode(&digest[..16]))
    }
}

impl fmt::Display for BookId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BookId {
    fn from(s: &str) -> Self {
        BookId::new(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    pub embedding: Vec<f32>,
    /// Display only; the engine never reads it.
    #[serde(default)]
    pub title: Option<String>,
    /// Primary category from the last committed run.
    #[serde(default, rename = "cachedCategory")]
    pub cached_category: Option<CategoryId>,
}

impl Book {
    pub fn new(id: impl Into<BookId>, embedding: Vec<f32>) -> Self {
        Self {
            id: id.into(),
            embedding,
            title: None,
            cached_category: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

impl From<String> for BookId {
    fn from(s: String) -> Self {
        BookId(s)
    }
}

/// All books of a run. Every embedding has the same dimension.
#[derive(Debug, Clone, Default)]
pub struct VectorStore {
    books: Vec<Book>,
    index: HashMap<BookId, usize>,
    dimension: Option<usize>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from (id, embedding) pairs, as delivered by the embedding provider.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, Vec<f32>)>,
        S: Into<BookId>,
    {
        let mut store = Self::new();
        for (id, embedding) in pairs {
            store.insert(Book::new(id, embedding))?;
        }
        Ok(store)
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }

    /// Embedding dimension, fixed by the first inserted book.
    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn get(&self, id: &BookId) -> Option<&Book> {
        self.index.get(id).map(|&i| &self.books[i])
    }

    pub fn contains(&self, id: &BookId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Book> {
        self.books.iter()
    }

    pub fn books(&self) -> &[Book] {
        &self.books
    }

    /// Add a new book. Fails if the id is already present.
    pub fn insert(&mut self, book: Book) -> Result<()> {
        if self.index.contains_key(&book.id) {
            return Err(TaxonomyError::DuplicateBook(book.id));
        }
        self.check_embedding(&book.id, &book.embedding)?;
        self.dimension.get_or_insert(book.embedding.len());
        self.index.insert(book.id.clone(), self.books.len());
        self.books.push(book);
        Ok(())
    }

    /// Add a book or replace the embedding of an existing one.
    /// The identifier never changes; title and cached assignment are kept when
    /// the incoming record does not carry them.
    pub fn upsert(&mut self, book: Book) -> Result<()> {
        let Some(&idx) = self.index.get(&book.id) else {
            return self.insert(book);
        };
        self.check_embedding(&book.id, &book.embedding)?;
        let existing = &mut self.books[idx];
        existing.embedding = book.embedding;
        if book.title.is_some() {
            existing.title = book.title;
        }
        if book.cached_category.is_some() {
            existing.cached_category = book.cached_category;
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &BookId) -> Option<Book> {
        let idx = self.index.remove(id)?;
        let book = self.books.remove(idx);
        for slot in self.index.values_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        if self.books.is_empty() {
            self.dimension = None;
        }
        Some(book)
    }

    fn check_embedding(&self, id: &BookId, embedding: &[f32]) -> Result<()> {
        if embedding.is_empty() {
            return Err(TaxonomyError::EmptyEmbedding(id.clone()));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(TaxonomyError::NonFiniteEmbedding(id.clone()));
        }
        if let Some(expected) = self.dimension {
            if embedding.len() != expected {
                return Err(TaxonomyError::DimensionMismatch {
                    book: id.clone(),
                    expected,
                    found: embedding.len(),
                });
            }
        }
        Ok(())
    }
}
