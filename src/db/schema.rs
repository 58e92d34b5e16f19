use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::engine::RunReport;
use crate::error::{Result, TaxonomyError};
use crate::taxonomy::{
    CategoryId, CategoryNode, LabelRejection, LabelReport, Level, Membership, NodeStatus,
    TaxonomyState, Unclassified, UnclassifiedReason,
};
use crate::vector_store::{Book, BookId, VectorStore};

/// One committed run, as logged in the `runs` table.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub run_id: String,
    pub revision: u64,
    pub committed_at: i64,
    pub books: usize,
    pub categories_created: usize,
    pub categories_reused: usize,
    pub categories_retired: usize,
    pub splits: usize,
    pub unclassified: usize,
}

pub struct TaxonomyStore {
    conn: Mutex<Connection>,
    path: String,
}

impl TaxonomyStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        let db = TaxonomyStore { conn: Mutex::new(conn), path: path_str };
        db.init()?;
        Ok(db)
    }

    pub fn get_path(&self) -> String {
        self.path.clone()
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = TaxonomyStore { conn: Mutex::new(conn), path: ":memory:".to_string() };
        db.init()?;
        Ok(db)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| TaxonomyError::LockPoisoned)
    }

    fn init(&self) -> Result<()> {
        let conn = self.lock()?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS books (
                id TEXT PRIMARY KEY,
                title TEXT,
                dim INTEGER NOT NULL,
                embedding BLOB NOT NULL,
                cached_category INTEGER,   -- primary category of the last committed run
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                level INTEGER NOT NULL,    -- 0 = category, 1 = subcategory
                parent_id INTEGER,
                centroid BLOB NOT NULL,
                member_count INTEGER NOT NULL DEFAULT 0,
                label TEXT,
                label_stale INTEGER NOT NULL DEFAULT 0,
                created_revision INTEGER NOT NULL,
                updated_revision INTEGER NOT NULL,
                retired_revision INTEGER   -- NULL while active
            );

            CREATE TABLE IF NOT EXISTS memberships (
                book_id TEXT NOT NULL,
                category_id INTEGER NOT NULL REFERENCES categories(id),
                confidence REAL NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 0,
                position INTEGER NOT NULL,
                PRIMARY KEY (book_id, category_id)
            );

            CREATE TABLE IF NOT EXISTS unclassified (
                book_id TEXT PRIMARY KEY,
                reason TEXT NOT NULL,
                best_confidence REAL,
                position INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS taxonomy_meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                revision INTEGER NOT NULL,
                committed_at INTEGER NOT NULL,
                books INTEGER NOT NULL,
                categories_created INTEGER NOT NULL,
                categories_reused INTEGER NOT NULL,
                categories_retired INTEGER NOT NULL,
                splits INTEGER NOT NULL,
                unclassified INTEGER NOT NULL,
                report TEXT NOT NULL       -- full RunReport as JSON
            );

            CREATE INDEX IF NOT EXISTS idx_memberships_category ON memberships(category_id);
            CREATE INDEX IF NOT EXISTS idx_categories_parent ON categories(parent_id);

            PRAGMA foreign_keys = ON;
            "
        )?;

        // Migration: Add split_from column for split provenance
        let has_split_from: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('categories') WHERE name = 'split_from'",
            [],
            |row| row.get(0),
        )?;

        if !has_split_from {
            conn.execute("ALTER TABLE categories ADD COLUMN split_from INTEGER", [])?;
            tracing::info!(target: "store", "Migration: added split_from column to categories");
        }

        Ok(())
    }

    // ==================== Taxonomy State ====================

    pub fn revision(&self) -> Result<u64> {
        let conn = self.lock()?;
        read_meta(&conn, "revision", 0)
    }

    /// Reconstruct the committed state exactly, without recomputation.
    pub fn load_state(&self) -> Result<TaxonomyState> {
        let conn = self.lock()?;
        let revision = read_meta(&conn, "revision", 0)?;
        let next_category_seq = read_meta(&conn, "next_category_seq", 1)?;

        let mut stmt = conn.prepare(
            "SELECT id, level, parent_id, centroid, member_count, label, label_stale,
                    created_revision, updated_revision, retired_revision, split_from
             FROM categories ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(CategoryRow {
                    id: row.get(0)?,
                    level: row.get(1)?,
                    parent_id: row.get(2)?,
                    centroid: row.get(3)?,
                    member_count: row.get(4)?,
                    label: row.get(5)?,
                    label_stale: row.get(6)?,
                    created_revision: row.get(7)?,
                    updated_revision: row.get(8)?,
                    retired_revision: row.get(9)?,
                    split_from: row.get(10)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut nodes = BTreeMap::new();
        for row in rows {
            let node = row.into_node()?;
            nodes.insert(node.id, node);
        }

        // Active centroids share one dimension
        let mut active = nodes.values().filter(|n| n.is_active());
        if let Some(first) = active.next() {
            let dim = first.centroid.len();
            if let Some(odd) = active.find(|n| n.centroid.len() != dim) {
                return Err(TaxonomyError::CorruptData(format!(
                    "category {} centroid has {} values, expected {}",
                    odd.id.0,
                    odd.centroid.len(),
                    dim
                )));
            }
        }

        let mut stmt = conn.prepare(
            "SELECT book_id, category_id, confidence, is_primary
             FROM memberships ORDER BY position",
        )?;
        let memberships = stmt
            .query_map([], |row| {
                Ok(Membership {
                    book: BookId::new(row.get::<_, String>(0)?),
                    category: CategoryId(row.get::<_, i64>(1)? as u64),
                    confidence: row.get::<_, f64>(2)? as f32,
                    primary: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT book_id, reason, best_confidence FROM unclassified ORDER BY position",
        )?;
        let raw = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut unclassified = Vec::with_capacity(raw.len());
        for (book, reason, best) in raw {
            let reason = UnclassifiedReason::from_parts(&reason, best.map(|b| b as f32))
                .ok_or_else(|| {
                    TaxonomyError::CorruptData(format!("unknown unclassified reason {:?}", reason))
                })?;
            unclassified.push(Unclassified { book: BookId::new(book), reason });
        }

        let state = TaxonomyState {
            revision,
            next_category_seq,
            nodes,
            memberships,
            unclassified,
        };
        state
            .validate()
            .map_err(|e| TaxonomyError::CorruptData(e.to_string()))?;
        Ok(state)
    }

    /// Replace the committed state with `state` in one transaction.
    ///
    /// Fails with `StaleRevision` if another commit landed after
    /// `expected_revision` was read. Labels written by naming while the run
    /// was computing are kept.
    pub fn commit(&self, state: &TaxonomyState, expected_revision: u64, report: &RunReport) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let found = read_meta(&tx, "revision", 0)?;
        if found != expected_revision {
            tracing::warn!(target: "store", expected = expected_revision, found, "stale commit rejected");
            return Err(TaxonomyError::StaleRevision { expected: expected_revision, found });
        }

        write_categories(&tx, state)?;
        write_memberships(&tx, state)?;
        write_meta(&tx, "revision", state.revision)?;
        write_meta(&tx, "next_category_seq", state.next_category_seq)?;
        write_cached_categories(&tx, state)?;

        tx.execute(
            "INSERT INTO runs (run_id, revision, committed_at, books, categories_created,
                               categories_reused, categories_retired, splits, unclassified, report)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                report.run_id,
                state.revision as i64,
                chrono::Utc::now().timestamp_millis(),
                report.books as i64,
                report.categories_created as i64,
                report.categories_reused as i64,
                report.categories_retired as i64,
                report.splits as i64,
                report.unclassified as i64,
                serde_json::to_string(report)?,
            ],
        )?;

        tx.commit()?;
        tracing::info!(
            target: "store",
            revision = state.revision,
            nodes = state.nodes.len(),
            memberships = state.memberships.len(),
            "taxonomy committed"
        );
        Ok(())
    }

    /// Label intake from the naming component. Only touches label columns and
    /// only where the current label is null or stale.
    pub fn apply_labels(&self, labels: &HashMap<CategoryId, String>) -> Result<LabelReport> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut report = LabelReport::default();

        let mut ids: Vec<&CategoryId> = labels.keys().collect();
        ids.sort();
        for id in ids {
            let label = labels[id].trim();
            let row: Option<(Option<i64>, Option<String>, bool)> = tx
                .query_row(
                    "SELECT retired_revision, label, label_stale FROM categories WHERE id = ?1",
                    params![id.0 as i64],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            let rejection = match row {
                None => Some(LabelRejection::UnknownCategory),
                Some((Some(_), _, _)) => Some(LabelRejection::Retired),
                Some(_) if label.is_empty() => Some(LabelRejection::EmptyLabel),
                Some((None, Some(_), false)) => Some(LabelRejection::AlreadyLabeled),
                Some(_) => None,
            };
            match rejection {
                Some(reason) => report.rejected.push((*id, reason)),
                None => {
                    tx.execute(
                        "UPDATE categories SET label = ?2, label_stale = 0 WHERE id = ?1",
                        params![id.0 as i64, label],
                    )?;
                    report.applied.push(*id);
                }
            }
        }

        tx.commit()?;
        tracing::info!(
            target: "store",
            applied = report.applied.len(),
            rejected = report.rejected.len(),
            "labels applied"
        );
        Ok(report)
    }

    pub fn recent_runs(&self, limit: usize) -> Result<Vec<RunSummary>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, revision, committed_at, books, categories_created, categories_reused,
                    categories_retired, splits, unclassified
             FROM runs ORDER BY revision DESC LIMIT ?1",
        )?;
        let runs = stmt
            .query_map(params![limit as i64], |row| {
                Ok(RunSummary {
                    run_id: row.get(0)?,
                    revision: row.get::<_, i64>(1)? as u64,
                    committed_at: row.get(2)?,
                    books: row.get::<_, i64>(3)? as usize,
                    categories_created: row.get::<_, i64>(4)? as usize,
                    categories_reused: row.get::<_, i64>(5)? as usize,
                    categories_retired: row.get::<_, i64>(6)? as usize,
                    splits: row.get::<_, i64>(7)? as usize,
                    unclassified: row.get::<_, i64>(8)? as usize,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    // ==================== Books ====================

    /// Insert a book or replace its embedding. A title already on record is
    /// kept when the new record has none.
    pub fn upsert_book(&self, book: &Book) -> Result<()> {
        self.upsert_books(std::slice::from_ref(book))
    }

    /// Batch upsert in one transaction. Every embedding must match the
    /// dimension of the books already stored.
    pub fn upsert_books(&self, books: &[Book]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let mut dimension: Option<usize> = tx
            .query_row("SELECT dim FROM books LIMIT 1", [], |row| row.get::<_, i64>(0))
            .optional()?
            .map(|d| d as usize);
        let now = chrono::Utc::now().timestamp_millis();
        {
            let mut stmt = tx.prepare(
                "INSERT INTO books (id, title, dim, embedding, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                    title = COALESCE(excluded.title, books.title),
                    dim = excluded.dim,
                    embedding = excluded.embedding,
                    updated_at = excluded.updated_at",
            )?;
            for book in books {
                check_embedding(&book.id, &book.embedding)?;
                let expected = *dimension.get_or_insert(book.embedding.len());
                if book.embedding.len() != expected {
                    return Err(TaxonomyError::DimensionMismatch {
                        book: book.id.clone(),
                        expected,
                        found: book.embedding.len(),
                    });
                }
                stmt.execute(params![
                    book.id.as_str(),
                    book.title,
                    book.embedding.len() as i64,
                    embedding_to_bytes(&book.embedding),
                    now,
                ])?;
            }
        }
        tx.commit()?;
        tracing::debug!(target: "store", count = books.len(), "books upserted");
        Ok(())
    }

    /// Drop a book from the library. Its memberships stay part of the
    /// committed state until the next run replaces it.
    pub fn remove_book(&self, id: &BookId) -> Result<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("DELETE FROM books WHERE id = ?1", params![id.as_str()])?;
        Ok(changed > 0)
    }

    pub fn book_count(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM books", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// All books in insertion order.
    pub fn load_vector_store(&self) -> Result<VectorStore> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, title, dim, embedding, cached_category FROM books ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut store = VectorStore::new();
        for (id, title, dim, bytes, cached) in rows {
            let embedding = bytes_to_embedding(&bytes)
                .map_err(|e| TaxonomyError::CorruptData(format!("book {}: {}", id, e)))?;
            if embedding.len() as i64 != dim {
                return Err(TaxonomyError::CorruptData(format!(
                    "book {}: stored dim {} but blob holds {} values",
                    id,
                    dim,
                    embedding.len()
                )));
            }
            store.insert(Book {
                id: BookId::new(id),
                title,
                embedding,
                cached_category: cached.map(|c| CategoryId(c as u64)),
            })?;
        }
        Ok(store)
    }
}

struct CategoryRow {
    id: i64,
    level: i64,
    parent_id: Option<i64>,
    centroid: Vec<u8>,
    member_count: i64,
    label: Option<String>,
    label_stale: bool,
    created_revision: i64,
    updated_revision: i64,
    retired_revision: Option<i64>,
    split_from: Option<i64>,
}

impl CategoryRow {
    fn into_node(self) -> Result<CategoryNode> {
        let level = Level::from_i64(self.level).ok_or_else(|| {
            TaxonomyError::CorruptData(format!("category {} has level {}", self.id, self.level))
        })?;
        Ok(CategoryNode {
            id: CategoryId(self.id as u64),
            level,
            parent: self.parent_id.map(|p| CategoryId(p as u64)),
            centroid: bytes_to_embedding(&self.centroid)
                .map_err(|e| TaxonomyError::CorruptData(format!("category {}: {}", self.id, e)))?,
            member_count: self.member_count as usize,
            label: self.label,
            label_stale: self.label_stale,
            created_revision: self.created_revision as u64,
            updated_revision: self.updated_revision as u64,
            status: match self.retired_revision {
                Some(r) => NodeStatus::Retired { revision: r as u64 },
                None => NodeStatus::Active,
            },
            split_from: self.split_from.map(|s| CategoryId(s as u64)),
        })
    }
}

fn read_meta(conn: &Connection, key: &str, default: u64) -> Result<u64> {
    let value: Option<i64> = conn
        .query_row(
            "SELECT value FROM taxonomy_meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.map(|v| v as u64).unwrap_or(default))
}

fn write_meta(tx: &Transaction<'_>, key: &str, value: u64) -> Result<()> {
    tx.execute(
        "INSERT INTO taxonomy_meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value as i64],
    )?;
    Ok(())
}

/// Upsert every node. Structure is overwritten; a label that naming wrote
/// after the run loaded its prior state wins over the run's copy.
fn write_categories(tx: &Transaction<'_>, state: &TaxonomyState) -> Result<()> {
    let mut stmt = tx.prepare(
        "INSERT INTO categories (id, level, parent_id, centroid, member_count, label, label_stale,
                                 created_revision, updated_revision, retired_revision, split_from)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(id) DO UPDATE SET
            level = excluded.level,
            parent_id = excluded.parent_id,
            centroid = excluded.centroid,
            member_count = excluded.member_count,
            label_stale = CASE WHEN categories.label IS excluded.label
                               THEN excluded.label_stale
                               ELSE categories.label_stale END,
            label = COALESCE(categories.label, excluded.label),
            created_revision = excluded.created_revision,
            updated_revision = excluded.updated_revision,
            retired_revision = excluded.retired_revision,
            split_from = excluded.split_from",
    )?;
    for node in state.nodes.values() {
        let retired = match node.status {
            NodeStatus::Retired { revision } => Some(revision as i64),
            NodeStatus::Active => None,
        };
        stmt.execute(params![
            node.id.0 as i64,
            node.level.as_i64(),
            node.parent.map(|p| p.0 as i64),
            embedding_to_bytes(&node.centroid),
            node.member_count as i64,
            node.label,
            node.label_stale,
            node.created_revision as i64,
            node.updated_revision as i64,
            retired,
            node.split_from.map(|s| s.0 as i64),
        ])?;
    }
    Ok(())
}

fn write_memberships(tx: &Transaction<'_>, state: &TaxonomyState) -> Result<()> {
    tx.execute("DELETE FROM memberships", [])?;
    tx.execute("DELETE FROM unclassified", [])?;

    let mut stmt = tx.prepare(
        "INSERT INTO memberships (book_id, category_id, confidence, is_primary, position)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    for (pos, m) in state.memberships.iter().enumerate() {
        stmt.execute(params![
            m.book.as_str(),
            m.category.0 as i64,
            m.confidence as f64,
            m.primary,
            pos as i64,
        ])?;
    }

    let mut stmt = tx.prepare(
        "INSERT INTO unclassified (book_id, reason, best_confidence, position)
         VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (pos, u) in state.unclassified.iter().enumerate() {
        stmt.execute(params![
            u.book.as_str(),
            u.reason.as_str(),
            u.reason.best_confidence().map(|b| b as f64),
            pos as i64,
        ])?;
    }
    Ok(())
}

fn check_embedding(id: &BookId, embedding: &[f32]) -> Result<()> {
    if embedding.is_empty() {
        return Err(TaxonomyError::EmptyEmbedding(id.clone()));
    }
    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(TaxonomyError::NonFiniteEmbedding(id.clone()));
    }
    Ok(())
}

// Embeddings are stored as raw little-endian f32 bytes
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    embedding.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn bytes_to_embedding(bytes: &[u8]) -> std::result::Result<Vec<f32>, String> {
    if bytes.len() % 4 != 0 {
        return Err(format!(
            "embedding blob of {} bytes is not a whole number of f32 values",
            bytes.len()
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

fn write_cached_categories(tx: &Transaction<'_>, state: &TaxonomyState) -> Result<()> {
    tx.execute("UPDATE books SET cached_category = NULL", [])?;
    let mut stmt = tx.prepare("UPDATE books SET cached_category = ?2 WHERE id = ?1")?;
    for m in state.memberships.iter().filter(|m| m.primary) {
        stmt.execute(params![m.book.as_str(), m.category.0 as i64])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TaxonomyEngine;
    use crate::settings::EngineConfig;

    fn at(degrees: f32) -> Vec<f32> {
        let r = degrees.to_radians();
        vec![r.cos(), r.sin(), 0.0]
    }

    fn seeded_store() -> TaxonomyStore {
        let db = TaxonomyStore::in_memory().unwrap();
        let books: Vec<Book> = [("a", 0.0), ("b", 2.0), ("c", 4.0), ("x", 90.0), ("y", 92.0)]
            .iter()
            .map(|(id, deg)| Book::new(*id, at(*deg)).with_title(id.to_uppercase()))
            .collect();
        db.upsert_books(&books).unwrap();
        db
    }

    fn engine() -> TaxonomyEngine {
        TaxonomyEngine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_fresh_store_has_empty_state() {
        let db = TaxonomyStore::in_memory().unwrap();
        let state = db.load_state().unwrap();
        assert_eq!(state, TaxonomyState::empty());
        assert_eq!(db.revision().unwrap(), 0);
    }

    #[test]
    fn test_books_round_trip() {
        let db = seeded_store();
        assert_eq!(db.book_count().unwrap(), 5);
        let store = db.load_vector_store().unwrap();
        assert_eq!(store.books()[0].id.as_str(), "a");
        assert_eq!(store.get(&"x".into()).unwrap().embedding, at(90.0));

        // Re-import without a title keeps the stored one
        db.upsert_book(&Book::new("a", at(1.0))).unwrap();
        let store = db.load_vector_store().unwrap();
        let a = store.get(&"a".into()).unwrap();
        assert_eq!(a.title.as_deref(), Some("A"));
        assert_eq!(a.embedding, at(1.0));

        assert!(db.remove_book(&"c".into()).unwrap());
        assert!(!db.remove_book(&"c".into()).unwrap());
        assert_eq!(db.book_count().unwrap(), 4);
    }

    #[test]
    fn test_dimension_mismatch_on_import() {
        let db = seeded_store();
        let err = db.upsert_book(&Book::new("wide", vec![1.0, 0.0, 0.0, 0.0])).unwrap_err();
        assert!(matches!(err, TaxonomyError::DimensionMismatch { expected: 3, found: 4, .. }));
        assert_eq!(db.book_count().unwrap(), 5);
    }

    #[test]
    fn test_commit_round_trips_exact_state() {
        let db = seeded_store();
        let outcome = engine().run_and_commit(&db).unwrap();
        let loaded = db.load_state().unwrap();
        assert_eq!(loaded, outcome.state);
        assert_eq!(loaded.revision, 1);

        let store = db.load_vector_store().unwrap();
        let a = store.get(&"a".into()).unwrap();
        assert_eq!(a.cached_category, loaded.primary_category(&"a".into()));
        assert!(a.cached_category.is_some());

        let runs = db.recent_runs(5).unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, outcome.report.run_id);
        assert_eq!(runs[0].categories_created, 2);
    }

    #[test]
    fn test_stale_commit_leaves_prior_state_intact() {
        let db = seeded_store();
        let e = engine();
        let first = e.run_and_commit(&db).unwrap();

        // Two runs computed from the same prior state; the second commit loses
        let prior = db.load_state().unwrap();
        let books = db.load_vector_store().unwrap();
        let a = e.run(&books, &prior).unwrap();
        let b = e.run(&books, &prior).unwrap();
        db.commit(&a.state, prior.revision, &a.report).unwrap();
        match db.commit(&b.state, prior.revision, &b.report) {
            Err(TaxonomyError::StaleRevision { expected, found }) => {
                assert_eq!(expected, 1);
                assert_eq!(found, 2);
            }
            other => panic!("expected stale revision, got {:?}", other),
        }
        assert_eq!(db.load_state().unwrap(), a.state);
        assert_eq!(db.recent_runs(10).unwrap().len(), 2);
        assert_ne!(first.report.run_id, b.report.run_id);
    }

    #[test]
    fn test_labels_only_fill_null_or_stale() {
        let db = seeded_store();
        let outcome = engine().run_and_commit(&db).unwrap();
        let ids: Vec<CategoryId> = outcome.state.roots().iter().map(|n| n.id).collect();
        assert_eq!(ids.len(), 2);

        let first: HashMap<CategoryId, String> =
            [(ids[0], "Sea".to_string()), (CategoryId(77), "Nope".to_string())].into_iter().collect();
        let report = db.apply_labels(&first).unwrap();
        assert_eq!(report.applied, vec![ids[0]]);
        assert_eq!(report.rejected, vec![(CategoryId(77), LabelRejection::UnknownCategory)]);

        let again: HashMap<CategoryId, String> = [(ids[0], "Ocean".to_string())].into_iter().collect();
        let report = db.apply_labels(&again).unwrap();
        assert_eq!(report.rejected, vec![(ids[0], LabelRejection::AlreadyLabeled)]);

        let state = db.load_state().unwrap();
        assert_eq!(state.node(ids[0]).unwrap().label.as_deref(), Some("Sea"));
        assert_eq!(state.revision, 1); // labels do not bump the revision
    }

    #[test]
    fn test_label_written_during_run_survives_commit() {
        let db = seeded_store();
        let e = engine();
        e.run_and_commit(&db).unwrap();

        let prior = db.load_state().unwrap();
        let books = db.load_vector_store().unwrap();
        let next = e.run(&books, &prior).unwrap();

        // Naming labels a category while the run is in flight
        let id = prior.roots()[0].id;
        let labels: HashMap<CategoryId, String> = [(id, "Sea".to_string())].into_iter().collect();
        db.apply_labels(&labels).unwrap();

        db.commit(&next.state, prior.revision, &next.report).unwrap();
        let state = db.load_state().unwrap();
        let node = state.node(id).unwrap();
        assert_eq!(node.label.as_deref(), Some("Sea"));
        assert!(!node.label_stale);
    }

    #[test]
    fn test_file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library").join("libris.db");
        let committed = {
            let db = TaxonomyStore::new(&path).unwrap();
            let books: Vec<Book> = [("a", 0.0), ("b", 3.0)]
                .iter()
                .map(|(id, deg)| Book::new(*id, at(*deg)))
                .collect();
            db.upsert_books(&books).unwrap();
            engine().run_and_commit(&db).unwrap().state
        };

        let reopened = TaxonomyStore::new(&path).unwrap();
        assert_eq!(reopened.load_state().unwrap(), committed);
        assert_eq!(reopened.get_path(), path.to_string_lossy());
    }

    #[test]
    fn test_init_migrates_once() {
        let db = TaxonomyStore::in_memory().unwrap();
        db.init().unwrap();
        let columns: i64 = db
            .lock()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('categories') WHERE name = 'split_from'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(columns, 1);
    }

    #[test]
    fn test_truncated_centroid_blob_is_corrupt() {
        let db = seeded_store();
        engine().run_and_commit(&db).unwrap();
        db.lock()
            .unwrap()
            .execute("UPDATE categories SET centroid = X'0000803F0000'", [])
            .unwrap();
        assert!(matches!(db.load_state(), Err(TaxonomyError::CorruptData(_))));
    }

    #[test]
    fn test_mixed_centroid_dimensions_are_corrupt() {
        let db = seeded_store();
        engine().run_and_commit(&db).unwrap();
        db.lock()
            .unwrap()
            .execute(
                "UPDATE categories SET centroid = X'0000803F00000000'
                 WHERE id = (SELECT MIN(id) FROM categories)",
                [],
            )
            .unwrap();
        assert!(matches!(db.load_state(), Err(TaxonomyError::CorruptData(_))));
    }

    #[test]
    fn test_truncated_embedding_blob_is_corrupt() {
        let db = seeded_store();
        db.lock()
            .unwrap()
            .execute("UPDATE books SET embedding = X'0000803F00' WHERE id = 'b'", [])
            .unwrap();
        assert!(matches!(db.load_vector_store(), Err(TaxonomyError::CorruptData(_))));
    }

    #[test]
    fn test_embedding_shorter_than_dim_column_is_corrupt() {
        let db = seeded_store();
        // Whole f32 values, but two of them where the row says three
        db.lock()
            .unwrap()
            .execute("UPDATE books SET embedding = X'0000803F00000000' WHERE id = 'b'", [])
            .unwrap();
        match db.load_vector_store() {
            Err(TaxonomyError::CorruptData(msg)) => assert!(msg.contains("book b")),
            other => panic!("expected corrupt data, got {:?}", other.map(|s| s.len())),
        }
    }

    #[test]
    fn test_conflicting_run_commits_nothing() {
        let db = TaxonomyStore::in_memory().unwrap();
        db.upsert_books(&[Book::new("a", vec![0.0, 0.0, 1.0]), Book::new("b", vec![0.0, 0.0, 1.0])])
            .unwrap();

        // Three committed categories at the same angle from the books' centroid
        let ring = |deg: f32| {
            let r = deg.to_radians();
            let s = 0.19f32.sqrt();
            vec![s * r.cos(), s * r.sin(), 0.9]
        };
        let mut prior = TaxonomyState::empty();
        prior.revision = 1;
        prior.next_category_seq = 10;
        for (id, deg) in [(1u64, 0.0f32), (4, 120.0), (9, 240.0)] {
            prior.nodes.insert(
                CategoryId(id),
                CategoryNode {
                    id: CategoryId(id),
                    level: Level::Category,
                    parent: None,
                    centroid: ring(deg),
                    member_count: 0,
                    label: Some(format!("shelf {}", id)),
                    label_stale: false,
                    created_revision: 1,
                    updated_revision: 1,
                    status: NodeStatus::Active,
                    split_from: None,
                },
            );
        }
        let books = db.load_vector_store().unwrap();
        let seed = engine().run(&books, &TaxonomyState::empty()).unwrap();
        db.commit(&prior, 0, &seed.report).unwrap();
        let before = db.load_state().unwrap();
        assert_eq!(before, prior);

        match engine().run_and_commit(&db) {
            Err(TaxonomyError::StabilityConflict { candidates, .. }) => {
                assert_eq!(candidates, vec![CategoryId(1), CategoryId(4), CategoryId(9)]);
            }
            other => panic!("expected conflict, got {:?}", other.map(|o| o.report.revision)),
        }
        assert_eq!(db.load_state().unwrap(), before);
        assert_eq!(db.revision().unwrap(), 1);
        assert_eq!(db.recent_runs(10).unwrap().len(), 1);
    }
}
