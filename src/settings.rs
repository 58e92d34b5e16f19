//! Engine settings storage
//!
//! Thresholds and logging levels live in a JSON file, by default in the
//! platform config directory. Missing fields fall back to their defaults, so a
//! partial file only overrides what it names.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Result, TaxonomyError};

/// Density clustering parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Below this many books clustering is refused.
    #[serde(default = "default_min_books")]
    pub min_books: usize,
    /// Books (self included) that must lie within the linking distance for a
    /// book to count as a dense core point.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Components with fewer books than this are noise.
    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: usize,
    /// Cosine distance at which two core books are density-connected.
    #[serde(default = "default_link_distance")]
    pub link_distance: f32,
    /// Connections this close to `link_distance` are borderline and stay separate.
    #[serde(default = "default_tie_margin")]
    pub tie_margin: f32,
    /// Unique embeddings above which neighbour lists come from an HNSW index.
    #[serde(default = "default_ann_threshold")]
    pub ann_threshold: usize,
    /// Neighbours fetched per point from the HNSW index.
    #[serde(default = "default_ann_neighbors")]
    pub ann_neighbors: usize,
    #[serde(default = "default_ann_seed")]
    pub ann_seed: u64,
}

fn default_min_books() -> usize {
    2
}

fn default_min_samples() -> usize {
    1
}

fn default_min_cluster_size() -> usize {
    1 // a personal library may hold a single book on a topic
}

fn default_link_distance() -> f32 {
    0.25
}

fn default_tie_margin() -> f32 {
    0.01
}

fn default_ann_threshold() -> usize {
    2000
}

fn default_ann_neighbors() -> usize {
    32
}

fn default_ann_seed() -> u64 {
    0x6c69_6272_6973
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            min_books: default_min_books(),
            min_samples: default_min_samples(),
            min_cluster_size: default_min_cluster_size(),
            link_distance: default_link_distance(),
            tie_margin: default_tie_margin(),
            ann_threshold: default_ann_threshold(),
            ann_neighbors: default_ann_neighbors(),
            ann_seed: default_ann_seed(),
        }
    }
}

impl ClusterConfig {
    /// Distance a connection must not exceed to be merged.
    pub fn effective_link(&self) -> f32 {
        self.link_distance - self.tie_margin
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HierarchyConfig {
    /// Mean centroid cosine similarity above which flat clusters share a category.
    pub category_similarity: f32,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            category_similarity: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembershipConfig {
    /// Centroids farther than this cosine distance are not considered.
    pub consideration_radius: f32,
    /// A book's best confidence must reach this, otherwise it is unclassified.
    pub min_confidence: f32,
    /// Additional memberships need at least `best * secondary_ratio`.
    pub secondary_ratio: f32,
    pub max_memberships: usize,
    /// Confidences closer than this are treated as equal.
    pub tie_tolerance: f32,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            consideration_radius: 0.4,
            min_confidence: 0.3,
            secondary_ratio: 0.8,
            max_memberships: 4,
            tie_tolerance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilityConfig {
    /// Centroid similarity at which a new node inherits a persisted identity.
    pub same_category_similarity: f32,
    /// Reused nodes whose centroid moved below this similarity get a stale label.
    pub relabel_similarity: f32,
    /// Similarities closer than this count as identical when detecting conflicts.
    pub tie_epsilon: f32,
}

impl Default for StabilityConfig {
    fn default() -> Self {
        Self {
            same_category_similarity: 0.8,
            relabel_similarity: 0.95,
            tie_epsilon: 1e-6,
        }
    }
}

/// Everything a run needs.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub hierarchy: HierarchyConfig,
    #[serde(default)]
    pub membership: MembershipConfig,
    #[serde(default)]
    pub stability: StabilityConfig,
}

impl EngineConfig {
    /// Fails fast with a message naming the offending field.
    pub fn validate(&self) -> Result<()> {
        let c = &self.cluster;
        if c.min_books < 1 {
            return Err(TaxonomyError::invalid_config("cluster.min_books must be >= 1"));
        }
        if c.min_samples < 1 {
            return Err(TaxonomyError::invalid_config(format!(
                "cluster.min_samples must be >= 1, got {}",
                c.min_samples
            )));
        }
        if c.min_cluster_size < 1 {
            return Err(TaxonomyError::invalid_config("cluster.min_cluster_size must be >= 1"));
        }
        if !(c.link_distance > 0.0 && c.link_distance < 2.0) {
            return Err(TaxonomyError::invalid_config(format!(
                "cluster.link_distance must be in (0, 2), got {}",
                c.link_distance
            )));
        }
        if !(c.tie_margin >= 0.0 && c.tie_margin < c.link_distance) {
            return Err(TaxonomyError::invalid_config(format!(
                "cluster.tie_margin ({}) must be in [0, link_distance ({}))",
                c.tie_margin, c.link_distance
            )));
        }
        if c.ann_neighbors < c.min_samples {
            return Err(TaxonomyError::invalid_config(format!(
                "cluster.ann_neighbors ({}) must be >= cluster.min_samples ({})",
                c.ann_neighbors, c.min_samples
            )));
        }

        let category_distance = 1.0 - self.hierarchy.category_similarity;
        if !(self.hierarchy.category_similarity > -1.0 && self.hierarchy.category_similarity < 1.0) {
            return Err(TaxonomyError::invalid_config(
                "hierarchy.category_similarity must be in (-1, 1)",
            ));
        }
        if category_distance <= c.link_distance {
            return Err(TaxonomyError::invalid_config(format!(
                "hierarchy.category_similarity ({}) must be coarser than the clustering threshold: 1 - category_similarity must exceed cluster.link_distance ({})",
                self.hierarchy.category_similarity, c.link_distance
            )));
        }

        let m = &self.membership;
        if !(m.consideration_radius > 0.0 && m.consideration_radius <= 2.0) {
            return Err(TaxonomyError::invalid_config(
                "membership.consideration_radius must be in (0, 2]",
            ));
        }
        if !(0.0..=1.0).contains(&m.min_confidence) {
            return Err(TaxonomyError::invalid_config("membership.min_confidence must be in [0, 1]"));
        }
        if !(m.secondary_ratio > 0.0 && m.secondary_ratio <= 1.0) {
            return Err(TaxonomyError::invalid_config("membership.secondary_ratio must be in (0, 1]"));
        }
        if m.max_memberships < 1 {
            return Err(TaxonomyError::invalid_config("membership.max_memberships must be >= 1"));
        }
        if m.tie_tolerance < 0.0 {
            return Err(TaxonomyError::invalid_config("membership.tie_tolerance must be >= 0"));
        }

        let s = &self.stability;
        if !(s.same_category_similarity > 0.0 && s.same_category_similarity <= 1.0) {
            return Err(TaxonomyError::invalid_config(
                "stability.same_category_similarity must be in (0, 1]",
            ));
        }
        if !(s.relabel_similarity > 0.0 && s.relabel_similarity <= 1.0) {
            return Err(TaxonomyError::invalid_config("stability.relabel_similarity must be in (0, 1]"));
        }
        if s.tie_epsilon < 0.0 {
            return Err(TaxonomyError::invalid_config("stability.tie_epsilon must be >= 0"));
        }
        Ok(())
    }
}

/// Logging levels: a default plus per-module overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub default: String,
    #[serde(default)]
    pub modules: BTreeMap<String, String>,
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            default: default_log_level(),
            modules: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Overrides the default database location.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from disk or create default
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.engine.validate()?;
        Ok(settings)
    }

    /// Save settings to disk
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| data_dir().join("libris.db"))
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("libris"))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("libris"))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("settings.json")
}
