//! Two-level hierarchy over the flat clusters
//!
//! Level 0 (categories) comes from average-linkage agglomeration of the flat
//! cluster centroids, coarser than the clustering threshold. Level 1
//! (subcategories) is the flat clusters themselves, but only inside a category
//! that holds more than one of them. A category made of a single cluster has
//! its books directly.
//!
//! The result is a draft: run-local indices, no stable ids yet. Identity is
//! assigned later by the stability matcher.

use serde::Serialize;

use crate::clustering::{ClusterId, FlatClustering};
use crate::settings::HierarchyConfig;
use crate::similarity::{cosine_similarity, weighted_centroid};
use crate::taxonomy::Level;
use crate::vector_store::BookId;

#[derive(Debug, Clone, Serialize)]
pub struct DraftNode {
    pub level: Level,
    /// Index of the level-0 draft node.
    pub parent: Option<usize>,
    pub centroid: Vec<f32>,
    /// Sorted books of all contributing clusters.
    pub books: Vec<BookId>,
    pub clusters: Vec<ClusterId>,
}

impl DraftNode {
    pub fn size(&self) -> usize {
        self.books.len()
    }
}

/// All level-0 nodes first, then all level-1 nodes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DraftHierarchy {
    pub nodes: Vec<DraftNode>,
}

impl DraftHierarchy {
    pub fn at_level(&self, level: Level) -> impl Iterator<Item = (usize, &DraftNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.level == level)
    }

    pub fn children(&self, parent: usize) -> impl Iterator<Item = (usize, &DraftNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(_, n)| n.parent == Some(parent))
    }

    /// Nodes books attach to: subcategories, plus categories without any.
    pub fn leaves(&self) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.children(i).next().is_none())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HierarchyReport {
    pub categories: usize,
    pub subcategories: usize,
    /// The whole corpus forms one cluster. Not an error.
    pub single_category: bool,
}

pub struct HierarchyBuilder {
    config: HierarchyConfig,
}

impl HierarchyBuilder {
    pub fn new(config: HierarchyConfig) -> Self {
        Self { config }
    }

    pub fn build(&self, flat: &FlatClustering) -> (DraftHierarchy, HierarchyReport) {
        let centroids: Vec<&[f32]> = flat.clusters.iter().map(|c| c.centroid.as_slice()).collect();
        let groups = agglomerate(&centroids, self.config.category_similarity);

        let mut draft = DraftHierarchy::default();
        let mut child_specs: Vec<(usize, ClusterId)> = Vec::new();

        for group in &groups {
            let parts: Vec<(&[f32], usize)> = group
                .iter()
                .map(|&c| (flat.clusters[c].centroid.as_slice(), flat.clusters[c].len()))
                .collect();
            let centroid = weighted_centroid(&parts).unwrap_or_default();
            let mut books: Vec<BookId> = group
                .iter()
                .flat_map(|&c| flat.clusters[c].members.iter().cloned())
                .collect();
            books.sort();

            let parent = draft.nodes.len();
            draft.nodes.push(DraftNode {
                level: Level::Category,
                parent: None,
                centroid,
                books,
                clusters: group.iter().map(|&c| flat.clusters[c].id).collect(),
            });
            if group.len() > 1 {
                child_specs.extend(group.iter().map(|&c| (parent, flat.clusters[c].id)));
            }
        }

        for (parent, cluster_id) in child_specs {
            let cluster = &flat.clusters[cluster_id.0];
            draft.nodes.push(DraftNode {
                level: Level::Subcategory,
                parent: Some(parent),
                centroid: cluster.centroid.clone(),
                books: cluster.members.clone(),
                clusters: vec![cluster_id],
            });
        }

        let report = HierarchyReport {
            categories: groups.len(),
            subcategories: draft.at_level(Level::Subcategory).count(),
            single_category: flat.clusters.len() == 1,
        };
        if report.single_category {
            tracing::info!(target: "hierarchy", "the whole corpus forms a single category");
        }
        tracing::info!(
            target: "hierarchy",
            clusters = flat.clusters.len(),
            categories = report.categories,
            subcategories = report.subcategories,
            "hierarchy drafted"
        );
        (draft, report)
    }
}

/// Agglomerative clustering using cosine similarity on centroids
/// Uses average linkage (UPGMA): groups merge while their mean pairwise
/// similarity stays above `threshold`. Returns groups of input indices, each
/// sorted, ordered by their smallest index.
pub fn agglomerate(centroids: &[&[f32]], threshold: f32) -> Vec<Vec<usize>> {
    let n = centroids.len();
    if n == 0 {
        return vec![];
    }

    // Group similarity matrix, updated in place on merge
    let mut sim = vec![vec![0.0f32; n]; n];
    for i in 0..n {
        sim[i][i] = 1.0;
        for j in (i + 1)..n {
            let s = cosine_similarity(centroids[i], centroids[j]);
            sim[i][j] = s;
            sim[j][i] = s;
        }
    }

    let mut groups: Vec<Option<Vec<usize>>> = (0..n).map(|i| Some(vec![i])).collect();

    loop {
        // Find best merge (highest average linkage above threshold).
        // Ties keep the first pair in index order.
        let mut best: Option<(usize, usize, f32)> = None;
        for i in 0..n {
            if groups[i].is_none() {
                continue;
            }
            for j in (i + 1)..n {
                if groups[j].is_none() {
                    continue;
                }
                let s = sim[i][j];
                if s > threshold && best.map_or(true, |(_, _, b)| s > b) {
                    best = Some((i, j, s));
                }
            }
        }

        let Some((a, b, _)) = best else { break };
        let (Some(ga), Some(gb)) = (groups[a].take(), groups[b].take()) else {
            break;
        };
        let (wa, wb) = (ga.len() as f32, gb.len() as f32);
        for k in 0..n {
            if k == a || k == b || groups[k].is_none() {
                continue;
            }
            let s = (wa * sim[a][k] + wb * sim[b][k]) / (wa + wb);
            sim[a][k] = s;
            sim[k][a] = s;
        }

        let mut merged = ga;
        merged.extend(gb);
        merged.sort_unstable();
        groups[a] = Some(merged);
    }

    // Slot a keeps the smaller index, so slot order is smallest-member order
    groups.into_iter().flatten().collect()
}
