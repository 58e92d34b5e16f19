//! Density-based flat clustering over book embeddings
//!
//! No preset number of clusters. Books in dense regions of the cosine space
//! are linked into components; books with no dense neighbourhood are noise
//! and stay unassigned until a later run.
//!
//! Steps:
//! - Exact-duplicate embeddings collapse into one weighted point
//! - Core distance = distance to the `min_samples`-th nearest book (self first)
//! - Core points whose mutual reachability is within `link_distance - tie_margin`
//!   are merged; connections inside the tie margin are borderline and kept apart
//! - Non-core points attach to their nearest core point within the link distance
//! - Components lighter than `min_cluster_size` books are noise

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use crate::error::{Result, TaxonomyError};
use crate::neighbors::{NeighborGraph, NeighborStrategy};
use crate::settings::ClusterConfig;
use crate::similarity::{normalize, unit_distance, weighted_centroid};
use crate::union_find::UnionFind;
use crate::vector_store::{BookId, VectorStore};

/// Run-local cluster number. Means nothing across runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ClusterId(pub usize);

#[derive(Debug, Clone, Serialize)]
pub struct Cluster {
    pub id: ClusterId,
    /// Sorted.
    pub members: Vec<BookId>,
    /// Unit-normalized mean of the members.
    pub centroid: Vec<f32>,
    /// Mean pairwise cosine distance among members (0 for one book).
    pub compactness: f32,
    /// Mean core distance of members, capped at the link distance.
    pub density: f32,
}

impl Cluster {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Assignment {
    Cluster(ClusterId),
    Noise,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlatClustering {
    /// Ordered by smallest member id.
    pub clusters: Vec<Cluster>,
    /// Sorted.
    pub noise: Vec<BookId>,
    pub assignments: HashMap<BookId, Assignment>,
    /// Core-to-core connections that fell inside the tie margin and were not merged.
    pub borderline_links: usize,
    pub unique_points: usize,
    #[serde(skip)]
    pub strategy: Option<NeighborStrategy>,
}

impl FlatClustering {
    pub fn cluster(&self, id: ClusterId) -> Option<&Cluster> {
        self.clusters.get(id.0)
    }

    pub fn assignment(&self, book: &BookId) -> Option<Assignment> {
        self.assignments.get(book).copied()
    }

    pub fn cluster_of(&self, book: &BookId) -> Option<ClusterId> {
        match self.assignments.get(book) {
            Some(Assignment::Cluster(id)) => Some(*id),
            _ => None,
        }
    }
}

/// Collapsed input: one entry per distinct embedding.
struct Points {
    unit: Vec<Vec<f32>>,
    weights: Vec<usize>,
    books: Vec<Vec<BookId>>,
}

impl Points {
    fn collapse(store: &VectorStore) -> Self {
        let mut by_bits: HashMap<Vec<u32>, usize> = HashMap::new();
        let mut points = Points {
            unit: Vec::new(),
            weights: Vec::new(),
            books: Vec::new(),
        };
        for book in store.iter() {
            // 0.0 and -0.0 are the same embedding
            let key: Vec<u32> = book
                .embedding
                .iter()
                .map(|v| if *v == 0.0 { 0 } else { v.to_bits() })
                .collect();
            match by_bits.get(&key) {
                Some(&idx) => {
                    points.weights[idx] += 1;
                    points.books[idx].push(book.id.clone());
                }
                None => {
                    by_bits.insert(key, points.unit.len());
                    points.unit.push(normalize(&book.embedding));
                    points.weights.push(1);
                    points.books.push(vec![book.id.clone()]);
                }
            }
        }
        points
    }

    fn len(&self) -> usize {
        self.unit.len()
    }
}

pub struct ClusterEngine {
    config: ClusterConfig,
}

impl ClusterEngine {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn cluster(&self, store: &VectorStore) -> Result<FlatClustering> {
        let start = Instant::now();
        if store.len() < self.config.min_books {
            return Err(TaxonomyError::InsufficientData {
                found: store.len(),
                required: self.config.min_books,
            });
        }
        check_dimensions(store)?;

        let points = Points::collapse(store);
        let n = points.len();
        let link = self.config.link_distance;
        let effective = self.config.effective_link();

        let graph = NeighborGraph::build(&points.unit, link, &self.config);
        let core_distance: Vec<f32> = (0..n)
            .map(|i| self.core_distance(i, &points.weights, &graph))
            .collect();
        let is_core: Vec<bool> = core_distance.iter().map(|&c| c <= effective).collect();

        let mut uf = UnionFind::with_weights(&points.weights);
        let mut borderline_links = 0usize;
        for (i, j, d) in graph.edges() {
            if !(is_core[i] && is_core[j]) {
                continue;
            }
            let reach = core_distance[i].max(core_distance[j]).max(d);
            if reach <= effective {
                uf.union(i, j);
            } else if reach <= link {
                borderline_links += 1;
            }
        }

        // Border points join the component of their nearest core neighbour
        let mut anchor: Vec<Option<usize>> = vec![None; n];
        for i in 0..n {
            if is_core[i] {
                anchor[i] = Some(i);
                continue;
            }
            anchor[i] = graph
                .neighbors(i)
                .iter()
                .find(|nb| is_core[nb.index] && nb.distance <= effective)
                .map(|nb| nb.index);
        }

        let mut components: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        let mut noise_points = Vec::new();
        for i in 0..n {
            match anchor[i] {
                Some(a) => components.entry(uf.find(a)).or_default().push(i),
                None => noise_points.push(i),
            }
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (_, members) in components {
            let books: usize = members.iter().map(|&i| points.weights[i]).sum();
            if books < self.config.min_cluster_size {
                noise_points.extend(members);
            } else {
                groups.push(members);
            }
        }

        let mut clusters: Vec<Cluster> = groups
            .iter()
            .map(|members| self.build_cluster(members, &points, &core_distance))
            .collect();
        clusters.sort_by(|a, b| a.members[0].cmp(&b.members[0]));

        let mut assignments = HashMap::with_capacity(store.len());
        for (idx, cluster) in clusters.iter_mut().enumerate() {
            cluster.id = ClusterId(idx);
            for book in &cluster.members {
                assignments.insert(book.clone(), Assignment::Cluster(cluster.id));
            }
        }
        let mut noise: Vec<BookId> = noise_points
            .iter()
            .flat_map(|&i| points.books[i].iter().cloned())
            .collect();
        noise.sort();
        for book in &noise {
            assignments.insert(book.clone(), Assignment::Noise);
        }

        tracing::info!(
            target: "cluster",
            books = store.len(),
            unique = n,
            clusters = clusters.len(),
            noise = noise.len(),
            borderline = borderline_links,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "flat clustering done"
        );
        if borderline_links > 0 {
            tracing::debug!(
                target: "cluster",
                "{} connections within {} of the link distance were left unmerged",
                borderline_links,
                self.config.tie_margin
            );
        }

        Ok(FlatClustering {
            clusters,
            noise,
            assignments,
            borderline_links,
            unique_points: n,
            strategy: Some(graph.strategy()),
        })
    }

    /// Distance to the `min_samples`-th nearest book, the point itself counted
    /// first. Infinite when not reached within the graph radius.
    fn core_distance(&self, i: usize, weights: &[usize], graph: &NeighborGraph) -> f32 {
        let needed = self.config.min_samples;
        let mut seen = weights[i];
        if seen >= needed {
            return 0.0;
        }
        for nb in graph.neighbors(i) {
            seen += weights[nb.index];
            if seen >= needed {
                return nb.distance;
            }
        }
        f32::INFINITY
    }

    fn build_cluster(&self, members: &[usize], points: &Points, core_distance: &[f32]) -> Cluster {
        let parts: Vec<(&[f32], usize)> = members
            .iter()
            .map(|&i| (points.unit[i].as_slice(), points.weights[i]))
            .collect();
        let centroid = weighted_centroid(&parts).unwrap_or_default();
        let total: usize = members.iter().map(|&i| points.weights[i]).sum();

        let compactness = if total < 2 {
            0.0
        } else if members.len() > self.config.ann_threshold {
            // O(k^2) is too slow here; mean distance to the centroid instead
            let sum: f32 = members
                .iter()
                .map(|&i| unit_distance(&points.unit[i], &centroid) * points.weights[i] as f32)
                .sum();
            sum / total as f32
        } else {
            let mut sum = 0.0f64;
            for (a, &i) in members.iter().enumerate() {
                for &j in &members[a + 1..] {
                    let d = unit_distance(&points.unit[i], &points.unit[j]) as f64;
                    sum += d * (points.weights[i] * points.weights[j]) as f64;
                }
            }
            let pairs = (total * (total - 1) / 2) as f64;
            (sum / pairs) as f32
        };

        let link = self.config.link_distance;
        let density = members
            .iter()
            .map(|&i| core_distance[i].min(link) * points.weights[i] as f32)
            .sum::<f32>()
            / total as f32;

        let mut books: Vec<BookId> = members
            .iter()
            .flat_map(|&i| points.books[i].iter().cloned())
            .collect();
        books.sort();

        Cluster {
            id: ClusterId(0),
            members: books,
            centroid,
            compactness,
            density,
        }
    }
}

fn check_dimensions(store: &VectorStore) -> Result<()> {
    let mut books = store.iter();
    let Some(first) = books.next() else {
        return Ok(());
    };
    let expected = first.embedding.len();
    if expected == 0 {
        return Err(TaxonomyError::EmptyEmbedding(first.id.clone()));
    }
    for book in books {
        if book.embedding.len() != expected {
            return Err(TaxonomyError::DimensionMismatch {
                book: book.id.clone(),
                expected,
                found: book.embedding.len(),
            });
        }
    }
    Ok(())
}
