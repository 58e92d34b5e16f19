//! Nearest-neighbour lists for density estimation.
//!
//! Small inputs get an exact all-pairs scan. Above the configured threshold the
//! lists come from an HNSW index (`instant-distance`), which keeps the
//! clustering pass sub-quadratic for large libraries.

use instant_distance::Point as HnswPoint;
use instant_distance::{Builder, HnswMap, Search};
use std::time::Instant;

use crate::settings::ClusterConfig;
use crate::similarity::unit_distance;

/// Embedding wrapper for HNSW
/// Distance is cosine distance; points are unit-normalized before insertion.
#[derive(Clone)]
pub struct UnitPoint(pub Vec<f32>);

impl HnswPoint for UnitPoint {
    fn distance(&self, other: &Self) -> f32 {
        unit_distance(&self.0, &other.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborStrategy {
    Exact,
    Hnsw,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

/// Per-point neighbours within a radius, sorted by (distance, index).
/// A point never lists itself. Edges are symmetric.
#[derive(Debug, Clone)]
pub struct NeighborGraph {
    strategy: NeighborStrategy,
    lists: Vec<Vec<Neighbor>>,
}

impl NeighborGraph {
    /// `points` must be unit-normalized.
    pub fn build(points: &[Vec<f32>], radius: f32, config: &ClusterConfig) -> Self {
        if points.len() > config.ann_threshold {
            Self::approximate(points, radius, config)
        } else {
            Self::exact(points, radius)
        }
    }

    pub fn exact(points: &[Vec<f32>], radius: f32) -> Self {
        let n = points.len();
        let mut lists = vec![Vec::new(); n];
        for i in 0..n {
            for j in (i + 1)..n {
                let distance = unit_distance(&points[i], &points[j]);
                if distance <= radius {
                    lists[i].push(Neighbor { index: j, distance });
                    lists[j].push(Neighbor { index: i, distance });
                }
            }
        }
        for list in &mut lists {
            sort_list(list);
        }
        Self {
            strategy: NeighborStrategy::Exact,
            lists,
        }
    }

    /// HNSW neighbours: the `ann_neighbors` closest per point, cut at `radius`.
    pub fn approximate(points: &[Vec<f32>], radius: f32, config: &ClusterConfig) -> Self {
        let start = Instant::now();
        let n = points.len();
        let k = config.ann_neighbors.max(1);

        let hnsw_points: Vec<UnitPoint> = points.iter().map(|p| UnitPoint(p.clone())).collect();
        let values: Vec<usize> = (0..n).collect();
        let map: HnswMap<UnitPoint, usize> = Builder::default()
            .ef_construction(100)
            .ef_search(k.max(50))
            .seed(config.ann_seed)
            .build(hnsw_points, values);

        let mut lists = vec![Vec::new(); n];
        let mut search = Search::default();
        for (i, point) in points.iter().enumerate() {
            let query = UnitPoint(point.clone());
            // k+1 to account for the self-match
            for item in map.search(&query, &mut search).take(k + 1) {
                let j = *item.value;
                if j == i || item.distance > radius {
                    continue;
                }
                lists[i].push(Neighbor { index: j, distance: item.distance });
            }
        }

        // Symmetrize: an edge found from either side exists for both
        let mut extra: Vec<(usize, Neighbor)> = Vec::new();
        for (i, list) in lists.iter().enumerate() {
            for nb in list {
                if !lists[nb.index].iter().any(|back| back.index == i) {
                    extra.push((nb.index, Neighbor { index: i, distance: nb.distance }));
                }
            }
        }
        for (owner, nb) in extra {
            if !lists[owner].iter().any(|existing| existing.index == nb.index) {
                lists[owner].push(nb);
            }
        }
        for list in &mut lists {
            sort_list(list);
        }

        tracing::debug!(
            target: "cluster",
            points = n,
            neighbors = k,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "built HNSW neighbour graph"
        );
        Self {
            strategy: NeighborStrategy::Hnsw,
            lists,
        }
    }

    pub fn strategy(&self) -> NeighborStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn neighbors(&self, i: usize) -> &[Neighbor] {
        &self.lists[i]
    }

    /// Each undirected edge once, as (lower index, higher index, distance).
    pub fn edges(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
        self.lists.iter().enumerate().flat_map(|(i, list)| {
            list.iter()
                .filter(move |nb| nb.index > i)
                .map(move |nb| (i, nb.index, nb.distance))
        })
    }
}

fn sort_list(list: &mut [Neighbor]) {
    list.sort_by(|a, b| {
        a.distance
            .total_cmp(&b.distance)
            .then_with(|| a.index.cmp(&b.index))
    });
}
