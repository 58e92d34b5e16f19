//! Disjoint sets over point indices, for density-connected components.

/// Union-find with union by rank and path compression.
/// Component sizes are weighted: a point may stand for several books.
#[derive(Debug, Clone)]
pub struct UnionFind {
    /// Parent pointers (self if root)
    parent: Vec<usize>,
    /// Rank for union by rank
    rank: Vec<u8>,
    /// Component weights, valid at roots
    size: Vec<usize>,
}

impl UnionFind {
    /// Each point is its own component with the given weight.
    pub fn with_weights(weights: &[usize]) -> Self {
        Self {
            parent: (0..weights.len()).collect(),
            rank: vec![0; weights.len()],
            size: weights.to_vec(),
        }
    }

    pub fn new(n: usize) -> Self {
        Self::with_weights(&vec![1; n])
    }

    pub fn len(&self) -> usize {
        self.parent.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_empty()
    }

    /// Find the root of the component containing `i`, with path compression.
    pub fn find(&mut self, i: usize) -> usize {
        let mut root = i;
        while self.parent[root] != root {
            root = self.parent[root];
        }
        let mut cur = i;
        while self.parent[cur] != root {
            let next = self.parent[cur];
            self.parent[cur] = root;
            cur = next;
        }
        root
    }

    /// Union two components by rank. Returns the new root if they were separate.
    pub fn union(&mut self, a: usize, b: usize) -> Option<usize> {
        let root_a = self.find(a);
        let root_b = self.find(b);
        if root_a == root_b {
            return None; // Already in same component
        }

        let (winner, loser) = match self.rank[root_a].cmp(&self.rank[root_b]) {
            std::cmp::Ordering::Less => (root_b, root_a),
            std::cmp::Ordering::Greater => (root_a, root_b),
            std::cmp::Ordering::Equal => {
                self.rank[root_a] += 1;
                (root_a, root_b)
            }
        };
        self.parent[loser] = winner;
        self.size[winner] += self.size[loser];
        Some(winner)
    }

    pub fn connected(&mut self, a: usize, b: usize) -> bool {
        self.find(a) == self.find(b)
    }

    /// Weight of the component containing `i`.
    pub fn size(&mut self, i: usize) -> usize {
        let root = self.find(i);
        self.size[root]
    }
}
