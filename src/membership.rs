//! Confidence-weighted multi-category membership
//!
//! A book may belong to several categories without its record being copied:
//! each membership is a row (book, category, confidence). The strongest match
//! is the primary one. Books without a strong enough match are unclassified,
//! never forced into the nearest category.

use serde::Serialize;

use crate::clustering::{Assignment, FlatClustering};
use crate::hierarchy::DraftHierarchy;
use crate::settings::MembershipConfig;
use crate::similarity::{normalize, unit_distance};
use crate::taxonomy::UnclassifiedReason;
use crate::vector_store::{BookId, VectorStore};

/// Membership in a draft node, before stable ids exist.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DraftMembership {
    pub node: usize,
    pub confidence: f32,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Resolution {
    /// Most confident first; the first one is primary.
    Classified(Vec<DraftMembership>),
    Unclassified(UnclassifiedReason),
}

/// Per-book resolutions in vector store order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MembershipTable {
    pub entries: Vec<(BookId, Resolution)>,
}

impl MembershipTable {
    pub fn classified(&self) -> impl Iterator<Item = (&BookId, &[DraftMembership])> {
        self.entries.iter().filter_map(|(book, r)| match r {
            Resolution::Classified(m) => Some((book, m.as_slice())),
            Resolution::Unclassified(_) => None,
        })
    }

    pub fn unclassified(&self) -> impl Iterator<Item = (&BookId, UnclassifiedReason)> {
        self.entries.iter().filter_map(|(book, r)| match r {
            Resolution::Unclassified(reason) => Some((book, *reason)),
            Resolution::Classified(_) => None,
        })
    }

    pub fn membership_count(&self) -> usize {
        self.classified().map(|(_, m)| m.len()).sum()
    }
}

pub struct MembershipResolver {
    config: MembershipConfig,
}

impl MembershipResolver {
    pub fn new(config: MembershipConfig) -> Self {
        Self { config }
    }

    /// `1 - (d / r)^2` for distances inside the consideration radius.
    pub fn confidence(&self, distance: f32) -> Option<f32> {
        let r = self.config.consideration_radius;
        if distance > r {
            return None;
        }
        let ratio = distance / r;
        Some((1.0 - ratio * ratio).clamp(0.0, 1.0))
    }

    /// Resolve one unit-normalized embedding against leaf centroids given as
    /// (draft node index, unit centroid), in category order.
    pub fn resolve_embedding(&self, embedding: &[f32], targets: &[(usize, &[f32])]) -> Resolution {
        let mut candidates: Vec<DraftMembership> = targets
            .iter()
            .filter_map(|&(node, centroid)| {
                self.confidence(unit_distance(embedding, centroid))
                    .map(|confidence| DraftMembership {
                        node,
                        confidence,
                        primary: false,
                    })
            })
            .collect();
        if candidates.is_empty() {
            return Resolution::Unclassified(UnclassifiedReason::NoCandidate);
        }

        candidates.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.node.cmp(&b.node))
        });
        let best = candidates[0].confidence;
        if best < self.config.min_confidence {
            return Resolution::Unclassified(UnclassifiedReason::LowConfidence { best });
        }

        let secondary_floor = best * self.config.secondary_ratio;
        let mut kept: Vec<DraftMembership> = candidates
            .into_iter()
            .filter(|c| {
                c.confidence >= self.config.min_confidence
                    && (c.confidence >= secondary_floor
                        || best - c.confidence <= self.config.tie_tolerance)
            })
            .take(self.config.max_memberships)
            .collect();
        kept[0].primary = true;
        Resolution::Classified(kept)
    }

    pub fn resolve(
        &self,
        store: &VectorStore,
        flat: &FlatClustering,
        draft: &DraftHierarchy,
    ) -> MembershipTable {
        let leaves = draft.leaves();
        let targets: Vec<(usize, &[f32])> = leaves
            .iter()
            .map(|&i| (i, draft.nodes[i].centroid.as_slice()))
            .collect();

        let mut table = MembershipTable::default();
        for book in store.iter() {
            let resolution = match flat.assignment(&book.id) {
                Some(Assignment::Cluster(_)) => {
                    self.resolve_embedding(&normalize(&book.embedding), &targets)
                }
                Some(Assignment::Noise) | None => Resolution::Unclassified(UnclassifiedReason::Noise),
            };
            table.entries.push((book.id.clone(), resolution));
        }

        let unclassified = table.unclassified().count();
        tracing::info!(
            target: "membership",
            books = table.entries.len(),
            memberships = table.membership_count(),
            unclassified,
            "memberships resolved"
        );
        for (book, reason) in table.unclassified() {
            if let UnclassifiedReason::LowConfidence { best } = reason {
                tracing::debug!(target: "membership", %book, best, "best match below the primary threshold");
            }
        }
        table
    }
}
