//! Cross-run category identity
//!
//! Each run produces a fresh draft hierarchy with run-local indices. This
//! module decides which draft node inherits which persisted category id, which
//! ones are new, which persisted categories were split, and which retire.
//!
//! Matching runs per level, categories first, so subcategory parents can be
//! rewritten to stable ids. Every decision is deterministic: when similarity
//! ties, the earliest-created id wins; when a draft node ties with more than
//! two persisted nodes the run fails with a conflict instead of guessing.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Result, TaxonomyError};
use crate::hierarchy::{DraftHierarchy, DraftNode};
use crate::settings::StabilityConfig;
use crate::similarity::{cosine_similarity, running_average};
use crate::taxonomy::{
    CategoryId, CategoryNode, CategorySequence, Level, NodeStatus, TaxonomyState,
};
use crate::vector_store::BookId;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeOutcome {
    Created,
    Reused {
        previous: CategoryId,
        similarity: f32,
        /// Kept the id in a split and gave members to new categories.
        lost_members: bool,
    },
    /// Carved out of `original`, which lives on in another draft node.
    Split { original: CategoryId, similarity: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Retirement {
    pub id: CategoryId,
    pub level: Level,
    /// A draft node close enough to inherit this id went to another category.
    pub merged_into: Option<CategoryId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitRecord {
    pub original: CategoryId,
    pub level: Level,
    pub carved: Vec<CategoryId>,
}

/// Identity decisions for one draft hierarchy.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPlan {
    /// Stable id per draft node index.
    pub assigned: Vec<CategoryId>,
    pub outcomes: Vec<NodeOutcome>,
    pub retirements: Vec<Retirement>,
    pub splits: Vec<SplitRecord>,
    pub next_category_seq: u64,
}

impl MatchPlan {
    pub fn id_of(&self, draft_index: usize) -> CategoryId {
        self.assigned[draft_index]
    }

    pub fn created(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, NodeOutcome::Created))
            .count()
    }

    pub fn reused(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, NodeOutcome::Reused { .. }))
            .count()
    }

    pub fn split_off(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, NodeOutcome::Split { .. }))
            .count()
    }
}

#[derive(Clone, Copy)]
struct Candidate {
    old: usize,
    similarity: f32,
    /// Sort key: tied candidates share the best similarity.
    key: f32,
}

#[derive(Clone, Copy)]
enum Decision {
    Fresh,
    Reuse { old: usize, lost: bool },
    Split { old: usize },
}

/// Working state while a plan is built.
struct PlanBuilder {
    assigned: Vec<Option<CategoryId>>,
    outcomes: Vec<NodeOutcome>,
    retirements: Vec<Retirement>,
    splits: Vec<SplitRecord>,
    seq: CategorySequence,
}

pub struct StabilityMatcher {
    config: StabilityConfig,
}

impl StabilityMatcher {
    pub fn new(config: StabilityConfig) -> Self {
        Self { config }
    }

    pub fn plan(&self, prior: &TaxonomyState, draft: &DraftHierarchy) -> Result<MatchPlan> {
        let prior_primary: HashMap<&BookId, CategoryId> = prior
            .memberships
            .iter()
            .filter(|m| m.primary)
            .map(|m| (&m.book, m.category))
            .collect();

        let mut builder = PlanBuilder {
            assigned: vec![None; draft.len()],
            outcomes: vec![NodeOutcome::Created; draft.len()],
            retirements: Vec::new(),
            splits: Vec::new(),
            seq: CategorySequence::starting_at(prior.next_category_seq),
        };
        for level in Level::ALL {
            self.match_level(level, prior, &prior_primary, draft, &mut builder)?;
        }

        let assigned = builder
            .assigned
            .iter()
            .enumerate()
            .map(|(i, id)| {
                id.ok_or_else(|| {
                    TaxonomyError::InvariantViolation(format!("draft node {} received no id", i))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let plan = MatchPlan {
            assigned,
            outcomes: builder.outcomes,
            retirements: builder.retirements,
            splits: builder.splits,
            next_category_seq: builder.seq.peek(),
        };
        tracing::info!(
            target: "stability",
            created = plan.created(),
            reused = plan.reused(),
            split_off = plan.split_off(),
            retired = plan.retirements.len(),
            "identity matching done"
        );
        Ok(plan)
    }

    fn match_level(
        &self,
        level: Level,
        prior: &TaxonomyState,
        prior_primary: &HashMap<&BookId, CategoryId>,
        draft: &DraftHierarchy,
        out: &mut PlanBuilder,
    ) -> Result<()> {
        let new_nodes: Vec<(usize, &DraftNode)> = draft.at_level(level).collect();
        let old_nodes: Vec<&CategoryNode> = prior.active_at(level).collect();
        let threshold = self.config.same_category_similarity;
        let eps = self.config.tie_epsilon;

        // sims[a][b]: draft node a (position at this level) against persisted node b
        let sims: Vec<Vec<f32>> = new_nodes
            .iter()
            .map(|(_, n)| {
                old_nodes
                    .iter()
                    .map(|o| cosine_similarity(&n.centroid, &o.centroid))
                    .collect()
            })
            .collect();

        let mut candidates: Vec<Vec<Candidate>> = Vec::with_capacity(new_nodes.len());
        for (a, row) in sims.iter().enumerate() {
            let mut list: Vec<Candidate> = row
                .iter()
                .enumerate()
                .filter(|&(_, &s)| s >= threshold)
                .map(|(b, &s)| Candidate {
                    old: b,
                    similarity: s,
                    key: s,
                })
                .collect();
            list.sort_by(|x, y| {
                y.similarity
                    .total_cmp(&x.similarity)
                    .then_with(|| x.old.cmp(&y.old))
            });

            if let Some(best) = list.first().map(|c| c.similarity) {
                let tied = list
                    .iter()
                    .take_while(|c| best - c.similarity <= eps)
                    .count();
                if tied > 2 {
                    let mut ids: Vec<CategoryId> =
                        list[..tied].iter().map(|c| old_nodes[c.old].id).collect();
                    ids.sort();
                    tracing::warn!(
                        target: "stability",
                        %level,
                        new_node = new_nodes[a].0,
                        ties = tied,
                        "ambiguous identity match"
                    );
                    return Err(TaxonomyError::StabilityConflict {
                        level,
                        new_node: new_nodes[a].0,
                        candidates: ids,
                        similarity: best,
                    });
                }
                // two-way tie: earliest id first
                for c in list.iter_mut().take(tied) {
                    c.key = best;
                }
                list.sort_by(|x, y| y.key.total_cmp(&x.key).then_with(|| x.old.cmp(&y.old)));
            }
            candidates.push(list);
        }

        // Greedy one-to-one, highest similarity first
        let mut pairs: Vec<(f32, usize, usize)> = candidates
            .iter()
            .enumerate()
            .flat_map(|(a, list)| list.iter().map(move |c| (c.key, c.old, a)))
            .collect();
        pairs.sort_by(|x, y| {
            y.0.total_cmp(&x.0)
                .then_with(|| x.1.cmp(&y.1))
                .then_with(|| x.2.cmp(&y.2))
        });
        let mut new_match: Vec<Option<usize>> = vec![None; new_nodes.len()];
        let mut old_claim: Vec<Option<usize>> = vec![None; old_nodes.len()];
        for (_, b, a) in pairs {
            if new_match[a].is_none() && old_claim[b].is_none() {
                new_match[a] = Some(b);
                old_claim[b] = Some(a);
            }
        }

        let mut decision: Vec<Decision> = new_match
            .iter()
            .map(|m| match m {
                Some(b) => Decision::Reuse { old: *b, lost: false },
                None => Decision::Fresh,
            })
            .collect();

        // An unmatched draft node with a candidate lost it to another claimant:
        // that persisted node was split.
        let mut contenders: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (a, list) in candidates.iter().enumerate() {
            if new_match[a].is_none() {
                if let Some(best) = list.first() {
                    contenders.entry(best.old).or_default().push(a);
                }
            }
        }
        for (b, mut group) in contenders {
            let Some(claimant) = old_claim[b] else {
                continue;
            };
            group.push(claimant);
            let earliest: HashMap<usize, u64> = group
                .iter()
                .map(|&a| (a, earliest_prior(new_nodes[a].1, level, prior, prior_primary)))
                .collect();
            group.sort_by(|&x, &y| {
                new_nodes[y].1
                    .size()
                    .cmp(&new_nodes[x].1.size())
                    .then_with(|| earliest[&x].cmp(&earliest[&y]))
                    .then_with(|| sims[y][b].total_cmp(&sims[x][b]))
                    .then_with(|| x.cmp(&y))
            });
            decision[group[0]] = Decision::Reuse { old: b, lost: true };
            for &loser in &group[1..] {
                decision[loser] = Decision::Split { old: b };
            }
        }

        let mut carved: BTreeMap<CategoryId, Vec<CategoryId>> = BTreeMap::new();
        for (a, (draft_idx, _)) in new_nodes.iter().enumerate() {
            let (id, outcome) = match decision[a] {
                Decision::Reuse { old, lost } => (
                    old_nodes[old].id,
                    NodeOutcome::Reused {
                        previous: old_nodes[old].id,
                        similarity: sims[a][old],
                        lost_members: lost,
                    },
                ),
                Decision::Split { old } => {
                    let id = out.seq.next_id();
                    carved.entry(old_nodes[old].id).or_default().push(id);
                    (
                        id,
                        NodeOutcome::Split {
                            original: old_nodes[old].id,
                            similarity: sims[a][old],
                        },
                    )
                }
                Decision::Fresh => (out.seq.next_id(), NodeOutcome::Created),
            };
            out.assigned[*draft_idx] = Some(id);
            out.outcomes[*draft_idx] = outcome;
        }
        for (original, ids) in carved {
            tracing::debug!(target: "stability", %original, pieces = ids.len() + 1, "category split");
            out.splits.push(SplitRecord {
                original,
                level,
                carved: ids,
            });
        }

        let kept: HashSet<usize> = decision
            .iter()
            .filter_map(|d| match d {
                Decision::Reuse { old, .. } => Some(*old),
                _ => None,
            })
            .collect();
        for (b, old) in old_nodes.iter().enumerate() {
            if kept.contains(&b) {
                continue;
            }
            let merged_into = (0..new_nodes.len())
                .filter(|&a| sims[a][b] >= threshold)
                .max_by(|&x, &y| sims[x][b].total_cmp(&sims[y][b]).then_with(|| y.cmp(&x)))
                .and_then(|a| out.assigned[new_nodes[a].0]);
            tracing::debug!(target: "stability", id = %old.id, ?merged_into, "category retired");
            out.retirements.push(Retirement {
                id: old.id,
                level,
                merged_into,
            });
        }
        Ok(())
    }

    /// Category nodes of the next state: the matched draft plus every
    /// persisted node, retired ones as tombstones.
    pub fn build_nodes(
        &self,
        plan: &MatchPlan,
        prior: &TaxonomyState,
        draft: &DraftHierarchy,
        revision: u64,
    ) -> BTreeMap<CategoryId, CategoryNode> {
        let mut nodes: BTreeMap<CategoryId, CategoryNode> = prior
            .nodes
            .iter()
            .filter(|(_, n)| !n.is_active())
            .map(|(id, n)| (*id, n.clone()))
            .collect();

        for retirement in &plan.retirements {
            if let Some(old) = prior.node(retirement.id) {
                let mut tombstone = old.clone();
                tombstone.status = NodeStatus::Retired { revision };
                tombstone.updated_revision = revision;
                tombstone.member_count = 0;
                nodes.insert(tombstone.id, tombstone);
            }
        }

        for (i, dn) in draft.nodes.iter().enumerate() {
            let id = plan.assigned[i];
            let parent = dn.parent.map(|p| plan.assigned[p]);
            let fresh = CategoryNode {
                id,
                level: dn.level,
                parent,
                centroid: dn.centroid.clone(),
                member_count: dn.size(),
                label: None,
                label_stale: false,
                created_revision: revision,
                updated_revision: revision,
                status: NodeStatus::Active,
                split_from: None,
            };
            let node = match plan.outcomes[i] {
                NodeOutcome::Created => fresh,
                NodeOutcome::Split { original, .. } => CategoryNode {
                    split_from: Some(original),
                    ..fresh
                },
                NodeOutcome::Reused {
                    previous,
                    similarity,
                    lost_members,
                } => match prior.node(previous) {
                    Some(old) => CategoryNode {
                        centroid: running_average(
                            &old.centroid,
                            old.member_count,
                            &dn.centroid,
                            dn.size(),
                        ),
                        label: old.label.clone(),
                        label_stale: old.label_stale
                            || lost_members
                            || similarity < self.config.relabel_similarity,
                        created_revision: old.created_revision,
                        split_from: old.split_from,
                        ..fresh
                    },
                    None => fresh,
                },
            };
            nodes.insert(id, node);
        }
        nodes
    }
}

/// Smallest persisted category id (at `level`) among the primary
/// categories the node's books had before this run.
fn earliest_prior(
    node: &DraftNode,
    level: Level,
    prior: &TaxonomyState,
    prior_primary: &HashMap<&BookId, CategoryId>,
) -> u64 {
    node.books
        .iter()
        .filter_map(|b| prior_primary.get(b))
        .filter_map(|&c| prior.ancestor_at(c, level))
        .map(|c| c.0)
        .min()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::Membership;

    fn at(degrees: f32) -> Vec<f32> {
        let r = degrees.to_radians();
        vec![r.cos(), r.sin(), 0.0]
    }

    fn draft_node(level: Level, parent: Option<usize>, centroid: Vec<f32>, books: &[&str]) -> DraftNode {
        DraftNode {
            level,
            parent,
            centroid,
            books: books.iter().map(|b| BookId::from(*b)).collect(),
            clusters: vec![],
        }
    }

    fn matcher() -> StabilityMatcher {
        StabilityMatcher::new(StabilityConfig::default())
    }

    /// Run the matcher and turn the result into the next state.
    fn commit(prior: &TaxonomyState, draft: &DraftHierarchy) -> (MatchPlan, TaxonomyState) {
        let m = matcher();
        let plan = m.plan(prior, draft).unwrap();
        let revision = prior.revision + 1;
        let state = TaxonomyState {
            revision,
            next_category_seq: plan.next_category_seq,
            nodes: m.build_nodes(&plan, prior, draft, revision),
            memberships: vec![],
            unclassified: vec![],
        };
        (plan, state)
    }

    fn prior_with(nodes: &[(u64, Vec<f32>, usize)]) -> TaxonomyState {
        let mut state = TaxonomyState::empty();
        state.revision = 1;
        for (id, centroid, members) in nodes {
            state.nodes.insert(
                CategoryId(*id),
                CategoryNode {
                    id: CategoryId(*id),
                    level: Level::Category,
                    parent: None,
                    centroid: centroid.clone(),
                    member_count: *members,
                    label: Some(format!("label {}", id)),
                    label_stale: false,
                    created_revision: 1,
                    updated_revision: 1,
                    status: NodeStatus::Active,
                    split_from: None,
                },
            );
            state.next_category_seq = state.next_category_seq.max(id + 1);
        }
        state
    }

    #[test]
    fn test_first_run_allocates_in_draft_order() {
        let draft = DraftHierarchy {
            nodes: vec![
                draft_node(Level::Category, None, at(0.0), &["a", "b"]),
                draft_node(Level::Category, None, at(90.0), &["c"]),
                draft_node(Level::Subcategory, Some(0), at(-5.0), &["a"]),
                draft_node(Level::Subcategory, Some(0), at(5.0), &["b"]),
            ],
        };
        let (plan, state) = commit(&TaxonomyState::empty(), &draft);
        assert_eq!(plan.assigned, vec![CategoryId(1), CategoryId(2), CategoryId(3), CategoryId(4)]);
        assert_eq!(plan.created(), 4);
        assert_eq!(plan.next_category_seq, 5);
        assert_eq!(state.node(CategoryId(4)).unwrap().parent, Some(CategoryId(1)));
        state.validate().unwrap();
    }

    #[test]
    fn test_unchanged_draft_keeps_every_id() {
        let draft = DraftHierarchy {
            nodes: vec![
                draft_node(Level::Category, None, at(0.0), &["a", "b"]),
                draft_node(Level::Category, None, at(90.0), &["c"]),
                draft_node(Level::Subcategory, Some(0), at(-5.0), &["a"]),
                draft_node(Level::Subcategory, Some(0), at(5.0), &["b"]),
            ],
        };
        let (first, state) = commit(&TaxonomyState::empty(), &draft);
        let (second, next) = commit(&state, &draft);

        assert_eq!(first.assigned, second.assigned);
        assert_eq!(second.reused(), 4);
        assert!(second.retirements.is_empty());
        assert_eq!(next.next_category_seq, state.next_category_seq);
        assert!(next.nodes.values().all(|n| !n.label_stale));
    }

    #[test]
    fn test_three_way_tie_is_a_conflict() {
        // Three persisted centroids at the same angle from the draft centroid
        let ring = |deg: f32| {
            let r = deg.to_radians();
            let s = 0.19f32.sqrt();
            vec![s * r.cos(), s * r.sin(), 0.9]
        };
        let prior = prior_with(&[(1, ring(0.0), 3), (4, ring(120.0), 3), (9, ring(240.0), 3)]);
        let draft = DraftHierarchy {
            nodes: vec![draft_node(Level::Category, None, vec![0.0, 0.0, 1.0], &["a"])],
        };
        match matcher().plan(&prior, &draft) {
            Err(TaxonomyError::StabilityConflict { level, candidates, .. }) => {
                assert_eq!(level, Level::Category);
                assert_eq!(candidates, vec![CategoryId(1), CategoryId(4), CategoryId(9)]);
            }
            other => panic!("expected conflict, got {:?}", other.map(|p| p.assigned)),
        }
    }

    #[test]
    fn test_two_way_tie_goes_to_earliest_id() {
        let prior = prior_with(&[(5, at(10.0), 3), (3, at(-10.0), 3)]);
        let draft = DraftHierarchy {
            nodes: vec![draft_node(Level::Category, None, at(0.0), &["a"])],
        };
        let plan = matcher().plan(&prior, &draft).unwrap();
        assert_eq!(plan.assigned, vec![CategoryId(3)]);
        assert_eq!(plan.retirements.len(), 1);
        assert_eq!(plan.retirements[0].id, CategoryId(5));
        assert_eq!(plan.retirements[0].merged_into, Some(CategoryId(3)));
    }

    #[test]
    fn test_split_keeps_id_on_larger_part() {
        let prior = prior_with(&[(1, at(0.0), 8)]);
        let draft = DraftHierarchy {
            nodes: vec![
                draft_node(Level::Category, None, at(-10.0), &["a", "b", "c"]),
                draft_node(Level::Category, None, at(10.0), &["d", "e", "f", "g", "h"]),
            ],
        };
        let (plan, state) = commit(&prior, &draft);

        assert_eq!(plan.id_of(1), CategoryId(1));
        assert_eq!(plan.id_of(0), CategoryId(2));
        assert_eq!(
            plan.splits,
            vec![SplitRecord {
                original: CategoryId(1),
                level: Level::Category,
                carved: vec![CategoryId(2)],
            }]
        );

        let kept = state.node(CategoryId(1)).unwrap();
        assert_eq!(kept.label.as_deref(), Some("label 1"));
        assert!(kept.label_stale);
        let carved = state.node(CategoryId(2)).unwrap();
        assert_eq!(carved.split_from, Some(CategoryId(1)));
        assert!(carved.label.is_none());
        assert!(plan.retirements.is_empty());
    }

    #[test]
    fn test_split_tie_prefers_members_from_earliest_category() {
        let mut prior = prior_with(&[(1, at(0.0), 2), (2, at(90.0), 2)]);
        prior.memberships = vec![
            Membership { book: "old-1".into(), category: CategoryId(1), confidence: 0.9, primary: true },
            Membership { book: "old-2".into(), category: CategoryId(2), confidence: 0.9, primary: true },
        ];
        // Same size and same similarity to cat-1; the greedy claimant (index 0)
        // holds books that used to be in cat-2
        let draft = DraftHierarchy {
            nodes: vec![
                draft_node(Level::Category, None, at(5.0), &["old-2", "x"]),
                draft_node(Level::Category, None, at(-5.0), &["old-1", "y"]),
            ],
        };
        let plan = matcher().plan(&prior, &draft).unwrap();
        assert_eq!(plan.id_of(1), CategoryId(1));
        assert_eq!(plan.id_of(0), CategoryId(3));
        assert!(matches!(
            plan.outcomes[0],
            NodeOutcome::Split { original: CategoryId(1), .. }
        ));
        assert_eq!(plan.retirements.len(), 1);
        assert_eq!(plan.retirements[0].id, CategoryId(2));
        assert_eq!(plan.retirements[0].merged_into, None);
    }

    #[test]
    fn test_far_new_node_is_created_without_retirement() {
        let prior = prior_with(&[(1, at(0.0), 4)]);
        let draft = DraftHierarchy {
            nodes: vec![
                draft_node(Level::Category, None, at(1.0), &["a", "b", "c", "d"]),
                draft_node(Level::Category, None, at(120.0), &["far"]),
            ],
        };
        let (plan, state) = commit(&prior, &draft);
        assert_eq!(plan.assigned, vec![CategoryId(1), CategoryId(2)]);
        assert_eq!(plan.created(), 1);
        assert!(plan.retirements.is_empty());

        // cos(1 deg) is above the relabel threshold, so the label stays current
        let kept = state.node(CategoryId(1)).unwrap();
        assert!(!kept.label_stale);
        assert!(cosine_similarity(&kept.centroid, &at(0.5)) > 0.9999);
    }

    #[test]
    fn test_retired_id_is_never_reassigned() {
        let prior = prior_with(&[(1, at(0.0), 2), (2, at(90.0), 2)]);
        let only_first = DraftHierarchy {
            nodes: vec![draft_node(Level::Category, None, at(0.0), &["a", "b"])],
        };
        let (plan, state) = commit(&prior, &only_first);
        assert_eq!(plan.retirements[0].id, CategoryId(2));
        assert!(!state.node(CategoryId(2)).unwrap().is_active());

        // The old topic comes back: it gets a new id, the tombstone stays
        let both = DraftHierarchy {
            nodes: vec![
                draft_node(Level::Category, None, at(0.0), &["a", "b"]),
                draft_node(Level::Category, None, at(90.0), &["c", "d"]),
            ],
        };
        let (plan, next) = commit(&state, &both);
        assert_eq!(plan.assigned, vec![CategoryId(1), CategoryId(3)]);
        assert!(!next.node(CategoryId(2)).unwrap().is_active());
        next.validate().unwrap();
    }

    #[test]
    fn test_subcategory_parent_follows_stable_category() {
        let draft = DraftHierarchy {
            nodes: vec![
                draft_node(Level::Category, None, at(90.0), &["x"]),
                draft_node(Level::Category, None, at(0.0), &["a", "b"]),
                draft_node(Level::Subcategory, Some(1), at(-5.0), &["a"]),
                draft_node(Level::Subcategory, Some(1), at(5.0), &["b"]),
            ],
        };
        let (_, state) = commit(&TaxonomyState::empty(), &draft);

        // Same topics, the draft lists the categories in the other order
        let reordered = DraftHierarchy {
            nodes: vec![
                draft_node(Level::Category, None, at(0.0), &["a", "b"]),
                draft_node(Level::Category, None, at(90.0), &["x"]),
                draft_node(Level::Subcategory, Some(0), at(-5.0), &["a"]),
                draft_node(Level::Subcategory, Some(0), at(5.0), &["b"]),
            ],
        };
        let (plan, next) = commit(&state, &reordered);
        assert_eq!(plan.assigned, vec![CategoryId(2), CategoryId(1), CategoryId(3), CategoryId(4)]);
        assert_eq!(next.node(CategoryId(3)).unwrap().parent, Some(CategoryId(2)));
        next.validate().unwrap();
    }
}
