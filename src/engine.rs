//! One taxonomy run: vector store in, next taxonomy state out.
//!
//! VectorStore → ClusterEngine → HierarchyBuilder → MembershipResolver →
//! StabilityMatcher → TaxonomyState. A single pass over the full vector set.
//! Nothing is written until the store commits the finished state, so a failed
//! run leaves the prior state authoritative.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use uuid::Uuid;

use crate::clustering::ClusterEngine;
use crate::db::TaxonomyStore;
use crate::error::Result;
use crate::hierarchy::HierarchyBuilder;
use crate::membership::MembershipResolver;
use crate::settings::EngineConfig;
use crate::stability::{MatchPlan, Retirement, SplitRecord, StabilityMatcher};
use crate::taxonomy::{Membership, TaxonomyState, Unclassified};
use crate::vector_store::VectorStore;

/// What a run did, for the run log and diagnostics.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub revision: u64,
    pub books: usize,
    pub unique_embeddings: usize,
    pub clusters: usize,
    pub noise: usize,
    pub borderline_links: usize,
    pub categories: usize,
    pub subcategories: usize,
    pub single_category: bool,
    /// Fresh ids, split-off parts included.
    pub categories_created: usize,
    pub categories_reused: usize,
    pub categories_retired: usize,
    pub splits: usize,
    pub memberships: usize,
    pub unclassified: usize,
    pub retirements: Vec<Retirement>,
    pub split_records: Vec<SplitRecord>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub state: TaxonomyState,
    pub report: RunReport,
    pub plan: MatchPlan,
}

pub struct TaxonomyEngine {
    config: EngineConfig,
    clusters: ClusterEngine,
    hierarchy: HierarchyBuilder,
    membership: MembershipResolver,
    stability: StabilityMatcher,
}

impl TaxonomyEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            clusters: ClusterEngine::new(config.cluster.clone()),
            hierarchy: HierarchyBuilder::new(config.hierarchy.clone()),
            membership: MembershipResolver::new(config.membership.clone()),
            stability: StabilityMatcher::new(config.stability.clone()),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compute the state that should replace `prior`. Pure: neither input changes.
    pub fn run(&self, store: &VectorStore, prior: &TaxonomyState) -> Result<RunOutcome> {
        let start = Instant::now();
        let started_at = Utc::now();
        let run_id = Uuid::new_v4().to_string();
        tracing::info!(
            target: "engine",
            %run_id,
            books = store.len(),
            prior_revision = prior.revision,
            "run started"
        );

        let flat = self.clusters.cluster(store)?;
        let (draft, hierarchy) = self.hierarchy.build(&flat);
        let table = self.membership.resolve(store, &flat, &draft);
        let plan = self.stability.plan(prior, &draft)?;

        let revision = prior.revision + 1;
        let nodes = self.stability.build_nodes(&plan, prior, &draft, revision);

        let mut memberships = Vec::with_capacity(table.membership_count());
        for (book, draft_memberships) in table.classified() {
            for m in draft_memberships {
                memberships.push(Membership {
                    book: book.clone(),
                    category: plan.id_of(m.node),
                    confidence: m.confidence,
                    primary: m.primary,
                });
            }
        }
        let unclassified: Vec<Unclassified> = table
            .unclassified()
            .map(|(book, reason)| Unclassified { book: book.clone(), reason })
            .collect();

        let mut state = TaxonomyState {
            revision,
            next_category_seq: plan.next_category_seq,
            nodes,
            memberships,
            unclassified,
        };
        state.recount_members();
        state.validate_against(store)?;

        let report = RunReport {
            run_id,
            started_at,
            revision,
            books: store.len(),
            unique_embeddings: flat.unique_points,
            clusters: flat.clusters.len(),
            noise: flat.noise.len(),
            borderline_links: flat.borderline_links,
            categories: hierarchy.categories,
            subcategories: hierarchy.subcategories,
            single_category: hierarchy.single_category,
            categories_created: plan.created() + plan.split_off(),
            categories_reused: plan.reused(),
            categories_retired: plan.retirements.len(),
            splits: plan.splits.len(),
            memberships: state.memberships.len(),
            unclassified: state.unclassified.len(),
            retirements: plan.retirements.clone(),
            split_records: plan.splits.clone(),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        tracing::info!(
            target: "engine",
            run_id = %report.run_id,
            revision,
            created = report.categories_created,
            reused = report.categories_reused,
            retired = report.categories_retired,
            unclassified = report.unclassified,
            elapsed_ms = report.duration_ms,
            "run finished"
        );

        Ok(RunOutcome { state, report, plan })
    }

    /// Load, run and commit in one go. The commit is rejected if another run
    /// committed in the meantime.
    pub fn run_and_commit(&self, db: &TaxonomyStore) -> Result<RunOutcome> {
        let prior = db.load_state()?;
        let store = db.load_vector_store()?;
        let outcome = self.run(&store, &prior)?;
        db.commit(&outcome.state, prior.revision, &outcome.report)?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaxonomyError;
    use crate::taxonomy::{CategoryId, Level};
    use crate::vector_store::{Book, BookId};

    const DIM: usize = 16;
    /// sqrt(0.95): two books built on the same base are 0.05 apart
    const SPREAD_COS: f32 = 0.974_679_4;

    fn axis(i: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[i] = 1.0;
        v
    }

    fn blend(base: &[f32], axis_index: usize) -> Vec<f32> {
        let sin = (1.0 - SPREAD_COS * SPREAD_COS).sqrt();
        let mut v: Vec<f32> = base.iter().map(|x| x * SPREAD_COS).collect();
        v[axis_index] += sin;
        v
    }

    fn base_a() -> Vec<f32> {
        axis(0)
    }

    /// Cosine 0.1 to `base_a`, so books of the two groups are ~0.9 apart.
    fn base_b() -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[0] = 0.1;
        v[1] = 0.99f32.sqrt();
        v
    }

    fn group_a() -> Vec<Book> {
        (0..6).map(|i| Book::new(format!("a{}", i), blend(&base_a(), 2 + i))).collect()
    }

    fn group_b() -> Vec<Book> {
        (0..6).map(|i| Book::new(format!("b{}", i), blend(&base_b(), 8 + i))).collect()
    }

    fn store_of(books: Vec<Book>) -> VectorStore {
        let mut store = VectorStore::new();
        for b in books {
            store.insert(b).unwrap();
        }
        store
    }

    fn twelve_books() -> VectorStore {
        store_of(group_a().into_iter().chain(group_b()).collect())
    }

    fn engine() -> TaxonomyEngine {
        TaxonomyEngine::new(EngineConfig::default()).unwrap()
    }

    #[test]
    fn test_two_tight_groups_give_two_categories() {
        let outcome = engine().run(&twelve_books(), &TaxonomyState::empty()).unwrap();
        let state = &outcome.state;

        assert_eq!(state.roots().len(), 2);
        assert_eq!(state.active_at(Level::Subcategory).count(), 0);
        assert_eq!(state.memberships.len(), 12);
        assert!(state.memberships.iter().all(|m| m.confidence > 0.9 && m.primary));
        assert!(state.unclassified.is_empty());
        assert_eq!(outcome.report.clusters, 2);
        assert_eq!(outcome.report.categories_created, 2);

        let a = state.primary_category(&"a0".into()).unwrap();
        let b = state.primary_category(&"b0".into()).unwrap();
        assert_eq!(a, CategoryId(1));
        assert_eq!(b, CategoryId(2));
        assert_eq!(state.node(a).unwrap().member_count, 6);
    }

    #[test]
    fn test_rerun_on_unchanged_books_keeps_ids() {
        let e = engine();
        let books = twelve_books();
        let first = e.run(&books, &TaxonomyState::empty()).unwrap();
        let second = e.run(&books, &first.state).unwrap();

        assert_eq!(first.plan.assigned, second.plan.assigned);
        assert_eq!(second.report.categories_created, 0);
        assert_eq!(second.report.categories_retired, 0);
        assert_eq!(second.state.revision, 2);
        for book in books.iter() {
            assert_eq!(
                first.state.categories_for_book(&book.id),
                second.state.categories_for_book(&book.id)
            );
        }
    }

    #[test]
    fn test_one_far_book_adds_exactly_one_category() {
        let e = engine();
        let first = e.run(&twelve_books(), &TaxonomyState::empty()).unwrap();

        let mut books = twelve_books();
        books.insert(Book::new("outlier", axis(15))).unwrap();
        let second = e.run(&books, &first.state).unwrap();

        assert_eq!(second.report.categories_created, 1);
        assert_eq!(second.report.categories_retired, 0);
        assert_eq!(second.state.roots().len(), 3);
        let id = second.state.primary_category(&"outlier".into()).unwrap();
        assert_eq!(id, CategoryId(3));
        assert_eq!(second.state.node(id).unwrap().level, Level::Category);
        assert_eq!(second.state.primary_category(&"a3".into()), Some(CategoryId(1)));
    }

    #[test]
    fn test_identical_embeddings_get_identical_memberships() {
        let mut books = twelve_books();
        let twin = books.get(&"a2".into()).unwrap().embedding.clone();
        books.insert(Book::new("a2-copy", twin)).unwrap();

        let outcome = engine().run(&books, &TaxonomyState::empty()).unwrap();
        let left = outcome.state.categories_for_book(&"a2".into());
        let right = outcome.state.categories_for_book(&"a2-copy".into());
        assert!(!left.is_empty());
        assert_eq!(left, right);
        assert_eq!(outcome.report.unique_embeddings, 12);
    }

    #[test]
    fn test_removed_topic_retires_and_its_id_is_not_reused() {
        let e = engine();
        let first = e.run(&twelve_books(), &TaxonomyState::empty()).unwrap();

        let only_a = store_of(group_a());
        let second = e.run(&only_a, &first.state).unwrap();
        assert_eq!(second.report.categories_retired, 1);
        assert_eq!(second.report.retirements[0].id, CategoryId(2));
        assert!(!second.state.node(CategoryId(2)).unwrap().is_active());
        assert!(second.state.validate_against(&only_a).is_ok());

        let third = e.run(&twelve_books(), &second.state).unwrap();
        assert_eq!(third.state.primary_category(&"b0".into()), Some(CategoryId(3)));
        assert!(!third.state.node(CategoryId(2)).unwrap().is_active());
        assert_eq!(third.state.next_category_seq, 4);
    }

    #[test]
    fn test_close_topics_share_a_category() {
        // 48 degrees between the groups: too far to link, close enough to share a parent
        let at = |deg: f32| {
            let r = deg.to_radians();
            vec![r.cos(), r.sin()]
        };
        let books = store_of(vec![
            Book::new("p0", at(0.0)),
            Book::new("p1", at(2.0)),
            Book::new("q0", at(50.0)),
            Book::new("q1", at(52.0)),
        ]);
        let outcome = engine().run(&books, &TaxonomyState::empty()).unwrap();
        let state = &outcome.state;

        assert_eq!(state.roots().len(), 1);
        let root = state.roots()[0].id;
        assert_eq!(state.children(root).len(), 2);

        let paths = state.categories_for_book(&"p0".into());
        assert_eq!(paths[0].ids.len(), 2);
        assert_eq!(paths[0].ids[0], root);
        assert!(state.memberships.iter().all(|m| m.category != root));

        let view = state.category_view(root).unwrap();
        assert_eq!(view.all_members.len(), 4);
        assert_eq!(state.node(root).unwrap().member_count, 4);
    }

    #[test]
    fn test_book_equidistant_from_sibling_subcategories_gets_both() {
        let mut config = EngineConfig::default();
        config.cluster.link_distance = 0.1;
        config.cluster.tie_margin = 0.001;
        let engine = TaxonomyEngine::new(config).unwrap();

        // "m" links to the 49 copies of "p". The centroid of that cluster lies
        // at angle beta from "m", and the two "q" books average to the mirror
        // direction while each stays beyond the link distance of "m".
        let alpha = 25f32.to_radians();
        let beta = (49.0 * alpha.sin()).atan2(1.0 + 49.0 * alpha.cos());
        let phi = 12.5f32.to_radians();
        let q = |sign: f32| vec![beta.cos() * phi.cos(), beta.sin() * phi.cos(), sign * phi.sin()];

        let mut books = vec![Book::new("m", vec![1.0, 0.0, 0.0])];
        books.extend((0..49).map(|i| Book::new(format!("p{:02}", i), vec![alpha.cos(), -alpha.sin(), 0.0])));
        books.push(Book::new("q1", q(1.0)));
        books.push(Book::new("q2", q(-1.0)));
        let outcome = engine.run(&store_of(books), &TaxonomyState::empty()).unwrap();
        let state = &outcome.state;

        assert_eq!(outcome.report.clusters, 2);
        assert_eq!(state.roots().len(), 1);
        let root = state.roots()[0].id;
        let siblings: Vec<CategoryId> = state.children(root).iter().map(|n| n.id).collect();
        assert_eq!(siblings.len(), 2);

        let book = BookId::new("m");
        let memberships: Vec<_> = state.memberships_of(&book).collect();
        assert_eq!(memberships.len(), 2);
        assert!(memberships.iter().all(|m| siblings.contains(&m.category)));
        assert_ne!(memberships[0].category, memberships[1].category);
        assert!((memberships[0].confidence - memberships[1].confidence).abs() < 1e-3);
        assert_eq!(memberships.iter().filter(|m| m.primary).count(), 1);

        let paths = state.categories_for_book(&book);
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| p.ids[0] == root));
    }

    #[test]
    fn test_too_few_books_is_recoverable() {
        let books = store_of(vec![Book::new("solo", axis(0))]);
        let prior = TaxonomyState::empty();
        let err = engine().run(&books, &prior).unwrap_err();
        assert!(matches!(err, TaxonomyError::InsufficientData { found: 1, required: 2 }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = EngineConfig::default();
        config.membership.max_memberships = 0;
        assert!(matches!(
            TaxonomyEngine::new(config),
            Err(TaxonomyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_noise_books_are_unclassified() {
        let mut config = EngineConfig::default();
        config.cluster.min_cluster_size = 2;
        let mut books = twelve_books();
        books.insert(Book::new("stray", axis(15))).unwrap();

        let outcome = TaxonomyEngine::new(config)
            .unwrap()
            .run(&books, &TaxonomyState::empty())
            .unwrap();
        let stray = BookId::from("stray");
        assert!(outcome.state.categories_for_book(&stray).is_empty());
        assert!(outcome.state.unclassified.iter().any(|u| u.book == stray));
        assert_eq!(outcome.report.noise, 1);
    }
}
