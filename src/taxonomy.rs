//! The persisted taxonomy: category graph, membership table, unclassified books.
//!
//! A [`TaxonomyState`] is never edited by a run. The engine derives a complete
//! next state from the previous one and the store swaps it in on commit. The
//! only in-place change is label intake, which touches metadata and leaves the
//! structure alone.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, TaxonomyError};
use crate::vector_store::{BookId, VectorStore};

/// Stable category identifier. Allocated from a monotonically increasing
/// sequence, so a smaller id was created earlier. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CategoryId(pub u64);

impl fmt::Display for CategoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cat-{}", self.0)
    }
}

impl FromStr for CategoryId {
    type Err = TaxonomyError;

    /// Accepts both `cat-7` and `7`.
    fn from_str(s: &str) -> Result<Self> {
        let digits = s.trim().trim_start_matches("cat-");
        digits
            .parse::<u64>()
            .map(CategoryId)
            .map_err(|_| TaxonomyError::CorruptData(format!("not a category id: {:?}", s)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    /// Level 0, top of the tree.
    Category,
    /// Level 1, always under exactly one category.
    Subcategory,
}

impl Level {
    pub const ALL: [Level; 2] = [Level::Category, Level::Subcategory];

    pub fn as_i64(self) -> i64 {
        match self {
            Level::Category => 0,
            Level::Subcategory => 1,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(Level::Category),
            1 => Some(Level::Subcategory),
            _ => None,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Category => write!(f, "0 (category)"),
            Level::Subcategory => write!(f, "1 (subcategory)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum NodeStatus {
    Active,
    /// Tombstone. The id stays reserved forever.
    Retired { revision: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryNode {
    pub id: CategoryId,
    pub level: Level,
    pub parent: Option<CategoryId>,
    pub centroid: Vec<f32>,
    /// Distinct books with a membership in this node or its subcategories.
    pub member_count: usize,
    pub label: Option<String>,
    pub label_stale: bool,
    pub created_revision: u64,
    pub updated_revision: u64,
    pub status: NodeStatus,
    /// Set when the node was carved out of an existing category in a split.
    #[serde(default)]
    pub split_from: Option<CategoryId>,
}

impl CategoryNode {
    pub fn is_active(&self) -> bool {
        self.status == NodeStatus::Active
    }

    /// Naming should (re)label this node.
    pub fn needs_label(&self) -> bool {
        self.is_active() && (self.label.is_none() || self.label_stale)
    }

    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or("(unnamed)")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Membership {
    pub book: BookId,
    pub category: CategoryId,
    /// In [0, 1]. 1 means the book sits on the category centroid.
    pub confidence: f32,
    /// Highest-confidence membership of the book.
    pub primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum UnclassifiedReason {
    /// Clustering found no dense region around the book.
    Noise,
    /// No category centroid within the consideration radius.
    NoCandidate,
    /// The closest category was too weak a match.
    LowConfidence { best: f32 },
}

impl UnclassifiedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnclassifiedReason::Noise => "noise",
            UnclassifiedReason::NoCandidate => "no_candidate",
            UnclassifiedReason::LowConfidence { .. } => "low_confidence",
        }
    }

    pub fn best_confidence(&self) -> Option<f32> {
        match self {
            UnclassifiedReason::LowConfidence { best } => Some(*best),
            _ => None,
        }
    }

    pub fn from_parts(reason: &str, best: Option<f32>) -> Option<Self> {
        match reason {
            "noise" => Some(UnclassifiedReason::Noise),
            "no_candidate" => Some(UnclassifiedReason::NoCandidate),
            "low_confidence" => Some(UnclassifiedReason::LowConfidence {
                best: best.unwrap_or(0.0),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unclassified {
    pub book: BookId,
    #[serde(flatten)]
    pub reason: UnclassifiedReason,
}

/// Monotonic identifier source, seeded from the persisted sequence.
#[derive(Debug, Clone)]
pub struct CategorySequence {
    next: u64,
}

impl CategorySequence {
    pub fn starting_at(next: u64) -> Self {
        Self { next: next.max(1) }
    }

    pub fn next_id(&mut self) -> CategoryId {
        let id = CategoryId(self.next);
        self.next += 1;
        id
    }

    /// Value to persist as the next sequence start.
    pub fn peek(&self) -> u64 {
        self.next
    }
}

/// One membership of a book, as a path from the top-level category down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryPath {
    pub ids: Vec<CategoryId>,
    pub labels: Vec<Option<String>>,
    pub confidence: f32,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberEntry {
    pub book: BookId,
    pub confidence: f32,
    pub primary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryView {
    pub node: CategoryNode,
    /// Books with a membership directly on this node.
    pub members: Vec<MemberEntry>,
    pub children: Vec<CategoryId>,
    /// Direct members plus members of all subcategories.
    pub all_members: Vec<BookId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelRejection {
    UnknownCategory,
    Retired,
    /// Has a current label. Only null or stale labels are replaced.
    AlreadyLabeled,
    EmptyLabel,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelReport {
    pub applied: Vec<CategoryId>,
    pub rejected: Vec<(CategoryId, LabelRejection)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonomyState {
    /// Bumped once per committed run.
    pub revision: u64,
    pub next_category_seq: u64,
    /// Every node ever created, retired ones included.
    pub nodes: BTreeMap<CategoryId, CategoryNode>,
    /// Grouped by book, highest confidence first.
    pub memberships: Vec<Membership>,
    pub unclassified: Vec<Unclassified>,
}

impl Default for TaxonomyState {
    fn default() -> Self {
        Self::empty()
    }
}

impl TaxonomyState {
    /// Prior state of the very first run.
    pub fn empty() -> Self {
        Self {
            revision: 0,
            next_category_seq: 1,
            nodes: BTreeMap::new(),
            memberships: Vec::new(),
            unclassified: Vec::new(),
        }
    }

    pub fn node(&self, id: CategoryId) -> Option<&CategoryNode> {
        self.nodes.get(&id)
    }

    pub fn active_nodes(&self) -> impl Iterator<Item = &CategoryNode> {
        self.nodes.values().filter(|n| n.is_active())
    }

    pub fn active_at(&self, level: Level) -> impl Iterator<Item = &CategoryNode> {
        self.active_nodes().filter(move |n| n.level == level)
    }

    /// Active top-level categories, oldest first.
    pub fn roots(&self) -> Vec<&CategoryNode> {
        self.active_at(Level::Category).collect()
    }

    pub fn children(&self, id: CategoryId) -> Vec<&CategoryNode> {
        self.active_nodes()
            .filter(|n| n.parent == Some(id))
            .collect()
    }

    pub fn unclassified(&self) -> &[Unclassified] {
        &self.unclassified
    }

    pub fn memberships_of<'a>(&'a self, book: &'a BookId) -> impl Iterator<Item = &'a Membership> {
        self.memberships.iter().filter(move |m| &m.book == book)
    }

    pub fn primary_category(&self, book: &BookId) -> Option<CategoryId> {
        self.memberships_of(book)
            .find(|m| m.primary)
            .map(|m| m.category)
    }

    /// The node itself at its own level, or its parent when asking a
    /// subcategory for its top-level category.
    pub fn ancestor_at(&self, id: CategoryId, level: Level) -> Option<CategoryId> {
        let node = self.nodes.get(&id)?;
        match (node.level, level) {
            (l, wanted) if l == wanted => Some(id),
            (Level::Subcategory, Level::Category) => node.parent,
            _ => None,
        }
    }

    /// Every category a book belongs to, most confident first.
    pub fn categories_for_book(&self, book: &BookId) -> Vec<CategoryPath> {
        let mut paths: Vec<CategoryPath> = self
            .memberships_of(book)
            .map(|m| {
                let mut ids = Vec::with_capacity(2);
                if let Some(parent) = self.nodes.get(&m.category).and_then(|n| n.parent) {
                    ids.push(parent);
                }
                ids.push(m.category);
                let labels = ids
                    .iter()
                    .map(|id| self.nodes.get(id).and_then(|n| n.label.clone()))
                    .collect();
                CategoryPath {
                    ids,
                    labels,
                    confidence: m.confidence,
                    primary: m.primary,
                }
            })
            .collect();
        paths.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.ids.cmp(&b.ids))
        });
        paths
    }

    pub fn category_view(&self, id: CategoryId) -> Option<CategoryView> {
        let node = self.nodes.get(&id)?;
        let children: Vec<CategoryId> = self.children(id).iter().map(|n| n.id).collect();

        let mut members: Vec<MemberEntry> = self
            .memberships
            .iter()
            .filter(|m| m.category == id)
            .map(|m| MemberEntry {
                book: m.book.clone(),
                confidence: m.confidence,
                primary: m.primary,
            })
            .collect();
        members.sort_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then_with(|| a.book.cmp(&b.book))
        });

        let scope: HashSet<CategoryId> = std::iter::once(id).chain(children.iter().copied()).collect();
        let all_members: Vec<BookId> = self
            .memberships
            .iter()
            .filter(|m| scope.contains(&m.category))
            .map(|m| m.book.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Some(CategoryView {
            node: node.clone(),
            members,
            children,
            all_members,
        })
    }

    pub fn nodes_needing_labels(&self) -> Vec<&CategoryNode> {
        self.nodes.values().filter(|n| n.needs_label()).collect()
    }

    /// Accept labels from the naming component. Only active nodes whose label
    /// is null or stale take a new one; everything else is reported back.
    pub fn apply_labels(&mut self, labels: &HashMap<CategoryId, String>) -> LabelReport {
        let mut report = LabelReport::default();
        let mut ids: Vec<&CategoryId> = labels.keys().collect();
        ids.sort();

        for id in ids {
            let label = labels[id].trim();
            let Some(node) = self.nodes.get_mut(id) else {
                report.rejected.push((*id, LabelRejection::UnknownCategory));
                continue;
            };
            if !node.is_active() {
                report.rejected.push((*id, LabelRejection::Retired));
            } else if label.is_empty() {
                report.rejected.push((*id, LabelRejection::EmptyLabel));
            } else if !node.needs_label() {
                report.rejected.push((*id, LabelRejection::AlreadyLabeled));
            } else {
                node.label = Some(label.to_string());
                node.label_stale = false;
                report.applied.push(*id);
            }
        }
        report
    }

    /// Recompute every active node's member count from the membership table.
    pub fn recount_members(&mut self) {
        let mut books_per_node: HashMap<CategoryId, HashSet<&BookId>> = HashMap::new();
        for m in &self.memberships {
            books_per_node.entry(m.category).or_default().insert(&m.book);
            if let Some(parent) = self.nodes.get(&m.category).and_then(|n| n.parent) {
                books_per_node.entry(parent).or_default().insert(&m.book);
            }
        }
        let counts: HashMap<CategoryId, usize> = books_per_node
            .into_iter()
            .map(|(id, books)| (id, books.len()))
            .collect();
        for node in self.nodes.values_mut().filter(|n| n.is_active()) {
            node.member_count = counts.get(&node.id).copied().unwrap_or(0);
        }
    }

    /// Structural invariants of the category graph and membership table.
    pub fn validate(&self) -> Result<()> {
        let violation = |msg: String| Err(TaxonomyError::InvariantViolation(msg));

        for (key, node) in &self.nodes {
            if *key != node.id {
                return violation(format!("node stored under {} carries id {}", key, node.id));
            }
            if node.id.0 == 0 || node.id.0 >= self.next_category_seq {
                return violation(format!(
                    "{} lies outside the allocated sequence (next is {})",
                    node.id, self.next_category_seq
                ));
            }
            if !node.is_active() {
                continue;
            }
            match (node.level, node.parent) {
                (Level::Category, None) => {}
                (Level::Category, Some(p)) => {
                    return violation(format!("top-level {} has parent {}", node.id, p));
                }
                (Level::Subcategory, None) => {
                    return violation(format!("subcategory {} has no parent", node.id));
                }
                (Level::Subcategory, Some(p)) => match self.nodes.get(&p) {
                    Some(parent) if parent.is_active() && parent.level == Level::Category => {}
                    _ => {
                        return violation(format!(
                            "subcategory {} has no active top-level parent ({})",
                            node.id, p
                        ));
                    }
                },
            }
        }

        let mut pairs = HashSet::new();
        let mut primaries: HashMap<&BookId, usize> = HashMap::new();
        for m in &self.memberships {
            let Some(node) = self.nodes.get(&m.category) else {
                return violation(format!("membership of {} references unknown {}", m.book, m.category));
            };
            if !node.is_active() {
                return violation(format!("membership of {} references retired {}", m.book, m.category));
            }
            if !(0.0..=1.0).contains(&m.confidence) {
                return violation(format!(
                    "membership of {} in {} has confidence {}",
                    m.book, m.category, m.confidence
                ));
            }
            if !pairs.insert((&m.book, m.category)) {
                return violation(format!("{} belongs to {} twice", m.book, m.category));
            }
            if m.primary {
                *primaries.entry(&m.book).or_default() += 1;
            }
        }

        let members: HashSet<&BookId> = self.memberships.iter().map(|m| &m.book).collect();
        for book in &members {
            let count = primaries.get(book).copied().unwrap_or(0);
            if count != 1 {
                return violation(format!("{} has {} primary memberships", book, count));
            }
        }

        let mut seen_unclassified = HashSet::new();
        for u in &self.unclassified {
            if members.contains(&u.book) {
                return violation(format!("{} is both classified and unclassified", u.book));
            }
            if !seen_unclassified.insert(&u.book) {
                return violation(format!("{} is unclassified twice", u.book));
            }
        }
        Ok(())
    }

    /// [`validate`](Self::validate) plus: every referenced book exists in the store.
    pub fn validate_against(&self, store: &VectorStore) -> Result<()> {
        self.validate()?;
        let referenced = self
            .memberships
            .iter()
            .map(|m| &m.book)
            .chain(self.unclassified.iter().map(|u| &u.book));
        for book in referenced {
            if !store.contains(book) {
                return Err(TaxonomyError::InvariantViolation(format!(
                    "{} is referenced but not in the vector store",
                    book
                )));
            }
        }
        Ok(())
    }
}
