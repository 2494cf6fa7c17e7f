use super::btree::BPlusTree;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Fan-out used when the configured degree is 0
pub const DEFAULT_DEGREE: usize = 4;

/// A scored member. Ordered by score, then member.
#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub score: f64,
    pub member: String,
}

impl Item {
    pub fn new(score: f64, member: impl Into<String>) -> Self {
        Self {
            score: canonical(score),
            member: member.into(),
        }
    }

    /// Compare this item against the key `(score, member)`
    #[inline]
    pub fn cmp_key(&self, score: f64, member: &str) -> Ordering {
        self.score
            .total_cmp(&canonical(score))
            .then_with(|| self.member.as_str().cmp(member))
    }
}

/// Folds -0.0 into 0.0 so `total_cmp` agrees with `==` on zero scores
#[inline]
pub(crate) fn canonical(score: f64) -> f64 {
    if score == 0.0 {
        0.0
    } else {
        score
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    Inserted,
    Updated,
    Ignored,
}

/// Sorted, rank-addressable member → score index
pub trait OrderedIndex: Send {
    /// Insert `member`, or move it to `score` if it is already present
    fn add(&mut self, score: f64, member: &str) -> AddOutcome;

    /// Remove `member` wherever it sits; false if absent
    fn remove(&mut self, member: &str) -> bool;

    /// Insert an item known by the caller to be absent; false if the exact key exists
    fn insert_item(&mut self, item: Item) -> bool;

    /// Remove the exact key `(score, member)`
    fn remove_item(&mut self, score: f64, member: &str) -> bool;

    /// Zero-based position in ascending order
    fn get_rank(&self, member: &str) -> Option<usize>;

    fn get_score(&self, member: &str) -> Option<f64>;

    fn get_by_rank(&self, rank: usize) -> Option<&Item>;

    /// Items with `min <= score <= max`, ascending
    fn get_range(&self, min: f64, max: f64) -> Vec<&Item>;

    /// Items with rank in `start..=end`, ascending
    fn get_range_by_rank(&self, start: usize, end: usize) -> Vec<&Item>;

    fn count(&self) -> usize;

    fn clear(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    #[default]
    BTree,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub kind: IndexKind,
    /// Maximum children per node; 0 selects [`DEFAULT_DEGREE`]
    pub degree: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: IndexKind::BTree,
            degree: DEFAULT_DEGREE,
        }
    }
}

/// Build an ordered index for the configured backend
pub fn new_ordered_index(config: &IndexConfig) -> Result<Box<dyn OrderedIndex>> {
    match config.kind {
        IndexKind::BTree => {
            let degree = if config.degree == 0 {
                DEFAULT_DEGREE
            } else {
                config.degree
            };
            Ok(Box::new(BPlusTree::new(degree)?))
        }
    }
}
