use super::index::{canonical, new_ordered_index, AddOutcome, IndexConfig, Item, OrderedIndex};
use crate::error::Result;
use std::collections::HashMap;

/// Ordered index plus a member → score map for O(1) score reads
///
/// Both sides are updated together on every add and remove.
pub struct SortedSet {
    index: Box<dyn OrderedIndex>,
    scores: HashMap<String, f64>,
}

impl SortedSet {
    pub fn new(config: &IndexConfig) -> Result<Self> {
        Ok(Self {
            index: new_ordered_index(config)?,
            scores: HashMap::new(),
        })
    }

    /// Insert or rescore `member`
    pub fn add(&mut self, score: f64, member: &str) -> AddOutcome {
        if member.is_empty() {
            return AddOutcome::Ignored;
        }
        let score = canonical(score);

        match self.scores.get_mut(member) {
            Some(current) if *current == score => AddOutcome::Updated,
            Some(current) => {
                self.index.remove_item(*current, member);
                self.index.insert_item(Item::new(score, member));
                *current = score;
                AddOutcome::Updated
            }
            None => {
                self.index.insert_item(Item::new(score, member));
                self.scores.insert(member.to_string(), score);
                AddOutcome::Inserted
            }
        }
    }

    pub fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.index.remove_item(score, member),
            None => false,
        }
    }

    pub fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn rank(&self, member: &str) -> Option<usize> {
        if !self.scores.contains_key(member) {
            return None;
        }
        self.index.get_rank(member)
    }

    pub fn by_rank(&self, rank: usize) -> Option<&Item> {
        self.index.get_by_rank(rank)
    }

    pub fn range_by_rank(&self, start: usize, end: usize) -> Vec<&Item> {
        self.index.get_range_by_rank(start, end)
    }

    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<&Item> {
        self.index.get_range(min, max)
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn clear(&mut self) {
        self.index.clear();
        self.scores.clear();
    }
}
