//! Arena-backed B+ tree ordered by `(score, member)`.
//!
//! Nodes live in a `Vec` and refer to each other by index: internal nodes own
//! their children by id, every non-root node records its parent id, and
//! leaves are chained through `next` in ascending order for range scans.
//! Freed slots are recycled through a free list.
//!
//! A node holds at most `degree - 1` items. Leaves split at the middle and
//! copy the right half's first key up as a separator; internal nodes promote
//! their median. Deletion borrows from a sibling when one can spare an item
//! and merges otherwise, collapsing the root once it is left with one child.

use super::index::{canonical, AddOutcome, Item, OrderedIndex};
use crate::error::{Error, Result};
use std::cmp::Ordering;

/// Smallest degree for which splits and merges stay well-formed
pub const MIN_DEGREE: usize = 3;

type NodeId = usize;

#[derive(Debug, Default)]
struct Node {
    leaf: bool,
    /// Entries in a leaf, separators in an internal node
    items: Vec<Item>,
    children: Vec<NodeId>,
    parent: Option<NodeId>,
    next: Option<NodeId>,
}

impl Node {
    fn leaf() -> Self {
        Node {
            leaf: true,
            ..Default::default()
        }
    }

    fn internal() -> Self {
        Node::default()
    }
}

pub struct BPlusTree {
    nodes: Vec<Node>,
    free: Vec<NodeId>,
    root: NodeId,
    degree: usize,
    len: usize,
}

impl BPlusTree {
    pub fn new(degree: usize) -> Result<Self> {
        if degree < MIN_DEGREE {
            return Err(Error::Config(format!(
                "B+ tree degree must be at least {}, got {}",
                MIN_DEGREE, degree
            )));
        }
        Ok(Self {
            nodes: vec![Node::leaf()],
            free: Vec::new(),
            root: 0,
            degree,
            len: 0,
        })
    }

    /// Number of levels, 1 for a lone leaf
    pub fn height(&self) -> usize {
        let mut height = 1;
        let mut id = self.root;
        while !self.nodes[id].leaf {
            id = self.nodes[id].children[0];
            height += 1;
        }
        height
    }

    /// Ascending iterator over every item
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            tree: self,
            leaf: Some(self.first_leaf()),
            pos: 0,
        }
    }

    #[inline]
    fn max_items(&self) -> usize {
        self.degree - 1
    }

    #[inline]
    fn min_items(&self, id: NodeId) -> usize {
        if self.nodes[id].leaf {
            self.degree / 2
        } else {
            (self.degree - 1) / 2
        }
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id] = Node::default();
        self.free.push(id);
    }

    fn first_leaf(&self) -> NodeId {
        let mut id = self.root;
        while !self.nodes[id].leaf {
            id = self.nodes[id].children[0];
        }
        id
    }

    /// Leaf that does or would hold `(score, member)`; equal separators route right
    fn find_leaf(&self, score: f64, member: &str) -> NodeId {
        let mut id = self.root;
        while !self.nodes[id].leaf {
            let node = &self.nodes[id];
            let slot = node
                .items
                .partition_point(|sep| sep.cmp_key(score, member) != Ordering::Greater);
            id = node.children[slot];
        }
        id
    }

    fn child_slot(&self, parent: NodeId, child: NodeId) -> usize {
        match self.nodes[parent].children.iter().position(|&c| c == child) {
            Some(slot) => slot,
            None => unreachable!("node {} is not a child of {}", child, parent),
        }
    }

    fn split(&mut self, id: NodeId) {
        let parent = match self.nodes[id].parent {
            Some(parent) => parent,
            None => {
                let mut root = Node::internal();
                root.children.push(id);
                let root_id = self.alloc(root);
                self.nodes[id].parent = Some(root_id);
                self.root = root_id;
                root_id
            }
        };

        let (separator, sibling) = if self.nodes[id].leaf {
            self.split_leaf(id, parent)
        } else {
            self.split_internal(id, parent)
        };

        let slot = self.child_slot(parent, id);
        let node = &mut self.nodes[parent];
        node.items.insert(slot, separator);
        node.children.insert(slot + 1, sibling);

        if self.nodes[parent].items.len() > self.max_items() {
            self.split(parent);
        }
    }

    fn split_leaf(&mut self, id: NodeId, parent: NodeId) -> (Item, NodeId) {
        let node = &mut self.nodes[id];
        let mid = node.items.len() / 2;
        let right = node.items.split_off(mid);
        let next = node.next;
        let separator = right[0].clone();

        let sibling = self.alloc(Node {
            leaf: true,
            items: right,
            children: Vec::new(),
            parent: Some(parent),
            next,
        });
        self.nodes[id].next = Some(sibling);
        (separator, sibling)
    }

    fn split_internal(&mut self, id: NodeId, parent: NodeId) -> (Item, NodeId) {
        let node = &mut self.nodes[id];
        let mid = node.items.len() / 2;
        let mut right = node.items.split_off(mid);
        let promoted = right.remove(0);
        let children = node.children.split_off(mid + 1);

        let sibling = self.alloc(Node {
            leaf: false,
            items: right,
            children,
            parent: Some(parent),
            next: None,
        });
        for slot in 0..self.nodes[sibling].children.len() {
            let child = self.nodes[sibling].children[slot];
            self.nodes[child].parent = Some(sibling);
        }
        (promoted, sibling)
    }

    fn rebalance(&mut self, id: NodeId) {
        let Some(parent) = self.nodes[id].parent else {
            let root = &self.nodes[id];
            if !root.leaf && root.items.is_empty() {
                let child = root.children[0];
                self.nodes[child].parent = None;
                self.root = child;
                self.release(id);
            }
            return;
        };

        if self.nodes[id].items.len() >= self.min_items(id) {
            return;
        }

        let slot = self.child_slot(parent, id);
        let left = slot.checked_sub(1).map(|s| self.nodes[parent].children[s]);
        let right = self.nodes[parent].children.get(slot + 1).copied();

        if let Some(left) = left {
            if self.nodes[left].items.len() > self.min_items(left) {
                self.borrow_from_left(id, left, parent, slot);
                return;
            }
        }
        if let Some(right) = right {
            if self.nodes[right].items.len() > self.min_items(right) {
                self.borrow_from_right(id, right, parent, slot);
                return;
            }
        }

        match (left, right) {
            (Some(left), _) => self.merge(left, id, parent, slot - 1),
            (None, Some(right)) => self.merge(id, right, parent, slot),
            (None, None) => return,
        }
        self.rebalance(parent);
    }

    fn borrow_from_left(&mut self, id: NodeId, left: NodeId, parent: NodeId, slot: usize) {
        if self.nodes[id].leaf {
            let Some(item) = self.nodes[left].items.pop() else {
                return;
            };
            self.nodes[parent].items[slot - 1] = item.clone();
            self.nodes[id].items.insert(0, item);
        } else {
            let (Some(raised), Some(child)) = (
                self.nodes[left].items.pop(),
                self.nodes[left].children.pop(),
            ) else {
                return;
            };
            let lowered = std::mem::replace(&mut self.nodes[parent].items[slot - 1], raised);
            let node = &mut self.nodes[id];
            node.items.insert(0, lowered);
            node.children.insert(0, child);
            self.nodes[child].parent = Some(id);
        }
    }

    fn borrow_from_right(&mut self, id: NodeId, right: NodeId, parent: NodeId, slot: usize) {
        if self.nodes[id].leaf {
            let item = self.nodes[right].items.remove(0);
            self.nodes[id].items.push(item);
            self.nodes[parent].items[slot] = self.nodes[right].items[0].clone();
        } else {
            let raised = self.nodes[right].items.remove(0);
            let child = self.nodes[right].children.remove(0);
            let lowered = std::mem::replace(&mut self.nodes[parent].items[slot], raised);
            let node = &mut self.nodes[id];
            node.items.push(lowered);
            node.children.push(child);
            self.nodes[child].parent = Some(id);
        }
    }

    /// Fold `right` into `left`; `sep` indexes the parent separator between them
    fn merge(&mut self, left: NodeId, right: NodeId, parent: NodeId, sep: usize) {
        let separator = self.nodes[parent].items.remove(sep);
        self.nodes[parent].children.remove(sep + 1);

        let absorbed = std::mem::take(&mut self.nodes[right]);
        if absorbed.leaf {
            let node = &mut self.nodes[left];
            node.items.extend(absorbed.items);
            node.next = absorbed.next;
        } else {
            for &child in &absorbed.children {
                self.nodes[child].parent = Some(left);
            }
            let node = &mut self.nodes[left];
            node.items.push(separator);
            node.items.extend(absorbed.items);
            node.children.extend(absorbed.children);
        }
        self.release(right);
    }
}

impl OrderedIndex for BPlusTree {
    fn add(&mut self, score: f64, member: &str) -> AddOutcome {
        if member.is_empty() {
            return AddOutcome::Ignored;
        }

        let leaf = self.find_leaf(score, member);
        if self.nodes[leaf]
            .items
            .binary_search_by(|probe| probe.cmp_key(score, member))
            .is_ok()
        {
            return AddOutcome::Updated;
        }

        // O(n): callers that track scores should use insert_item/remove_item
        if let Some(previous) = self.get_score(member) {
            self.remove_item(previous, member);
            self.insert_item(Item::new(score, member));
            return AddOutcome::Updated;
        }

        self.insert_item(Item::new(score, member));
        AddOutcome::Inserted
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.get_score(member) {
            Some(score) => self.remove_item(score, member),
            None => false,
        }
    }

    fn insert_item(&mut self, item: Item) -> bool {
        let leaf = self.find_leaf(item.score, &item.member);
        let items = &mut self.nodes[leaf].items;
        let pos = match items.binary_search_by(|probe| probe.cmp_key(item.score, &item.member)) {
            Ok(_) => return false,
            Err(pos) => pos,
        };
        items.insert(pos, item);
        self.len += 1;

        if self.nodes[leaf].items.len() > self.max_items() {
            self.split(leaf);
        }
        true
    }

    fn remove_item(&mut self, score: f64, member: &str) -> bool {
        let leaf = self.find_leaf(score, member);
        let items = &mut self.nodes[leaf].items;
        match items.binary_search_by(|probe| probe.cmp_key(score, member)) {
            Ok(pos) => {
                items.remove(pos);
            }
            Err(_) => return false,
        }
        self.len -= 1;
        self.rebalance(leaf);
        true
    }

    fn get_rank(&self, member: &str) -> Option<usize> {
        self.iter().position(|item| item.member == member)
    }

    fn get_score(&self, member: &str) -> Option<f64> {
        self.iter()
            .find(|item| item.member == member)
            .map(|item| item.score)
    }

    fn get_by_rank(&self, rank: usize) -> Option<&Item> {
        self.iter().nth(rank)
    }

    fn get_range(&self, min: f64, max: f64) -> Vec<&Item> {
        if min.is_nan() || max.is_nan() || min > max {
            return Vec::new();
        }
        let (min, max) = (canonical(min), canonical(max));
        let start = Iter {
            tree: self,
            leaf: Some(self.find_leaf(min, "")),
            pos: 0,
        };
        start
            .skip_while(|item| item.score < min)
            .take_while(|item| item.score <= max)
            .collect()
    }

    fn get_range_by_rank(&self, start: usize, end: usize) -> Vec<&Item> {
        if start > end {
            return Vec::new();
        }
        self.iter().skip(start).take(end - start + 1).collect()
    }

    fn count(&self) -> usize {
        self.len
    }

    fn clear(&mut self) {
        self.nodes = vec![Node::leaf()];
        self.free.clear();
        self.root = 0;
        self.len = 0;
    }
}

/// Walks the leaf chain in ascending order
pub struct Iter<'a> {
    tree: &'a BPlusTree,
    leaf: Option<NodeId>,
    pos: usize,
}

impl<'a> Iterator for Iter<'a> {
    type Item = &'a Item;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let node = &self.tree.nodes[self.leaf?];
            if let Some(item) = node.items.get(self.pos) {
                self.pos += 1;
                return Some(item);
            }
            self.leaf = node.next;
            self.pos = 0;
        }
    }
}
