//! In-memory data held by each worker
//!
//! Every worker owns one [`Shard`] outright; keys are routed to shards by
//! hash, so nothing in here is shared between threads.

pub mod btree;
pub mod index;
pub mod sorted_set;

pub use btree::BPlusTree;
pub use index::{new_ordered_index, AddOutcome, IndexConfig, IndexKind, Item, OrderedIndex};
pub use sorted_set::SortedSet;

use crate::error::{Error, Result};
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    String,
    Set,
    SortedSet,
}

/// Remaining lifetime of a key, as reported by TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    Missing,
    Persistent,
    Remaining(Duration),
}

/// One worker's slice of the keyspace
pub struct Shard {
    strings: HashMap<String, Bytes>,
    sets: HashMap<String, HashSet<String>>,
    sorted_sets: HashMap<String, SortedSet>,
    expires: HashMap<String, Instant>,
    index_config: IndexConfig,
}

impl Shard {
    pub fn new(index_config: IndexConfig) -> Self {
        Self {
            strings: HashMap::new(),
            sets: HashMap::new(),
            sorted_sets: HashMap::new(),
            expires: HashMap::new(),
            index_config,
        }
    }

    /// Number of live keys of any kind
    pub fn len(&self) -> usize {
        self.strings.len() + self.sets.len() + self.sorted_sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Type of `key`, dropping it first if its deadline has passed
    pub fn kind(&mut self, key: &str) -> Option<KeyKind> {
        self.expire_if_due(key, Instant::now());
        if self.strings.contains_key(key) {
            Some(KeyKind::String)
        } else if self.sets.contains_key(key) {
            Some(KeyKind::Set)
        } else if self.sorted_sets.contains_key(key) {
            Some(KeyKind::SortedSet)
        } else {
            None
        }
    }

    /// Ok(true) if `key` holds `want`, Ok(false) if absent, WRONGTYPE otherwise
    fn holds(&mut self, key: &str, want: KeyKind) -> Result<bool> {
        match self.kind(key) {
            None => Ok(false),
            Some(kind) if kind == want => Ok(true),
            Some(_) => Err(Error::WrongType),
        }
    }

    fn expire_if_due(&mut self, key: &str, now: Instant) -> bool {
        let due = matches!(self.expires.get(key), Some(&deadline) if deadline <= now);
        due && self.remove_key(key)
    }

    fn remove_key(&mut self, key: &str) -> bool {
        self.expires.remove(key);
        self.strings.remove(key).is_some()
            || self.sets.remove(key).is_some()
            || self.sorted_sets.remove(key).is_some()
    }

    pub fn get(&mut self, key: &str) -> Result<Option<Bytes>> {
        if !self.holds(key, KeyKind::String)? {
            return Ok(None);
        }
        Ok(self.strings.get(key).cloned())
    }

    /// Store a string, replacing whatever `key` held before
    pub fn set(&mut self, key: &str, value: Bytes, expires_at: Option<Instant>) {
        self.remove_key(key);
        self.strings.insert(key.to_string(), value);
        if let Some(deadline) = expires_at {
            self.expires.insert(key.to_string(), deadline);
        }
    }

    pub fn delete(&mut self, key: &str) -> bool {
        self.expire_if_due(key, Instant::now());
        self.remove_key(key)
    }

    pub fn exists(&mut self, key: &str) -> bool {
        self.kind(key).is_some()
    }

    /// Set a deadline on an existing key; one already passed deletes it right away
    pub fn expire_at(&mut self, key: &str, deadline: Instant) -> bool {
        if self.kind(key).is_none() {
            return false;
        }
        if deadline <= Instant::now() {
            self.remove_key(key);
        } else {
            self.expires.insert(key.to_string(), deadline);
        }
        true
    }

    pub fn ttl(&mut self, key: &str) -> Ttl {
        let now = Instant::now();
        self.expire_if_due(key, now);
        if self.kind(key).is_none() {
            return Ttl::Missing;
        }
        match self.expires.get(key) {
            Some(&deadline) => Ttl::Remaining(deadline.saturating_duration_since(now)),
            None => Ttl::Persistent,
        }
    }

    /// Active expiration: drop every key whose deadline is at or before `now`
    pub fn purge_expired(&mut self, now: Instant) -> usize {
        let due: Vec<String> = self
            .expires
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        due.iter().filter(|key| self.remove_key(key)).count()
    }

    pub fn sadd(&mut self, key: &str, members: &[String]) -> Result<usize> {
        self.holds(key, KeyKind::Set)?;
        let set = self.sets.entry(key.to_string()).or_default();
        Ok(members.iter().filter(|m| set.insert((*m).clone())).count())
    }

    pub fn srem(&mut self, key: &str, members: &[String]) -> Result<usize> {
        if !self.holds(key, KeyKind::Set)? {
            return Ok(0);
        }
        let Some(set) = self.sets.get_mut(key) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|m| set.remove(m.as_str())).count();
        if set.is_empty() {
            self.remove_key(key);
        }
        Ok(removed)
    }

    pub fn set_members(&mut self, key: &str) -> Result<Option<&HashSet<String>>> {
        if !self.holds(key, KeyKind::Set)? {
            return Ok(None);
        }
        Ok(self.sets.get(key))
    }

    pub fn zadd(&mut self, key: &str, entries: &[(f64, String)]) -> Result<usize> {
        if !self.holds(key, KeyKind::SortedSet)? {
            let zset = SortedSet::new(&self.index_config)?;
            self.sorted_sets.insert(key.to_string(), zset);
        }
        let Some(zset) = self.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let added = entries
            .iter()
            .filter(|(score, member)| zset.add(*score, member) == AddOutcome::Inserted)
            .count();
        // Every member may have been ignored, leaving a fresh set empty
        if zset.is_empty() {
            self.remove_key(key);
        }
        Ok(added)
    }

    pub fn zrem(&mut self, key: &str, members: &[String]) -> Result<usize> {
        if !self.holds(key, KeyKind::SortedSet)? {
            return Ok(0);
        }
        let Some(zset) = self.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|m| zset.remove(m)).count();
        if zset.is_empty() {
            self.remove_key(key);
        }
        Ok(removed)
    }

    pub fn sorted_set(&mut self, key: &str) -> Result<Option<&SortedSet>> {
        if !self.holds(key, KeyKind::SortedSet)? {
            return Ok(None);
        }
        Ok(self.sorted_sets.get(key))
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::new(IndexConfig::default())
    }
}
