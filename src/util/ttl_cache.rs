//! Capacity-bounded set with per-entry expiry.
//!
//! All entries share one TTL, so insertion order is also expiry order and a
//! queue is enough to find the oldest entry. When full, the oldest entry is
//! evicted even if it has not expired yet.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Longer TTLs are capped so that expiry instants stay representable.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

#[derive(Debug)]
pub struct TtlCache<K> {
    ttl: Duration,
    max_size: usize,
    entries: HashMap<K, Instant>,
    /// (key, expiry) in insertion order. May hold stale pairs for keys that
    /// were re-inserted; those are skipped when popped.
    order: VecDeque<(K, Instant)>,
}

impl<K: Hash + Eq + Clone> TtlCache<K> {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            ttl: ttl.min(MAX_TTL),
            max_size: max_size.max(1),
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&mut self, key: &K, now: Instant) -> bool {
        self.purge_expired(now);
        self.entries.contains_key(key)
    }

    /// Inserts `key` (or refreshes its expiry).
    pub fn insert(&mut self, key: K, now: Instant) {
        self.purge_expired(now);
        if !self.entries.contains_key(&key) {
            while self.entries.len() >= self.max_size {
                if !self.evict_oldest() {
                    break;
                }
            }
        }
        let expiry = now + self.ttl;
        self.entries.insert(key.clone(), expiry);
        self.order.push_back((key, expiry));
    }

    /// Inserts `key` unless present. Returns `true` if it was inserted.
    pub fn insert_if_absent(&mut self, key: K, now: Instant) -> bool {
        if self.contains(&key, now) {
            return false;
        }
        self.insert(key, now);
        true
    }

    fn purge_expired(&mut self, now: Instant) {
        while let Some((_, expiry)) = self.order.front() {
            if *expiry > now {
                break;
            }
            if let Some((key, expiry)) = self.order.pop_front()
                && self.entries.get(&key) == Some(&expiry)
            {
                self.entries.remove(&key);
            }
        }
    }

    fn evict_oldest(&mut self) -> bool {
        while let Some((key, expiry)) = self.order.pop_front() {
            if self.entries.get(&key) == Some(&expiry) {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }
}
