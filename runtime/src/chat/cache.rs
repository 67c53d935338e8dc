//! Prompt-prefix cache — process-wide, LRU-bounded with insertion-order
//! eviction (no recency bump on read), `MAX ≈ 512` entries per §5.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub const DEFAULT_CAPACITY: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub stable_prefix_hash: String,
    pub dynamic_tail_hash: String,
    pub hits: u32,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    order: VecDeque<String>,
    entries: HashMap<String, CacheEntry>,
}

/// Thread-safe singleton; reads bump the stored hit count but never move
/// the entry within the eviction order (pure insertion-order LRU, not
/// access-order).
pub struct PromptPrefixCache {
    inner: Mutex<Inner>,
}

impl PromptPrefixCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                capacity: capacity.max(1),
                order: VecDeque::new(),
                entries: HashMap::new(),
            }),
        }
    }

    pub fn get(&self, cache_key: &str) -> Option<CacheEntry> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get_mut(cache_key) {
            entry.hits += 1;
            Some(entry.clone())
        } else {
            None
        }
    }

    pub fn insert(&self, cache_key: String, stable_prefix_hash: String, dynamic_tail_hash: String) {
        let mut inner = self.inner.lock().unwrap();
        if inner.entries.contains_key(&cache_key) {
            return;
        }
        if inner.order.len() >= inner.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
            }
        }
        inner.order.push_back(cache_key.clone());
        inner.entries.insert(
            cache_key,
            CacheEntry {
                stable_prefix_hash,
                dynamic_tail_hash,
                hits: 0,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PromptPrefixCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get_round_trip() {
        let cache = PromptPrefixCache::new(4);
        cache.insert("k1".to_string(), "sph1".to_string(), "dth1".to_string());
        let entry = cache.get("k1").unwrap();
        assert_eq!(entry.stable_prefix_hash, "sph1");
        assert_eq!(entry.hits, 1);
    }

    #[test]
    fn missing_key_is_none() {
        let cache = PromptPrefixCache::new(4);
        assert!(cache.get("nope").is_none());
    }

    #[test]
    fn evicts_oldest_insertion_when_over_capacity() {
        let cache = PromptPrefixCache::new(2);
        cache.insert("a".to_string(), "x".to_string(), "y".to_string());
        cache.insert("b".to_string(), "x".to_string(), "y".to_string());
        // Read "a" repeatedly — insertion order, not access order, governs eviction.
        cache.get("a");
        cache.get("a");
        cache.insert("c".to_string(), "x".to_string(), "y".to_string());
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn reinserting_existing_key_is_a_noop() {
        let cache = PromptPrefixCache::new(2);
        cache.insert("a".to_string(), "x1".to_string(), "y1".to_string());
        cache.insert("a".to_string(), "x2".to_string(), "y2".to_string());
        assert_eq!(cache.get("a").unwrap().stable_prefix_hash, "x1");
    }

    #[test]
    fn default_capacity_matches_spec() {
        let cache = PromptPrefixCache::default();
        assert!(cache.is_empty());
    }
}
