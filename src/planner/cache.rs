//! Plan cache.
//!
//! Pure memoization keyed by the stable hash of the parsed query plus the
//! planner options: the same key always returns the same `Arc<Plan>`
//! instance, shared across concurrent planners. Eviction is LRU over a
//! logical access clock, checked on insert.

use super::Plan;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

struct CacheEntry {
    plan: Arc<Plan>,
    last_used: AtomicU64,
}

/// Concurrent LRU map from plan hash to compiled plan.
pub struct PlanCache {
    entries: DashMap<u64, CacheEntry>,
    capacity: usize,
    clock: AtomicU64,
}

impl PlanCache {
    pub fn new(capacity: usize) -> Self {
        PlanCache {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            clock: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    pub fn get(&self, hash: u64) -> Option<Arc<Plan>> {
        let entry = self.entries.get(&hash)?;
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Some(Arc::clone(&entry.plan))
    }

    /// Insert unless present; returns the canonical instance either way.
    pub fn insert(&self, hash: u64, plan: Arc<Plan>) -> Arc<Plan> {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&hash) {
            self.evict_oldest();
        }
        let entry = self.entries.entry(hash).or_insert_with(|| CacheEntry {
            plan,
            last_used: AtomicU64::new(0),
        });
        entry.last_used.store(self.tick(), Ordering::Relaxed);
        Arc::clone(&entry.plan)
    }

    fn evict_oldest(&self) {
        let mut oldest: Option<(u64, u64)> = None;
        for entry in self.entries.iter() {
            let used = entry.last_used.load(Ordering::Relaxed);
            if oldest.is_none_or(|(_, best)| used < best) {
                oldest = Some((*entry.key(), used));
            }
        }
        if let Some((key, _)) = oldest {
            self.entries.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::builders::*;

    fn dummy_plan(tag: u64) -> Arc<Plan> {
        Arc::new(Plan {
            query: Arc::new(query().find_var("?x").build()),
            phases: Vec::new(),
            plan_hash: tag,
        })
    }

    #[test]
    fn test_get_returns_same_instance() {
        let cache = PlanCache::new(4);
        let plan = cache.insert(1, dummy_plan(1));
        let hit = cache.get(1).expect("cached");
        assert!(Arc::ptr_eq(&plan, &hit));
    }

    #[test]
    fn test_concurrent_insert_keeps_one_instance() {
        let cache = PlanCache::new(4);
        let a = cache.insert(7, dummy_plan(7));
        let b = cache.insert(7, dummy_plan(7));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_lru_eviction() {
        let cache = PlanCache::new(2);
        cache.insert(1, dummy_plan(1));
        cache.insert(2, dummy_plan(2));
        cache.get(1);
        cache.insert(3, dummy_plan(3));
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.len(), 2);
    }
}
