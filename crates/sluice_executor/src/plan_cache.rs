use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use sluice_common::config::PlanCacheConfig;
use sluice_common::types::StatementKind;
use sluice_engine::{Primitive, PrimitiveOps};

/// A compiled statement. Shared read-only by every caller that hits the cache.
#[derive(Debug)]
pub struct Plan {
    pub kind: StatementKind,
    pub root: Primitive,
    pub cache_key: String,
}

impl Plan {
    pub fn new(kind: StatementKind, root: Primitive, cache_key: impl Into<String>) -> Self {
        Self {
            kind,
            root,
            cache_key: cache_key.into(),
        }
    }

    pub fn needs_transaction(&self) -> bool {
        self.root.needs_transaction()
    }
}

const NIL: usize = usize::MAX;

struct Node {
    key: String,
    /// `None` once evicted, while the slot waits on the free list.
    plan: Option<Arc<Plan>>,
    prev: usize,
    next: usize,
}

/// Slab-backed doubly linked list in recency order (`head` = most recent).
struct LruInner {
    map: HashMap<String, usize>,
    nodes: Vec<Node>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    capacity: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl LruInner {
    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev == NIL {
            self.head = next;
        } else {
            self.nodes[prev].next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.nodes[next].prev = prev;
        }
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn evict_lru(&mut self) -> Option<String> {
        let idx = self.tail;
        if idx == NIL {
            return None;
        }
        self.unlink(idx);
        let key = std::mem::take(&mut self.nodes[idx].key);
        self.nodes[idx].plan = None;
        self.map.remove(&key);
        self.free.push(idx);
        self.evictions += 1;
        Some(key)
    }
}

/// Snapshot of plan cache statistics.
#[derive(Debug, Clone)]
pub struct PlanCacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub hit_rate_pct: f64,
}

/// Thread-safe LRU cache of compiled plans keyed by
/// `keyspace:normalized-sql[ shard-hint]`. Both `get` and `put` are O(1).
pub struct PlanCache {
    inner: Mutex<LruInner>,
    max_key_bytes: usize,
}

impl PlanCache {
    pub fn new(config: &PlanCacheConfig) -> Self {
        let capacity = config.effective_capacity().max(1);
        Self {
            inner: Mutex::new(LruInner {
                map: HashMap::with_capacity(capacity),
                nodes: Vec::new(),
                free: Vec::new(),
                head: NIL,
                tail: NIL,
                capacity,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
            max_key_bytes: config.max_key_bytes,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(&PlanCacheConfig {
            capacity,
            max_capacity: capacity,
            ..Default::default()
        })
    }

    /// Look up a plan and mark it most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<Plan>> {
        let mut inner = self.inner.lock();
        let found = match inner.map.get(key).copied() {
            Some(idx) => {
                inner.unlink(idx);
                inner.push_front(idx);
                inner.hits += 1;
                inner.nodes[idx].plan.clone()
            }
            None => {
                inner.misses += 1;
                None
            }
        };
        drop(inner);
        sluice_observability::record_plan_cache_lookup(found.is_some());
        found
    }

    /// Insert or replace a plan, evicting the least recently used entry when
    /// full. Keys longer than `max_key_bytes` are refused; returns whether
    /// the plan was stored.
    pub fn put(&self, key: &str, plan: Arc<Plan>) -> bool {
        if key.len() > self.max_key_bytes {
            tracing::debug!(key_bytes = key.len(), max = self.max_key_bytes, "plan cache key too long, not caching");
            return false;
        }
        let mut inner = self.inner.lock();
        if let Some(idx) = inner.map.get(key).copied() {
            inner.nodes[idx].plan = Some(plan);
            inner.unlink(idx);
            inner.push_front(idx);
            return true;
        }
        if inner.map.len() >= inner.capacity {
            if let Some(evicted) = inner.evict_lru() {
                tracing::debug!(key = %evicted, "plan cache evicted");
            }
        }
        let node = Node {
            key: key.to_string(),
            plan: Some(plan),
            prev: NIL,
            next: NIL,
        };
        let idx = match inner.free.pop() {
            Some(idx) => {
                inner.nodes[idx] = node;
                idx
            }
            None => {
                inner.nodes.push(node);
                inner.nodes.len() - 1
            }
        };
        inner.push_front(idx);
        inner.map.insert(key.to_string(), idx);
        let entries = inner.map.len();
        drop(inner);
        sluice_observability::record_plan_cache_size(entries);
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().capacity
    }

    /// Drop every plan. Called after DDL changes the schema plans were
    /// compiled against.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.map.len();
        inner.map.clear();
        inner.nodes.clear();
        inner.free.clear();
        inner.head = NIL;
        inner.tail = NIL;
        drop(inner);
        sluice_observability::record_plan_cache_size(0);
        tracing::info!(dropped, "plan cache cleared");
    }

    pub fn stats(&self) -> PlanCacheStats {
        let inner = self.inner.lock();
        let total = inner.hits + inner.misses;
        PlanCacheStats {
            entries: inner.map.len(),
            capacity: inner.capacity,
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            hit_rate_pct: if total > 0 {
                (inner.hits as f64 / total as f64) * 100.0
            } else {
                0.0
            },
        }
    }

    /// Keys from most to least recently used.
    pub fn keys(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.map.len());
        let mut idx = inner.head;
        while idx != NIL {
            out.push(inner.nodes[idx].key.clone());
            idx = inner.nodes[idx].next;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_engine::{Route, RouteOpcode};

    fn plan(key: &str) -> Arc<Plan> {
        let route = Route::new(RouteOpcode::Unsharded, "main", "select 1");
        Arc::new(Plan::new(StatementKind::Select, route.into(), key))
    }

    #[test]
    fn test_get_returns_same_plan() {
        let cache = PlanCache::with_capacity(4);
        let p = plan("main:select 1");
        assert!(cache.put("main:select 1", Arc::clone(&p)));
        let got = cache.get("main:select 1").unwrap();
        assert!(Arc::ptr_eq(&got, &p));
        assert!(cache.get("main:select 2").is_none());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate_pct - 50.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let cache = PlanCache::with_capacity(3);
        for k in ["a", "b", "c"] {
            cache.put(k, plan(k));
        }
        cache.get("a");
        cache.put("d", plan("d"));
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains("b"));
        assert_eq!(cache.keys(), vec!["d", "a", "c"]);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_replace_does_not_evict() {
        let cache = PlanCache::with_capacity(2);
        cache.put("a", plan("a"));
        cache.put("b", plan("b"));
        cache.put("a", plan("a2"));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").unwrap().cache_key, "a2");
        assert_eq!(cache.stats().evictions, 0);
    }

    #[test]
    fn test_slots_reused_after_eviction() {
        let cache = PlanCache::with_capacity(2);
        for i in 0..100 {
            let k = format!("k{i}");
            cache.put(&k, plan(&k));
        }
        assert_eq!(cache.keys(), vec!["k99", "k98"]);
        assert!(cache.inner.lock().nodes.len() <= 2);
    }

    #[test]
    fn test_evicted_plan_is_released() {
        let cache = PlanCache::with_capacity(2);
        let first = plan("a");
        cache.put("a", Arc::clone(&first));
        cache.put("b", plan("b"));
        assert_eq!(Arc::strong_count(&first), 2);
        cache.put("c", plan("c"));
        assert!(!cache.contains("a"));
        assert_eq!(Arc::strong_count(&first), 1);
        let inner = cache.inner.lock();
        assert!(inner.nodes.iter().all(|n| n.plan.is_some() == inner.map.contains_key(&n.key)));
    }

    #[test]
    fn test_oversized_key_refused() {
        let cache = PlanCache::new(&PlanCacheConfig {
            max_key_bytes: 8,
            ..Default::default()
        });
        assert!(!cache.put("main:select 1", plan("x")));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_capacity_clamped_and_clear() {
        let cache = PlanCache::new(&PlanCacheConfig {
            capacity: 100,
            max_capacity: 10,
            ..Default::default()
        });
        assert_eq!(cache.capacity(), 10);
        cache.put("a", plan("a"));
        cache.clear();
        assert!(cache.get("a").is_none());
        cache.put("b", plan("b"));
        assert_eq!(cache.keys(), vec!["b"]);
    }

    #[test]
    fn test_concurrent_get_put() {
        let cache = Arc::new(PlanCache::with_capacity(16));
        std::thread::scope(|s| {
            for t in 0..8 {
                let cache = Arc::clone(&cache);
                s.spawn(move || {
                    for i in 0..200 {
                        let k = format!("k{}", (i * 7 + t) % 32);
                        if cache.get(&k).is_none() {
                            cache.put(&k, plan(&k));
                        }
                    }
                });
            }
        });
        assert!(cache.len() <= 16);
        assert_eq!(cache.keys().len(), cache.len());
    }
}
