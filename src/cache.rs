//! Bounded LRU cache of clean, committed page images.
//!
//! Recency is tracked with a monotonically increasing access tick: the map
//! holds `page_id -> (page, tick)` and an ordered index `tick -> page_id`
//! gives the eviction candidate (smallest tick) in `O(log n)`.

use std::{
    collections::{BTreeMap, HashMap},
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

use crate::page::{Page, PageId};

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicUsize,
    pub misses: AtomicUsize,
    pub evictions: AtomicUsize,
}

impl CacheStats {
    pub fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }

    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
    }

    pub fn hit_rate(&self) -> f64 {
        let (hits, misses) = self.get();
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            (hits as f64 / total as f64) * 100.0
        }
    }
}

#[derive(Debug)]
struct LruState {
    entries: HashMap<PageId, (Page, u64)>,
    recency: BTreeMap<u64, PageId>,
    tick: u64,
}

impl LruState {
    fn touch(&mut self, page_id: PageId) {
        self.tick += 1;
        let tick = self.tick;
        if let Some((_, old_tick)) = self.entries.get_mut(&page_id) {
            self.recency.remove(old_tick);
            *old_tick = tick;
            self.recency.insert(tick, page_id);
        }
    }
}

#[derive(Debug)]
pub struct PageCache {
    capacity: usize,
    state: Mutex<LruState>,
    stats: CacheStats,
}

impl PageCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(LruState {
                entries: HashMap::with_capacity(capacity),
                recency: BTreeMap::new(),
                tick: 0,
            }),
            stats: CacheStats::default(),
        }
    }

    /// Look up a page, promoting it to most recently used on a hit.
    pub fn get(&self, page_id: PageId) -> Option<Page> {
        let mut state = self.state.lock();
        let page = state.entries.get(&page_id).map(|(page, _)| page.clone());
        match page {
            Some(page) => {
                state.touch(page_id);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Some(page)
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace a page, evicting the least recently used entry when full.
    pub fn insert(&self, page_id: PageId, page: Page) {
        let mut state = self.state.lock();
        if let Some((existing, _)) = state.entries.get_mut(&page_id) {
            *existing = page;
            state.touch(page_id);
            return;
        }
        if state.entries.len() >= self.capacity {
            let victim = state.recency.pop_first();
            if let Some((_, victim_id)) = victim {
                state.entries.remove(&victim_id);
                self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        state.tick += 1;
        let tick = state.tick;
        state.entries.insert(page_id, (page, tick));
        state.recency.insert(tick, page_id);
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}
