//! Quota-governed page cache for one page type
//!
//! The cache does not own pages: they live in their data files. It owns the
//! LRU order, the resident size accounting, and the region pool pages of its
//! type draw their memory from. Eviction goes through [`PageHost`], which
//! knows page state and can flush.
//!
//! # Eviction
//!
//! `unload_excessive` unloads the LRU head while the cache is over its limit.
//! When the head cannot go (modified, committed or flushing) it falls back to
//! `unload_pages(exceeds = true)`: flush everything committed, then walk the
//! list from the cold end, evicting idle pages and whatever else is needed to
//! drain the cache to `min_cache_percent` of its limit. Pages the running
//! transaction modified are written out under undo protection before they go.
//!
//! # Quota changes
//!
//! Raising the quota applies at once. Lowering it is prepared and applied
//! `quota_change_delay` after the next timer tick, so a transient dip does
//! not throw hot pages away.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::config::{PageTypeConfig, RawDbConfig};
use crate::error::RawResult;
use crate::page::PageKey;
use crate::region::Region;
use crate::region_pool::{acquire_region, RegionAllocator, RegionPool};

/// Eviction-relevant state of a resident page.
#[derive(Debug, Clone, Copy)]
pub struct PageStatus {
    pub modified: bool,
    pub committed: bool,
    pub flushing: bool,
    pub last_access: Instant,
}

impl PageStatus {
    pub fn is_evictable(&self) -> bool {
        !self.modified && !self.committed && !self.flushing
    }
}

/// What the cache needs from the rest of the storage to evict pages.
pub trait PageHost {
    /// State of a resident page, `None` if the page is gone.
    fn status(&self, key: PageKey) -> Option<PageStatus>;

    /// Drop an evictable page from memory and hand back its regions.
    fn unload(&mut self, key: PageKey) -> Option<(Arc<Region>, Option<Region>)>;

    /// Flush all committed pages to disk.
    fn flush_all(&mut self) -> RawResult<()>;

    /// Write out a page the running transaction modified so it can be evicted.
    fn flush_modified(&mut self, key: PageKey) -> RawResult<()>;
}

#[derive(Debug, Clone, Copy, Default)]
struct Links {
    prev: Option<PageKey>,
    next: Option<PageKey>,
}

/// Doubly linked list threaded through a hash map, head = least recently used.
#[derive(Debug, Default)]
struct LruList {
    links: HashMap<PageKey, Links>,
    head: Option<PageKey>,
    tail: Option<PageKey>,
}

impl LruList {
    fn contains(&self, key: PageKey) -> bool {
        self.links.contains_key(&key)
    }

    fn len(&self) -> usize {
        self.links.len()
    }

    fn head(&self) -> Option<PageKey> {
        self.head
    }

    fn next(&self, key: PageKey) -> Option<PageKey> {
        self.links.get(&key).and_then(|l| l.next)
    }

    fn push_back(&mut self, key: PageKey) -> bool {
        if self.links.contains_key(&key) {
            return false;
        }
        let links = Links { prev: self.tail, next: None };
        match self.tail {
            Some(tail) => {
                if let Some(t) = self.links.get_mut(&tail) {
                    t.next = Some(key);
                }
            }
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.links.insert(key, links);
        true
    }

    fn remove(&mut self, key: PageKey) -> bool {
        let Some(links) = self.links.remove(&key) else {
            return false;
        };
        match links.prev {
            Some(prev) => {
                if let Some(p) = self.links.get_mut(&prev) {
                    p.next = links.next;
                }
            }
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => {
                if let Some(n) = self.links.get_mut(&next) {
                    n.prev = links.prev;
                }
            }
            None => self.tail = links.prev,
        }
        true
    }

    fn move_to_back(&mut self, key: PageKey) {
        if self.tail != Some(key) && self.remove(key) {
            self.push_back(key);
        }
    }

    fn keys(&self) -> Vec<PageKey> {
        let mut out = Vec::with_capacity(self.links.len());
        let mut cursor = self.head;
        while let Some(key) = cursor {
            out.push(key);
            cursor = self.next(key);
        }
        out
    }

    fn clear(&mut self) {
        self.links.clear();
        self.head = None;
        self.tail = None;
    }
}

#[derive(Debug, Clone, Copy)]
struct PreparedQuota {
    bytes: u64,
    due: Option<Instant>,
}

/// LRU page cache for one `(category, page_size)`.
#[derive(Debug)]
pub struct PageCache {
    category: String,
    page_size: u64,
    lru: LruList,
    size: u64,
    max_size: u64,
    batch_ceiling: Option<u64>,
    prepared_quota: Option<PreparedQuota>,
    quota_change_delay: Duration,
    max_idle: Duration,
    min_cache_percent: u64,
    refresh_index: u64,
    touched_bytes: u64,
    allocator: RegionAllocator,
    pool: RegionPool,
}

impl PageCache {
    pub fn new(page_type: &PageTypeConfig, config: &RawDbConfig) -> Self {
        Self {
            category: page_type.category.clone(),
            page_size: page_type.page_size as u64,
            lru: LruList::default(),
            size: 0,
            max_size: page_type.max_cache_size,
            batch_ceiling: None,
            prepared_quota: None,
            quota_change_delay: config.quota_change_delay,
            max_idle: config.max_idle_period,
            min_cache_percent: config.min_cache_percent,
            refresh_index: 1,
            touched_bytes: 0,
            allocator: RegionAllocator::new(page_type.memory, page_type.page_size),
            pool: RegionPool::new(page_type.pool_size),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Resident bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Resident page count.
    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.len() == 0
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// The limit eviction enforces: the quota, narrowed by any batch ceiling.
    pub fn effective_max(&self) -> u64 {
        match self.batch_ceiling {
            Some(ceiling) => ceiling.min(self.max_size),
            None => self.max_size,
        }
    }

    pub fn contains(&self, key: PageKey) -> bool {
        self.lru.contains(key)
    }

    /// Resident keys from least to most recently used.
    pub fn keys(&self) -> Vec<PageKey> {
        self.lru.keys()
    }

    pub fn refresh_index(&self) -> u64 {
        self.refresh_index
    }

    /// Take a region for a page about to load.
    pub fn acquire_region(&mut self, file_index: u32, page_index: u64, read_only: bool) -> Region {
        acquire_region(&mut self.pool, &mut self.allocator, file_index, page_index, read_only)
    }

    /// Return the regions of an unloaded page for reuse.
    pub fn release_regions(&mut self, read: Arc<Region>, write: Option<Region>) {
        if let Some(write) = write {
            self.pool.add_owned(write);
        }
        self.pool.add(read);
    }

    /// Pool and allocator, for creating write regions.
    pub fn regions_mut(&mut self) -> (&mut RegionPool, &mut RegionAllocator) {
        (&mut self.pool, &mut self.allocator)
    }

    pub fn pool(&self) -> &RegionPool {
        &self.pool
    }

    pub fn add_loaded_page(&mut self, key: PageKey) {
        if self.lru.push_back(key) {
            self.size += self.page_size;
        }
    }

    pub fn remove_page(&mut self, key: PageKey) -> bool {
        let removed = self.lru.remove(key);
        if removed {
            self.size -= self.page_size;
        }
        removed
    }

    /// Record an access to a resident page.
    ///
    /// `first_in_generation` comes from the page itself. Only the first touch
    /// in a refresh generation moves the page; once enough distinct pages were
    /// touched the generation advances.
    pub fn record_touch(&mut self, key: PageKey, first_in_generation: bool) {
        if !first_in_generation {
            return;
        }
        self.lru.move_to_back(key);
        self.touched_bytes += self.page_size;
        if self.touched_bytes.saturating_mul(10) >= self.effective_max().max(self.page_size) {
            self.refresh_index += 1;
            self.touched_bytes = 0;
        }
    }

    /// Change the quota. Raising applies now; lowering waits for the delay.
    pub fn set_quota(&mut self, bytes: u64) {
        if bytes >= self.max_size {
            self.max_size = bytes;
            self.prepared_quota = None;
            tracing::debug!(category = %self.category, bytes, "page cache quota raised");
        } else {
            self.prepared_quota = Some(PreparedQuota { bytes, due: None });
            tracing::debug!(category = %self.category, bytes, "page cache quota lowering prepared");
        }
    }

    /// Quota waiting to be applied, if any.
    pub fn prepared_quota(&self) -> Option<u64> {
        self.prepared_quota.map(|q| q.bytes)
    }

    /// Narrow (or with `None`, relax) the limit on behalf of a batch operation.
    pub fn set_batch_ceiling(&mut self, ceiling: Option<u64>) {
        self.batch_ceiling = ceiling;
    }

    pub fn batch_ceiling(&self) -> Option<u64> {
        self.batch_ceiling
    }

    /// Evict until `size + incoming` fits the limit, or nothing more can go.
    ///
    /// Returns the number of pages unloaded.
    pub fn unload_excessive(&mut self, host: &mut impl PageHost, incoming: u64) -> RawResult<usize> {
        let mut unloaded = 0;
        while self.size + incoming > self.effective_max() && !self.lru.links.is_empty() {
            if self.unload_page(host) {
                unloaded += 1;
                continue;
            }
            unloaded += self.unload_pages(host, true, incoming)?;
            break;
        }
        Ok(unloaded)
    }

    /// Try to unload the least recently used page.
    fn unload_page(&mut self, host: &mut impl PageHost) -> bool {
        let Some(key) = self.lru.head() else {
            return false;
        };
        match host.status(key) {
            None => {
                self.remove_page(key);
                true
            }
            Some(status) if status.is_evictable() => {
                self.evict(host, key);
                true
            }
            Some(_) => false,
        }
    }

    /// Walk the list from the cold end evicting idle pages, and when
    /// `exceeds`, whatever it takes to get down to `min_cache_percent`.
    fn unload_pages(&mut self, host: &mut impl PageHost, exceeds: bool, incoming: u64) -> RawResult<usize> {
        if exceeds {
            host.flush_all()?;
        }
        let now = Instant::now();
        let target = self.effective_max().saturating_mul(self.min_cache_percent) / 100;
        let mut unloaded = 0;
        let mut cursor = self.lru.head();

        while let Some(key) = cursor {
            cursor = self.lru.next(key);
            let Some(status) = host.status(key) else {
                self.remove_page(key);
                continue;
            };
            let idle = now.saturating_duration_since(status.last_access) >= self.max_idle;
            let needed = exceeds && self.size + incoming > target;
            if !idle && !needed {
                if exceeds {
                    break;
                }
                continue;
            }
            if status.flushing || (status.committed && !status.modified) {
                continue;
            }
            if status.modified {
                if !exceeds {
                    continue;
                }
                host.flush_modified(key)?;
            }
            self.evict(host, key);
            unloaded += 1;
        }
        Ok(unloaded)
    }

    fn evict(&mut self, host: &mut impl PageHost, key: PageKey) {
        self.remove_page(key);
        if let Some((read, write)) = host.unload(key) {
            self.release_regions(read, write);
        }
    }

    /// Timer tick: apply a due quota change and evict idle pages.
    pub fn on_timer(&mut self, host: &mut impl PageHost, now: Instant) -> RawResult<()> {
        if let Some(prepared) = self.prepared_quota.as_mut() {
            match prepared.due {
                None => prepared.due = Some(now + self.quota_change_delay),
                Some(due) if now >= due => {
                    self.max_size = prepared.bytes;
                    self.prepared_quota = None;
                    tracing::info!(category = %self.category, bytes = self.max_size, "page cache quota lowered");
                    self.unload_excessive(host, 0)?;
                }
                Some(_) => {}
            }
        }
        self.unload_pages(host, false, 0)?;
        Ok(())
    }

    /// Forget every resident page and pooled region.
    pub fn clear(&mut self) {
        self.lru.clear();
        self.size = 0;
        self.touched_bytes = 0;
        self.refresh_index += 1;
        self.pool.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionMemoryKind;

    #[derive(Default)]
    struct MockHost {
        pages: HashMap<PageKey, PageStatus>,
        unloaded: Vec<PageKey>,
        flush_all_calls: usize,
        flushed_modified: Vec<PageKey>,
    }

    impl MockHost {
        fn load(&mut self, cache: &mut PageCache, key: PageKey) {
            self.pages.insert(
                key,
                PageStatus { modified: false, committed: false, flushing: false, last_access: Instant::now() },
            );
            cache.unload_excessive(self, cache.page_size()).unwrap();
            cache.add_loaded_page(key);
        }
    }

    impl PageHost for MockHost {
        fn status(&self, key: PageKey) -> Option<PageStatus> {
            self.pages.get(&key).copied()
        }

        fn unload(&mut self, key: PageKey) -> Option<(Arc<Region>, Option<Region>)> {
            self.pages.remove(&key);
            self.unloaded.push(key);
            None
        }

        fn flush_all(&mut self) -> RawResult<()> {
            self.flush_all_calls += 1;
            for status in self.pages.values_mut() {
                status.committed = false;
            }
            Ok(())
        }

        fn flush_modified(&mut self, key: PageKey) -> RawResult<()> {
            self.flushed_modified.push(key);
            if let Some(status) = self.pages.get_mut(&key) {
                status.modified = false;
            }
            Ok(())
        }
    }

    fn cache(max_pages: u64) -> PageCache {
        let mut config = RawDbConfig::small("/tmp/unused");
        config.page_types[0] = PageTypeConfig {
            max_cache_size: max_pages * 64,
            memory: RegionMemoryKind::Heap,
            ..PageTypeConfig::new("test", 64)
        };
        config.max_idle_period = Duration::from_secs(3600);
        config.quota_change_delay = Duration::from_millis(0);
        PageCache::new(&config.page_types[0], &config)
    }

    #[test]
    fn test_sequential_loads_keep_most_recent() {
        let mut cache = cache(10);
        let mut host = MockHost::default();
        for i in 0..50 {
            host.load(&mut cache, PageKey::new(0, i));
        }
        assert_eq!(cache.len(), 10);
        assert!(cache.size() <= cache.max_size());
        let resident: Vec<u64> = cache.keys().iter().map(|k| k.page_index).collect();
        assert_eq!(resident, (40..50).collect::<Vec<_>>());
    }

    #[test]
    fn test_touch_protects_hot_page() {
        let mut cache = cache(3);
        let mut host = MockHost::default();
        for i in 0..3 {
            host.load(&mut cache, PageKey::new(0, i));
        }
        cache.record_touch(PageKey::new(0, 0), true);
        host.load(&mut cache, PageKey::new(0, 3));
        assert!(cache.contains(PageKey::new(0, 0)));
        assert!(!cache.contains(PageKey::new(0, 1)));
    }

    #[test]
    fn test_repeat_touch_in_generation_does_not_move() {
        let mut cache = cache(3);
        let mut host = MockHost::default();
        for i in 0..3 {
            host.load(&mut cache, PageKey::new(0, i));
        }
        cache.record_touch(PageKey::new(0, 0), false);
        assert_eq!(cache.keys()[0], PageKey::new(0, 0));
    }

    #[test]
    fn test_committed_head_forces_flush_then_evicts() {
        let mut cache = cache(4);
        let mut host = MockHost::default();
        for i in 0..4 {
            host.load(&mut cache, PageKey::new(0, i));
        }
        for status in host.pages.values_mut() {
            status.committed = true;
        }
        cache.set_batch_ceiling(Some(2 * 64));
        cache.unload_excessive(&mut host, 0).unwrap();

        assert_eq!(host.flush_all_calls, 1);
        assert!(cache.size() <= cache.effective_max());
    }

    #[test]
    fn test_modified_pages_flushed_before_eviction() {
        let mut cache = cache(4);
        let mut host = MockHost::default();
        for i in 0..4 {
            host.load(&mut cache, PageKey::new(0, i));
        }
        for status in host.pages.values_mut() {
            status.modified = true;
        }
        cache.set_quota(64);
        // lowering waits for the timer
        assert_eq!(cache.max_size(), 4 * 64);
        cache.on_timer(&mut host, Instant::now()).unwrap();
        cache.on_timer(&mut host, Instant::now()).unwrap();

        assert_eq!(cache.max_size(), 64);
        assert!(cache.size() <= 64);
        assert!(!host.flushed_modified.is_empty());
    }

    #[test]
    fn test_flushing_pages_never_evicted() {
        let mut cache = cache(2);
        let mut host = MockHost::default();
        host.load(&mut cache, PageKey::new(0, 0));
        host.load(&mut cache, PageKey::new(0, 1));
        for status in host.pages.values_mut() {
            status.flushing = true;
        }
        cache.set_batch_ceiling(Some(64));
        cache.unload_excessive(&mut host, 0).unwrap();
        assert_eq!(cache.len(), 2);
        assert!(host.unloaded.is_empty());
    }

    #[test]
    fn test_raising_quota_cancels_pending_lowering() {
        let mut cache = cache(4);
        cache.set_quota(64);
        assert_eq!(cache.prepared_quota(), Some(64));
        cache.set_quota(8 * 64);
        assert_eq!(cache.prepared_quota(), None);
        assert_eq!(cache.max_size(), 8 * 64);
    }

    #[test]
    fn test_lowered_quota_waits_for_delay() {
        let mut config = RawDbConfig::small("/tmp/unused");
        config.page_types[0] = PageTypeConfig { max_cache_size: 640, ..PageTypeConfig::new("t", 64) };
        config.quota_change_delay = Duration::from_secs(60);
        let mut cache = PageCache::new(&config.page_types[0], &config);
        let mut host = MockHost::default();

        cache.set_quota(64);
        let now = Instant::now();
        cache.on_timer(&mut host, now).unwrap();
        cache.on_timer(&mut host, now + Duration::from_secs(1)).unwrap();
        assert_eq!(cache.max_size(), 640);
        cache.on_timer(&mut host, now + Duration::from_secs(61)).unwrap();
        assert_eq!(cache.max_size(), 64);
    }

    #[test]
    fn test_idle_pages_evicted_on_timer() {
        let mut cache = cache(8);
        cache.max_idle = Duration::from_millis(0);
        let mut host = MockHost::default();
        host.load(&mut cache, PageKey::new(1, 0));
        host.load(&mut cache, PageKey::new(1, 1));
        cache.on_timer(&mut host, Instant::now()).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_lru_list_unlinks_middle() {
        let mut list = LruList::default();
        for i in 0..3 {
            list.push_back(PageKey::new(0, i));
        }
        list.remove(PageKey::new(0, 1));
        assert_eq!(list.keys(), vec![PageKey::new(0, 0), PageKey::new(0, 2)]);
        list.move_to_back(PageKey::new(0, 0));
        assert_eq!(list.keys(), vec![PageKey::new(0, 2), PageKey::new(0, 0)]);
        assert_eq!(list.tail, Some(PageKey::new(0, 0)));
    }
}
