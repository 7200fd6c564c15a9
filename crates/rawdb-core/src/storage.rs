//! Single-writer storage state
//!
//! `Storage` is everything the executor thread owns: page caches, bound
//! files, the transaction logs and the proxy registry. Transactions borrow
//! it mutably for their whole run, so no page is ever touched concurrently.
//!
//! Page loading works in two modes. With caching enabled a loaded page joins
//! its type's LRU list and counts against the quota. With caching disabled
//! (bulk scans, batch operations) it goes to a bounded ring instead and is
//! dropped when the transaction ends; pages from the ring that still hold
//! changes are adopted into the cache rather than dropped.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::config::RawDbConfig;
use crate::error::{RawDbError, RawResult};
use crate::file_cache::{FileCache, FileSpec};
use crate::observer::RawDbObserver;
use crate::page::{Page, PageKey};
use crate::page_cache::PageCache;
#[cfg(any(test, feature = "fault-injection"))]
use crate::page_manager::FlushStage;
use crate::page_manager::PageManager;
use crate::platform_advice::ReadMode;
use crate::proxy::{PageProxy, ProxyRegistry};
use crate::region::Region;
use crate::stats::RawDbStats;
use crate::transaction::TxOptions;
use crate::txlog::{RecoveryReport, TransactionLog};

/// Executor-owned storage state.
pub struct Storage {
    config: Arc<RawDbConfig>,
    caches: Vec<PageCache>,
    pages: PageManager,
    proxies: ProxyRegistry,
    caching_enabled: bool,
    non_cached: VecDeque<PageKey>,
    non_cached_limit: usize,
    clear_pending: bool,
    epoch: u64,
    last_proxy_sweep: Instant,
    observer: Arc<dyn RawDbObserver>,
    stats: Arc<RawDbStats>,
}

impl Storage {
    /// Open the logs under the first configured path and recover from them.
    pub fn open(
        config: Arc<RawDbConfig>,
        observer: Arc<dyn RawDbObserver>,
        stats: Arc<RawDbStats>,
    ) -> RawResult<(Self, RecoveryReport)> {
        config.validate()?;
        let mut log = TransactionLog::open(config.primary_path())?;
        let report = log.recover();
        observer.on_recovery(&report);

        let files = FileCache::new(&config);
        let caches = config.page_types.iter().map(|t| PageCache::new(t, &config)).collect();
        let pages = PageManager::new(&config, files, log, Arc::clone(&stats), Arc::clone(&observer));
        let storage = Self {
            caches,
            pages,
            proxies: ProxyRegistry::new(),
            caching_enabled: true,
            non_cached: VecDeque::new(),
            non_cached_limit: config.non_cached_queue_size,
            clear_pending: false,
            epoch: 0,
            last_proxy_sweep: Instant::now(),
            observer,
            stats,
            config,
        };
        Ok((storage, report))
    }

    pub fn config(&self) -> &RawDbConfig {
        &self.config
    }

    pub fn files(&self) -> &FileCache {
        self.pages.files()
    }

    pub fn page_manager(&self) -> &PageManager {
        &self.pages
    }

    pub fn caches(&self) -> &[PageCache] {
        &self.caches
    }

    pub fn cache(&self, category: &str) -> Option<&PageCache> {
        self.caches.iter().find(|c| c.category() == category)
    }

    /// Incremented each time every cache is cleared.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn proxies(&self) -> &ProxyRegistry {
        &self.proxies
    }

    #[cfg(any(test, feature = "fault-injection"))]
    pub fn is_crashed(&self) -> bool {
        self.pages.is_crashed()
    }

    #[cfg(any(test, feature = "fault-injection"))]
    pub fn set_crash_point(&mut self, stage: Option<FlushStage>) {
        self.pages.set_crash_point(stage);
    }

    // ---- Transaction boundaries ----

    pub(crate) fn begin(&mut self, options: TxOptions) -> RawResult<()> {
        self.caching_enabled = true;
        self.non_cached_limit = self.config.non_cached_queue_size;
        self.pages.begin(options)
    }

    pub(crate) fn commit(&mut self, options: TxOptions) -> RawResult<()> {
        self.pages.commit(options)
    }

    pub(crate) fn rollback(&mut self, clear_cache: bool) {
        if self.pages.rollback(clear_cache, &mut self.caches) {
            self.clear_pending = true;
        }
    }

    /// Transaction epilogue: drop non-cached pages, run a pending cache clear,
    /// bring every cache back under its limit.
    pub(crate) fn end_transaction(&mut self, committed: bool) {
        self.drain_non_cached();
        if std::mem::take(&mut self.clear_pending) {
            self.clear_all();
        }
        for cache in &mut self.caches {
            if let Err(e) = cache.unload_excessive(&mut self.pages, 0) {
                tracing::warn!(category = %cache.category(), error = %e, "post-transaction eviction failed");
            }
        }
        self.caching_enabled = true;
        self.stats.record_transaction(committed);
        self.observer.on_transaction_completed(committed);
    }

    fn require_transaction(&self) -> RawResult<()> {
        if self.pages.in_transaction() {
            Ok(())
        } else {
            Err(RawDbError::TransactionMissing)
        }
    }

    // ---- Files ----

    /// Bind a data file. Inside a transaction the binding is transactional.
    pub fn bind_file(&mut self, file_index: u32, spec: &FileSpec) -> RawResult<bool> {
        let in_transaction = self.pages.in_transaction();
        let created = self.pages.files.bind(file_index, spec, &self.config, in_transaction)?;
        if created && in_transaction {
            self.pages.add_write_file(file_index, true);
        }
        Ok(created)
    }

    pub fn is_file_bound(&self, file_index: u32) -> bool {
        self.pages.files.contains(file_index)
    }

    pub fn file_size(&self, file_index: u32) -> RawResult<u64> {
        Ok(self.pages.files.get(file_index)?.size())
    }

    pub fn page_count(&self, file_index: u32) -> RawResult<u64> {
        Ok(self.pages.files.get(file_index)?.page_count())
    }

    pub fn delete_file(&mut self, file_index: u32) -> RawResult<()> {
        self.require_transaction()?;
        let file = self.pages.files.get(file_index)?;
        if file.is_read_only() {
            return Err(RawDbError::ReadOnly { what: format!("file {}", file.path().display()) });
        }
        // Evicted pages must reload correct content if the delete rolls back.
        if file.has_committed_pages() {
            self.pages.flush(true)?;
        }
        let resident = self.pages.files.get(file_index)?.loaded_indices();
        self.unload_file_pages(file_index, &resident);
        self.pages.files.get_mut(file_index)?.delete()?;
        self.pages.add_write_file(file_index, true);
        self.proxies.invalidate_file(file_index);
        tracing::debug!(file = file_index, "data file deleted");
        Ok(())
    }

    pub fn truncate_file(&mut self, file_index: u32, size: u64) -> RawResult<()> {
        self.require_transaction()?;
        if self.pages.files.get(file_index)?.has_committed_pages() {
            self.pages.flush(true)?;
        }
        let gone = self.pages.files.get_mut(file_index)?.truncate(size)?;
        self.unload_file_pages(file_index, &gone);
        self.pages.add_write_file(file_index, true);
        Ok(())
    }

    fn unload_file_pages(&mut self, file_index: u32, page_indices: &[u64]) {
        for page_index in page_indices {
            let key = PageKey::new(file_index, *page_index);
            let Some(page) = self.pages.files.raw_mut(file_index).and_then(|f| f.unload_page(*page_index)) else {
                continue;
            };
            self.release_page(key, page);
        }
    }

    fn release_page(&mut self, key: PageKey, page: Page) {
        let page_type = page.page_type();
        let (read, write) = page.into_regions();
        if let Some(cache) = self.caches.get_mut(page_type) {
            cache.remove_page(key);
            cache.release_regions(read, write);
        }
        self.stats.record_page_unloaded();
        self.observer.on_page_unloaded(key);
    }

    // ---- Pages ----

    /// Make `key` resident, loading it (and, for preload types, its whole file).
    fn load_page(&mut self, key: PageKey) -> RawResult<()> {
        let file = self.pages.files.get_mut(key.file_index)?;
        if let Some(page) = file.page_mut(key.page_index) {
            let cached = page.is_cached();
            let page_type = page.page_type();
            if cached {
                let generation = self.caches[page_type].refresh_index();
                let first = page.touch(Instant::now(), generation);
                self.caches[page_type].record_touch(key, first);
            } else {
                page.touch(Instant::now(), 0);
            }
            return Ok(());
        }

        if self.caching_enabled && file.needs_preload() {
            self.preload(key.file_index)?;
            if self.pages.files.get(key.file_index)?.page(key.page_index).is_some() {
                return Ok(());
            }
        }
        self.load_one(key, self.caching_enabled)
    }

    fn preload(&mut self, file_index: u32) -> RawResult<()> {
        let file = self.pages.files.get_mut(file_index)?;
        let count = file.page_count();
        file.mark_preloaded();
        file.set_read_mode(ReadMode::Sequential);
        tracing::debug!(file = file_index, pages = count, "preloading data file");
        let mut result = Ok(());
        for page_index in 0..count {
            let key = PageKey::new(file_index, page_index);
            if self.pages.files.get(file_index)?.page(page_index).is_some() {
                continue;
            }
            if let Err(e) = self.load_one(key, true) {
                result = Err(e);
                break;
            }
        }
        if let Some(file) = self.pages.files.raw_mut(file_index) {
            file.set_read_mode(ReadMode::Normal);
        }
        result
    }

    fn load_one(&mut self, key: PageKey, cached: bool) -> RawResult<()> {
        let file = self.pages.files.get(key.file_index)?;
        let page_type = file.page_type();
        let read_only = file.is_read_only();
        if cached {
            let incoming = self.caches[page_type].page_size();
            self.caches[page_type].unload_excessive(&mut self.pages, incoming)?;
        }

        let mut region = self.caches[page_type].acquire_region(key.file_index, key.page_index, false);
        let file = self.pages.files.get_mut(key.file_index)?;
        if let Err(e) = file.read_page(key.page_index, &mut region) {
            self.caches[page_type].regions_mut().0.add_owned(region);
            return Err(e);
        }
        file.insert_page(Page::new(key, page_type, region, read_only, cached));
        self.stats.record_page_loaded();
        self.observer.on_page_loaded(key);

        if cached {
            self.caches[page_type].add_loaded_page(key);
        } else {
            self.push_non_cached(key);
        }
        Ok(())
    }

    fn push_non_cached(&mut self, key: PageKey) {
        self.non_cached.push_back(key);
        while self.non_cached.len() > self.non_cached_limit {
            if let Some(oldest) = self.non_cached.pop_front() {
                self.drop_non_cached(oldest);
            }
        }
    }

    /// Drop a page loaded outside the cache, or adopt it if it still holds changes.
    fn drop_non_cached(&mut self, key: PageKey) {
        let Some(file) = self.pages.files.raw_mut(key.file_index) else {
            return;
        };
        let Some(page) = file.page_mut(key.page_index) else {
            return;
        };
        if page.is_cached() {
            return;
        }
        if page.is_evictable() {
            if let Some(page) = file.unload_page(key.page_index) {
                self.release_page(key, page);
            }
        } else {
            page.set_cached(true);
            let page_type = page.page_type();
            self.caches[page_type].add_loaded_page(key);
        }
    }

    fn drain_non_cached(&mut self) {
        while let Some(key) = self.non_cached.pop_front() {
            self.drop_non_cached(key);
        }
    }

    fn page(&self, key: PageKey) -> RawResult<&Page> {
        self.pages
            .files
            .get(key.file_index)?
            .page(key.page_index)
            .ok_or(RawDbError::PageNotFound { file_index: key.file_index, page_index: key.page_index })
    }

    /// Committed snapshot of a page.
    pub fn read_page(&mut self, key: PageKey) -> RawResult<Arc<Region>> {
        self.load_page(key)?;
        Ok(Arc::clone(self.page(key)?.read_region()))
    }

    /// What the running transaction sees of a page.
    pub fn current_page(&mut self, key: PageKey) -> RawResult<&Region> {
        self.load_page(key)?;
        Ok(self.page(key)?.current_region())
    }

    /// The transaction's private write region for a page.
    pub fn write_page(&mut self, key: PageKey) -> RawResult<&mut Region> {
        self.require_transaction()?;
        let file = self.pages.files.get_mut(key.file_index)?;
        let size = file.size();
        file.ensure_page_fits(key.page_index)?;
        if file.size() != size {
            self.pages.add_write_file(key.file_index, false);
        }
        self.load_page(key)?;
        self.pages.add_write_page(key);

        let page_type = self.page(key)?.page_type();
        let (pool, allocator) = self.caches[page_type].regions_mut();
        let page = self
            .pages
            .files
            .get_mut(key.file_index)?
            .page_mut(key.page_index)
            .ok_or(RawDbError::PageNotFound { file_index: key.file_index, page_index: key.page_index })?;
        let (region, _) = page.write_region(pool, allocator)?;
        Ok(region)
    }

    // ---- Proxies ----

    pub fn proxy(&mut self, key: PageKey) -> PageProxy {
        self.proxies.proxy(key, self.caching_enabled)
    }

    pub fn resolve(&mut self, proxy: &PageProxy) -> RawResult<&Region> {
        let key = proxy.key();
        if proxy.is_stale() {
            return Err(RawDbError::StalePage { file_index: key.file_index, page_index: key.page_index });
        }
        if proxy.is_cacheable() || !self.caching_enabled {
            self.current_page(key)
        } else {
            let caching = std::mem::replace(&mut self.caching_enabled, false);
            let loaded = self.load_page(key);
            self.caching_enabled = caching;
            loaded?;
            Ok(self.page(key)?.current_region())
        }
    }

    // ---- Caching controls ----

    pub fn set_page_caching_enabled(&mut self, enabled: bool) {
        self.caching_enabled = enabled;
    }

    pub fn is_page_caching_enabled(&self) -> bool {
        self.caching_enabled
    }

    /// Capacity of the ring of pages loaded with caching disabled.
    pub fn set_non_cached_limit(&mut self, limit: usize) {
        self.non_cached_limit = limit.max(1);
    }

    /// Change a page cache quota by category.
    pub fn set_cache_quota(&mut self, category: &str, bytes: u64) -> RawResult<()> {
        let mut found = false;
        for cache in self.caches.iter_mut().filter(|c| c.category() == category) {
            cache.set_quota(bytes);
            found = true;
        }
        if !found {
            return Err(RawDbError::Config { reason: format!("unknown page cache category '{}'", category) });
        }
        Ok(())
    }

    /// Narrow page caches by category for the duration of a batch run.
    pub fn set_batch_ceilings(&mut self, ceilings: &[(String, u64)]) {
        for cache in &mut self.caches {
            let ceiling = ceilings.iter().find(|(category, _)| category == cache.category()).map(|(_, b)| *b);
            cache.set_batch_ceiling(ceiling);
        }
    }

    pub fn relax_batch_ceilings(&mut self) {
        for cache in &mut self.caches {
            cache.set_batch_ceiling(None);
        }
    }

    // ---- Maintenance ----

    pub fn flush(&mut self, sync: bool) -> RawResult<()> {
        self.pages.flush(sync)
    }

    /// Periodic work between transactions: flush pacing, idle eviction,
    /// quota changes, proxy sweeps.
    pub fn on_timer(&mut self, now: Instant) -> RawResult<()> {
        self.pages.on_timer(now)?;
        for cache in &mut self.caches {
            cache.on_timer(&mut self.pages, now)?;
        }
        if now.saturating_duration_since(self.last_proxy_sweep) >= self.config.proxy_sweep_period {
            let swept = self.proxies.sweep();
            if swept > 0 {
                tracing::trace!(swept, "page proxies swept");
            }
            self.last_proxy_sweep = now;
        }
        Ok(())
    }

    /// Drop every cached page and recover the files from the logs.
    ///
    /// Committed pages are flushed first unless a big transaction already
    /// wrote uncommitted content, which recovery has to rewind.
    pub fn clear_all(&mut self) {
        let crashed = self.pages.is_crashed();
        if !self.pages.is_big_transaction() && !crashed {
            if let Err(e) = self.pages.flush(true) {
                tracing::error!(error = %e, "flush before cache clear failed");
            }
        }
        drop(self.pages.files.close_files());
        for cache in &mut self.caches {
            cache.clear();
        }
        self.non_cached.clear();
        self.proxies.invalidate_all();
        if !crashed {
            let report = self.pages.log.recover();
            self.observer.on_recovery(&report);
        }
        drop(self.pages.files.reset_all());
        self.pages.reset();
        self.epoch += 1;
        self.stats.record_cache_clear();
        self.observer.on_cache_cleared();
        tracing::info!(epoch = self.epoch, "page caches cleared");
    }

    /// Flush and close every file. Temporary files are removed.
    pub fn close(&mut self) {
        let crashed = self.pages.is_crashed();
        if !crashed {
            if let Err(e) = self.pages.flush(true) {
                tracing::error!(error = %e, "final flush failed");
            }
        }
        drop(self.pages.files.close_all(!crashed));
        for cache in &mut self.caches {
            cache.clear();
        }
        self.proxies.invalidate_all();
        self.non_cached.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use crate::region::RegionRead;
    use tempfile::TempDir;

    fn open(dir: &std::path::Path, max_pages: u64) -> Storage {
        let mut config = RawDbConfig::small(dir);
        config.page_types[0].page_size = 128;
        config.page_types[0].max_cache_size = 128 * max_pages;
        config.non_cached_queue_size = 4;
        let (mut storage, _) =
            Storage::open(Arc::new(config), Arc::new(NoopObserver), Arc::new(RawDbStats::new())).unwrap();
        storage.bind_file(1, &FileSpec::new("one.db", 0)).unwrap();
        storage
    }

    fn write(storage: &mut Storage, key: PageKey, byte: u8, options: TxOptions) {
        storage.begin(options).unwrap();
        storage.write_page(key).unwrap().fill(byte);
        storage.commit(options).unwrap();
        storage.end_transaction(true);
    }

    #[test]
    fn test_write_outside_transaction_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut storage = open(tmp.path(), 8);
        assert!(matches!(storage.write_page(PageKey::new(1, 0)), Err(RawDbError::TransactionMissing)));
        assert!(matches!(storage.delete_file(1), Err(RawDbError::TransactionMissing)));
    }

    #[test]
    fn test_snapshot_survives_commit() {
        let tmp = TempDir::new().unwrap();
        let mut storage = open(tmp.path(), 8);
        let key = PageKey::new(1, 0);
        write(&mut storage, key, 1, TxOptions::NONE);
        let before = storage.read_page(key).unwrap();

        storage.begin(TxOptions::NONE).unwrap();
        storage.write_page(key).unwrap().fill(2);
        assert_eq!(storage.read_page(key).unwrap().read_u8(0), 1);
        assert_eq!(storage.current_page(key).unwrap().read_u8(0), 2);
        storage.commit(TxOptions::NONE).unwrap();
        storage.end_transaction(true);

        assert_eq!(before.read_u8(0), 1);
        assert_eq!(storage.read_page(key).unwrap().read_u8(0), 2);
    }

    #[test]
    fn test_cache_stays_within_quota() {
        let tmp = TempDir::new().unwrap();
        let mut storage = open(tmp.path(), 10);
        for i in 0..50 {
            write(&mut storage, PageKey::new(1, i), i as u8, TxOptions::FLUSH);
        }
        for i in 0..50 {
            storage.read_page(PageKey::new(1, i)).unwrap();
        }
        let cache = &storage.caches()[0];
        assert!(cache.len() <= 10);
        let resident = cache.keys();
        for i in 40..50 {
            assert!(resident.contains(&PageKey::new(1, i)), "page {} should be resident", i);
        }
    }

    #[test]
    fn test_non_cached_pages_dropped_at_end() {
        let tmp = TempDir::new().unwrap();
        let mut storage = open(tmp.path(), 16);
        for i in 0..8 {
            write(&mut storage, PageKey::new(1, i), 9, TxOptions::FLUSH);
        }
        storage.clear_all();

        storage.begin(TxOptions::READ_ONLY).unwrap();
        storage.set_page_caching_enabled(false);
        for i in 0..8 {
            assert_eq!(storage.read_page(PageKey::new(1, i)).unwrap().read_u8(0), 9);
        }
        assert!(storage.files().get(1).unwrap().loaded_count() <= 4);
        storage.commit(TxOptions::READ_ONLY).unwrap();
        storage.end_transaction(true);

        assert_eq!(storage.files().get(1).unwrap().loaded_count(), 0);
        assert!(storage.is_page_caching_enabled());
    }

    #[test]
    fn test_rollback_of_delete_restores_file() {
        let tmp = TempDir::new().unwrap();
        let mut storage = open(tmp.path(), 8);
        let key = PageKey::new(1, 0);
        write(&mut storage, key, 5, TxOptions::NONE);

        storage.begin(TxOptions::NONE).unwrap();
        storage.delete_file(1).unwrap();
        assert!(matches!(storage.read_page(key), Err(RawDbError::FileNotFound { .. })));
        storage.rollback(false);
        storage.end_transaction(false);

        assert_eq!(storage.read_page(key).unwrap().read_u8(0), 5);
        assert!(tmp.path().join("one.db").exists());
    }

    #[test]
    fn test_committed_delete_removes_file() {
        let tmp = TempDir::new().unwrap();
        let mut storage = open(tmp.path(), 8);
        write(&mut storage, PageKey::new(1, 0), 5, TxOptions::FLUSH);
        assert!(tmp.path().join("one.db").exists());

        storage.begin(TxOptions::NONE).unwrap();
        storage.delete_file(1).unwrap();
        storage.commit(TxOptions::NONE).unwrap();
        storage.end_transaction(true);

        assert!(!tmp.path().join("one.db").exists());
        assert!(!storage.is_file_bound(1));
    }

    #[test]
    fn test_truncate_drops_tail_pages() {
        let tmp = TempDir::new().unwrap();
        let mut storage = open(tmp.path(), 8);
        for i in 0..4 {
            write(&mut storage, PageKey::new(1, i), 3, TxOptions::NONE);
        }
        storage.begin(TxOptions::NONE).unwrap();
        storage.truncate_file(1, 130).unwrap();
        storage.commit(TxOptions::NONE).unwrap();
        storage.end_transaction(true);

        assert_eq!(storage.file_size(1).unwrap(), 256);
        assert_eq!(std::fs::metadata(tmp.path().join("one.db")).unwrap().len(), 256);
        assert_eq!(storage.read_page(PageKey::new(1, 3)).unwrap().read_u8(0), 0);
    }

    #[test]
    fn test_clear_cache_rollback_recovers() {
        let tmp = TempDir::new().unwrap();
        let mut storage = open(tmp.path(), 8);
        let key = PageKey::new(1, 0);
        write(&mut storage, key, 4, TxOptions::NONE);
        let proxy = storage.proxy(key);

        storage.begin(TxOptions::NONE).unwrap();
        storage.write_page(key).unwrap().fill(8);
        storage.rollback(true);
        storage.end_transaction(false);

        assert_eq!(storage.epoch(), 1);
        assert!(proxy.is_stale());
        assert_eq!(storage.read_page(key).unwrap().read_u8(0), 4);
        assert!(storage.page_manager().log.is_empty());
    }

    #[test]
    fn test_unknown_quota_category() {
        let tmp = TempDir::new().unwrap();
        let mut storage = open(tmp.path(), 8);
        assert!(storage.set_cache_quota("default", 128 * 32).is_ok());
        assert!(matches!(storage.set_cache_quota("nope", 1), Err(RawDbError::Config { .. })));
    }
}
