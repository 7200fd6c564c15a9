//! Pages: the unit of file storage
//!
//! A page always holds a shared, immutable read region. While the active
//! transaction modifies it, it additionally owns a private write region; commit
//! freezes the write region into the new read region, rollback drops it.
//!
//! Committed content that has not reached disk yet is tracked through
//! `saved_region`: the before-image the next flush logs to the undo log.
//!
//! ```text
//! Clean(read) --write--> Modified(read, write) --commit--> Committed(read', saved=read)
//!                                 |                                  |
//!                                 +--rollback--> Clean(read)          +--flush--> Clean(read')
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use crate::error::{RawDbError, RawResult};
use crate::region::Region;
use crate::region_pool::{to_write_region, RegionAllocator, RegionPool};

/// Stable identity of a page: `(file_index, page_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageKey {
    pub file_index: u32,
    pub page_index: u64,
}

impl PageKey {
    pub const fn new(file_index: u32, page_index: u64) -> Self {
        Self { file_index, page_index }
    }
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file_index, self.page_index)
    }
}

/// One page queued for writing by a flush.
#[derive(Debug)]
pub struct FlushInfo {
    pub key: PageKey,
    /// Content currently on disk, logged to the undo log before overwriting
    pub saved: Option<Arc<Region>>,
    /// Content to write
    pub region: Arc<Region>,
}

impl FlushInfo {
    /// Mark both images as read by an in-flight flush.
    pub fn begin(&self) {
        self.region.set_flushing(true);
        if let Some(saved) = &self.saved {
            saved.set_saved_flushing(true);
        }
    }

    /// Release both images once the flush has written them.
    pub fn end(&self) {
        self.region.set_flushing(false);
        if let Some(saved) = &self.saved {
            saved.set_saved_flushing(false);
        }
    }
}

/// A cached page.
pub struct Page {
    key: PageKey,
    page_type: usize,
    read_region: Arc<Region>,
    write_region: Option<Region>,
    saved_region: Option<Arc<Region>>,
    committed: bool,
    cached: bool,
    read_only: bool,
    last_access: Instant,
    refresh_index: u64,
}

impl Page {
    /// Wrap a freshly loaded region.
    pub fn new(key: PageKey, page_type: usize, region: Region, read_only: bool, cached: bool) -> Self {
        let region = if region.is_read_only() { region } else { region.into_read_only() };
        Self {
            key,
            page_type,
            read_region: Arc::new(region),
            write_region: None,
            saved_region: None,
            committed: false,
            cached,
            read_only,
            last_access: Instant::now(),
            refresh_index: 0,
        }
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn page_type(&self) -> usize {
        self.page_type
    }

    /// Committed snapshot. Holders keep seeing it even after later commits.
    pub fn read_region(&self) -> &Arc<Region> {
        &self.read_region
    }

    /// What the active transaction sees: its own writes, else the committed snapshot.
    pub fn current_region(&self) -> &Region {
        self.write_region.as_ref().unwrap_or(&self.read_region)
    }

    /// The private write region, created on first request in a transaction.
    ///
    /// Returns `true` in the second slot when the region was just created,
    /// so the caller can register the page as written.
    pub fn write_region(
        &mut self,
        pool: &mut RegionPool,
        allocator: &mut RegionAllocator,
    ) -> RawResult<(&mut Region, bool)> {
        if self.read_only {
            return Err(RawDbError::ReadOnly { what: format!("page {}", self.key) });
        }
        let created = self.write_region.is_none();
        let read = &self.read_region;
        let region = self
            .write_region
            .get_or_insert_with(|| to_write_region(read, pool, allocator));
        Ok((region, created))
    }

    /// Modified by the active transaction.
    pub fn is_modified(&self) -> bool {
        self.write_region.is_some()
    }

    /// Holds committed content that has not been flushed.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    pub fn is_flushing(&self) -> bool {
        self.read_region.is_flushing() || self.saved_region.as_ref().map_or(false, |r| r.is_flushing())
    }

    /// Safe to drop from memory without losing anything.
    pub fn is_evictable(&self) -> bool {
        !self.is_modified() && !self.committed && !self.is_flushing()
    }

    /// Promote the write region to the read region.
    ///
    /// Returns `true` when the page actually changed. The first commit after a
    /// flush keeps the previous read region as the before-image.
    pub fn commit(&mut self) -> bool {
        let Some(write) = self.write_region.take() else {
            return false;
        };
        let previous = std::mem::replace(&mut self.read_region, Arc::new(write.into_read_only()));
        if self.saved_region.is_none() {
            self.saved_region = Some(previous);
        }
        self.committed = true;
        true
    }

    /// Discard the write region, handing it back for reuse.
    pub fn rollback(&mut self) -> Option<Region> {
        self.write_region.take()
    }

    /// Produce the flush descriptor for committed content.
    ///
    /// Only the first call after a commit yields a descriptor; later calls
    /// return `None` until the page is committed again.
    pub fn flush(&mut self) -> Option<FlushInfo> {
        if !self.committed {
            return None;
        }
        self.committed = false;
        Some(FlushInfo {
            key: self.key,
            saved: self.saved_region.take(),
            region: Arc::clone(&self.read_region),
        })
    }

    /// Take back a descriptor whose flush failed before reaching disk.
    pub fn restore_flush(&mut self, info: FlushInfo) {
        self.committed = true;
        if self.saved_region.is_none() {
            self.saved_region = info.saved;
        }
    }

    /// Flush the uncommitted write region ahead of eviction.
    ///
    /// Used when a transaction outgrows the cache: the page leaves memory and
    /// its in-flight content is written to disk under undo protection.
    pub fn flush_for_eviction(&mut self) -> Option<FlushInfo> {
        let write = self.write_region.take()?;
        let saved = self.saved_region.take().unwrap_or_else(|| Arc::clone(&self.read_region));
        self.read_region = Arc::new(write.into_read_only());
        self.committed = false;
        Some(FlushInfo { key: self.key, saved: Some(saved), region: Arc::clone(&self.read_region) })
    }

    /// Tear the page apart when it leaves memory.
    pub fn into_regions(self) -> (Arc<Region>, Option<Region>) {
        (self.read_region, self.write_region)
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    pub fn set_cached(&mut self, cached: bool) {
        self.cached = cached;
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    pub fn refresh_index(&self) -> u64 {
        self.refresh_index
    }

    /// Record an access. Returns `true` if this is the first touch in `generation`.
    pub fn touch(&mut self, now: Instant, generation: u64) -> bool {
        self.last_access = now;
        if self.refresh_index == generation {
            return false;
        }
        self.refresh_index = generation;
        true
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Page")
            .field("key", &self.key)
            .field("modified", &self.is_modified())
            .field("committed", &self.committed)
            .field("cached", &self.cached)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegionMemoryKind;
    use crate::region::RegionRead;

    fn setup() -> (RegionPool, RegionAllocator, Page) {
        let mut allocator = RegionAllocator::new(RegionMemoryKind::Heap, 64);
        let pool = RegionPool::new(8);
        let mut region = allocator.allocate(1, 4, false);
        region.write_bytes(0, b"disk");
        let page = Page::new(PageKey::new(1, 4), 0, region, false, true);
        (pool, allocator, page)
    }

    #[test]
    fn test_old_readers_keep_old_content() {
        let (mut pool, mut allocator, mut page) = setup();
        let before = Arc::clone(page.read_region());

        let (write, created) = page.write_region(&mut pool, &mut allocator).unwrap();
        assert!(created);
        write.write_bytes(0, b"next");
        assert_eq!(&before.bytes()[..4], b"disk");
        assert_eq!(&page.current_region().bytes()[..4], b"next");

        assert!(page.commit());
        assert_eq!(&page.read_region().bytes()[..4], b"next");
        assert_eq!(&before.bytes()[..4], b"disk");
    }

    #[test]
    fn test_write_region_created_once_per_transaction() {
        let (mut pool, mut allocator, mut page) = setup();
        assert!(page.write_region(&mut pool, &mut allocator).unwrap().1);
        assert!(!page.write_region(&mut pool, &mut allocator).unwrap().1);
        assert_eq!(allocator.allocated_count(), 2);
    }

    #[test]
    fn test_rollback_restores_clean_state() {
        let (mut pool, mut allocator, mut page) = setup();
        page.write_region(&mut pool, &mut allocator).unwrap().0.write_bytes(0, b"lost");
        let discarded = page.rollback().unwrap();
        pool.add_owned(discarded);

        assert!(!page.is_modified());
        assert!(!page.is_committed());
        assert_eq!(&page.read_region().bytes()[..4], b"disk");
        assert_eq!(pool.free_len(), 1);
    }

    #[test]
    fn test_flush_yields_once_with_disk_before_image() {
        let (mut pool, mut allocator, mut page) = setup();
        page.write_region(&mut pool, &mut allocator).unwrap().0.write_bytes(0, b"one!");
        page.commit();
        page.write_region(&mut pool, &mut allocator).unwrap().0.write_bytes(0, b"two!");
        page.commit();

        let info = page.flush().unwrap();
        assert_eq!(&info.saved.as_ref().unwrap().bytes()[..4], b"disk");
        assert_eq!(&info.region.bytes()[..4], b"two!");
        assert!(page.flush().is_none());
        assert!(page.is_evictable());
    }

    #[test]
    fn test_flushing_page_not_evictable() {
        let (_, _, page) = setup();
        page.read_region().set_flushing(true);
        assert!(!page.is_evictable());
        page.read_region().set_flushing(false);
        assert!(page.is_evictable());
    }

    #[test]
    fn test_read_only_page_rejects_writes() {
        let mut allocator = RegionAllocator::new(RegionMemoryKind::Heap, 64);
        let mut pool = RegionPool::new(8);
        let region = allocator.allocate(0, 0, true);
        let mut page = Page::new(PageKey::new(0, 0), 0, region, true, true);
        assert!(matches!(
            page.write_region(&mut pool, &mut allocator),
            Err(RawDbError::ReadOnly { .. })
        ));
    }

    #[test]
    fn test_flush_for_eviction_writes_uncommitted_content() {
        let (mut pool, mut allocator, mut page) = setup();
        page.write_region(&mut pool, &mut allocator).unwrap().0.write_bytes(0, b"big!");
        let info = page.flush_for_eviction().unwrap();
        assert_eq!(&info.saved.unwrap().bytes()[..4], b"disk");
        assert_eq!(&info.region.bytes()[..4], b"big!");
        assert!(!page.is_modified());
    }

    #[test]
    fn test_touch_tracks_generation() {
        let (_, _, mut page) = setup();
        let now = Instant::now();
        assert!(page.touch(now, 1));
        assert!(!page.touch(now, 1));
        assert!(page.touch(now, 2));
        assert_eq!(page.refresh_index(), 2);
    }
}
