//! Region allocation and reuse
//!
//! Every page type owns one [`RegionAllocator`] and one [`RegionPool`].
//! Freed regions are kept on a stack so the most recently touched memory is
//! handed out first. Regions a flush may still read are parked separately and
//! only become reusable once their flushing flags clear and nothing else
//! holds them.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::RegionMemoryKind;
use crate::region::{Region, RegionRead};

/// Allocates zeroed regions of a single page size.
#[derive(Debug)]
pub struct RegionAllocator {
    kind: RegionMemoryKind,
    page_size: usize,
    allocated: u64,
}

impl RegionAllocator {
    pub fn new(kind: RegionMemoryKind, page_size: usize) -> Self {
        Self { kind, page_size, allocated: 0 }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn memory_kind(&self) -> RegionMemoryKind {
        self.kind
    }

    /// Allocate a fresh zero-filled region.
    pub fn allocate(&mut self, file_index: u32, page_index: u64, read_only: bool) -> Region {
        self.allocated += 1;
        Region::allocate(self.kind, file_index, page_index, read_only, self.page_size)
    }

    /// Regions allocated since creation.
    pub fn allocated_count(&self) -> u64 {
        self.allocated
    }
}

/// Stack of recently freed regions plus a holding area for flushing ones.
#[derive(Debug)]
pub struct RegionPool {
    free: Vec<Region>,
    flushing: VecDeque<Arc<Region>>,
    max_size: usize,
}

impl RegionPool {
    pub fn new(max_size: usize) -> Self {
        Self { free: Vec::new(), flushing: VecDeque::new(), max_size }
    }

    /// Return a shared region to the pool.
    ///
    /// A region still flushing is parked until its flush completes. A region
    /// someone else still references cannot be reused and is simply dropped
    /// from the pool's point of view.
    pub fn add(&mut self, region: Arc<Region>) {
        if region.is_flushing() {
            if self.flushing.len() < self.max_size {
                self.flushing.push_back(region);
            }
            return;
        }
        if let Ok(region) = Arc::try_unwrap(region) {
            self.add_owned(region);
        }
    }

    /// Return an exclusively owned region to the pool.
    pub fn add_owned(&mut self, region: Region) {
        if region.is_flushing() {
            self.add(Arc::new(region));
            return;
        }
        if self.free.len() < self.max_size {
            region.set_free(true);
            self.free.push(region);
        }
    }

    /// Take the most recently freed region, if any.
    pub fn remove(&mut self) -> Option<Region> {
        self.reclaim_flushed();
        let region = self.free.pop()?;
        region.set_free(false);
        Some(region)
    }

    /// Move regions whose flush has completed onto the free stack.
    pub fn reclaim_flushed(&mut self) {
        let mut still_flushing = VecDeque::with_capacity(self.flushing.len());
        while let Some(region) = self.flushing.pop_front() {
            if region.is_flushing() {
                still_flushing.push_back(region);
                continue;
            }
            if let Ok(region) = Arc::try_unwrap(region) {
                if self.free.len() < self.max_size {
                    region.set_free(true);
                    self.free.push(region);
                }
            }
        }
        self.flushing = still_flushing;
    }

    /// Regions ready for reuse.
    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    /// Regions waiting for a flush to release them.
    pub fn flushing_len(&self) -> usize {
        self.flushing.len()
    }

    /// Drop everything the pool holds.
    pub fn clear(&mut self) {
        self.free.clear();
        self.flushing.clear();
    }
}

/// Take a region for `(file_index, page_index)`, reusing pooled memory when possible.
pub fn acquire_region(
    pool: &mut RegionPool,
    allocator: &mut RegionAllocator,
    file_index: u32,
    page_index: u64,
    read_only: bool,
) -> Region {
    match pool.remove() {
        Some(mut region) => {
            region.reset_identity(file_index, page_index, read_only);
            region
        }
        None => allocator.allocate(file_index, page_index, read_only),
    }
}

/// Materialize a private writable copy of a read snapshot.
///
/// This is the copy-on-write point: the snapshot itself is never touched.
pub fn to_write_region(
    read: &Region,
    pool: &mut RegionPool,
    allocator: &mut RegionAllocator,
) -> Region {
    let mut write = acquire_region(pool, allocator, read.file_index(), read.page_index(), false);
    write.copy_from(read);
    write
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_most_recent_first() {
        let mut allocator = RegionAllocator::new(RegionMemoryKind::Heap, 64);
        let mut pool = RegionPool::new(4);

        let first = allocator.allocate(1, 1, false);
        let second = allocator.allocate(1, 2, false);
        pool.add_owned(first);
        pool.add_owned(second);

        let reused = pool.remove().unwrap();
        assert_eq!(reused.page_index(), 2);
        assert!(!reused.is_free());
    }

    #[test]
    fn test_flushing_region_not_reused_until_flush_completes() {
        let mut allocator = RegionAllocator::new(RegionMemoryKind::Heap, 64);
        let mut pool = RegionPool::new(4);

        let region = Arc::new(allocator.allocate(0, 5, true));
        region.set_flushing(true);
        pool.add(Arc::clone(&region));
        drop(region);

        assert!(pool.remove().is_none());
        assert_eq!(pool.flushing_len(), 1);

        // Flush completes: the only remaining holder is the pool.
        pool.flushing[0].set_flushing(false);
        let reused = pool.remove().unwrap();
        assert_eq!(reused.page_index(), 5);
        assert_eq!(pool.flushing_len(), 0);
    }

    #[test]
    fn test_shared_region_is_not_pooled() {
        let mut allocator = RegionAllocator::new(RegionMemoryKind::Heap, 64);
        let mut pool = RegionPool::new(4);

        let region = Arc::new(allocator.allocate(0, 0, true));
        let reader = Arc::clone(&region);
        pool.add(region);
        assert_eq!(pool.free_len(), 0);
        assert_eq!(reader.page_index(), 0);
    }

    #[test]
    fn test_pool_respects_max_size() {
        let mut allocator = RegionAllocator::new(RegionMemoryKind::Native, 64);
        let mut pool = RegionPool::new(2);
        for i in 0..5 {
            pool.add_owned(allocator.allocate(0, i, false));
        }
        assert_eq!(pool.free_len(), 2);
    }

    #[test]
    fn test_to_write_region_copies_snapshot() {
        let mut allocator = RegionAllocator::new(RegionMemoryKind::Heap, 64);
        let mut pool = RegionPool::new(4);

        let mut base = allocator.allocate(2, 7, false);
        base.write_bytes(0, b"before");
        let read = base.into_read_only();

        let mut write = to_write_region(&read, &mut pool, &mut allocator);
        assert!(!write.is_read_only());
        assert_eq!(write.page_index(), 7);
        write.write_bytes(0, b"after!");

        assert_eq!(&read.bytes()[..6], b"before");
        assert_eq!(&write.bytes()[..6], b"after!");
    }

    #[test]
    fn test_acquire_retags_pooled_region() {
        let mut allocator = RegionAllocator::new(RegionMemoryKind::Heap, 64);
        let mut pool = RegionPool::new(4);
        pool.add_owned(allocator.allocate(9, 9, true));

        let region = acquire_region(&mut pool, &mut allocator, 1, 3, false);
        assert_eq!(region.file_index(), 1);
        assert_eq!(region.page_index(), 3);
        assert!(!region.is_read_only());
        assert_eq!(allocator.allocated_count(), 1);
    }
}
