//! Page regions: fixed-size memory blocks holding one page's bytes
//!
//! A [`Region`] is backed either by a boxed heap slice or by a raw native
//! allocation addressed through a pointer. Both variants expose the same
//! bounds-checked typed accessors through [`RegionRead`], always in
//! little-endian byte order so the in-memory and on-disk layouts never
//! depend on the host.
//!
//! Read regions are shared behind `Arc` and are immutable by construction.
//! Write regions are owned by exactly one page and are the only place bytes
//! change; writers assert the region is writable and fail fast otherwise.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::RegionMemoryKind;

/// Alignment of native allocations; one cache line.
const NATIVE_ALIGN: usize = 64;

/// Owned native allocation.
struct NativeBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned by its region; shared access only
// happens through `&Region`, which hands out `&[u8]`.
unsafe impl Send for NativeBuffer {}
// SAFETY: see above, no interior mutability through a shared reference.
unsafe impl Sync for NativeBuffer {}

impl NativeBuffer {
    /// `None` if `length` cannot be described by a layout.
    fn allocate(length: usize) -> Option<Self> {
        let layout = Layout::from_size_align(length.max(1), NATIVE_ALIGN).ok()?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };
        Some(Self { ptr, layout })
    }

    fn as_slice(&self, length: usize) -> &[u8] {
        debug_assert!(length <= self.layout.size());
        // SAFETY: ptr is valid for layout.size() initialised bytes for the life of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), length) }
    }

    fn as_mut_slice(&mut self, length: usize) -> &mut [u8] {
        debug_assert!(length <= self.layout.size());
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), length) }
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr was produced by alloc_zeroed with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

enum RegionMemory {
    Heap(Box<[u8]>),
    Native(NativeBuffer),
}

/// Typed little-endian read access shared by [`Region`] and [`RegionView`].
///
/// Every accessor panics when the requested range falls outside the region;
/// offsets come from page layouts the caller controls, so an out-of-range
/// access is a bug rather than a recoverable condition.
pub trait RegionRead {
    /// The bytes covered by this region.
    fn bytes(&self) -> &[u8];

    /// Length in bytes.
    fn len(&self) -> usize {
        self.bytes().len()
    }

    /// True when the region covers no bytes.
    fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }

    fn read_u8(&self, offset: usize) -> u8 {
        self.bytes()[offset]
    }

    fn read_bool(&self, offset: usize) -> bool {
        self.read_u8(offset) != 0
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.read_array(offset))
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes(self.read_array(offset))
    }

    fn read_u64(&self, offset: usize) -> u64 {
        u64::from_le_bytes(self.read_array(offset))
    }

    fn read_i64(&self, offset: usize) -> i64 {
        i64::from_le_bytes(self.read_array(offset))
    }

    /// Copy `N` bytes starting at `offset`.
    fn read_array<const N: usize>(&self, offset: usize) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes()[offset..offset + N]);
        out
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    fn read_bytes(&self, offset: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.bytes()[offset..offset + buf.len()]);
    }

    /// Borrow `length` bytes starting at `offset` as a sub-region.
    fn view(&self, offset: usize, length: usize) -> RegionView<'_> {
        let bytes = self.bytes();
        assert!(
            offset.checked_add(length).map_or(false, |end| end <= bytes.len()),
            "sub-region {}+{} outside region of {} bytes",
            offset,
            length,
            bytes.len()
        );
        RegionView { bytes: &bytes[offset..offset + length], offset }
    }
}

/// A borrowed slice of a region with the same typed accessors.
#[derive(Clone, Copy)]
pub struct RegionView<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl RegionView<'_> {
    /// Offset of this view inside its parent region.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl RegionRead for RegionView<'_> {
    fn bytes(&self) -> &[u8] {
        self.bytes
    }
}

/// One page worth of memory tagged with the page it belongs to.
pub struct Region {
    memory: RegionMemory,
    length: usize,
    file_index: u32,
    page_index: u64,
    read_only: bool,
    /// Set while a flush reads this region as the page's after-image.
    flushing: AtomicBool,
    /// Set while a flush reads this region as the page's before-image.
    saved_flushing: AtomicBool,
    /// Set while the region sits in a pool.
    free: AtomicBool,
}

impl Region {
    /// Allocate a zero-filled region.
    pub fn allocate(
        kind: RegionMemoryKind,
        file_index: u32,
        page_index: u64,
        read_only: bool,
        length: usize,
    ) -> Self {
        let memory = match kind {
            RegionMemoryKind::Heap => RegionMemory::Heap(vec![0u8; length].into_boxed_slice()),
            RegionMemoryKind::Native => match NativeBuffer::allocate(length) {
                Some(buffer) => RegionMemory::Native(buffer),
                None => RegionMemory::Heap(vec![0u8; length].into_boxed_slice()),
            },
        };
        Self {
            memory,
            length,
            file_index,
            page_index,
            read_only,
            flushing: AtomicBool::new(false),
            saved_flushing: AtomicBool::new(false),
            free: AtomicBool::new(false),
        }
    }

    pub fn memory_kind(&self) -> RegionMemoryKind {
        match self.memory {
            RegionMemory::Heap(_) => RegionMemoryKind::Heap,
            RegionMemory::Native(_) => RegionMemoryKind::Native,
        }
    }

    pub fn file_index(&self) -> u32 {
        self.file_index
    }

    pub fn page_index(&self) -> u64 {
        self.page_index
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// True while any flush still reads this region.
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire) || self.saved_flushing.load(Ordering::Acquire)
    }

    pub fn set_flushing(&self, value: bool) {
        self.flushing.store(value, Ordering::Release);
    }

    pub fn set_saved_flushing(&self, value: bool) {
        self.saved_flushing.store(value, Ordering::Release);
    }

    pub fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    pub(crate) fn set_free(&self, value: bool) {
        self.free.store(value, Ordering::Release);
    }

    /// Retag a recycled region for a new page.
    pub(crate) fn reset_identity(&mut self, file_index: u32, page_index: u64, read_only: bool) {
        self.file_index = file_index;
        self.page_index = page_index;
        self.read_only = read_only;
        self.flushing.store(false, Ordering::Relaxed);
        self.saved_flushing.store(false, Ordering::Relaxed);
        self.free.store(false, Ordering::Relaxed);
    }

    /// Freeze a write region into a read region.
    pub fn into_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    fn writable(&mut self) -> &mut [u8] {
        assert!(
            !self.read_only,
            "write to read-only region of page {}:{}",
            self.file_index,
            self.page_index
        );
        let length = self.length;
        match &mut self.memory {
            RegionMemory::Heap(buf) => &mut buf[..length],
            RegionMemory::Native(buf) => buf.as_mut_slice(length),
        }
    }

    /// Mutable access to all bytes. Panics on a read-only region.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.writable()
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.writable()[offset] = value;
    }

    pub fn write_bool(&mut self, offset: usize, value: bool) {
        self.write_u8(offset, value as u8);
    }

    pub fn write_u16(&mut self, offset: usize, value: u16) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn write_i64(&mut self, offset: usize, value: i64) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    pub fn write_bytes(&mut self, offset: usize, data: &[u8]) {
        self.writable()[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn fill(&mut self, value: u8) {
        self.writable().fill(value);
    }

    /// Bulk-copy the bytes of `source` into this region.
    pub fn copy_from(&mut self, source: &impl RegionRead) {
        let src = source.bytes();
        assert_eq!(src.len(), self.length, "region copy between different page sizes");
        self.writable().copy_from_slice(src);
    }
}

impl RegionRead for Region {
    fn bytes(&self) -> &[u8] {
        match &self.memory {
            RegionMemory::Heap(buf) => &buf[..self.length],
            RegionMemory::Native(buf) => buf.as_slice(self.length),
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("kind", &self.memory_kind())
            .field("file_index", &self.file_index)
            .field("page_index", &self.page_index)
            .field("length", &self.length)
            .field("read_only", &self.read_only)
            .field("flushing", &self.is_flushing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both_kinds() -> [RegionMemoryKind; 2] {
        [RegionMemoryKind::Heap, RegionMemoryKind::Native]
    }

    #[test]
    fn test_typed_accessors_little_endian() {
        for kind in both_kinds() {
            let mut region = Region::allocate(kind, 1, 2, false, 64);
            region.write_u32(0, 0x0403_0201);
            region.write_u64(8, u64::MAX - 1);
            region.write_i64(16, -42);
            region.write_u16(24, 0xBEEF);
            region.write_bool(26, true);

            assert_eq!(region.bytes()[..4], [1, 2, 3, 4]);
            assert_eq!(region.read_u32(0), 0x0403_0201);
            assert_eq!(region.read_u64(8), u64::MAX - 1);
            assert_eq!(region.read_i64(16), -42);
            assert_eq!(region.read_u16(24), 0xBEEF);
            assert!(region.read_bool(26));
            assert_eq!(region.memory_kind(), kind);
        }
    }

    #[test]
    fn test_new_region_is_zeroed() {
        for kind in both_kinds() {
            let region = Region::allocate(kind, 0, 0, true, 4096);
            assert!(region.bytes().iter().all(|b| *b == 0));
            assert_eq!(region.len(), 4096);
        }
    }

    #[test]
    fn test_view_reads_at_offset() {
        let mut region = Region::allocate(RegionMemoryKind::Native, 0, 0, false, 128);
        region.write_u64(40, 77);
        let view = region.view(32, 16);
        assert_eq!(view.offset(), 32);
        assert_eq!(view.len(), 16);
        assert_eq!(view.read_u64(8), 77);
    }

    #[test]
    #[should_panic]
    fn test_view_out_of_bounds_panics() {
        let region = Region::allocate(RegionMemoryKind::Heap, 0, 0, true, 64);
        let _ = region.view(60, 8);
    }

    #[test]
    #[should_panic(expected = "read-only")]
    fn test_write_to_read_only_panics() {
        let mut region = Region::allocate(RegionMemoryKind::Heap, 0, 0, true, 64);
        region.write_u8(0, 1);
    }

    #[test]
    fn test_into_read_only_keeps_bytes() {
        let mut region = Region::allocate(RegionMemoryKind::Heap, 3, 9, false, 64);
        region.write_bytes(0, b"snapshot");
        let frozen = region.into_read_only();
        assert!(frozen.is_read_only());
        assert_eq!(&frozen.bytes()[..8], b"snapshot");
        assert_eq!(frozen.page_index(), 9);
    }

    #[test]
    fn test_flushing_flags() {
        let region = Region::allocate(RegionMemoryKind::Heap, 0, 0, true, 64);
        assert!(!region.is_flushing());
        region.set_saved_flushing(true);
        assert!(region.is_flushing());
        region.set_saved_flushing(false);
        region.set_flushing(true);
        assert!(region.is_flushing());
    }

    #[test]
    fn test_copy_from() {
        let mut source = Region::allocate(RegionMemoryKind::Native, 0, 0, false, 64);
        source.fill(0xAB);
        let mut target = Region::allocate(RegionMemoryKind::Heap, 0, 0, false, 64);
        target.copy_from(&source);
        assert_eq!(target.bytes(), source.bytes());
    }
}
