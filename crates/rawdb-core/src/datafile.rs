//! Data files: page-indexed storage on disk
//!
//! A data file maps page `i` to the byte range `[i * page_size, (i + 1) * page_size)`.
//! It owns the pages of its own that are currently in memory and performs the
//! raw positioned I/O for them.
//!
//! Three sizes are tracked:
//! - `size`:           logical size as seen by the running transaction
//! - `committed_size`: logical size as of the last commit
//! - `flush_size`:     bytes actually on disk (high-water mark of page writes)
//!
//! Deletions and truncations are logical until the flush after their commit
//! applies them to disk.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::config::PageTypeConfig;
use crate::error::{RawDbError, RawResult};
use crate::format::FileManifestEntry;
use crate::page::Page;
use crate::platform_advice::{self, ReadMode};
use crate::platform_durability::sync_file;
use crate::region::Region;

/// File state captured at the first change in a transaction.
#[derive(Debug, Clone, Copy)]
struct SavedFileState {
    size: u64,
    deleted: bool,
    truncated: bool,
}

/// A committed file operation waiting for the next flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingFileOp {
    Delete,
    Truncate(u64),
}

/// One logical data file.
pub struct DataFile {
    index: u32,
    path: PathBuf,
    page_type: usize,
    page_size: usize,
    max_size: u64,
    read_only: bool,
    temporary: bool,
    new: bool,
    deleted: bool,
    truncated: bool,
    preload: bool,
    preloaded: bool,
    drop_behind: bool,
    size: u64,
    committed_size: u64,
    flush_size: u64,
    exists_on_disk: bool,
    handle: Option<File>,
    pages: HashMap<u64, Page>,
    saved: Option<SavedFileState>,
    pending: Option<PendingFileOp>,
}

impl DataFile {
    /// Bind a data file at `path`. Nothing is opened until the first I/O.
    pub fn open(
        index: u32,
        path: PathBuf,
        page_type: usize,
        config: &PageTypeConfig,
        read_only: bool,
        temporary: bool,
        drop_behind: bool,
    ) -> RawResult<Self> {
        let (exists_on_disk, disk_size) = match std::fs::metadata(&path) {
            Ok(meta) => (true, meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => (false, 0),
            Err(e) => return Err(RawDbError::io(&path, e, "failed to stat data file")),
        };

        Ok(Self {
            index,
            path,
            page_type,
            page_size: config.page_size,
            max_size: config.max_file_size,
            read_only,
            temporary,
            new: false,
            deleted: false,
            truncated: false,
            preload: config.preload,
            preloaded: false,
            drop_behind,
            size: disk_size,
            committed_size: disk_size,
            flush_size: disk_size,
            exists_on_disk,
            handle: None,
            pages: HashMap::new(),
            saved: None,
            pending: None,
        })
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_type(&self) -> usize {
        self.page_type
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn committed_size(&self) -> u64 {
        self.committed_size
    }

    pub fn flush_size(&self) -> u64 {
        self.flush_size
    }

    /// Number of pages covered by the logical size.
    pub fn page_count(&self) -> u64 {
        self.size.div_ceil(self.page_size as u64)
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    /// Bound by the running transaction and not yet committed.
    pub fn is_new(&self) -> bool {
        self.new
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn exists_on_disk(&self) -> bool {
        self.exists_on_disk
    }

    pub fn pending_op(&self) -> Option<PendingFileOp> {
        self.pending
    }

    // ---- Resident pages ----

    pub fn page(&self, page_index: u64) -> Option<&Page> {
        self.pages.get(&page_index)
    }

    pub fn page_mut(&mut self, page_index: u64) -> Option<&mut Page> {
        self.pages.get_mut(&page_index)
    }

    pub fn insert_page(&mut self, page: Page) {
        self.pages.insert(page.key().page_index, page);
    }

    /// Remove a page from memory.
    pub fn unload_page(&mut self, page_index: u64) -> Option<Page> {
        self.pages.remove(&page_index)
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.values()
    }

    pub fn loaded_indices(&self) -> Vec<u64> {
        self.pages.keys().copied().collect()
    }

    pub fn loaded_count(&self) -> usize {
        self.pages.len()
    }

    /// True if any resident page holds committed content not yet flushed.
    pub fn has_committed_pages(&self) -> bool {
        self.pages.values().any(|p| p.is_committed())
    }

    /// Preload is configured and has not run yet.
    pub fn needs_preload(&self) -> bool {
        self.preload && !self.preloaded
    }

    pub fn mark_preloaded(&mut self) {
        self.preloaded = true;
    }

    // ---- Transactional file state ----

    fn begin_change(&mut self) {
        if self.saved.is_none() {
            self.saved = Some(SavedFileState {
                size: self.size,
                deleted: self.deleted,
                truncated: self.truncated,
            });
        }
    }

    /// Mark the file as bound by the running transaction.
    pub fn mark_new(&mut self) {
        self.begin_change();
        self.new = true;
    }

    /// Make room for `page_index`, growing the logical size if needed.
    pub fn ensure_page_fits(&mut self, page_index: u64) -> RawResult<()> {
        if self.read_only {
            return Err(RawDbError::ReadOnly { what: format!("file {}", self.path.display()) });
        }
        let end = (page_index + 1)
            .checked_mul(self.page_size as u64)
            .ok_or(RawDbError::FileTooLarge { file_index: self.index, requested: u64::MAX, max: self.max_size })?;
        if end > self.max_size {
            return Err(RawDbError::FileTooLarge { file_index: self.index, requested: end, max: self.max_size });
        }
        if end > self.size {
            self.begin_change();
            self.size = end;
        }
        Ok(())
    }

    /// Logically truncate to `new_size` bytes, rounded up to whole pages.
    ///
    /// Returns the indices of resident pages that fall beyond the new end.
    pub fn truncate(&mut self, new_size: u64) -> RawResult<Vec<u64>> {
        if self.read_only {
            return Err(RawDbError::ReadOnly { what: format!("file {}", self.path.display()) });
        }
        let page_size = self.page_size as u64;
        let new_size = new_size.div_ceil(page_size) * page_size;
        if new_size >= self.size {
            return Ok(Vec::new());
        }
        self.begin_change();
        self.size = new_size;
        self.truncated = true;
        let first_gone = new_size / page_size;
        Ok(self.pages.keys().copied().filter(|i| *i >= first_gone).collect())
    }

    /// Logically delete the file.
    pub fn delete(&mut self) -> RawResult<()> {
        if self.read_only {
            return Err(RawDbError::ReadOnly { what: format!("file {}", self.path.display()) });
        }
        self.begin_change();
        self.deleted = true;
        self.size = 0;
        Ok(())
    }

    /// Make the running transaction's file changes permanent.
    ///
    /// Returns the disk operation the next flush must apply, if any.
    pub fn commit(&mut self) -> Option<PendingFileOp> {
        self.saved = None;
        self.new = false;
        self.committed_size = self.size;
        let op = if self.deleted {
            Some(PendingFileOp::Delete)
        } else if self.truncated && self.size < self.flush_size {
            Some(PendingFileOp::Truncate(self.size))
        } else {
            None
        };
        self.truncated = false;
        if op.is_some() {
            self.pending = op;
        }
        op
    }

    /// Undo the running transaction's file changes.
    ///
    /// Returns `true` if the file was created by the transaction and must be unbound.
    pub fn rollback(&mut self) -> bool {
        let Some(saved) = self.saved.take() else {
            return false;
        };
        self.size = saved.size;
        self.deleted = saved.deleted;
        self.truncated = saved.truncated;
        std::mem::take(&mut self.new)
    }

    // ---- Disk I/O ----

    fn handle(&mut self, create: bool) -> RawResult<Option<&mut File>> {
        if self.handle.is_none() {
            if !create && !self.exists_on_disk {
                return Ok(None);
            }
            if create {
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)
                        .map_err(|e| RawDbError::io(parent, e, "failed to create data directory"))?;
                }
            }
            let file = OpenOptions::new()
                .read(true)
                .write(!self.read_only)
                .create(create && !self.read_only)
                .open(&self.path)
                .map_err(|e| RawDbError::io(&self.path, e, "failed to open data file"))?;
            if create {
                self.exists_on_disk = true;
            }
            self.handle = Some(file);
        }
        Ok(self.handle.as_mut())
    }

    /// Advise the OS about the coming access pattern.
    pub fn set_read_mode(&mut self, mode: ReadMode) {
        let path = self.path.clone();
        if let Ok(Some(file)) = self.handle(false) {
            if let Err(e) = platform_advice::set_read_mode(file, mode) {
                tracing::debug!(path = %path.display(), error = %e, "read mode hint rejected");
            }
        }
    }

    /// Fill `region` with the on-disk content of `page_index`.
    ///
    /// A page beyond the end of the file, or a read hitting end-of-file before
    /// the first byte, yields a zero page. Any other short read is corruption.
    pub fn read_page(&mut self, page_index: u64, region: &mut Region) -> RawResult<()> {
        let offset = page_index * self.page_size as u64;
        if offset >= self.size || offset >= self.flush_size || !self.exists_on_disk {
            region.fill(0);
            return Ok(());
        }

        let path = self.path.clone();
        let drop_behind = self.drop_behind;
        let page_size = self.page_size;
        let Some(file) = self.handle(false)? else {
            region.fill(0);
            return Ok(());
        };
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| RawDbError::io(&path, e, "seek failed"))?;

        let buf = region.bytes_mut();
        let mut filled = 0;
        while filled < page_size {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(RawDbError::io(&path, e, "page read failed")),
            }
        }

        if filled == 0 {
            buf.fill(0);
        } else if filled < page_size {
            return Err(RawDbError::Corrupted {
                path,
                offset,
                reason: format!("short page read: {} of {} bytes", filled, page_size),
            });
        }

        if drop_behind {
            if let Err(e) = platform_advice::drop_behind(file, offset, page_size as u64) {
                tracing::debug!(path = %path.display(), error = %e, "drop-behind hint rejected");
            }
        }
        Ok(())
    }

    /// Write one page at its offset. Returns the number of bytes written.
    pub fn write_page(&mut self, page_index: u64, data: &[u8]) -> RawResult<u64> {
        let offset = page_index * self.page_size as u64;
        let end = offset + data.len() as u64;
        if end > self.max_size {
            return Err(RawDbError::FileTooLarge { file_index: self.index, requested: end, max: self.max_size });
        }
        let path = self.path.clone();
        let file = self
            .handle(true)?
            .ok_or_else(|| RawDbError::ReadOnly { what: format!("file {}", path.display()) })?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| RawDbError::io(&path, e, "seek failed"))?;

        let mut written = 0;
        while written < data.len() {
            match file.write(&data[written..]) {
                Ok(0) => {
                    return Err(RawDbError::io(
                        &path,
                        std::io::Error::new(ErrorKind::WriteZero, "zero-length write"),
                        "page write failed",
                    ))
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(RawDbError::io(&path, e, "page write failed")),
            }
        }

        self.flush_size = self.flush_size.max(end);
        Ok(written as u64)
    }

    /// Durably sync written pages.
    pub fn sync(&mut self) -> RawResult<()> {
        if let Some(file) = self.handle.as_ref() {
            sync_file(file, &self.path)?;
        }
        Ok(())
    }

    /// Shrink the file on disk to `size` bytes.
    pub fn apply_truncate(&mut self, size: u64) -> RawResult<()> {
        let path = self.path.clone();
        if let Some(file) = self.handle(false)? {
            file.set_len(size)
                .map_err(|e| RawDbError::io(&path, e, "truncate failed"))?;
            sync_file(file, &path)?;
        }
        self.flush_size = self.flush_size.min(size);
        self.pending = None;
        Ok(())
    }

    /// Remove the file from disk.
    pub fn remove_from_disk(&mut self) -> RawResult<()> {
        self.handle = None;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(RawDbError::io(&self.path, e, "failed to delete data file")),
        }
        self.exists_on_disk = false;
        self.flush_size = 0;
        self.pending = None;
        Ok(())
    }

    /// State on disk, as recorded in log manifests.
    pub fn manifest_entry(&self) -> FileManifestEntry {
        FileManifestEntry {
            file_index: self.index,
            page_size: self.page_size as u32,
            exists: self.exists_on_disk,
            size: self.flush_size,
            path: self.path.clone(),
        }
    }

    /// State the pending flush leaves on disk.
    pub fn final_manifest_entry(&self) -> FileManifestEntry {
        let (exists, size) = match self.pending {
            Some(PendingFileOp::Delete) => (false, 0),
            Some(PendingFileOp::Truncate(size)) => (true, size),
            None => (self.exists_on_disk, self.flush_size),
        };
        FileManifestEntry { file_index: self.index, page_size: self.page_size as u32, exists, size, path: self.path.clone() }
    }

    /// Close the handle and give up every resident page.
    pub fn close(&mut self) -> Vec<Page> {
        self.handle = None;
        self.preloaded = false;
        self.pages.drain().map(|(_, page)| page).collect()
    }

    /// Close, then take size and existence from disk again.
    ///
    /// Used after recovery rewrote files underneath the cache.
    pub fn reset_from_disk(&mut self) -> RawResult<Vec<Page>> {
        let pages = self.close();
        let (exists_on_disk, disk_size) = match std::fs::metadata(&self.path) {
            Ok(meta) => (true, meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => (false, 0),
            Err(e) => return Err(RawDbError::io(&self.path, e, "failed to stat data file")),
        };
        self.exists_on_disk = exists_on_disk;
        self.size = disk_size;
        self.committed_size = disk_size;
        self.flush_size = disk_size;
        self.new = false;
        self.deleted = false;
        self.truncated = false;
        self.saved = None;
        self.pending = None;
        Ok(pages)
    }
}

impl std::fmt::Debug for DataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFile")
            .field("index", &self.index)
            .field("path", &self.path)
            .field("size", &self.size)
            .field("flush_size", &self.flush_size)
            .field("pages", &self.pages.len())
            .finish()
    }
}
