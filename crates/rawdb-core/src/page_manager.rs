//! Page manager: transaction bookkeeping and flush pacing
//!
//! Tracks the pages and files the running transaction wrote, promotes or
//! discards them at commit or rollback, and decides when committed pages go
//! to disk:
//!
//! - `FLUSH`, or any file binding, deletion or truncation: flush on commit
//! - `DURABLE`: write after-images to the redo log on commit
//! - otherwise: flush once buffered committed bytes exceed `max_flush_size`,
//!   or on the timer after `flush_period`
//!
//! A flush runs these stages in order, each one durable before the next:
//!
//! 1. undo record with before-images and file manifest
//! 2. page writes, data file sync
//! 3. redo-phase record with the final file manifest
//! 4. redo log cleared
//! 5. deletions and truncations applied
//! 6. undo log cleared
//!
//! When a transaction outgrows its cache, its modified pages are written out
//! early under stage 1-2 protection only. Such a "big transaction" keeps its
//! undo records until it commits; a rollback restores from them.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::RawDbConfig;
use crate::datafile::PendingFileOp;
use crate::error::RawResult;
use crate::file_cache::FileCache;
use crate::format::{FileManifestEntry, PageImage};
use crate::observer::RawDbObserver;
use crate::page::{FlushInfo, PageKey};
use crate::page_cache::{PageCache, PageHost, PageStatus};
use crate::platform_durability::sync_dir;
use crate::region::{Region, RegionRead};
use crate::stats::RawDbStats;
use crate::transaction::TxOptions;
use crate::txlog::TransactionLog;

/// Stages of a flush, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FlushStage {
    /// Before anything is written
    Start,
    /// Undo record durable
    UndoWritten,
    /// Pages written and synced
    PagesWritten,
    /// Redo-phase record durable
    RedoPhaseMarked,
    /// Redo log cleared
    RedoCleared,
    /// Deletions and truncations applied
    FilesApplied,
}

/// Transaction page bookkeeping and flush control.
pub struct PageManager {
    pub(crate) files: FileCache,
    pub(crate) log: TransactionLog,
    write_files: BTreeSet<u32>,
    write_pages: BTreeSet<PageKey>,
    committed: BTreeSet<PageKey>,
    redo_pending: BTreeSet<PageKey>,
    pending_ops: BTreeSet<u32>,
    files_changed: bool,
    committed_size: u64,
    last_flush: Instant,
    flush_requested: bool,
    big_transaction: bool,
    in_transaction: bool,
    flush_period: Duration,
    max_flush_size: u64,
    crash_after: Option<FlushStage>,
    crashed: bool,
    stats: Arc<RawDbStats>,
    observer: Arc<dyn RawDbObserver>,
}

impl PageManager {
    pub fn new(
        config: &RawDbConfig,
        files: FileCache,
        log: TransactionLog,
        stats: Arc<RawDbStats>,
        observer: Arc<dyn RawDbObserver>,
    ) -> Self {
        Self {
            files,
            log,
            write_files: BTreeSet::new(),
            write_pages: BTreeSet::new(),
            committed: BTreeSet::new(),
            redo_pending: BTreeSet::new(),
            pending_ops: BTreeSet::new(),
            files_changed: false,
            committed_size: 0,
            last_flush: Instant::now(),
            flush_requested: false,
            big_transaction: false,
            in_transaction: false,
            flush_period: config.flush_period,
            max_flush_size: config.max_flush_size,
            crash_after: None,
            crashed: false,
            stats,
            observer,
        }
    }

    pub fn files(&self) -> &FileCache {
        &self.files
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    pub fn is_big_transaction(&self) -> bool {
        self.big_transaction
    }

    /// Committed bytes buffered since the last flush or redo write.
    pub fn committed_size(&self) -> u64 {
        self.committed_size
    }

    pub fn committed_count(&self) -> usize {
        self.committed.len()
    }

    pub fn is_flush_requested(&self) -> bool {
        self.flush_requested
    }

    /// Abandon the next flush that reaches `stage`, and all disk work after it.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn set_crash_point(&mut self, stage: Option<FlushStage>) {
        self.crash_after = stage;
    }

    /// A simulated crash happened; nothing reaches disk anymore.
    pub fn is_crashed(&self) -> bool {
        self.crashed
    }

    pub fn begin(&mut self, options: TxOptions) -> RawResult<()> {
        self.in_transaction = true;
        if options.contains(TxOptions::FLUSH)
            || (options.contains(TxOptions::DURABLE) && self.flush_requested)
        {
            self.flush(true)?;
        }
        Ok(())
    }

    pub fn add_write_page(&mut self, key: PageKey) {
        self.write_pages.insert(key);
    }

    /// Register a file the transaction changed. `structural` marks bind,
    /// delete and truncate, which force a flush on commit.
    pub fn add_write_file(&mut self, index: u32, structural: bool) {
        self.write_files.insert(index);
        self.files_changed |= structural;
    }

    /// Make the transaction's page and file changes permanent.
    pub fn commit(&mut self, options: TxOptions) -> RawResult<()> {
        self.in_transaction = false;
        for index in std::mem::take(&mut self.write_files) {
            if let Some(file) = self.files.raw_mut(index) {
                if file.commit().is_some() {
                    self.pending_ops.insert(index);
                }
            }
        }
        for key in std::mem::take(&mut self.write_pages) {
            let Some(file) = self.files.raw_mut(key.file_index) else {
                continue;
            };
            let page_size = file.page_size() as u64;
            if let Some(page) = file.page_mut(key.page_index) {
                if page.commit() {
                    self.committed.insert(key);
                    self.redo_pending.insert(key);
                    self.committed_size += page_size;
                }
            }
        }

        let big = std::mem::take(&mut self.big_transaction);
        let files_changed = std::mem::take(&mut self.files_changed);
        if big || files_changed || options.contains(TxOptions::FLUSH) {
            self.flush(true)
        } else if options.contains(TxOptions::DURABLE) {
            self.write_redo()
        } else if self.committed_size > self.max_flush_size {
            tracing::debug!(buffered = self.committed_size, "flush size threshold reached");
            self.flush(true)
        } else {
            Ok(())
        }
    }

    /// Discard the transaction's changes.
    ///
    /// Returns `true` when in-memory undo is not enough and the caller must
    /// clear all caches and recover from the log.
    pub fn rollback(&mut self, clear_cache: bool, caches: &mut [PageCache]) -> bool {
        self.in_transaction = false;
        for key in std::mem::take(&mut self.write_pages) {
            let page = self.files.raw_mut(key.file_index).and_then(|f| f.page_mut(key.page_index));
            if let Some(page) = page {
                let page_type = page.page_type();
                if let Some(region) = page.rollback() {
                    if let Some(cache) = caches.get_mut(page_type) {
                        cache.regions_mut().0.add_owned(region);
                    }
                }
            }
        }
        for index in std::mem::take(&mut self.write_files) {
            for page in self.files.rollback_file(index) {
                let key = page.key();
                let page_type = page.page_type();
                let (read, write) = page.into_regions();
                if let Some(cache) = caches.get_mut(page_type) {
                    cache.remove_page(key);
                    cache.release_regions(read, write);
                }
            }
        }
        self.files_changed = false;
        clear_cache || self.big_transaction
    }

    /// Forget everything buffered; used when all caches are cleared.
    pub fn reset(&mut self) {
        self.write_files.clear();
        self.write_pages.clear();
        self.committed.clear();
        self.redo_pending.clear();
        self.pending_ops.clear();
        self.files_changed = false;
        self.committed_size = 0;
        self.flush_requested = false;
        self.big_transaction = false;
        self.in_transaction = false;
    }

    /// Flush now, or with `sync == false` just request one for the next timer tick.
    pub fn flush(&mut self, sync: bool) -> RawResult<()> {
        if !sync {
            self.flush_requested = true;
            return Ok(());
        }
        self.flush_committed()
    }

    /// Timer tick: run a requested or overdue flush.
    pub fn on_timer(&mut self, now: Instant) -> RawResult<()> {
        let overdue = (!self.committed.is_empty() || !self.pending_ops.is_empty())
            && now.saturating_duration_since(self.last_flush) >= self.flush_period;
        if self.flush_requested || overdue {
            self.flush(true)?;
        }
        Ok(())
    }

    fn crash_at(&mut self, stage: FlushStage) -> bool {
        if self.crash_after == Some(stage) {
            tracing::warn!(?stage, "simulated crash during flush");
            self.crashed = true;
        }
        self.crashed
    }

    fn flush_committed(&mut self) -> RawResult<()> {
        if self.crash_at(FlushStage::Start) {
            return Ok(());
        }
        let finalize = !self.big_transaction;
        let mut infos = Vec::with_capacity(self.committed.len());
        for key in std::mem::take(&mut self.committed) {
            let page = self.files.raw_mut(key.file_index).and_then(|f| f.page_mut(key.page_index));
            if let Some(info) = page.and_then(|p| p.flush()) {
                infos.push(info);
            }
        }
        let op_files: Vec<u32> = std::mem::take(&mut self.pending_ops).into_iter().collect();

        self.last_flush = Instant::now();
        self.flush_requested = false;
        self.committed_size = 0;

        if infos.is_empty() && op_files.is_empty() {
            if finalize {
                self.log.redo().clear()?;
                self.redo_pending.clear();
            }
            return Ok(());
        }
        self.write_flush(infos, op_files, finalize)
    }

    /// Write one page the running transaction modified, ahead of its eviction.
    fn flush_for_eviction(&mut self, key: PageKey) -> RawResult<()> {
        let modified = self.files.raw(key.file_index).and_then(|f| f.page(key.page_index)).map_or(false, |p| p.is_modified());
        if !modified {
            return Ok(());
        }
        if !self.big_transaction {
            tracing::info!(page = %key, "transaction outgrew its cache; flushing modified pages early");
            // Earlier commits reach disk completely before undo starts covering
            // uncommitted content.
            self.flush_committed()?;
            self.big_transaction = true;
        }
        if self.crash_at(FlushStage::Start) {
            return Ok(());
        }
        let page = self.files.raw_mut(key.file_index).and_then(|f| f.page_mut(key.page_index));
        let Some(info) = page.and_then(|p| p.flush_for_eviction()) else {
            return Ok(());
        };
        self.write_flush(vec![info], Vec::new(), false)
    }

    fn write_flush(&mut self, infos: Vec<FlushInfo>, op_files: Vec<u32>, finalize: bool) -> RawResult<()> {
        for info in &infos {
            info.begin();
        }
        let mut reached = FlushStage::Start;
        let result = self.write_stages(&infos, &op_files, finalize, &mut reached);
        for info in &infos {
            info.end();
        }
        if let Err(e) = &result {
            tracing::error!(error = %e, stage = ?reached, "flush failed");
            self.requeue(infos, &op_files, finalize && reached < FlushStage::RedoPhaseMarked);
        }
        result
    }

    /// Give a failed flush's work back to the next one. Pages are returned
    /// only while the flush had not completed on disk.
    fn requeue(&mut self, infos: Vec<FlushInfo>, op_files: &[u32], pages: bool) {
        for index in op_files {
            if self.files.raw(*index).map_or(false, |f| f.pending_op().is_some()) {
                self.pending_ops.insert(*index);
            }
        }
        if !pages {
            return;
        }
        for info in infos {
            let key = info.key;
            let Some(file) = self.files.raw_mut(key.file_index) else {
                continue;
            };
            let page_size = file.page_size() as u64;
            if let Some(page) = file.page_mut(key.page_index) {
                page.restore_flush(info);
                self.committed.insert(key);
                self.committed_size += page_size;
            }
        }
    }

    fn reach(&mut self, reached: &mut FlushStage, stage: FlushStage) -> bool {
        *reached = stage;
        self.crash_at(stage)
    }

    fn write_stages(
        &mut self,
        infos: &[FlushInfo],
        op_files: &[u32],
        finalize: bool,
        reached: &mut FlushStage,
    ) -> RawResult<()> {
        let touched: BTreeSet<u32> = infos.iter().map(|i| i.key.file_index).chain(op_files.iter().copied()).collect();
        let logged: Vec<u32> = touched
            .iter()
            .copied()
            .filter(|i| self.files.raw(*i).map_or(false, |f| !f.is_temporary()))
            .collect();

        // Stage 1: before-images
        if !logged.is_empty() {
            let manifest: Vec<FileManifestEntry> = logged
                .iter()
                .filter_map(|i| self.files.raw(*i).map(|f| f.manifest_entry()))
                .collect();
            let mut images = Vec::new();
            for info in infos {
                let Some(file) = self.files.raw(info.key.file_index) else {
                    continue;
                };
                if file.is_temporary() {
                    continue;
                }
                let on_disk = info.key.page_index * (file.page_size() as u64) < file.flush_size();
                if let (true, Some(saved)) = (on_disk, info.saved.as_ref()) {
                    images.push(PageImage {
                        file_index: info.key.file_index,
                        page_index: info.key.page_index,
                        data: saved.bytes().to_vec(),
                    });
                }
            }
            self.log.undo().append(manifest, images)?;
            self.stats.record_undo_record();
        }
        if self.reach(reached, FlushStage::UndoWritten) {
            return Ok(());
        }

        // Stage 2: pages
        let mut bytes = 0u64;
        for info in infos {
            if let Some(file) = self.files.raw_mut(info.key.file_index) {
                bytes += file.write_page(info.key.page_index, info.region.bytes())?;
            }
        }
        for index in &touched {
            if let Some(file) = self.files.raw_mut(*index) {
                file.sync()?;
            }
        }
        self.stats.record_flush(infos.len() as u64, bytes);
        self.observer.on_flush(infos.len(), bytes);
        if self.reach(reached, FlushStage::PagesWritten) {
            return Ok(());
        }
        if !finalize {
            return Ok(());
        }

        // Stage 3: the flush is complete from here on
        if !logged.is_empty() {
            let manifest: Vec<FileManifestEntry> = logged
                .iter()
                .filter_map(|i| self.files.raw(*i).map(|f| f.final_manifest_entry()))
                .collect();
            self.log.undo().mark_redo_phase(manifest)?;
        }
        if self.reach(reached, FlushStage::RedoPhaseMarked) {
            return Ok(());
        }

        // Stage 4
        self.log.redo().clear()?;
        self.redo_pending.clear();
        if self.reach(reached, FlushStage::RedoCleared) {
            return Ok(());
        }

        // Stage 5
        let mut removed_any = false;
        for index in op_files {
            let Some(file) = self.files.raw_mut(*index) else {
                continue;
            };
            match file.pending_op() {
                Some(PendingFileOp::Delete) => {
                    file.remove_from_disk()?;
                    self.files.evict(*index);
                    removed_any = true;
                }
                Some(PendingFileOp::Truncate(size)) => file.apply_truncate(size)?,
                None => {}
            }
        }
        if removed_any {
            sync_dir(self.log.dir())?;
        }
        if self.reach(reached, FlushStage::FilesApplied) {
            return Ok(());
        }

        // Stage 6
        if !self.log.undo().is_empty() {
            self.log.undo().clear()?;
        }
        tracing::debug!(pages = infos.len(), bytes, "flush complete");
        Ok(())
    }

    /// Write after-images of pages committed since the last redo write.
    fn write_redo(&mut self) -> RawResult<()> {
        if self.crashed {
            return Ok(());
        }
        let mut manifest = Vec::new();
        let mut images = Vec::new();
        let mut seen = BTreeSet::new();
        for key in std::mem::take(&mut self.redo_pending) {
            let Some(file) = self.files.raw(key.file_index) else {
                continue;
            };
            if file.is_temporary() {
                continue;
            }
            let Some(page) = file.page(key.page_index) else {
                continue;
            };
            if seen.insert(key.file_index) {
                manifest.push(FileManifestEntry {
                    file_index: key.file_index,
                    page_size: file.page_size() as u32,
                    exists: true,
                    size: file.size(),
                    path: file.path().to_path_buf(),
                });
            }
            images.push(PageImage {
                file_index: key.file_index,
                page_index: key.page_index,
                data: page.read_region().bytes().to_vec(),
            });
        }
        self.committed_size = 0;
        if images.is_empty() {
            return Ok(());
        }
        self.log.redo().append(manifest, images)?;
        self.stats.record_redo_record();
        Ok(())
    }
}

impl PageHost for PageManager {
    fn status(&self, key: PageKey) -> Option<PageStatus> {
        let page = self.files.raw(key.file_index)?.page(key.page_index)?;
        Some(PageStatus {
            modified: page.is_modified(),
            committed: page.is_committed(),
            flushing: page.is_flushing(),
            last_access: page.last_access(),
        })
    }

    fn unload(&mut self, key: PageKey) -> Option<(Arc<Region>, Option<Region>)> {
        let page = self.files.raw_mut(key.file_index)?.unload_page(key.page_index)?;
        self.stats.record_page_unloaded();
        self.observer.on_page_unloaded(key);
        Some(page.into_regions())
    }

    fn flush_all(&mut self) -> RawResult<()> {
        self.flush(true)
    }

    fn flush_modified(&mut self, key: PageKey) -> RawResult<()> {
        self.flush_for_eviction(key)
    }
}
