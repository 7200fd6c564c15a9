//! Storage statistics
//!
//! Counters are written by the executor thread and read from anywhere.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared between the executor and callers.
#[derive(Debug, Default)]
pub struct RawDbStats {
    transactions_committed: AtomicU64,
    transactions_rolled_back: AtomicU64,
    flushes: AtomicU64,
    pages_flushed: AtomicU64,
    bytes_flushed: AtomicU64,
    pages_loaded: AtomicU64,
    pages_unloaded: AtomicU64,
    undo_records: AtomicU64,
    redo_records: AtomicU64,
    cache_clears: AtomicU64,
    batch_runs: AtomicU64,
}

/// Point-in-time copy of [`RawDbStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub transactions_committed: u64,
    pub transactions_rolled_back: u64,
    pub flushes: u64,
    pub pages_flushed: u64,
    pub bytes_flushed: u64,
    pub pages_loaded: u64,
    pub pages_unloaded: u64,
    pub undo_records: u64,
    pub redo_records: u64,
    pub cache_clears: u64,
    pub batch_runs: u64,
}

impl RawDbStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transaction(&self, committed: bool) {
        if committed {
            self.transactions_committed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_flush(&self, pages: u64, bytes: u64) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.pages_flushed.fetch_add(pages, Ordering::Relaxed);
        self.bytes_flushed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_page_loaded(&self) {
        self.pages_loaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_page_unloaded(&self) {
        self.pages_unloaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_undo_record(&self) {
        self.undo_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_redo_record(&self) {
        self.redo_records.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_clear(&self) {
        self.cache_clears.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_run(&self) {
        self.batch_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transactions_committed: self.transactions_committed.load(Ordering::Relaxed),
            transactions_rolled_back: self.transactions_rolled_back.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            pages_flushed: self.pages_flushed.load(Ordering::Relaxed),
            bytes_flushed: self.bytes_flushed.load(Ordering::Relaxed),
            pages_loaded: self.pages_loaded.load(Ordering::Relaxed),
            pages_unloaded: self.pages_unloaded.load(Ordering::Relaxed),
            undo_records: self.undo_records.load(Ordering::Relaxed),
            redo_records: self.redo_records.load(Ordering::Relaxed),
            cache_clears: self.cache_clears.load(Ordering::Relaxed),
            batch_runs: self.batch_runs.load(Ordering::Relaxed),
        }
    }
}
