//! Observer hooks
//!
//! An observer is handed to the database at open and called from the
//! executor thread. Every hook defaults to doing nothing.

use crate::page::PageKey;
use crate::txlog::RecoveryReport;

/// Callbacks for storage events.
pub trait RawDbObserver: Send + Sync {
    fn on_page_loaded(&self, _key: PageKey) {}

    fn on_page_unloaded(&self, _key: PageKey) {}

    /// A flush wrote `pages` pages, `bytes` bytes in total.
    fn on_flush(&self, _pages: usize, _bytes: u64) {}

    fn on_transaction_completed(&self, _committed: bool) {}

    fn on_cache_cleared(&self) {}

    fn on_recovery(&self, _report: &RecoveryReport) {}

    fn on_batch_started(&self, _type_name: &str) {}

    fn on_batch_completed(&self, _type_name: &str) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RawDbObserver for NoopObserver {}
