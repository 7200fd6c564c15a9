//! RawDb database facade
//!
//! `RawDatabase` ties the pieces together. Opening a database:
//!
//! 1. validates the configuration
//! 2. recovers the data files from `tx.log` / `txr.log`
//! 3. binds the batch header file and rebuilds any unfinished batch operation
//! 4. moves the storage onto the executor thread and starts the timer
//!
//! All public methods take `&self` and may be called from any thread. Work
//! is serialized through the executor; synchronous calls block until their
//! transaction has committed or rolled back.

use std::sync::Arc;

use crate::batch::{BatchOperation, BatchOperationState};
use crate::batch_manager::{BatchManager, BatchOperationFactory};
use crate::config::RawDbConfig;
use crate::error::RawResult;
use crate::file_cache::FileSpec;
use crate::manager::TransactionManager;
use crate::observer::{NoopObserver, RawDbObserver};
#[cfg(any(test, feature = "fault-injection"))]
use crate::page_manager::FlushStage;
use crate::queue::Work;
use crate::stats::{RawDbStats, StatsSnapshot};
use crate::storage::Storage;
use crate::transaction::{RawOperation, Transaction, TxOptions};
use crate::txlog::RecoveryReport;

/// Collaborators injected at open.
#[derive(Clone)]
pub struct DatabaseOptions {
    pub observer: Arc<dyn RawDbObserver>,
    pub factories: Vec<Arc<dyn BatchOperationFactory>>,
}

impl DatabaseOptions {
    pub fn new() -> Self {
        Self { observer: Arc::new(NoopObserver), factories: Vec::new() }
    }

    pub fn observer(mut self, observer: Arc<dyn RawDbObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Register a factory used to resume persisted batch operations.
    pub fn batch_factory(mut self, factory: Arc<dyn BatchOperationFactory>) -> Self {
        self.factories.push(factory);
        self
    }
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// A page-oriented transactional database.
pub struct RawDatabase {
    config: Arc<RawDbConfig>,
    manager: TransactionManager,
    batches: BatchManager,
    stats: Arc<RawDbStats>,
    recovery: RecoveryReport,
}

impl RawDatabase {
    /// Open or create a database with no observer and no batch factories.
    pub fn open(config: RawDbConfig) -> RawResult<Self> {
        Self::open_with(config, DatabaseOptions::new())
    }

    pub fn open_with(config: RawDbConfig, options: DatabaseOptions) -> RawResult<Self> {
        let config = Arc::new(config);
        let stats = Arc::new(RawDbStats::new());
        let (mut storage, recovery) = Storage::open(Arc::clone(&config), Arc::clone(&options.observer), Arc::clone(&stats))?;
        if !recovery.is_clean() {
            tracing::info!(
                path = %config.primary_path().display(),
                redo_pages = recovery.redo_pages,
                undo_pages = recovery.undo_pages,
                errors = recovery.errors,
                "database recovered from transaction logs"
            );
        }

        let mut batches = BatchManager::new(
            config.batch_run_period,
            config.batch_idle_period,
            config.non_cached_queue_size as u32,
            Arc::clone(&options.observer),
            Arc::clone(&stats),
        );
        for factory in options.factories {
            batches.register(factory);
        }
        let resumed = batches.restore(&mut storage)?;

        let manager = TransactionManager::start(storage, config.timer_period)?;
        if let Some(batch) = resumed {
            tracing::info!(batch = %batch.type_name(), "resuming batch operation");
            manager.submit_work(Work::Batch(Box::new(batch)))?;
        }

        tracing::info!(path = %config.primary_path().display(), "database opened");
        Ok(Self { config, manager, batches, stats, recovery })
    }

    pub fn config(&self) -> &RawDbConfig {
        &self.config
    }

    /// What recovery did when this database was opened.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Queue an operation without waiting. The outcome reaches only the
    /// operation's own commit and rollback hooks.
    pub fn transaction(&self, op: impl RawOperation + 'static) -> RawResult<()> {
        self.manager.transaction(op)
    }

    /// Run an operation and wait for it to commit or roll back.
    pub fn transaction_sync(&self, op: impl RawOperation + 'static) -> RawResult<()> {
        self.manager.transaction_sync(op)
    }

    /// Run a closure as a transaction and return what it produced.
    pub fn execute<T, F>(&self, options: TxOptions, body: F) -> RawResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Transaction<'_>) -> RawResult<T> + Send + 'static,
    {
        self.manager.execute(options, body)
    }

    /// Bind a data file outside any transaction. Returns `true` if newly bound.
    pub fn bind_file(&self, file_index: u32, spec: FileSpec) -> RawResult<bool> {
        self.manager.command(move |storage: &mut Storage| storage.bind_file(file_index, &spec))
    }

    /// Schedule a batch operation. It starts once earlier work has run.
    pub fn start_batch(&self, op: impl BatchOperation + 'static) -> RawResult<()> {
        let batch = self.batches.wrap(Box::new(op));
        tracing::debug!(batch = %batch.type_name(), "batch operation queued");
        self.manager.submit_work(Work::Batch(Box::new(batch)))
    }

    /// State persisted by the last committed slice of an unfinished batch.
    pub fn batch_state(&self) -> Option<BatchOperationState> {
        self.batches.current()
    }

    /// Flush committed pages. With `sync` the flush runs now; otherwise it is
    /// requested for the next timer tick.
    pub fn flush(&self, sync: bool) -> RawResult<()> {
        self.manager.command(move |storage: &mut Storage| storage.flush(sync))
    }

    /// Change the quota of every page cache of `category`.
    pub fn set_cache_quota(&self, category: &str, bytes: u64) -> RawResult<()> {
        let category = category.to_string();
        self.manager.command(move |storage: &mut Storage| storage.set_cache_quota(&category, bytes))
    }

    /// Drop every cached page and reload state from disk.
    pub fn clear_cache(&self) -> RawResult<u64> {
        self.manager.command(|storage: &mut Storage| {
            storage.clear_all();
            Ok(storage.epoch())
        })
    }

    /// Abandon every later flush after `stage`, as if the process died there.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn set_crash_point(&self, stage: Option<FlushStage>) -> RawResult<()> {
        self.manager.command(move |storage: &mut Storage| {
            storage.set_crash_point(stage);
            Ok(())
        })
    }

    /// Finish running work, fail queued work, flush and close all files.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.manager.is_alive() {
            self.manager.close();
            tracing::info!(path = %self.config.primary_path().display(), "database closed");
        }
    }
}

impl Drop for RawDatabase {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::RegionRead;
    use tempfile::TempDir;

    #[test]
    fn test_open_write_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let db = RawDatabase::open(RawDbConfig::small(tmp.path())).unwrap();
            assert!(db.recovery_report().is_clean());
            assert!(db.bind_file(1, FileSpec::new("a.db", 0)).unwrap());
            db.execute(TxOptions::FLUSH, |tx| {
                tx.write(1, 3)?.write_u64(8, 0xDEAD_BEEF);
                Ok(())
            })
            .unwrap();
            assert!(db.stats().transactions_committed >= 1);
            db.close();
        }

        let db = RawDatabase::open(RawDbConfig::small(tmp.path())).unwrap();
        db.bind_file(1, FileSpec::new("a.db", 0)).unwrap();
        let (value, pages) = db
            .execute(TxOptions::READ_ONLY, |tx| Ok((tx.read(1, 3)?.read_u64(8), tx.page_count(1)?)))
            .unwrap();
        assert_eq!(value, 0xDEAD_BEEF);
        assert_eq!(pages, 4);
    }

    #[test]
    fn test_clear_cache_bumps_epoch() {
        let tmp = TempDir::new().unwrap();
        let db = RawDatabase::open(RawDbConfig::small(tmp.path())).unwrap();
        assert_eq!(db.clear_cache().unwrap(), 1);
        assert_eq!(db.clear_cache().unwrap(), 2);
    }

    #[test]
    fn test_unknown_quota_category_rejected() {
        let tmp = TempDir::new().unwrap();
        let db = RawDatabase::open(RawDbConfig::small(tmp.path())).unwrap();
        assert!(db.set_cache_quota("default", 1 << 20).is_ok());
        assert!(db.set_cache_quota("nope", 1 << 20).is_err());
    }
}
