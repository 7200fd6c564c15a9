//! RawDb Core: Page-Oriented Transactional Storage Engine
//!
//! Data lives in page-indexed files. Pages are cached in memory per page
//! type under a byte quota and changed copy-on-write inside transactions,
//! which run one at a time on a single executor thread.
//!
//! # Architecture
//!
//! - **Read path**: committed page snapshots served from the page cache
//! - **Write path**: private write regions, promoted to snapshots on commit
//! - **Flush**: pre-images to `tx.log`, pages to their files, then the log
//!   is cleared; durable commits go to `txr.log` first
//! - **Recovery**: redo replay, then undo rollback, on every open
//! - **Batch operations**: long jobs run in resumable slices that share the
//!   executor with ordinary transactions
//!
//! # Example
//!
//! ```no_run
//! use rawdb_core::{FileSpec, RawDatabase, RawDbConfig, TxOptions};
//!
//! let db = RawDatabase::open(RawDbConfig::small("/tmp/rawdb")).unwrap();
//! db.bind_file(1, FileSpec::new("items.db", 0)).unwrap();
//! db.execute(TxOptions::DURABLE, |tx| {
//!     tx.write(1, 0)?.write_u64(0, 42);
//!     Ok(())
//! })
//! .unwrap();
//! ```

pub mod batch;
pub mod batch_manager;
pub mod config;
pub mod database;
pub mod datafile;
pub mod error;
pub mod file_cache;
pub mod format;
pub mod manager;
pub mod observer;
pub mod page;
pub mod page_cache;
pub mod page_manager;
pub mod platform_advice;
pub mod platform_durability;
pub mod proxy;
pub(crate) mod queue;
pub mod region;
pub mod region_pool;
pub mod stats;
pub mod storage;
pub mod timer;
pub mod transaction;
pub mod txlog;

// Re-export key types for convenience
pub use batch::{
    BatchControl, BatchLockPredicate, BatchOperation, BatchOperationState, BatchProgress, BatchRunState,
    RawDbBatchOperation, ReadOnlyLock, ResourceLock,
};
pub use batch_manager::{BatchManager, BatchOperationFactory};
pub use config::{PageTypeConfig, RawDbConfig, RegionMemoryKind};
pub use database::{DatabaseOptions, RawDatabase};
pub use error::{RawDbError, RawResult};
pub use file_cache::{FileSpec, BATCH_FILE_INDEX};
pub use manager::TransactionManager;
pub use observer::{NoopObserver, RawDbObserver};
pub use page::PageKey;
pub use page_manager::FlushStage;
pub use proxy::PageProxy;
pub use region::{Region, RegionRead};
pub use stats::{RawDbStats, StatsSnapshot};
pub use storage::Storage;
pub use transaction::{FnOperation, OperationPredicate, RawOperation, Transaction, TxOptions};
pub use txlog::{RecoveryReport, TransactionLog};
