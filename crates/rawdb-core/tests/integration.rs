//! Integration tests: RawDatabase end to end.
//!
//! These tests drive the public API only: files are bound, transactions are
//! submitted from caller threads and run on the executor, and state is
//! checked after closing and reopening the directory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use rawdb_core::{
    FileSpec, FnOperation, RawDatabase, RawDbConfig, RawDbError, RawOperation, RegionRead, Transaction, TxOptions,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(dir: &std::path::Path) -> RawDbConfig {
    let mut config = RawDbConfig::small(dir);
    config.page_types[0].page_size = 256;
    config
}

fn test_db() -> (RawDatabase, TempDir) {
    let dir = TempDir::new().unwrap();
    let db = RawDatabase::open(config(dir.path())).unwrap();
    db.bind_file(1, FileSpec::new("data.db", 0)).unwrap();
    (db, dir)
}

fn read_u64(db: &RawDatabase, file: u32, page: u64) -> u64 {
    db.execute(TxOptions::READ_ONLY, move |tx| Ok(tx.read(file, page)?.read_u64(0))).unwrap()
}

fn write_u64(db: &RawDatabase, file: u32, page: u64, value: u64, options: TxOptions) {
    db.execute(options, move |tx| {
        tx.write(file, page)?.write_u64(0, value);
        Ok(())
    })
    .unwrap();
}

// ---------------------------------------------------------------------------
// Basic page operations
// ---------------------------------------------------------------------------

#[test]
fn test_write_then_read() {
    let (db, _dir) = test_db();
    write_u64(&db, 1, 0, 11, TxOptions::NONE);
    write_u64(&db, 1, 5, 55, TxOptions::NONE);

    assert_eq!(read_u64(&db, 1, 0), 11);
    assert_eq!(read_u64(&db, 1, 5), 55);
    // Pages between were never written and read as zeros.
    assert_eq!(read_u64(&db, 1, 3), 0);

    let size = db.execute(TxOptions::READ_ONLY, |tx| tx.file_size(1)).unwrap();
    assert_eq!(size, 6 * 256);
}

#[test]
fn test_read_only_transaction_cannot_write() {
    let (db, _dir) = test_db();
    let result = db.execute(TxOptions::READ_ONLY, |tx| tx.write(1, 0).map(|_| ()));
    assert!(matches!(result, Err(RawDbError::ReadOnly { .. })));
}

#[test]
fn test_unbound_file_reported() {
    let (db, _dir) = test_db();
    let result = db.execute(TxOptions::NONE, |tx| tx.write(42, 0).map(|_| ()));
    assert!(matches!(result, Err(RawDbError::FileNotFound { file_index: 42 })));
}

#[test]
fn test_values_survive_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let db = RawDatabase::open(config(dir.path())).unwrap();
        db.bind_file(1, FileSpec::new("data.db", 0)).unwrap();
        for page in 0..20u64 {
            write_u64(&db, 1, page, page * 3, TxOptions::NONE);
        }
        db.close();
    }

    let db = RawDatabase::open(config(dir.path())).unwrap();
    assert!(db.recovery_report().is_clean());
    db.bind_file(1, FileSpec::new("data.db", 0)).unwrap();
    for page in 0..20u64 {
        assert_eq!(read_u64(&db, 1, page), page * 3);
    }
}

// ---------------------------------------------------------------------------
// Copy-on-write isolation
// ---------------------------------------------------------------------------

#[test]
fn test_snapshot_isolated_from_writes() {
    let (db, _dir) = test_db();
    write_u64(&db, 1, 0, 1, TxOptions::NONE);

    let old = db
        .execute(TxOptions::NONE, |tx| {
            let before = tx.snapshot(1, 0)?;
            tx.write(1, 0)?.write_u64(0, 2);
            // The transaction sees its own write; the snapshot does not.
            assert_eq!(tx.read(1, 0)?.read_u64(0), 2);
            assert_eq!(before.read_u64(0), 1);
            Ok(before)
        })
        .unwrap();

    assert_eq!(old.read_u64(0), 1);
    assert_eq!(read_u64(&db, 1, 0), 2);
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[test]
fn test_failed_operation_rolls_back() {
    let (db, _dir) = test_db();
    write_u64(&db, 1, 0, 7, TxOptions::NONE);

    let result = db.execute(TxOptions::NONE, |tx| -> rawdb_core::RawResult<()> {
        tx.write(1, 0)?.write_u64(0, 8);
        tx.write(1, 9)?.write_u64(0, 9);
        Err(RawDbError::Config { reason: "abort".to_string() })
    });
    assert!(matches!(result, Err(RawDbError::Config { .. })));

    assert_eq!(read_u64(&db, 1, 0), 7);
    let pages = db.execute(TxOptions::READ_ONLY, |tx| tx.page_count(1)).unwrap();
    assert_eq!(pages, 1);
    assert_eq!(db.stats().transactions_rolled_back, 1);
}

#[test]
fn test_bind_rolled_back_with_transaction() {
    let (db, _dir) = test_db();
    let result = db.execute(TxOptions::NONE, |tx| -> rawdb_core::RawResult<()> {
        tx.bind_file(2, &FileSpec::new("second.db", 0))?;
        tx.write(2, 0)?.write_u64(0, 1);
        Err(RawDbError::Config { reason: "abort".to_string() })
    });
    assert!(result.is_err());
    let bound = db.execute(TxOptions::READ_ONLY, |tx| Ok(tx.is_file_bound(2))).unwrap();
    assert!(!bound);
}

#[test]
fn test_clear_cache_request_keeps_committed_state() {
    let (db, _dir) = test_db();
    write_u64(&db, 1, 0, 100, TxOptions::NONE);

    let result = db.execute(TxOptions::NONE, |tx| -> rawdb_core::RawResult<()> {
        tx.write(1, 0)?.write_u64(0, 200);
        Err(RawDbError::ClearCacheRequested)
    });
    assert!(matches!(result, Err(RawDbError::ClearCacheRequested)));

    assert_eq!(read_u64(&db, 1, 0), 100);
    assert_eq!(db.stats().cache_clears, 1);
}

// ---------------------------------------------------------------------------
// File operations
// ---------------------------------------------------------------------------

#[test]
fn test_truncate_and_delete() {
    let (db, dir) = test_db();
    for page in 0..8u64 {
        write_u64(&db, 1, page, page + 1, TxOptions::NONE);
    }
    db.execute(TxOptions::NONE, |tx| tx.truncate_file(1, 3 * 256)).unwrap();
    assert_eq!(db.execute(TxOptions::READ_ONLY, |tx| tx.page_count(1)).unwrap(), 3);
    assert_eq!(read_u64(&db, 1, 2), 3);

    db.execute(TxOptions::NONE, |tx| tx.delete_file(1)).unwrap();
    db.flush(true).unwrap();
    assert!(!dir.path().join("data.db").exists());
}

#[test]
fn test_temporary_file_removed_on_close() {
    let dir = TempDir::new().unwrap();
    let db = RawDatabase::open(config(dir.path())).unwrap();
    db.bind_file(3, FileSpec::new("scratch.tmp", 0).temporary()).unwrap();
    write_u64(&db, 3, 0, 1, TxOptions::FLUSH);
    assert!(dir.path().join("scratch.tmp").exists());
    db.close();
    assert!(!dir.path().join("scratch.tmp").exists());
}

// ---------------------------------------------------------------------------
// Operation hooks and submission
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Hooks {
    started: AtomicUsize,
    committed: AtomicUsize,
    rolled_back: AtomicUsize,
}

struct Counted {
    hooks: Arc<Hooks>,
    fail: bool,
}

impl RawOperation for Counted {
    fn on_before_started(&mut self) {
        self.hooks.started.fetch_add(1, Ordering::SeqCst);
    }

    fn run(&mut self, tx: &mut Transaction<'_>) -> rawdb_core::RawResult<()> {
        tx.write(1, 0)?.write_u64(0, 1);
        Ok(())
    }

    fn validate(&mut self) -> rawdb_core::RawResult<()> {
        if self.fail {
            return Err(RawDbError::Config { reason: "validation failed".to_string() });
        }
        Ok(())
    }

    fn on_committed(&mut self) {
        self.hooks.committed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_rolled_back(&mut self, _error: &RawDbError) {
        self.hooks.rolled_back.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_lifecycle_hooks() {
    let (db, _dir) = test_db();
    let hooks = Arc::new(Hooks::default());

    db.transaction_sync(Counted { hooks: Arc::clone(&hooks), fail: false }).unwrap();
    assert!(db.transaction_sync(Counted { hooks: Arc::clone(&hooks), fail: true }).is_err());
    // Async submission: a later sync transaction runs after it.
    db.transaction(Counted { hooks: Arc::clone(&hooks), fail: false }).unwrap();
    read_u64(&db, 1, 0);

    assert_eq!(hooks.started.load(Ordering::SeqCst), 3);
    assert_eq!(hooks.committed.load(Ordering::SeqCst), 2);
    assert_eq!(hooks.rolled_back.load(Ordering::SeqCst), 1);
}

#[test]
fn test_many_threads_serialize_through_executor() {
    let (db, _dir) = test_db();
    let db = Arc::new(db);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for _ in 0..25 {
                    let op = FnOperation::new(TxOptions::NONE, |tx: &mut Transaction<'_>| {
                        let region = tx.write(1, 0)?;
                        let value = region.read_u64(0);
                        region.write_u64(0, value + 1);
                        Ok(())
                    });
                    db.transaction_sync(op).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(read_u64(&db, 1, 0), 200);
}

#[test]
fn test_reopen_after_clean_close() {
    let dir = TempDir::new().unwrap();
    let db = RawDatabase::open(config(dir.path())).unwrap();
    db.bind_file(1, FileSpec::new("data.db", 0)).unwrap();
    write_u64(&db, 1, 0, 5, TxOptions::DURABLE);
    db.close();

    let db = RawDatabase::open(config(dir.path())).unwrap();
    assert!(db.recovery_report().is_clean());
    db.bind_file(1, FileSpec::new("data.db", 0)).unwrap();
    assert_eq!(read_u64(&db, 1, 0), 5);
}
