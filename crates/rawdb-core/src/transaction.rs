//! Transactions and the operations that run inside them
//!
//! An operation is submitted to the database and runs on the executor
//! thread with exclusive access to the storage. Its lifecycle:
//!
//! ```text
//! on_before_started -> begin -> run -> validate -> on_before_committed -> commit -> on_committed
//!                                 \________________ error _______________
//!                                                                        \-> on_before_rolled_back -> rollback -> on_rolled_back
//! ```
//!
//! Returning [`RawDbError::ClearCacheRequested`] from `run` rolls the
//! transaction back and clears every cache; it is not logged as a failure.

use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use crate::error::{RawDbError, RawResult};
use crate::file_cache::FileSpec;
use crate::page::PageKey;
use crate::proxy::PageProxy;
use crate::region::Region;
use crate::storage::Storage;

/// Transaction options bitmask.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TxOptions(u8);

impl TxOptions {
    pub const NONE: TxOptions = TxOptions(0);
    /// No page, file or binding may change
    pub const READ_ONLY: TxOptions = TxOptions(1);
    /// Flush synchronously before and after the transaction
    pub const FLUSH: TxOptions = TxOptions(1 << 1);
    /// Commit to the redo log before returning
    pub const DURABLE: TxOptions = TxOptions(1 << 2);

    pub const fn contains(self, other: TxOptions) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for TxOptions {
    type Output = TxOptions;

    fn bitor(self, rhs: TxOptions) -> TxOptions {
        TxOptions(self.0 | rhs.0)
    }
}

impl fmt::Debug for TxOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(TxOptions::READ_ONLY) {
            names.push("READ_ONLY");
        }
        if self.contains(TxOptions::FLUSH) {
            names.push("FLUSH");
        }
        if self.contains(TxOptions::DURABLE) {
            names.push("DURABLE");
        }
        if names.is_empty() {
            names.push("NONE");
        }
        write!(f, "TxOptions({})", names.join(" | "))
    }
}

/// A named resource an operation touches, checked against running batch locks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationPredicate {
    pub resource: String,
    pub write: bool,
}

impl OperationPredicate {
    pub fn read(resource: impl Into<String>) -> Self {
        Self { resource: resource.into(), write: false }
    }

    pub fn write(resource: impl Into<String>) -> Self {
        Self { resource: resource.into(), write: true }
    }
}

/// Work run inside one transaction.
///
/// Only `run` is required. The hooks run on the executor thread around it.
pub trait RawOperation: Send {
    fn options(&self) -> TxOptions {
        TxOptions::NONE
    }

    /// Resources this operation touches, for batch admission control.
    fn predicates(&self) -> &[OperationPredicate] {
        &[]
    }

    fn on_before_started(&mut self) {}

    fn run(&mut self, tx: &mut Transaction<'_>) -> RawResult<()>;

    /// Last chance to reject the transaction's changes. Skipped for read-only transactions.
    fn validate(&mut self) -> RawResult<()> {
        Ok(())
    }

    fn on_before_committed(&mut self) {}

    fn on_committed(&mut self) {}

    fn on_before_rolled_back(&mut self, _error: &RawDbError) {}

    fn on_rolled_back(&mut self, _error: &RawDbError) {}
}

/// A closure submitted as an operation.
pub struct FnOperation<F> {
    options: TxOptions,
    predicates: Vec<OperationPredicate>,
    body: F,
}

impl<F> FnOperation<F>
where
    F: FnMut(&mut Transaction<'_>) -> RawResult<()> + Send,
{
    pub fn new(options: TxOptions, body: F) -> Self {
        Self { options, predicates: Vec::new(), body }
    }

    pub fn with_predicate(mut self, predicate: OperationPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }
}

impl<F> RawOperation for FnOperation<F>
where
    F: FnMut(&mut Transaction<'_>) -> RawResult<()> + Send,
{
    fn options(&self) -> TxOptions {
        self.options
    }

    fn predicates(&self) -> &[OperationPredicate] {
        &self.predicates
    }

    fn run(&mut self, tx: &mut Transaction<'_>) -> RawResult<()> {
        (self.body)(tx)
    }
}

/// The running transaction, as seen by an operation.
pub struct Transaction<'a> {
    storage: &'a mut Storage,
    options: TxOptions,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(storage: &'a mut Storage, options: TxOptions) -> Self {
        Self { storage, options }
    }

    pub fn options(&self) -> TxOptions {
        self.options
    }

    pub fn is_read_only(&self) -> bool {
        self.options.contains(TxOptions::READ_ONLY)
    }

    fn check_writable(&self, what: &str) -> RawResult<()> {
        if self.is_read_only() {
            return Err(RawDbError::ReadOnly { what: format!("{} in read-only transaction", what) });
        }
        Ok(())
    }

    /// Page content as this transaction sees it, including its own writes.
    pub fn read(&mut self, file_index: u32, page_index: u64) -> RawResult<&Region> {
        self.storage.current_page(PageKey::new(file_index, page_index))
    }

    /// The last committed content of a page. The snapshot stays valid and
    /// unchanged after later commits.
    pub fn snapshot(&mut self, file_index: u32, page_index: u64) -> RawResult<Arc<Region>> {
        self.storage.read_page(PageKey::new(file_index, page_index))
    }

    /// Writable view of a page, copied from its committed content on first access.
    pub fn write(&mut self, file_index: u32, page_index: u64) -> RawResult<&mut Region> {
        self.check_writable("page write")?;
        self.storage.write_page(PageKey::new(file_index, page_index))
    }

    /// Bind a data file; the binding is undone if the transaction rolls back.
    pub fn bind_file(&mut self, file_index: u32, spec: &FileSpec) -> RawResult<bool> {
        self.check_writable("file bind")?;
        self.storage.bind_file(file_index, spec)
    }

    pub fn delete_file(&mut self, file_index: u32) -> RawResult<()> {
        self.check_writable("file delete")?;
        self.storage.delete_file(file_index)
    }

    /// Shrink a file to `size` bytes, rounded up to whole pages.
    pub fn truncate_file(&mut self, file_index: u32, size: u64) -> RawResult<()> {
        self.check_writable("file truncate")?;
        self.storage.truncate_file(file_index, size)
    }

    /// Logical size of a file in bytes.
    pub fn file_size(&self, file_index: u32) -> RawResult<u64> {
        self.storage.file_size(file_index)
    }

    /// Logical size of a file in pages.
    pub fn page_count(&self, file_index: u32) -> RawResult<u64> {
        self.storage.page_count(file_index)
    }

    pub fn is_file_bound(&self, file_index: u32) -> bool {
        self.storage.is_file_bound(file_index)
    }

    /// A long-lived handle to a page, resolvable in later transactions.
    pub fn proxy(&mut self, file_index: u32, page_index: u64) -> PageProxy {
        self.storage.proxy(PageKey::new(file_index, page_index))
    }

    /// Page content behind a proxy, reloading the page if it was evicted.
    pub fn resolve(&mut self, proxy: &PageProxy) -> RawResult<&Region> {
        self.storage.resolve(proxy)
    }

    /// Pages loaded while caching is disabled stay out of the cache and are
    /// dropped when the transaction ends.
    pub fn set_page_caching_enabled(&mut self, enabled: bool) {
        self.storage.set_page_caching_enabled(enabled);
    }

    pub(crate) fn storage(&mut self) -> &mut Storage {
        self.storage
    }
}

/// Run `op` as one transaction against `storage`.
pub(crate) fn run_transaction(storage: &mut Storage, op: &mut dyn RawOperation) -> RawResult<()> {
    let options = op.options();
    op.on_before_started();
    if let Err(e) = storage.begin(options) {
        tracing::warn!(error = %e, "transaction failed to start");
        storage.rollback(false);
        storage.end_transaction(false);
        return Err(e);
    }

    let result = Transaction::new(storage, options).run(op);
    let result = match result {
        Ok(()) if !options.contains(TxOptions::READ_ONLY) => op.validate(),
        other => other,
    };

    let outcome = match result {
        Ok(()) => {
            op.on_before_committed();
            match storage.commit(options) {
                Ok(()) => {
                    op.on_committed();
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(error = %e, "transaction commit failed");
                    Err(e)
                }
            }
        }
        Err(e) => {
            if !e.is_clear_cache() {
                tracing::warn!(error = %e, "transaction rolled back");
            }
            op.on_before_rolled_back(&e);
            storage.rollback(e.is_clear_cache());
            op.on_rolled_back(&e);
            Err(e)
        }
    };
    storage.end_transaction(outcome.is_ok());
    outcome
}

impl Transaction<'_> {
    fn run(mut self, op: &mut dyn RawOperation) -> RawResult<()> {
        op.run(&mut self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_bits() {
        let options = TxOptions::FLUSH | TxOptions::DURABLE;
        assert!(options.contains(TxOptions::FLUSH));
        assert!(options.contains(TxOptions::DURABLE));
        assert!(!options.contains(TxOptions::READ_ONLY));
        assert!(options.contains(TxOptions::NONE));
        assert_eq!(format!("{:?}", options), "TxOptions(FLUSH | DURABLE)");
        assert_eq!(format!("{:?}", TxOptions::NONE), "TxOptions(NONE)");
    }

    #[test]
    fn test_fn_operation_carries_options_and_predicates() {
        let op = FnOperation::new(TxOptions::READ_ONLY, |_tx: &mut Transaction<'_>| Ok(()))
            .with_predicate(OperationPredicate::read("index"));
        assert_eq!(op.options(), TxOptions::READ_ONLY);
        assert_eq!(op.predicates(), &[OperationPredicate::read("index")]);
    }
}
