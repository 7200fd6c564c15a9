//! Batch operations: long-running, resumable work
//!
//! A batch operation runs as a series of ordinary transactions. Each run is
//! wrapped by [`RawDbBatchOperation`], which
//!
//! 1. applies the operation's cache settings (caching on/off, ring size,
//!    per-category cache ceilings)
//! 2. runs one slice of the operation
//! 3. writes the operation's state to the batch header page in the same
//!    transaction, or clears the header once the operation is complete
//! 4. relaxes the cache ceilings again before the commit
//!
//! so a restart resumes the operation from its last committed slice.
//!
//! Between slices the scheduler alternates a running phase of `run_period`
//! with an idle phase of `idle_period`, during which transactions the
//! operation's lock predicate allows get to run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{RawDbError, RawResult};
use crate::file_cache::BATCH_FILE_INDEX;
use crate::format::{encode_batch_header, ByteReader};
use crate::observer::RawDbObserver;
use crate::region::RegionRead;
use crate::stats::RawDbStats;
use crate::transaction::{OperationPredicate, RawOperation, Transaction, TxOptions};

/// Decides which transactions may run while a batch operation is active.
pub trait BatchLockPredicate: Send + Sync {
    fn allow(&self, read_only: bool, predicates: &[OperationPredicate]) -> bool;
}

/// Lets read-only transactions through, nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOnlyLock;

impl BatchLockPredicate for ReadOnlyLock {
    fn allow(&self, read_only: bool, _predicates: &[OperationPredicate]) -> bool {
        read_only
    }
}

/// Shared and exclusive locks on named resources.
///
/// Transactions touching an exclusively locked resource wait; so do
/// transactions writing a shared one. Everything else runs.
#[derive(Debug, Default, Clone)]
pub struct ResourceLock {
    shared: Vec<String>,
    exclusive: Vec<String>,
}

impl ResourceLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(mut self, resource: impl Into<String>) -> Self {
        self.shared.push(resource.into());
        self
    }

    pub fn exclusive(mut self, resource: impl Into<String>) -> Self {
        self.exclusive.push(resource.into());
        self
    }
}

impl BatchLockPredicate for ResourceLock {
    fn allow(&self, _read_only: bool, predicates: &[OperationPredicate]) -> bool {
        predicates.iter().all(|p| {
            !self.exclusive.iter().any(|r| *r == p.resource)
                && !(p.write && self.shared.iter().any(|r| *r == p.resource))
        })
    }
}

/// Result of one batch slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchProgress {
    /// More work left; run again later
    Continue,
    /// Done; the persisted state is cleared
    Complete,
}

/// Settings a batch operation controls, persisted with its state.
#[derive(Debug, Clone)]
pub struct BatchControl {
    caching_enabled: bool,
    invalidation_queue_size: u32,
    constraints: Vec<(String, u64)>,
    deadline: Instant,
}

impl BatchControl {
    pub(crate) fn new(invalidation_queue_size: u32) -> Self {
        Self { caching_enabled: true, invalidation_queue_size, constraints: Vec::new(), deadline: Instant::now() }
    }

    /// Cache pages the batch loads. Disabled, they are dropped after each slice.
    pub fn set_page_caching_enabled(&mut self, enabled: bool) {
        self.caching_enabled = enabled;
    }

    pub fn is_page_caching_enabled(&self) -> bool {
        self.caching_enabled
    }

    /// Number of uncached pages kept resident within one slice.
    pub fn set_invalidation_queue_size(&mut self, size: u32) {
        self.invalidation_queue_size = size.max(1);
    }

    pub fn invalidation_queue_size(&self) -> u32 {
        self.invalidation_queue_size
    }

    /// Cap the page cache of `category` at `bytes` while the batch runs.
    pub fn set_max_page_cache_size(&mut self, category: impl Into<String>, bytes: u64) {
        let category = category.into();
        match self.constraints.iter_mut().find(|(c, _)| *c == category) {
            Some(entry) => entry.1 = bytes,
            None => self.constraints.push((category, bytes)),
        }
    }

    pub fn constraints(&self) -> &[(String, u64)] {
        &self.constraints
    }

    /// True until this slice's share of the run period is used up.
    pub fn can_continue(&self) -> bool {
        Instant::now() < self.deadline
    }
}

/// Long-running work driven in slices.
pub trait BatchOperation: Send {
    /// Name the operation is registered under for restore.
    fn type_name(&self) -> &str;

    /// Run one slice. Long loops should stop when `control.can_continue()` turns false.
    fn run(&mut self, tx: &mut Transaction<'_>, control: &mut BatchControl) -> RawResult<BatchProgress>;

    /// State to resume from after a restart.
    fn save_state(&self) -> Vec<u8>;

    fn lock_predicate(&self) -> &dyn BatchLockPredicate {
        &ReadOnlyLock
    }
}

/// Persisted form of a batch operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOperationState {
    pub type_name: String,
    pub state: Vec<u8>,
    pub caching_enabled: bool,
    pub invalidation_queue_size: u32,
    pub constraints: Vec<(String, u64)>,
}

impl BatchOperationState {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.type_name.len() + self.state.len());
        put_str(&mut buf, &self.type_name);
        buf.push(u8::from(self.caching_enabled));
        buf.extend_from_slice(&self.invalidation_queue_size.to_le_bytes());
        buf.extend_from_slice(&(self.constraints.len() as u16).to_le_bytes());
        for (category, bytes) in &self.constraints {
            put_str(&mut buf, category);
            buf.extend_from_slice(&bytes.to_le_bytes());
        }
        buf.extend_from_slice(&(self.state.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.state);
        buf
    }

    pub fn from_bytes(bytes: &[u8]) -> RawResult<Self> {
        let mut reader = ByteReader::new(bytes);
        let type_name = get_str(&mut reader)?;
        let caching_enabled = reader.u8()? != 0;
        let invalidation_queue_size = reader.u32()?;
        let count = reader.u16()? as usize;
        let mut constraints = Vec::with_capacity(count);
        for _ in 0..count {
            let category = get_str(&mut reader)?;
            constraints.push((category, reader.u64()?));
        }
        let len = reader.u32()? as usize;
        let state = reader.bytes(len)?.to_vec();
        Ok(Self { type_name, state, caching_enabled, invalidation_queue_size, constraints })
    }

    pub(crate) fn control(&self) -> BatchControl {
        BatchControl {
            caching_enabled: self.caching_enabled,
            invalidation_queue_size: self.invalidation_queue_size.max(1),
            constraints: self.constraints.clone(),
            deadline: Instant::now(),
        }
    }
}

fn put_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

fn get_str(reader: &mut ByteReader<'_>) -> RawResult<String> {
    let len = reader.u16()? as usize;
    let offset = reader.position();
    let bytes = reader.bytes(len)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| RawDbError::Corrupted {
        path: "<batch header>".into(),
        offset: offset as u64,
        reason: "batch state string is not UTF-8".to_string(),
    })
}

/// Scheduling phase of a batch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchRunState {
    Running { since: Instant },
    Idle { since: Instant },
}

/// Transaction wrapper that drives a [`BatchOperation`] slice by slice.
pub struct RawDbBatchOperation {
    inner: Box<dyn BatchOperation>,
    control: BatchControl,
    run_state: BatchRunState,
    run_period: Duration,
    idle_period: Duration,
    complete: bool,
    failed: bool,
    started: bool,
    pending_state: Option<BatchOperationState>,
    current: Arc<Mutex<Option<BatchOperationState>>>,
    observer: Arc<dyn RawDbObserver>,
    stats: Arc<RawDbStats>,
}

impl RawDbBatchOperation {
    pub(crate) fn new(
        inner: Box<dyn BatchOperation>,
        control: BatchControl,
        run_period: Duration,
        idle_period: Duration,
        current: Arc<Mutex<Option<BatchOperationState>>>,
        observer: Arc<dyn RawDbObserver>,
        stats: Arc<RawDbStats>,
    ) -> Self {
        Self {
            inner,
            control,
            run_state: BatchRunState::Running { since: Instant::now() },
            run_period,
            idle_period,
            complete: false,
            failed: false,
            started: false,
            pending_state: None,
            current,
            observer,
            stats,
        }
    }

    pub fn type_name(&self) -> &str {
        self.inner.type_name()
    }

    pub fn control(&self) -> &BatchControl {
        &self.control
    }

    pub fn run_state(&self) -> BatchRunState {
        self.run_state
    }

    /// Completed, or failed with an error that rolled back its last slice.
    pub fn is_finished(&self) -> bool {
        self.complete || self.failed
    }

    pub(crate) fn allows(&self, read_only: bool, predicates: &[OperationPredicate]) -> bool {
        self.inner.lock_predicate().allow(read_only, predicates)
    }

    /// Start a fresh running phase.
    pub(crate) fn begin_running(&mut self, now: Instant) {
        self.run_state = BatchRunState::Running { since: now };
    }

    /// Whether the batch may run now, switching phase when one has elapsed.
    pub fn can_continue(&mut self, now: Instant) -> bool {
        match self.run_state {
            BatchRunState::Running { since } => {
                if now.saturating_duration_since(since) < self.run_period {
                    return true;
                }
                self.run_state = BatchRunState::Idle { since: now };
                false
            }
            BatchRunState::Idle { since } => {
                if now.saturating_duration_since(since) < self.idle_period {
                    return false;
                }
                self.run_state = BatchRunState::Running { since: now };
                true
            }
        }
    }

    /// When an idle phase ends, if the batch is idle.
    pub fn idle_deadline(&self) -> Option<Instant> {
        match self.run_state {
            BatchRunState::Idle { since } => Some(since + self.idle_period),
            BatchRunState::Running { .. } => None,
        }
    }

    fn snapshot(&self) -> BatchOperationState {
        BatchOperationState {
            type_name: self.inner.type_name().to_string(),
            state: self.inner.save_state(),
            caching_enabled: self.control.caching_enabled,
            invalidation_queue_size: self.control.invalidation_queue_size,
            constraints: self.control.constraints.clone(),
        }
    }

    fn run_slice(&mut self, tx: &mut Transaction<'_>) -> RawResult<()> {
        let storage = tx.storage();
        storage.set_page_caching_enabled(self.control.caching_enabled);
        storage.set_non_cached_limit(self.control.invalidation_queue_size as usize);
        storage.set_batch_ceilings(&self.control.constraints);
        self.control.deadline = Instant::now() + self.run_period;

        let progress = self.inner.run(tx, &mut self.control)?;
        self.complete = progress == BatchProgress::Complete;

        let header = if self.complete {
            self.pending_state = None;
            encode_batch_header(None)
        } else {
            let state = self.snapshot();
            let header = encode_batch_header(Some(&state.to_bytes()));
            self.pending_state = Some(state);
            header
        };
        let region = tx.write(BATCH_FILE_INDEX, 0)?;
        if header.len() > region.len() {
            return Err(RawDbError::BatchStateTooLarge { size: header.len(), page_size: region.len() });
        }
        region.fill(0);
        region.write_bytes(0, &header);
        Ok(())
    }
}

impl RawOperation for RawDbBatchOperation {
    fn options(&self) -> TxOptions {
        TxOptions::NONE
    }

    fn on_before_started(&mut self) {
        if !self.started {
            self.started = true;
            tracing::info!(batch = %self.inner.type_name(), "batch operation started");
            self.observer.on_batch_started(self.inner.type_name());
        }
    }

    fn run(&mut self, tx: &mut Transaction<'_>) -> RawResult<()> {
        let result = self.run_slice(tx);
        tx.storage().relax_batch_ceilings();
        result
    }

    fn on_committed(&mut self) {
        self.stats.record_batch_run();
        *self.current.lock() = self.pending_state.take();
        if self.complete {
            tracing::info!(batch = %self.inner.type_name(), "batch operation completed");
            self.observer.on_batch_completed(self.inner.type_name());
        }
    }

    fn on_rolled_back(&mut self, error: &RawDbError) {
        self.complete = false;
        self.pending_state = None;
        if !error.is_clear_cache() {
            tracing::error!(batch = %self.inner.type_name(), error = %error, "batch operation failed");
            self.failed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_bytes() {
        let state = BatchOperationState {
            type_name: "reindex".to_string(),
            state: vec![1, 2, 3],
            caching_enabled: false,
            invalidation_queue_size: 32,
            constraints: vec![("default".to_string(), 1 << 20), ("blobs".to_string(), 4096)],
        };
        assert_eq!(BatchOperationState::from_bytes(&state.to_bytes()).unwrap(), state);
        assert!(BatchOperationState::from_bytes(&state.to_bytes()[..5]).is_err());
    }

    #[test]
    fn test_resource_lock() {
        let lock = ResourceLock::new().shared("index").exclusive("blobs");
        assert!(lock.allow(false, &[]));
        assert!(lock.allow(true, &[OperationPredicate::read("index")]));
        assert!(!lock.allow(false, &[OperationPredicate::write("index")]));
        assert!(!lock.allow(true, &[OperationPredicate::read("blobs")]));
        assert!(lock.allow(false, &[OperationPredicate::write("other")]));
    }

    #[test]
    fn test_read_only_lock() {
        assert!(ReadOnlyLock.allow(true, &[]));
        assert!(!ReadOnlyLock.allow(false, &[]));
    }

    #[test]
    fn test_control_constraints_replace_by_category() {
        let mut control = BatchControl::new(16);
        control.set_max_page_cache_size("default", 100);
        control.set_max_page_cache_size("default", 200);
        assert_eq!(control.constraints(), &[("default".to_string(), 200)]);
        control.set_invalidation_queue_size(0);
        assert_eq!(control.invalidation_queue_size(), 1);
    }
}
