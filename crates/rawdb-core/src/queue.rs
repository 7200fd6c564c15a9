//! Transaction queue with batch admission control
//!
//! Ordinary work runs in FIFO order. While a batch operation is active it
//! owns the executor for its running phase; when it yields (idle phase) the
//! queue admits one transaction per poll:
//!
//! 1. the oldest deferred transaction the batch's lock predicate allows
//! 2. else the next allowed transaction from the main queue; transactions
//!    the batch forbids move to the batch's pending list on the way
//!
//! Once the idle phase elapses the batch runs again regardless of backlog.
//! When the batch finishes, its pending list goes back to the front of the
//! main queue in order. Only one batch is active at a time; other batches
//! wait in the pending list.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::batch::RawDbBatchOperation;
use crate::error::RawResult;
use crate::manager::Completion;
use crate::storage::Storage;
use crate::transaction::{RawOperation, TxOptions};

/// Storage maintenance run on the executor outside any transaction.
pub(crate) type Command = Box<dyn FnOnce(&mut Storage) -> RawResult<()> + Send>;

pub(crate) enum Work {
    Operation(Box<dyn RawOperation>),
    Batch(Box<RawDbBatchOperation>),
    Command(Command),
}

pub(crate) struct Entry {
    pub work: Work,
    pub completion: Option<Arc<Completion>>,
}

impl Entry {
    pub fn new(work: Work, completion: Option<Arc<Completion>>) -> Self {
        Self { work, completion }
    }
}

/// Outcome of asking the queue for work.
pub(crate) enum Poll {
    Ready(Entry),
    /// Nothing admissible before this instant
    Wait(Instant),
    Empty,
}

struct ActiveBatch {
    /// `None` while the batch runs on the executor
    op: Option<Box<RawDbBatchOperation>>,
    pending: VecDeque<Entry>,
}

fn allowed(batch: &RawDbBatchOperation, entry: &Entry) -> bool {
    match &entry.work {
        Work::Operation(op) => batch.allows(op.options().contains(TxOptions::READ_ONLY), op.predicates()),
        Work::Command(_) => true,
        Work::Batch(_) => false,
    }
}

#[derive(Default)]
pub(crate) struct TransactionQueue {
    main: VecDeque<Entry>,
    batch: Option<ActiveBatch>,
}

impl TransactionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: Entry) {
        self.main.push_back(entry);
    }

    /// Queued entries, not counting a parked batch.
    pub fn len(&self) -> usize {
        self.main.len() + self.batch.as_ref().map_or(0, |b| b.pending.len())
    }

    pub fn has_active_batch(&self) -> bool {
        self.batch.is_some()
    }

    pub fn poll(&mut self, now: Instant) -> Poll {
        if let Some(active) = self.batch.as_mut() {
            if let Some(mut batch) = active.op.take() {
                if batch.can_continue(now) {
                    return Poll::Ready(Entry::new(Work::Batch(batch), None));
                }
                let idle_until = batch.idle_deadline().unwrap_or(now);
                let mut admitted = active
                    .pending
                    .iter()
                    .position(|e| allowed(&batch, e))
                    .and_then(|i| active.pending.remove(i));
                if admitted.is_none() {
                    while let Some(entry) = self.main.pop_front() {
                        if allowed(&batch, &entry) {
                            admitted = Some(entry);
                            break;
                        }
                        active.pending.push_back(entry);
                    }
                }
                active.op = Some(batch);
                return match admitted {
                    Some(entry) => Poll::Ready(entry),
                    None => Poll::Wait(idle_until),
                };
            }
        }

        match self.main.pop_front() {
            None => Poll::Empty,
            Some(Entry { work: Work::Batch(mut op), completion }) if self.batch.is_none() => {
                op.begin_running(now);
                self.batch = Some(ActiveBatch { op: None, pending: VecDeque::new() });
                Poll::Ready(Entry::new(Work::Batch(op), completion))
            }
            Some(entry) => Poll::Ready(entry),
        }
    }

    /// Hand a batch back after one of its slices ran.
    pub fn return_batch(&mut self, op: Box<RawDbBatchOperation>, finished: bool) {
        if finished {
            if let Some(active) = self.batch.take() {
                for entry in active.pending.into_iter().rev() {
                    self.main.push_front(entry);
                }
            }
            return;
        }
        match self.batch.as_mut() {
            Some(active) => active.op = Some(op),
            None => self.batch = Some(ActiveBatch { op: Some(op), pending: VecDeque::new() }),
        }
    }

    /// Remove everything still queued.
    pub fn drain(&mut self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = Vec::new();
        if let Some(active) = self.batch.take() {
            entries.extend(active.pending);
            if let Some(op) = active.op {
                entries.push(Entry::new(Work::Batch(op), None));
            }
        }
        entries.extend(self.main.drain(..));
        entries
    }
}
