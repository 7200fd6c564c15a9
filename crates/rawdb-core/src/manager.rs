//! Transaction manager: the single-writer executor
//!
//! One thread, `rawdb-executor`, owns the [`Storage`] and runs every
//! transaction, batch slice and maintenance command in turn. Callers submit
//! work through a shared queue; synchronous callers block on a completion
//! until their work has run.
//!
//! The timer thread never touches storage. It flags a pending tick and
//! wakes the executor, which runs `Storage::on_timer` between transactions.
//!
//! Closing finishes the work in flight, fails everything still queued with
//! [`RawDbError::TransactionManagerClosed`], then flushes and closes the
//! storage. If the executor dies, waiters get [`RawDbError::Interrupted`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{RawDbError, RawResult};
use crate::queue::{Entry, Poll, TransactionQueue, Work};
use crate::storage::Storage;
use crate::timer::{start_timer, TimerHandle};
use crate::transaction::{run_transaction, FnOperation, RawOperation, Transaction, TxOptions};

/// How often a blocked caller rechecks that the executor is alive.
const WAIT_POLL: Duration = Duration::from_millis(100);

/// Result slot a synchronous caller waits on.
pub(crate) struct Completion {
    result: Mutex<Option<RawResult<()>>>,
    done: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { result: Mutex::new(None), done: Condvar::new() })
    }

    pub fn complete(&self, result: RawResult<()>) {
        let mut slot = self.result.lock();
        if slot.is_none() {
            *slot = Some(result);
        }
        self.done.notify_all();
    }

    /// Block until completed, or until `alive` drops without a result.
    pub fn wait(&self, alive: &AtomicBool) -> RawResult<()> {
        let mut slot = self.result.lock();
        loop {
            if let Some(result) = slot.take() {
                return result;
            }
            if !alive.load(Ordering::Acquire) {
                return Err(RawDbError::Interrupted { reason: "executor thread terminated".to_string() });
            }
            self.done.wait_for(&mut slot, WAIT_POLL);
        }
    }
}

struct ManagerState {
    queue: TransactionQueue,
    closing: bool,
}

struct Shared {
    state: Mutex<ManagerState>,
    wake: Condvar,
    alive: AtomicBool,
    timer_due: AtomicBool,
}

impl Shared {
    fn tick(&self) {
        self.timer_due.store(true, Ordering::Release);
        let _state = self.state.lock();
        self.wake.notify_one();
    }

    /// Fail every queued entry, returning how many there were.
    fn fail_queued(&self, error: RawDbError) -> usize {
        let entries = self.state.lock().queue.drain();
        let count = entries.len();
        for entry in entries {
            if let Some(completion) = entry.completion {
                completion.complete(Err(error.clone()));
            }
        }
        count
    }
}

/// Marks the executor dead however it exits.
struct ExecutorGuard(Arc<Shared>);

impl Drop for ExecutorGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            tracing::error!("executor thread panicked");
            self.0.fail_queued(RawDbError::Interrupted { reason: "executor thread panicked".to_string() });
        }
        self.0.alive.store(false, Ordering::Release);
    }
}

enum Step {
    Run(Entry),
    Timer,
    Close,
}

/// Owner of the executor and timer threads.
pub struct TransactionManager {
    shared: Arc<Shared>,
    executor: Option<thread::JoinHandle<()>>,
    timer: Option<TimerHandle>,
}

impl TransactionManager {
    /// Move `storage` onto a new executor thread and start the timer.
    pub fn start(storage: Storage, timer_period: Duration) -> RawResult<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(ManagerState { queue: TransactionQueue::new(), closing: false }),
            wake: Condvar::new(),
            alive: AtomicBool::new(true),
            timer_due: AtomicBool::new(false),
        });

        let executor_shared = Arc::clone(&shared);
        let executor = thread::Builder::new()
            .name("rawdb-executor".to_string())
            .spawn(move || {
                let guard = ExecutorGuard(executor_shared);
                executor_loop(&guard.0, storage);
            })
            .map_err(|e| RawDbError::Io {
                path: None,
                kind: e.kind(),
                message: format!("failed to spawn executor thread: {}", e),
            })?;

        let timer_shared = Arc::clone(&shared);
        let timer = match start_timer(timer_period, move || timer_shared.tick()) {
            Ok(timer) => timer,
            Err(e) => {
                shared.state.lock().closing = true;
                shared.wake.notify_all();
                let _ = executor.join();
                return Err(e);
            }
        };

        Ok(Self { shared, executor: Some(executor), timer: Some(timer) })
    }

    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Entries waiting to run.
    pub fn queued(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    fn submit(&self, work: Work, completion: Option<Arc<Completion>>) -> RawResult<()> {
        let mut state = self.shared.state.lock();
        if state.closing || !self.is_alive() {
            return Err(RawDbError::TransactionManagerClosed);
        }
        state.queue.push(Entry::new(work, completion));
        self.shared.wake.notify_one();
        Ok(())
    }

    fn submit_sync(&self, work: Work) -> RawResult<()> {
        let completion = Completion::new();
        self.submit(work, Some(Arc::clone(&completion)))?;
        completion.wait(&self.shared.alive)
    }

    pub(crate) fn submit_work(&self, work: Work) -> RawResult<()> {
        self.submit(work, None)
    }

    /// Queue an operation and return at once. Its outcome is reported only
    /// through its own hooks.
    pub fn transaction(&self, op: impl RawOperation + 'static) -> RawResult<()> {
        self.submit(Work::Operation(Box::new(op)), None)
    }

    /// Queue an operation and wait for it to commit or roll back.
    pub fn transaction_sync(&self, op: impl RawOperation + 'static) -> RawResult<()> {
        self.submit_sync(Work::Operation(Box::new(op)))
    }

    /// Run a closure as a transaction and return its value.
    pub fn execute<T, F>(&self, options: TxOptions, body: F) -> RawResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Transaction<'_>) -> RawResult<T> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let mut body = Some(body);
        let op = FnOperation::new(options, move |tx: &mut Transaction<'_>| {
            let body = body.take().ok_or(RawDbError::TransactionMissing)?;
            *out.lock() = Some(body(tx)?);
            Ok(())
        });
        self.submit_sync(Work::Operation(Box::new(op)))?;
        let value = slot.lock().take();
        value.ok_or(RawDbError::TransactionMissing)
    }

    /// Run a closure against the storage outside any transaction.
    pub(crate) fn command<T, F>(&self, body: F) -> RawResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Storage) -> RawResult<T> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        self.submit_sync(Work::Command(Box::new(move |storage: &mut Storage| {
            *out.lock() = Some(body(storage)?);
            Ok(())
        })))?;
        let value = slot.lock().take();
        value.ok_or(RawDbError::TransactionMissing)
    }

    /// Stop accepting work, finish what is running, and shut both threads down.
    pub fn close(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.shutdown();
        }
        {
            let mut state = self.shared.state.lock();
            state.closing = true;
            self.shared.wake.notify_all();
        }
        if let Some(executor) = self.executor.take() {
            if executor.join().is_err() {
                tracing::error!("executor thread exited with a panic");
            }
        }
    }
}

impl Drop for TransactionManager {
    fn drop(&mut self) {
        self.close();
    }
}

fn executor_loop(shared: &Shared, mut storage: Storage) {
    tracing::debug!("executor started");
    loop {
        let step = next_step(shared);
        match step {
            Step::Close => break,
            Step::Timer => {
                if let Err(e) = storage.on_timer(Instant::now()) {
                    tracing::warn!(error = %e, "timer maintenance failed");
                }
            }
            Step::Run(entry) => run_entry(shared, &mut storage, entry),
        }
    }

    let failed = shared.fail_queued(RawDbError::TransactionManagerClosed);
    if failed > 0 {
        tracing::info!(failed, "queued transactions dropped at close");
    }
    storage.close();
    tracing::debug!("executor stopped");
}

fn next_step(shared: &Shared) -> Step {
    let mut state = shared.state.lock();
    loop {
        if state.closing {
            return Step::Close;
        }
        if shared.timer_due.swap(false, Ordering::AcqRel) {
            return Step::Timer;
        }
        match state.queue.poll(Instant::now()) {
            Poll::Ready(entry) => return Step::Run(entry),
            Poll::Wait(deadline) => {
                shared.wake.wait_until(&mut state, deadline);
            }
            Poll::Empty => shared.wake.wait(&mut state),
        }
    }
}

fn run_entry(shared: &Shared, storage: &mut Storage, entry: Entry) {
    let Entry { work, completion } = entry;
    let result = match work {
        Work::Operation(mut op) => run_transaction(storage, op.as_mut()),
        Work::Batch(mut op) => {
            let result = run_transaction(storage, op.as_mut());
            let finished = op.is_finished();
            shared.state.lock().queue.return_batch(op, finished);
            result
        }
        Work::Command(command) => command(storage),
    };
    if let Some(completion) = completion {
        completion.complete(result);
    }
}
