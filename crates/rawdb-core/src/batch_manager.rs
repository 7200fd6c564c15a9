//! Batch operation registry and restore
//!
//! The batch header lives on page 0 of a reserved data file. On open the
//! manager binds that file, decodes whatever state the last committed slice
//! left behind and, if a factory is registered for its type, rebuilds the
//! operation so it resumes where it stopped.

use std::sync::Arc;
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::batch::{BatchControl, BatchOperation, BatchOperationState, RawDbBatchOperation};
use crate::error::{RawDbError, RawResult};
use crate::file_cache::{FileSpec, BATCH_FILE_INDEX};
use crate::format::decode_batch_header;
use crate::observer::RawDbObserver;
use crate::page::PageKey;
use crate::region::RegionRead;
use crate::stats::RawDbStats;
use crate::storage::Storage;

/// File name of the batch header under the first configured path.
pub const BATCH_FILE_NAME: &str = "batch.hdr";

/// Rebuilds a persisted batch operation of one type.
pub trait BatchOperationFactory: Send + Sync {
    fn type_name(&self) -> &str;

    fn restore(&self, state: &BatchOperationState) -> RawResult<Box<dyn BatchOperation>>;
}

/// Owns batch factories and the last committed batch state.
pub struct BatchManager {
    factories: HashMap<String, Arc<dyn BatchOperationFactory>>,
    current: Arc<Mutex<Option<BatchOperationState>>>,
    run_period: Duration,
    idle_period: Duration,
    default_queue_size: u32,
    observer: Arc<dyn RawDbObserver>,
    stats: Arc<RawDbStats>,
}

impl BatchManager {
    pub fn new(
        run_period: Duration,
        idle_period: Duration,
        default_queue_size: u32,
        observer: Arc<dyn RawDbObserver>,
        stats: Arc<RawDbStats>,
    ) -> Self {
        Self {
            factories: HashMap::new(),
            current: Arc::new(Mutex::new(None)),
            run_period,
            idle_period,
            default_queue_size,
            observer,
            stats,
        }
    }

    /// Register a factory; a later registration for the same type replaces it.
    pub fn register(&mut self, factory: Arc<dyn BatchOperationFactory>) {
        self.factories.insert(factory.type_name().to_string(), factory);
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Bind the header file and read the persisted state, if any.
    pub fn load(&self, storage: &mut Storage) -> RawResult<Option<BatchOperationState>> {
        let page_type = storage.config().batch_page_type;
        storage.bind_file(BATCH_FILE_INDEX, &FileSpec::new(BATCH_FILE_NAME, page_type))?;
        let page = storage.read_page(PageKey::new(BATCH_FILE_INDEX, 0))?;
        let state = match decode_batch_header(page.bytes())? {
            Some(bytes) => Some(BatchOperationState::from_bytes(&bytes)?),
            None => None,
        };
        *self.current.lock() = state.clone();
        Ok(state)
    }

    /// Load the header and rebuild the persisted operation.
    ///
    /// A state with no registered factory is left in place and reported as a
    /// warning so that registering the factory later can still resume it.
    pub fn restore(&self, storage: &mut Storage) -> RawResult<Option<RawDbBatchOperation>> {
        let Some(state) = self.load(storage)? else {
            return Ok(None);
        };
        let Some(factory) = self.factories.get(&state.type_name) else {
            let err = RawDbError::BatchOperationUnknown { type_name: state.type_name.clone() };
            tracing::warn!(error = %err, "persisted batch operation not restored");
            return Ok(None);
        };
        let inner = factory.restore(&state)?;
        tracing::info!(batch = %state.type_name, state_len = state.state.len(), "batch operation restored");
        Ok(Some(self.build(inner, state.control())))
    }

    /// Wrap a new operation for scheduling.
    pub fn wrap(&self, inner: Box<dyn BatchOperation>) -> RawDbBatchOperation {
        self.build(inner, BatchControl::new(self.default_queue_size))
    }

    fn build(&self, inner: Box<dyn BatchOperation>, control: BatchControl) -> RawDbBatchOperation {
        RawDbBatchOperation::new(
            inner,
            control,
            self.run_period,
            self.idle_period,
            Arc::clone(&self.current),
            Arc::clone(&self.observer),
            Arc::clone(&self.stats),
        )
    }

    /// State written by the last committed slice of an unfinished operation.
    pub fn current(&self) -> Option<BatchOperationState> {
        self.current.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchProgress;
    use crate::config::RawDbConfig;
    use crate::observer::NoopObserver;
    use crate::transaction::{run_transaction, Transaction};
    use tempfile::TempDir;

    struct Countdown {
        left: u32,
    }

    impl BatchOperation for Countdown {
        fn type_name(&self) -> &str {
            "countdown"
        }

        fn run(&mut self, _tx: &mut Transaction<'_>, control: &mut BatchControl) -> RawResult<BatchProgress> {
            control.set_max_page_cache_size("default", 64 * 1024);
            self.left = self.left.saturating_sub(1);
            Ok(if self.left == 0 { BatchProgress::Complete } else { BatchProgress::Continue })
        }

        fn save_state(&self) -> Vec<u8> {
            self.left.to_le_bytes().to_vec()
        }
    }

    struct CountdownFactory;

    impl BatchOperationFactory for CountdownFactory {
        fn type_name(&self) -> &str {
            "countdown"
        }

        fn restore(&self, state: &BatchOperationState) -> RawResult<Box<dyn BatchOperation>> {
            let bytes: [u8; 4] = state.state.as_slice().try_into().map_err(|_| RawDbError::Corrupted {
                path: BATCH_FILE_NAME.into(),
                offset: 0,
                reason: "countdown state must be 4 bytes".to_string(),
            })?;
            Ok(Box::new(Countdown { left: u32::from_le_bytes(bytes) }))
        }
    }

    fn open(dir: &std::path::Path) -> (Storage, BatchManager) {
        let config = Arc::new(RawDbConfig::small(dir));
        let (storage, _) = Storage::open(Arc::clone(&config), Arc::new(NoopObserver), Arc::new(RawDbStats::new())).unwrap();
        let mut manager = BatchManager::new(
            config.batch_run_period,
            config.batch_idle_period,
            8,
            Arc::new(NoopObserver),
            Arc::new(RawDbStats::new()),
        );
        manager.register(Arc::new(CountdownFactory));
        (storage, manager)
    }

    #[test]
    fn test_empty_header_restores_nothing() {
        let tmp = TempDir::new().unwrap();
        let (mut storage, manager) = open(tmp.path());
        assert!(manager.restore(&mut storage).unwrap().is_none());
        assert!(storage.is_file_bound(BATCH_FILE_INDEX));
    }

    #[test]
    fn test_state_persists_until_complete() {
        let tmp = TempDir::new().unwrap();
        let (mut storage, manager) = open(tmp.path());
        manager.load(&mut storage).unwrap();

        let mut op = manager.wrap(Box::new(Countdown { left: 2 }));
        run_transaction(&mut storage, &mut op).unwrap();
        let current = manager.current().unwrap();
        assert_eq!(current.state, 1u32.to_le_bytes().to_vec());
        assert_eq!(current.constraints, vec![("default".to_string(), 64 * 1024)]);
        assert_eq!(manager.load(&mut storage).unwrap(), Some(current));

        run_transaction(&mut storage, &mut op).unwrap();
        assert!(op.is_finished());
        assert!(manager.current().is_none());
        assert!(manager.load(&mut storage).unwrap().is_none());
    }

    #[test]
    fn test_unknown_type_left_in_place() {
        let tmp = TempDir::new().unwrap();
        let (mut storage, manager) = open(tmp.path());
        manager.load(&mut storage).unwrap();
        let mut op = manager.wrap(Box::new(Countdown { left: 5 }));
        run_transaction(&mut storage, &mut op).unwrap();

        let bare = BatchManager::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            8,
            Arc::new(NoopObserver),
            Arc::new(RawDbStats::new()),
        );
        assert!(!bare.is_registered("countdown"));
        assert!(bare.restore(&mut storage).unwrap().is_none());
        assert_eq!(bare.current().map(|s| s.type_name), Some("countdown".to_string()));
    }
}
