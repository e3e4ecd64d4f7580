//! Transaction lifecycle and the active-transaction registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::lock_manager::LockManager;
use crate::wal::LogManager;
use crate::Rid;

/// Sentinel returned by a failed abort.
pub const INVALID_TIMESTAMP: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    InProgress,
    Committed,
    Aborted,
}

/// A transaction: a timestamp, a state, and the records it holds locks on.
///
/// Transactions are shared as `Arc` because lock-request queues reference
/// their requester. The lock list is only ever mutated while the relevant
/// lock head's mutex is held.
pub struct Transaction {
    timestamp: u64,
    state: Mutex<TxState>,
    pub(crate) locks: Mutex<Vec<Rid>>,
}

impl Transaction {
    /// Smaller timestamp = older transaction.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn state(&self) -> TxState {
        *self.state.lock().unwrap()
    }

    pub fn is_in_progress(&self) -> bool {
        self.state() == TxState::InProgress
    }

    pub fn is_committed(&self) -> bool {
        self.state() == TxState::Committed
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == TxState::Aborted
    }

    /// RIDs this transaction currently holds granted locks on.
    pub fn held_locks(&self) -> Vec<Rid> {
        self.locks.lock().unwrap().clone()
    }

    fn set_state(&self, state: TxState) {
        *self.state.lock().unwrap() = state;
    }

    /// Commits: commit record, flush, end record, then lock release and
    /// deregistration. Any log failure aborts the transaction locally and
    /// returns false. The commit record must be durable before the end
    /// record is appended.
    pub fn commit(
        self: &Arc<Self>,
        log: &LogManager,
        lock_manager: &LockManager,
        transactions: &TransactionManager,
    ) -> bool {
        if !self.is_in_progress() {
            return false;
        }
        if !log.log_commit(self.timestamp) {
            self.set_state(TxState::Aborted);
            return false;
        }
        if !log.flush() {
            self.set_state(TxState::Aborted);
            return false;
        }
        if !log.log_end(self.timestamp) {
            self.set_state(TxState::Aborted);
            return false;
        }

        let mut all_released = true;
        for rid in self.held_locks() {
            if !lock_manager.release_lock(self, rid) {
                all_released = false;
            }
        }
        transactions.deregister(self);
        self.set_state(if all_released {
            TxState::Committed
        } else {
            TxState::Aborted
        });
        all_released
    }

    /// Aborts: abort record, flush, end record, then best-effort lock
    /// release and deregistration. Returns the transaction's timestamp, or
    /// [`INVALID_TIMESTAMP`] if the transaction was not in progress or a
    /// log step failed.
    pub fn abort(
        self: &Arc<Self>,
        log: &LogManager,
        lock_manager: &LockManager,
        transactions: &TransactionManager,
    ) -> u64 {
        if !self.is_in_progress() {
            return INVALID_TIMESTAMP;
        }
        if !log.log_abort(self.timestamp) || !log.flush() || !log.log_end(self.timestamp) {
            self.set_state(TxState::Aborted);
            transactions.deregister(self);
            return INVALID_TIMESTAMP;
        }

        for rid in self.held_locks() {
            lock_manager.release_lock(self, rid);
        }
        transactions.deregister(self);
        self.set_state(TxState::Aborted);
        self.timestamp
    }
}

/// Hands out timestamps and tracks every in-progress transaction.
pub struct TransactionManager {
    ts_counter: AtomicU64,
    active: Mutex<Vec<Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            ts_counter: AtomicU64::new(0),
            active: Mutex::new(Vec::new()),
        }
    }

    /// Starts a transaction and registers it in the active list.
    pub fn begin(&self) -> Arc<Transaction> {
        let tx = Arc::new(Transaction {
            timestamp: self.ts_counter.fetch_add(1, Ordering::SeqCst),
            state: Mutex::new(TxState::InProgress),
            locks: Mutex::new(Vec::new()),
        });
        self.active.lock().unwrap().push(Arc::clone(&tx));
        crate::granite_debug_log!(
            "[TransactionManager::begin] Started tx with ts {}",
            tx.timestamp
        );
        tx
    }

    pub fn is_active(&self, tx: &Arc<Transaction>) -> bool {
        self.active
            .lock()
            .unwrap()
            .iter()
            .any(|t| Arc::ptr_eq(t, tx))
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    pub(crate) fn deregister(&self, tx: &Arc<Transaction>) {
        self.active.lock().unwrap().retain(|t| !Arc::ptr_eq(t, tx));
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
