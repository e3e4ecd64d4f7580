//! The record lock manager: per-RID lock heads with FIFO request queues,
//! shared/exclusive grant logic, and wait-die deadlock avoidance keyed on
//! transaction timestamps.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::transaction::{Transaction, TransactionManager};
use crate::wal::LogManager;
use crate::Rid;

/// Lock modes. `NL` only ever appears as a head's current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    NL,
    SH,
    XL,
}

struct LockRequest {
    tx: Arc<Transaction>,
    mode: LockMode,
    granted: bool,
}

struct LockHeadState {
    current_mode: LockMode,
    queue: VecDeque<LockRequest>,
}

struct LockHead {
    state: Mutex<LockHeadState>,
    cond: Condvar,
}

impl LockHead {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockHeadState {
                current_mode: LockMode::NL,
                queue: VecDeque::new(),
            }),
            cond: Condvar::new(),
        }
    }
}

/// The lock manager. Two-level locking: the table mutex covers head
/// lookup/insertion and is released before a head's own mutex is taken.
///
/// Deadlocks are avoided rather than detected: a requester that conflicts
/// with an older holder aborts itself, so waits-for edges only ever point
/// from older to younger transactions and cannot form a cycle.
pub struct LockManager {
    lock_table: Mutex<HashMap<u64, Arc<LockHead>>>,
    log: Arc<LogManager>,
    transactions: Arc<TransactionManager>,
}

impl LockManager {
    pub fn new(log: Arc<LogManager>, transactions: Arc<TransactionManager>) -> Self {
        Self {
            lock_table: Mutex::new(HashMap::new()),
            log,
            transactions,
        }
    }

    /// Requests `mode` on `rid` for `tx`. Blocks until granted unless
    /// `try_lock` is set, in which case any existing request fails the
    /// call. Returns false on an invalid rid, a failed try-lock, or a
    /// wound-wait self-abort.
    pub fn acquire_lock(
        &self,
        tx: &Arc<Transaction>,
        rid: Rid,
        mode: LockMode,
        try_lock: bool,
    ) -> bool {
        if !rid.is_valid() || mode == LockMode::NL {
            return false;
        }

        let head = {
            let mut table = self.lock_table.lock().unwrap();
            Arc::clone(
                table
                    .entry(rid.value())
                    .or_insert_with(|| Arc::new(LockHead::new())),
            )
        };

        let mut state = head.state.lock().unwrap();

        if try_lock && !state.queue.is_empty() {
            return false;
        }

        // Re-granting a mode the transaction already holds is idempotent.
        if state
            .queue
            .iter()
            .any(|r| Arc::ptr_eq(&r.tx, tx) && r.mode == mode && r.granted)
        {
            return true;
        }

        let grantable = state.queue.is_empty()
            || (mode == LockMode::SH && state.queue.iter().all(|r| r.mode == LockMode::SH));

        // Wait-die: if any granted conflicting request belongs to an older
        // transaction, the younger requester aborts itself.
        let blocked_by_older = state.queue.iter().any(|r| {
            r.granted
                && (mode == LockMode::XL || r.mode == LockMode::XL)
                && tx.timestamp() > r.tx.timestamp()
        });
        if blocked_by_older {
            drop(state);
            crate::granite_debug_log!(
                "[LockManager::acquire_lock] ts {} dies on {:?}",
                tx.timestamp(),
                rid
            );
            tx.abort(&self.log, self, &self.transactions);
            return false;
        }

        state.queue.push_back(LockRequest {
            tx: Arc::clone(tx),
            mode,
            granted: grantable,
        });
        if grantable {
            tx.locks.lock().unwrap().push(rid);
            state.current_mode = mode;
            return true;
        }

        // Wait until a release grants our entry.
        loop {
            state = head.cond.wait(state).unwrap();
            if state
                .queue
                .iter()
                .any(|r| Arc::ptr_eq(&r.tx, tx) && r.granted)
            {
                return true;
            }
        }
    }

    /// Releases `tx`'s request on `rid` and promotes waiters: the new front
    /// if it is exclusive, otherwise every leading shared request. False if
    /// no head exists for `rid` or `tx` has no request queued there.
    pub fn release_lock(&self, tx: &Arc<Transaction>, rid: Rid) -> bool {
        let head = {
            let table = self.lock_table.lock().unwrap();
            match table.get(&rid.value()) {
                Some(head) => Arc::clone(head),
                None => return false,
            }
        };

        let mut state = head.state.lock().unwrap();
        let Some(pos) = state.queue.iter().position(|r| Arc::ptr_eq(&r.tx, tx)) else {
            return false;
        };
        let _ = state.queue.remove(pos);
        {
            let mut locks = tx.locks.lock().unwrap();
            if let Some(i) = locks.iter().position(|r| *r == rid) {
                locks.remove(i);
            }
        }

        match state.queue.front().map(|r| r.mode) {
            None => {
                state.current_mode = LockMode::NL;
            }
            Some(LockMode::XL) => {
                let front = state.queue.front_mut().unwrap();
                if !front.granted {
                    front.granted = true;
                    front.tx.locks.lock().unwrap().push(rid);
                }
                state.current_mode = LockMode::XL;
            }
            Some(_) => {
                for request in state.queue.iter_mut() {
                    if request.mode != LockMode::SH {
                        break;
                    }
                    if !request.granted {
                        request.granted = true;
                        request.tx.locks.lock().unwrap().push(rid);
                    }
                }
                state.current_mode = LockMode::SH;
            }
        }

        head.cond.notify_all();
        true
    }

    /// Current mode of the head for `rid`, if one exists.
    pub fn current_mode(&self, rid: Rid) -> Option<LockMode> {
        let head = {
            let table = self.lock_table.lock().unwrap();
            Arc::clone(table.get(&rid.value())?)
        };
        let state = head.state.lock().unwrap();
        Some(state.current_mode)
    }
}
