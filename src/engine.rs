//! The engine context: owns the buffer pool, log manager, lock manager, and
//! transaction manager, and wires them into tables and transactions. Its
//! lifetime encloses every transaction and table operation; teardown
//! flushes dirty frames and the log buffer.

use std::io;
use std::path::Path;
use std::sync::Arc;

use crate::buffer_pool::BufferPool;
use crate::config::EngineConfig;
use crate::lock_manager::LockManager;
use crate::table::Table;
use crate::transaction::{Transaction, TransactionManager};
use crate::wal::LogManager;

pub struct Engine {
    config: EngineConfig,
    buffer_pool: Arc<BufferPool>,
    log: Arc<LogManager>,
    transactions: Arc<TransactionManager>,
    lock_manager: Arc<LockManager>,
}

impl Engine {
    /// Brings the engine up. Failure to open the log file is fatal.
    pub fn start(config: EngineConfig) -> io::Result<Self> {
        let buffer_pool = Arc::new(BufferPool::new(config.buffer_pool_pages as usize));
        let log = Arc::new(LogManager::open(
            &config.log_filename,
            config.log_buffer_mb as usize * 1024 * 1024,
        )?);
        let transactions = Arc::new(TransactionManager::new());
        let lock_manager = Arc::new(LockManager::new(
            Arc::clone(&log),
            Arc::clone(&transactions),
        ));
        crate::granite_debug_log!("[Engine::start] Log at {}", config.log_filename);
        Ok(Self {
            config,
            buffer_pool,
            log,
            transactions,
            lock_manager,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.transactions
    }

    /// Creates a table backed by a paged file at `path`.
    pub fn create_table<P: AsRef<Path>>(&self, path: P, record_size: u16) -> io::Result<Table> {
        Table::create(
            path,
            record_size,
            Arc::clone(&self.buffer_pool),
            Arc::clone(&self.log),
        )
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Arc<Transaction> {
        self.transactions.begin()
    }

    /// Commits `tx` through the engine's log and lock manager.
    pub fn commit(&self, tx: &Arc<Transaction>) -> bool {
        tx.commit(&self.log, &self.lock_manager, &self.transactions)
    }

    /// Aborts `tx`; returns its timestamp, or the invalid sentinel on a
    /// protocol violation or log failure.
    pub fn abort(&self, tx: &Arc<Transaction>) -> u64 {
        tx.abort(&self.log, &self.lock_manager, &self.transactions)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.buffer_pool.flush_all();
        self.log.flush();
    }
}
