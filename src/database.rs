//! The engine context: one explicit value in place of process-wide
//! singletons. Every component that needs the catalog, the buffer pool, or
//! the log receives it from here by reference.

use crate::catalog::Catalog;
use crate::storage::buffer::{BufferPool, DEFAULT_CAPACITY};
use crate::storage::error::StorageResult;
use crate::storage::wal::LogFile;
use crate::transaction::{TransactionId, TransactionIdGenerator};
use std::path::Path;
use std::sync::Arc;

pub struct Database {
    catalog: Arc<Catalog>,
    log: Arc<LogFile>,
    buffer_pool: Arc<BufferPool>,
    tx_ids: TransactionIdGenerator,
}

impl Database {
    /// Creates a fresh engine context in `data_dir` with the default cache
    /// capacity. The log file lives at `data_dir/slotdb.log`.
    pub fn create(data_dir: &Path) -> StorageResult<Self> {
        Self::create_with_capacity(data_dir, DEFAULT_CAPACITY)
    }

    pub fn create_with_capacity(data_dir: &Path, capacity: usize) -> StorageResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let catalog = Arc::new(Catalog::new());
        let log = Arc::new(LogFile::create(&data_dir.join("slotdb.log"))?);
        let buffer_pool = Arc::new(BufferPool::new(catalog.clone(), log.clone(), capacity));
        Ok(Self {
            catalog,
            log,
            buffer_pool,
            tx_ids: TransactionIdGenerator::new(),
        })
    }

    /// Opens an existing engine context, appending to its log.
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        let catalog = Arc::new(Catalog::new());
        let log = Arc::new(LogFile::open(&data_dir.join("slotdb.log"))?);
        let buffer_pool = Arc::new(BufferPool::new(
            catalog.clone(),
            log.clone(),
            DEFAULT_CAPACITY,
        ));
        Ok(Self {
            catalog,
            log,
            buffer_pool,
            tx_ids: TransactionIdGenerator::new(),
        })
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.buffer_pool
    }

    pub fn log(&self) -> &Arc<LogFile> {
        &self.log
    }

    /// Registers the tables described by a schema file.
    pub fn load_schema(&self, path: &Path) -> anyhow::Result<()> {
        self.catalog.load_schema(path)
    }

    /// Starts a new transaction.
    pub fn begin(&self) -> TransactionId {
        self.tx_ids.next()
    }

    /// Commits the transaction: flushes its pages and releases its locks.
    pub fn commit(&self, tx: TransactionId) -> StorageResult<()> {
        self.buffer_pool.commit(tx)
    }

    /// Aborts the transaction: erases its in-memory changes and releases
    /// its locks.
    pub fn abort(&self, tx: TransactionId) -> StorageResult<()> {
        self.buffer_pool.abort(tx)
    }
}
