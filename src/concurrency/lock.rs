//! Page-granularity shared/exclusive locks.
//!
//! Each page is either unlocked, shared by a set of transactions, or held
//! exclusively by one. Acquisition is reentrant, and a transaction that is
//! the sole shared holder may upgrade in place. Blocked acquires wait on a
//! condvar notified at every release, bounded by a deadline; a timed-out
//! wait surfaces as a transaction-abort error. The timeout is the system's
//! only deadlock-breaking mechanism — there is no wait-for graph, so a
//! transaction that waits past its budget is presumed deadlocked. That can
//! abort transactions that were merely slow; accepted approximation.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

/// Lock modes supported by the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Shared lock for read operations.
    Shared,
    /// Exclusive lock for write operations.
    Exclusive,
}

/// Current holders of one page's lock. A page with no entry is unlocked.
#[derive(Debug)]
enum LockState {
    Shared(HashSet<TransactionId>),
    Exclusive(TransactionId),
}

#[derive(Debug, Default)]
struct LockTables {
    /// Per-page lock state.
    pages: HashMap<PageId, LockState>,
    /// Every page a transaction holds any lock on; drives release_all and
    /// the buffer pool's commit/abort page set.
    by_tx: HashMap<TransactionId, HashSet<PageId>>,
}

impl LockTables {
    fn try_acquire(&mut self, page: PageId, tx: TransactionId, mode: LockMode) -> bool {
        match self.pages.get_mut(&page) {
            None => {
                let state = match mode {
                    LockMode::Shared => LockState::Shared(HashSet::from([tx])),
                    LockMode::Exclusive => LockState::Exclusive(tx),
                };
                self.pages.insert(page, state);
                self.by_tx.entry(tx).or_default().insert(page);
                true
            }
            // an exclusive holder re-enters in either mode
            Some(LockState::Exclusive(holder)) => *holder == tx,
            Some(LockState::Shared(holders)) => match mode {
                LockMode::Shared => {
                    holders.insert(tx);
                    self.by_tx.entry(tx).or_default().insert(page);
                    true
                }
                LockMode::Exclusive => {
                    // upgrade is legal only for the sole shared holder
                    if holders.len() == 1 && holders.contains(&tx) {
                        self.pages.insert(page, LockState::Exclusive(tx));
                        true
                    } else {
                        false
                    }
                }
            },
        }
    }

    fn release(&mut self, page: PageId, tx: TransactionId) {
        let emptied = match self.pages.get_mut(&page) {
            Some(LockState::Shared(holders)) => {
                holders.remove(&tx);
                holders.is_empty()
            }
            Some(LockState::Exclusive(holder)) => *holder == tx,
            None => false,
        };
        if emptied {
            self.pages.remove(&page);
        }
        if let Some(pages) = self.by_tx.get_mut(&tx) {
            pages.remove(&page);
            if pages.is_empty() {
                self.by_tx.remove(&tx);
            }
        }
    }
}

/// The lock table shared by every transaction.
pub struct LockManager {
    tables: Mutex<LockTables>,
    /// Notified on every release so blocked acquires re-check.
    released: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(LockTables::default()),
            released: Condvar::new(),
        }
    }

    /// Non-blocking acquisition attempt.
    pub fn try_acquire(&self, page: PageId, tx: TransactionId, mode: LockMode) -> bool {
        self.tables.lock().try_acquire(page, tx, mode)
    }

    /// Blocks until the lock is granted or `timeout` elapses. A timed-out
    /// wait always surfaces as [`StorageError::TransactionAborted`] — never
    /// a silent retry-forever.
    pub fn acquire(
        &self,
        page: PageId,
        tx: TransactionId,
        mode: LockMode,
        timeout: Duration,
    ) -> StorageResult<()> {
        let deadline = Instant::now() + timeout;
        let mut tables = self.tables.lock();
        loop {
            if tables.try_acquire(page, tx, mode) {
                return Ok(());
            }
            if self.released.wait_until(&mut tables, deadline).timed_out() {
                // one last attempt in case the release raced the deadline
                if tables.try_acquire(page, tx, mode) {
                    return Ok(());
                }
                log::warn!("{} timed out waiting for {:?} lock on page {}", tx, mode, page);
                return Err(StorageError::TransactionAborted(tx));
            }
        }
    }

    /// Releases one page. Callers outside transaction completion accept
    /// responsibility for the two-phase locking violation.
    pub fn release(&self, page: PageId, tx: TransactionId) {
        let mut tables = self.tables.lock();
        tables.release(page, tx);
        self.released.notify_all();
    }

    /// Releases every page the transaction holds. Invoked exactly once, at
    /// commit or abort.
    pub fn release_all(&self, tx: TransactionId) {
        let mut tables = self.tables.lock();
        if let Some(pages) = tables.by_tx.remove(&tx) {
            for page in pages {
                let emptied = match tables.pages.get_mut(&page) {
                    Some(LockState::Shared(holders)) => {
                        holders.remove(&tx);
                        holders.is_empty()
                    }
                    Some(LockState::Exclusive(holder)) => *holder == tx,
                    None => false,
                };
                if emptied {
                    tables.pages.remove(&page);
                }
            }
        }
        self.released.notify_all();
    }

    /// Whether the transaction holds any lock on the page.
    pub fn is_held(&self, page: PageId, tx: TransactionId) -> bool {
        match self.tables.lock().pages.get(&page) {
            Some(LockState::Shared(holders)) => holders.contains(&tx),
            Some(LockState::Exclusive(holder)) => *holder == tx,
            None => false,
        }
    }

    /// Every page the transaction holds a lock on.
    pub fn pages_of(&self, tx: TransactionId) -> Vec<PageId> {
        self.tables
            .lock()
            .by_tx
            .get(&tx)
            .map(|pages| pages.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}
