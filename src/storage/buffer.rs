//! The buffer pool: a capacity-bounded page cache with NO-STEAL eviction.
//!
//! This is the only path by which pages reach callers. `get_page` acquires
//! the page-level lock for the requested mode before touching the cache, so
//! every reader or writer of a cached page is covered by the two-phase
//! locking protocol. Dirty pages never leave the cache through eviction;
//! they are written out only by an explicit flush, preceded by a forced
//! write-ahead log record.

use crate::access::tuple::Tuple;
use crate::catalog::{Catalog, TableId};
use crate::concurrency::{LockManager, LockMode};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{HeapPage, PageId};
use crate::storage::wal::LogFile;
use crate::transaction::TransactionId;
use log::{debug, trace};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Default number of cached pages.
pub const DEFAULT_CAPACITY: usize = 50;

/// Default budget for one lock acquisition before the transaction is
/// presumed deadlocked and told to abort.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// A cached page. Clones of the `Arc` are the handles callers receive; they
/// stay valid for the lifetime of the caller's page lock.
pub type PageEntry = Arc<RwLock<HeapPage>>;

/// The cache map plus an LRU recency queue (least recently used at front).
#[derive(Default)]
struct PageCache {
    entries: HashMap<PageId, PageEntry>,
    recency: VecDeque<PageId>,
}

impl PageCache {
    fn get(&self, page_id: PageId) -> Option<PageEntry> {
        self.entries.get(&page_id).cloned()
    }

    fn insert(&mut self, page_id: PageId, entry: PageEntry) {
        self.entries.insert(page_id, entry);
        self.touch(page_id);
    }

    fn remove(&mut self, page_id: PageId) -> Option<PageEntry> {
        self.recency.retain(|id| *id != page_id);
        self.entries.remove(&page_id)
    }

    fn touch(&mut self, page_id: PageId) {
        self.recency.retain(|id| *id != page_id);
        self.recency.push_back(page_id);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

pub struct BufferPool {
    catalog: Arc<Catalog>,
    log: Arc<LogFile>,
    lock_manager: LockManager,
    capacity: usize,
    lock_timeout: Duration,
    cache: Mutex<PageCache>,
}

impl BufferPool {
    pub fn new(catalog: Arc<Catalog>, log: Arc<LogFile>, capacity: usize) -> Self {
        assert!(capacity > 0, "buffer pool needs at least one page");
        Self {
            catalog,
            log,
            lock_manager: LockManager::new(),
            capacity,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            cache: Mutex::new(PageCache::default()),
        }
    }

    /// Overrides the lock-acquisition budget.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Retrieves a page under the lock the mode requires: shared for
    /// [`LockMode::Shared`], exclusive for [`LockMode::Exclusive`]. Blocks
    /// until the lock is granted; a timed-out wait surfaces as
    /// [`StorageError::TransactionAborted`]. On a cache miss the page is
    /// loaded from its heap file, evicting a clean page if the pool is full.
    pub fn get_page(
        &self,
        tx: TransactionId,
        page_id: PageId,
        mode: LockMode,
    ) -> StorageResult<PageEntry> {
        self.lock_manager
            .acquire(page_id, tx, mode, self.lock_timeout)?;

        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(page_id) {
            cache.touch(page_id);
            return Ok(entry);
        }

        if cache.len() >= self.capacity {
            self.evict(&mut cache)?;
        }
        let file = self.catalog.table(page_id.table_id())?;
        let page = file.read_page(page_id)?;
        let entry = Arc::new(RwLock::new(page));
        cache.insert(page_id, entry.clone());
        trace!("{} loaded page {} into the cache", tx, page_id);
        Ok(entry)
    }

    /// Evicts the least recently used clean page. Dirty pages are never
    /// stolen; if every cached page is dirty the pool is out of capacity.
    fn evict(&self, cache: &mut PageCache) -> StorageResult<()> {
        let victim = cache
            .recency
            .iter()
            .copied()
            .find(|page_id| {
                cache
                    .entries
                    .get(page_id)
                    .is_some_and(|entry| entry.read().dirty().is_none())
            })
            .ok_or(StorageError::BufferPoolFull)?;
        debug!("evicting clean page {}", victim);
        // clean pages match their on-disk image; no write needed
        cache.remove(victim);
        Ok(())
    }

    /// Adds a tuple to `table_id` on behalf of `tx`, marking every modified
    /// page dirty.
    pub fn insert_tuple(
        &self,
        tx: TransactionId,
        table_id: TableId,
        tuple: Tuple,
    ) -> StorageResult<()> {
        let file = self.catalog.table(table_id)?;
        let pages = file.insert_tuple(tx, tuple, self)?;
        self.mark_dirty(tx, &pages);
        Ok(())
    }

    /// Removes the tuple from its table on behalf of `tx`, marking every
    /// modified page dirty.
    pub fn delete_tuple(&self, tx: TransactionId, tuple: &Tuple) -> StorageResult<()> {
        let record_id = tuple.record_id().ok_or(StorageError::MissingRecordId)?;
        let file = self.catalog.table(record_id.page_id.table_id())?;
        let pages = file.delete_tuple(tx, tuple, self)?;
        self.mark_dirty(tx, &pages);
        Ok(())
    }

    fn mark_dirty(&self, tx: TransactionId, pages: &[PageId]) {
        let cache = self.cache.lock();
        for page_id in pages {
            if let Some(entry) = cache.entries.get(page_id) {
                entry.write().mark_dirty(Some(tx));
            }
        }
    }

    /// Flushes the page if it is cached and dirty: a before/after log record
    /// is written and forced durable, then the page goes to its heap file,
    /// then the dirty flag clears and the before-image is re-snapshotted.
    pub fn flush_page(&self, page_id: PageId) -> StorageResult<()> {
        let entry = self.cache.lock().get(page_id);
        match entry {
            Some(entry) => self.flush_entry(&entry),
            None => Ok(()),
        }
    }

    fn flush_entry(&self, entry: &PageEntry) -> StorageResult<()> {
        let mut page = entry.write();
        let Some(tx) = page.dirty() else {
            return Ok(());
        };
        let after = page.to_bytes();
        self.log.log_write(tx, page.id(), page.before_image(), &after)?;
        self.log.force()?;

        let file = self.catalog.table(page.id().table_id())?;
        file.write_page(&page)?;
        page.mark_dirty(None);
        page.set_before_image();
        debug!("flushed page {} for {}", page.id(), tx);
        Ok(())
    }

    /// Flushes every page the transaction holds a lock on.
    pub fn flush_pages(&self, tx: TransactionId) -> StorageResult<()> {
        for page_id in self.lock_manager.pages_of(tx) {
            self.flush_page(page_id)?;
        }
        Ok(())
    }

    /// Flushes every dirty page in the cache. A shutdown escape hatch, not
    /// part of normal transaction flow: it persists uncommitted writes.
    pub fn flush_all_pages(&self) -> StorageResult<()> {
        let entries: Vec<PageEntry> = {
            let cache = self.cache.lock();
            cache.entries.values().cloned().collect()
        };
        for entry in entries {
            self.flush_entry(&entry)?;
        }
        Ok(())
    }

    /// Drops a page from the cache without writing it anywhere.
    pub fn discard_page(&self, page_id: PageId) {
        self.cache.lock().remove(page_id);
    }

    /// Commits or aborts `tx`. Commit flushes every page the transaction
    /// touched (log first, then data); abort discards each touched page and
    /// reloads it fresh from disk, erasing in-memory changes. Locks are
    /// released last, so no other transaction observes a half-flushed state.
    pub fn transaction_complete(&self, tx: TransactionId, commit: bool) -> StorageResult<()> {
        if commit {
            self.flush_pages(tx)?;
        } else {
            for page_id in self.lock_manager.pages_of(tx) {
                self.restore_page(page_id)?;
            }
        }
        self.lock_manager.release_all(tx);
        debug!("{} {}", tx, if commit { "committed" } else { "aborted" });
        Ok(())
    }

    /// Commits `tx`; shorthand for `transaction_complete(tx, true)`.
    pub fn commit(&self, tx: TransactionId) -> StorageResult<()> {
        self.transaction_complete(tx, true)
    }

    /// Aborts `tx`; shorthand for `transaction_complete(tx, false)`.
    pub fn abort(&self, tx: TransactionId) -> StorageResult<()> {
        self.transaction_complete(tx, false)
    }

    /// Replaces a cached page with its on-disk image. A page no longer in
    /// the cache was evicted clean and needs no restoration.
    fn restore_page(&self, page_id: PageId) -> StorageResult<()> {
        let mut cache = self.cache.lock();
        if cache.remove(page_id).is_none() {
            return Ok(());
        }
        let file = self.catalog.table(page_id.table_id())?;
        let page = file.read_page(page_id)?;
        cache.insert(page_id, Arc::new(RwLock::new(page)));
        Ok(())
    }

    /// Releases one lock before transaction end. This breaks two-phase
    /// locking; callers accept responsibility for the protocol violation.
    pub fn unsafe_release_page(&self, tx: TransactionId, page_id: PageId) {
        self.lock_manager.release(page_id, tx);
    }

    /// Whether the transaction holds any lock on the page.
    pub fn holds_lock(&self, tx: TransactionId, page_id: PageId) -> bool {
        self.lock_manager.is_held(page_id, tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::value::{FieldType, Value};
    use crate::catalog::schema::{Column, Schema};
    use crate::storage::disk::HeapFile;
    use tempfile::{tempdir, TempDir};

    fn two_int_schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Column::new("a", FieldType::Int),
            Column::new("b", FieldType::Int),
        ]))
    }

    fn tuple(a: i32, b: i32) -> Tuple {
        Tuple::new(vec![Value::Int(a), Value::Int(b)])
    }

    struct Fixture {
        _dir: TempDir,
        file: Arc<HeapFile>,
        pool: Arc<BufferPool>,
    }

    fn setup(capacity: usize) -> Fixture {
        let dir = tempdir().unwrap();
        let file = Arc::new(
            HeapFile::create(&dir.path().join("test.dat"), two_int_schema()).unwrap(),
        );
        let catalog = Arc::new(Catalog::new());
        catalog.add_table("test", file.clone());
        let log = Arc::new(LogFile::create(&dir.path().join("test.log")).unwrap());
        let pool = Arc::new(BufferPool::new(catalog, log, capacity));
        Fixture {
            _dir: dir,
            file,
            pool,
        }
    }

    /// Writes `count` empty pages straight to the file, bypassing the pool.
    fn seed_pages(file: &HeapFile, count: u32) {
        for page_no in 0..count {
            let page = HeapPage::empty(
                PageId::new(file.table_id(), page_no),
                file.schema().clone(),
            );
            file.write_page(&page).unwrap();
        }
    }

    #[test]
    fn test_cache_identity() -> StorageResult<()> {
        let f = setup(4);
        seed_pages(&f.file, 1);
        let tx = TransactionId::new(1);
        let page_id = PageId::new(f.file.table_id(), 0);

        let first = f.pool.get_page(tx, page_id, LockMode::Exclusive)?;
        let second = f.pool.get_page(tx, page_id, LockMode::Exclusive)?;
        assert!(Arc::ptr_eq(&first, &second));

        // a mutation through one handle is visible through the other
        first.write().insert_tuple(tuple(1, 2))?;
        assert_eq!(second.read().tuples().count(), 1);
        Ok(())
    }

    #[test]
    fn test_get_page_acquires_lock() -> StorageResult<()> {
        let f = setup(4);
        seed_pages(&f.file, 1);
        let page_id = PageId::new(f.file.table_id(), 0);
        let t1 = TransactionId::new(1);
        let t2 = TransactionId::new(2);

        f.pool.get_page(t1, page_id, LockMode::Exclusive)?;
        assert!(f.pool.holds_lock(t1, page_id));
        assert!(!f.pool.holds_lock(t2, page_id));
        Ok(())
    }

    #[test]
    fn test_lru_eviction_of_clean_pages() -> StorageResult<()> {
        let f = setup(2);
        seed_pages(&f.file, 3);
        let tx = TransactionId::new(1);
        let a = PageId::new(f.file.table_id(), 0);
        let b = PageId::new(f.file.table_id(), 1);
        let c = PageId::new(f.file.table_id(), 2);

        f.pool.get_page(tx, a, LockMode::Shared)?;
        f.pool.get_page(tx, b, LockMode::Shared)?;
        // cache = {A, B}, both clean; C evicts the least recently used (A)
        f.pool.get_page(tx, c, LockMode::Shared)?;

        let cache = f.pool.cache.lock();
        assert!(!cache.entries.contains_key(&a));
        assert!(cache.entries.contains_key(&b));
        assert!(cache.entries.contains_key(&c));
        Ok(())
    }

    #[test]
    fn test_eviction_skips_dirty_pages() -> StorageResult<()> {
        let f = setup(2);
        seed_pages(&f.file, 3);
        let tx = TransactionId::new(1);
        let a = PageId::new(f.file.table_id(), 0);
        let b = PageId::new(f.file.table_id(), 1);
        let c = PageId::new(f.file.table_id(), 2);

        let entry_a = f.pool.get_page(tx, a, LockMode::Exclusive)?;
        entry_a.write().insert_tuple(tuple(1, 1))?;
        f.pool.mark_dirty(tx, &[a]);
        f.pool.get_page(tx, b, LockMode::Shared)?;

        // A is older but dirty; the clean B must be the victim
        f.pool.get_page(tx, c, LockMode::Shared)?;
        let cache = f.pool.cache.lock();
        assert!(cache.entries.contains_key(&a));
        assert!(!cache.entries.contains_key(&b));
        assert!(cache.entries.contains_key(&c));
        Ok(())
    }

    #[test]
    fn test_all_dirty_exhausts_capacity() -> StorageResult<()> {
        let f = setup(2);
        seed_pages(&f.file, 3);
        let tx = TransactionId::new(1);

        for page_no in 0..2 {
            let page_id = PageId::new(f.file.table_id(), page_no);
            let entry = f.pool.get_page(tx, page_id, LockMode::Exclusive)?;
            entry.write().insert_tuple(tuple(page_no as i32, 0))?;
            f.pool.mark_dirty(tx, &[page_id]);
        }

        let c = PageId::new(f.file.table_id(), 2);
        assert!(matches!(
            f.pool.get_page(tx, c, LockMode::Shared),
            Err(StorageError::BufferPoolFull)
        ));
        Ok(())
    }

    #[test]
    fn test_insert_marks_dirty_and_commit_flushes() -> StorageResult<()> {
        let f = setup(4);
        let tx = TransactionId::new(1);
        let table_id = f.file.table_id();

        f.pool.insert_tuple(tx, table_id, tuple(7, 8))?;
        let page_id = PageId::new(table_id, 0);
        {
            let cache = f.pool.cache.lock();
            let entry = cache.entries.get(&page_id).expect("page should be cached");
            assert_eq!(entry.read().dirty(), Some(tx));
        }

        let lsn_before = f.pool.log.next_lsn();
        f.pool.commit(tx)?;
        assert!(f.pool.log.next_lsn() > lsn_before, "commit must log");
        assert!(!f.pool.holds_lock(tx, page_id));

        // the committed tuple is durable in the data file
        let page = f.file.read_page(page_id)?;
        assert_eq!(page.tuples().count(), 1);
        Ok(())
    }

    #[test]
    fn test_abort_restores_state() -> StorageResult<()> {
        let f = setup(4);
        let table_id = f.file.table_id();
        let page_id = PageId::new(table_id, 0);

        let t1 = TransactionId::new(1);
        f.pool.insert_tuple(t1, table_id, tuple(5, 0))?;
        f.pool.commit(t1)?;

        // t2 overwrites 5 with 7 and aborts
        let t2 = TransactionId::new(2);
        {
            let entry = f.pool.get_page(t2, page_id, LockMode::Exclusive)?;
            let mut page = entry.write();
            let victim = page.tuples().next().unwrap().clone();
            page.delete_tuple(&victim.record_id().unwrap())?;
            page.insert_tuple(tuple(7, 0))?;
        }
        f.pool.mark_dirty(t2, &[page_id]);
        f.pool.abort(t2)?;
        assert!(!f.pool.holds_lock(t2, page_id));

        // t3 sees the committed value again
        let t3 = TransactionId::new(3);
        let entry = f.pool.get_page(t3, page_id, LockMode::Shared)?;
        let page = entry.read();
        let values: Vec<i32> = page
            .tuples()
            .map(|t| match t.value(0) {
                Some(Value::Int(v)) => *v,
                other => panic!("unexpected field {:?}", other),
            })
            .collect();
        assert_eq!(values, vec![5]);
        Ok(())
    }

    #[test]
    fn test_delete_tuple_marks_dirty() -> StorageResult<()> {
        let f = setup(4);
        let tx = TransactionId::new(1);
        let table_id = f.file.table_id();

        f.pool.insert_tuple(tx, table_id, tuple(1, 2))?;
        f.pool.commit(tx)?;

        let t2 = TransactionId::new(2);
        let victim = f
            .file
            .scan(t2, &f.pool)
            .next()
            .expect("one tuple")?;
        f.pool.delete_tuple(t2, &victim)?;

        let page_id = victim.record_id().unwrap().page_id;
        {
            let cache = f.pool.cache.lock();
            let entry = cache.entries.get(&page_id).unwrap();
            assert_eq!(entry.read().dirty(), Some(t2));
        }
        f.pool.commit(t2)?;

        assert_eq!(f.file.read_page(page_id)?.tuples().count(), 0);
        Ok(())
    }

    #[test]
    fn test_flush_page_clears_dirty_and_resnapshots() -> StorageResult<()> {
        let f = setup(4);
        let tx = TransactionId::new(1);
        let table_id = f.file.table_id();

        f.pool.insert_tuple(tx, table_id, tuple(3, 4))?;
        let page_id = PageId::new(table_id, 0);
        f.pool.flush_page(page_id)?;

        let cache = f.pool.cache.lock();
        let entry = cache.entries.get(&page_id).unwrap();
        let page = entry.read();
        assert!(page.dirty().is_none());
        assert_eq!(page.before_image(), page.to_bytes().as_slice());
        Ok(())
    }

    #[test]
    fn test_flush_page_ignores_uncached() -> StorageResult<()> {
        let f = setup(4);
        let page_id = PageId::new(f.file.table_id(), 9);
        f.pool.flush_page(page_id)?;
        Ok(())
    }

    #[test]
    fn test_unsafe_release_page() -> StorageResult<()> {
        let f = setup(4);
        seed_pages(&f.file, 1);
        let page_id = PageId::new(f.file.table_id(), 0);
        let t1 = TransactionId::new(1);
        let t2 = TransactionId::new(2);

        f.pool.get_page(t1, page_id, LockMode::Exclusive)?;
        f.pool.unsafe_release_page(t1, page_id);
        assert!(!f.pool.holds_lock(t1, page_id));

        f.pool.get_page(t2, page_id, LockMode::Exclusive)?;
        assert!(f.pool.holds_lock(t2, page_id));
        Ok(())
    }
}
