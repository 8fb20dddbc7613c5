//! Heap files: one table as an ordered sequence of fixed-size pages.
//!
//! The file is logically append-only — pages are overwritten in place and
//! never shifted. All tuple-level operations route page access through the
//! buffer pool so locking and dirty tracking apply; raw `read_page` /
//! `write_page` are the pool's loading and flushing primitives.

use crate::access::tuple::Tuple;
use crate::catalog::schema::Schema;
use crate::catalog::TableId;
use crate::concurrency::LockMode;
use crate::storage::buffer::BufferPool;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{HeapPage, PageId, PAGE_SIZE};
use crate::transaction::TransactionId;
use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct HeapFile {
    path: PathBuf,
    table_id: TableId,
    schema: Arc<Schema>,
    file: Mutex<File>,
    /// Serializes the grow-by-one-page path of insert_tuple.
    append_latch: Mutex<()>,
}

impl HeapFile {
    /// Creates a fresh heap file, truncating anything at `path`.
    pub fn create(path: &Path, schema: Arc<Schema>) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Self::from_file(path, file, schema)
    }

    /// Opens an existing heap file, creating an empty one if absent.
    pub fn open(path: &Path, schema: Arc<Schema>) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        Self::from_file(path, file, schema)
    }

    fn from_file(path: &Path, file: File, schema: Arc<Schema>) -> StorageResult<Self> {
        // the table id is derived once from the canonical path and stays
        // stable for the file's lifetime
        let canonical = path.canonicalize()?;
        let mut hasher = DefaultHasher::new();
        canonical.hash(&mut hasher);
        Ok(Self {
            path: canonical,
            table_id: hasher.finish(),
            schema,
            file: Mutex::new(file),
            append_latch: Mutex::new(()),
        })
    }

    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total pages in the file: byte length over page size, floored.
    pub fn num_pages(&self) -> StorageResult<u32> {
        let len = self.file.lock().metadata()?.len();
        Ok((len / PAGE_SIZE as u64) as u32)
    }

    /// Reads and decodes one page directly from disk.
    pub fn read_page(&self, page_id: PageId) -> StorageResult<HeapPage> {
        self.check_table(page_id)?;
        let mut file = self.file.lock();
        let num_pages = (file.metadata()?.len() / PAGE_SIZE as u64) as u32;
        if page_id.page_no() >= num_pages {
            return Err(StorageError::PageOutOfBounds {
                page: page_id,
                num_pages,
            });
        }
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        let mut buf = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut buf)?;
        drop(file);
        HeapPage::from_bytes(page_id, self.schema.clone(), &buf)
    }

    /// Overwrites the page's region in place, extending the file if the
    /// page lies at its current end.
    pub fn write_page(&self, page: &HeapPage) -> StorageResult<()> {
        self.check_table(page.id())?;
        let bytes = page.to_bytes();
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page.id())))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }

    /// Places the tuple on the first page with a free slot, growing the file
    /// by one page when every existing page is full. Returns the modified
    /// pages (always exactly one). Page access goes through the buffer pool,
    /// so the caller ends up holding exclusive locks and the pool can track
    /// the dirtied page.
    pub fn insert_tuple(
        &self,
        tx: TransactionId,
        tuple: Tuple,
        pool: &BufferPool,
    ) -> StorageResult<Vec<PageId>> {
        for page_no in 0..self.num_pages()? {
            let page_id = PageId::new(self.table_id, page_no);
            let already_held = pool.holds_lock(tx, page_id);
            let entry = pool.get_page(tx, page_id, LockMode::Exclusive)?;
            {
                let mut page = entry.write();
                if page.free_slot_count() > 0 {
                    page.insert_tuple(tuple)?;
                    return Ok(vec![page_id]);
                }
            }
            // the page is full and was locked only for this probe
            if !already_held {
                pool.unsafe_release_page(tx, page_id);
            }
        }

        // every page is full: synthesize the next page with the tuple in
        // slot 0 and persist it immediately, so the file's page count is
        // durably consistent before the page enters the cache
        let page_id = {
            let _latch = self.append_latch.lock();
            let page_id = PageId::new(self.table_id, self.num_pages()?);
            let mut page = HeapPage::empty(page_id, self.schema.clone());
            page.insert_tuple(tuple)?;
            self.write_page(&page)?;
            page_id
        };
        pool.get_page(tx, page_id, LockMode::Exclusive)?;
        Ok(vec![page_id])
    }

    /// Clears the slot named by the tuple's record id. Returns the modified
    /// pages (always exactly one).
    pub fn delete_tuple(
        &self,
        tx: TransactionId,
        tuple: &Tuple,
        pool: &BufferPool,
    ) -> StorageResult<Vec<PageId>> {
        let record_id = tuple.record_id().ok_or(StorageError::MissingRecordId)?;
        self.check_table(record_id.page_id)?;

        let entry = pool.get_page(tx, record_id.page_id, LockMode::Exclusive)?;
        entry.write().delete_tuple(&record_id)?;
        Ok(vec![record_id.page_id])
    }

    /// A lazy, restartable scan over all live tuples in ascending page
    /// order. Pages are fetched through the buffer pool under shared locks;
    /// dropping the scan releases nothing — locks are transaction-scoped.
    pub fn scan<'a>(&'a self, tx: TransactionId, pool: &'a BufferPool) -> TableScan<'a> {
        TableScan {
            file: self,
            pool,
            tx,
            next_page_no: 0,
            pending: VecDeque::new(),
        }
    }

    fn check_table(&self, page_id: PageId) -> StorageResult<()> {
        if page_id.table_id() != self.table_id {
            return Err(StorageError::TableMismatch {
                page: page_id,
                table: self.table_id,
            });
        }
        Ok(())
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.page_no() as u64 * PAGE_SIZE as u64
    }
}

impl std::fmt::Debug for HeapFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapFile")
            .field("path", &self.path)
            .field("table_id", &self.table_id)
            .finish()
    }
}

/// Iterator state of one table scan.
pub struct TableScan<'a> {
    file: &'a HeapFile,
    pool: &'a BufferPool,
    tx: TransactionId,
    next_page_no: u32,
    pending: VecDeque<Tuple>,
}

impl TableScan<'_> {
    /// Restarts the scan from the first page.
    pub fn rewind(&mut self) {
        self.next_page_no = 0;
        self.pending.clear();
    }
}

impl Iterator for TableScan<'_> {
    type Item = StorageResult<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(tuple) = self.pending.pop_front() {
                return Some(Ok(tuple));
            }
            let num_pages = match self.file.num_pages() {
                Ok(n) => n,
                Err(e) => return Some(Err(e)),
            };
            if self.next_page_no >= num_pages {
                return None;
            }
            let page_id = PageId::new(self.file.table_id, self.next_page_no);
            self.next_page_no += 1;

            let entry = match self.pool.get_page(self.tx, page_id, LockMode::Shared) {
                Ok(entry) => entry,
                Err(e) => return Some(Err(e)),
            };
            let page = entry.read();
            self.pending.extend(page.tuples().cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::value::{FieldType, Value};
    use crate::catalog::schema::Column;
    use crate::catalog::Catalog;
    use crate::storage::buffer::BufferPool;
    use crate::storage::wal::LogFile;
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

    fn setup() -> (TempDir, Arc<HeapFile>, Arc<BufferPool>) {
        let dir = tempdir().unwrap();
        let file = Arc::new(
            HeapFile::create(&dir.path().join("test.dat"), two_int_schema()).unwrap(),
        );
        let catalog = Arc::new(Catalog::new());
        catalog.add_table("test", file.clone());
        let log = Arc::new(LogFile::create(&dir.path().join("test.log")).unwrap());
        let pool = Arc::new(BufferPool::new(catalog, log, 16));
        (dir, file, pool)
    }

    #[test]
    fn test_create_starts_empty() -> StorageResult<()> {
        let dir = tempdir()?;
        let file = HeapFile::create(&dir.path().join("t.dat"), two_int_schema())?;
        assert_eq!(file.num_pages()?, 0);
        Ok(())
    }

    #[test]
    fn test_table_id_is_stable() -> StorageResult<()> {
        let dir = tempdir()?;
        let path = dir.path().join("t.dat");
        let first = HeapFile::create(&path, two_int_schema())?;
        let second = HeapFile::open(&path, two_int_schema())?;
        assert_eq!(first.table_id(), second.table_id());

        let other = HeapFile::create(&dir.path().join("u.dat"), two_int_schema())?;
        assert_ne!(first.table_id(), other.table_id());
        Ok(())
    }

    #[test]
    fn test_write_read_round_trip() -> StorageResult<()> {
        let dir = tempdir()?;
        let file = HeapFile::create(&dir.path().join("t.dat"), two_int_schema())?;

        let page_id = PageId::new(file.table_id(), 0);
        let mut page = HeapPage::empty(page_id, two_int_schema());
        page.insert_tuple(tuple(1, 2))?;
        file.write_page(&page)?;
        assert_eq!(file.num_pages()?, 1);

        let read_back = file.read_page(page_id)?;
        assert_eq!(read_back.to_bytes(), page.to_bytes());
        Ok(())
    }

    #[test]
    fn test_read_rejects_foreign_page() -> StorageResult<()> {
        let dir = tempdir()?;
        let file = HeapFile::create(&dir.path().join("t.dat"), two_int_schema())?;
        let foreign = PageId::new(file.table_id().wrapping_add(1), 0);
        assert!(matches!(
            file.read_page(foreign),
            Err(StorageError::TableMismatch { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_read_out_of_bounds() -> StorageResult<()> {
        let dir = tempdir()?;
        let file = HeapFile::create(&dir.path().join("t.dat"), two_int_schema())?;
        let missing = PageId::new(file.table_id(), 3);
        assert!(matches!(
            file.read_page(missing),
            Err(StorageError::PageOutOfBounds { num_pages: 0, .. })
        ));
        Ok(())
    }

    #[test]
    fn test_insert_creates_first_page() -> StorageResult<()> {
        let (_dir, file, pool) = setup();
        let tx = TransactionId::new(1);

        let pages = file.insert_tuple(tx, tuple(1, 2), &pool)?;
        assert_eq!(pages, vec![PageId::new(file.table_id(), 0)]);
        assert_eq!(file.num_pages()?, 1);

        let found: Vec<Tuple> = file.scan(tx, &pool).collect::<StorageResult<_>>()?;
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].values(), &[Value::Int(1), Value::Int(2)]);
        Ok(())
    }

    #[test]
    fn test_insert_fills_existing_page_first() -> StorageResult<()> {
        let (_dir, file, pool) = setup();
        let tx = TransactionId::new(1);

        let first = file.insert_tuple(tx, tuple(1, 1), &pool)?;
        let second = file.insert_tuple(tx, tuple(2, 2), &pool)?;
        assert_eq!(first, second);
        assert_eq!(file.num_pages()?, 1);
        Ok(())
    }

    #[test]
    fn test_delete_then_rescan() -> StorageResult<()> {
        let (_dir, file, pool) = setup();
        let tx = TransactionId::new(1);

        file.insert_tuple(tx, tuple(1, 1), &pool)?;
        file.insert_tuple(tx, tuple(2, 2), &pool)?;

        let victim = file
            .scan(tx, &pool)
            .collect::<StorageResult<Vec<_>>>()?
            .into_iter()
            .find(|t| t.value(0) == Some(&Value::Int(1)))
            .unwrap();
        file.delete_tuple(tx, &victim, &pool)?;

        let rest: Vec<Tuple> = file.scan(tx, &pool).collect::<StorageResult<_>>()?;
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].value(0), Some(&Value::Int(2)));
        Ok(())
    }

    #[test]
    fn test_delete_unplaced_tuple_fails() {
        let (_dir, file, pool) = setup();
        let tx = TransactionId::new(1);
        let unplaced = tuple(1, 1);
        assert!(matches!(
            file.delete_tuple(tx, &unplaced, &pool),
            Err(StorageError::MissingRecordId)
        ));
    }

    #[test]
    fn test_scan_rewind() -> StorageResult<()> {
        let (_dir, file, pool) = setup();
        let tx = TransactionId::new(1);
        for i in 0..5 {
            file.insert_tuple(tx, tuple(i, i), &pool)?;
        }

        let mut scan = file.scan(tx, &pool);
        assert_eq!(scan.by_ref().take(3).count(), 3);
        scan.rewind();
        assert_eq!(scan.count(), 5);
        Ok(())
    }

    #[test]
    fn test_scan_empty_file() -> StorageResult<()> {
        let (_dir, file, pool) = setup();
        let tx = TransactionId::new(1);
        assert_eq!(file.scan(tx, &pool).count(), 0);
        Ok(())
    }
}
