//! The write-ahead log sink.
//!
//! The buffer pool writes a before/after image record and forces it durable
//! before any dirty page reaches the data file. This module only appends;
//! recovery replay is an external concern.

use crate::storage::error::StorageResult;
use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use byteorder::{LittleEndian, WriteBytesExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

/// Log sequence number. Monotonically increasing, starting at 1.
pub type Lsn = u64;

/// One page-update record: the page's serialized content before and after
/// the change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub lsn: Lsn,
    pub tx: TransactionId,
    pub page_id: PageId,
    pub before: Vec<u8>,
    pub after: Vec<u8>,
}

/// Append-only log file. Records are length-prefixed bincode frames,
/// buffered until [`force`](LogFile::force) flushes and fsyncs them.
pub struct LogFile {
    writer: Mutex<BufWriter<File>>,
    next_lsn: AtomicU64,
}

impl LogFile {
    /// Creates a fresh log, truncating anything at `path`.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            next_lsn: AtomicU64::new(1),
        })
    }

    /// Opens an existing log for appending, creating it if absent.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            next_lsn: AtomicU64::new(1),
        })
    }

    /// Appends one update record and returns its LSN. The record is only
    /// buffered; durability requires a subsequent [`force`](Self::force).
    pub fn log_write(
        &self,
        tx: TransactionId,
        page_id: PageId,
        before: &[u8],
        after: &[u8],
    ) -> StorageResult<Lsn> {
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        let record = LogRecord {
            lsn,
            tx,
            page_id,
            before: before.to_vec(),
            after: after.to_vec(),
        };
        let payload = bincode::serialize(&record)?;

        let mut writer = self.writer.lock();
        writer.write_u32::<LittleEndian>(payload.len() as u32)?;
        writer.write_all(&payload)?;
        log::trace!("logged update {} for {} on page {}", lsn, tx, page_id);
        Ok(lsn)
    }

    /// Flushes buffered records and fsyncs the file.
    pub fn force(&self) -> StorageResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// LSN the next record will receive.
    pub fn next_lsn(&self) -> Lsn {
        self.next_lsn.load(Ordering::SeqCst)
    }
}
