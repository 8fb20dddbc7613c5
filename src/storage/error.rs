//! Storage layer error types.

use crate::access::tuple::RecordId;
use crate::catalog::TableId;
use crate::storage::page::PageId;
use crate::transaction::TransactionId;
use thiserror::Error;

/// Errors that can occur in the storage layer.
///
/// Lock timeouts always surface as [`StorageError::TransactionAborted`]; the
/// caller is expected to unwind and release the transaction's locks. No
/// variant is retried internally except inside the bounded lock-acquire loop.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("{0} aborted: lock wait exceeded its budget")]
    TransactionAborted(TransactionId),

    #[error("buffer pool is full: every cached page is dirty")]
    BufferPoolFull,

    #[error("page {page} does not belong to table {table}")]
    TableMismatch { page: PageId, table: TableId },

    #[error("record {record} does not belong to page {page}")]
    PageMismatch { record: RecordId, page: PageId },

    #[error("page {page} is out of bounds: file has {num_pages} pages")]
    PageOutOfBounds { page: PageId, num_pages: u32 },

    #[error("page buffer must be {} bytes, got {0}", crate::storage::page::PAGE_SIZE)]
    BadPageSize(usize),

    #[error("slot {slot} on page {page} is empty")]
    SlotEmpty { page: PageId, slot: u16 },

    #[error("page {0} has no free slot")]
    PageFull(PageId),

    #[error("tuple has no record id")]
    MissingRecordId,

    #[error("tuple does not match table schema: {0}")]
    InvalidTuple(String),

    #[error("unknown table {0}")]
    UnknownTable(TableId),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log record serialization failed: {0}")]
    Log(#[from] bincode::Error),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
