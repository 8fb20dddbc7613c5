//! Storage layer implementation for slotdb.
//!
//! This module provides the foundation for persistent data storage using a
//! page-based architecture. Key components:
//!
//! - **HeapPage**: Fixed-size (4KB) slotted pages, the basic unit of I/O
//! - **HeapFile**: An ordered sequence of pages backing one table
//! - **BufferPool**: Capacity-bounded page cache with NO-STEAL eviction,
//!   the only path by which pages reach callers
//! - **LogFile**: The write-ahead log sink consumed before dirty flushes
//!
//! All page access is mediated by the buffer pool, which acquires the
//! page-level lock for the caller before handing out the cached entry.

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod wal;

pub use buffer::{BufferPool, DEFAULT_CAPACITY};
pub use disk::HeapFile;
pub use error::{StorageError, StorageResult};
pub use page::{HeapPage, PageId, PAGE_SIZE};
pub use wal::LogFile;
