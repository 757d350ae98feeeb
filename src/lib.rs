//! A durable block-addressed file with asynchronous positional I/O.
//!
//! `blockfile` provides the file primitive that page caches and write-ahead
//! logs are layered on top of: random-access reads and writes at arbitrary
//! byte offsets, cheap space allocation with threshold-driven physical
//! zero-fill, a coalescing fsync, and safe concurrent access under a
//! shared/exclusive lock discipline.
//!
//! # Layout
//!
//! Every file reserves an opaque, zero-initialized header prefix of
//! [`HEADER_SIZE`] bytes for the enclosing subsystem. All offsets visible to
//! callers are payload-relative; the header bias is applied before any
//! request reaches the underlying channel.
//!
//! # Channels
//!
//! Disk access goes through the [`channel::Channel`] trait, a positional
//! asynchronous read/write seam. The production implementation
//! ([`channel::tokio`]) dispatches blocking positional syscalls on the tokio
//! blocking pool; [`channel::memory`] keeps contents in memory for tests and
//! simulation; [`channel::metered`] wraps any backend with Prometheus
//! counters.
//!
//! # Concurrency
//!
//! Data-plane operations (read, write, allocate, sync) hold a shared lock so
//! they never serialize against each other; structural operations (create,
//! open, close, remove, rename, shrink) hold the exclusive lock and drain all
//! in-flight I/O, including detached batches, before touching the channel.
//!
//! # Example
//!
//! ```rust
//! use blockfile::{channel::memory, BlockFile};
//! use bytes::{Bytes, BytesMut};
//!
//! tokio::runtime::Builder::new_multi_thread()
//!     .build()
//!     .unwrap()
//!     .block_on(async {
//!         let file = BlockFile::new(memory::Backend::new(), "example.bin");
//!         file.create().await.unwrap();
//!         let start = file.allocate(4096).await.unwrap();
//!         file.write_at(start, Bytes::from_static(b"hello")).await.unwrap();
//!         let buf = file.read_at(start, BytesMut::zeroed(5), true).await.unwrap();
//!         assert_eq!(&buf[..], b"hello");
//!         file.sync().await;
//!         file.close().await.unwrap();
//!     });
//! ```

pub mod channel;
mod file;
pub mod rwlock;

pub use file::{BatchHandle, BlockFile, ALLOCATION_THRESHOLD, HEADER_SIZE};

use std::io;
use thiserror::Error;

/// Errors that can arise from any file or channel operation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("file {0} is already open")]
    AlreadyOpen(String),
    #[error("file {0} is closed")]
    Closed(String),
    #[error("offset {offset} is outside of the allocated region [0, {size}) of file {path}")]
    OffsetOutOfRange { path: String, offset: u64, size: u64 },
    #[error("offset overflow")]
    OffsetOverflow,
    #[error("end of file {0} reached")]
    UnexpectedEof(String),
    #[error("failed to open file {0}")]
    OpenFailed(String, #[source] io::Error),
    #[error("read from file {0} failed")]
    ReadFailed(String, #[source] io::Error),
    #[error("write to file {0} failed")]
    WriteFailed(String, #[source] io::Error),
    #[error("sync of file {0} failed")]
    SyncFailed(String, #[source] io::Error),
    #[error("truncate of file {0} failed")]
    TruncateFailed(String, #[source] io::Error),
    #[error("failed to remove file {0}")]
    RemoveFailed(String, #[source] io::Error),
    #[error("failed to rename file {0} to {1}")]
    RenameFailed(String, String, #[source] io::Error),
    #[error("failed to replace contents of file {1} with {0}")]
    CopyFailed(String, String, #[source] io::Error),
    #[error("write task aborted before completion")]
    TaskAborted,
}
