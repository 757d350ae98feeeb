//! Asynchronous positional I/O channels.
//!
//! A [`Channel`] is the seam between the file primitive and the operating
//! system: single-shot positional reads and writes against one open file,
//! plus a durability barrier and physical truncation. Operations may complete
//! short (fewer bytes than requested); the retry loops that rechain partial
//! transfers live above this seam. Offsets here are raw file offsets — the
//! header bias of the block file is applied before a request reaches the
//! channel.
//!
//! A [`Backend`] constructs channels and performs the path-level filesystem
//! operations (remove, rename, copy, existence) that the file lifecycle
//! needs.

use crate::Error;
use bytes::{Bytes, BytesMut};
use std::{future::Future, path::Path};

pub mod memory;
pub mod metered;
pub mod tokio;

/// Positional asynchronous I/O on one open file.
///
/// Handles are cheaply cloneable and safe to share across tasks; every clone
/// refers to the same underlying file.
pub trait Channel: Clone + Send + Sync + 'static {
    /// Read into `buf[start..]` at `offset`.
    ///
    /// Returns the buffer and the number of bytes read. A short count is
    /// valid; `0` means the offset is at or past the end of the file.
    fn read_at(
        &self,
        buf: BytesMut,
        start: usize,
        offset: u64,
    ) -> impl Future<Output = Result<(BytesMut, usize), Error>> + Send;

    /// Write `buf` at `offset`, returning the number of bytes written.
    ///
    /// A short count is valid; writing past the current end of the file
    /// extends it, zero-filling any gap.
    fn write_at(&self, buf: Bytes, offset: u64) -> impl Future<Output = Result<usize, Error>> + Send;

    /// Current physical length of the file.
    fn size(&self) -> impl Future<Output = Result<u64, Error>> + Send;

    /// Truncate (or extend, zero-filled) the file to `len` bytes.
    fn truncate(&self, len: u64) -> impl Future<Output = Result<(), Error>> + Send;

    /// Durability barrier: block until previously written data is persisted.
    ///
    /// Flushing file metadata is not required.
    fn sync(&self) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Opens channels and manipulates the paths behind them.
pub trait Backend: Clone + Send + Sync + 'static {
    /// The channel type this backend produces.
    type Channel: Channel;

    /// Open the file at `path` in read-write mode.
    ///
    /// With `create`, the file must not yet exist; without it, it must.
    fn open(
        &self,
        path: &Path,
        create: bool,
    ) -> impl Future<Output = Result<Self::Channel, Error>> + Send;

    /// Remove the file at `path`.
    fn remove(&self, path: &Path) -> impl Future<Output = Result<(), Error>> + Send;

    /// Move the file at `from` to `to`, replacing any file already there.
    fn rename(&self, from: &Path, to: &Path) -> impl Future<Output = Result<(), Error>> + Send;

    /// Copy the contents of `from` over `to`, replacing any file already
    /// there.
    fn copy(&self, from: &Path, to: &Path) -> impl Future<Output = Result<(), Error>> + Send;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> impl Future<Output = bool> + Send;
}
