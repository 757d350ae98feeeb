//! Durable block-addressed file.
//!
//! [`BlockFile`] owns one backing path and layers a logical, header-relative
//! address space over a [`channel::Channel`]. Callers allocate regions with
//! [`BlockFile::allocate`], address them with positional reads and writes,
//! and make them durable with [`BlockFile::sync`].
//!
//! # Allocation
//!
//! Allocation advances the logical size with a single atomic add. Physical
//! zero-fill of the underlying file is deferred until the gap between the
//! logical and committed size exceeds [`ALLOCATION_THRESHOLD`], at which
//! point exactly one allocator claims the gap with a compare-and-swap and
//! writes it out in large zeroed chunks. Concurrent allocators keep taking
//! the cheap path while the winner fills.
//!
//! # Durability
//!
//! Every completed write bumps a dirty counter. [`BlockFile::sync`] snapshots
//! the counter under a flush mutex, issues one durability barrier for all
//! writes observed so far, and subtracts the snapshot. Concurrent callers
//! coalesce: whoever enters the mutex first flushes for everyone queued
//! behind it.
//!
//! # Locking
//!
//! Reads, writes, batch submission, allocation, and sync take the shared
//! lock; lifecycle operations and shrink take the exclusive lock and so wait
//! for every in-flight data-plane operation, including detached batch tasks,
//! to drain. The flush mutex is only ever acquired while the shared lock is
//! held.

use crate::{
    channel::{Backend, Channel},
    rwlock::RwLock,
    Error,
};
use bytes::{Buf, Bytes, BytesMut};
use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::warn;

/// Size of the opaque header prefix reserved at the start of every file.
///
/// The header is invisible to callers: logical offset `0` maps to physical
/// offset `HEADER_SIZE`, and the region below it is zero-initialized at
/// creation and never touched again.
pub const HEADER_SIZE: u64 = 64;

/// Gap between the logical and committed size above which allocation
/// physically zero-fills the backing file.
pub const ALLOCATION_THRESHOLD: u64 = 1024 * 1024;

// Zero-fill writes slice this region instead of allocating.
const ZERO_CHUNK: usize = 1024 * 1024;
static ZEROES: [u8; ZERO_CHUNK] = [0u8; ZERO_CHUNK];

struct State<C> {
    path: PathBuf,
    // Present iff the file is open
    channel: Option<C>,
}

struct Shared<C> {
    state: RwLock<State<C>>,
    size: AtomicU64,
    committed_size: AtomicU64,
    dirty: AtomicU64,
    // Serializes durability barriers; acquired only under the shared lock
    flush: Mutex<()>,
}

/// A durable block-addressed file.
///
/// One instance guards one backing path. Handles are cheaply cloneable and
/// all clones share state, so a file can be driven from many tasks at once.
#[derive(Clone)]
pub struct BlockFile<B: Backend> {
    backend: B,
    shared: Arc<Shared<B::Channel>>,
}

impl<B: Backend> BlockFile<B> {
    /// Create a handle for `path`.
    ///
    /// The filesystem is not touched until [`create`](Self::create) or
    /// [`open`](Self::open) is called.
    pub fn new(backend: B, path: impl Into<PathBuf>) -> Self {
        Self {
            backend,
            shared: Arc::new(Shared {
                state: RwLock::new(State {
                    path: path.into(),
                    channel: None,
                }),
                size: AtomicU64::new(0),
                committed_size: AtomicU64::new(0),
                dirty: AtomicU64::new(0),
                flush: Mutex::new(()),
            }),
        }
    }

    /// Create the backing file and open it.
    ///
    /// Fails if the handle is already open or a file already exists at the
    /// path.
    pub async fn create(&self) -> Result<(), Error> {
        let mut state = self.shared.state.write().await;
        if state.channel.is_some() {
            return Err(Error::AlreadyOpen(display(&state.path)));
        }
        let channel = self.backend.open(&state.path, true).await?;
        self.init_size(&channel).await?;
        state.channel = Some(channel);
        Ok(())
    }

    /// Open an existing backing file.
    ///
    /// Fails if the handle is already open or no file exists at the path.
    pub async fn open(&self) -> Result<(), Error> {
        let mut state = self.shared.state.write().await;
        if state.channel.is_some() {
            return Err(Error::AlreadyOpen(display(&state.path)));
        }
        let channel = self.backend.open(&state.path, false).await?;
        self.init_size(&channel).await?;
        state.channel = Some(channel);
        Ok(())
    }

    /// Persist the header prefix if missing and derive the logical size from
    /// the physical length.
    async fn init_size(&self, channel: &B::Channel) -> Result<(), Error> {
        let mut physical = channel.size().await?;
        if physical < HEADER_SIZE {
            let mut remaining = Bytes::from_static(&ZEROES[..HEADER_SIZE as usize]);
            let mut position = 0u64;
            while !remaining.is_empty() {
                let written = channel.write_at(remaining.clone(), position).await?;
                remaining.advance(written);
                position += written as u64;
            }
            self.shared.dirty.fetch_add(1, Ordering::SeqCst);
            physical = channel.size().await?;
        }
        let logical = physical - HEADER_SIZE;
        self.shared.size.store(logical, Ordering::SeqCst);
        self.shared.committed_size.store(logical, Ordering::SeqCst);
        Ok(())
    }

    /// Close the file, draining all in-flight I/O first.
    pub async fn close(&self) -> Result<(), Error> {
        let mut state = self.shared.state.write().await;
        if state.channel.take().is_none() {
            return Err(Error::Closed(display(&state.path)));
        }
        Ok(())
    }

    /// Close the file and remove it from the filesystem.
    pub async fn remove(&self) -> Result<(), Error> {
        let mut state = self.shared.state.write().await;
        if state.channel.take().is_none() {
            return Err(Error::Closed(display(&state.path)));
        }
        self.backend.remove(&state.path).await
    }

    /// Move the backing file to `new_path` and reopen it there.
    pub async fn rename_to(&self, new_path: impl Into<PathBuf>) -> Result<(), Error> {
        let new_path = new_path.into();
        let mut state = self.shared.state.write().await;
        if state.channel.take().is_none() {
            return Err(Error::Closed(display(&state.path)));
        }
        self.backend.rename(&state.path, &new_path).await?;
        state.path = new_path;
        let channel = self.backend.open(&state.path, false).await?;
        self.init_size(&channel).await?;
        state.channel = Some(channel);
        Ok(())
    }

    /// Replace the backing file's contents with a copy of `source` and
    /// reopen it.
    ///
    /// The copy is raw: `source` must carry the same header-prefixed layout,
    /// e.g. be the backing file of another [`BlockFile`].
    pub async fn replace_with(&self, source: impl AsRef<Path>) -> Result<(), Error> {
        let mut state = self.shared.state.write().await;
        if state.channel.take().is_none() {
            return Err(Error::Closed(display(&state.path)));
        }
        self.backend.copy(source.as_ref(), &state.path).await?;
        let channel = self.backend.open(&state.path, false).await?;
        self.init_size(&channel).await?;
        state.channel = Some(channel);
        Ok(())
    }

    /// Whether a file exists at the backing path.
    pub async fn exists(&self) -> bool {
        let state = self.shared.state.read().await;
        self.backend.exists(&state.path).await
    }

    /// Whether the file is open.
    pub async fn is_open(&self) -> bool {
        self.shared.state.read().await.channel.is_some()
    }

    /// Logical allocated size in bytes, excluding the header prefix.
    pub fn size(&self) -> u64 {
        self.shared.size.load(Ordering::SeqCst)
    }

    /// File name component of the backing path.
    pub async fn name(&self) -> String {
        let state = self.shared.state.read().await;
        state
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Current backing path.
    pub async fn path(&self) -> PathBuf {
        self.shared.state.read().await.path.clone()
    }

    /// Read into `buf` at logical `offset`.
    ///
    /// The buffer is filled from its start. If the physical file ends before
    /// the buffer is full, `exact` decides the outcome: fail with
    /// [`Error::UnexpectedEof`], or return the buffer truncated to the bytes
    /// actually read.
    pub async fn read_at(
        &self,
        offset: u64,
        mut buf: BytesMut,
        exact: bool,
    ) -> Result<BytesMut, Error> {
        let state = self.shared.state.read().await;
        let channel = open_channel(&state)?;
        self.check_offset(&state, offset)?;

        let base = offset.checked_add(HEADER_SIZE).ok_or(Error::OffsetOverflow)?;
        let len = buf.len();
        let mut filled = 0;
        while filled < len {
            let (returned, read) = channel.read_at(buf, filled, base + filled as u64).await?;
            buf = returned;
            if read == 0 {
                if exact {
                    return Err(Error::UnexpectedEof(display(&state.path)));
                }
                buf.truncate(filled);
                break;
            }
            filled += read;
        }
        Ok(buf)
    }

    /// Write `buf` at logical `offset`.
    ///
    /// The entire buffer is written, rechaining partial completions, before
    /// this returns. Completion marks the file dirty for the next
    /// [`sync`](Self::sync).
    pub async fn write_at(&self, offset: u64, buf: Bytes) -> Result<(), Error> {
        let state = self.shared.state.read().await;
        let channel = open_channel(&state)?;
        self.check_offset(&state, offset)?;

        let mut position = offset.checked_add(HEADER_SIZE).ok_or(Error::OffsetOverflow)?;
        let mut remaining = buf;
        while !remaining.is_empty() {
            let written = channel.write_at(remaining.clone(), position).await?;
            remaining.advance(written);
            position += written as u64;
        }
        self.shared.dirty.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Submit a batch of positional writes and return a joinable handle.
    ///
    /// Every pair is validated before any is dispatched. Pairs are written
    /// concurrently with no ordering between them; within one pair, partial
    /// completions are rechained in offset order. The shared lock is held by
    /// the batch until the last pair drains, so a concurrent close waits for
    /// the whole batch. Callers must not submit overlapping ranges within
    /// one batch.
    pub async fn write_batch(&self, writes: Vec<(u64, Bytes)>) -> Result<BatchHandle, Error> {
        let guard = Arc::new(self.shared.state.read_owned().await);
        let state: &State<B::Channel> = &guard;
        let channel = open_channel(state)?.clone();
        for (offset, _) in &writes {
            self.check_offset(state, *offset)?;
        }

        let mut handles = Vec::with_capacity(writes.len());
        for (offset, buf) in writes {
            let base = offset.checked_add(HEADER_SIZE).ok_or(Error::OffsetOverflow)?;
            let guard = guard.clone();
            let channel = channel.clone();
            let shared = self.shared.clone();
            handles.push(tokio::spawn(async move {
                // Keeps the shared lock held until this pair drains
                let _guard = guard;
                let mut position = base;
                let mut remaining = buf;
                while !remaining.is_empty() {
                    let written = channel.write_at(remaining.clone(), position).await?;
                    remaining.advance(written);
                    position += written as u64;
                }
                shared.dirty.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }
        Ok(BatchHandle { handles })
    }

    /// Reserve `len` bytes, returning the start of the reserved range.
    ///
    /// Concurrent callers observe disjoint ranges. The logical size advances
    /// immediately; the backing file is only zero-filled once the gap to the
    /// committed size exceeds [`ALLOCATION_THRESHOLD`], and only by the one
    /// caller that wins the commit.
    pub async fn allocate(&self, len: u64) -> Result<u64, Error> {
        let state = self.shared.state.read().await;
        let channel = open_channel(&state)?;

        let new_size = self.shared.size.fetch_add(len, Ordering::SeqCst) + len;
        let start = new_size - len;

        let mut committed = self.shared.committed_size.load(Ordering::SeqCst);
        if new_size.saturating_sub(committed) <= ALLOCATION_THRESHOLD {
            return Ok(start);
        }

        // Claim the bump; at most one caller fills a given span
        while committed < new_size {
            match self.shared.committed_size.compare_exchange(
                committed,
                new_size,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(current) => committed = current,
            }
        }
        if committed >= new_size {
            return Ok(start);
        }

        // Zero-fill [committed, new_size)
        let base = committed
            .checked_add(HEADER_SIZE)
            .ok_or(Error::OffsetOverflow)?;
        let span = new_size - committed;
        let mut written = 0u64;
        while written < span {
            let chunk = (span - written).min(ZERO_CHUNK as u64) as usize;
            let mut remaining = Bytes::from_static(&ZEROES[..chunk]);
            while !remaining.is_empty() {
                let count = channel.write_at(remaining.clone(), base + written).await?;
                remaining.advance(count);
                written += count as u64;
            }
        }
        self.shared.dirty.fetch_add(1, Ordering::SeqCst);
        Ok(start)
    }

    /// Shrink the file to `new_size` logical bytes.
    ///
    /// Bytes below `new_size` stay readable; everything above is discarded
    /// physically and the committed size is clamped along with the logical
    /// size.
    pub async fn shrink(&self, new_size: u64) -> Result<(), Error> {
        let state = self.shared.state.write().await;
        let channel = open_channel(&state)?;
        let physical = new_size
            .checked_add(HEADER_SIZE)
            .ok_or(Error::OffsetOverflow)?;
        self.shared.size.store(new_size, Ordering::SeqCst);
        self.shared.committed_size.store(new_size, Ordering::SeqCst);
        channel.truncate(physical).await
    }

    /// Flush all writes observed so far to durable storage.
    ///
    /// A no-op when nothing is dirty. Concurrent callers coalesce into one
    /// barrier. A failed barrier is logged and the dirty count preserved, so
    /// the next call retries; no error is surfaced.
    pub async fn sync(&self) {
        let state = self.shared.state.read().await;
        let Some(channel) = state.channel.as_ref() else {
            return;
        };
        let _flush = self.shared.flush.lock().await;
        let dirty = self.shared.dirty.load(Ordering::SeqCst);
        if dirty == 0 {
            return;
        }
        match channel.sync().await {
            Ok(()) => {
                self.shared.dirty.fetch_sub(dirty, Ordering::SeqCst);
            }
            Err(err) => {
                warn!(?err, "flush failed, data may be lost in case of power failure");
            }
        }
    }

    /// Record a write event performed outside this handle, so the next
    /// [`sync`](Self::sync) is not a no-op.
    pub fn mark_dirty(&self) {
        self.shared.dirty.fetch_add(1, Ordering::SeqCst);
    }

    fn check_offset<C>(&self, state: &State<C>, offset: u64) -> Result<(), Error> {
        let size = self.shared.size.load(Ordering::SeqCst);
        if offset >= size {
            return Err(Error::OffsetOutOfRange {
                path: display(&state.path),
                offset,
                size,
            });
        }
        Ok(())
    }
}

fn open_channel<C>(state: &State<C>) -> Result<&C, Error> {
    state
        .channel
        .as_ref()
        .ok_or_else(|| Error::Closed(display(&state.path)))
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

/// Joinable handle for a batch of writes submitted with
/// [`BlockFile::write_batch`].
///
/// Dropping the handle does not cancel the batch; the writes drain on their
/// own and a concurrent close still waits for them.
pub struct BatchHandle {
    handles: Vec<JoinHandle<Result<(), Error>>>,
}

impl BatchHandle {
    /// Wait until every write in the batch has completed, then surface the
    /// first failure observed, if any.
    pub async fn wait(self) -> Result<(), Error> {
        let mut failure = None;
        for handle in self.handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(_) => Err(Error::TaskAborted),
            };
            if let Err(err) = result {
                failure.get_or_insert(err);
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{memory, tokio as fs_channel, Backend as _, Channel as _};
    use futures::future::join_all;
    use rand::{Rng as _, SeedableRng};
    use std::env;

    fn memory_file(path: &str) -> BlockFile<memory::Backend> {
        BlockFile::new(memory::Backend::new(), path)
    }

    fn temp_base(prefix: &str) -> PathBuf {
        let mut rng = rand::rngs::StdRng::from_entropy();
        let base = env::temp_dir().join(format!("{}_{}", prefix, rng.gen::<u64>()));
        std::fs::create_dir_all(&base).unwrap();
        base
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let file = memory_file("lifecycle");
        assert!(!file.exists().await);
        assert!(!file.is_open().await);

        file.create().await.unwrap();
        assert!(file.exists().await);
        assert!(file.is_open().await);
        assert_eq!(file.size(), 0);
        assert_eq!(file.name().await, "lifecycle");

        // Creating or opening an open file fails
        assert!(matches!(file.create().await, Err(Error::AlreadyOpen(_))));
        assert!(matches!(file.open().await, Err(Error::AlreadyOpen(_))));

        file.close().await.unwrap();
        assert!(!file.is_open().await);
        assert!(file.exists().await);
        assert!(matches!(file.close().await, Err(Error::Closed(_))));

        file.open().await.unwrap();
        assert!(file.is_open().await);
    }

    #[tokio::test]
    async fn test_create_writes_header() {
        let backend = memory::Backend::new();
        let file = BlockFile::new(backend.clone(), "header");
        file.create().await.unwrap();
        assert_eq!(file.size(), 0);

        // The physical file consists of the zeroed header prefix only
        let raw = backend.open(Path::new("header"), false).await.unwrap();
        assert_eq!(raw.size().await.unwrap(), HEADER_SIZE);
        let (buf, read) = raw
            .read_at(BytesMut::zeroed(HEADER_SIZE as usize), 0, 0)
            .await
            .unwrap();
        assert_eq!(read, HEADER_SIZE as usize);
        assert!(buf.iter().all(|byte| *byte == 0));

        // The header write left the file dirty
        assert_eq!(file.shared.dirty.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_operations() {
        let file = memory_file("closed");
        file.create().await.unwrap();
        file.allocate(128).await.unwrap();
        file.close().await.unwrap();

        let buf = Bytes::from_static(b"payload");
        assert!(matches!(
            file.write_at(0, buf.clone()).await,
            Err(Error::Closed(_))
        ));
        assert!(matches!(
            file.read_at(0, BytesMut::zeroed(8), true).await,
            Err(Error::Closed(_))
        ));
        assert!(matches!(file.allocate(8).await, Err(Error::Closed(_))));
        assert!(matches!(file.shrink(0).await, Err(Error::Closed(_))));
        assert!(matches!(
            file.write_batch(vec![(0, buf)]).await,
            Err(Error::Closed(_))
        ));
        assert!(matches!(file.remove().await, Err(Error::Closed(_))));

        // Nothing to flush on a closed file; must not panic
        file.sync().await;
    }

    #[tokio::test]
    async fn test_offset_validation() {
        let file = memory_file("offsets");
        file.create().await.unwrap();

        // Nothing is allocated yet, so offset 0 is out of range
        assert!(matches!(
            file.read_at(0, BytesMut::zeroed(1), true).await,
            Err(Error::OffsetOutOfRange { .. })
        ));
        assert!(matches!(
            file.write_at(0, Bytes::from_static(b"x")).await,
            Err(Error::OffsetOutOfRange { .. })
        ));

        file.allocate(10).await.unwrap();
        assert!(matches!(
            file.write_at(10, Bytes::from_static(b"x")).await,
            Err(Error::OffsetOutOfRange { offset: 10, size: 10, .. })
        ));
        // Only the start offset is validated
        file.write_at(9, Bytes::from_static(b"xy")).await.unwrap();
        assert!(matches!(
            file.read_at(10, BytesMut::zeroed(1), true).await,
            Err(Error::OffsetOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_roundtrip_across_reopen() {
        let base = temp_base("blockfile_roundtrip");
        let file = BlockFile::new(fs_channel::Backend::new(), base.join("data"));
        file.create().await.unwrap();

        let start = file.allocate(4096).await.unwrap();
        assert_eq!(start, 0);
        file.write_at(0, Bytes::from(vec![0xAB; 4096])).await.unwrap();
        file.sync().await;
        file.close().await.unwrap();

        file.open().await.unwrap();
        assert_eq!(file.size(), 4096);
        let buf = file.read_at(0, BytesMut::zeroed(4096), true).await.unwrap();
        assert!(buf.iter().all(|byte| *byte == 0xAB));

        file.remove().await.unwrap();
        assert!(!file.exists().await);
        std::fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_parallel_allocations() {
        let file = memory_file("parallel");
        file.create().await.unwrap();

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let file = file.clone();
                tokio::spawn(async move { file.allocate(1024).await.unwrap() })
            })
            .collect();
        let mut starts: Vec<u64> = join_all(handles)
            .await
            .into_iter()
            .map(|result| result.unwrap())
            .collect();

        // Concurrent allocations return disjoint ranges covering the file
        starts.sort_unstable();
        let expected: Vec<u64> = (0..64).map(|i| i * 1024).collect();
        assert_eq!(starts, expected);
        assert_eq!(file.size(), 65536);
    }

    #[tokio::test]
    async fn test_allocation_threshold() {
        let backend = memory::Backend::new();

        // At the threshold, no physical work happens
        let file = BlockFile::new(backend.clone(), "at_threshold");
        file.create().await.unwrap();
        file.allocate(ALLOCATION_THRESHOLD).await.unwrap();
        assert_eq!(file.shared.committed_size.load(Ordering::SeqCst), 0);
        let raw = backend.open(Path::new("at_threshold"), false).await.unwrap();
        assert_eq!(raw.size().await.unwrap(), HEADER_SIZE);

        // One byte past it, the whole gap is committed and zero-filled
        let file = BlockFile::new(backend.clone(), "past_threshold");
        file.create().await.unwrap();
        let start = file.allocate(ALLOCATION_THRESHOLD + 1).await.unwrap();
        assert_eq!(start, 0);
        assert_eq!(
            file.shared.committed_size.load(Ordering::SeqCst),
            ALLOCATION_THRESHOLD + 1
        );
        let raw = backend
            .open(Path::new("past_threshold"), false)
            .await
            .unwrap();
        assert_eq!(
            raw.size().await.unwrap(),
            HEADER_SIZE + ALLOCATION_THRESHOLD + 1
        );
    }

    #[tokio::test]
    async fn test_zero_fill_readback() {
        let file = memory_file("zero_fill");
        file.create().await.unwrap();

        let start = file.allocate(2 * 1024 * 1024).await.unwrap();
        assert_eq!(start, 0);

        // Bytes past the threshold crossing are physically zero
        let buf = file
            .read_at(1024 * 1024 + 512 * 1024, BytesMut::zeroed(4096), true)
            .await
            .unwrap();
        assert!(buf.iter().all(|byte| *byte == 0));
    }

    #[tokio::test]
    async fn test_read_eof() {
        let file = memory_file("eof");
        file.create().await.unwrap();

        // Allocation below the threshold leaves the physical file short
        file.allocate(100).await.unwrap();
        assert!(matches!(
            file.read_at(0, BytesMut::zeroed(100), true).await,
            Err(Error::UnexpectedEof(_))
        ));
        let buf = file.read_at(0, BytesMut::zeroed(100), false).await.unwrap();
        assert_eq!(buf.len(), 0);

        // A partial write yields a partial read
        file.write_at(0, Bytes::from(vec![9u8; 40])).await.unwrap();
        let buf = file.read_at(0, BytesMut::zeroed(100), false).await.unwrap();
        assert_eq!(buf.len(), 40);
        assert!(buf.iter().all(|byte| *byte == 9));
    }

    #[tokio::test]
    async fn test_write_batch() {
        let file = memory_file("batch");
        file.create().await.unwrap();
        file.allocate(200).await.unwrap();

        let batch = file
            .write_batch(vec![
                (0, Bytes::from(vec![1u8; 10])),
                (100, Bytes::from(vec![2u8; 10])),
            ])
            .await
            .unwrap();
        batch.wait().await.unwrap();

        let buf = file.read_at(0, BytesMut::zeroed(10), true).await.unwrap();
        assert!(buf.iter().all(|byte| *byte == 1));
        let buf = file.read_at(100, BytesMut::zeroed(10), true).await.unwrap();
        assert!(buf.iter().all(|byte| *byte == 2));
    }

    #[tokio::test]
    async fn test_write_batch_validates_before_dispatch() {
        let file = memory_file("batch_validation");
        file.create().await.unwrap();
        file.allocate(100).await.unwrap();

        assert!(matches!(
            file.write_batch(vec![
                (0, Bytes::from_static(b"fine")),
                (100, Bytes::from_static(b"beyond")),
            ])
            .await,
            Err(Error::OffsetOutOfRange { offset: 100, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_drains_batch() {
        // Chunked transfers force many redispatches per pair
        let file = BlockFile::new(memory::Backend::chunked(7), "batch_drain");
        file.create().await.unwrap();
        file.allocate(1000).await.unwrap();

        let payload = pattern(1000);
        let batch = file
            .write_batch(vec![(0, Bytes::from(payload.clone()))])
            .await
            .unwrap();

        // Close must wait for the detached batch to drain
        file.close().await.unwrap();
        file.open().await.unwrap();
        let buf = file.read_at(0, BytesMut::zeroed(1000), true).await.unwrap();
        assert_eq!(&buf[..], &payload[..]);

        batch.wait().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_last_writer_wins() {
        let file = memory_file("race");
        file.create().await.unwrap();
        file.allocate(64).await.unwrap();

        let a = file.clone();
        let b = file.clone();
        let first = tokio::spawn(async move { a.write_at(0, Bytes::from(vec![0xAA; 64])).await });
        let second = tokio::spawn(async move { b.write_at(0, Bytes::from(vec![0xBB; 64])).await });
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
        file.sync().await;

        // One of the two writes won in full
        let buf = file.read_at(0, BytesMut::zeroed(64), true).await.unwrap();
        assert!(
            buf.iter().all(|byte| *byte == 0xAA) || buf.iter().all(|byte| *byte == 0xBB),
            "torn write: {:?}",
            &buf[..]
        );
    }

    #[tokio::test]
    async fn test_partial_io_rechaining() {
        let file = BlockFile::new(memory::Backend::chunked(7), "rechain");
        file.create().await.unwrap();
        file.allocate(1000).await.unwrap();

        let payload = pattern(1000);
        file.write_at(0, Bytes::from(payload.clone())).await.unwrap();
        let buf = file.read_at(0, BytesMut::zeroed(1000), true).await.unwrap();
        assert_eq!(&buf[..], &payload[..]);
    }

    #[tokio::test]
    async fn test_shrink() {
        let backend = memory::Backend::new();
        let file = BlockFile::new(backend.clone(), "shrink");
        file.create().await.unwrap();
        file.allocate(100).await.unwrap();
        file.write_at(0, Bytes::from(vec![7u8; 100])).await.unwrap();

        file.shrink(50).await.unwrap();
        assert_eq!(file.size(), 50);
        assert_eq!(file.shared.committed_size.load(Ordering::SeqCst), 50);

        // Bytes below the new size survive, bytes above are gone
        let buf = file.read_at(0, BytesMut::zeroed(50), true).await.unwrap();
        assert!(buf.iter().all(|byte| *byte == 7));
        assert!(matches!(
            file.read_at(50, BytesMut::zeroed(1), true).await,
            Err(Error::OffsetOutOfRange { .. })
        ));
        let raw = backend.open(Path::new("shrink"), false).await.unwrap();
        assert_eq!(raw.size().await.unwrap(), HEADER_SIZE + 50);

        file.shrink(0).await.unwrap();
        assert_eq!(file.size(), 0);
        assert!(matches!(
            file.read_at(0, BytesMut::zeroed(1), true).await,
            Err(Error::OffsetOutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_coalesces_dirty_writes() {
        let file = memory_file("dirty");
        file.create().await.unwrap();
        assert_eq!(file.shared.dirty.load(Ordering::SeqCst), 1);

        file.allocate(64).await.unwrap();
        file.write_at(0, Bytes::from_static(b"a")).await.unwrap();
        file.write_at(1, Bytes::from_static(b"b")).await.unwrap();
        file.write_at(2, Bytes::from_static(b"c")).await.unwrap();
        assert_eq!(file.shared.dirty.load(Ordering::SeqCst), 4);

        file.sync().await;
        assert_eq!(file.shared.dirty.load(Ordering::SeqCst), 0);

        // Nothing dirty, nothing to do
        file.sync().await;
        assert_eq!(file.shared.dirty.load(Ordering::SeqCst), 0);

        file.mark_dirty();
        assert_eq!(file.shared.dirty.load(Ordering::SeqCst), 1);
        file.sync().await;
        assert_eq!(file.shared.dirty.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rename_preserves_contents() {
        let base = temp_base("blockfile_rename");
        let file = BlockFile::new(fs_channel::Backend::new(), base.join("before"));
        file.create().await.unwrap();
        file.allocate(128).await.unwrap();
        let payload = pattern(128);
        file.write_at(0, Bytes::from(payload.clone())).await.unwrap();

        file.rename_to(base.join("after")).await.unwrap();
        assert_eq!(file.name().await, "after");
        assert_eq!(file.size(), 128);
        assert!(file.is_open().await);
        assert!(!base.join("before").exists());

        let buf = file.read_at(0, BytesMut::zeroed(128), true).await.unwrap();
        assert_eq!(&buf[..], &payload[..]);

        file.remove().await.unwrap();
        std::fs::remove_dir_all(&base).unwrap();
    }

    #[tokio::test]
    async fn test_replace_with() {
        let backend = memory::Backend::new();
        let source = BlockFile::new(backend.clone(), "replace_src");
        source.create().await.unwrap();
        source.allocate(32).await.unwrap();
        source.write_at(0, Bytes::from(vec![5u8; 32])).await.unwrap();
        source.close().await.unwrap();

        let file = BlockFile::new(backend.clone(), "replace_dst");
        file.create().await.unwrap();
        file.allocate(8).await.unwrap();
        file.write_at(0, Bytes::from(vec![9u8; 8])).await.unwrap();

        file.replace_with("replace_src").await.unwrap();
        assert!(file.is_open().await);
        assert_eq!(file.size(), 32);
        let buf = file.read_at(0, BytesMut::zeroed(32), true).await.unwrap();
        assert!(buf.iter().all(|byte| *byte == 5));
    }

    #[tokio::test]
    async fn test_allocation_sums_match_size() {
        let file = memory_file("sums");
        file.create().await.unwrap();

        let widths = [1u64, 4096, 17, 512 * 1024, 3, 1024 * 1024];
        let mut total = 0;
        for width in widths {
            file.allocate(width).await.unwrap();
            total += width;
            assert_eq!(file.size(), total);
            assert!(file.shared.committed_size.load(Ordering::SeqCst) <= file.size());
        }
    }
}
