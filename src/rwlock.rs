//! Async reader-writer lock arbitrating data-plane and structural operations.
//!
//! Internally this delegates to [`async_lock::RwLock`], giving us fair writer
//! acquisition (writers don't starve behind a stream of readers) without a
//! dependency on any particular runtime. On top of the borrowed guards it
//! exposes [`RwLock::read_owned`], an `Arc`-backed shared guard that can be
//! moved into a detached task and held until that task's I/O drains.

use std::sync::Arc;

/// Async reader-writer lock.
pub struct RwLock<T>(Arc<async_lock::RwLock<T>>);

/// Shared guard returned by [`RwLock::read`].
pub type RwLockReadGuard<'a, T> = async_lock::RwLockReadGuard<'a, T>;
/// Exclusive guard returned by [`RwLock::write`].
pub type RwLockWriteGuard<'a, T> = async_lock::RwLockWriteGuard<'a, T>;
/// Owned shared guard returned by [`RwLock::read_owned`].
pub type RwLockReadGuardOwned<T> = async_lock::RwLockReadGuardArc<T>;

impl<T> RwLock<T> {
    /// Create a new lock.
    pub fn new(value: T) -> Self {
        Self(Arc::new(async_lock::RwLock::new(value)))
    }

    /// Acquire a shared read guard.
    pub async fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read().await
    }

    /// Acquire an exclusive write guard.
    pub async fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write().await
    }

    /// Acquire a shared read guard that is not tied to the borrow of `self`.
    ///
    /// The guard keeps the shared lock held until dropped, so an exclusive
    /// acquirer waits for every outstanding owned guard as well.
    pub async fn read_owned(&self) -> RwLockReadGuardOwned<T> {
        self.0.read_arc().await
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RwLock").finish_non_exhaustive()
    }
}
