//! A value guarded by a [`LockCore`], with an explicit locking policy.

use parking_lot::{RwLock as InnerRwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::lock::{block_on, ExclusiveGuard, Guard, LockCore, LockScope};

/// Unsynchronized storage paired with the [`LockCore`] that serializes access
/// to it.
///
/// Access comes in two forms:
/// - Scoped, closure-based access ([`safe_read`](Self::safe_read),
///   [`safe_write`](Self::safe_write) and their async forms). The guard cannot
///   escape, and nested acquisitions of the same lock made by the closure fail
///   instead of deadlocking.
/// - Explicit guard-based access ([`view`](Self::view),
///   [`view_mut`](Self::view_mut)) for compound operations that acquire, inspect
///   and upgrade in several steps. The guard passed in is the proof of access.
///
/// The inner `parking_lot` lock only ever sees uncontended writers, since
/// writers already hold the exclusive [`LockCore`] guard. Callers must not
/// keep a view alive across an `.await`.
pub struct Locked<T> {
    lock: LockCore,
    value: InnerRwLock<T>,
}

impl<T> Locked<T> {
    pub fn new(value: T) -> Self {
        Self::with_lock(LockCore::new(), value)
    }

    pub fn with_lock(lock: LockCore, value: T) -> Self {
        Self {
            lock,
            value: InnerRwLock::new(value),
        }
    }

    pub fn lock(&self) -> &LockCore {
        &self.lock
    }

    /// Shared access to the value under `guard`.
    pub fn view<'a>(&'a self, guard: &'a impl Guard) -> RwLockReadGuard<'a, T> {
        debug_assert!(guard.guards(&self.lock), "guard belongs to another lock");
        self.value.read()
    }

    /// Mutable access to the value under an exclusive `guard`.
    pub fn view_mut<'a>(&'a self, guard: &'a impl ExclusiveGuard) -> RwLockWriteGuard<'a, T> {
        debug_assert!(guard.guards(&self.lock), "guard belongs to another lock");
        self.value.write()
    }

    /// Runs `f` with the value while `guard` keeps the lock held. Nested
    /// acquisitions of this lock made by `f` are detected.
    pub fn with_view<R>(&self, guard: &impl Guard, f: impl FnOnce(&T) -> R) -> R {
        let value = self.view(guard);
        LockScope::run(guard, || f(&value))
    }

    /// Executes `f` while holding a read lock. Blocks until it is granted.
    pub fn safe_read<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&T) -> R,
    {
        block_on(self.safe_read_async(None, f))
    }

    /// Executes `f` while holding a write lock. Blocks until it is granted.
    pub fn safe_write<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        block_on(self.safe_write_async(None, f))
    }

    pub async fn safe_read_async<F, R>(&self, token: Option<&CancellationToken>, f: F) -> Result<R>
    where
        F: FnOnce(&T) -> R,
    {
        let guard = self.lock.enter_read_async(token).await?;
        Ok(self.with_view(&guard, f))
    }

    pub async fn safe_write_async<F, R>(
        &self,
        token: Option<&CancellationToken>,
        f: F,
    ) -> Result<R>
    where
        F: FnOnce(&mut T) -> R,
    {
        let guard = self.lock.enter_write_async(token).await?;
        let mut value = self.view_mut(&guard);
        Ok(LockScope::run(&guard, || f(&mut value)))
    }

    /// Consumes the cell, returning the value.
    pub fn into_inner(self) -> T {
        self.value.into_inner()
    }
}

impl<T: Default> Default for Locked<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> std::fmt::Debug for Locked<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locked").field("lock", &self.lock).finish_non_exhaustive()
    }
}
