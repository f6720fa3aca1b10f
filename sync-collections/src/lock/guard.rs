//! Scoped guards. Dropping a guard is the only way to release the lock.

use std::cell::RefCell;
use std::marker::PhantomData;
use std::mem;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::acquire::{block_on, wake_all, Upgrade};
use super::{Inner, LockCore, LockMode};
use crate::error::Result;

mod private {
    pub trait Sealed {}
}

/// Proof that a lock is held in some mode.
pub trait Guard: private::Sealed {
    fn mode(&self) -> LockMode;

    /// True when this guard was handed out by `lock`.
    fn guards(&self, lock: &LockCore) -> bool;

    #[doc(hidden)]
    fn lock_key(&self) -> usize;
}

/// Proof that a lock is held exclusively.
pub trait ExclusiveGuard: Guard {}

pub(crate) struct RawGuard {
    inner: Arc<Inner>,
    mode: LockMode,
    id: u64,
    released: bool,
}

impl RawGuard {
    pub(crate) fn new(inner: Arc<Inner>, mode: LockMode, id: u64) -> Self {
        Self {
            inner,
            mode,
            id,
            released: false,
        }
    }

    fn release(&mut self) {
        if mem::replace(&mut self.released, true) {
            return;
        }
        let mut wakers = Vec::new();
        {
            let mut state = self.inner.state.lock();
            state.disown(self.id);
            state.release(self.mode, &mut wakers);
        }
        trace!(lock = %self.inner.name, mode = ?self.mode, "lock released");
        wake_all(wakers);
    }

    fn guards(&self, lock: &LockCore) -> bool {
        Arc::ptr_eq(&self.inner, lock.inner())
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }
}

impl Drop for RawGuard {
    fn drop(&mut self) {
        self.release();
    }
}

macro_rules! owned_guard {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[must_use = "the lock is released as soon as the guard is dropped"]
        pub struct $name {
            raw: RawGuard,
        }

        impl $name {
            pub(crate) fn new(raw: RawGuard) -> Self {
                Self { raw }
            }

            /// Releases the lock.
            pub fn release(self) {
                drop(self);
            }

            /// Releases the lock. Release never waits; this exists so async
            /// code can dispose guards uniformly.
            pub async fn release_async(self) {
                drop(self);
            }
        }

        impl private::Sealed for $name {}

        impl Guard for $name {
            fn mode(&self) -> LockMode {
                self.raw.mode
            }

            fn guards(&self, lock: &LockCore) -> bool {
                self.raw.guards(lock)
            }

            fn lock_key(&self) -> usize {
                self.raw.key()
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("lock", &self.raw.inner.name)
                    .field("mode", &self.raw.mode)
                    .finish()
            }
        }
    };
}

owned_guard!(
    /// Shared guard, from a plain or a priority read.
    ReadGuard
);

owned_guard!(
    /// The single upgradeable read guard of a lock.
    UpgradeableReadGuard
);

owned_guard!(
    /// Exclusive guard.
    WriteGuard
);

impl ExclusiveGuard for WriteGuard {}

impl UpgradeableReadGuard {
    /// Blocks until this guard can write. Other readers drain first; no other
    /// writer can get in between.
    pub fn upgrade(&mut self) -> Result<UpgradedWriteGuard<'_>> {
        block_on(self.upgrade_async(None))
    }

    /// Waits until this guard can write. Cancelling leaves the guard as an
    /// upgradeable read.
    pub fn upgrade_async(&mut self, token: Option<&CancellationToken>) -> Upgrade<'_> {
        let inner = self.raw.inner.clone();
        let id = self.raw.id;
        Upgrade::new(inner, id, self, token)
    }
}

/// Write access obtained by upgrading an [`UpgradeableReadGuard`]. Releasing
/// it returns the holder to upgradeable read.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct UpgradedWriteGuard<'g> {
    guard: &'g mut UpgradeableReadGuard,
}

impl<'g> UpgradedWriteGuard<'g> {
    pub(crate) fn new(guard: &'g mut UpgradeableReadGuard) -> Self {
        Self { guard }
    }

    /// Gives up write access and keeps the upgradeable read.
    pub fn downgrade(self) {
        drop(self);
    }
}

impl Drop for UpgradedWriteGuard<'_> {
    fn drop(&mut self) {
        let inner = &self.guard.raw.inner;
        let mut wakers = Vec::new();
        inner.state.lock().downgrade(&mut wakers);
        trace!(lock = %inner.name, "lock downgraded");
        wake_all(wakers);
    }
}

impl private::Sealed for UpgradedWriteGuard<'_> {}

impl Guard for UpgradedWriteGuard<'_> {
    fn mode(&self) -> LockMode {
        LockMode::Write
    }

    fn guards(&self, lock: &LockCore) -> bool {
        self.guard.guards(lock)
    }

    fn lock_key(&self) -> usize {
        self.guard.lock_key()
    }
}

impl ExclusiveGuard for UpgradedWriteGuard<'_> {}

impl std::fmt::Debug for UpgradedWriteGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradedWriteGuard")
            .field("lock", &self.guard.raw.inner.name)
            .finish()
    }
}

thread_local! {
    static HELD: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks a lock as held by the current thread while a collection runs a user
/// callback under it. Acquisitions check the mark to fail nested requests that
/// would otherwise deadlock.
pub(crate) struct LockScope {
    key: usize,
    _not_send: PhantomData<*const ()>,
}

impl LockScope {
    fn enter(guard: &impl Guard) -> Self {
        let key = guard.lock_key();
        HELD.with(|held| held.borrow_mut().push(key));
        Self {
            key,
            _not_send: PhantomData,
        }
    }

    /// Runs `f` with the guard's lock marked as held by this thread.
    pub(crate) fn run<R>(guard: &impl Guard, f: impl FnOnce() -> R) -> R {
        let _scope = Self::enter(guard);
        f()
    }

    pub(crate) fn is_held(inner: &Arc<Inner>) -> bool {
        let key = Arc::as_ptr(inner) as usize;
        HELD.with(|held| held.borrow().contains(&key))
    }
}

impl Drop for LockScope {
    fn drop(&mut self) {
        HELD.with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|k| *k == self.key) {
                held.remove(pos);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_reports_its_lock_and_mode() {
        let lock = LockCore::named("guards");
        let other = LockCore::new();
        let guard = lock.enter_read().unwrap();
        assert!(guard.guards(&lock));
        assert!(!guard.guards(&other));
        assert_eq!(guard.mode(), LockMode::Read);
        assert!(format!("{guard:?}").contains("guards"));
    }

    #[test]
    fn release_is_consumed_once() {
        let lock = LockCore::new();
        let guard = lock.enter_write().unwrap();
        guard.release();
        assert!(lock.status().is_free());
        // A fresh guard of any mode is granted immediately.
        assert!(lock.try_enter_write().unwrap().is_some());
    }

    #[test]
    fn upgraded_guard_downgrades_on_drop() {
        let lock = LockCore::new();
        let mut upgradeable = lock.enter_upgradeable_read().unwrap();
        {
            let write = upgradeable.upgrade().unwrap();
            assert_eq!(write.mode(), LockMode::Write);
            assert!(lock.status().writer);
            assert!(lock.try_enter_read().unwrap().is_none());
        }
        let status = lock.status();
        assert!(!status.writer && status.upgradeable);
        assert_eq!(status.readers, 1);
        drop(upgradeable);
        assert!(lock.status().is_free());
    }

    #[test]
    fn scope_marks_lock_for_current_thread_only() {
        let lock = LockCore::new();
        let guard = lock.enter_read().unwrap();
        LockScope::run(&guard, || {
            assert!(LockScope::is_held(lock.inner()));
            let lock = lock.clone();
            std::thread::spawn(move || assert!(!LockScope::is_held(lock.inner())))
                .join()
                .unwrap();
        });
        assert!(!LockScope::is_held(lock.inner()));
    }
}
