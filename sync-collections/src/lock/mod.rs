//! An asymmetric reader/writer lock with an upgradeable read mode.
//!
//! [`LockCore`] guards no data of its own; it hands out guards in four modes:
//!
//! - **read**: shared with other readers and with the upgradeable holder.
//! - **priority read**: a read that is served ahead of every queued request.
//!   This is a deliberate fairness exception used to pin elements briefly
//!   during bulk operations such as [`LockingList::sort_by_pinned`]. It never
//!   overtakes an active writer or a pending upgrade.
//! - **upgradeable read**: a read that at most one caller holds at a time and
//!   that can later become a write without letting another writer in between.
//! - **write**: exclusive.
//!
//! Requests within a mode are served in arrival order. A queued writer (or a
//! pending upgrade) keeps newly arriving plain readers out, while readers that
//! already hold the lock finish normally.
//!
//! Every acquisition has a blocking form and an async form taking an optional
//! [`CancellationToken`]. Both drive the same state machine; the blocking form
//! parks the calling thread until the request is granted. Releasing is done by
//! dropping the guard.
//!
//! The lock is not reentrant. A nested acquisition fails with
//! [`Error::InvalidState`] when it cannot be granted immediately and the
//! current thread already holds the lock, either through a guard taken by a
//! blocking call (enumerators included) or because a collection is running
//! one of its callbacks under the lock. Guards taken by async calls may move
//! between threads and are not tracked.
//!
//! [`LockingList::sort_by_pinned`]: crate::LockingList::sort_by_pinned
//! [`Error::InvalidState`]: crate::Error::InvalidState

mod acquire;
mod guard;
mod state;

use std::future::poll_fn;
use std::sync::Arc;
use std::task::Poll;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CollectionConfig;
use crate::error::Result;

pub(crate) use acquire::{block_on, wake_all};
use acquire::Acquire;
pub use acquire::Upgrade;
pub use guard::{
    ExclusiveGuard, Guard, ReadGuard, UpgradeableReadGuard, UpgradedWriteGuard, WriteGuard,
};
pub(crate) use guard::LockScope;
use state::State;

/// Mode of a guard or of a pending request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    Read,
    PriorityRead,
    UpgradeableRead,
    Write,
}

/// Point-in-time view of a lock, for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    /// Read, priority-read and upgradeable guards currently held.
    pub readers: usize,
    /// A write guard (plain or upgraded) is held.
    pub writer: bool,
    /// An upgradeable read guard is held.
    pub upgradeable: bool,
    /// The upgradeable holder is waiting for readers to drain.
    pub upgrade_pending: bool,
    /// Requests queued in any mode.
    pub waiting: usize,
    pub disposed: bool,
}

impl LockStatus {
    /// No guard is held and nothing is queued.
    pub fn is_free(&self) -> bool {
        self.readers == 0 && !self.writer && !self.upgradeable && self.waiting == 0
    }
}

pub(crate) struct Inner {
    pub(crate) state: Mutex<State>,
    pub(crate) name: String,
    pub(crate) detect_reentrancy: bool,
}

/// Entities that own a lock of their own.
///
/// Collections use it to pin elements while they reorder them. Element locks
/// are always taken while the collection's own lock is held, never the other
/// way round.
pub trait HasLock {
    fn lock_core(&self) -> Option<&LockCore>;
}

/// Handle to an upgradeable reader/writer lock. Clones share the same lock.
#[derive(Clone)]
pub struct LockCore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for LockCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockCore")
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish()
    }
}

impl Default for LockCore {
    fn default() -> Self {
        Self::new()
    }
}

impl LockCore {
    pub fn new() -> Self {
        Self::with_config(&CollectionConfig::default())
    }

    /// A lock whose tracing events carry `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self::with_config(&CollectionConfig::named(name))
    }

    pub fn with_config(config: &CollectionConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                name: config.name.clone(),
                detect_reentrancy: config.detect_reentrancy,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// True when both handles refer to the same lock.
    pub fn same_lock(&self, other: &LockCore) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Stable identity of the lock, used for ordering and de-duplication.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn inner(&self) -> &Arc<Inner> {
        &self.inner
    }

    pub fn status(&self) -> LockStatus {
        let state = self.inner.state.lock();
        LockStatus {
            readers: state.readers,
            writer: state.writer,
            upgradeable: state.upgradeable.is_some(),
            upgrade_pending: state.upgrade.is_some(),
            waiting: state.waiting(),
            disposed: state.disposed,
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().disposed
    }

    fn acquire(&self, mode: LockMode, token: Option<&CancellationToken>) -> Acquire {
        Acquire::new(self.inner.clone(), mode, token)
    }

    /// Blocks until a read guard is granted.
    pub fn enter_read(&self) -> Result<ReadGuard> {
        block_on(self.enter_read_async(None))
    }

    pub async fn enter_read_async(&self, token: Option<&CancellationToken>) -> Result<ReadGuard> {
        self.acquire(LockMode::Read, token).await.map(ReadGuard::new)
    }

    /// Blocks until a high-priority read guard is granted.
    pub fn enter_priority_read(&self) -> Result<ReadGuard> {
        block_on(self.enter_priority_read_async(None))
    }

    pub async fn enter_priority_read_async(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<ReadGuard> {
        self.acquire(LockMode::PriorityRead, token)
            .await
            .map(ReadGuard::new)
    }

    /// Blocks until the upgradeable read guard is granted. A second caller
    /// waits until the current upgradeable holder releases.
    pub fn enter_upgradeable_read(&self) -> Result<UpgradeableReadGuard> {
        block_on(self.enter_upgradeable_read_async(None))
    }

    pub async fn enter_upgradeable_read_async(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<UpgradeableReadGuard> {
        self.acquire(LockMode::UpgradeableRead, token)
            .await
            .map(UpgradeableReadGuard::new)
    }

    /// Blocks until a write guard is granted.
    pub fn enter_write(&self) -> Result<WriteGuard> {
        block_on(self.enter_write_async(None))
    }

    pub async fn enter_write_async(&self, token: Option<&CancellationToken>) -> Result<WriteGuard> {
        self.acquire(LockMode::Write, token)
            .await
            .map(WriteGuard::new)
    }

    /// Read guard if it can be granted without waiting.
    pub fn try_enter_read(&self) -> Result<Option<ReadGuard>> {
        Ok(Acquire::attempt(&self.inner, LockMode::Read)?.map(ReadGuard::new))
    }

    /// Upgradeable read guard if it can be granted without waiting.
    pub fn try_enter_upgradeable_read(&self) -> Result<Option<UpgradeableReadGuard>> {
        Ok(Acquire::attempt(&self.inner, LockMode::UpgradeableRead)?
            .map(UpgradeableReadGuard::new))
    }

    /// Write guard if it can be granted without waiting.
    pub fn try_enter_write(&self) -> Result<Option<WriteGuard>> {
        Ok(Acquire::attempt(&self.inner, LockMode::Write)?.map(WriteGuard::new))
    }

    /// Disposes the lock. Queued and future acquisitions fail with
    /// [`Error::Disposed`](crate::Error::Disposed); guards still held can be
    /// released normally. Calling it again has no effect.
    pub fn dispose(&self) {
        let mut wakers = Vec::new();
        let first = self.inner.state.lock().dispose(&mut wakers);
        if first {
            debug!(lock = %self.inner.name, woken = wakers.len(), "lock disposed");
        }
        wake_all(wakers);
    }

    /// Disposes the lock, then waits until every outstanding guard has been
    /// released.
    pub async fn dispose_async(&self) {
        self.dispose();
        poll_fn(|cx| {
            let mut state = self.inner.state.lock();
            if state.is_idle() {
                Poll::Ready(())
            } else {
                state.register_drain(cx.waker());
                Poll::Pending
            }
        })
        .await;
        debug!(lock = %self.inner.name, "lock drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn readers_do_not_block_each_other() {
        let lock = LockCore::named("readers");
        let guards: Vec<_> = futures::future::join_all((0..8).map(|_| lock.enter_read_async(None)))
            .await
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(lock.status().readers, 8);
        drop(guards);
        assert!(lock.status().is_free());
    }

    #[tokio::test]
    async fn writer_waits_for_reader() {
        let lock = LockCore::new();
        let read = lock.enter_read_async(None).await.unwrap();

        let mut write = Box::pin(lock.enter_write_async(None));
        assert!(futures::poll!(&mut write).is_pending());
        assert_eq!(lock.status().waiting, 1);

        drop(read);
        let write = write.await.unwrap();
        assert!(lock.status().writer);
        assert!(lock.try_enter_read().unwrap().is_none());
        drop(write);
        assert!(lock.status().is_free());
    }

    #[tokio::test]
    async fn second_upgradeable_waits_for_first() {
        let lock = LockCore::new();
        let first = lock.enter_upgradeable_read_async(None).await.unwrap();
        assert!(lock.try_enter_upgradeable_read().unwrap().is_none());

        let mut second = Box::pin(lock.enter_upgradeable_read_async(None));
        assert!(futures::poll!(&mut second).is_pending());
        // Plain readers still get in next to the holder.
        let reader = lock.try_enter_read().unwrap();
        assert!(reader.is_some());

        drop(first);
        let second = second.await.unwrap();
        assert!(lock.status().upgradeable);
        drop((second, reader));
    }

    #[tokio::test]
    async fn upgrade_excludes_other_writers() {
        let lock = LockCore::new();
        let mut upgradeable = lock.enter_upgradeable_read_async(None).await.unwrap();
        let reader = lock.enter_read_async(None).await.unwrap();

        let mut writer = Box::pin(lock.enter_write_async(None));
        assert!(futures::poll!(&mut writer).is_pending());

        {
            let mut upgrade = upgradeable.upgrade_async(None);
            assert!(futures::poll!(&mut upgrade).is_pending());
            assert!(lock.status().upgrade_pending);
            drop(reader);
            let write = upgrade.await.unwrap();
            assert!(lock.status().writer);
            assert!(futures::poll!(&mut writer).is_pending());
            drop(write);
        }
        assert!(lock.status().upgradeable);
        assert!(futures::poll!(&mut writer).is_pending());

        drop(upgradeable);
        let write = writer.await.unwrap();
        drop(write);
        assert!(lock.status().is_free());
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_no_trace() {
        let lock = LockCore::new();
        let write = lock.enter_write_async(None).await.unwrap();
        let token = CancellationToken::new();

        let mut read = Box::pin(lock.enter_read_async(Some(&token)));
        assert!(futures::poll!(&mut read).is_pending());
        token.cancel();
        assert_eq!(read.await.unwrap_err(), Error::Cancelled);

        let status = lock.status();
        assert_eq!((status.readers, status.waiting), (0, 0));
        drop(write);
        assert!(lock.try_enter_write().unwrap().is_some());
    }

    #[tokio::test]
    async fn already_cancelled_token_fails_fast() {
        let lock = LockCore::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = lock.enter_write_async(Some(&token)).await.unwrap_err();
        assert_eq!(err, Error::Cancelled);
        assert!(lock.status().is_free());
    }

    #[tokio::test]
    async fn cancelled_upgrade_restores_upgradeable_read() {
        let lock = LockCore::new();
        let mut upgradeable = lock.enter_upgradeable_read_async(None).await.unwrap();
        let reader = lock.enter_read_async(None).await.unwrap();
        let token = CancellationToken::new();

        {
            let mut upgrade = upgradeable.upgrade_async(Some(&token));
            assert!(futures::poll!(&mut upgrade).is_pending());
            token.cancel();
            assert_eq!(upgrade.await.unwrap_err(), Error::Cancelled);
        }
        let status = lock.status();
        assert!(status.upgradeable && !status.upgrade_pending && !status.writer);
        assert_eq!(status.readers, 2);

        // New readers are welcome again.
        assert!(lock.try_enter_read().unwrap().is_some());
        drop((reader, upgradeable));
    }

    #[tokio::test]
    async fn dispose_fails_waiters_and_new_requests() {
        let lock = LockCore::new();
        let write = lock.enter_write_async(None).await.unwrap();
        let mut waiting = Box::pin(lock.enter_read_async(None));
        assert!(futures::poll!(&mut waiting).is_pending());

        lock.dispose();
        lock.dispose();
        assert_eq!(waiting.await.unwrap_err(), Error::Disposed);
        assert_eq!(lock.enter_write_async(None).await.unwrap_err(), Error::Disposed);
        assert_eq!(lock.try_enter_read().unwrap_err(), Error::Disposed);

        write.release();
        assert!(lock.is_disposed());
        assert_eq!(lock.status().readers, 0);
    }

    #[tokio::test]
    async fn dispose_async_waits_for_outstanding_guards() {
        let lock = LockCore::new();
        let read = lock.enter_read_async(None).await.unwrap();
        let released = Arc::new(AtomicUsize::new(0));

        let releaser = {
            let released = released.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                released.store(1, Ordering::SeqCst);
                read.release_async().await;
            })
        };
        lock.dispose_async().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
        releaser.await.unwrap();
    }

    #[test]
    fn blocking_writer_is_woken_by_other_thread() {
        let lock = LockCore::new();
        let read = lock.enter_read().unwrap();
        let contender = {
            let lock = lock.clone();
            std::thread::spawn(move || {
                let guard = lock.enter_write().unwrap();
                assert!(lock.status().writer);
                drop(guard);
            })
        };
        while lock.status().waiting == 0 {
            std::thread::yield_now();
        }
        drop(read);
        contender.join().unwrap();
        assert!(lock.status().is_free());
    }

    #[test]
    fn nested_blocking_acquisition_fails() {
        let lock = LockCore::named("nested");
        let write = lock.enter_write().unwrap();
        let nested = Err(Error::InvalidState("nested acquisition would deadlock"));
        assert_eq!(lock.enter_write().map(drop), nested);
        assert_eq!(lock.enter_read().map(drop), nested);
        assert_eq!(lock.status().waiting, 0);
        drop(write);

        // A second read is granted next to the first, so it is not nested.
        let read = lock.enter_read().unwrap();
        let again = lock.enter_read().unwrap();
        assert_eq!(lock.enter_write().map(drop), nested);
        drop((read, again));
        assert!(lock.status().is_free());
        drop(lock.enter_write().unwrap());
    }

    #[test]
    fn upgrade_over_own_reader_fails() {
        let lock = LockCore::new();
        let mut upgradeable = lock.enter_upgradeable_read().unwrap();
        let read = lock.enter_read().unwrap();
        assert_eq!(
            upgradeable.upgrade().map(drop),
            Err(Error::InvalidState("nested acquisition would deadlock"))
        );
        let status = lock.status();
        assert!(status.upgradeable && !status.upgrade_pending && !status.writer);

        drop(read);
        drop(upgradeable.upgrade().unwrap());
        drop(upgradeable);
        assert!(lock.status().is_free());
    }

    #[test]
    fn guard_released_on_other_thread_clears_ownership() {
        let lock = LockCore::new();
        let write = lock.enter_write().unwrap();
        std::thread::spawn(move || drop(write)).join().unwrap();

        let read = lock.enter_read().unwrap();
        let writer = {
            let lock = lock.clone();
            std::thread::spawn(move || drop(lock.enter_write().unwrap()))
        };
        while lock.status().waiting == 0 {
            std::thread::yield_now();
        }
        drop(read);
        writer.join().unwrap();
        assert!(lock.status().is_free());
    }

    #[test]
    fn priority_read_jumps_queue() {
        let lock = LockCore::new();
        let read = lock.enter_read().unwrap();
        let writer = {
            let lock = lock.clone();
            std::thread::spawn(move || drop(lock.enter_write().unwrap()))
        };
        while lock.status().waiting == 0 {
            std::thread::yield_now();
        }
        // A plain read would queue behind the writer, a priority read does not.
        assert!(lock.try_enter_read().unwrap().is_none());
        let pinned = lock.enter_priority_read().unwrap();
        assert_eq!(lock.status().readers, 2);
        drop((pinned, read));
        writer.join().unwrap();
    }
}
