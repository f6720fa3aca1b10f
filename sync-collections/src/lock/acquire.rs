//! Futures that wait for a grant, and the thread-parking driver behind the
//! blocking API.

use std::cell::Cell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, Thread, ThreadId};

use futures::task::ArcWake;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{trace, warn};

use super::guard::{LockScope, RawGuard, UpgradeableReadGuard, UpgradedWriteGuard};
use super::state::State;
use super::{Inner, LockMode};
use crate::error::{Error, Result};

pub(crate) fn wake_all(wakers: Vec<Waker>) {
    for waker in wakers {
        waker.wake();
    }
}

struct ThreadWaker(Thread);

impl ArcWake for ThreadWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.0.unpark();
    }
}

thread_local! {
    static DRIVING: Cell<usize> = const { Cell::new(0) };
}

struct Driving;

impl Driving {
    fn enter() -> Self {
        DRIVING.with(|depth| depth.set(depth.get() + 1));
        Driving
    }
}

impl Drop for Driving {
    fn drop(&mut self) {
        DRIVING.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// The current thread, when it is parked in [`block_on`] between polls.
/// Guards granted there stay with this thread until they are released.
fn blocking_thread() -> Option<ThreadId> {
    DRIVING
        .with(|depth| depth.get() > 0)
        .then(|| thread::current().id())
}

fn nested_error(inner: &Inner, mode: LockMode) -> Error {
    warn!(lock = %inner.name, ?mode, "nested acquisition would deadlock");
    Error::InvalidState("nested acquisition would deadlock")
}

/// Polls `future` on the current thread, parking between polls.
///
/// Unlike an executor this may be nested: a callback running inside one
/// blocking call can make another blocking call.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    let _driving = Driving::enter();
    let mut future = std::pin::pin!(future);
    let waker = futures::task::waker(Arc::new(ThreadWaker(thread::current())));
    let mut cx = Context::from_waker(&waker);
    loop {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }
        thread::park();
    }
}

/// Lazily created `cancelled()` future of an optional token.
struct Cancellation {
    token: Option<CancellationToken>,
    cancelled: Option<Pin<Box<WaitForCancellationFutureOwned>>>,
}

impl Cancellation {
    fn new(token: Option<&CancellationToken>) -> Self {
        Self {
            token: token.cloned(),
            cancelled: None,
        }
    }

    fn is_cancelled(&self) -> bool {
        self.token.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Registers the task for cancellation wakeups and reports whether the
    /// token has fired.
    fn poll(&mut self, cx: &mut Context<'_>) -> bool {
        let Some(token) = &self.token else {
            return false;
        };
        let cancelled = self
            .cancelled
            .get_or_insert_with(|| Box::pin(token.clone().cancelled_owned()));
        cancelled.as_mut().poll(cx).is_ready()
    }
}

/// A pending acquisition. Dropping it before completion withdraws the
/// request, or releases the lock if it was granted in the meantime.
pub(crate) struct Acquire {
    inner: Arc<Inner>,
    mode: LockMode,
    cancellation: Cancellation,
    waiter: Option<u64>,
    finished: bool,
}

impl Acquire {
    pub(crate) fn new(inner: Arc<Inner>, mode: LockMode, token: Option<&CancellationToken>) -> Self {
        Self {
            inner,
            mode,
            cancellation: Cancellation::new(token),
            waiter: None,
            finished: false,
        }
    }

    /// Grants `mode` only if no waiting is needed.
    pub(crate) fn attempt(inner: &Arc<Inner>, mode: LockMode) -> Result<Option<RawGuard>> {
        let mut wakers = Vec::new();
        let outcome = {
            let mut state = inner.state.lock();
            if state.disposed {
                Err(Error::Disposed)
            } else {
                let id = state.enqueue(mode, None);
                state.dispatch(&mut wakers);
                if state.take_grant(id) {
                    trace!(lock = %inner.name, ?mode, "lock granted");
                    Ok(Some(RawGuard::new(inner.clone(), mode, id)))
                } else {
                    state.withdraw(mode, id, &mut wakers);
                    Ok(None)
                }
            }
        };
        wake_all(wakers);
        outcome
    }

    fn granted(&self, state: &mut State, id: u64, owner: Option<ThreadId>) -> RawGuard {
        if let Some(thread) = owner {
            state.claim(id, thread);
        }
        trace!(lock = %self.inner.name, mode = ?self.mode, "lock granted");
        RawGuard::new(self.inner.clone(), self.mode, id)
    }

    /// This thread already holds the lock, so waiting would never end.
    fn is_nested(&self, state: &State, owner: Option<ThreadId>) -> bool {
        self.inner.detect_reentrancy
            && (LockScope::is_held(&self.inner)
                || owner.is_some_and(|thread| state.held_by(thread, None)))
    }

    fn step(&mut self, cx: &mut Context<'_>, wakers: &mut Vec<Waker>) -> Poll<Result<RawGuard>> {
        let owner = blocking_thread();
        let id = {
            let mut state = self.inner.state.lock();
            match self.waiter {
                Some(id) => {
                    if state.take_grant(id) {
                        return Poll::Ready(Ok(self.granted(&mut state, id, owner)));
                    }
                    if state.disposed {
                        state.withdraw(self.mode, id, wakers);
                        return Poll::Ready(Err(Error::Disposed));
                    }
                    state.refresh_waker(self.mode, id, cx.waker());
                    id
                }
                None => {
                    if state.disposed {
                        return Poll::Ready(Err(Error::Disposed));
                    }
                    if self.cancellation.is_cancelled() {
                        return Poll::Ready(Err(Error::Cancelled));
                    }
                    let id = state.enqueue(self.mode, Some(cx.waker().clone()));
                    self.waiter = Some(id);
                    state.dispatch(wakers);
                    if state.take_grant(id) {
                        return Poll::Ready(Ok(self.granted(&mut state, id, owner)));
                    }
                    if self.is_nested(&state, owner) {
                        state.withdraw(self.mode, id, wakers);
                        return Poll::Ready(Err(nested_error(&self.inner, self.mode)));
                    }
                    trace!(lock = %self.inner.name, mode = ?self.mode, "lock request queued");
                    id
                }
            }
        };

        if self.cancellation.poll(cx) {
            let mut state = self.inner.state.lock();
            // A grant that raced the cancellation wins.
            if state.take_grant(id) {
                return Poll::Ready(Ok(self.granted(&mut state, id, owner)));
            }
            state.withdraw(self.mode, id, wakers);
            trace!(lock = %self.inner.name, mode = ?self.mode, "lock request cancelled");
            return Poll::Ready(Err(Error::Cancelled));
        }
        Poll::Pending
    }
}

impl Future for Acquire {
    type Output = Result<RawGuard>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut wakers = Vec::new();
        let poll = self.step(cx, &mut wakers);
        if poll.is_ready() {
            self.finished = true;
        }
        wake_all(wakers);
        poll
    }
}

impl Drop for Acquire {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(id) = self.waiter {
            let mut wakers = Vec::new();
            self.inner.state.lock().withdraw(self.mode, id, &mut wakers);
            wake_all(wakers);
        }
    }
}

/// Future returned by [`UpgradeableReadGuard::upgrade_async`].
///
/// While it waits, new readers are kept out and queued writers cannot
/// overtake it. Dropping it before completion withdraws the upgrade.
#[must_use = "futures do nothing unless polled"]
pub struct Upgrade<'g> {
    inner: Arc<Inner>,
    id: u64,
    guard: Option<&'g mut UpgradeableReadGuard>,
    cancellation: Cancellation,
    started: bool,
    finished: bool,
}

impl<'g> Upgrade<'g> {
    pub(crate) fn new(
        inner: Arc<Inner>,
        id: u64,
        guard: &'g mut UpgradeableReadGuard,
        token: Option<&CancellationToken>,
    ) -> Self {
        Self {
            inner,
            id,
            guard: Some(guard),
            cancellation: Cancellation::new(token),
            started: false,
            finished: false,
        }
    }

    fn complete(&mut self) -> Poll<Result<UpgradedWriteGuard<'g>>> {
        self.finished = true;
        trace!(lock = %self.inner.name, "lock upgraded");
        match self.guard.take() {
            Some(guard) => Poll::Ready(Ok(UpgradedWriteGuard::new(guard))),
            None => Poll::Ready(Err(Error::InvalidState("upgrade polled after completion"))),
        }
    }

    fn step(
        &mut self,
        cx: &mut Context<'_>,
        wakers: &mut Vec<Waker>,
    ) -> Poll<Result<UpgradedWriteGuard<'g>>> {
        let upgraded = {
            let mut state = self.inner.state.lock();
            if !self.started {
                if state.disposed {
                    self.finished = true;
                    return Poll::Ready(Err(Error::Disposed));
                }
                if self.cancellation.is_cancelled() {
                    self.finished = true;
                    return Poll::Ready(Err(Error::Cancelled));
                }
                self.started = true;
                state.request_upgrade(self.id, cx.waker().clone(), wakers);
                // Readers held by this same thread would never drain.
                let nested = blocking_thread()
                    .is_some_and(|thread| state.held_by(thread, Some(self.id)));
                if !state.upgraded && self.inner.detect_reentrancy && nested {
                    state.cancel_upgrade(wakers);
                    self.finished = true;
                    return Poll::Ready(Err(nested_error(&self.inner, LockMode::Write)));
                }
            }
            if state.upgraded {
                true
            } else if state.disposed {
                state.cancel_upgrade(wakers);
                self.finished = true;
                return Poll::Ready(Err(Error::Disposed));
            } else {
                state.refresh_upgrade_waker(cx.waker());
                false
            }
        };
        if upgraded {
            return self.complete();
        }

        if self.cancellation.poll(cx) {
            let upgraded = {
                let mut state = self.inner.state.lock();
                if !state.upgraded {
                    state.cancel_upgrade(wakers);
                }
                state.upgraded
            };
            if upgraded {
                return self.complete();
            }
            self.finished = true;
            return Poll::Ready(Err(Error::Cancelled));
        }
        Poll::Pending
    }
}

impl<'g> Future for Upgrade<'g> {
    type Output = Result<UpgradedWriteGuard<'g>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut wakers = Vec::new();
        let poll = self.step(cx, &mut wakers);
        wake_all(wakers);
        poll
    }
}

impl Drop for Upgrade<'_> {
    fn drop(&mut self) {
        if !self.started || self.finished {
            return;
        }
        let mut wakers = Vec::new();
        {
            let mut state = self.inner.state.lock();
            if state.upgraded {
                state.downgrade(&mut wakers);
            } else {
                state.cancel_upgrade(&mut wakers);
            }
        }
        wake_all(wakers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LockCore;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[test]
    fn block_on_resumes_after_wake_from_other_thread() {
        let flag = Arc::new(AtomicBool::new(false));
        let setter = {
            let flag = flag.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                flag.store(true, Ordering::SeqCst);
            })
        };
        let lock = LockCore::new();
        let write = lock.enter_write().unwrap();
        let handle = {
            let lock = lock.clone();
            let flag = flag.clone();
            thread::spawn(move || {
                let _read = lock.enter_read().unwrap();
                assert!(flag.load(Ordering::SeqCst));
            })
        };
        setter.join().unwrap();
        drop(write);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn dropped_acquire_withdraws_request() {
        let lock = LockCore::new();
        let read = lock.enter_read_async(None).await.unwrap();
        {
            let mut write = Box::pin(lock.enter_write_async(None));
            assert!(futures::poll!(&mut write).is_pending());
            assert_eq!(lock.status().waiting, 1);
        }
        assert_eq!(lock.status().waiting, 0);
        // The withdrawn writer no longer holds back readers.
        assert!(lock.try_enter_read().unwrap().is_some());
        drop(read);
    }

    #[tokio::test]
    async fn dropped_upgrade_after_grant_downgrades() {
        let lock = LockCore::new();
        let mut upgradeable = lock.enter_upgradeable_read_async(None).await.unwrap();
        let reader = lock.enter_read_async(None).await.unwrap();
        {
            let mut upgrade = upgradeable.upgrade_async(None);
            assert!(futures::poll!(&mut upgrade).is_pending());
            drop(reader);
            // Granted by the release above but never observed.
            assert!(lock.status().writer);
        }
        let status = lock.status();
        assert!(!status.writer && status.upgradeable && !status.upgrade_pending);
        assert_eq!(status.readers, 1);
        drop(upgradeable);
    }
}
