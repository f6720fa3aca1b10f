//! The lock's bookkeeping: counters, waiter queues and the grant policy.
//!
//! Everything here runs under the lock's internal mutex. Functions that may
//! grant a request push the waker of the granted waiter into `wakers`; the
//! caller wakes them after the mutex is released.

use std::collections::VecDeque;
use std::task::Waker;
use std::thread::ThreadId;

use super::LockMode;

#[derive(Debug)]
pub(crate) struct Waiter {
    pub(crate) id: u64,
    pub(crate) waker: Option<Waker>,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    /// Plain, priority and upgradeable readers currently holding the lock.
    pub(crate) readers: usize,
    pub(crate) writer: bool,
    /// Waiter id of the upgradeable holder. Kept while it is upgraded.
    pub(crate) upgradeable: Option<u64>,
    /// Upgrade request of the upgradeable holder, waiting for readers to drain.
    pub(crate) upgrade: Option<Waiter>,
    /// The upgradeable holder currently owns the write lock.
    pub(crate) upgraded: bool,
    pub(crate) disposed: bool,
    next_id: u64,
    /// Requests granted by `dispatch` that their future has not observed yet.
    granted: Vec<u64>,
    priority_reads: VecDeque<Waiter>,
    reads: VecDeque<Waiter>,
    upgradeables: VecDeque<Waiter>,
    writes: VecDeque<Waiter>,
    drain: Vec<Waker>,
    /// Guards taken by blocking calls, with the thread that took them.
    owners: Vec<(u64, ThreadId)>,
}

impl State {
    fn queue(&mut self, mode: LockMode) -> &mut VecDeque<Waiter> {
        match mode {
            LockMode::Read => &mut self.reads,
            LockMode::PriorityRead => &mut self.priority_reads,
            LockMode::UpgradeableRead => &mut self.upgradeables,
            LockMode::Write => &mut self.writes,
        }
    }

    pub(crate) fn waiting(&self) -> usize {
        self.priority_reads.len()
            + self.reads.len()
            + self.upgradeables.len()
            + self.writes.len()
            + usize::from(self.upgrade.is_some())
    }

    /// No guard of any mode is outstanding.
    pub(crate) fn is_idle(&self) -> bool {
        self.readers == 0 && !self.writer && self.upgradeable.is_none()
    }

    /// Appends a request to the queue of its mode and returns its id. The
    /// caller must `dispatch` afterwards.
    pub(crate) fn enqueue(&mut self, mode: LockMode, waker: Option<Waker>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queue(mode).push_back(Waiter { id, waker });
        id
    }

    /// Consumes the grant of request `id`, if it was granted.
    pub(crate) fn take_grant(&mut self, id: u64) -> bool {
        match self.granted.iter().position(|g| *g == id) {
            Some(pos) => {
                self.granted.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Records that the guard of request `id` is held by `thread`.
    pub(crate) fn claim(&mut self, id: u64, thread: ThreadId) {
        self.owners.push((id, thread));
    }

    pub(crate) fn disown(&mut self, id: u64) {
        if let Some(pos) = self.owners.iter().position(|(owned, _)| *owned == id) {
            self.owners.swap_remove(pos);
        }
    }

    /// True when `thread` holds a guard of this lock other than `except`.
    pub(crate) fn held_by(&self, thread: ThreadId, except: Option<u64>) -> bool {
        self.owners
            .iter()
            .any(|(id, owner)| *owner == thread && Some(*id) != except)
    }

    pub(crate) fn refresh_waker(&mut self, mode: LockMode, id: u64, waker: &Waker) {
        if let Some(waiter) = self.queue(mode).iter_mut().find(|w| w.id == id) {
            match &mut waiter.waker {
                Some(existing) if existing.will_wake(waker) => {}
                slot => *slot = Some(waker.clone()),
            }
        }
    }

    /// Takes back request `id`. A queued request is removed; a request that
    /// was granted but never observed is released.
    pub(crate) fn withdraw(&mut self, mode: LockMode, id: u64, wakers: &mut Vec<Waker>) {
        let queue = self.queue(mode);
        if let Some(pos) = queue.iter().position(|w| w.id == id) {
            queue.remove(pos);
            self.dispatch(wakers);
        } else if self.take_grant(id) {
            self.release(mode, wakers);
        }
    }

    pub(crate) fn release(&mut self, mode: LockMode, wakers: &mut Vec<Waker>) {
        match mode {
            LockMode::Read | LockMode::PriorityRead => {
                debug_assert!(self.readers > 0, "read released without readers");
                self.readers = self.readers.saturating_sub(1);
            }
            LockMode::UpgradeableRead => {
                debug_assert!(!self.upgraded, "upgradeable released while upgraded");
                self.readers = self.readers.saturating_sub(1);
                self.upgradeable = None;
            }
            LockMode::Write => {
                debug_assert!(self.writer && !self.upgraded, "write released without writer");
                self.writer = false;
            }
        }
        self.after_release(wakers);
    }

    /// Ends an upgrade: the holder goes back to upgradeable read.
    pub(crate) fn downgrade(&mut self, wakers: &mut Vec<Waker>) {
        debug_assert!(self.upgraded && self.writer);
        self.writer = false;
        self.upgraded = false;
        self.readers += 1;
        self.after_release(wakers);
    }

    fn after_release(&mut self, wakers: &mut Vec<Waker>) {
        if self.is_idle() {
            wakers.append(&mut self.drain);
        }
        self.dispatch(wakers);
    }

    /// Registers the pending upgrade of the upgradeable holder.
    pub(crate) fn request_upgrade(&mut self, id: u64, waker: Waker, wakers: &mut Vec<Waker>) {
        debug_assert_eq!(self.upgradeable, Some(id), "upgrade by a non-holder");
        self.upgrade = Some(Waiter {
            id,
            waker: Some(waker),
        });
        self.dispatch(wakers);
    }

    pub(crate) fn refresh_upgrade_waker(&mut self, waker: &Waker) {
        if let Some(upgrade) = self.upgrade.as_mut() {
            upgrade.waker = Some(waker.clone());
        }
    }

    pub(crate) fn cancel_upgrade(&mut self, wakers: &mut Vec<Waker>) {
        if self.upgrade.take().is_some() {
            self.dispatch(wakers);
        }
    }

    /// Marks the state disposed and wakes every queued request so it can fail.
    /// Returns false when already disposed.
    pub(crate) fn dispose(&mut self, wakers: &mut Vec<Waker>) -> bool {
        if self.disposed {
            return false;
        }
        self.disposed = true;
        for mode in [
            LockMode::PriorityRead,
            LockMode::Read,
            LockMode::UpgradeableRead,
            LockMode::Write,
        ] {
            wakers.extend(self.queue(mode).drain(..).filter_map(|w| w.waker));
        }
        if let Some(upgrade) = self.upgrade.as_mut() {
            wakers.extend(upgrade.waker.take());
        }
        if self.is_idle() {
            wakers.append(&mut self.drain);
        }
        true
    }

    pub(crate) fn register_drain(&mut self, waker: &Waker) {
        if !self.drain.iter().any(|w| w.will_wake(waker)) {
            self.drain.push(waker.clone());
        }
    }

    /// Grants whatever the policy allows right now.
    pub(crate) fn dispatch(&mut self, wakers: &mut Vec<Waker>) {
        if self.writer || self.disposed {
            return;
        }

        // A pending upgrade blocks everything else until the holder is the
        // last reader.
        if let Some(upgrade) = self.upgrade.as_mut() {
            if self.readers == 1 {
                self.readers = 0;
                self.writer = true;
                self.upgraded = true;
                wakers.extend(upgrade.waker.take());
                self.upgrade = None;
            }
            return;
        }

        // Fairness exception: priority readers overtake every queued request.
        while let Some(waiter) = self.priority_reads.pop_front() {
            self.grant(LockMode::PriorityRead, waiter, wakers);
        }

        let first_write = self.writes.front().map(|w| w.id);
        if self.upgradeable.is_none() {
            let upgradeable_turn = match (self.upgradeables.front(), first_write) {
                (Some(u), Some(w)) => u.id < w,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if upgradeable_turn {
                if let Some(waiter) = self.upgradeables.pop_front() {
                    self.grant(LockMode::UpgradeableRead, waiter, wakers);
                }
            }
        }

        if first_write.is_some() {
            // Queued readers stay behind the queued writer.
            if self.readers == 0 && self.upgradeable.is_none() {
                if let Some(waiter) = self.writes.pop_front() {
                    self.grant(LockMode::Write, waiter, wakers);
                }
            }
            return;
        }

        while let Some(waiter) = self.reads.pop_front() {
            self.grant(LockMode::Read, waiter, wakers);
        }
    }

    fn grant(&mut self, mode: LockMode, waiter: Waiter, wakers: &mut Vec<Waker>) {
        match mode {
            LockMode::Read | LockMode::PriorityRead => self.readers += 1,
            LockMode::UpgradeableRead => {
                self.readers += 1;
                self.upgradeable = Some(waiter.id);
            }
            LockMode::Write => self.writer = true,
        }
        debug_assert!(!self.writer || (self.readers == 0 && self.upgradeable.is_none()));
        self.granted.push(waiter.id);
        wakers.extend(waiter.waker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(state: &mut State, mode: LockMode) -> (u64, bool) {
        let mut wakers = Vec::new();
        let id = state.enqueue(mode, None);
        state.dispatch(&mut wakers);
        (id, state.take_grant(id))
    }

    #[test]
    fn readers_share_the_lock() {
        let mut state = State::default();
        for _ in 0..4 {
            assert!(request(&mut state, LockMode::Read).1);
        }
        assert_eq!(state.readers, 4);
        assert!(!request(&mut state, LockMode::Write).1);
    }

    #[test]
    fn queued_writer_blocks_new_readers() {
        let mut state = State::default();
        let mut wakers = Vec::new();
        assert!(request(&mut state, LockMode::Read).1);
        let (writer, granted) = request(&mut state, LockMode::Write);
        assert!(!granted);
        let (reader, granted) = request(&mut state, LockMode::Read);
        assert!(!granted);

        state.release(LockMode::Read, &mut wakers);
        assert!(state.take_grant(writer));
        assert!(!state.take_grant(reader));

        state.release(LockMode::Write, &mut wakers);
        assert!(state.take_grant(reader));
        assert_eq!(state.readers, 1);
    }

    #[test]
    fn priority_read_overtakes_queued_writer() {
        let mut state = State::default();
        assert!(request(&mut state, LockMode::Read).1);
        assert!(!request(&mut state, LockMode::Write).1);
        assert!(!request(&mut state, LockMode::Read).1);
        assert!(request(&mut state, LockMode::PriorityRead).1);
        assert_eq!(state.readers, 2);
    }

    #[test]
    fn priority_read_waits_for_active_writer() {
        let mut state = State::default();
        let mut wakers = Vec::new();
        assert!(request(&mut state, LockMode::Write).1);
        let (id, granted) = request(&mut state, LockMode::PriorityRead);
        assert!(!granted);
        state.release(LockMode::Write, &mut wakers);
        assert!(state.take_grant(id));
    }

    #[test]
    fn single_upgradeable_holder_coexists_with_readers() {
        let mut state = State::default();
        let mut wakers = Vec::new();
        let (first, granted) = request(&mut state, LockMode::UpgradeableRead);
        assert!(granted);
        assert!(request(&mut state, LockMode::Read).1);
        let (second, granted) = request(&mut state, LockMode::UpgradeableRead);
        assert!(!granted);
        assert_eq!(state.upgradeable, Some(first));

        state.release(LockMode::UpgradeableRead, &mut wakers);
        assert!(state.take_grant(second));
        assert_eq!(state.upgradeable, Some(second));
    }

    #[test]
    fn upgrade_drains_readers_and_beats_queued_writer() {
        let mut state = State::default();
        let mut wakers = Vec::new();
        let (holder, _) = request(&mut state, LockMode::UpgradeableRead);
        assert!(request(&mut state, LockMode::Read).1);
        let (writer, granted) = request(&mut state, LockMode::Write);
        assert!(!granted);

        state.request_upgrade(holder, futures::task::noop_waker(), &mut wakers);
        assert!(!state.upgraded);
        // New readers cannot join while the upgrade waits.
        assert!(!request(&mut state, LockMode::Read).1);
        assert!(!request(&mut state, LockMode::PriorityRead).1);

        state.release(LockMode::Read, &mut wakers);
        assert!(state.upgraded && state.writer);
        assert_eq!(state.readers, 0);
        assert!(!state.take_grant(writer));

        state.downgrade(&mut wakers);
        // Holder plus the priority reader; the plain reader stays behind the writer.
        assert_eq!(state.readers, 2);
        assert!(!state.take_grant(writer));

        state.release(LockMode::UpgradeableRead, &mut wakers);
        state.release(LockMode::PriorityRead, &mut wakers);
        assert!(state.take_grant(writer));
        assert_eq!(state.waiting(), 1);
    }

    #[test]
    fn withdrawn_writer_unblocks_readers() {
        let mut state = State::default();
        let mut wakers = Vec::new();
        assert!(request(&mut state, LockMode::Read).1);
        let (writer, _) = request(&mut state, LockMode::Write);
        let (reader, granted) = request(&mut state, LockMode::Read);
        assert!(!granted);

        state.withdraw(LockMode::Write, writer, &mut wakers);
        assert!(state.take_grant(reader));
        assert_eq!(state.readers, 2);
        assert_eq!(state.waiting(), 0);
    }

    #[test]
    fn withdrawing_an_unobserved_grant_releases_it() {
        let mut state = State::default();
        let mut wakers = Vec::new();
        let id = state.enqueue(LockMode::Write, None);
        state.dispatch(&mut wakers);
        assert!(state.writer);
        state.withdraw(LockMode::Write, id, &mut wakers);
        assert!(state.is_idle());
    }

    #[test]
    fn upgradeable_and_writer_served_in_arrival_order() {
        let mut state = State::default();
        let mut wakers = Vec::new();
        assert!(request(&mut state, LockMode::Write).1);
        let (writer, _) = request(&mut state, LockMode::Write);
        let (upgradeable, _) = request(&mut state, LockMode::UpgradeableRead);

        state.release(LockMode::Write, &mut wakers);
        assert!(state.take_grant(writer));
        assert!(!state.take_grant(upgradeable));

        state.release(LockMode::Write, &mut wakers);
        assert!(state.take_grant(upgradeable));
    }

    #[test]
    fn dispose_empties_queues() {
        let mut state = State::default();
        let mut wakers = Vec::new();
        assert!(request(&mut state, LockMode::Write).1);
        request(&mut state, LockMode::Read);
        request(&mut state, LockMode::Write);
        assert!(state.dispose(&mut wakers));
        assert!(!state.dispose(&mut wakers));
        assert_eq!(state.waiting(), 0);

        // Outstanding guards still release cleanly.
        state.release(LockMode::Write, &mut wakers);
        assert!(state.is_idle());
        assert!(!request(&mut state, LockMode::Read).1);
    }
}
