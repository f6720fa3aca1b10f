//! Change notifications for [`LockingList`](crate::LockingList).

use async_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::trace;

/// What a mutation did to a list. Indices refer to the list after the change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListChange {
    /// Too much changed to describe item by item; re-read the whole list.
    Reset,
    ItemAdded { index: usize },
    ItemDeleted { index: usize },
    ItemChanged { index: usize },
    ItemMoved { old_index: usize, new_index: usize },
}

/// Fan-out of list changes to any number of receivers.
///
/// Publishing never blocks: channels are unbounded, and receivers that have
/// been dropped are pruned on the next publish.
#[derive(Default)]
pub(crate) struct Subscribers {
    senders: Mutex<Senders>,
}

#[derive(Default)]
struct Senders {
    open: Vec<Sender<ListChange>>,
    closed: bool,
}

impl Subscribers {
    /// New receiver, or `None` once the fan-out has been closed.
    pub(crate) fn subscribe(&self) -> Option<Receiver<ListChange>> {
        let mut senders = self.senders.lock();
        if senders.closed {
            return None;
        }
        let (tx, rx) = async_channel::unbounded();
        senders.open.push(tx);
        Some(rx)
    }

    pub(crate) fn count(&self) -> usize {
        self.senders.lock().open.iter().filter(|tx| !tx.is_closed()).count()
    }

    /// Delivers `changes` in order. Must be called after the list lock has
    /// been released.
    pub(crate) fn publish(&self, changes: &[ListChange]) {
        if changes.is_empty() {
            return;
        }
        let mut senders = self.senders.lock();
        senders.open.retain(|tx| !tx.is_closed());
        for tx in senders.open.iter() {
            for change in changes {
                // Only fails when the receiver went away in the meantime.
                let _ = tx.try_send(*change);
            }
        }
        trace!(changes = changes.len(), subscribers = senders.open.len(), "published list changes");
    }

    /// Closes every channel, ending the receivers' streams.
    pub(crate) fn close(&self) {
        let mut senders = self.senders.lock();
        senders.closed = true;
        for tx in senders.open.drain(..) {
            tx.close();
        }
    }
}
