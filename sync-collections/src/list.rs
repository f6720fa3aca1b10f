//! Thread-safe list built on [`LockCore`], with change notifications and a
//! locked stable sort.

use std::cmp::Ordering;

use async_channel::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::CollectionConfig;
use crate::enumerator::LockingEnumerator;
use crate::error::{Error, Result};
use crate::lock::{block_on, HasLock, LockCore, LockScope, ReadGuard, UpgradeableReadGuard};
use crate::notify::{ListChange, Subscribers};
use crate::scoped::Locked;

/// A `Vec` whose every operation runs under its own [`LockCore`].
///
/// Mutations report what they did through [`subscribe`](Self::subscribe).
/// Notifications are published after the mutating guard has been released, so
/// receivers can read the list without contending with the writer.
///
/// Disposing the list disposes its lock and closes the notification channels.
/// Elements are never disposed by the list.
pub struct LockingList<T> {
    items: Locked<Vec<T>>,
    changes: Subscribers,
    reset_ratio: f64,
}

fn out_of_range(index: usize, len: usize) -> Error {
    Error::IndexOutOfRange { index, len }
}

/// Stable permutation putting `items` in `compare` order: `order[i]` is the
/// current position of the item that belongs at `i`.
fn stable_order<T>(items: &[T], mut compare: impl FnMut(&T, &T) -> Ordering) -> Vec<usize> {
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by(|&a, &b| compare(&items[a], &items[b]));
    order
}

impl<T: Clone> LockingList<T> {
    pub fn new() -> Self {
        Self::from(Vec::new())
    }

    pub fn with_config(config: &CollectionConfig) -> Self {
        Self {
            items: Locked::with_lock(LockCore::with_config(config), Vec::new()),
            changes: Subscribers::default(),
            reset_ratio: config.sort_reset_ratio,
        }
    }

    /// The lock serializing access to this list.
    pub fn lock(&self) -> &LockCore {
        self.items.lock()
    }

    /// Receiver of every change made from now on. Dropping it unsubscribes.
    /// Fails with [`Error::Disposed`] once the list has been disposed.
    pub fn subscribe(&self) -> Result<Receiver<ListChange>> {
        self.changes.subscribe().ok_or(Error::Disposed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.changes.count()
    }

    pub fn get(&self, index: usize) -> Result<T> {
        block_on(self.get_async(index, None))
    }

    pub async fn get_async(&self, index: usize, token: Option<&CancellationToken>) -> Result<T> {
        let guard = self.lock().enter_read_async(token).await?;
        let items = self.items.view(&guard);
        items
            .get(index)
            .cloned()
            .ok_or_else(|| out_of_range(index, items.len()))
    }

    /// Appends `item` and returns its index.
    pub fn add(&self, item: T) -> Result<usize> {
        block_on(self.add_async(item, None))
    }

    pub async fn add_async(&self, item: T, token: Option<&CancellationToken>) -> Result<usize> {
        let index = {
            let guard = self.lock().enter_write_async(token).await?;
            let mut items = self.items.view_mut(&guard);
            items.push(item);
            items.len() - 1
        };
        self.changes.publish(&[ListChange::ItemAdded { index }]);
        Ok(index)
    }

    /// Inserts `item` at `index`, shifting later items. `index` may equal the
    /// length.
    pub fn insert(&self, index: usize, item: T) -> Result<()> {
        block_on(self.insert_async(index, item, None))
    }

    pub async fn insert_async(
        &self,
        index: usize,
        item: T,
        token: Option<&CancellationToken>,
    ) -> Result<()> {
        {
            let guard = self.lock().enter_write_async(token).await?;
            let mut items = self.items.view_mut(&guard);
            if index > items.len() {
                return Err(out_of_range(index, items.len()));
            }
            items.insert(index, item);
        }
        self.changes.publish(&[ListChange::ItemAdded { index }]);
        Ok(())
    }

    /// Removes and returns the item at `index`.
    pub fn remove_at(&self, index: usize) -> Result<T> {
        block_on(self.remove_at_async(index, None))
    }

    pub async fn remove_at_async(
        &self,
        index: usize,
        token: Option<&CancellationToken>,
    ) -> Result<T> {
        let removed = {
            let guard = self.lock().enter_write_async(token).await?;
            let mut items = self.items.view_mut(&guard);
            if index >= items.len() {
                return Err(out_of_range(index, items.len()));
            }
            items.remove(index)
        };
        self.changes.publish(&[ListChange::ItemDeleted { index }]);
        Ok(removed)
    }

    pub fn count(&self) -> Result<usize> {
        block_on(self.count_async(None))
    }

    pub async fn count_async(&self, token: Option<&CancellationToken>) -> Result<usize> {
        let guard = self.lock().enter_read_async(token).await?;
        let len = self.items.view(&guard).len();
        Ok(len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.count()? == 0)
    }

    /// Removes every item and publishes [`ListChange::Reset`].
    pub fn clear(&self) -> Result<()> {
        block_on(self.clear_async(None))
    }

    pub async fn clear_async(&self, token: Option<&CancellationToken>) -> Result<()> {
        {
            let guard = self.lock().enter_write_async(token).await?;
            self.items.view_mut(&guard).clear();
        }
        self.changes.publish(&[ListChange::Reset]);
        Ok(())
    }

    /// Moves the item at `old_index` so that it ends up at `new_index`.
    pub fn move_item(&self, old_index: usize, new_index: usize) -> Result<()> {
        block_on(self.move_item_async(old_index, new_index, None))
    }

    pub async fn move_item_async(
        &self,
        old_index: usize,
        new_index: usize,
        token: Option<&CancellationToken>,
    ) -> Result<()> {
        {
            let guard = self.lock().enter_write_async(token).await?;
            let mut items = self.items.view_mut(&guard);
            let len = items.len();
            for index in [old_index, new_index] {
                if index >= len {
                    return Err(out_of_range(index, len));
                }
            }
            if old_index == new_index {
                return Ok(());
            }
            let item = items.remove(old_index);
            items.insert(new_index, item);
        }
        self.changes.publish(&[ListChange::ItemMoved {
            old_index,
            new_index,
        }]);
        Ok(())
    }

    /// Copies every item into `dest` starting at `index`.
    pub fn copy_to(&self, dest: &mut [T], index: usize) -> Result<()> {
        block_on(self.copy_to_async(dest, index, None))
    }

    pub async fn copy_to_async(
        &self,
        dest: &mut [T],
        index: usize,
        token: Option<&CancellationToken>,
    ) -> Result<()> {
        let guard = self.lock().enter_read_async(token).await?;
        let items = self.items.view(&guard);
        let Some(slots) = dest.get_mut(index..).filter(|s| s.len() >= items.len()) else {
            return Err(out_of_range(index, dest.len()));
        };
        slots[..items.len()].clone_from_slice(&items);
        Ok(())
    }

    /// Snapshot of the items.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        block_on(self.to_vec_async(None))
    }

    pub async fn to_vec_async(&self, token: Option<&CancellationToken>) -> Result<Vec<T>> {
        let guard = self.lock().enter_read_async(token).await?;
        let items = self.items.view(&guard).clone();
        Ok(items)
    }

    /// Enumerates a snapshot of the items. The list stays read-locked until
    /// the enumerator is disposed or dropped.
    pub fn enumerate(&self) -> Result<LockingEnumerator<T>> {
        block_on(self.enumerate_async(None))
    }

    pub async fn enumerate_async(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<LockingEnumerator<T>> {
        let guard: ReadGuard = self.lock().enter_read_async(token).await?;
        let items = self.items.view(&guard).clone();
        Ok(LockingEnumerator::new(guard, items))
    }

    /// Calls `f` for every item while holding one read lock for the whole
    /// traversal.
    pub fn for_each_locked<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(usize, &T),
    {
        block_on(self.for_each_locked_async(f, None))
    }

    pub async fn for_each_locked_async<F>(
        &self,
        mut f: F,
        token: Option<&CancellationToken>,
    ) -> Result<()>
    where
        F: FnMut(usize, &T),
    {
        let guard = self.lock().enter_read_async(token).await?;
        self.items.with_view(&guard, |items| {
            for (index, item) in items.iter().enumerate() {
                f(index, item);
            }
        });
        Ok(())
    }

    /// Stable sort by `compare`.
    ///
    /// The comparison runs under the upgradeable read lock, so readers keep
    /// going while it runs; the write lock is only taken to apply the new
    /// order. When more than the configured share of positions moved a single
    /// [`ListChange::Reset`] is published, otherwise one
    /// [`ListChange::ItemChanged`] per moved position.
    pub fn sort_by<F>(&self, compare: F) -> Result<()>
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        block_on(self.sort_by_async(compare, None))
    }

    pub async fn sort_by_async<F>(&self, compare: F, token: Option<&CancellationToken>) -> Result<()>
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        let changes = {
            let mut guard = self.lock().enter_upgradeable_read_async(token).await?;
            let order = {
                let items = self.items.view(&guard);
                LockScope::run(&guard, || stable_order(&items, compare))
            };
            self.reorder(&mut guard, order, token).await?
        };
        self.changes.publish(&changes);
        Ok(())
    }

    /// Applies `order` under an upgrade of `guard` and describes the result.
    async fn reorder(
        &self,
        guard: &mut UpgradeableReadGuard,
        order: Vec<usize>,
        token: Option<&CancellationToken>,
    ) -> Result<Vec<ListChange>> {
        let moved: Vec<usize> = order
            .iter()
            .enumerate()
            .filter(|(to, from)| to != *from)
            .map(|(to, _)| to)
            .collect();
        if moved.is_empty() {
            return Ok(Vec::new());
        }

        let write = guard.upgrade_async(token).await?;
        {
            let mut items = self.items.view_mut(&write);
            let mut slots: Vec<Option<T>> = items.drain(..).map(Some).collect();
            items.extend(order.iter().filter_map(|&from| slots[from].take()));
        }
        drop(write);

        let len = order.len();
        debug!(lock = %self.lock().name(), len, moved = moved.len(), "list sorted");
        if moved.len() as f64 > self.reset_ratio * len as f64 {
            Ok(vec![ListChange::Reset])
        } else {
            Ok(moved
                .into_iter()
                .map(|index| ListChange::ItemChanged { index })
                .collect())
        }
    }

    /// Disposes the list's lock and closes every notification channel.
    pub fn dispose(&self) {
        self.lock().dispose();
        self.changes.close();
    }

    /// Like [`dispose`](Self::dispose), then waits for outstanding guards.
    pub async fn dispose_async(&self) {
        self.changes.close();
        self.lock().dispose_async().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().is_disposed()
    }
}

impl<T: Clone + PartialEq> LockingList<T> {
    /// Replaces the item at `index`. Nothing is written or published when the
    /// item is equal to the current one.
    pub fn set(&self, index: usize, item: T) -> Result<()> {
        block_on(self.set_async(index, item, None))
    }

    pub async fn set_async(
        &self,
        index: usize,
        item: T,
        token: Option<&CancellationToken>,
    ) -> Result<()> {
        {
            let mut guard = self.lock().enter_upgradeable_read_async(token).await?;
            let unchanged = {
                let items = self.items.view(&guard);
                match items.get(index) {
                    Some(current) => *current == item,
                    None => return Err(out_of_range(index, items.len())),
                }
            };
            if unchanged {
                return Ok(());
            }
            let write = guard.upgrade_async(token).await?;
            self.items.view_mut(&write)[index] = item;
        }
        self.changes.publish(&[ListChange::ItemChanged { index }]);
        Ok(())
    }

    /// Removes the first item equal to `item`. Returns whether one was found.
    pub fn remove(&self, item: &T) -> Result<bool> {
        block_on(self.remove_async(item, None))
    }

    pub async fn remove_async(&self, item: &T, token: Option<&CancellationToken>) -> Result<bool> {
        let index = {
            let mut guard = self.lock().enter_upgradeable_read_async(token).await?;
            let found = self.items.view(&guard).iter().position(|i| i == item);
            let Some(index) = found else {
                return Ok(false);
            };
            let write = guard.upgrade_async(token).await?;
            self.items.view_mut(&write).remove(index);
            index
        };
        self.changes.publish(&[ListChange::ItemDeleted { index }]);
        Ok(true)
    }

    pub fn index_of(&self, item: &T) -> Result<Option<usize>> {
        block_on(self.index_of_async(item, None))
    }

    pub async fn index_of_async(
        &self,
        item: &T,
        token: Option<&CancellationToken>,
    ) -> Result<Option<usize>> {
        let guard = self.lock().enter_read_async(token).await?;
        let index = self.items.view(&guard).iter().position(|i| i == item);
        Ok(index)
    }

    pub fn contains(&self, item: &T) -> Result<bool> {
        Ok(self.index_of(item)?.is_some())
    }
}

impl<T: Clone + HasLock> LockingList<T> {
    /// Like [`sort_by`](Self::sort_by), but also holds a priority read on
    /// every distinct element lock while the comparison runs, so elements
    /// cannot change under the comparator.
    ///
    /// Element locks are taken in a fixed order inside the list's upgradeable
    /// scope and released before the new order is written.
    pub fn sort_by_pinned<F>(&self, compare: F) -> Result<()>
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        block_on(self.sort_by_pinned_async(compare, None))
    }

    pub async fn sort_by_pinned_async<F>(
        &self,
        compare: F,
        token: Option<&CancellationToken>,
    ) -> Result<()>
    where
        F: FnMut(&T, &T) -> Ordering,
    {
        let changes = {
            let mut guard = self.lock().enter_upgradeable_read_async(token).await?;
            let mut locks: Vec<LockCore> = self
                .items
                .view(&guard)
                .iter()
                .filter_map(|item| item.lock_core().cloned())
                .collect();
            locks.sort_by_key(LockCore::key);
            locks.dedup_by_key(|lock| lock.key());

            let mut pins = Vec::with_capacity(locks.len());
            for lock in &locks {
                pins.push(lock.enter_priority_read_async(token).await?);
            }
            let order = {
                let items = self.items.view(&guard);
                LockScope::run(&guard, || stable_order(&items, compare))
            };
            drop(pins);
            self.reorder(&mut guard, order, token).await?
        };
        self.changes.publish(&changes);
        Ok(())
    }
}

impl<T: Clone> Default for LockingList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<Vec<T>> for LockingList<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            items: Locked::new(items),
            changes: Subscribers::default(),
            reset_ratio: CollectionConfig::default().sort_reset_ratio,
        }
    }
}

impl<T> FromIterator<T> for LockingList<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<Vec<_>>())
    }
}

impl<T> std::fmt::Debug for LockingList<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockingList")
            .field("lock", self.items.lock())
            .field("subscribers", &self.changes.count())
            .finish_non_exhaustive()
    }
}
