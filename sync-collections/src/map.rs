//! Thread-safe hash map built on [`LockCore`].

use std::collections::HashMap;
use std::hash::Hash;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::CollectionConfig;
use crate::enumerator::LockingEnumerator;
use crate::error::{Error, Result};
use crate::lock::{block_on, LockCore, LockScope};
use crate::scoped::Locked;

/// A `HashMap` whose every operation runs under its own [`LockCore`].
///
/// Lookups take a read lock. Single mutations check under a read lock first
/// and only take the write lock when there is something to change. Compound
/// operations document which lock they hold while the caller's closure runs.
///
/// Each operation has a blocking form and an `_async` form accepting an
/// optional [`CancellationToken`]. Values are returned as clones.
pub struct LockingMap<K, V> {
    items: Locked<HashMap<K, V>>,
}

impl<K, V> LockingMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::from(HashMap::new())
    }

    pub fn with_config(config: &CollectionConfig) -> Self {
        Self {
            items: Locked::with_lock(LockCore::with_config(config), HashMap::new()),
        }
    }

    /// The lock serializing access to this map.
    pub fn lock(&self) -> &LockCore {
        self.items.lock()
    }

    /// Value stored under `key`, if any.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        block_on(self.get_async(key, None))
    }

    pub async fn get_async(&self, key: &K, token: Option<&CancellationToken>) -> Result<Option<V>> {
        let guard = self.lock().enter_read_async(token).await?;
        let value = self.items.view(&guard).get(key).cloned();
        Ok(value)
    }

    /// Value stored under `key`, or [`Error::KeyNotFound`].
    pub fn value(&self, key: &K) -> Result<V> {
        block_on(self.value_async(key, None))
    }

    pub async fn value_async(&self, key: &K, token: Option<&CancellationToken>) -> Result<V> {
        self.get_async(key, token).await?.ok_or(Error::KeyNotFound)
    }

    /// Adds `value` unless `key` is already present. Returns whether it was
    /// added.
    pub fn try_add(&self, key: K, value: V) -> Result<bool> {
        block_on(self.try_add_async(key, value, None))
    }

    pub async fn try_add_async(
        &self,
        key: K,
        value: V,
        token: Option<&CancellationToken>,
    ) -> Result<bool> {
        if self.contains_key_async(&key, token).await? {
            return Ok(false);
        }
        let guard = self.lock().enter_write_async(token).await?;
        let mut items = self.items.view_mut(&guard);
        if items.contains_key(&key) {
            return Ok(false);
        }
        items.insert(key, value);
        Ok(true)
    }

    /// Removes `key`, returning the value it held.
    pub fn try_remove(&self, key: &K) -> Result<Option<V>> {
        block_on(self.try_remove_async(key, None))
    }

    pub async fn try_remove_async(
        &self,
        key: &K,
        token: Option<&CancellationToken>,
    ) -> Result<Option<V>> {
        if !self.contains_key_async(key, token).await? {
            return Ok(None);
        }
        let guard = self.lock().enter_write_async(token).await?;
        let removed = self.items.view_mut(&guard).remove(key);
        Ok(removed)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        block_on(self.contains_key_async(key, None))
    }

    pub async fn contains_key_async(
        &self,
        key: &K,
        token: Option<&CancellationToken>,
    ) -> Result<bool> {
        let guard = self.lock().enter_read_async(token).await?;
        let found = self.items.view(&guard).contains_key(key);
        Ok(found)
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

    /// Snapshot of the keys.
    pub fn keys(&self) -> Result<Vec<K>> {
        block_on(self.keys_async(None))
    }

    pub async fn keys_async(&self, token: Option<&CancellationToken>) -> Result<Vec<K>> {
        let guard = self.lock().enter_read_async(token).await?;
        let keys = self.items.view(&guard).keys().cloned().collect();
        Ok(keys)
    }

    /// Snapshot of the values.
    pub fn values(&self) -> Result<Vec<V>> {
        block_on(self.values_async(None))
    }

    pub async fn values_async(&self, token: Option<&CancellationToken>) -> Result<Vec<V>> {
        let guard = self.lock().enter_read_async(token).await?;
        let values = self.items.view(&guard).values().cloned().collect();
        Ok(values)
    }

    /// Returns the value under `key`, adding one built by `factory` if absent.
    ///
    /// The factory runs outside any lock, so concurrent callers missing the
    /// same key may each run it. Only the first value inserted is kept and
    /// every caller gets that value back.
    pub fn get_or_add<F>(&self, key: K, factory: F) -> Result<V>
    where
        F: FnOnce(&K) -> V,
    {
        block_on(self.get_or_add_async(key, factory, None))
    }

    pub async fn get_or_add_async<F>(
        &self,
        key: K,
        factory: F,
        token: Option<&CancellationToken>,
    ) -> Result<V>
    where
        F: FnOnce(&K) -> V,
    {
        if let Some(value) = self.get_async(&key, token).await? {
            return Ok(value);
        }
        let value = factory(&key);
        let guard = self.lock().enter_write_async(token).await?;
        let stored = self.items.view_mut(&guard).entry(key).or_insert(value).clone();
        Ok(stored)
    }

    /// Like [`get_or_add`](Self::get_or_add), but keeps the write lock while
    /// `factory` runs so it runs at most once per key. Meant for factories
    /// that are cheap: every reader waits on them.
    pub fn get_or_cheap_add<F>(&self, key: K, factory: F) -> Result<V>
    where
        F: FnOnce(&K) -> V,
    {
        block_on(self.get_or_cheap_add_async(key, factory, None))
    }

    pub async fn get_or_cheap_add_async<F>(
        &self,
        key: K,
        factory: F,
        token: Option<&CancellationToken>,
    ) -> Result<V>
    where
        F: FnOnce(&K) -> V,
    {
        if let Some(value) = self.get_async(&key, token).await? {
            return Ok(value);
        }
        let guard = self.lock().enter_write_async(token).await?;
        let existing = self.items.view(&guard).get(&key).cloned();
        if let Some(value) = existing {
            return Ok(value);
        }
        let value = LockScope::run(&guard, || factory(&key));
        self.items.view_mut(&guard).insert(key, value.clone());
        Ok(value)
    }

    /// Like [`get_or_add`](Self::get_or_add), but keeps the upgradeable read
    /// lock while `factory` runs. Readers are not held up, concurrent misses
    /// queue behind each other and the factory runs at most once per key.
    pub fn get_or_add_expensive<F>(&self, key: K, factory: F) -> Result<V>
    where
        F: FnOnce(&K) -> V,
    {
        block_on(self.get_or_add_expensive_async(key, factory, None))
    }

    pub async fn get_or_add_expensive_async<F>(
        &self,
        key: K,
        factory: F,
        token: Option<&CancellationToken>,
    ) -> Result<V>
    where
        F: FnOnce(&K) -> V,
    {
        let mut guard = self.lock().enter_upgradeable_read_async(token).await?;
        let existing = self.items.view(&guard).get(&key).cloned();
        if let Some(value) = existing {
            return Ok(value);
        }
        let value = LockScope::run(&guard, || factory(&key));
        let write = guard.upgrade_async(token).await?;
        self.items.view_mut(&write).insert(key, value.clone());
        Ok(value)
    }

    /// Stores `update(key, current)` when `key` is present, otherwise the value
    /// built by `add`. Returns the stored value.
    ///
    /// `update` runs under the upgradeable read lock. `add` runs outside any
    /// lock; if another caller inserts the key meanwhile, `update` is applied
    /// to that value instead.
    pub fn add_or_update<A, U>(&self, key: K, add: A, update: U) -> Result<V>
    where
        A: FnOnce(&K) -> V,
        U: FnOnce(&K, &V) -> V,
    {
        block_on(self.add_or_update_async(key, add, update, None))
    }

    pub async fn add_or_update_async<A, U>(
        &self,
        key: K,
        add: A,
        update: U,
        token: Option<&CancellationToken>,
    ) -> Result<V>
    where
        A: FnOnce(&K) -> V,
        U: FnOnce(&K, &V) -> V,
    {
        let mut guard = self.lock().enter_upgradeable_read_async(token).await?;
        let current = self.items.view(&guard).get(&key).cloned();
        if let Some(current) = current {
            let value = LockScope::run(&guard, || update(&key, &current));
            let write = guard.upgrade_async(token).await?;
            self.items.view_mut(&write).insert(key, value.clone());
            return Ok(value);
        }
        drop(guard);

        let added = add(&key);
        let mut guard = self.lock().enter_upgradeable_read_async(token).await?;
        let current = self.items.view(&guard).get(&key).cloned();
        let value = match current {
            Some(current) => LockScope::run(&guard, || update(&key, &current)),
            None => added,
        };
        let write = guard.upgrade_async(token).await?;
        self.items.view_mut(&write).insert(key, value.clone());
        Ok(value)
    }

    pub fn clear(&self) -> Result<()> {
        block_on(self.clear_async(None))
    }

    pub async fn clear_async(&self, token: Option<&CancellationToken>) -> Result<()> {
        let guard = self.lock().enter_write_async(token).await?;
        self.items.view_mut(&guard).clear();
        Ok(())
    }

    /// Copies every entry into `dest` starting at `index`.
    pub fn copy_to(&self, dest: &mut [(K, V)], index: usize) -> Result<()> {
        block_on(self.copy_to_async(dest, index, None))
    }

    pub async fn copy_to_async(
        &self,
        dest: &mut [(K, V)],
        index: usize,
        token: Option<&CancellationToken>,
    ) -> Result<()> {
        let guard = self.lock().enter_read_async(token).await?;
        let items = self.items.view(&guard);
        let Some(slots) = dest.get_mut(index..).filter(|s| s.len() >= items.len()) else {
            return Err(Error::IndexOutOfRange {
                index,
                len: dest.len(),
            });
        };
        for (slot, (k, v)) in slots.iter_mut().zip(items.iter()) {
            *slot = (k.clone(), v.clone());
        }
        Ok(())
    }

    /// Enumerates a snapshot of the entries. The map stays read-locked until
    /// the enumerator is disposed or dropped.
    pub fn enumerate(&self) -> Result<LockingEnumerator<(K, V)>> {
        block_on(self.enumerate_async(None))
    }

    pub async fn enumerate_async(
        &self,
        token: Option<&CancellationToken>,
    ) -> Result<LockingEnumerator<(K, V)>> {
        let guard = self.lock().enter_read_async(token).await?;
        let entries: Vec<_> = self
            .items
            .view(&guard)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        trace!(lock = %self.lock().name(), entries = entries.len(), "map enumeration started");
        Ok(LockingEnumerator::new(guard, entries))
    }

    /// Calls `f` for every entry while holding one read lock for the whole
    /// traversal.
    pub fn for_each_locked<F>(&self, f: F) -> Result<()>
    where
        F: FnMut(&K, &V),
    {
        block_on(self.for_each_locked_async(f, None))
    }

    pub async fn for_each_locked_async<F>(
        &self,
        mut f: F,
        token: Option<&CancellationToken>,
    ) -> Result<()>
    where
        F: FnMut(&K, &V),
    {
        let guard = self.lock().enter_read_async(token).await?;
        self.items.with_view(&guard, |items| {
            for (k, v) in items {
                f(k, v);
            }
        });
        Ok(())
    }

    /// Disposes the map's lock. Entries are left untouched.
    pub fn dispose(&self) {
        self.lock().dispose();
    }

    /// Disposes the map's lock and waits for outstanding guards.
    pub async fn dispose_async(&self) {
        self.lock().dispose_async().await;
    }

    pub fn is_disposed(&self) -> bool {
        self.lock().is_disposed()
    }
}

impl<K, V> LockingMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone + PartialEq,
{
    /// Stores `value` under `key`. Nothing is written when the stored value is
    /// already equal.
    pub fn set(&self, key: K, value: V) -> Result<()> {
        block_on(self.set_async(key, value, None))
    }

    pub async fn set_async(
        &self,
        key: K,
        value: V,
        token: Option<&CancellationToken>,
    ) -> Result<()> {
        let mut guard = self.lock().enter_upgradeable_read_async(token).await?;
        let unchanged = self.items.view(&guard).get(&key) == Some(&value);
        if unchanged {
            return Ok(());
        }
        let write = guard.upgrade_async(token).await?;
        self.items.view_mut(&write).insert(key, value);
        Ok(())
    }

    pub fn contains_value(&self, value: &V) -> Result<bool> {
        block_on(self.contains_value_async(value, None))
    }

    pub async fn contains_value_async(
        &self,
        value: &V,
        token: Option<&CancellationToken>,
    ) -> Result<bool> {
        let guard = self.lock().enter_read_async(token).await?;
        let found = self.items.view(&guard).values().any(|v| v == value);
        Ok(found)
    }
}

impl<K, V> Default for LockingMap<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> From<HashMap<K, V>> for LockingMap<K, V> {
    fn from(items: HashMap<K, V>) -> Self {
        Self {
            items: Locked::new(items),
        }
    }
}

impl<K, V> FromIterator<(K, V)> for LockingMap<K, V>
where
    K: Eq + Hash,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::from(iter.into_iter().collect::<HashMap<_, _>>())
    }
}

impl<K, V> std::fmt::Debug for LockingMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockingMap")
            .field("lock", self.items.lock())
            .finish_non_exhaustive()
    }
}
