//! Iteration that keeps the collection read-locked until it is disposed.

use crate::error::{Error, Result};
use crate::lock::ReadGuard;

/// Single-pass iterator over a snapshot of a collection, holding a read guard
/// on the collection's lock for as long as it lives.
///
/// Writers wait until the enumerator is disposed or dropped. Running out of
/// items does not release the guard.
#[derive(Debug)]
pub struct LockingEnumerator<T> {
    items: std::vec::IntoIter<T>,
    guard: Option<ReadGuard>,
}

impl<T> LockingEnumerator<T> {
    pub(crate) fn new(guard: ReadGuard, items: Vec<T>) -> Self {
        Self {
            items: items.into_iter(),
            guard: Some(guard),
        }
    }

    /// Next item, or [`Error::InvalidState`] once the enumerator is disposed.
    pub fn try_next(&mut self) -> Result<Option<T>> {
        if self.guard.is_none() {
            return Err(Error::InvalidState("enumerator used after disposal"));
        }
        Ok(self.items.next())
    }

    /// Releases the read guard. Further calls do nothing.
    pub fn dispose(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.release();
        }
        self.items = Vec::new().into_iter();
    }

    pub async fn dispose_async(&mut self) {
        if let Some(guard) = self.guard.take() {
            guard.release_async().await;
        }
        self.items = Vec::new().into_iter();
    }

    pub fn is_disposed(&self) -> bool {
        self.guard.is_none()
    }
}

impl<T> Iterator for LockingEnumerator<T> {
    type Item = T;

    /// Yields nothing once disposed; use [`try_next`](LockingEnumerator::try_next)
    /// to observe misuse. Debug builds panic instead.
    fn next(&mut self) -> Option<T> {
        debug_assert!(self.guard.is_some(), "enumerator used after disposal");
        self.try_next().ok().flatten()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.items.size_hint()
    }
}
