//! Upgradeable reader/writer locking for state shared between OS threads and
//! async tasks.
//!
//! [`LockCore`] is an asynchronous, cancellable reader/writer lock with an
//! upgradeable read mode and a high-priority read mode. Every acquisition
//! exists in a blocking form and an `_async` form taking an optional
//! [`CancellationToken`]; both are served by the same queue.
//!
//! On top of it sit [`LockingMap`] and [`LockingList`], collections that run
//! each operation under their own lock, and [`LockingEnumerator`], which keeps
//! a collection read-locked while it is being iterated.
//!
//! ```
//! use sync_collections::{ListChange, LockingList, LockingMap};
//!
//! let scores: LockingMap<&str, u32> = LockingMap::new();
//! scores.add_or_update("ana", |_| 1, |_, v| v + 1)?;
//! assert_eq!(scores.value(&"ana")?, 1);
//!
//! let party = LockingList::new();
//! let changes = party.subscribe()?;
//! party.add("ana")?;
//! assert_eq!(changes.try_recv(), Ok(ListChange::ItemAdded { index: 0 }));
//! # Ok::<(), sync_collections::Error>(())
//! ```

mod config;
mod enumerator;
mod error;
mod list;
mod lock;
mod map;
mod notify;
mod scoped;

pub use config::CollectionConfig;
pub use enumerator::LockingEnumerator;
pub use error::{Error, Result};
pub use list::LockingList;
pub use lock::{
    ExclusiveGuard, Guard, HasLock, LockCore, LockMode, LockStatus, ReadGuard, Upgrade,
    UpgradeableReadGuard, UpgradedWriteGuard, WriteGuard,
};
pub use map::LockingMap;
pub use notify::ListChange;
pub use scoped::Locked;
pub use tokio_util::sync::CancellationToken;
