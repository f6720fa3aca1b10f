//! Error type shared by the lock and the collections built on it.

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures surfaced by [`LockCore`](crate::LockCore) acquisitions and the
/// locking collections.
///
/// `Cancelled` and `Disposed` come from the lock and are always propagated to
/// the caller of a collection operation. `KeyNotFound` and `IndexOutOfRange`
/// are ordinary collection errors. `InvalidState` marks misuse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The cancellation token fired before the lock was granted. No lock state
    /// was changed.
    #[error("operation cancelled while waiting for the lock")]
    Cancelled,

    /// The lock (or the collection owning it) has been disposed.
    #[error("lock has been disposed")]
    Disposed,

    /// Indexer-style lookup of a key that is not present.
    #[error("key not found")]
    KeyNotFound,

    /// An index or destination range outside the collection bounds.
    #[error("index {index} is out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    /// Programming error, such as a nested acquisition that would deadlock or
    /// enumerating after disposal.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Configuration could not be loaded or failed validation.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Short stable code, handy for log filtering.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::Disposed => "disposed",
            Self::KeyNotFound => "key_not_found",
            Self::IndexOutOfRange { .. } => "index_out_of_range",
            Self::InvalidState(_) => "invalid_state",
            Self::Config(_) => "config",
        }
    }

    /// True for errors caused by the lock itself rather than the collection
    /// contents.
    pub fn is_lock_error(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Disposed | Self::InvalidState(_))
    }
}

impl From<ext_config::ConfigError> for Error {
    fn from(e: ext_config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
