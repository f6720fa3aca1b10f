//! Helpers shared by the scenario tests and the `collections_stress` binary.

use std::future::Future;
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use sync_collections::{HasLock, LockCore};
use tracing_subscriber::EnvFilter;

static TRACING: OnceCell<()> = OnceCell::new();

/// Installs a global `tracing` subscriber once per process. The filter comes
/// from `RUST_LOG` and defaults to `info`.
pub fn start_tracing() {
    TRACING.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        // Another harness may have installed one already.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Upper bound for anything a scenario waits on.
pub const PATIENCE: Duration = Duration::from_secs(10);

/// Spins the current thread until `condition` holds.
///
/// # Panics
///
/// When [`PATIENCE`] runs out.
pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Async counterpart of [`wait_until`].
pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + PATIENCE;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Awaits `future`, failing the test if it takes longer than [`PATIENCE`].
pub async fn within_patience<F: Future>(what: &str, future: F) -> F::Output {
    match tokio::time::timeout(PATIENCE, future).await {
        Ok(output) => output,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// A list element that owns a lock of its own, like the entities kept in an
/// application roster.
#[derive(Debug, Clone)]
pub struct Character {
    pub name: String,
    pub level: u32,
    lock: LockCore,
}

impl Character {
    pub fn new(name: &str, level: u32) -> Self {
        Self {
            name: name.to_string(),
            level,
            lock: LockCore::named(name),
        }
    }

    /// A copy sharing this character's lock.
    pub fn with_level(&self, level: u32) -> Self {
        Self {
            level,
            ..self.clone()
        }
    }
}

impl PartialEq for Character {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.level == other.level
    }
}

impl HasLock for Character {
    fn lock_core(&self) -> Option<&LockCore> {
        Some(&self.lock)
    }
}

/// Builds a roster of characters named `c0`, `c1`, ... with the given levels.
pub fn roster(levels: &[u32]) -> Vec<Character> {
    levels
        .iter()
        .enumerate()
        .map(|(i, level)| Character::new(&format!("c{i}"), *level))
        .collect()
}
