//! Tunables for locks and collections, loadable from a TOML file.

use serde::Deserialize;

use crate::error::{Error, Result};

/// Settings shared by [`LockCore`](crate::LockCore), [`LockingMap`](crate::LockingMap)
/// and [`LockingList`](crate::LockingList).
///
/// ```toml
/// name = "inventory"
/// detect_reentrancy = true
/// sort_reset_ratio = 0.5
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CollectionConfig {
    /// Label attached to every tracing event emitted by the lock.
    pub name: String,
    /// Fail nested acquisitions made from inside a locked callback instead of
    /// letting them deadlock.
    pub detect_reentrancy: bool,
    /// Fraction of moved positions above which a sort publishes a single
    /// `Reset` instead of one `ItemChanged` per position.
    pub sort_reset_ratio: f64,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            name: "lock".to_string(),
            detect_reentrancy: true,
            sort_reset_ratio: 0.5,
        }
    }
}

impl CollectionConfig {
    /// Default settings with a custom tracing label.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Loads the configuration from a TOML file. `~` and environment
    /// variables in `path` are expanded.
    pub fn from_file(path: &str) -> Result<Self> {
        let path = shellexpand::full(path)
            .map_err(|e| Error::Config(format!("cannot expand {path}: {e}")))?;
        let config: Self = ext_config::Config::builder()
            .add_source(ext_config::File::new(&path, ext_config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses the configuration from a TOML string.
    pub fn from_toml(source: &str) -> Result<Self> {
        let config: Self = ext_config::Config::builder()
            .add_source(ext_config::File::from_str(
                source,
                ext_config::FileFormat::Toml,
            ))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.sort_reset_ratio) {
            return Err(Error::Config(format!(
                "sort_reset_ratio must be within 0..=1, got {}",
                self.sort_reset_ratio
            )));
        }
        Ok(())
    }
}
