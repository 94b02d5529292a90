//! Storage infrastructure: the configuration key-value store.
//!
//! The engine never reads files directly.  Everything it persists (device
//! id, display name, passphrase hash, layout list) goes through the
//! [`ConfigStore`] port:
//!
//! - **`config`** – [`TomlConfigStore`], a TOML file in the platform config
//!   directory, written through on every `set`.
//! - **`settings`** – [`EngineSettings`], the typed view the host process
//!   builds from a store at startup.
//!
//! [`MemoryConfigStore`] lives here too; tests use it in place of a file.

pub mod config;
pub mod settings;

use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

pub use config::{ConfigError, TomlConfigStore};
pub use settings::EngineSettings;

/// Blocking key-value configuration service.
///
/// Keys are dotted paths such as `"relay.batch_size"`; values are strings and
/// are parsed by the caller.
pub trait ConfigStore: Send + Sync {
    /// Returns the value for `key`, or `None` if it was never set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the backing storage cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the backing storage cannot be written.
    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError>;
}

/// In-memory [`ConfigStore`] used by tests and throwaway engines.
#[derive(Debug, Default)]
pub struct MemoryConfigStore {
    values: Mutex<BTreeMap<String, String>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-filled with `(key, value)` pairs.
    pub fn with_values<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self {
            values: Mutex::new(values),
        }
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
