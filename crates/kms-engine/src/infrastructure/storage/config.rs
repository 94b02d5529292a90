//! TOML-file implementation of [`ConfigStore`].
//!
//! The file lives in the platform-appropriate config directory:
//! - Windows:  `%APPDATA%\KeyboardMouseShare\config.toml`
//! - Linux:    `~/.config/KeyboardMouseShare/config.toml`
//! - macOS:    `~/Library/Application Support/KeyboardMouseShare/config.toml`
//!
//! # File shape (for beginners)
//!
//! The engine thinks in flat dotted keys (`"network.port"`), but a TOML file
//! reads far better with sections.  Keys are therefore split on `.` when the
//! file is written and joined back together when it is read:
//!
//! ```toml
//! [device]
//! id = "6f1c…"
//! name = "studio-mac"
//!
//! [network]
//! port = "19999"
//! ```
//!
//! Hand-edited files may use native TOML integers and booleans
//! (`port = 19999`); they are read back as their string form.  Arrays are read
//! as JSON so a layout list can be written as an array of inline tables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use toml::{Table, Value};
use tracing::debug;

use super::ConfigStore;

/// Name of the per-user directory holding the config file.
pub const APP_DIR_NAME: &str = "KeyboardMouseShare";

/// Error type for configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A stored value could not be interpreted for its key.
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },
}

// ── Paths ─────────────────────────────────────────────────────────────────────

/// Determines the platform-appropriate directory for the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when the platform config base
/// directory cannot be determined from the environment.
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir)
}

/// Resolves the full path to the config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.toml"))
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join(APP_DIR_NAME))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join(APP_DIR_NAME)
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join(APP_DIR_NAME))
    }
}

// ── Store ─────────────────────────────────────────────────────────────────────

/// [`ConfigStore`] backed by one TOML file.
///
/// The whole file is held in memory; every `set` rewrites it.
#[derive(Debug)]
pub struct TomlConfigStore {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl TomlConfigStore {
    /// Opens the store at the platform default location.
    ///
    /// # Errors
    ///
    /// See [`TomlConfigStore::open`].
    pub fn open_default() -> Result<Self, ConfigError> {
        Self::open(config_file_path()?)
    }

    /// Opens the store at `path`.  A missing file is an empty store; it is
    /// created on the first `set`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] for file-system errors other than "not
    /// found", and [`ConfigError::Parse`] if the TOML is malformed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => {
                let table: Table = toml::from_str(&content)?;
                let mut values = BTreeMap::new();
                flatten("", &table, &mut values);
                values
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file yet; starting empty");
                BTreeMap::new()
            }
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        Ok(Self {
            path,
            values: Mutex::new(values),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, values: &BTreeMap<String, String>) -> Result<(), ConfigError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let content = toml::to_string_pretty(&nest(values))?;
        std::fs::write(&self.path, content).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl ConfigStore for TomlConfigStore {
    fn get(&self, key: &str) -> Result<Option<String>, ConfigError> {
        let values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), ConfigError> {
        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = values.insert(key.to_string(), value.to_string());
        if let Err(e) = self.save(&values) {
            match previous {
                Some(old) => values.insert(key.to_string(), old),
                None => values.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }
}

// ── Flat <-> nested conversion ────────────────────────────────────────────────

fn flatten(prefix: &str, table: &Table, out: &mut BTreeMap<String, String>) {
    for (name, value) in table {
        let key = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}.{name}")
        };
        match value {
            Value::Table(inner) => flatten(&key, inner, out),
            Value::String(s) => {
                out.insert(key, s.clone());
            }
            Value::Array(_) => {
                let json = serde_json::to_string(value).unwrap_or_else(|_| value.to_string());
                out.insert(key, json);
            }
            other => {
                out.insert(key, other.to_string());
            }
        }
    }
}

fn nest(values: &BTreeMap<String, String>) -> Table {
    let mut root = Table::new();
    for (key, value) in values {
        let parts: Vec<&str> = key.split('.').collect();
        if !insert_nested(&mut root, &parts, value) {
            // A key that is both a value and a section prefix stays flat and quoted.
            root.insert(key.clone(), Value::String(value.clone()));
        }
    }
    root
}

fn insert_nested(table: &mut Table, parts: &[&str], value: &str) -> bool {
    match parts {
        [] => false,
        [last] => {
            if table.contains_key(*last) {
                return false;
            }
            table.insert((*last).to_string(), Value::String(value.to_string()));
            true
        }
        [head, rest @ ..] => {
            if !table.contains_key(*head) {
                table.insert((*head).to_string(), Value::Table(Table::new()));
            }
            match table.get_mut(*head) {
                Some(Value::Table(inner)) => insert_nested(inner, rest, value),
                _ => false,
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
