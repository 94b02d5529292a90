//! Typed engine settings read from a [`ConfigStore`].
//!
//! Every key has a default, so a brand-new machine starts with an empty
//! store.  The only value ever written back during load is `device.id`: it is
//! generated once and persisted so the device keeps its identity across
//! restarts.

use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kms_core::domain::device::validate_display_name;
use kms_core::protocol::PROTOCOL_VERSION;
use kms_core::{CursorConfig, Device, DeviceError, DeviceId, DeviceOs, DeviceRole, Layout, LayoutSet};
use tracing::info;
use uuid::Uuid;

use super::config::ConfigError;
use super::ConfigStore;
use crate::application::engine::{EngineConfig, SessionConfig};
use crate::application::pairing::PairingConfig;
use crate::application::presence::PresenceConfig;
use crate::application::relay::RelayConfig;

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_device_name() -> String {
    let raw = std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_default();
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == ' ' || *c == '-' || *c == '\'')
        .take(kms_core::domain::device::MAX_DISPLAY_NAME_LEN)
        .collect();
    if validate_display_name(&cleaned).is_ok() {
        cleaned
    } else {
        "kms-device".to_string()
    }
}
fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}
fn default_port() -> u16 {
    19999
}
fn default_discovery_port() -> u16 {
    19998
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Everything the host process needs to build an engine.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub device_id: DeviceId,
    pub device_name: String,
    pub role_preference: DeviceRole,
    pub bind_address: IpAddr,
    pub port: u16,
    pub discovery_port: u16,
    /// Hex SHA-256 of the shared passphrase; never the passphrase itself.
    pub passphrase_hash: Option<String>,
    pub auto_connect: bool,
    pub presence: PresenceConfig,
    pub pairing: PairingConfig,
    pub session: SessionConfig,
    pub relay: RelayConfig,
    pub cursor: CursorConfig,
    pub layouts: LayoutSet,
    pub log_level: String,
}

impl EngineSettings {
    /// Reads all settings from `store`, filling in defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidValue`] for a value that does not parse
    /// for its key (including an invalid device name or an overlapping
    /// layout list), or any error raised by the store itself.
    pub fn load(store: &dyn ConfigStore) -> Result<Self, ConfigError> {
        let device_id = match store.get("device.id")? {
            Some(raw) => parse_value("device.id", &raw)?,
            None => {
                let id = Uuid::new_v4();
                store.set("device.id", &id.to_string())?;
                info!(device_id = %id, "generated new device id");
                id
            }
        };

        let device_name = read(store, "device.name", default_device_name)?;
        validate_display_name(&device_name).map_err(|e| invalid("device.name", &device_name, e))?;

        let presence_defaults = PresenceConfig::default();
        let presence = PresenceConfig {
            liveness_window: read_secs(store, "discovery.liveness_secs", presence_defaults.liveness_window)?,
            sweep_interval: read_secs(store, "discovery.sweep_secs", presence_defaults.sweep_interval)?,
            announce_interval: read_secs(store, "discovery.announce_secs", presence_defaults.announce_interval)?,
            ..presence_defaults
        };

        let pairing_defaults = PairingConfig::default();
        let pairing = PairingConfig {
            max_attempts: read(store, "pairing.max_attempts", || pairing_defaults.max_attempts)?,
            lockout: read_secs(store, "pairing.lockout_secs", pairing_defaults.lockout)?,
            handshake_timeout: read_secs(
                store,
                "pairing.handshake_timeout_secs",
                pairing_defaults.handshake_timeout,
            )?,
            resume_ttl: read_secs(store, "pairing.resume_ttl_secs", pairing_defaults.resume_ttl)?,
            ..pairing_defaults
        };

        let session_defaults = SessionConfig::default();
        let session = SessionConfig {
            heartbeat_interval: read_secs(
                store,
                "session.heartbeat_interval_secs",
                session_defaults.heartbeat_interval,
            )?,
            heartbeat_timeout: read_secs(
                store,
                "session.heartbeat_timeout_secs",
                session_defaults.heartbeat_timeout,
            )?,
        };

        let relay_defaults = RelayConfig::default();
        let relay = RelayConfig {
            queue_capacity: read(store, "relay.queue_capacity", || relay_defaults.queue_capacity)?,
            batch_size: read(store, "relay.batch_size", || relay_defaults.batch_size)?,
            batch_timeout: read_millis(store, "relay.batch_timeout_ms", relay_defaults.batch_timeout)?,
            max_retries: read(store, "relay.max_retries", || relay_defaults.max_retries)?,
            retry_backoff: read_millis(store, "relay.retry_backoff_ms", relay_defaults.retry_backoff)?,
        };
        if relay.queue_capacity == 0 || relay.batch_size == 0 || relay.max_retries == 0 {
            return Err(invalid(
                "relay",
                &format!("{relay:?}"),
                "queue_capacity, batch_size and max_retries must be at least 1",
            ));
        }

        let cursor_defaults = CursorConfig::default();
        let cursor = CursorConfig {
            edge_threshold: read(store, "cursor.edge_threshold_px", || cursor_defaults.edge_threshold)?,
            cooldown: read_millis(store, "cursor.cooldown_ms", cursor_defaults.cooldown)?,
        };

        let passphrase_hash = match store.get("pairing.passphrase_hash")? {
            Some(raw) if raw.trim().is_empty() => None,
            Some(raw) => {
                let valid = raw.len() == 64 && raw.chars().all(|c| c.is_ascii_hexdigit());
                if !valid {
                    return Err(invalid(
                        "pairing.passphrase_hash",
                        "<redacted>",
                        "expected 64 hex characters",
                    ));
                }
                Some(raw.to_ascii_lowercase())
            }
            None => None,
        };

        Ok(Self {
            device_id,
            device_name,
            role_preference: read(store, "device.role_preference", DeviceRole::default)?,
            bind_address: read(store, "network.bind_address", default_bind_address)?,
            port: read(store, "network.port", default_port)?,
            discovery_port: read(store, "discovery.port", default_discovery_port)?,
            passphrase_hash,
            auto_connect: read(store, "pairing.auto_connect", || false)?,
            presence,
            pairing,
            session,
            relay,
            cursor,
            layouts: load_layouts(store)?,
            log_level: read(store, "log.level", default_log_level)?,
        })
    }

    /// Address the session listener binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Builds the record for this machine.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::UnknownOs`] on a platform other than Windows or
    /// macOS unless `os` is supplied explicitly.
    pub fn local_device(&self, os: Option<DeviceOs>, now: DateTime<Utc>) -> Result<Device, DeviceError> {
        let os = os
            .or_else(DeviceOs::detect)
            .ok_or_else(|| DeviceError::UnknownOs(std::env::consts::OS.to_string()))?;
        Device::local(self.device_id, self.device_name.clone(), os, PROTOCOL_VERSION, now)
    }

    /// The engine-facing subset of the settings.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            listen_addr: self.listen_addr(),
            role_preference: self.role_preference,
            passphrase_hash: self.passphrase_hash.clone(),
            auto_connect: self.auto_connect,
            presence: self.presence.clone(),
            pairing: self.pairing.clone(),
            session: self.session.clone(),
            relay: self.relay.clone(),
            cursor: self.cursor,
            layouts: self.layouts.clone(),
        }
    }
}

/// Persists `layouts` under `layout.list`.
///
/// # Errors
///
/// Returns any error raised by the store.
pub fn save_layouts(store: &dyn ConfigStore, layouts: &LayoutSet) -> Result<(), ConfigError> {
    let json = serde_json::to_string(&layouts.to_vec()).map_err(|e| invalid("layout.list", "", e))?;
    store.set("layout.list", &json)
}

fn load_layouts(store: &dyn ConfigStore) -> Result<LayoutSet, ConfigError> {
    let Some(raw) = store.get("layout.list")? else {
        return Ok(LayoutSet::default());
    };
    let list: Vec<Layout> = serde_json::from_str(&raw).map_err(|e| invalid("layout.list", &raw, e))?;
    LayoutSet::new(list).map_err(|e| invalid("layout.list", &raw, e))
}

// ── Parsing helpers ───────────────────────────────────────────────────────────

fn invalid(key: &str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim().parse().map_err(|e| invalid(key, raw, e))
}

fn read<T>(store: &dyn ConfigStore, key: &str, default: impl FnOnce() -> T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match store.get(key)? {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default()),
    }
}

fn read_secs(store: &dyn ConfigStore, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    read(store, key, || default.as_secs()).map(Duration::from_secs)
}

fn read_millis(store: &dyn ConfigStore, key: &str, default: Duration) -> Result<Duration, ConfigError> {
    read(store, key, || default.as_millis() as u64).map(Duration::from_millis)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
