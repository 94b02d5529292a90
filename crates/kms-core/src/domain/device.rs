//! Device identity records.
//!
//! A [`Device`] is created on first discovery (or at local startup for this
//! machine) and is never deleted afterwards; a peer that stops announcing is
//! only marked not-present so it can reconnect silently.

use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable identifier of a device, derived from UUID v4.
pub type DeviceId = Uuid;

/// Maximum length of a display name, in characters.
pub const MAX_DISPLAY_NAME_LEN: usize = 50;

/// Errors raised when constructing or validating a device record.
#[derive(Debug, Error, PartialEq)]
pub enum DeviceError {
    #[error("display name must not be empty")]
    EmptyName,

    #[error("display name is {len} characters long; at most {max} are allowed", max = MAX_DISPLAY_NAME_LEN)]
    NameTooLong { len: usize },

    #[error("display name contains unsupported character {0:?}")]
    InvalidNameCharacter(char),

    #[error("unknown operating system: {0}")]
    UnknownOs(String),

    #[error("unknown role: {0}")]
    UnknownRole(String),
}

/// Operating system family of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceOs {
    Windows,
    Macos,
}

impl DeviceOs {
    /// Returns the OS family this binary was compiled for, if supported.
    pub fn detect() -> Option<Self> {
        if cfg!(target_os = "windows") {
            Some(DeviceOs::Windows)
        } else if cfg!(target_os = "macos") {
            Some(DeviceOs::Macos)
        } else {
            None
        }
    }

    /// Wire/metadata spelling of the OS.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceOs::Windows => "WINDOWS",
            DeviceOs::Macos => "MACOS",
        }
    }
}

impl std::str::FromStr for DeviceOs {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "WINDOWS" => Ok(DeviceOs::Windows),
            "MACOS" | "DARWIN" => Ok(DeviceOs::Macos),
            _ => Err(DeviceError::UnknownOs(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a device plays in input sharing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceRole {
    /// The device whose physical keyboard and mouse are the input source.
    Master,
    /// A device that receives relayed input and simulates it locally.
    Client,
    #[default]
    Unassigned,
}

impl DeviceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceRole::Master => "MASTER",
            DeviceRole::Client => "CLIENT",
            DeviceRole::Unassigned => "UNASSIGNED",
        }
    }
}

impl std::str::FromStr for DeviceRole {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MASTER" => Ok(DeviceRole::Master),
            "CLIENT" => Ok(DeviceRole::Client),
            "UNASSIGNED" => Ok(DeviceRole::Unassigned),
            _ => Err(DeviceError::UnknownRole(s.to_string())),
        }
    }
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity record of a device on the local network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: DeviceId,
    pub display_name: String,
    pub os: DeviceOs,
    pub role: DeviceRole,
    /// `host:port` of the device's session listener; `None` until discovered.
    pub address: Option<SocketAddr>,
    pub protocol_version: u32,
    /// `true` while the device has been heard from within the liveness window.
    pub present: bool,
    pub last_seen: DateTime<Utc>,
}

impl Device {
    /// Creates the record for this machine.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] if `display_name` fails [`validate_display_name`].
    pub fn local(
        id: DeviceId,
        display_name: impl Into<String>,
        os: DeviceOs,
        protocol_version: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, DeviceError> {
        let display_name = display_name.into();
        validate_display_name(&display_name)?;
        Ok(Self {
            id,
            display_name,
            os,
            role: DeviceRole::Unassigned,
            address: None,
            protocol_version,
            present: true,
            last_seen: now,
        })
    }

    pub fn is_master(&self) -> bool {
        self.role == DeviceRole::Master
    }
}

/// Checks a display name: 1–50 characters of letters, digits, spaces, `-` or `'`.
///
/// # Errors
///
/// Returns the first rule the name violates.
pub fn validate_display_name(name: &str) -> Result<(), DeviceError> {
    if name.trim().is_empty() {
        return Err(DeviceError::EmptyName);
    }
    let len = name.chars().count();
    if len > MAX_DISPLAY_NAME_LEN {
        return Err(DeviceError::NameTooLong { len });
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == ' ' || *c == '-' || *c == '\''))
    {
        return Err(DeviceError::InvalidNameCharacter(bad));
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_device_starts_present_and_unassigned() {
        // Arrange
        let id = Uuid::new_v4();
        let now = Utc::now();

        // Act
        let device = Device::local(id, "office-pc", DeviceOs::Windows, 2, now).unwrap();

        // Assert
        assert_eq!(device.id, id);
        assert_eq!(device.role, DeviceRole::Unassigned);
        assert!(device.present);
        assert!(device.address.is_none());
        assert_eq!(device.last_seen, now);
    }

    #[test]
    fn test_local_device_rejects_invalid_name() {
        let result = Device::local(Uuid::new_v4(), "bad/name", DeviceOs::Macos, 2, Utc::now());
        assert_eq!(result, Err(DeviceError::InvalidNameCharacter('/')));
    }

    #[test]
    fn test_validate_display_name_accepts_letters_digits_space_dash_apostrophe() {
        assert!(validate_display_name("Sam's Mac-Book 2").is_ok());
    }

    #[test]
    fn test_validate_display_name_rejects_blank() {
        assert_eq!(validate_display_name("   "), Err(DeviceError::EmptyName));
    }

    #[test]
    fn test_validate_display_name_rejects_51_characters() {
        let name = "a".repeat(51);
        assert_eq!(
            validate_display_name(&name),
            Err(DeviceError::NameTooLong { len: 51 })
        );
    }

    #[test]
    fn test_validate_display_name_accepts_exactly_50_characters() {
        let name = "a".repeat(50);
        assert!(validate_display_name(&name).is_ok());
    }

    #[test]
    fn test_device_os_parses_darwin_alias() {
        assert_eq!("Darwin".parse::<DeviceOs>(), Ok(DeviceOs::Macos));
        assert_eq!("windows".parse::<DeviceOs>(), Ok(DeviceOs::Windows));
        assert!("beos".parse::<DeviceOs>().is_err());
    }

    #[test]
    fn test_device_role_round_trips_through_str() {
        for role in [DeviceRole::Master, DeviceRole::Client, DeviceRole::Unassigned] {
            assert_eq!(role.as_str().parse::<DeviceRole>(), Ok(role));
        }
    }

    #[test]
    fn test_device_serializes_with_camel_case_fields() {
        // Arrange
        let device =
            Device::local(Uuid::new_v4(), "desk", DeviceOs::Windows, 2, Utc::now()).unwrap();

        // Act
        let json = serde_json::to_string(&device).unwrap();

        // Assert
        assert!(json.contains("\"displayName\":\"desk\""));
        assert!(json.contains("\"protocolVersion\":2"));
        assert!(json.contains("\"role\":\"UNASSIGNED\""));
    }
}
