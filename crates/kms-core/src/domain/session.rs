//! Authenticated session between a master and a client.
//!
//! # Lifecycle
//!
//! ```text
//! Handshaking ──► Authenticating ──► Active ──► Closing
//!      │               │               │
//!      │               ▼               ▼
//!      └──────────►  Failed  ◄─────────┘
//!      │
//!      └──► Active   (resume token accepted, challenge skipped)
//! ```
//!
//! Every legal move is listed in [`SessionState::can_transition_to`]; the
//! match there is exhaustive, so adding a state forces the table to be
//! revisited.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::device::DeviceId;

/// Unique identifier of a session.
pub type SessionId = Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("a session needs two distinct devices, got {0} on both ends")]
    SameDevice(DeviceId),

    #[error("invalid session transition {from:?} -> {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Handshaking,
    Authenticating,
    Active,
    Closing,
    Failed,
}

impl SessionState {
    /// Returns `true` if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        match self {
            Handshaking => matches!(next, Authenticating | Active | Failed),
            Authenticating => matches!(next, Active | Failed),
            Active => matches!(next, Closing | Failed),
            Closing => false,
            Failed => false,
        }
    }

    /// `true` for states a session never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closing | SessionState::Failed)
    }
}

/// Opaque credential that lets a peer re-establish a session without
/// repeating the passphrase challenge.
///
/// `Debug` output is redacted so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ResumeToken(..)")
    }
}

/// A live authenticated link between a master and a client device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: SessionId,
    pub master_device_id: DeviceId,
    pub client_device_id: DeviceId,
    state: SessionState,
    pub resume_token: Option<ResumeToken>,
    /// Last batch sequence stamped on this session.
    pub event_sequence: u64,
    pub established_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl Session {
    /// Creates a session in [`SessionState::Handshaking`].
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SameDevice`] if master and client are the same device.
    pub fn new(
        id: SessionId,
        master_device_id: DeviceId,
        client_device_id: DeviceId,
        now: DateTime<Utc>,
    ) -> Result<Self, SessionError> {
        if master_device_id == client_device_id {
            return Err(SessionError::SameDevice(master_device_id));
        }
        Ok(Self {
            id,
            master_device_id,
            client_device_id,
            state: SessionState::Handshaking,
            resume_token: None,
            event_sequence: 0,
            established_at: None,
            last_heartbeat_at: now,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Moves the session to `next`, stamping `established_at` on entry to Active.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::InvalidTransition`] and leaves the state unchanged
    /// when the move is not in the transition table.
    pub fn transition(&mut self, next: SessionState, now: DateTime<Utc>) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if next == SessionState::Active {
            self.established_at = Some(now);
            self.last_heartbeat_at = now;
        }
        self.state = next;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// Returns `true` if `device` is either end of this session.
    pub fn involves(&self, device: DeviceId) -> bool {
        self.master_device_id == device || self.client_device_id == device
    }

    /// Returns the device at the other end of the session from `local`.
    pub fn peer_of(&self, local: DeviceId) -> DeviceId {
        if self.master_device_id == local {
            self.client_device_id
        } else {
            self.master_device_id
        }
    }

    /// Returns `true` if both sessions link the same (master, client) pair.
    pub fn same_pair(&self, other: &Session) -> bool {
        self.master_device_id == other.master_device_id
            && self.client_device_id == other.client_device_id
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
