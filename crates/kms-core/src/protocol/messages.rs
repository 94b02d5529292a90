//! Wire message types.
//!
//! Every message travels inside an [`Envelope`]:
//!
//! ```text
//! { "msgType": "HELLO", "sessionId": "...", "sequence": 7,
//!   "timestampUtc": "2024-05-01T12:00:00Z", "payload": { ... } }
//! ```
//!
//! `sessionId` and `sequence` are omitted when absent.  The payload shape is
//! fixed by `msgType`; see [`Message`].

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::device::{DeviceId, DeviceOs, DeviceRole};
use crate::domain::input::InputEvent;
use crate::domain::session::{ResumeToken, SessionId};

// ── Protocol constants ────────────────────────────────────────────────────────

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest protocol version this build still talks to.
pub const MIN_PROTOCOL_VERSION: u32 = 1;

// ── Message type codes ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    Hello,
    Challenge,
    ChallengeResponse,
    Ack,
    RoleChange,
    InputBatch,
    InputAck,
    Ping,
    Pong,
    Error,
    Goodbye,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Hello => "HELLO",
            MessageType::Challenge => "CHALLENGE",
            MessageType::ChallengeResponse => "CHALLENGE_RESPONSE",
            MessageType::Ack => "ACK",
            MessageType::RoleChange => "ROLE_CHANGE",
            MessageType::InputBatch => "INPUT_BATCH",
            MessageType::InputAck => "INPUT_ACK",
            MessageType::Ping => "PING",
            MessageType::Pong => "PONG",
            MessageType::Error => "ERROR",
            MessageType::Goodbye => "GOODBYE",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Capabilities ──────────────────────────────────────────────────────────────

/// Optional protocol features, negotiated in HELLO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    InputSharing,
    KeyboardRouting,
    PassphraseAuth,
    /// Multi-event INPUT_BATCH frames (v2).
    InputBatching,
    /// Resume tokens in ACK (v2).
    SessionResume,
}

/// Ordered set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    /// Capabilities a peer speaking `version` supports.
    pub fn for_version(version: u32) -> Self {
        let mut set = BTreeSet::new();
        if version >= 1 {
            set.extend([
                Capability::InputSharing,
                Capability::KeyboardRouting,
                Capability::PassphraseAuth,
            ]);
        }
        if version >= 2 {
            set.extend([Capability::InputBatching, Capability::SessionResume]);
        }
        Self(set)
    }

    /// Features both sides support.
    pub fn intersect(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    pub fn contains(&self, capability: Capability) -> bool {
        self.0.contains(&capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// ── Error codes ───────────────────────────────────────────────────────────────

/// Reason code carried by an ERROR message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    DiscoveryTimeout,
    ConnectionFailed,
    AuthFailed,
    InvalidPassphrase,
    DuplicateDevice,
    RoleConflict,
    UnsupportedFeature,
    LockedOut,
    VersionMismatch,
    ProtocolViolation,
}

impl ErrorCode {
    /// Numeric value, stable across versions.
    pub fn as_u16(&self) -> u16 {
        match self {
            ErrorCode::DiscoveryTimeout => 1001,
            ErrorCode::ConnectionFailed => 1002,
            ErrorCode::AuthFailed => 1003,
            ErrorCode::InvalidPassphrase => 1004,
            ErrorCode::DuplicateDevice => 1005,
            ErrorCode::RoleConflict => 1006,
            ErrorCode::UnsupportedFeature => 1007,
            ErrorCode::LockedOut => 1008,
            ErrorCode::VersionMismatch => 1009,
            ErrorCode::ProtocolViolation => 1010,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u16())
    }
}

// ── Per-message payloads ──────────────────────────────────────────────────────

/// HELLO: identity and feature advertisement, sent by both sides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub device_id: DeviceId,
    pub display_name: String,
    pub os: DeviceOs,
    pub role: DeviceRole,
    pub protocol_version: u32,
    pub capabilities: CapabilitySet,
    /// Previously issued token; only the initiator sends one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,
}

/// CHALLENGE: server-issued nonce the initiator must prove passphrase knowledge against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengePayload {
    /// 32 random bytes, hex-encoded.
    pub nonce: String,
    pub attempts_remaining: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponsePayload {
    /// Hex-encoded proof; never the passphrase or its bare hash.
    pub proof: String,
}

/// ACK: the session is established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AckPayload {
    pub session_id: SessionId,
    pub master_device_id: DeviceId,
    pub client_device_id: DeviceId,
    pub protocol_version: u32,
    pub capabilities: CapabilitySet,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_token: Option<ResumeToken>,
    #[serde(default)]
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleChangePayload {
    pub master_device_id: DeviceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_master_id: Option<DeviceId>,
}

/// INPUT_BATCH: the batch sequence travels in the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputBatchPayload {
    pub events: Vec<InputEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputAckPayload {
    pub sequence: u64,
    pub applied: u32,
}

/// PING and PONG share a payload; a PONG echoes the nonce it answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts_remaining: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorPayload {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            attempts_remaining: None,
            retry_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoodbyePayload {
    pub reason: String,
}

// ── Top-level message enum ────────────────────────────────────────────────────

/// A decoded protocol message, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Hello(HelloPayload),
    Challenge(ChallengePayload),
    ChallengeResponse(ChallengeResponsePayload),
    Ack(AckPayload),
    RoleChange(RoleChangePayload),
    InputBatch(InputBatchPayload),
    InputAck(InputAckPayload),
    Ping(HeartbeatPayload),
    Pong(HeartbeatPayload),
    Error(ErrorPayload),
    Goodbye(GoodbyePayload),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Hello(_) => MessageType::Hello,
            Message::Challenge(_) => MessageType::Challenge,
            Message::ChallengeResponse(_) => MessageType::ChallengeResponse,
            Message::Ack(_) => MessageType::Ack,
            Message::RoleChange(_) => MessageType::RoleChange,
            Message::InputBatch(_) => MessageType::InputBatch,
            Message::InputAck(_) => MessageType::InputAck,
            Message::Ping(_) => MessageType::Ping,
            Message::Pong(_) => MessageType::Pong,
            Message::Error(_) => MessageType::Error,
            Message::Goodbye(_) => MessageType::Goodbye,
        }
    }
}

/// A message plus its routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub session_id: Option<SessionId>,
    pub sequence: Option<u64>,
    pub timestamp_utc: DateTime<Utc>,
    pub message: Message,
}

impl Envelope {
    /// Wraps `message`, stamped with the current time.
    pub fn new(message: Message) -> Self {
        Self::at(message, Utc::now())
    }

    pub fn at(message: Message, timestamp_utc: DateTime<Utc>) -> Self {
        Self {
            session_id: None,
            sequence: None,
            timestamp_utc,
            message,
        }
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn msg_type(&self) -> MessageType {
        self.message.message_type()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
