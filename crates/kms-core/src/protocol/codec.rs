//! JSON envelope codec with length-prefixed framing.
//!
//! Wire format:
//! ```text
//! [length:4 big-endian][UTF-8 JSON envelope:length]
//! ```
//! `length` must be in `1..=MAX_FRAME_LEN`.  The JSON object carries
//! `msgType`, optional `sessionId` and `sequence`, `timestampUtc` and a
//! `payload` whose shape is checked against `msgType` on decode.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::session::SessionId;
use crate::protocol::messages::{Envelope, Message, MessageType};

/// Largest accepted frame body, in bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Errors that can occur during message encoding or decoding.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The byte slice is shorter than the frame it announces.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    #[error("frame length is zero")]
    EmptyFrame,

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },

    /// The envelope itself is not valid JSON or lacks required fields.
    #[error("invalid envelope: {0}")]
    Json(String),

    /// The payload does not have the shape `msg_type` requires.
    #[error("malformed {msg_type} payload: {reason}")]
    MalformedPayload { msg_type: MessageType, reason: String },
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEnvelope {
    msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    timestamp_utc: DateTime<Utc>,
    payload: serde_json::Value,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Serializes an envelope to JSON bytes, without the length prefix.
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] if serialization fails.
pub fn encode_message(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let wire = WireEnvelope {
        msg_type: envelope.msg_type(),
        session_id: envelope.session_id,
        sequence: envelope.sequence,
        timestamp_utc: envelope.timestamp_utc,
        payload: payload_value(&envelope.message).map_err(|e| ProtocolError::Json(e.to_string()))?,
    };
    serde_json::to_vec(&wire).map_err(|e| ProtocolError::Json(e.to_string()))
}

/// Serializes an envelope and prepends the 4-byte big-endian length.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the JSON body exceeds
/// [`MAX_FRAME_LEN`], or [`ProtocolError::Json`] if serialization fails.
///
/// # Examples
///
/// ```rust
/// use kms_core::protocol::codec::{decode_frame, encode_frame};
/// use kms_core::protocol::messages::{Envelope, HeartbeatPayload, Message};
///
/// let envelope = Envelope::new(Message::Ping(HeartbeatPayload { nonce: 42 }));
/// let bytes = encode_frame(&envelope).unwrap();
/// let (decoded, consumed) = decode_frame(&bytes).unwrap();
/// assert_eq!(decoded, envelope);
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
    let body = encode_message(envelope)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: body.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Parses a JSON envelope body (no length prefix).
///
/// # Errors
///
/// Returns [`ProtocolError::Json`] for an unreadable envelope and
/// [`ProtocolError::MalformedPayload`] when the payload does not fit `msgType`.
pub fn decode_message(bytes: &[u8]) -> Result<Envelope, ProtocolError> {
    let wire: WireEnvelope =
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::Json(e.to_string()))?;
    let message = parse_payload(wire.msg_type, wire.payload)?;
    Ok(Envelope {
        session_id: wire.session_id,
        sequence: wire.sequence,
        timestamp_utc: wire.timestamp_utc,
        message,
    })
}

/// Decodes one frame from the start of `bytes`.
///
/// Returns the envelope and the number of bytes consumed (prefix + body) so
/// the caller can advance a read cursor.
///
/// # Errors
///
/// Returns [`ProtocolError`] if the prefix is invalid, the frame is
/// incomplete, or the body fails [`decode_message`].
pub fn decode_frame(bytes: &[u8]) -> Result<(Envelope, usize), ProtocolError> {
    if bytes.len() < LENGTH_PREFIX_LEN {
        return Err(ProtocolError::InsufficientData {
            needed: LENGTH_PREFIX_LEN,
            available: bytes.len(),
        });
    }
    let len = frame_length([bytes[0], bytes[1], bytes[2], bytes[3]])?;
    let total = LENGTH_PREFIX_LEN + len;
    if bytes.len() < total {
        return Err(ProtocolError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    }
    let envelope = decode_message(&bytes[LENGTH_PREFIX_LEN..total])?;
    Ok((envelope, total))
}

/// Validates a length prefix and returns the body length it announces.
///
/// # Errors
///
/// Returns [`ProtocolError::EmptyFrame`] for zero and
/// [`ProtocolError::FrameTooLarge`] above [`MAX_FRAME_LEN`].
pub fn frame_length(prefix: [u8; LENGTH_PREFIX_LEN]) -> Result<usize, ProtocolError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len == 0 {
        return Err(ProtocolError::EmptyFrame);
    }
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len,
            max: MAX_FRAME_LEN,
        });
    }
    Ok(len)
}

// ── Payload mapping ───────────────────────────────────────────────────────────

fn payload_value(message: &Message) -> Result<serde_json::Value, serde_json::Error> {
    match message {
        Message::Hello(p) => serde_json::to_value(p),
        Message::Challenge(p) => serde_json::to_value(p),
        Message::ChallengeResponse(p) => serde_json::to_value(p),
        Message::Ack(p) => serde_json::to_value(p),
        Message::RoleChange(p) => serde_json::to_value(p),
        Message::InputBatch(p) => serde_json::to_value(p),
        Message::InputAck(p) => serde_json::to_value(p),
        Message::Ping(p) | Message::Pong(p) => serde_json::to_value(p),
        Message::Error(p) => serde_json::to_value(p),
        Message::Goodbye(p) => serde_json::to_value(p),
    }
}

fn parse_payload(msg_type: MessageType, value: serde_json::Value) -> Result<Message, ProtocolError> {
    let message = match msg_type {
        MessageType::Hello => Message::Hello(from_payload(msg_type, value)?),
        MessageType::Challenge => Message::Challenge(from_payload(msg_type, value)?),
        MessageType::ChallengeResponse => Message::ChallengeResponse(from_payload(msg_type, value)?),
        MessageType::Ack => Message::Ack(from_payload(msg_type, value)?),
        MessageType::RoleChange => Message::RoleChange(from_payload(msg_type, value)?),
        MessageType::InputBatch => Message::InputBatch(from_payload(msg_type, value)?),
        MessageType::InputAck => Message::InputAck(from_payload(msg_type, value)?),
        MessageType::Ping => Message::Ping(from_payload(msg_type, value)?),
        MessageType::Pong => Message::Pong(from_payload(msg_type, value)?),
        MessageType::Error => Message::Error(from_payload(msg_type, value)?),
        MessageType::Goodbye => Message::Goodbye(from_payload(msg_type, value)?),
    };
    Ok(message)
}

fn from_payload<T: DeserializeOwned>(
    msg_type: MessageType,
    value: serde_json::Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|e| ProtocolError::MalformedPayload {
        msg_type,
        reason: e.to_string(),
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
