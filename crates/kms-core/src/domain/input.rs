//! Captured input events.
//!
//! An [`InputEvent`] is one physical action on the master: a key going down,
//! the pointer moving, a wheel tick.  The kind-specific data lives in
//! [`InputPayload`], one variant per kind, so a MOVE without coordinates or a
//! key press without a keycode cannot be constructed.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::device::DeviceId;

/// Discriminant of an [`InputPayload`], as it appears in logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputKind {
    KeyPress,
    KeyRelease,
    Move,
    ButtonDown,
    ButtonUp,
    Scroll,
}

impl fmt::Display for InputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputKind::KeyPress => "KEY_PRESS",
            InputKind::KeyRelease => "KEY_RELEASE",
            InputKind::Move => "MOVE",
            InputKind::ButtonDown => "BUTTON_DOWN",
            InputKind::ButtonUp => "BUTTON_UP",
            InputKind::Scroll => "SCROLL",
        };
        f.write_str(name)
    }
}

/// Modifier key bitmask.
///
/// Bit layout:
/// - Bit 0: Left Ctrl
/// - Bit 1: Right Ctrl
/// - Bit 2: Left Shift
/// - Bit 3: Right Shift
/// - Bit 4: Left Alt
/// - Bit 5: Right Alt
/// - Bit 6: Left Meta (Windows/Command)
/// - Bit 7: Right Meta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModifierFlags(pub u8);

impl ModifierFlags {
    pub const LEFT_CTRL: u8 = 1 << 0;
    pub const RIGHT_CTRL: u8 = 1 << 1;
    pub const LEFT_SHIFT: u8 = 1 << 2;
    pub const RIGHT_SHIFT: u8 = 1 << 3;
    pub const LEFT_ALT: u8 = 1 << 4;
    pub const RIGHT_ALT: u8 = 1 << 5;
    pub const LEFT_META: u8 = 1 << 6;
    pub const RIGHT_META: u8 = 1 << 7;

    pub fn ctrl(&self) -> bool {
        self.0 & (Self::LEFT_CTRL | Self::RIGHT_CTRL) != 0
    }

    pub fn shift(&self) -> bool {
        self.0 & (Self::LEFT_SHIFT | Self::RIGHT_SHIFT) != 0
    }

    pub fn alt(&self) -> bool {
        self.0 & (Self::LEFT_ALT | Self::RIGHT_ALT) != 0
    }

    /// Either Windows or Command key.
    pub fn meta(&self) -> bool {
        self.0 & (Self::LEFT_META | Self::RIGHT_META) != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
    Back,
    Forward,
}

/// Kind-specific data of an input event.
///
/// Pointer coordinates are layout-space on the master and target-local once
/// the router has picked a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InputPayload {
    KeyPress {
        keycode: u32,
        modifiers: ModifierFlags,
    },
    KeyRelease {
        keycode: u32,
        modifiers: ModifierFlags,
    },
    Move {
        x: i32,
        y: i32,
    },
    ButtonDown {
        button: MouseButton,
        x: i32,
        y: i32,
    },
    ButtonUp {
        button: MouseButton,
        x: i32,
        y: i32,
    },
    Scroll {
        dx: i16,
        dy: i16,
    },
}

impl InputPayload {
    pub fn kind(&self) -> InputKind {
        match self {
            InputPayload::KeyPress { .. } => InputKind::KeyPress,
            InputPayload::KeyRelease { .. } => InputKind::KeyRelease,
            InputPayload::Move { .. } => InputKind::Move,
            InputPayload::ButtonDown { .. } => InputKind::ButtonDown,
            InputPayload::ButtonUp { .. } => InputKind::ButtonUp,
            InputPayload::Scroll { .. } => InputKind::Scroll,
        }
    }

    /// Pointer position carried by the payload, if any.
    pub fn position(&self) -> Option<(i32, i32)> {
        match *self {
            InputPayload::Move { x, y }
            | InputPayload::ButtonDown { x, y, .. }
            | InputPayload::ButtonUp { x, y, .. } => Some((x, y)),
            _ => None,
        }
    }

    /// Returns a copy with the pointer position replaced; other kinds are unchanged.
    pub fn with_position(self, nx: i32, ny: i32) -> Self {
        match self {
            InputPayload::Move { .. } => InputPayload::Move { x: nx, y: ny },
            InputPayload::ButtonDown { button, .. } => InputPayload::ButtonDown { button, x: nx, y: ny },
            InputPayload::ButtonUp { button, .. } => InputPayload::ButtonUp { button, x: nx, y: ny },
            other => other,
        }
    }
}

/// One captured keyboard or mouse action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputEvent {
    pub id: Uuid,
    pub source_device_id: DeviceId,
    pub target_device_id: DeviceId,
    pub payload: InputPayload,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    /// `false` at capture; the sender sets it when the event is written to
    /// an encrypted session channel, so a receiver can tell relayed input
    /// from anything injected locally.
    #[serde(default)]
    pub encrypted: bool,
}

impl InputEvent {
    /// Creates an event addressed back to its source until the router retargets it.
    pub fn new(source: DeviceId, payload: InputPayload, sequence: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            source_device_id: source,
            target_device_id: source,
            payload,
            sequence,
            timestamp,
            encrypted: false,
        }
    }

    pub fn kind(&self) -> InputKind {
        self.payload.kind()
    }

    /// Returns a copy flagged as sent over an encrypted channel.
    pub fn mark_encrypted(&self) -> Self {
        Self {
            encrypted: true,
            ..self.clone()
        }
    }

    /// Returns a copy of this event addressed to `target`.
    pub fn retarget(&self, target: DeviceId) -> Self {
        Self {
            target_device_id: target,
            ..self.clone()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
