//! # kms-core
//!
//! Shared library for Keyboard Mouse Share containing the wire protocol
//! codec, the domain entities, and the multi-monitor cursor geometry.
//!
//! This crate is used by the engine and by anything that needs to speak the
//! protocol.  It has zero dependencies on OS APIs, async runtimes, or
//! network sockets.
//!
//! # Architecture overview (for beginners)
//!
//! Keyboard Mouse Share is a software KVM: one "master" computer's keyboard
//! and mouse drive one or more "client" computers over the local network.
//! When the pointer reaches the edge of one screen it continues onto the
//! adjacent screen, even if that screen belongs to another machine.
//!
//! This crate (`kms-core`) is the shared foundation.  It defines:
//!
//! - **`protocol`** – How messages travel over the network.  Every message is
//!   a JSON envelope framed with a 4-byte big-endian length prefix, decoded
//!   back into typed Rust structs on the other end.
//!
//! - **`domain`** – Pure business logic with no OS dependencies: devices,
//!   sessions and their state machine, screen layouts, input events, and the
//!   [`CursorMapper`] that decides when the pointer crosses onto another
//!   device.

pub mod domain;
pub mod protocol;

pub use domain::cursor::{CursorConfig, CursorMapper, CursorMapping, Edge};
pub use domain::device::{Device, DeviceError, DeviceId, DeviceOs, DeviceRole};
pub use domain::input::{InputEvent, InputKind, InputPayload, ModifierFlags, MouseButton};
pub use domain::layout::{GeometryError, Layout, LayoutSet, Orientation};
pub use domain::session::{ResumeToken, Session, SessionError, SessionId, SessionState};
pub use protocol::codec::{decode_frame, encode_frame, ProtocolError};
pub use protocol::messages::{Envelope, Message, MessageType};
