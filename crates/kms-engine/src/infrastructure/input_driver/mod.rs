//! Input driver port: capturing local input and injecting remote input.
//!
//! The engine never calls OS APIs.  A platform driver (keyboard/mouse hooks
//! on the master, synthetic input on a client) implements [`InputDriver`]
//! and is handed to the engine by the host process.
//!
//! # Capture without callbacks
//!
//! Hook callbacks must return quickly or the OS drops the hook, so a driver
//! pushes every captured event into an unbounded channel and returns.  The
//! engine drains the channel on its own task; nothing on the capture path
//! ever waits on the network.
//!
//! # Testability
//!
//! [`mock::RecordingInputDriver`] lets tests feed synthetic events in and
//! read injected events back; unit tests inside the crate can also use the
//! generated `MockInputDriver`.

use chrono::{DateTime, Utc};
use kms_core::{InputPayload, ModifierFlags, MouseButton};
use tokio::sync::mpsc;

pub mod headless;
pub mod mock;

/// One event captured from the local keyboard or mouse.
///
/// Pointer coordinates are in layout space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CapturedInput {
    pub payload: InputPayload,
    pub timestamp: DateTime<Utc>,
}

impl CapturedInput {
    pub fn now(payload: InputPayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
        }
    }
}

/// Pointer action passed to [`InputDriver::inject_mouse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerAction {
    Move,
    ButtonDown,
    ButtonUp,
    Scroll,
}

/// Error type for input driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("input capture is already running")]
    AlreadyCapturing,
    #[error("failed to inject input: {0}")]
    InjectionFailed(String),
    #[error("platform not supported: {0}")]
    UnsupportedPlatform(String),
}

/// Platform primitives for capturing and injecting keyboard/mouse input.
#[cfg_attr(test, mockall::automock)]
pub trait InputDriver: Send + Sync {
    /// Starts capturing local input and returns the event stream.
    fn start_capture(&self) -> Result<mpsc::UnboundedReceiver<CapturedInput>, DriverError>;

    /// Stops capturing; the stream returned by `start_capture` ends.
    fn stop_capture(&self);

    /// Presses (`down = true`) or releases a key.
    fn inject_key(&self, keycode: u32, modifiers: ModifierFlags, down: bool) -> Result<(), DriverError>;

    /// Injects a pointer action at local screen coordinates.
    ///
    /// `button` is set for button actions; `scroll` is `(dx, dy)` for scrolls.
    fn inject_mouse(
        &self,
        action: PointerAction,
        x: i32,
        y: i32,
        button: Option<MouseButton>,
        scroll: (i16, i16),
    ) -> Result<(), DriverError>;

    /// Warps the local pointer without generating a move event.
    fn set_pointer(&self, x: i32, y: i32) -> Result<(), DriverError>;
}
