//! Driver for hosts without native input hooks.
//!
//! Captures nothing and logs injections at `trace` level.  The host binary
//! uses it so an engine can take part in discovery, pairing and role
//! negotiation on any platform; native drivers plug in through the same
//! [`InputDriver`] trait.

use std::sync::{Mutex, PoisonError};

use kms_core::{ModifierFlags, MouseButton};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::trace;

use super::{CapturedInput, DriverError, InputDriver, PointerAction};

#[derive(Debug, Default)]
pub struct HeadlessInputDriver {
    // Held only so the capture stream stays open until stop_capture().
    sender: Mutex<Option<UnboundedSender<CapturedInput>>>,
}

impl HeadlessInputDriver {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InputDriver for HeadlessInputDriver {
    fn start_capture(&self) -> Result<mpsc::UnboundedReceiver<CapturedInput>, DriverError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        Ok(rx)
    }

    fn stop_capture(&self) {
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn inject_key(&self, keycode: u32, modifiers: ModifierFlags, down: bool) -> Result<(), DriverError> {
        trace!(keycode, modifiers = modifiers.0, down, "inject key");
        Ok(())
    }

    fn inject_mouse(
        &self,
        action: PointerAction,
        x: i32,
        y: i32,
        button: Option<MouseButton>,
        scroll: (i16, i16),
    ) -> Result<(), DriverError> {
        trace!(?action, x, y, ?button, ?scroll, "inject mouse");
        Ok(())
    }

    fn set_pointer(&self, x: i32, y: i32) -> Result<(), DriverError> {
        trace!(x, y, "set pointer");
        Ok(())
    }
}
