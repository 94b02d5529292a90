//! Recording input driver for tests.
//!
//! Allows tests to push synthetic captured events without OS hooks and to
//! inspect everything the engine injected.

use std::sync::{Arc, Mutex, PoisonError};

use kms_core::{InputPayload, ModifierFlags, MouseButton};
use tokio::sync::mpsc::{self, UnboundedSender};

use super::{CapturedInput, DriverError, InputDriver, PointerAction};

/// One call recorded by [`RecordingInputDriver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Injected {
    Key {
        keycode: u32,
        modifiers: ModifierFlags,
        down: bool,
    },
    Mouse {
        action: PointerAction,
        x: i32,
        y: i32,
        button: Option<MouseButton>,
        scroll: (i16, i16),
    },
    Pointer {
        x: i32,
        y: i32,
    },
}

/// An [`InputDriver`] that records injections and lets tests fake capture.
#[derive(Clone, Default)]
pub struct RecordingInputDriver {
    sender: Arc<Mutex<Option<UnboundedSender<CapturedInput>>>>,
    injected: Arc<Mutex<Vec<Injected>>>,
}

impl RecordingInputDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a synthetic event into the capture stream, as if it came from
    /// hardware.  Returns `false` if capture is not running.
    pub fn capture(&self, payload: InputPayload) -> bool {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(sender) => sender.send(CapturedInput::now(payload)).is_ok(),
            None => false,
        }
    }

    /// Returns every injection recorded so far, oldest first.
    pub fn injected(&self) -> Vec<Injected> {
        self.injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_capturing(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn record(&self, call: Injected) {
        self.injected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }
}

impl InputDriver for RecordingInputDriver {
    fn start_capture(&self) -> Result<mpsc::UnboundedReceiver<CapturedInput>, DriverError> {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Err(DriverError::AlreadyCapturing);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *guard = Some(tx);
        Ok(rx)
    }

    fn stop_capture(&self) {
        // Dropping the sender closes the stream.
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn inject_key(&self, keycode: u32, modifiers: ModifierFlags, down: bool) -> Result<(), DriverError> {
        self.record(Injected::Key {
            keycode,
            modifiers,
            down,
        });
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
        self.record(Injected::Mouse {
            action,
            x,
            y,
            button,
            scroll,
        });
        Ok(())
    }

    fn set_pointer(&self, x: i32, y: i32) -> Result<(), DriverError> {
        self.record(Injected::Pointer { x, y });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_capture_delivers_events_after_start() {
        // Arrange
        let driver = RecordingInputDriver::new();
        let mut rx = driver.start_capture().expect("start should succeed");

        // Act
        let sent = driver.capture(InputPayload::Move { x: 100, y: 200 });

        // Assert
        assert!(sent);
        let event = rx.recv().await.expect("should receive event");
        assert_eq!(event.payload, InputPayload::Move { x: 100, y: 200 });
    }

    #[test]
    fn test_capture_before_start_is_refused() {
        let driver = RecordingInputDriver::new();
        assert!(!driver.capture(InputPayload::Scroll { dx: 0, dy: 120 }));
    }

    #[tokio::test]
    async fn test_stop_capture_closes_stream() {
        // Arrange
        let driver = RecordingInputDriver::new();
        let mut rx = driver.start_capture().unwrap();

        // Act
        driver.stop_capture();

        // Assert
        assert!(rx.recv().await.is_none(), "stream should end after stop_capture()");
        assert!(!driver.is_capturing());
    }

    #[test]
    fn test_second_start_without_stop_is_rejected() {
        let driver = RecordingInputDriver::new();
        let _rx = driver.start_capture().unwrap();
        assert!(matches!(driver.start_capture(), Err(DriverError::AlreadyCapturing)));
    }

    #[test]
    fn test_injections_are_recorded_in_order() {
        // Arrange
        let driver = RecordingInputDriver::new();

        // Act
        driver.inject_key(0x04, ModifierFlags::default(), true).unwrap();
        driver.set_pointer(5, 6).unwrap();
        driver
            .inject_mouse(PointerAction::Scroll, 5, 6, None, (0, -120))
            .unwrap();

        // Assert
        let calls = driver.injected();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[0], Injected::Key { keycode: 0x04, down: true, .. }));
        assert_eq!(calls[1], Injected::Pointer { x: 5, y: 6 });
        assert!(matches!(calls[2], Injected::Mouse { scroll: (0, -120), .. }));
    }
}
