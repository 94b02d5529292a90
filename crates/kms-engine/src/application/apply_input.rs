//! ApplyInputUseCase: injects input batches received from the master.
//!
//! Each INPUT_BATCH carries one sequence number.  Batches are checked with a
//! [`SequenceTracker`] before anything is injected:
//!
//! - in order, or after a gap: applied (lost batches are not replayed);
//! - equal to the last applied sequence: a retry of a batch that already
//!   landed, dropped;
//! - lower than the last applied sequence: stale, dropped.
//!
//! Applied sequences are therefore non-decreasing.  Consecutive MOVE events
//! to the same position are collapsed before they reach the driver.

use std::sync::Arc;

use kms_core::protocol::{SequenceCheck, SequenceTracker};
use kms_core::{DeviceId, InputEvent, InputPayload};
use tracing::{debug, warn};

use crate::infrastructure::input_driver::{DriverError, InputDriver, PointerAction};

/// Result of [`ApplyInputUseCase::apply_batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub check: SequenceCheck,
    /// Events handed to the driver without error.
    pub applied: usize,
}

/// Filters duplicate consecutive pointer positions.
#[derive(Debug, Default)]
struct DedupFilter {
    last_mouse_pos: Option<(i32, i32)>,
}

impl DedupFilter {
    fn should_send_mouse_move(&mut self, x: i32, y: i32) -> bool {
        if self.last_mouse_pos == Some((x, y)) {
            return false;
        }
        self.last_mouse_pos = Some((x, y));
        true
    }

    fn reset(&mut self) {
        self.last_mouse_pos = None;
    }
}

pub struct ApplyInputUseCase {
    local_id: DeviceId,
    driver: Arc<dyn InputDriver>,
    tracker: SequenceTracker,
    dedup: DedupFilter,
}

impl ApplyInputUseCase {
    pub fn new(local_id: DeviceId, driver: Arc<dyn InputDriver>) -> Self {
        Self {
            local_id,
            driver,
            tracker: SequenceTracker::new(),
            dedup: DedupFilter::default(),
        }
    }

    /// Last applied batch sequence.
    pub fn last_sequence(&self) -> Option<u64> {
        self.tracker.last()
    }

    /// Checks `sequence` and injects `events` if the batch is accepted.
    ///
    /// Events addressed to another device are skipped.  A failed injection is
    /// logged and the rest of the batch still runs.
    pub fn apply_batch(&mut self, sequence: u64, events: &[InputEvent]) -> ApplyOutcome {
        let check = self.tracker.observe(sequence);
        match check {
            SequenceCheck::InOrder => {}
            SequenceCheck::Gap { expected, got } => {
                warn!(expected, got, "input batches lost, continuing from newer batch");
            }
            SequenceCheck::Duplicate(seq) => {
                debug!(sequence = seq, "duplicate input batch dropped");
                return ApplyOutcome { check, applied: 0 };
            }
            SequenceCheck::Stale { last, got } => {
                debug!(last, got, "stale input batch dropped");
                return ApplyOutcome { check, applied: 0 };
            }
        }

        let mut applied = 0;
        for event in events {
            if event.target_device_id != self.local_id {
                debug!(target = %event.target_device_id, "event for another device skipped");
                continue;
            }
            match self.apply(&event.payload) {
                Ok(true) => applied += 1,
                Ok(false) => {}
                Err(e) => warn!(sequence, kind = %event.kind(), error = %e, "input injection failed"),
            }
        }
        ApplyOutcome { check, applied }
    }

    /// Forgets sequence and pointer state, e.g. when a new session starts.
    pub fn reset(&mut self) {
        self.tracker = SequenceTracker::new();
        self.dedup.reset();
    }

    /// Returns `Ok(false)` when the event was filtered out.
    fn apply(&mut self, payload: &InputPayload) -> Result<bool, DriverError> {
        match *payload {
            InputPayload::KeyPress { keycode, modifiers } => self.driver.inject_key(keycode, modifiers, true)?,
            InputPayload::KeyRelease { keycode, modifiers } => self.driver.inject_key(keycode, modifiers, false)?,
            InputPayload::Move { x, y } => {
                if !self.dedup.should_send_mouse_move(x, y) {
                    return Ok(false);
                }
                self.driver.inject_mouse(PointerAction::Move, x, y, None, (0, 0))?;
            }
            InputPayload::ButtonDown { button, x, y } => {
                self.dedup.should_send_mouse_move(x, y);
                self.driver
                    .inject_mouse(PointerAction::ButtonDown, x, y, Some(button), (0, 0))?;
            }
            InputPayload::ButtonUp { button, x, y } => {
                self.dedup.should_send_mouse_move(x, y);
                self.driver
                    .inject_mouse(PointerAction::ButtonUp, x, y, Some(button), (0, 0))?;
            }
            InputPayload::Scroll { dx, dy } => {
                let (x, y) = self.dedup.last_mouse_pos.unwrap_or((0, 0));
                self.driver.inject_mouse(PointerAction::Scroll, x, y, None, (dx, dy))?;
            }
        }
        Ok(true)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::input_driver::mock::{Injected, RecordingInputDriver};
    use crate::infrastructure::input_driver::MockInputDriver;
    use chrono::Utc;
    use kms_core::{ModifierFlags, MouseButton};
    use uuid::Uuid;

    fn setup() -> (ApplyInputUseCase, RecordingInputDriver, DeviceId) {
        let driver = RecordingInputDriver::new();
        let local = Uuid::new_v4();
        (ApplyInputUseCase::new(local, Arc::new(driver.clone())), driver, local)
    }

    fn event(target: DeviceId, payload: InputPayload) -> InputEvent {
        InputEvent::new(Uuid::new_v4(), payload, 0, Utc::now()).retarget(target)
    }

    #[test]
    fn test_key_press_and_release_are_injected() {
        // Arrange
        let (mut uc, driver, local) = setup();
        let modifiers = ModifierFlags(ModifierFlags::LEFT_SHIFT);
        let batch = [
            event(local, InputPayload::KeyPress { keycode: 0x04, modifiers }),
            event(local, InputPayload::KeyRelease { keycode: 0x04, modifiers }),
        ];

        // Act
        let outcome = uc.apply_batch(1, &batch);

        // Assert
        assert_eq!(outcome.applied, 2);
        assert_eq!(
            driver.injected(),
            vec![
                Injected::Key { keycode: 0x04, modifiers, down: true },
                Injected::Key { keycode: 0x04, modifiers, down: false },
            ]
        );
    }

    #[test]
    fn test_repeated_move_to_same_position_is_collapsed() {
        let (mut uc, driver, local) = setup();
        let batch = [
            event(local, InputPayload::Move { x: 10, y: 20 }),
            event(local, InputPayload::Move { x: 10, y: 20 }),
            event(local, InputPayload::Move { x: 11, y: 20 }),
        ];

        let outcome = uc.apply_batch(1, &batch);

        assert_eq!(outcome.applied, 2);
        assert_eq!(driver.injected().len(), 2);
    }

    #[test]
    fn test_button_and_scroll_map_to_pointer_actions() {
        // Arrange
        let (mut uc, driver, local) = setup();
        let batch = [
            event(local, InputPayload::ButtonDown { button: MouseButton::Left, x: 5, y: 6 }),
            event(local, InputPayload::Scroll { dx: 0, dy: -3 }),
        ];

        // Act
        uc.apply_batch(1, &batch);

        // Assert
        assert_eq!(
            driver.injected(),
            vec![
                Injected::Mouse {
                    action: PointerAction::ButtonDown,
                    x: 5,
                    y: 6,
                    button: Some(MouseButton::Left),
                    scroll: (0, 0),
                },
                Injected::Mouse {
                    action: PointerAction::Scroll,
                    x: 5,
                    y: 6,
                    button: None,
                    scroll: (0, -3),
                },
            ]
        );
    }

    #[test]
    fn test_duplicate_and_stale_batches_are_dropped() {
        // Arrange
        let (mut uc, driver, local) = setup();
        let batch = [event(local, InputPayload::Scroll { dx: 1, dy: 0 })];
        uc.apply_batch(5, &batch);

        // Act
        let duplicate = uc.apply_batch(5, &batch);
        let stale = uc.apply_batch(4, &batch);

        // Assert
        assert_eq!(duplicate.check, SequenceCheck::Duplicate(5));
        assert_eq!(stale.check, SequenceCheck::Stale { last: 5, got: 4 });
        assert_eq!((duplicate.applied, stale.applied), (0, 0));
        assert_eq!(driver.injected().len(), 1);
        assert_eq!(uc.last_sequence(), Some(5));
    }

    #[test]
    fn test_gap_is_logged_and_batch_applied() {
        let (mut uc, _, local) = setup();
        let batch = [event(local, InputPayload::Scroll { dx: 1, dy: 0 })];
        uc.apply_batch(1, &batch);

        let outcome = uc.apply_batch(4, &batch);

        assert_eq!(outcome.check, SequenceCheck::Gap { expected: 2, got: 4 });
        assert_eq!(outcome.applied, 1);
    }

    #[test]
    fn test_events_for_other_devices_are_skipped() {
        let (mut uc, driver, _) = setup();

        let outcome = uc.apply_batch(1, &[event(Uuid::new_v4(), InputPayload::Move { x: 1, y: 1 })]);

        assert_eq!(outcome.applied, 0);
        assert!(driver.injected().is_empty());
    }

    #[test]
    fn test_reset_accepts_lower_sequence_again() {
        let (mut uc, _, local) = setup();
        let batch = [event(local, InputPayload::Move { x: 1, y: 1 })];
        uc.apply_batch(9, &batch);

        uc.reset();
        let outcome = uc.apply_batch(1, &batch);

        assert_eq!(outcome.check, SequenceCheck::InOrder);
        assert_eq!(outcome.applied, 1);
    }

    #[test]
    fn test_injection_failure_does_not_stop_the_batch() {
        // Arrange
        let mut driver = MockInputDriver::new();
        driver
            .expect_inject_key()
            .times(1)
            .returning(|_, _, _| Err(DriverError::InjectionFailed("denied".into())));
        driver
            .expect_inject_mouse()
            .times(1)
            .returning(|_, _, _, _, _| Ok(()));
        let local = Uuid::new_v4();
        let mut uc = ApplyInputUseCase::new(local, Arc::new(driver));
        let batch = [
            event(
                local,
                InputPayload::KeyPress {
                    keycode: 0x29,
                    modifiers: ModifierFlags::default(),
                },
            ),
            event(local, InputPayload::Move { x: 3, y: 4 }),
        ];

        // Act
        let outcome = uc.apply_batch(1, &batch);

        // Assert
        assert_eq!(outcome.applied, 1);
    }
}
