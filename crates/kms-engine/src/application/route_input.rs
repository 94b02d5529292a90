//! RouteInputUseCase: decides where each locally captured event goes.
//!
//! This use case is the heart of the master side.  It receives captured
//! input from the [`InputDriver`], asks the [`CursorMapper`] whether the
//! pointer crossed onto another screen, and hands events for remote screens
//! to the [`RelayManager`].
//!
//! # Routing modes
//!
//! - [`RoutingMode::FollowPointer`]: every event goes to the device whose
//!   screen currently holds the pointer.  Events for the local screen are
//!   left alone (the OS already delivered them).
//! - [`RoutingMode::Mirror`]: every event is cloned to all clients.  A
//!   pointer keeps its offset from the master screen's top-left corner,
//!   clamped to each client's screen.
//!
//! # Coordinates
//!
//! The driver reports pointer samples in layout space.  Events sent to a
//! client carry coordinates local to that client's screen.
//!
//! Nothing here awaits: [`RouteInputUseCase::handle`] only calls the
//! non-blocking relay enqueue, so it is safe on the capture path.

use std::sync::Arc;
use std::time::Instant;

use kms_core::protocol::SequenceCounter;
use kms_core::{CursorMapper, DeviceId, InputEvent, InputPayload, Layout, LayoutSet};
use tracing::{debug, info, warn};

use super::relay_manager::RelayManager;
use crate::infrastructure::input_driver::{CapturedInput, InputDriver};

/// Which machine currently holds the pointer and keyboard focus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActiveTarget {
    /// Input stays on this machine.
    #[default]
    Local,
    /// Input is routed to the given client.
    Remote(DeviceId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RoutingMode {
    #[default]
    FollowPointer,
    Mirror,
}

pub struct RouteInputUseCase {
    local_id: DeviceId,
    layouts: LayoutSet,
    mapper: CursorMapper,
    active: ActiveTarget,
    mode: RoutingMode,
    sharing_enabled: bool,
    relays: Arc<RelayManager>,
    driver: Arc<dyn InputDriver>,
    sequence: SequenceCounter,
}

impl RouteInputUseCase {
    pub fn new(
        local_id: DeviceId,
        layouts: LayoutSet,
        mapper: CursorMapper,
        relays: Arc<RelayManager>,
        driver: Arc<dyn InputDriver>,
    ) -> Self {
        Self {
            local_id,
            layouts,
            mapper,
            active: ActiveTarget::Local,
            mode: RoutingMode::FollowPointer,
            sharing_enabled: true,
            relays,
            driver,
            sequence: SequenceCounter::starting_at(1),
        }
    }

    pub fn active_target(&self) -> ActiveTarget {
        self.active
    }

    pub fn mode(&self) -> RoutingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RoutingMode) {
        if self.mode != mode {
            info!(?mode, "routing mode changed");
            self.mode = mode;
            self.release_to_local();
        }
    }

    /// Disabling sharing returns focus to the local machine.
    pub fn set_sharing_enabled(&mut self, enabled: bool) {
        self.sharing_enabled = enabled;
        if !enabled {
            self.release_to_local();
        }
    }

    /// Replaces the screen arrangement.  Focus returns home if the device
    /// holding it no longer has a screen.
    pub fn update_layout(&mut self, layouts: LayoutSet) {
        self.layouts = layouts;
        self.mapper.reset();
        if let ActiveTarget::Remote(id) = self.active {
            if !self.layouts.contains_device(id) {
                self.release_to_local();
            }
        }
        debug!(screens = self.layouts.len(), "layout updated");
    }

    /// Called when the session with `client` ends.
    pub fn client_disconnected(&mut self, client: DeviceId) {
        if self.active == ActiveTarget::Remote(client) {
            info!(%client, "focused client disconnected, returning to local screen");
            self.release_to_local();
        }
    }

    /// Routes one captured event.  Returns how many relays accepted it.
    pub fn handle(&mut self, captured: CapturedInput, now: Instant) -> usize {
        if !self.sharing_enabled {
            return 0;
        }
        if self.mode == RoutingMode::Mirror {
            let event = self.event(captured);
            let master = self.layouts.get(self.local_id);
            return self.relays.broadcast_with(&event, |client, payload| {
                mirror_position(master, self.layouts.get(client), payload)
            });
        }

        let payload = match captured.payload {
            InputPayload::Move { x, y } => match self.track_pointer(x, y, now) {
                Some(payload) => payload,
                None => return 0,
            },
            other => other,
        };

        let ActiveTarget::Remote(target) = self.active else {
            return 0;
        };
        let payload = match (payload, self.layouts.get(target)) {
            (p, Some(layout)) => match p.position() {
                Some((x, y)) => {
                    let (cx, cy) = layout.clamp(x, y);
                    let (lx, ly) = layout.to_local(cx, cy);
                    p.with_position(lx, ly)
                }
                None => p,
            },
            (p, None) => p,
        };

        let event = self.event(CapturedInput {
            payload,
            timestamp: captured.timestamp,
        });
        let delivered = self.relays.dispatch(target, &event);
        if delivered == 0 {
            debug!(%target, kind = %event.kind(), "event not accepted by any relay");
        }
        delivered
    }

    /// Feeds a pointer sample through the mapper and updates focus.
    ///
    /// Returns the layout-space MOVE to forward, or `None` when focus is on
    /// the local screen.
    fn track_pointer(&mut self, x: i32, y: i32, now: Instant) -> Option<InputPayload> {
        let owner = match self.active {
            ActiveTarget::Local => self.local_id,
            ActiveTarget::Remote(id) => id,
        };
        let mut mapping = match self.mapper.map(&self.layouts, owner, x, y, now) {
            Ok(mapping) => mapping,
            Err(e) => {
                debug!(error = %e, "pointer sample outside any known screen");
                return None;
            }
        };

        if mapping.transitioned && mapping.target != self.local_id && !self.relays.has_client(mapping.target) {
            debug!(target = %mapping.target, "no session for adjacent screen, transition ignored");
            self.mapper.reset();
            let (cx, cy) = self
                .layouts
                .get(owner)
                .map_or((x, y), |layout| layout.clamp(x, y));
            mapping.target = owner;
            mapping.x = cx;
            mapping.y = cy;
            mapping.transitioned = false;
        }

        if mapping.transitioned {
            info!(from = %owner, to = %mapping.target, edge = ?mapping.edge, "pointer moved to another screen");
            self.active = if mapping.target == self.local_id {
                ActiveTarget::Local
            } else {
                ActiveTarget::Remote(mapping.target)
            };
            if let Err(e) = self.driver.set_pointer(mapping.x, mapping.y) {
                warn!(error = %e, "could not warp local pointer");
            }
        }

        match self.active {
            ActiveTarget::Local => None,
            ActiveTarget::Remote(_) => Some(InputPayload::Move {
                x: mapping.x,
                y: mapping.y,
            }),
        }
    }

    fn release_to_local(&mut self) {
        self.active = ActiveTarget::Local;
        self.mapper.reset();
    }

    fn event(&self, captured: CapturedInput) -> InputEvent {
        InputEvent::new(self.local_id, captured.payload, self.sequence.next(), captured.timestamp)
    }
}

/// Re-expresses a pointer position on the master's screen as the same
/// offset on `client`'s screen.  Without a client layout the offset is sent
/// unclamped.
fn mirror_position(master: Option<&Layout>, client: Option<&Layout>, payload: InputPayload) -> InputPayload {
    let (Some((x, y)), Some(master)) = (payload.position(), master) else {
        return payload;
    };
    let (dx, dy) = master.to_local(x, y);
    let Some(client) = client else {
        return payload.with_position(dx, dy);
    };
    let (cx, cy) = client.clamp(client.x.saturating_add(dx), client.y.saturating_add(dy));
    let (lx, ly) = client.to_local(cx, cy);
    payload.with_position(lx, ly)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::relay::{BatchSink, EventRelay, RelayConfig, RelayError};
    use crate::infrastructure::input_driver::mock::{Injected, RecordingInputDriver};
    use async_trait::async_trait;
    use kms_core::{CursorConfig, Layout, ModifierFlags};
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    struct NullSink;

    #[async_trait]
    impl BatchSink for NullSink {
        async fn send_batch(&self, _sequence: u64, _events: &[InputEvent]) -> Result<usize, RelayError> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<InputEvent>>,
    }

    #[async_trait]
    impl BatchSink for CollectingSink {
        async fn send_batch(&self, _sequence: u64, events: &[InputEvent]) -> Result<usize, RelayError> {
            self.events.lock().unwrap().extend_from_slice(events);
            Ok(events.len())
        }
    }

    struct Fixture {
        router: RouteInputUseCase,
        relays: Arc<RelayManager>,
        driver: RecordingInputDriver,
        local: DeviceId,
        right: DeviceId,
    }

    /// Local 1920x1080 at the origin, a client screen directly to its right.
    fn fixture(with_relay: bool) -> Fixture {
        let local = Uuid::new_v4();
        let right = Uuid::new_v4();
        let layouts = LayoutSet::new(vec![
            Layout::new(local, 0, 0, 1920, 1080),
            Layout::new(right, 1920, 0, 1920, 1080),
        ])
        .unwrap();
        let relays = Arc::new(RelayManager::new());
        if with_relay {
            relays.add_relay(null_relay(right));
        }
        let driver = RecordingInputDriver::new();
        let router = RouteInputUseCase::new(
            local,
            layouts,
            CursorMapper::new(CursorConfig::default()),
            Arc::clone(&relays),
            Arc::new(driver.clone()),
        );
        Fixture {
            router,
            relays,
            driver,
            local,
            right,
        }
    }

    fn null_relay(client: DeviceId) -> Arc<EventRelay> {
        Arc::new(EventRelay::new(
            Uuid::new_v4(),
            client,
            RelayConfig::default(),
            Arc::new(NullSink),
            Arc::new(SequenceCounter::new()),
        ))
    }

    fn mv(x: i32, y: i32) -> CapturedInput {
        CapturedInput::now(InputPayload::Move { x, y })
    }

    fn key() -> CapturedInput {
        CapturedInput::now(InputPayload::KeyPress {
            keycode: 0x04,
            modifiers: ModifierFlags::default(),
        })
    }

    fn received(relays: &RelayManager) -> u64 {
        relays.metrics_summary().iter().map(|s| s.metrics.received).sum()
    }

    #[test]
    fn test_events_stay_local_while_pointer_is_on_local_screen() {
        // Arrange
        let mut f = fixture(true);

        // Act
        let moved = f.router.handle(mv(500, 500), Instant::now());
        let typed = f.router.handle(key(), Instant::now());

        // Assert
        assert_eq!((moved, typed), (0, 0));
        assert_eq!(f.router.active_target(), ActiveTarget::Local);
        assert_eq!(received(&f.relays), 0);
    }

    #[test]
    fn test_crossing_right_edge_moves_focus_and_warps_pointer() {
        // Arrange
        let mut f = fixture(true);

        // Act
        let delivered = f.router.handle(mv(1919, 540), Instant::now());

        // Assert
        assert_eq!(delivered, 1);
        assert_eq!(f.router.active_target(), ActiveTarget::Remote(f.right));
        assert_eq!(f.driver.injected(), vec![Injected::Pointer { x: 1920, y: 540 }]);
    }

    #[test]
    fn test_keys_follow_focus_after_transition() {
        let mut f = fixture(true);
        let now = Instant::now();
        f.router.handle(mv(1919, 540), now);

        let delivered = f.router.handle(key(), now);

        assert_eq!(delivered, 1);
        assert_eq!(received(&f.relays), 2);
    }

    #[test]
    fn test_transition_without_session_is_ignored() {
        // Arrange
        let mut f = fixture(false);

        // Act
        let delivered = f.router.handle(mv(1919, 540), Instant::now());

        // Assert
        assert_eq!(delivered, 0);
        assert_eq!(f.router.active_target(), ActiveTarget::Local);
        assert!(f.driver.injected().is_empty());
    }

    #[test]
    fn test_pointer_returns_home_across_left_edge() {
        // Arrange
        let mut f = fixture(true);
        let start = Instant::now();
        f.router.handle(mv(1919, 540), start);

        // Act
        let after_cooldown = start + Duration::from_millis(200);
        f.router.handle(mv(1921, 300), after_cooldown);

        // Assert
        assert_eq!(f.router.active_target(), ActiveTarget::Local);
        assert_eq!(f.driver.injected().last(), Some(&Injected::Pointer { x: 1920, y: 300 }));
    }

    #[test]
    fn test_disabling_sharing_returns_focus_home() {
        let mut f = fixture(true);
        f.router.handle(mv(1919, 540), Instant::now());

        f.router.set_sharing_enabled(false);

        assert_eq!(f.router.active_target(), ActiveTarget::Local);
        assert_eq!(f.router.handle(key(), Instant::now()), 0);
    }

    #[test]
    fn test_layout_update_without_focused_screen_releases_focus() {
        // Arrange
        let mut f = fixture(true);
        f.router.handle(mv(1919, 540), Instant::now());
        let only_local = LayoutSet::new(vec![Layout::new(f.local, 0, 0, 1920, 1080)]).unwrap();

        // Act
        f.router.update_layout(only_local);

        // Assert
        assert_eq!(f.router.active_target(), ActiveTarget::Local);
    }

    #[test]
    fn test_disconnect_of_focused_client_releases_focus() {
        let mut f = fixture(true);
        f.router.handle(mv(1919, 540), Instant::now());

        f.router.client_disconnected(f.right);

        assert_eq!(f.router.active_target(), ActiveTarget::Local);
    }

    #[test]
    fn test_mirror_mode_broadcasts_to_every_client() {
        // Arrange
        let mut f = fixture(true);
        f.relays.add_relay(null_relay(Uuid::new_v4()));
        f.router.set_mode(RoutingMode::Mirror);

        // Act
        let delivered = f.router.handle(key(), Instant::now());

        // Assert
        assert_eq!(delivered, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forwarded_moves_use_client_local_coordinates() {
        // Arrange
        let mut f = fixture(false);
        let sink = Arc::new(CollectingSink::default());
        let relay = Arc::new(EventRelay::new(
            Uuid::new_v4(),
            f.right,
            RelayConfig::default(),
            Arc::clone(&sink) as Arc<dyn BatchSink>,
            Arc::new(SequenceCounter::new()),
        ));
        relay.start();
        f.relays.add_relay(Arc::clone(&relay));

        // Act
        let now = Instant::now();
        f.router.handle(mv(1919, 540), now);
        f.router.handle(mv(2100, 600), now);
        tokio::time::sleep(Duration::from_millis(100)).await;
        relay.stop().await;

        // Assert
        let events = sink.events.lock().unwrap().clone();
        let positions: Vec<_> = events.iter().filter_map(|e| e.payload.position()).collect();
        assert_eq!(positions, vec![(0, 540), (180, 600)]);
        assert!(events.iter().all(|e| e.target_device_id == f.right));
        assert!(events[0].sequence < events[1].sequence);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mirror_mode_sends_each_client_its_own_coordinates() {
        // Arrange
        let mut f = fixture(false);
        let below = Uuid::new_v4();
        f.router.update_layout(
            LayoutSet::new(vec![
                Layout::new(f.local, 0, 0, 1920, 1080),
                Layout::new(f.right, 1920, 0, 1920, 1080),
                Layout::new(below, 0, 1080, 1280, 720),
            ])
            .unwrap(),
        );
        let mut sinks = Vec::new();
        let mut relays = Vec::new();
        for client in [f.right, below] {
            let sink = Arc::new(CollectingSink::default());
            let relay = Arc::new(EventRelay::new(
                Uuid::new_v4(),
                client,
                RelayConfig::default(),
                Arc::clone(&sink) as Arc<dyn BatchSink>,
                Arc::new(SequenceCounter::new()),
            ));
            relay.start();
            f.relays.add_relay(Arc::clone(&relay));
            sinks.push(sink);
            relays.push(relay);
        }
        f.router.set_mode(RoutingMode::Mirror);

        // Act
        let delivered = f.router.handle(mv(1500, 600), Instant::now());
        f.router.handle(key(), Instant::now());
        tokio::time::sleep(Duration::from_millis(100)).await;
        for relay in &relays {
            relay.stop().await;
        }

        // Assert
        assert_eq!(delivered, 2);
        let right = sinks[0].events.lock().unwrap().clone();
        let small = sinks[1].events.lock().unwrap().clone();
        assert_eq!(right[0].payload.position(), Some((1500, 600)));
        assert_eq!(small[0].payload.position(), Some((1280, 600)));
        assert_eq!(right[1].payload, small[1].payload);
        assert!(right.iter().all(|e| e.target_device_id == f.right));
        assert!(small.iter().all(|e| e.target_device_id == below));
        assert!(f.driver.injected().is_empty());
    }
}
