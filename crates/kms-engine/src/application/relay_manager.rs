//! RelayManager: fans the master's capture stream out to every client.
//!
//! One [`EventRelay`] exists per ACTIVE session.  The manager only holds the
//! handles; it never touches a relay's queue beyond the non-blocking
//! [`EventRelay::enqueue`], so dispatching from the capture path costs one
//! short read lock and N `try_send`s.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use kms_core::{DeviceId, InputEvent, InputPayload, SessionId};
use tracing::{debug, info};

use super::relay::{EventRelay, RelayMetricsSnapshot};

/// Per-relay line of [`RelayManager::metrics_summary`].
#[derive(Debug, Clone, PartialEq)]
pub struct RelaySummary {
    pub session_id: SessionId,
    pub client_id: DeviceId,
    pub metrics: RelayMetricsSnapshot,
}

#[derive(Default)]
pub struct RelayManager {
    relays: RwLock<HashMap<SessionId, Arc<EventRelay>>>,
}

impl RelayManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `relay`.  Returns `false` if its session already has one.
    pub fn add_relay(&self, relay: Arc<EventRelay>) -> bool {
        let mut relays = self.relays.write().unwrap_or_else(PoisonError::into_inner);
        if relays.contains_key(&relay.session_id()) {
            return false;
        }
        info!(session_id = %relay.session_id(), client = %relay.client_id(), "relay registered");
        relays.insert(relay.session_id(), relay);
        true
    }

    /// Unregisters and returns the relay for `session_id`.  The caller stops it.
    pub fn remove_relay(&self, session_id: SessionId) -> Option<Arc<EventRelay>> {
        self.relays
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&session_id)
    }

    /// Enqueues `event` on the relays serving `target`.  Returns how many accepted it.
    pub fn dispatch(&self, target: DeviceId, event: &InputEvent) -> usize {
        let relays = self.relays.read().unwrap_or_else(PoisonError::into_inner);
        relays
            .values()
            .filter(|r| r.client_id() == target)
            .filter(|r| r.enqueue(event.retarget(target)))
            .count()
    }

    /// Clones `event` to every relay.  Returns how many accepted it.
    pub fn broadcast(&self, event: &InputEvent) -> usize {
        self.broadcast_with(event, |_, payload| payload)
    }

    /// Clones `event` to every relay, with `localize` rewriting the payload
    /// for each client.  Returns how many accepted it.
    pub fn broadcast_with(
        &self,
        event: &InputEvent,
        localize: impl Fn(DeviceId, InputPayload) -> InputPayload,
    ) -> usize {
        let relays = self.relays.read().unwrap_or_else(PoisonError::into_inner);
        relays
            .values()
            .filter(|r| {
                let mut copy = event.retarget(r.client_id());
                copy.payload = localize(r.client_id(), event.payload);
                r.enqueue(copy)
            })
            .count()
    }

    pub fn has_client(&self, client: DeviceId) -> bool {
        self.relays
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|r| r.client_id() == client)
    }

    pub fn len(&self) -> usize {
        self.relays.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics_summary(&self) -> Vec<RelaySummary> {
        let relays = self.relays.read().unwrap_or_else(PoisonError::into_inner);
        let mut summary: Vec<RelaySummary> = relays
            .values()
            .map(|r| RelaySummary {
                session_id: r.session_id(),
                client_id: r.client_id(),
                metrics: r.metrics(),
            })
            .collect();
        summary.sort_by_key(|s| s.client_id);
        summary
    }

    /// Stops and removes every relay.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<EventRelay>> = self
            .relays
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, r)| r)
            .collect();
        for relay in &drained {
            relay.stop().await;
        }
        debug!(stopped = drained.len(), "relay manager shut down");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::relay::{BatchSink, RelayConfig, RelayError};
    use async_trait::async_trait;
    use chrono::Utc;
    use kms_core::protocol::SequenceCounter;
    use kms_core::InputPayload;
    use uuid::Uuid;

    struct NullSink;

    #[async_trait]
    impl BatchSink for NullSink {
        async fn send_batch(&self, _sequence: u64, _events: &[InputEvent]) -> Result<usize, RelayError> {
            Ok(0)
        }
    }

    fn make_relay(client: DeviceId) -> Arc<EventRelay> {
        Arc::new(EventRelay::new(
            Uuid::new_v4(),
            client,
            RelayConfig::default(),
            Arc::new(NullSink),
            Arc::new(SequenceCounter::new()),
        ))
    }

    fn event() -> InputEvent {
        InputEvent::new(Uuid::new_v4(), InputPayload::Scroll { dx: 0, dy: -1 }, 0, Utc::now())
    }

    #[test]
    fn test_add_relay_is_idempotent_per_session() {
        let manager = RelayManager::new();
        let relay = make_relay(Uuid::new_v4());

        assert!(manager.add_relay(Arc::clone(&relay)));
        assert!(!manager.add_relay(relay));
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn test_broadcast_clones_event_to_every_relay() {
        // Arrange
        let manager = RelayManager::new();
        for _ in 0..3 {
            manager.add_relay(make_relay(Uuid::new_v4()));
        }

        // Act
        let delivered = manager.broadcast(&event());

        // Assert
        assert_eq!(delivered, 3);
        assert!(manager.metrics_summary().iter().all(|s| s.metrics.received == 1));
    }

    #[test]
    fn test_dispatch_reaches_only_the_target_client() {
        // Arrange
        let manager = RelayManager::new();
        let target = Uuid::new_v4();
        manager.add_relay(make_relay(target));
        manager.add_relay(make_relay(Uuid::new_v4()));

        // Act
        let delivered = manager.dispatch(target, &event());

        // Assert
        assert_eq!(delivered, 1);
        let summary = manager.metrics_summary();
        let received: u64 = summary.iter().map(|s| s.metrics.received).sum();
        assert_eq!(received, 1);
        assert!(manager.has_client(target));
    }

    #[tokio::test]
    async fn test_remove_then_shutdown_leaves_manager_empty() {
        let manager = RelayManager::new();
        let relay = make_relay(Uuid::new_v4());
        let session = relay.session_id();
        manager.add_relay(relay);
        manager.add_relay(make_relay(Uuid::new_v4()));

        let removed = manager.remove_relay(session);
        manager.shutdown().await;

        assert!(removed.is_some());
        assert!(manager.is_empty());
    }
}
