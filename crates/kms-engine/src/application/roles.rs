//! RoleCoordinator: keeps at most one live MASTER.
//!
//! All role mutation happens inside [`Registry::update`], so the check
//! "does someone else hold MASTER?" and the write that follows cannot be
//! interleaved with another request.  Broadcasting ROLE_CHANGE happens
//! after the lock is released and never waits on a session: each session
//! task has a bounded control channel and a full one is skipped.

use std::sync::Arc;

use kms_core::protocol::messages::RoleChangePayload;
use kms_core::{DeviceId, DeviceRole};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::registry::{Registry, SessionCommand};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RoleConflictError {
    #[error("device {holder} already holds MASTER")]
    MasterHeld { holder: DeviceId },

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
}

/// What an accepted request changed.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleOutcome {
    /// The device that held MASTER before, if it was another one.
    pub previous_master: Option<DeviceId>,
    /// `false` when the device already had the requested role.
    pub changed: bool,
}

pub struct RoleCoordinator {
    registry: Arc<Registry>,
}

impl RoleCoordinator {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Asks for `device` to take `role`.
    ///
    /// MASTER is refused while any other present device holds it.  A master
    /// that is no longer present is demoted to CLIENT.  An accepted MASTER
    /// change is announced to every ACTIVE session.
    ///
    /// # Errors
    ///
    /// [`RoleConflictError::MasterHeld`] naming the live master, or
    /// [`RoleConflictError::UnknownDevice`].
    pub fn request_role(&self, device: DeviceId, role: DeviceRole) -> Result<RoleOutcome, RoleConflictError> {
        let outcome = self.registry.update(|s| {
            let current = s.device(device).ok_or(RoleConflictError::UnknownDevice(device))?.role;

            if role != DeviceRole::Master {
                let target = s.device_mut(device).ok_or(RoleConflictError::UnknownDevice(device))?;
                target.role = role;
                return Ok(RoleOutcome {
                    previous_master: None,
                    changed: current != role,
                });
            }

            if let Some(holder) = s.all_devices().find(|d| d.is_master() && d.id != device && d.present) {
                return Err(RoleConflictError::MasterHeld { holder: holder.id });
            }

            let mut previous_master = None;
            for other in s.all_devices_mut().filter(|d| d.is_master() && d.id != device) {
                debug!(device_id = %other.id, "demoting absent master");
                other.role = DeviceRole::Client;
                previous_master = Some(other.id);
            }
            let target = s.device_mut(device).ok_or(RoleConflictError::UnknownDevice(device))?;
            target.role = DeviceRole::Master;
            Ok(RoleOutcome {
                previous_master,
                changed: current != DeviceRole::Master,
            })
        });

        match &outcome {
            Ok(o) if role == DeviceRole::Master && o.changed => {
                info!(master = %device, previous = ?o.previous_master, "MASTER role granted");
                self.broadcast(RoleChangePayload {
                    master_device_id: device,
                    previous_master_id: o.previous_master,
                });
            }
            Ok(o) => debug!(%device, %role, changed = o.changed, "role request accepted"),
            Err(e) => warn!(%device, %role, reason = %e, "role request rejected"),
        }
        outcome
    }

    /// Applies a ROLE_CHANGE received from a peer.  Nothing is rebroadcast.
    ///
    /// # Errors
    ///
    /// [`RoleConflictError::MasterHeld`] when this device is master and the
    /// peer did not name it as the previous master, i.e. the peer acted on a
    /// stale view.  [`RoleConflictError::UnknownDevice`] when the new master
    /// is not in the registry.
    pub fn apply_remote(&self, change: &RoleChangePayload) -> Result<(), RoleConflictError> {
        let new_master = change.master_device_id;
        self.registry.update(|s| {
            if s.device(new_master).is_none() {
                return Err(RoleConflictError::UnknownDevice(new_master));
            }
            if s.local.is_master() && s.local.id != new_master && change.previous_master_id != Some(s.local.id) {
                return Err(RoleConflictError::MasterHeld { holder: s.local.id });
            }
            for other in s.all_devices_mut().filter(|d| d.is_master() && d.id != new_master) {
                other.role = DeviceRole::Client;
            }
            if let Some(target) = s.device_mut(new_master) {
                target.role = DeviceRole::Master;
            }
            Ok(())
        })?;
        info!(master = %new_master, previous = ?change.previous_master_id, "applied remote role change");
        Ok(())
    }

    pub fn current_master(&self) -> Option<DeviceId> {
        self.registry.master().map(|d| d.id)
    }

    fn broadcast(&self, change: RoleChangePayload) {
        for entry in self.registry.active_sessions() {
            if let Err(e) = entry.control.try_send(SessionCommand::RoleChange(change.clone())) {
                warn!(session_id = %entry.session.id, error = %e, "could not queue ROLE_CHANGE");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use kms_core::{Device, DeviceOs, Session, SessionState};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn device(role: DeviceRole) -> Device {
        let mut d = Device::local(Uuid::new_v4(), "node", DeviceOs::Windows, 2, Utc::now()).unwrap();
        d.role = role;
        d
    }

    fn setup(local_role: DeviceRole) -> (RoleCoordinator, Arc<Registry>) {
        let registry = Arc::new(Registry::new(device(local_role)));
        (RoleCoordinator::new(Arc::clone(&registry)), registry)
    }

    fn present_masters(registry: &Registry) -> usize {
        registry
            .devices()
            .iter()
            .filter(|d| d.is_master() && d.present)
            .count()
    }

    #[test]
    fn test_master_granted_when_none_exists() {
        // Arrange
        let (roles, registry) = setup(DeviceRole::Unassigned);

        // Act
        let outcome = roles.request_role(registry.local_id(), DeviceRole::Master).unwrap();

        // Assert
        assert!(outcome.changed);
        assert_eq!(roles.current_master(), Some(registry.local_id()));
    }

    #[test]
    fn test_repeated_master_request_is_idempotent() {
        let (roles, registry) = setup(DeviceRole::Master);

        let outcome = roles.request_role(registry.local_id(), DeviceRole::Master).unwrap();

        assert!(!outcome.changed);
        assert_eq!(present_masters(&registry), 1);
    }

    #[test]
    fn test_master_refused_while_another_present_master_exists() {
        // Arrange
        let (roles, registry) = setup(DeviceRole::Unassigned);
        let peer = device(DeviceRole::Master);
        registry.observe_peer(peer.clone(), Utc::now());

        // Act
        let result = roles.request_role(registry.local_id(), DeviceRole::Master);

        // Assert
        assert_eq!(result, Err(RoleConflictError::MasterHeld { holder: peer.id }));
        assert_eq!(registry.local_device().role, DeviceRole::Unassigned);
    }

    #[test]
    fn test_absent_master_is_demoted_when_role_is_taken() {
        // Arrange
        let (roles, registry) = setup(DeviceRole::Unassigned);
        let peer = device(DeviceRole::Master);
        registry.observe_peer(peer.clone(), Utc::now());
        registry.mark_gone(peer.id);

        // Act
        let outcome = roles.request_role(registry.local_id(), DeviceRole::Master).unwrap();

        // Assert
        assert_eq!(outcome.previous_master, Some(peer.id));
        assert_eq!(registry.device(peer.id).unwrap().role, DeviceRole::Client);
        assert_eq!(present_masters(&registry), 1);
    }

    #[test]
    fn test_any_number_of_clients_allowed() {
        let (roles, registry) = setup(DeviceRole::Client);
        let peers: Vec<Device> = (0..3).map(|_| device(DeviceRole::Unassigned)).collect();
        for p in &peers {
            registry.observe_peer(p.clone(), Utc::now());
        }

        for p in &peers {
            assert!(roles.request_role(p.id, DeviceRole::Client).is_ok());
        }
        assert_eq!(
            registry.devices().iter().filter(|d| d.role == DeviceRole::Client).count(),
            4
        );
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let (roles, _) = setup(DeviceRole::Unassigned);
        let id = Uuid::new_v4();
        assert_eq!(
            roles.request_role(id, DeviceRole::Client),
            Err(RoleConflictError::UnknownDevice(id))
        );
    }

    #[tokio::test]
    async fn test_accepted_master_change_is_sent_to_active_sessions() {
        // Arrange
        let (roles, registry) = setup(DeviceRole::Unassigned);
        let (tx, mut rx) = mpsc::channel(4);
        let mut session = Session::new(Uuid::new_v4(), registry.local_id(), Uuid::new_v4(), Utc::now()).unwrap();
        session.transition(SessionState::Active, Utc::now()).unwrap();
        registry.insert_session(session, tx);

        // Act
        roles.request_role(registry.local_id(), DeviceRole::Master).unwrap();

        // Assert
        match rx.try_recv() {
            Ok(SessionCommand::RoleChange(change)) => {
                assert_eq!(change.master_device_id, registry.local_id());
                assert_eq!(change.previous_master_id, None);
            }
            other => panic!("expected RoleChange, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_change_demotes_previous_master() {
        // Arrange
        let (roles, registry) = setup(DeviceRole::Master);
        let peer = device(DeviceRole::Client);
        registry.observe_peer(peer.clone(), Utc::now());

        // Act
        roles
            .apply_remote(&RoleChangePayload {
                master_device_id: peer.id,
                previous_master_id: Some(registry.local_id()),
            })
            .unwrap();

        // Assert
        assert_eq!(registry.local_device().role, DeviceRole::Client);
        assert_eq!(roles.current_master(), Some(peer.id));
    }

    #[test]
    fn test_remote_change_on_stale_view_is_refused() {
        let (roles, registry) = setup(DeviceRole::Master);
        let peer = device(DeviceRole::Client);
        registry.observe_peer(peer.clone(), Utc::now());

        let result = roles.apply_remote(&RoleChangePayload {
            master_device_id: peer.id,
            previous_master_id: None,
        });

        assert!(matches!(result, Err(RoleConflictError::MasterHeld { .. })));
        assert_eq!(roles.current_master(), Some(registry.local_id()));
    }
}
