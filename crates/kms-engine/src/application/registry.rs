//! The Device and Session registry.
//!
//! [`Registry`] is the single owner of every known [`Device`] and every live
//! [`Session`].  Callers never get a mutable reference to either map: they
//! receive clones, and all mutation goes through methods that take the one
//! coarse lock for a short critical section.  No lock is ever held across an
//! `.await`.
//!
//! # Device lifecycle (for beginners)
//!
//! ```text
//!   first announce ──► present ──(no announce within window)──► not present
//!                        ▲                                          │
//!                        └──────────────(announces again)───────────┘
//! ```
//!
//! Device records are never deleted.  A peer that goes quiet keeps its role
//! and its id so it can reconnect without the user doing anything.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kms_core::protocol::messages::RoleChangePayload;
use kms_core::{Device, DeviceId, DeviceRole, Session, SessionId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Maximum number of devices tracked, the local one included.
pub const MAX_DEVICES: usize = 16;

/// Instruction delivered to a session's protocol task.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionCommand {
    /// Tell the peer that mastership moved.
    RoleChange(RoleChangePayload),
    /// Send GOODBYE and end the session.
    Close { reason: String },
}

/// A registered session together with the handle used to steer its task.
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub session: Session,
    pub control: mpsc::Sender<SessionCommand>,
}

/// What [`Registry::observe_peer`] did with an announcement.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    /// A device never seen before was recorded.
    Added(Device),
    /// A known device that had gone quiet is present again.
    Returned(Device),
    /// A present device now announces a different address.
    AddressChanged {
        device: Device,
        previous: Option<SocketAddr>,
    },
    /// Nothing changed except `last_seen`.
    Refreshed,
    /// The registry is full; the announcement was ignored.
    Full,
    /// The announcement carried the local device's id.
    SelfAnnouncement,
}

/// Mutable registry contents; only reachable through [`Registry::update`].
#[derive(Debug)]
pub(crate) struct RegistryState {
    pub(crate) local: Device,
    pub(crate) peers: BTreeMap<DeviceId, Device>,
    pub(crate) sessions: HashMap<SessionId, SessionEntry>,
}

impl RegistryState {
    pub(crate) fn all_devices(&self) -> impl Iterator<Item = &Device> {
        std::iter::once(&self.local).chain(self.peers.values())
    }

    pub(crate) fn all_devices_mut(&mut self) -> impl Iterator<Item = &mut Device> {
        std::iter::once(&mut self.local).chain(self.peers.values_mut())
    }

    pub(crate) fn device(&self, id: DeviceId) -> Option<&Device> {
        if id == self.local.id {
            Some(&self.local)
        } else {
            self.peers.get(&id)
        }
    }

    pub(crate) fn device_mut(&mut self, id: DeviceId) -> Option<&mut Device> {
        if id == self.local.id {
            Some(&mut self.local)
        } else {
            self.peers.get_mut(&id)
        }
    }

    pub(crate) fn master(&self) -> Option<&Device> {
        self.all_devices().find(|d| d.role == DeviceRole::Master)
    }
}

/// Owning registry of devices and sessions.
#[derive(Debug)]
pub struct Registry {
    inner: Mutex<RegistryState>,
}

impl Registry {
    /// Creates a registry containing only `local`, which is always present.
    pub fn new(mut local: Device) -> Self {
        local.present = true;
        Self {
            inner: Mutex::new(RegistryState {
                local,
                peers: BTreeMap::new(),
                sessions: HashMap::new(),
            }),
        }
    }

    /// Runs `f` under the registry lock.
    ///
    /// `f` must not block; it is the serialization point for role changes.
    pub(crate) fn update<R>(&self, f: impl FnOnce(&mut RegistryState) -> R) -> R {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut state)
    }

    pub fn local_id(&self) -> DeviceId {
        self.update(|s| s.local.id)
    }

    pub fn local_device(&self) -> Device {
        self.update(|s| s.local.clone())
    }

    /// Snapshot of every known device, the local one included, ordered by id.
    pub fn devices(&self) -> Vec<Device> {
        let mut devices: Vec<Device> = self.update(|s| s.all_devices().cloned().collect());
        devices.sort_by_key(|d| d.id);
        devices
    }

    /// Snapshot of every known peer, ordered by id.
    pub fn peers(&self) -> Vec<Device> {
        self.update(|s| s.peers.values().cloned().collect())
    }

    pub fn device(&self, id: DeviceId) -> Option<Device> {
        self.update(|s| s.device(id).cloned())
    }

    /// The device currently holding MASTER, present or not.
    pub fn master(&self) -> Option<Device> {
        self.update(|s| s.master().cloned())
    }

    // ── Presence ──────────────────────────────────────────────────────────────

    /// Records an announcement from a peer.
    ///
    /// `announced` carries the fields from the discovery record.  Its role is
    /// kept only for a brand-new device, and only if that cannot produce a
    /// second MASTER; after that, roles change only through the role
    /// coordinator.
    pub fn observe_peer(&self, announced: Device, now: DateTime<Utc>) -> Observation {
        self.update(|s| {
            if announced.id == s.local.id {
                return Observation::SelfAnnouncement;
            }

            if let Some(known) = s.peers.get_mut(&announced.id) {
                let was_present = known.present;
                let previous = known.address;
                known.display_name = announced.display_name;
                known.os = announced.os;
                known.protocol_version = announced.protocol_version;
                known.address = announced.address;
                known.present = true;
                known.last_seen = now;

                return if !was_present {
                    Observation::Returned(known.clone())
                } else if previous != known.address {
                    Observation::AddressChanged {
                        device: known.clone(),
                        previous,
                    }
                } else {
                    Observation::Refreshed
                };
            }

            if s.peers.len() + 1 >= MAX_DEVICES {
                warn!(device_id = %announced.id, max = MAX_DEVICES, "device limit reached; ignoring peer");
                return Observation::Full;
            }

            let mut device = announced;
            if device.role == DeviceRole::Master && s.master().is_some() {
                debug!(device_id = %device.id, "peer announces MASTER but one is already known; recording UNASSIGNED");
                device.role = DeviceRole::Unassigned;
            }
            device.present = true;
            device.last_seen = now;
            s.peers.insert(device.id, device.clone());
            Observation::Added(device)
        })
    }

    /// Marks a peer not-present, returning it if it was present before.
    pub fn mark_gone(&self, id: DeviceId) -> Option<Device> {
        self.update(|s| {
            let device = s.peers.get_mut(&id)?;
            if !device.present {
                return None;
            }
            device.present = false;
            Some(device.clone())
        })
    }

    /// Marks every peer not heard from within `window` as not-present and
    /// returns those that changed.
    pub fn sweep(&self, now: DateTime<Utc>, window: Duration) -> Vec<Device> {
        self.update(|s| {
            s.peers
                .values_mut()
                .filter(|d| d.present)
                .filter(|d| match (now - d.last_seen).to_std() {
                    Ok(age) => age > window,
                    Err(_) => false,
                })
                .map(|d| {
                    d.present = false;
                    d.clone()
                })
                .collect()
        })
    }

    // ── Sessions ──────────────────────────────────────────────────────────────

    /// Registers an established session.
    ///
    /// An existing session for the same (master, client) pair is removed and
    /// returned so the caller can close it.
    pub fn insert_session(&self, session: Session, control: mpsc::Sender<SessionCommand>) -> Option<SessionEntry> {
        self.update(|s| {
            let superseded_id = s
                .sessions
                .values()
                .find(|e| e.session.id != session.id && e.session.same_pair(&session))
                .map(|e| e.session.id);
            let superseded = superseded_id.and_then(|id| s.sessions.remove(&id));
            s.sessions.insert(session.id, SessionEntry { session, control });
            superseded
        })
    }

    pub fn remove_session(&self, id: SessionId) -> Option<SessionEntry> {
        self.update(|s| s.sessions.remove(&id))
    }

    pub fn session(&self, id: SessionId) -> Option<Session> {
        self.update(|s| s.sessions.get(&id).map(|e| e.session.clone()))
    }

    /// Snapshot of every ACTIVE session.
    pub fn active_sessions(&self) -> Vec<SessionEntry> {
        self.update(|s| {
            s.sessions
                .values()
                .filter(|e| e.session.is_active())
                .cloned()
                .collect()
        })
    }

    /// Refreshes the heartbeat timestamp of a session.
    pub fn touch_session(&self, id: SessionId, now: DateTime<Utc>) {
        self.update(|s| {
            if let Some(entry) = s.sessions.get_mut(&id) {
                entry.session.last_heartbeat_at = now;
            }
        })
    }

    /// Records the last batch sequence stamped on a session.
    pub fn record_sequence(&self, id: SessionId, sequence: u64) {
        self.update(|s| {
            if let Some(entry) = s.sessions.get_mut(&id) {
                entry.session.event_sequence = entry.session.event_sequence.max(sequence);
            }
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
