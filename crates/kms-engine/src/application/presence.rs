//! PresenceDirectory: who is on the network right now.
//!
//! The directory publishes this device on a [`DiscoveryTransport`], consumes
//! what other devices publish, and keeps the [`Registry`] in sync with it.
//!
//! # Liveness (for beginners)
//!
//! Discovery records are re-sent every `announce_interval`.  A background
//! sweep runs every `sweep_interval` and marks any peer that has not been
//! heard from for `liveness_window` as not-present.  The peer stays in the
//! registry, so when it announces again it simply comes back, keeping its id
//! and its role.
//!
//! Consumers do not register callbacks; they call [`PresenceDirectory::subscribe`]
//! and read [`PresenceEvent`]s from a bounded channel.  A slow or dropped
//! subscriber never delays the others: a full channel loses that one event,
//! a closed channel is pruned.

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kms_core::domain::device::validate_display_name;
use kms_core::{Device, DeviceId, DeviceOs, DeviceRole};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::{Observation, Registry};

/// Metadata map carried by a discovery record.
pub type Metadata = BTreeMap<String, String>;

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised while publishing or interpreting discovery records.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery record is missing {0}")]
    MissingField(&'static str),

    #[error("discovery record has invalid {field}: {value:?}")]
    InvalidField { field: &'static str, value: String },

    #[error("discovery transport failed: {0}")]
    Transport(String),

    #[error("discovery I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Record ────────────────────────────────────────────────────────────────────

/// Typed view of the `{deviceId, displayName, os, version, role, port}` record.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub device_id: DeviceId,
    pub display_name: String,
    pub os: DeviceOs,
    pub version: u32,
    pub role: DeviceRole,
    pub port: u16,
}

impl PresenceRecord {
    pub fn for_device(device: &Device, port: u16) -> Self {
        Self {
            device_id: device.id,
            display_name: device.display_name.clone(),
            os: device.os,
            version: device.protocol_version,
            role: device.role,
            port,
        }
    }

    pub fn to_metadata(&self) -> Metadata {
        let mut m = Metadata::new();
        m.insert("deviceId".into(), self.device_id.to_string());
        m.insert("displayName".into(), self.display_name.clone());
        m.insert("os".into(), self.os.as_str().into());
        m.insert("version".into(), self.version.to_string());
        m.insert("role".into(), self.role.as_str().into());
        m.insert("port".into(), self.port.to_string());
        m
    }

    /// Parses a record, rejecting anything partial or malformed.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::MissingField`] or [`DiscoveryError::InvalidField`]
    /// naming the first offending key.
    pub fn from_metadata(metadata: &Metadata) -> Result<Self, DiscoveryError> {
        let device_id = field(metadata, "deviceId")?;
        let display_name = field(metadata, "displayName")?;
        let os = field(metadata, "os")?;
        let version = field(metadata, "version")?;
        let role = field(metadata, "role")?;
        let port = field(metadata, "port")?;

        if validate_display_name(display_name).is_err() {
            return Err(invalid("displayName", display_name));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port", port))?;
        if port == 0 {
            return Err(invalid("port", "0"));
        }

        Ok(Self {
            device_id: device_id.parse().map_err(|_| invalid("deviceId", device_id))?,
            display_name: display_name.to_string(),
            os: os.parse().map_err(|_| invalid("os", os))?,
            version: version.parse().map_err(|_| invalid("version", version))?,
            role: role.parse().map_err(|_| invalid("role", role))?,
            port,
        })
    }

    /// Builds the device record announced from `source`.
    pub fn to_device(&self, source: IpAddr, now: DateTime<Utc>) -> Device {
        Device {
            id: self.device_id,
            display_name: self.display_name.clone(),
            os: self.os,
            role: self.role,
            address: Some(SocketAddr::new(source, self.port)),
            protocol_version: self.version,
            present: true,
            last_seen: now,
        }
    }
}

fn field<'a>(metadata: &'a Metadata, name: &'static str) -> Result<&'a str, DiscoveryError> {
    metadata
        .get(name)
        .map(String::as_str)
        .filter(|v| !v.is_empty())
        .ok_or(DiscoveryError::MissingField(name))
}

fn invalid(field: &'static str, value: &str) -> DiscoveryError {
    DiscoveryError::InvalidField {
        field,
        value: value.to_string(),
    }
}

// ── Transport port ────────────────────────────────────────────────────────────

/// A record seen on the discovery transport.
#[derive(Debug, Clone, PartialEq)]
pub enum DiscoveryNotice {
    Announced { metadata: Metadata, source: IpAddr },
    Withdrawn { metadata: Metadata },
}

/// The discovery service the directory publishes on and browses.
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Publishes (or re-publishes) this device's record.
    async fn announce(&self, metadata: &Metadata) -> Result<(), DiscoveryError>;

    /// Withdraws this device's record.
    async fn unannounce(&self) -> Result<(), DiscoveryError>;

    /// Starts browsing; notices arrive on the returned channel.
    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveryNotice>, DiscoveryError>;
}

// ── Events and config ─────────────────────────────────────────────────────────

/// Change in the set of known peers.
#[derive(Debug, Clone, PartialEq)]
pub enum PresenceEvent {
    /// A peer was discovered, or came back after going offline.
    PeerAdded(Device),
    /// A peer withdrew its record.
    PeerRemoved(Device),
    /// A peer was not heard from within the liveness window.
    PeerWentOffline(Device),
    PeerAddressChanged {
        device: Device,
        previous: Option<SocketAddr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceConfig {
    pub liveness_window: Duration,
    pub sweep_interval: Duration,
    pub announce_interval: Duration,
    /// Buffered events per subscriber.
    pub subscriber_capacity: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            liveness_window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            announce_interval: Duration::from_secs(15),
            subscriber_capacity: 64,
        }
    }
}

// ── Directory ─────────────────────────────────────────────────────────────────

pub struct PresenceDirectory {
    registry: Arc<Registry>,
    transport: Arc<dyn DiscoveryTransport>,
    config: PresenceConfig,
    subscribers: Mutex<Vec<mpsc::Sender<PresenceEvent>>>,
    /// Session port of the published record, once announced.
    announced_port: Mutex<Option<u16>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PresenceDirectory {
    pub fn new(registry: Arc<Registry>, transport: Arc<dyn DiscoveryTransport>, config: PresenceConfig) -> Self {
        Self {
            registry,
            transport,
            config,
            subscribers: Mutex::new(Vec::new()),
            announced_port: Mutex::new(None),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Publishes `device` as reachable on `port`.  Once [`start`](Self::start)
    /// has run the record is rebuilt from the registry and re-sent every
    /// `announce_interval`, so later role changes reach peers.
    ///
    /// # Errors
    ///
    /// Whatever the transport reports for the first publication.
    pub async fn announce(&self, device: &Device, port: u16) -> Result<(), DiscoveryError> {
        let metadata = PresenceRecord::for_device(device, port).to_metadata();
        self.transport.announce(&metadata).await?;
        *self.announced_port.lock().unwrap_or_else(PoisonError::into_inner) = Some(port);
        info!(device_id = %device.id, port, role = %device.role, "announced on discovery transport");
        Ok(())
    }

    /// Registers a new subscriber.
    pub fn subscribe(&self) -> mpsc::Receiver<PresenceEvent> {
        let (tx, rx) = mpsc::channel(self.config.subscriber_capacity.max(1));
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Every known peer, present or not.  The local device is excluded.
    pub fn list_known(&self) -> Vec<Device> {
        self.registry.peers()
    }

    /// Starts browsing and spawns the liveness / re-announce loop.
    ///
    /// # Errors
    ///
    /// Whatever the transport reports when browsing starts.
    pub async fn start(self: &Arc<Self>) -> Result<(), DiscoveryError> {
        let notices = self.transport.browse().await?;
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run(notices).await });
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        Ok(())
    }

    async fn run(&self, mut notices: mpsc::Receiver<DiscoveryNotice>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut refresh = tokio::time::interval(self.config.announce_interval);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval completes immediately.
        refresh.tick().await;
        let mut browsing = true;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                notice = notices.recv(), if browsing => match notice {
                    Some(notice) => {
                        self.handle_notice(notice, Utc::now());
                    }
                    None => {
                        warn!("discovery browse channel closed; only liveness sweeps remain");
                        browsing = false;
                    }
                },
                _ = sweep.tick() => {
                    self.sweep(Utc::now());
                }
                _ = refresh.tick() => self.refresh().await,
            }
        }
        debug!("presence loop stopped");
    }

    async fn refresh(&self) {
        let port = *self.announced_port.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(port) = port {
            let metadata = PresenceRecord::for_device(&self.registry.local_device(), port).to_metadata();
            if let Err(e) = self.transport.announce(&metadata).await {
                warn!(error = %e, "failed to refresh discovery record");
            }
        }
    }

    /// Applies one discovery notice to the registry and notifies subscribers.
    ///
    /// Malformed records are logged and dropped.
    pub fn handle_notice(&self, notice: DiscoveryNotice, now: DateTime<Utc>) -> Option<PresenceEvent> {
        let event = match notice {
            DiscoveryNotice::Announced { metadata, source } => {
                let record = match PresenceRecord::from_metadata(&metadata) {
                    Ok(record) => record,
                    Err(e) => {
                        debug!(%source, error = %e, "dropping malformed discovery record");
                        return None;
                    }
                };
                match self.registry.observe_peer(record.to_device(source, now), now) {
                    Observation::Added(device) => {
                        info!(device_id = %device.id, name = %device.display_name, "peer discovered");
                        PresenceEvent::PeerAdded(device)
                    }
                    Observation::Returned(device) => {
                        info!(device_id = %device.id, "peer is back");
                        PresenceEvent::PeerAdded(device)
                    }
                    Observation::AddressChanged { device, previous } => {
                        info!(device_id = %device.id, ?previous, address = ?device.address, "peer address changed");
                        PresenceEvent::PeerAddressChanged { device, previous }
                    }
                    Observation::Refreshed | Observation::Full | Observation::SelfAnnouncement => return None,
                }
            }
            DiscoveryNotice::Withdrawn { metadata } => {
                let Some(id) = metadata.get("deviceId").and_then(|v| v.parse::<DeviceId>().ok()) else {
                    warn!("dropping withdrawal without a valid deviceId");
                    return None;
                };
                let device = self.registry.mark_gone(id)?;
                info!(device_id = %device.id, "peer withdrew");
                PresenceEvent::PeerRemoved(device)
            }
        };
        self.publish(&event);
        Some(event)
    }

    /// Marks stale peers not-present and emits `PeerWentOffline` for each.
    pub fn sweep(&self, now: DateTime<Utc>) -> Vec<Device> {
        let gone = self.registry.sweep(now, self.config.liveness_window);
        for device in &gone {
            info!(device_id = %device.id, "peer went offline");
            self.publish(&PresenceEvent::PeerWentOffline(device.clone()));
        }
        gone
    }

    fn publish(&self, event: &PresenceEvent) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("presence subscriber is full; event dropped for it");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Stops the background loop and withdraws this device's record.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }

        let was_announced = self
            .announced_port
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if was_announced {
            if let Err(e) = self.transport.unannounce().await {
                warn!(error = %e, "failed to withdraw discovery record");
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
