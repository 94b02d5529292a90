//! In-process discovery bus.
//!
//! A [`LoopbackBus`] stands in for the LAN: every [`LoopbackDiscovery`]
//! transport created from the same bus hears every other one.  The bus also
//! remembers the records currently published, so a transport that starts
//! browsing late still learns about engines that announced earlier (the way
//! an mDNS cache would).
//!
//! Used by integration tests and for running several engines on one host.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::application::presence::{DiscoveryError, DiscoveryNotice, DiscoveryTransport, Metadata};

const NOTICE_CAPACITY: usize = 64;

#[derive(Default)]
struct BusState {
    next_id: usize,
    /// Currently published record per transport id.
    published: HashMap<usize, Metadata>,
    browsers: Vec<mpsc::Sender<DiscoveryNotice>>,
}

impl BusState {
    fn deliver(&mut self, notice: &DiscoveryNotice) {
        self.browsers.retain(|tx| match tx.try_send(notice.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("loopback browser is full; notice dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }
}

/// Shared medium for [`LoopbackDiscovery`] transports.
#[derive(Clone, Default)]
pub struct LoopbackBus {
    state: Arc<Mutex<BusState>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport whose announcements appear to come from `127.0.0.1`.
    pub fn transport(&self) -> LoopbackDiscovery {
        self.transport_from(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    /// A transport whose announcements appear to come from `source`.
    pub fn transport_from(&self, source: IpAddr) -> LoopbackDiscovery {
        let id = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.next_id += 1;
            state.next_id
        };
        LoopbackDiscovery {
            bus: self.clone(),
            id,
            source,
        }
    }

    /// Number of records currently published on the bus.
    pub fn published_count(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .published
            .len()
    }
}

pub struct LoopbackDiscovery {
    bus: LoopbackBus,
    id: usize,
    source: IpAddr,
}

#[async_trait]
impl DiscoveryTransport for LoopbackDiscovery {
    async fn announce(&self, metadata: &Metadata) -> Result<(), DiscoveryError> {
        let mut state = self.bus.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.published.insert(self.id, metadata.clone());
        state.deliver(&DiscoveryNotice::Announced {
            metadata: metadata.clone(),
            source: self.source,
        });
        Ok(())
    }

    async fn unannounce(&self) -> Result<(), DiscoveryError> {
        let mut state = self.bus.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(metadata) = state.published.remove(&self.id) {
            state.deliver(&DiscoveryNotice::Withdrawn { metadata });
        }
        Ok(())
    }

    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveryNotice>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(NOTICE_CAPACITY);
        let mut state = self.bus.state.lock().unwrap_or_else(PoisonError::into_inner);
        for metadata in state.published.values() {
            let notice = DiscoveryNotice::Announced {
                metadata: metadata.clone(),
                source: self.source,
            };
            if tx.try_send(notice).is_err() {
                break;
            }
        }
        state.browsers.push(tx);
        Ok(rx)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
