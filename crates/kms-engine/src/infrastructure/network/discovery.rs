//! UDP broadcast implementation of [`DiscoveryTransport`].
//!
//! Every engine binds a UDP socket on the discovery port (default 19998) and
//! broadcasts its record there.  Every engine on the LAN therefore hears every
//! other one, its own broadcasts included (the presence directory ignores
//! those).
//!
//! # How UDP discovery works (for beginners)
//!
//! UDP is connectionless and does not guarantee delivery, ordering or
//! duplicate prevention.  That is fine here: a record is re-broadcast every
//! few seconds, so a lost datagram only delays discovery, and a duplicate
//! only refreshes `last_seen`.
//!
//! 1. `announce` sends `{"kind":"announce","metadata":{...}}` to the
//!    broadcast address.
//! 2. `browse` spawns a receive task that turns each datagram into a
//!    [`DiscoveryNotice`], tagging it with the sender's IP so the record's
//!    `port` can be turned into a session address.
//! 3. `unannounce` sends a final `withdraw` datagram so peers mark this device
//!    gone without waiting for the liveness window.
//!
//! Datagrams that are not valid JSON or that exceed [`MAX_DATAGRAM`] are
//! logged at `debug` and dropped.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::presence::{DiscoveryError, DiscoveryNotice, DiscoveryTransport, Metadata};

/// Default UDP discovery port.
pub const DEFAULT_DISCOVERY_PORT: u16 = 19998;

/// Largest datagram accepted; records are a few hundred bytes.
pub const MAX_DATAGRAM: usize = 4096;

/// Notices buffered between the receive task and the presence directory.
const NOTICE_CAPACITY: usize = 64;

/// Wire form of one discovery datagram.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum Datagram {
    Announce { metadata: Metadata },
    Withdraw { metadata: Metadata },
}

fn encode_datagram(datagram: &Datagram) -> Result<Vec<u8>, DiscoveryError> {
    serde_json::to_vec(datagram).map_err(|e| DiscoveryError::Transport(e.to_string()))
}

fn decode_datagram(bytes: &[u8], source: IpAddr) -> Option<DiscoveryNotice> {
    match serde_json::from_slice::<Datagram>(bytes) {
        Ok(Datagram::Announce { metadata }) => Some(DiscoveryNotice::Announced { metadata, source }),
        Ok(Datagram::Withdraw { metadata }) => Some(DiscoveryNotice::Withdrawn { metadata }),
        Err(e) => {
            debug!(%source, error = %e, "ignoring undecodable discovery datagram");
            None
        }
    }
}

pub struct UdpDiscoveryTransport {
    socket: Arc<UdpSocket>,
    target: SocketAddr,
    published: Mutex<Option<Metadata>>,
    cancel: CancellationToken,
}

impl UdpDiscoveryTransport {
    /// Binds `0.0.0.0:port` and broadcasts to `255.255.255.255:port`.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Io`] if the socket cannot be bound or configured.
    pub async fn bind(port: u16) -> Result<Self, DiscoveryError> {
        let bind = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
        let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), port);
        Self::bind_to(bind, target).await
    }

    /// Binds `bind` and sends records to `target`, which may be unicast.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Io`] if the socket cannot be bound or configured.
    pub async fn bind_to(bind: SocketAddr, target: SocketAddr) -> Result<Self, DiscoveryError> {
        let socket = UdpSocket::bind(bind).await?;
        if let IpAddr::V4(ip) = target.ip() {
            if ip.is_broadcast() {
                socket.set_broadcast(true)?;
            }
        }
        info!(local = %socket.local_addr()?, %target, "discovery socket bound");
        Ok(Self {
            socket: Arc::new(socket),
            target,
            published: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    /// The socket's bound address.
    ///
    /// # Errors
    ///
    /// [`DiscoveryError::Io`] if the OS cannot report it.
    pub fn local_addr(&self) -> Result<SocketAddr, DiscoveryError> {
        Ok(self.socket.local_addr()?)
    }

    async fn send(&self, datagram: &Datagram) -> Result<(), DiscoveryError> {
        let bytes = encode_datagram(datagram)?;
        self.socket.send_to(&bytes, self.target).await?;
        Ok(())
    }
}

impl Drop for UdpDiscoveryTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl DiscoveryTransport for UdpDiscoveryTransport {
    async fn announce(&self, metadata: &Metadata) -> Result<(), DiscoveryError> {
        self.send(&Datagram::Announce {
            metadata: metadata.clone(),
        })
        .await?;
        *self.published.lock().unwrap_or_else(PoisonError::into_inner) = Some(metadata.clone());
        Ok(())
    }

    async fn unannounce(&self) -> Result<(), DiscoveryError> {
        let published = self
            .published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match published {
            Some(metadata) => self.send(&Datagram::Withdraw { metadata }).await,
            None => Ok(()),
        }
    }

    async fn browse(&self) -> Result<mpsc::Receiver<DiscoveryNotice>, DiscoveryError> {
        let (tx, rx) = mpsc::channel(NOTICE_CAPACITY);
        let socket = Arc::clone(&self.socket);
        let cancel = self.cancel.clone();
        tokio::spawn(async move { receive_loop(socket, tx, cancel).await });
        Ok(rx)
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, tx: mpsc::Sender<DiscoveryNotice>, cancel: CancellationToken) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, src) = tokio::select! {
            _ = cancel.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "discovery recv error");
                    continue;
                }
            },
        };
        let Some(notice) = decode_datagram(&buf[..len], src.ip()) else {
            continue;
        };
        if tx.send(notice).await.is_err() {
            // Receiver dropped: the directory stopped browsing.
            break;
        }
    }
    debug!("discovery receive loop stopped");
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn metadata() -> Metadata {
        [("deviceId", "3f0c"), ("displayName", "Desk"), ("port", "19999")]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_datagram_uses_kind_tag() {
        let bytes = encode_datagram(&Datagram::Announce { metadata: metadata() }).unwrap();

        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(json["kind"], "announce");
        assert_eq!(json["metadata"]["displayName"], "Desk");
    }

    #[test]
    fn test_withdraw_datagram_decodes_to_withdrawn_notice() {
        // Arrange
        let bytes = encode_datagram(&Datagram::Withdraw { metadata: metadata() }).unwrap();

        // Act
        let notice = decode_datagram(&bytes, "10.0.0.2".parse().unwrap());

        // Assert
        assert_eq!(notice, Some(DiscoveryNotice::Withdrawn { metadata: metadata() }));
    }

    #[test]
    fn test_garbage_datagram_is_dropped() {
        assert_eq!(decode_datagram(b"\x00\x01not json", "10.0.0.2".parse().unwrap()), None);
        assert_eq!(decode_datagram(br#"{"kind":"hello"}"#, "10.0.0.2".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn test_announce_reaches_browsing_peer_with_source_ip() {
        // Arrange
        let listener = UdpDiscoveryTransport::bind_to(loopback(), loopback()).await.unwrap();
        let target = listener.local_addr().unwrap();
        let speaker = UdpDiscoveryTransport::bind_to(loopback(), target).await.unwrap();
        let mut notices = listener.browse().await.unwrap();

        // Act
        speaker.announce(&metadata()).await.unwrap();
        let notice = tokio::time::timeout(Duration::from_secs(2), notices.recv()).await.unwrap();

        // Assert
        assert_eq!(
            notice,
            Some(DiscoveryNotice::Announced {
                metadata: metadata(),
                source: "127.0.0.1".parse().unwrap(),
            })
        );
    }

    #[tokio::test]
    async fn test_unannounce_sends_withdraw_once() {
        // Arrange
        let listener = UdpDiscoveryTransport::bind_to(loopback(), loopback()).await.unwrap();
        let speaker = UdpDiscoveryTransport::bind_to(loopback(), listener.local_addr().unwrap())
            .await
            .unwrap();
        let mut notices = listener.browse().await.unwrap();
        speaker.announce(&metadata()).await.unwrap();

        // Act
        speaker.unannounce().await.unwrap();
        speaker.unannounce().await.unwrap();

        // Assert
        let first = tokio::time::timeout(Duration::from_secs(2), notices.recv()).await.unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), notices.recv()).await.unwrap();
        assert!(matches!(first, Some(DiscoveryNotice::Announced { .. })));
        assert!(matches!(second, Some(DiscoveryNotice::Withdrawn { .. })));
        assert!(tokio::time::timeout(Duration::from_millis(100), notices.recv()).await.is_err());
    }
}
