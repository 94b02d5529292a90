//! PairingProtocol: turns a raw connection into an authenticated [`Session`].
//!
//! # Handshake (for beginners)
//!
//! ```text
//!  initiator                                    responder
//!  ─────────                                    ─────────
//!  magic + X25519 key  ───────────────────────► magic + X25519 key
//!        (both sides derive AES-256-GCM keys; everything below is encrypted)
//!  HELLO  ────────────────────────────────────►  lockout? version? self? master?
//!         ◄──────────────────────────────────── HELLO
//!         ◄──────────────────────────────────── ACK (resumed)      valid resume token
//!         ◄──────────────────────────────────── CHALLENGE (nonce)  otherwise
//!  CHALLENGE_RESPONSE (proof) ────────────────►  constant-time compare
//!         ◄──────────────────────────────────── ACK  or  ERROR
//! ```
//!
//! The proof is `sha256(passphraseHash ‖ nonce ‖ channelBinding ‖ initiatorId)`.
//! The passphrase itself never leaves the machine, and because the channel
//! binding is mixed in, a proof captured on one connection is useless on any
//! other.
//!
//! Repeated failures from one IP address lock that address out for a while,
//! even if a later attempt carries the right passphrase.
//!
//! # Session master
//!
//! The HELLO roles nominate a master (see [`resolve_roles`]), but the
//! nomination only stands if the local registry agrees: no other present
//! device may hold MASTER, and a device recorded as CLIENT never leads.  Once
//! the peer is authenticated the master is confirmed through the
//! [`RoleCoordinator`], which promotes it when nobody holds the role yet.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use kms_core::protocol::messages::{
    AckPayload, Capability, CapabilitySet, ChallengePayload, ChallengeResponsePayload, ErrorCode, ErrorPayload,
    HelloPayload, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION,
};
use kms_core::{Device, DeviceId, DeviceRole, Envelope, Message, ResumeToken, Session, SessionError, SessionState};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::registry::Registry;
use super::roles::{RoleConflictError, RoleCoordinator};
use crate::infrastructure::network::secure_channel::{ChannelError, SecureChannel, Side};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Passphrase failures.  These count toward (or are caused by) the lockout.
#[derive(Debug, Error, PartialEq)]
pub enum AuthError {
    #[error("passphrase mismatch; {attempts_remaining} attempt(s) remaining")]
    Mismatch { attempts_remaining: u32 },

    #[error("too many failed attempts; locked out for {retry_after_secs}s")]
    Lockout { retry_after_secs: u64 },

    #[error("no pairing passphrase is configured")]
    NotConfigured,
}

/// Everything else that can abort a handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("handshake step {step:?} timed out")]
    Timeout { step: &'static str },

    #[error("peer speaks protocol v{peer}; at least v{min} is required", min = MIN_PROTOCOL_VERSION)]
    VersionMismatch { peer: u32 },

    #[error("expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },

    #[error("peer rejected the handshake ({code:?}): {message}")]
    Rejected { code: ErrorCode, message: String },

    #[error("refusing to pair a device with itself")]
    SelfConnection,

    #[error("the devices cannot agree on a single MASTER")]
    RoleConflict,

    #[error("neither device may take the MASTER role")]
    NoMaster,

    #[error(transparent)]
    Role(#[from] RoleConflictError),

    #[error(transparent)]
    InvalidSession(#[from] SessionError),

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("peer sent a malformed {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Error)]
pub enum PairingError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Auth(#[from] AuthError),
}

impl From<ChannelError> for PairingError {
    fn from(e: ChannelError) -> Self {
        PairingError::Handshake(HandshakeError::Channel(e))
    }
}

impl From<SessionError> for PairingError {
    fn from(e: SessionError) -> Self {
        PairingError::Handshake(HandshakeError::InvalidSession(e))
    }
}

// ── Config ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PairingConfig {
    /// Consecutive mismatches allowed before the lockout starts.
    pub max_attempts: u32,
    pub lockout: Duration,
    /// Upper bound for every single handshake step.
    pub handshake_timeout: Duration,
    pub resume_ttl: Duration,
    /// Version advertised in HELLO.  Lower it to speak to older peers only.
    pub protocol_version: u32,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lockout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(30),
            resume_ttl: Duration::from_secs(24 * 60 * 60),
            protocol_version: PROTOCOL_VERSION,
        }
    }
}

// ── Attempt tracking ──────────────────────────────────────────────────────────

/// Per-IP lockout state.
#[derive(Debug, Default)]
struct LockoutEntry {
    failed_attempts: u32,
    locked_until: Option<Instant>,
}

/// Counts consecutive passphrase failures per peer IP.
#[derive(Debug)]
pub struct AttemptTracker {
    max_attempts: u32,
    lockout: Duration,
    entries: HashMap<IpAddr, LockoutEntry>,
}

impl AttemptTracker {
    pub fn new(max_attempts: u32, lockout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            lockout,
            entries: HashMap::new(),
        }
    }

    /// Fails with [`AuthError::Lockout`] while `ip` is locked out.
    pub fn check(&self, ip: IpAddr, now: Instant) -> Result<(), AuthError> {
        match self.entries.get(&ip).and_then(|e| e.locked_until) {
            Some(until) if now < until => {
                let left = until - now;
                // Round up so a client never retries a moment too early.
                let secs = left.as_secs() + u64::from(left.subsec_nanos() > 0);
                Err(AuthError::Lockout { retry_after_secs: secs })
            }
            _ => Ok(()),
        }
    }

    /// Records a mismatch and returns the attempts left before lockout.
    ///
    /// Reaching zero starts the lockout and resets the count.
    pub fn record_failure(&mut self, ip: IpAddr, now: Instant) -> u32 {
        let entry = self.entries.entry(ip).or_default();
        entry.failed_attempts += 1;
        let remaining = self.max_attempts.saturating_sub(entry.failed_attempts);
        if remaining == 0 {
            entry.locked_until = Some(now + self.lockout);
            entry.failed_attempts = 0;
            warn!(%ip, lockout_secs = self.lockout.as_secs(), "peer locked out after repeated passphrase failures");
        }
        remaining
    }

    pub fn record_success(&mut self, ip: IpAddr) {
        self.entries.remove(&ip);
    }

    /// Attempts left for `ip` before the next lockout.
    pub fn remaining(&self, ip: IpAddr) -> u32 {
        let used = self.entries.get(&ip).map_or(0, |e| e.failed_attempts);
        self.max_attempts.saturating_sub(used)
    }
}

// ── Resume tokens ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct IssuedToken {
    device: DeviceId,
    expires_at: Instant,
}

/// Both halves of session resumption: tokens this device issued as a
/// responder, and tokens it holds as an initiator.
#[derive(Debug)]
pub struct ResumeTokenStore {
    ttl: Duration,
    issued: HashMap<String, IssuedToken>,
    held: HashMap<SocketAddr, ResumeToken>,
}

impl ResumeTokenStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            issued: HashMap::new(),
            held: HashMap::new(),
        }
    }

    /// Issues a fresh token for `device`, revoking any earlier one.
    pub fn issue(&mut self, device: DeviceId, now: Instant) -> ResumeToken {
        self.issued.retain(|_, t| t.device != device && t.expires_at > now);
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        let value = hex::encode(bytes);
        self.issued.insert(
            value.clone(),
            IssuedToken {
                device,
                expires_at: now + self.ttl,
            },
        );
        ResumeToken::new(value)
    }

    /// Consumes `token` if it was issued to `device` and has not expired.
    pub fn redeem(&mut self, token: &ResumeToken, device: DeviceId, now: Instant) -> bool {
        match self.issued.remove(token.as_str()) {
            Some(issued) if issued.device == device && issued.expires_at > now => true,
            Some(issued) => {
                // A token presented by the wrong device is burnt anyway.
                debug!(owner = %issued.device, presenter = %device, "resume token rejected");
                false
            }
            None => false,
        }
    }

    pub fn remember(&mut self, peer: SocketAddr, token: ResumeToken) {
        self.held.insert(peer, token);
    }

    pub fn held_for(&self, peer: SocketAddr) -> Option<ResumeToken> {
        self.held.get(&peer).cloned()
    }

    pub fn forget(&mut self, peer: SocketAddr) {
        self.held.remove(&peer);
    }
}

// ── Pure helpers ──────────────────────────────────────────────────────────────

/// Hex SHA-256 of a passphrase, the only form that is ever stored.
pub fn hash_passphrase(passphrase: &str) -> String {
    hex::encode(Sha256::digest(passphrase.as_bytes()))
}

/// The challenge proof for one connection.
pub fn compute_proof(passphrase_hash: &str, nonce: &str, binding: &[u8; 32], initiator: DeviceId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(passphrase_hash.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(binding);
    hasher.update(initiator.as_bytes());
    hex::encode(hasher.finalize())
}

/// Decides which end of a new session is the master.
///
/// The side announcing MASTER wins.  Otherwise an UNASSIGNED side leads,
/// the responder first; a CLIENT never leads.  Returns `(master, client)`.
pub fn resolve_roles(
    initiator: DeviceId,
    initiator_role: DeviceRole,
    responder: DeviceId,
    responder_role: DeviceRole,
) -> Result<(DeviceId, DeviceId), HandshakeError> {
    match (initiator_role, responder_role) {
        (DeviceRole::Master, DeviceRole::Master) => Err(HandshakeError::RoleConflict),
        (DeviceRole::Master, _) => Ok((initiator, responder)),
        (_, DeviceRole::Master | DeviceRole::Unassigned) => Ok((responder, initiator)),
        (DeviceRole::Unassigned, DeviceRole::Client) => Ok((initiator, responder)),
        (DeviceRole::Client, DeviceRole::Client) => Err(HandshakeError::NoMaster),
    }
}

fn negotiate(ours: u32, hello: &HelloPayload) -> (u32, CapabilitySet) {
    let version = ours.min(hello.protocol_version);
    let capabilities = CapabilitySet::for_version(version).intersect(&hello.capabilities);
    (version, capabilities)
}

// ── Protocol ──────────────────────────────────────────────────────────────────

/// Result of a successful handshake.
pub struct EstablishedSession<S> {
    /// The ACTIVE session.
    pub session: Session,
    /// What the peer announced about itself.
    pub peer: HelloPayload,
    pub protocol_version: u32,
    pub capabilities: CapabilitySet,
    pub resumed: bool,
    pub channel: SecureChannel<S>,
}

pub struct PairingProtocol {
    registry: Arc<Registry>,
    roles: RoleCoordinator,
    config: PairingConfig,
    passphrase_hash: Option<String>,
    attempts: Mutex<AttemptTracker>,
    tokens: Mutex<ResumeTokenStore>,
}

impl PairingProtocol {
    pub fn new(registry: Arc<Registry>, config: PairingConfig, passphrase_hash: Option<String>) -> Self {
        let attempts = AttemptTracker::new(config.max_attempts, config.lockout);
        let tokens = ResumeTokenStore::new(config.resume_ttl);
        Self {
            roles: RoleCoordinator::new(Arc::clone(&registry)),
            registry,
            config,
            passphrase_hash,
            attempts: Mutex::new(attempts),
            tokens: Mutex::new(tokens),
        }
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    /// Connects to `addr` over TCP and pairs with the plaintext `passphrase`.
    ///
    /// # Errors
    ///
    /// See [`PairingProtocol::initiate_over`].
    pub async fn initiate(
        &self,
        addr: SocketAddr,
        passphrase: &str,
    ) -> Result<EstablishedSession<TcpStream>, PairingError> {
        self.initiate_with_hash(addr, Some(hash_passphrase(passphrase))).await
    }

    /// Like [`initiate`](Self::initiate) with an already hashed passphrase.
    ///
    /// # Errors
    ///
    /// See [`PairingProtocol::initiate_over`].
    pub async fn initiate_with_hash(
        &self,
        addr: SocketAddr,
        passphrase_hash: Option<String>,
    ) -> Result<EstablishedSession<TcpStream>, PairingError> {
        let stream = within(self.config.handshake_timeout, "connect", async {
            TcpStream::connect(addr)
                .await
                .map_err(|source| PairingError::from(HandshakeError::Connect { addr, source }))
        })
        .await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%addr, error = %e, "could not disable Nagle");
        }
        self.initiate_over(stream, addr, passphrase_hash.as_deref()).await
    }

    /// Runs the initiator side of the handshake over `stream`.
    ///
    /// `peer` keys the stored resume token.
    ///
    /// # Errors
    ///
    /// [`AuthError`] when the responder refuses the passphrase or is locking
    /// this device out; [`HandshakeError`] for anything else.
    pub async fn initiate_over<S>(
        &self,
        stream: S,
        peer: SocketAddr,
        passphrase_hash: Option<&str>,
    ) -> Result<EstablishedSession<S>, PairingError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limit = self.config.handshake_timeout;
        let local = self.registry.local_device();
        let mut channel = within(limit, "key exchange", async {
            Ok(SecureChannel::establish(stream, Side::Initiator).await?)
        })
        .await?;

        let offered_token = self.tokens().held_for(peer);
        let hello = HelloPayload {
            device_id: local.id,
            display_name: local.display_name.clone(),
            os: local.os,
            role: local.role,
            protocol_version: self.config.protocol_version,
            capabilities: CapabilitySet::for_version(self.config.protocol_version),
            resume_token: offered_token.clone(),
        };
        send(&mut channel, limit, "hello", Message::Hello(hello)).await?;

        let peer_hello = match recv(&mut channel, limit, "hello").await? {
            Message::Hello(h) => h,
            Message::Error(e) => return Err(rejection(e)),
            other => return Err(unexpected("HELLO", &other)),
        };
        if peer_hello.protocol_version < MIN_PROTOCOL_VERSION {
            return Err(HandshakeError::VersionMismatch {
                peer: peer_hello.protocol_version,
            }
            .into());
        }
        let (version, capabilities) = negotiate(self.config.protocol_version, &peer_hello);
        debug!(peer = %peer_hello.device_id, version, "hello exchanged");

        let mut authenticated = false;
        let ack = loop {
            match recv(&mut channel, limit, "authentication").await? {
                Message::Ack(ack) => break ack,
                Message::Challenge(challenge) if !authenticated => {
                    if offered_token.is_some() {
                        // The responder did not accept our token; it is spent.
                        self.tokens().forget(peer);
                    }
                    let Some(hash) = passphrase_hash else {
                        return Err(AuthError::NotConfigured.into());
                    };
                    let proof = compute_proof(hash, &challenge.nonce, channel.binding(), local.id);
                    let response = Message::ChallengeResponse(ChallengeResponsePayload { proof });
                    send(&mut channel, limit, "challenge response", response).await?;
                    authenticated = true;
                }
                Message::Error(e) => return Err(rejection(e)),
                other => return Err(unexpected("ACK", &other)),
            }
        };

        if !(ack.master_device_id == local.id || ack.client_device_id == local.id) {
            return Err(HandshakeError::Malformed("ACK").into());
        }
        self.record_peer(&peer_hello, Some(peer));
        self.confirm_master(ack.master_device_id)?;
        let now = Utc::now();
        let mut session = Session::new(ack.session_id, ack.master_device_id, ack.client_device_id, now)?;
        if authenticated {
            session.transition(SessionState::Authenticating, now)?;
        }
        session.transition(SessionState::Active, now)?;
        match &ack.resume_token {
            Some(token) => self.tokens().remember(peer, token.clone()),
            None => self.tokens().forget(peer),
        }
        session.resume_token = ack.resume_token.clone();

        info!(
            session_id = %session.id,
            peer = %peer_hello.device_id,
            resumed = ack.resumed,
            version = ack.protocol_version,
            "session established (initiator)"
        );
        Ok(EstablishedSession {
            session,
            peer: peer_hello,
            protocol_version: ack.protocol_version.min(version),
            capabilities: ack.capabilities.intersect(&capabilities),
            resumed: ack.resumed,
            channel,
        })
    }

    /// Runs the responder side of the handshake over an accepted `stream`.
    ///
    /// `peer_ip` keys the lockout.
    ///
    /// # Errors
    ///
    /// [`AuthError`] for lockout or a wrong passphrase; [`HandshakeError`]
    /// for anything else.  The peer is sent an ERROR before either is returned
    /// whenever the channel is still usable.
    pub async fn accept<S>(&self, stream: S, peer_ip: IpAddr) -> Result<EstablishedSession<S>, PairingError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let limit = self.config.handshake_timeout;
        let local = self.registry.local_device();
        let mut channel = within(limit, "key exchange", async {
            Ok(SecureChannel::establish(stream, Side::Responder).await?)
        })
        .await?;

        let hello = match recv(&mut channel, limit, "hello").await? {
            Message::Hello(h) => h,
            other => {
                let err = unexpected("HELLO", &other);
                reject(&mut channel, limit, ErrorPayload::new(ErrorCode::ProtocolViolation, "expected HELLO")).await;
                return Err(err);
            }
        };

        let lockout = self.attempts().check(peer_ip, Instant::now());
        if let Err(AuthError::Lockout { retry_after_secs }) = lockout {
            let mut payload = ErrorPayload::new(ErrorCode::LockedOut, "too many failed attempts");
            payload.retry_after_secs = Some(retry_after_secs);
            reject(&mut channel, limit, payload).await;
            warn!(%peer_ip, retry_after_secs, "handshake refused: locked out");
            return Err(AuthError::Lockout { retry_after_secs }.into());
        }

        if hello.protocol_version < MIN_PROTOCOL_VERSION {
            let message = format!("protocol v{} is not supported", hello.protocol_version);
            reject(&mut channel, limit, ErrorPayload::new(ErrorCode::VersionMismatch, message)).await;
            return Err(HandshakeError::VersionMismatch {
                peer: hello.protocol_version,
            }
            .into());
        }

        if hello.device_id == local.id {
            reject(&mut channel, limit, ErrorPayload::new(ErrorCode::DuplicateDevice, "same device")).await;
            return Err(HandshakeError::SelfConnection.into());
        }

        let nominated = resolve_roles(hello.device_id, hello.role, local.id, local.role)
            .and_then(|(master, client)| self.check_master(master).map(|()| (master, client)));
        let (master, client) = match nominated {
            Ok(pair) => pair,
            Err(e) => {
                warn!(peer = %hello.device_id, peer_role = %hello.role, error = %e, "handshake refused: roles");
                reject(&mut channel, limit, ErrorPayload::new(ErrorCode::RoleConflict, e.to_string())).await;
                return Err(e.into());
            }
        };

        let own_hello = HelloPayload {
            device_id: local.id,
            display_name: local.display_name.clone(),
            os: local.os,
            role: local.role,
            protocol_version: self.config.protocol_version,
            capabilities: CapabilitySet::for_version(self.config.protocol_version),
            resume_token: None,
        };
        send(&mut channel, limit, "hello", Message::Hello(own_hello)).await?;

        let (version, capabilities) = negotiate(self.config.protocol_version, &hello);
        let resumable = capabilities.contains(Capability::SessionResume);
        let now = Utc::now();
        let mut session = Session::new(Uuid::new_v4(), master, client, now)?;

        let resumed = resumable
            && hello
                .resume_token
                .as_ref()
                .is_some_and(|t| self.tokens().redeem(t, hello.device_id, Instant::now()));

        if !resumed {
            let Some(hash) = self.passphrase_hash.as_deref() else {
                reject(&mut channel, limit, ErrorPayload::new(ErrorCode::AuthFailed, "pairing is not configured")).await;
                return Err(AuthError::NotConfigured.into());
            };
            session.transition(SessionState::Authenticating, now)?;

            let mut nonce = [0u8; 32];
            OsRng.fill_bytes(&mut nonce);
            let nonce = hex::encode(nonce);
            let challenge = ChallengePayload {
                nonce: nonce.clone(),
                attempts_remaining: self.attempts().remaining(peer_ip),
            };
            send(&mut channel, limit, "challenge", Message::Challenge(challenge)).await?;

            let proof = match recv(&mut channel, limit, "challenge response").await? {
                Message::ChallengeResponse(r) => r.proof,
                other => {
                    let err = unexpected("CHALLENGE_RESPONSE", &other);
                    reject(&mut channel, limit, ErrorPayload::new(ErrorCode::ProtocolViolation, "expected CHALLENGE_RESPONSE")).await;
                    return Err(err);
                }
            };

            let expected = compute_proof(hash, &nonce, channel.binding(), hello.device_id);
            if !bool::from(expected.as_bytes().ct_eq(proof.as_bytes())) {
                let attempts_remaining = self.attempts().record_failure(peer_ip, Instant::now());
                session.transition(SessionState::Failed, Utc::now())?;
                let mut payload = ErrorPayload::new(ErrorCode::AuthFailed, "passphrase mismatch");
                payload.attempts_remaining = Some(attempts_remaining);
                reject(&mut channel, limit, payload).await;
                warn!(%peer_ip, peer = %hello.device_id, attempts_remaining, "passphrase mismatch");
                return Err(AuthError::Mismatch { attempts_remaining }.into());
            }
            self.attempts().record_success(peer_ip);
        }

        self.record_peer(&hello, None);
        if let Err(e) = self.confirm_master(master) {
            session.transition(SessionState::Failed, Utc::now())?;
            warn!(peer = %hello.device_id, %master, error = %e, "handshake refused: master not confirmed");
            reject(&mut channel, limit, ErrorPayload::new(ErrorCode::RoleConflict, e.to_string())).await;
            return Err(e.into());
        }

        let resume_token = resumable.then(|| self.tokens().issue(hello.device_id, Instant::now()));
        session.transition(SessionState::Active, Utc::now())?;
        session.resume_token = resume_token.clone();

        let ack = AckPayload {
            session_id: session.id,
            master_device_id: master,
            client_device_id: client,
            protocol_version: version,
            capabilities: capabilities.clone(),
            resume_token,
            resumed,
        };
        send(&mut channel, limit, "ack", Message::Ack(ack)).await?;

        info!(
            session_id = %session.id,
            peer = %hello.device_id,
            %peer_ip,
            resumed,
            version,
            "session established (responder)"
        );
        Ok(EstablishedSession {
            session,
            peer: hello,
            protocol_version: version,
            capabilities,
            resumed,
            channel,
        })
    }

    /// Refuses a nominated master the registry cannot accept.
    fn check_master(&self, candidate: DeviceId) -> Result<(), HandshakeError> {
        if self.registry.device(candidate).is_some_and(|d| d.role == DeviceRole::Client) {
            return Err(HandshakeError::NoMaster);
        }
        let holder = self
            .registry
            .devices()
            .into_iter()
            .find(|d| d.is_master() && d.present && d.id != candidate);
        match holder {
            Some(holder) => Err(RoleConflictError::MasterHeld { holder: holder.id }.into()),
            None => Ok(()),
        }
    }

    /// Confirms `master` with the role coordinator, promoting it if no live
    /// device holds MASTER.
    fn confirm_master(&self, master: DeviceId) -> Result<(), HandshakeError> {
        self.check_master(master)?;
        self.roles.request_role(master, DeviceRole::Master)?;
        Ok(())
    }

    /// Adds an authenticated peer to the registry if it is not known yet.
    fn record_peer(&self, hello: &HelloPayload, address: Option<SocketAddr>) {
        if self.registry.device(hello.device_id).is_some() {
            return;
        }
        let now = Utc::now();
        match Device::local(hello.device_id, hello.display_name.clone(), hello.os, hello.protocol_version, now) {
            Ok(mut device) => {
                device.role = hello.role;
                device.address = address;
                self.registry.observe_peer(device, now);
            }
            Err(e) => debug!(peer = %hello.device_id, error = %e, "peer not recorded"),
        }
    }

    fn attempts(&self) -> std::sync::MutexGuard<'_, AttemptTracker> {
        self.attempts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tokens(&self) -> std::sync::MutexGuard<'_, ResumeTokenStore> {
        self.tokens.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── I/O helpers ───────────────────────────────────────────────────────────────

async fn within<T, F>(limit: Duration, step: &'static str, fut: F) -> Result<T, PairingError>
where
    F: Future<Output = Result<T, PairingError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(HandshakeError::Timeout { step }.into()),
    }
}

async fn send<S>(
    channel: &mut SecureChannel<S>,
    limit: Duration,
    step: &'static str,
    message: Message,
) -> Result<(), PairingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let envelope = Envelope::new(message);
    within(limit, step, async {
        channel.send_envelope(&envelope).await?;
        Ok(())
    })
    .await
}

async fn recv<S>(channel: &mut SecureChannel<S>, limit: Duration, step: &'static str) -> Result<Message, PairingError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    within(limit, step, async { Ok(channel.recv_envelope().await?.message) }).await
}

/// Best-effort ERROR to the peer before giving up on the handshake.
async fn reject<S>(channel: &mut SecureChannel<S>, limit: Duration, payload: ErrorPayload)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let code = payload.code;
    if let Err(e) = send(channel, limit, "error", Message::Error(payload)).await {
        debug!(?code, error = %e, "could not deliver handshake ERROR");
    }
}

fn unexpected(expected: &'static str, got: &Message) -> PairingError {
    HandshakeError::UnexpectedMessage {
        expected,
        got: got.message_type().as_str(),
    }
    .into()
}

fn rejection(e: ErrorPayload) -> PairingError {
    match e.code {
        ErrorCode::LockedOut => AuthError::Lockout {
            retry_after_secs: e.retry_after_secs.unwrap_or(0),
        }
        .into(),
        ErrorCode::AuthFailed if e.attempts_remaining.is_some() => AuthError::Mismatch {
            attempts_remaining: e.attempts_remaining.unwrap_or(0),
        }
        .into(),
        ErrorCode::RoleConflict => HandshakeError::RoleConflict.into(),
        code => HandshakeError::Rejected {
            code,
            message: e.message,
        }
        .into(),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
