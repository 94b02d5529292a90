//! Engine: wires presence, pairing, roles and relays into one running node.
//!
//! # Architecture
//!
//! ```text
//! Engine::start()
//!  ├─ PresenceDirectory::start()     -- announce + browse + liveness sweep
//!  ├─ presence forwarder task        -- PresenceEvent -> EngineEvent (+ auto-connect)
//!  └─ accept loop                    -- TCP accept -> PairingProtocol::accept
//!
//! per Session
//!  ├─ reader task     -- decrypts frames into a channel
//!  ├─ writer task     -- owns the encrypting half, drains an outbound queue
//!  ├─ protocol task   -- heartbeat, ROLE_CHANGE, INPUT_BATCH / INPUT_ACK, GOODBYE
//!  └─ EventRelay      -- master side only: batched input toward the client
//! ```
//!
//! # Why a separate reader task? (for beginners)
//!
//! `tokio::select!` drops the branches that did not win.  Dropping a
//! half-finished `recv_envelope()` would lose the bytes already read and
//! desynchronise the encrypted stream, so frames are read on their own task
//! and handed over through a channel, which is safe to poll from `select!`.
//!
//! # Events
//!
//! Everything the host may want to show the user (peers coming and going,
//! sessions opening and failing, rejected role requests) arrives on the
//! [`EngineEvent`] receiver returned by [`Engine::new`].  Per-session errors
//! never propagate out of the engine; they end that session and are reported
//! as [`EngineEvent::SessionFailed`].

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kms_core::protocol::messages::{
    Capability, ErrorCode, ErrorPayload, GoodbyePayload, HeartbeatPayload, InputAckPayload, InputBatchPayload,
    RoleChangePayload,
};
use kms_core::protocol::SequenceCounter;
use kms_core::{
    CursorConfig, CursorMapper, Device, DeviceId, DeviceRole, Envelope, InputEvent, LayoutSet, Message, Session,
    SessionId,
};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::apply_input::ApplyInputUseCase;
use super::pairing::{hash_passphrase, EstablishedSession, PairingConfig, PairingError, PairingProtocol};
use super::presence::{DiscoveryError, DiscoveryTransport, PresenceConfig, PresenceDirectory, PresenceEvent};
use super::registry::{Registry, SessionCommand};
use super::relay::{BatchSink, EventRelay, RelayConfig, RelayError};
use super::relay_manager::{RelayManager, RelaySummary};
use super::roles::{RoleConflictError, RoleCoordinator, RoleOutcome};
use super::route_input::{RouteInputUseCase, RoutingMode};
use crate::infrastructure::input_driver::{CapturedInput, DriverError, InputDriver};
use crate::infrastructure::network::secure_channel::{ChannelError, SecureReader, SecureWriter};

/// Capacity of the [`EngineEvent`] channel.
const EVENT_CAPACITY: usize = 256;

/// Outbound frames buffered per session before senders wait.
const OUTBOUND_CAPACITY: usize = 256;

/// Inbound frames buffered per session between the reader and protocol tasks.
const INBOUND_CAPACITY: usize = 64;

/// Pending commands per session (role changes, close requests).
const CONTROL_CAPACITY: usize = 16;

/// How long shutdown waits for each task before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// How long a finished session waits for its writer to flush.
const WRITER_FLUSH_GRACE: Duration = Duration::from_secs(1);

// ── Configuration ─────────────────────────────────────────────────────────────

/// Heartbeat timing for established sessions.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub heartbeat_interval: Duration,
    /// A session with no inbound frame for this long is failed.
    pub heartbeat_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(10),
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// Everything an [`Engine`] needs besides its ports.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub listen_addr: SocketAddr,
    /// Role requested at start; `UNASSIGNED` requests nothing.
    pub role_preference: DeviceRole,
    pub passphrase_hash: Option<String>,
    /// Connect automatically to a MASTER that appears while this device is a CLIENT.
    pub auto_connect: bool,
    pub presence: PresenceConfig,
    pub pairing: PairingConfig,
    pub session: SessionConfig,
    pub relay: RelayConfig,
    pub cursor: CursorConfig,
    pub layouts: LayoutSet,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 19999),
            role_preference: DeviceRole::Unassigned,
            passphrase_hash: None,
            auto_connect: false,
            presence: PresenceConfig::default(),
            pairing: PairingConfig::default(),
            session: SessionConfig::default(),
            relay: RelayConfig::default(),
            cursor: CursorConfig::default(),
            layouts: LayoutSet::default(),
        }
    }
}

// ── Errors and events ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to bind session listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Role(#[from] RoleConflictError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("engine is already running")]
    AlreadyStarted,

    #[error("engine has been shut down")]
    ShutDown,
}

/// Notifications for the host process.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Presence(PresenceEvent),
    SessionEstablished {
        session_id: SessionId,
        peer: DeviceId,
        master: DeviceId,
        resumed: bool,
    },
    SessionClosed {
        session_id: SessionId,
        peer: DeviceId,
        reason: String,
    },
    /// A handshake or a running session failed.  `session_id` is `None` when
    /// the failure happened before a session existed.
    SessionFailed {
        session_id: Option<SessionId>,
        peer: Option<DeviceId>,
        reason: String,
    },
    RoleRejected {
        reason: String,
    },
    RoleChanged {
        master: DeviceId,
        previous: Option<DeviceId>,
    },
}

// ── Session plumbing ──────────────────────────────────────────────────────────

/// One frame queued for a session's writer task.
struct Outbound {
    envelope: Envelope,
    /// Receives the number of bytes written, for callers that need it.
    done: Option<oneshot::Sender<Result<usize, String>>>,
}

/// How a session ended.
#[derive(Debug)]
enum SessionEnd {
    Closed(String),
    Failed(String),
}

/// [`BatchSink`] that writes INPUT_BATCH frames through a session's writer.
struct ChannelBatchSink {
    session_id: SessionId,
    outbound: mpsc::Sender<Outbound>,
    registry: Arc<Registry>,
}

#[async_trait]
impl BatchSink for ChannelBatchSink {
    async fn send_batch(&self, sequence: u64, events: &[InputEvent]) -> Result<usize, RelayError> {
        let envelope = Envelope::new(Message::InputBatch(InputBatchPayload {
            events: events.iter().map(InputEvent::mark_encrypted).collect(),
        }))
        .with_session(self.session_id)
        .with_sequence(sequence);
        let (done, written) = oneshot::channel();
        self.outbound
            .send(Outbound {
                envelope,
                done: Some(done),
            })
            .await
            .map_err(|_| RelayError::Closed)?;
        let bytes = written
            .await
            .map_err(|_| RelayError::Closed)?
            .map_err(RelayError::Send)?;
        self.registry.record_sequence(self.session_id, sequence);
        Ok(bytes)
    }
}

/// Per-session state shared by the protocol loop's handlers.
struct SessionContext {
    session: Session,
    peer: DeviceId,
    outbound: mpsc::Sender<Outbound>,
    relay: Option<Arc<EventRelay>>,
    cancel: CancellationToken,
}

impl SessionContext {
    async fn send(&self, message: Message) -> Result<(), SessionEnd> {
        let envelope = Envelope::new(message).with_session(self.session.id);
        self.outbound
            .send(Outbound { envelope, done: None })
            .await
            .map_err(|_| SessionEnd::Failed("connection writer stopped".to_string()))
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// Handle to a running node.  Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config: EngineConfig,
    registry: Arc<Registry>,
    presence: Arc<PresenceDirectory>,
    pairing: PairingProtocol,
    roles: RoleCoordinator,
    relays: Arc<RelayManager>,
    router: Mutex<RouteInputUseCase>,
    applier: Mutex<ApplyInputUseCase>,
    driver: Arc<dyn InputDriver>,
    events: mpsc::Sender<EngineEvent>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl Engine {
    /// Builds an engine for `local`.  Nothing runs until [`start`](Self::start).
    pub fn new(
        local: Device,
        config: EngineConfig,
        transport: Arc<dyn DiscoveryTransport>,
        driver: Arc<dyn InputDriver>,
    ) -> (Self, mpsc::Receiver<EngineEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let local_id = local.id;
        let registry = Arc::new(Registry::new(local));
        let presence = Arc::new(PresenceDirectory::new(
            Arc::clone(&registry),
            transport,
            config.presence.clone(),
        ));
        let pairing = PairingProtocol::new(
            Arc::clone(&registry),
            config.pairing.clone(),
            config.passphrase_hash.clone(),
        );
        let relays = Arc::new(RelayManager::new());
        let router = RouteInputUseCase::new(
            local_id,
            config.layouts.clone(),
            CursorMapper::new(config.cursor),
            Arc::clone(&relays),
            Arc::clone(&driver),
        );
        let applier = ApplyInputUseCase::new(local_id, Arc::clone(&driver));

        let inner = Inner {
            roles: RoleCoordinator::new(Arc::clone(&registry)),
            config,
            registry,
            presence,
            pairing,
            relays,
            router: Mutex::new(router),
            applier: Mutex::new(applier),
            driver,
            events,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            local_addr: Mutex::new(None),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        };
        (Self { inner: Arc::new(inner) }, rx)
    }

    /// Binds the session listener, applies the role preference, announces
    /// this device and starts browsing.  Returns the bound address.
    ///
    /// # Errors
    ///
    /// [`EngineError::Bind`] if the listener cannot be bound, or the
    /// discovery transport's error.  A refused role preference is reported as
    /// [`EngineEvent::RoleRejected`] and does not fail start-up.
    pub async fn start(&self) -> Result<SocketAddr, EngineError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        if inner.started.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyStarted);
        }

        let addr = inner.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EngineError::Bind { addr, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| EngineError::Bind { addr, source })?;
        *inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(bound);

        if inner.config.role_preference != DeviceRole::Unassigned {
            // Failure is already reported as an event.
            let _ = inner.request_local_role(inner.config.role_preference);
        }

        let presence_events = inner.presence.subscribe();
        inner
            .presence
            .announce(&inner.registry.local_device(), bound.port())
            .await?;
        inner.presence.start().await?;

        let this = Arc::clone(inner);
        inner.track(tokio::spawn(async move { this.forward_presence(presence_events).await }));
        let this = Arc::clone(inner);
        inner.track(tokio::spawn(async move { this.accept_loop(listener).await }));

        info!(device_id = %inner.registry.local_id(), %bound, "engine started");
        Ok(bound)
    }

    /// Address the session listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn local_device(&self) -> Device {
        self.inner.registry.local_device()
    }

    /// Every known device, this one included.
    pub fn devices(&self) -> Vec<Device> {
        self.inner.registry.devices()
    }

    pub fn active_sessions(&self) -> Vec<Session> {
        self.inner
            .registry
            .active_sessions()
            .into_iter()
            .map(|e| e.session)
            .collect()
    }

    /// Pairs with the engine listening on `addr`.
    ///
    /// With `passphrase = None` the configured passphrase hash is used.  The
    /// session is registered before this returns.
    ///
    /// # Errors
    ///
    /// [`EngineError::Pairing`] when the handshake fails; the failure is also
    /// reported as [`EngineEvent::SessionFailed`].
    pub async fn connect(&self, addr: SocketAddr, passphrase: Option<&str>) -> Result<SessionId, EngineError> {
        self.inner.connect(addr, passphrase).await
    }

    /// Asks for this device to take `role`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Role`]; the refusal is also sent as
    /// [`EngineEvent::RoleRejected`].
    pub fn request_role(&self, role: DeviceRole) -> Result<RoleOutcome, EngineError> {
        Ok(self.inner.request_local_role(role)?)
    }

    /// Starts routing local input to clients.
    ///
    /// # Errors
    ///
    /// Whatever the input driver reports.
    pub fn start_capture(&self) -> Result<(), EngineError> {
        let inner = &self.inner;
        if inner.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        let captured = inner.driver.start_capture()?;
        let this = Arc::clone(inner);
        inner.track(tokio::spawn(async move { this.capture_loop(captured).await }));
        info!("input capture started");
        Ok(())
    }

    pub fn set_routing_mode(&self, mode: RoutingMode) {
        self.inner.router().set_mode(mode);
    }

    pub fn set_sharing_enabled(&self, enabled: bool) {
        self.inner.router().set_sharing_enabled(enabled);
    }

    pub fn update_layout(&self, layouts: LayoutSet) {
        self.inner.router().update_layout(layouts);
    }

    pub fn relay_metrics(&self) -> Vec<RelaySummary> {
        self.inner.relays.metrics_summary()
    }

    /// Says GOODBYE on every session, stops all tasks, withdraws the
    /// discovery record and stops the relays.  Idempotent.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine shutting down");

        for entry in inner.registry.active_sessions() {
            let close = SessionCommand::Close {
                reason: "engine shutting down".to_string(),
            };
            if let Err(e) = entry.control.try_send(close) {
                debug!(session_id = %entry.session.id, error = %e, "could not queue GOODBYE");
            }
        }
        inner.driver.stop_capture();
        inner.cancel.cancel();

        let handles: Vec<JoinHandle<()>> = inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut handle in handles {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut handle).await.is_err() {
                warn!("task did not stop in time; aborting it");
                handle.abort();
            }
        }

        inner.presence.stop().await;
        inner.relays.shutdown().await;
        info!("engine stopped");
    }
}

impl Inner {
    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    fn router(&self) -> std::sync::MutexGuard<'_, RouteInputUseCase> {
        self.router.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: EngineEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => warn!(?event, "engine event channel full; event dropped"),
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn request_local_role(&self, role: DeviceRole) -> Result<RoleOutcome, RoleConflictError> {
        let local = self.registry.local_id();
        match self.roles.request_role(local, role) {
            Ok(outcome) => {
                if role == DeviceRole::Master && outcome.changed {
                    self.emit(EngineEvent::RoleChanged {
                        master: local,
                        previous: outcome.previous_master,
                    });
                }
                Ok(outcome)
            }
            Err(e) => {
                self.emit(EngineEvent::RoleRejected { reason: e.to_string() });
                Err(e)
            }
        }
    }

    async fn connect(self: &Arc<Self>, addr: SocketAddr, passphrase: Option<&str>) -> Result<SessionId, EngineError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        let hash = passphrase
            .map(hash_passphrase)
            .or_else(|| self.config.passphrase_hash.clone());
        let established = tokio::select! {
            _ = self.cancel.cancelled() => return Err(EngineError::ShutDown),
            result = self.pairing.initiate_with_hash(addr, hash) => result,
        };
        match established {
            Ok(established) => Ok(self.open_session(established)),
            Err(e) => {
                warn!(%addr, error = %e, "pairing failed");
                self.emit(EngineEvent::SessionFailed {
                    session_id: None,
                    peer: None,
                    reason: e.to_string(),
                });
                Err(e.into())
            }
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let (stream, addr) = tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%addr, error = %e, "could not disable Nagle");
            }
            debug!(%addr, "incoming connection");

            let this = Arc::clone(&self);
            self.track(tokio::spawn(async move {
                let result = tokio::select! {
                    _ = this.cancel.cancelled() => return,
                    result = this.pairing.accept(stream, addr.ip()) => result,
                };
                match result {
                    Ok(established) => {
                        this.open_session(established);
                    }
                    Err(e) => {
                        warn!(%addr, error = %e, "incoming pairing failed");
                        this.emit(EngineEvent::SessionFailed {
                            session_id: None,
                            peer: None,
                            reason: e.to_string(),
                        });
                    }
                }
            }));
        }
        debug!("accept loop stopped");
    }

    async fn forward_presence(self: Arc<Self>, mut events: mpsc::Receiver<PresenceEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let PresenceEvent::PeerAdded(device) = &event {
                self.maybe_auto_connect(device);
            }
            self.emit(EngineEvent::Presence(event));
        }
    }

    fn maybe_auto_connect(self: &Arc<Self>, peer: &Device) {
        if !self.config.auto_connect || !peer.is_master() {
            return;
        }
        if self.registry.local_device().role != DeviceRole::Client {
            return;
        }
        let Some(addr) = peer.address else {
            return;
        };
        let already = self
            .registry
            .active_sessions()
            .iter()
            .any(|e| e.session.involves(peer.id));
        if already {
            return;
        }

        info!(master = %peer.id, %addr, "auto-connecting to discovered master");
        let this = Arc::clone(self);
        self.track(tokio::spawn(async move {
            // Failures are reported as SessionFailed.
            let _ = this.connect(addr, None).await;
        }));
    }

    async fn capture_loop(self: Arc<Self>, mut captured: mpsc::UnboundedReceiver<CapturedInput>) {
        loop {
            let input = tokio::select! {
                _ = self.cancel.cancelled() => break,
                input = captured.recv() => match input {
                    Some(input) => input,
                    None => break,
                },
            };
            self.router().handle(input, std::time::Instant::now());
        }
        debug!("capture loop stopped");
    }

    /// Registers an established session and spawns its tasks.
    fn open_session<S>(self: &Arc<Self>, established: EstablishedSession<S>) -> SessionId
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let EstablishedSession {
            session,
            peer: hello,
            capabilities,
            resumed,
            channel,
            ..
        } = established;
        let local_id = self.registry.local_id();
        let peer = hello.device_id;

        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);
        if let Some(old) = self.registry.insert_session(session.clone(), control_tx) {
            info!(old = %old.session.id, new = %session.id, "session superseded");
            let close = SessionCommand::Close {
                reason: "superseded by a new session".to_string(),
            };
            if let Err(e) = old.control.try_send(close) {
                debug!(session_id = %old.session.id, error = %e, "could not close superseded session");
            }
        }

        let cancel = self.cancel.child_token();
        let (reader, writer) = channel.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        let reader_task = tokio::spawn(read_frames(reader, inbound_tx, cancel.clone()));
        let writer_task = tokio::spawn(write_frames(writer, outbound_rx));

        let relay = (session.master_device_id == local_id).then(|| {
            let mut config = self.config.relay.clone();
            if !capabilities.contains(Capability::InputBatching) {
                config.batch_size = 1;
            }
            let sink = ChannelBatchSink {
                session_id: session.id,
                outbound: outbound_tx.clone(),
                registry: Arc::clone(&self.registry),
            };
            let relay = Arc::new(EventRelay::new(
                session.id,
                session.client_device_id,
                config,
                Arc::new(sink),
                Arc::new(SequenceCounter::starting_at(1)),
            ));
            relay.start();
            self.relays.add_relay(Arc::clone(&relay));
            relay
        });
        if session.client_device_id == local_id {
            self.applier.lock().unwrap_or_else(PoisonError::into_inner).reset();
        }

        let session_id = session.id;
        info!(%session_id, %peer, master = %session.master_device_id, resumed, "session active");
        self.emit(EngineEvent::SessionEstablished {
            session_id,
            peer,
            master: session.master_device_id,
            resumed,
        });

        let context = SessionContext {
            session,
            peer,
            outbound: outbound_tx,
            relay,
            cancel,
        };
        let this = Arc::clone(self);
        self.track(tokio::spawn(async move {
            this.run_session(context, control_rx, inbound_rx, reader_task, writer_task)
                .await;
        }));
        session_id
    }

    async fn run_session(
        &self,
        context: SessionContext,
        mut control: mpsc::Receiver<SessionCommand>,
        mut inbound: mpsc::Receiver<Result<Envelope, ChannelError>>,
        reader_task: JoinHandle<()>,
        mut writer_task: JoinHandle<()>,
    ) {
        let end = self.session_loop(&context, &mut control, &mut inbound).await;

        let SessionContext {
            session,
            peer,
            outbound,
            relay,
            cancel,
        } = context;
        self.registry.remove_session(session.id);
        if let Some(relay) = relay {
            self.relays.remove_relay(session.id);
            relay.stop().await;
            self.router().client_disconnected(session.client_device_id);
        }
        drop(outbound);
        if tokio::time::timeout(WRITER_FLUSH_GRACE, &mut writer_task).await.is_err() {
            writer_task.abort();
        }
        cancel.cancel();
        let _ = reader_task.await;

        match end {
            SessionEnd::Closed(reason) => {
                info!(session_id = %session.id, %peer, %reason, "session closed");
                self.emit(EngineEvent::SessionClosed {
                    session_id: session.id,
                    peer,
                    reason,
                });
            }
            SessionEnd::Failed(reason) => {
                warn!(session_id = %session.id, %peer, %reason, "session failed");
                self.emit(EngineEvent::SessionFailed {
                    session_id: Some(session.id),
                    peer: Some(peer),
                    reason,
                });
            }
        }
    }

    async fn session_loop(
        &self,
        context: &SessionContext,
        control: &mut mpsc::Receiver<SessionCommand>,
        inbound: &mut mpsc::Receiver<Result<Envelope, ChannelError>>,
    ) -> SessionEnd {
        let config = &self.config.session;
        let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_heard = Instant::now();
        let mut ping_nonce = 0u64;

        loop {
            let liveness_deadline = last_heard + config.heartbeat_timeout;
            let step = tokio::select! {
                biased;
                command = control.recv() => match command {
                    Some(SessionCommand::RoleChange(change)) => context.send(Message::RoleChange(change)).await,
                    Some(SessionCommand::Close { reason }) => {
                        let goodbye = Message::Goodbye(GoodbyePayload { reason: reason.clone() });
                        // Best effort: the peer may already be gone.
                        let _ = context.send(goodbye).await;
                        Err(SessionEnd::Closed(reason))
                    }
                    None => Err(SessionEnd::Closed("session removed".to_string())),
                },
                _ = context.cancel.cancelled() => Err(SessionEnd::Closed("engine shutting down".to_string())),
                frame = inbound.recv() => match frame {
                    Some(Ok(envelope)) => {
                        last_heard = Instant::now();
                        self.registry.touch_session(context.session.id, Utc::now());
                        self.on_message(context, envelope).await
                    }
                    Some(Err(ChannelError::Closed)) | None => {
                        Err(SessionEnd::Failed("peer closed the connection".to_string()))
                    }
                    Some(Err(e)) => Err(SessionEnd::Failed(e.to_string())),
                },
                _ = heartbeat.tick() => {
                    ping_nonce += 1;
                    context.send(Message::Ping(HeartbeatPayload { nonce: ping_nonce })).await
                }
                _ = tokio::time::sleep_until(liveness_deadline) => {
                    Err(SessionEnd::Failed("heartbeat timeout".to_string()))
                }
            };
            if let Err(end) = step {
                return end;
            }
        }
    }

    async fn on_message(&self, context: &SessionContext, envelope: Envelope) -> Result<(), SessionEnd> {
        let local_id = self.registry.local_id();
        match envelope.message {
            Message::Ping(ping) => context.send(Message::Pong(ping)).await,
            Message::Pong(_) => Ok(()),
            Message::RoleChange(change) => {
                self.on_role_change(&change);
                Ok(())
            }
            Message::InputBatch(batch) => {
                if context.session.client_device_id != local_id {
                    debug!(session_id = %context.session.id, "INPUT_BATCH from a client ignored");
                    return Ok(());
                }
                let Some(sequence) = envelope.sequence else {
                    return Err(self.violation(context, "INPUT_BATCH without a sequence").await);
                };
                let outcome = self
                    .applier
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .apply_batch(sequence, &batch.events);
                let ack = InputAckPayload {
                    sequence,
                    applied: u32::try_from(outcome.applied).unwrap_or(u32::MAX),
                };
                context.send(Message::InputAck(ack)).await
            }
            Message::InputAck(ack) => {
                if let Some(relay) = &context.relay {
                    relay.record_ack(ack.sequence);
                }
                Ok(())
            }
            Message::Goodbye(goodbye) => Err(SessionEnd::Closed(format!("peer said goodbye: {}", goodbye.reason))),
            Message::Error(e) => {
                error!(session_id = %context.session.id, code = ?e.code, message = %e.message, "peer reported an error");
                Err(SessionEnd::Failed(format!("peer error {:?}: {}", e.code, e.message)))
            }
            other @ (Message::Hello(_) | Message::Challenge(_) | Message::ChallengeResponse(_) | Message::Ack(_)) => {
                let reason = format!("unexpected {} on an active session", other.message_type().as_str());
                Err(self.violation(context, &reason).await)
            }
        }
    }

    fn on_role_change(&self, change: &RoleChangePayload) {
        match self.roles.apply_remote(change) {
            Ok(()) => self.emit(EngineEvent::RoleChanged {
                master: change.master_device_id,
                previous: change.previous_master_id,
            }),
            Err(e) => {
                warn!(master = %change.master_device_id, error = %e, "remote role change refused");
                self.emit(EngineEvent::RoleRejected { reason: e.to_string() });
            }
        }
    }

    async fn violation(&self, context: &SessionContext, reason: &str) -> SessionEnd {
        let error = ErrorPayload::new(ErrorCode::ProtocolViolation, reason);
        let _ = context.send(Message::Error(error)).await;
        SessionEnd::Failed(reason.to_string())
    }
}

// ── Frame pumps ───────────────────────────────────────────────────────────────

async fn read_frames<R>(
    mut reader: SecureReader<R>,
    inbound: mpsc::Sender<Result<Envelope, ChannelError>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = reader.recv_envelope() => frame,
        };
        let failed = frame.is_err();
        if inbound.send(frame).await.is_err() || failed {
            break;
        }
    }
}

async fn write_frames<W>(mut writer: SecureWriter<W>, mut outbound: mpsc::Receiver<Outbound>)
where
    W: AsyncWrite + Unpin + Send,
{
    while let Some(Outbound { envelope, done }) = outbound.recv().await {
        let result = writer.send_envelope(&envelope).await;
        let failed = result.is_err();
        match (done, result) {
            (Some(done), result) => {
                let _ = done.send(result.map_err(|e| e.to_string()));
            }
            (None, Err(e)) => debug!(msg_type = envelope.msg_type().as_str(), error = %e, "write failed"),
            (None, Ok(_)) => {}
        }
        if failed {
            break;
        }
    }
    if let Err(e) = writer.shutdown().await {
        debug!(error = %e, "connection shutdown failed");
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
