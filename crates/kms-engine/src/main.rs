//! Keyboard Mouse Share engine host process.
//!
//! Loads settings, starts the engine on the UDP discovery transport and logs
//! engine events until Ctrl-C.
//!
//! # Architecture
//!
//! ```text
//! main()
//!  └─ EngineSettings::load()    -- TOML file in the platform config dir
//!  └─ Engine::new() + start()
//!       ├─ UdpDiscoveryTransport (announce / browse)
//!       ├─ session listener      (TCP)
//!       └─ input capture         (MASTER only)
//!  └─ event loop until Ctrl-C, then Engine::shutdown()
//! ```
//!
//! The headless input driver is used on every platform; native hook and
//! injection drivers plug in through the same `InputDriver` trait.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kms_core::DeviceRole;
use kms_engine::application::engine::{Engine, EngineEvent};
use kms_engine::infrastructure::input_driver::headless::HeadlessInputDriver;
use kms_engine::infrastructure::network::discovery::UdpDiscoveryTransport;
use kms_engine::infrastructure::storage::{EngineSettings, TomlConfigStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let store = TomlConfigStore::open_default().context("opening configuration")?;
    let settings = EngineSettings::load(&store).context("loading settings")?;

    // Level is overridden by `RUST_LOG`.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level)))
        .init();

    info!(config = %store.path().display(), device_id = %settings.device_id, "Keyboard Mouse Share engine starting");

    let local = settings
        .local_device(None, Utc::now())
        .context("building the local device record")?;
    let transport = UdpDiscoveryTransport::bind(settings.discovery_port)
        .await
        .context("binding the discovery socket")?;
    let (engine, mut events) = Engine::new(
        local,
        settings.engine_config(),
        Arc::new(transport),
        Arc::new(HeadlessInputDriver::new()),
    );

    let bound = engine.start().await.context("starting the engine")?;
    if engine.local_device().role == DeviceRole::Master {
        engine.start_capture().context("starting input capture")?;
    }
    info!(%bound, "engine ready.  Press Ctrl-C to exit.");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!(error = %e, "could not listen for Ctrl-C; shutting down");
                }
                info!("shutdown signal received");
                break;
            }
            event = events.recv() => match event {
                Some(event) => log_event(&event),
                None => break,
            },
        }
    }

    engine.shutdown().await;
    info!("Keyboard Mouse Share engine stopped");
    Ok(())
}

fn log_event(event: &EngineEvent) {
    match event {
        EngineEvent::Presence(presence) => info!(?presence, "presence changed"),
        EngineEvent::SessionEstablished {
            session_id,
            peer,
            master,
            resumed,
        } => info!(%session_id, %peer, %master, resumed, "session established"),
        EngineEvent::SessionClosed {
            session_id,
            peer,
            reason,
        } => info!(%session_id, %peer, %reason, "session closed"),
        EngineEvent::SessionFailed {
            session_id,
            peer,
            reason,
        } => warn!(?session_id, ?peer, %reason, "session failed"),
        EngineEvent::RoleRejected { reason } => warn!(%reason, "role request rejected"),
        EngineEvent::RoleChanged { master, previous } => info!(%master, ?previous, "master changed"),
    }
}
