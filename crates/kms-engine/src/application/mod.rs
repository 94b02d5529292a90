//! Application layer use cases for the input synchronization engine.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure business rules in `kms-core`) and the infrastructure (sockets,
//! files, OS input hooks).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a goal (e.g., "forward this
//!   keystroke to the client whose screen the pointer is on").
//! - **Depend on abstractions** (traits such as [`presence::DiscoveryTransport`]
//!   and [`relay::BatchSink`]) so the transport can be swapped in tests.
//! - **Never block the capture path**: anything that waits on the network
//!   runs on its own task.
//!
//! # Sub-modules
//!
//! - **`registry`** – The one owner of the Device and Session sets.
//! - **`presence`** – Peer discovery, liveness sweeps and presence events.
//! - **`pairing`** – Handshake, passphrase challenge and resume tokens.
//! - **`roles`** – Keeps at most one live MASTER and broadcasts changes.
//! - **`relay`** / **`relay_manager`** – Batched, ordered delivery of input
//!   to each client session.
//! - **`route_input`** – Master side: decides where each captured event goes.
//! - **`apply_input`** – Client side: checks batch order and injects events.
//! - **`engine`** – Wires all of the above together for the host process.

pub mod apply_input;
pub mod engine;
pub mod pairing;
pub mod presence;
pub mod registry;
pub mod relay;
pub mod relay_manager;
pub mod roles;
pub mod route_input;
