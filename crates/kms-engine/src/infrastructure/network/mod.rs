//! Network adapters.
//!
//! - **`secure_channel`** – Forward-secret encrypted stream carrying framed
//!   protocol messages between two engines.
//! - **`discovery`** – UDP broadcast implementation of the discovery port.
//! - **`loopback`** – In-process discovery bus for tests and single-host runs.

pub mod discovery;
pub mod loopback;
pub mod secure_channel;
