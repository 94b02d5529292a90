//! Infrastructure layer for the engine.
//!
//! Contains OS-facing adapters: the encrypted session transport, the UDP
//! discovery transport, input drivers, and configuration storage.
//!
//! The application layer reaches into this module for the concrete types it
//! wires together (the secure channel and the input driver port); the
//! adapters themselves depend only on `kms_core` and the application ports.

pub mod input_driver;
pub mod network;
pub mod storage;
