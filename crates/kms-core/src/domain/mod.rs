//! Domain entities for Keyboard Mouse Share.
//!
//! This module contains pure business logic with no infrastructure dependencies.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! Clean Architecture organises code into concentric layers.  The innermost
//! layer is called the **domain** (or "entities" layer).  Domain code:
//!
//! - Contains the core business rules of the application.
//! - Has **no** imports from OS APIs, network libraries, or async runtimes.
//! - Can be compiled and tested on any platform without any external setup.
//!
//! Here that means: who the devices are and which role they hold, how an
//! authenticated session moves through its lifecycle, where each screen sits
//! in the shared coordinate space, and how a pointer sample on one screen is
//! mapped onto its neighbour.

/// Multi-monitor cursor transition geometry.
pub mod cursor;
/// Device identity records and roles.
pub mod device;
/// Captured input events.
pub mod input;
/// Screen placement and layout validation.
pub mod layout;
/// Authenticated session lifecycle.
pub mod session;
