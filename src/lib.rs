//! BLE GATT bridging daemon.
//!
//! Mediates between a privileged platform Bluetooth stack and an
//! untrusted client that must never touch the hardware directly. The
//! client speaks a flat, versioned request/event protocol; the bridge
//! validates everything it sends, translates it into adapter calls, and
//! pushes platform activity back as events.

pub mod blocklist;
pub mod bridge;
pub mod chooser;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod infrastructure;
pub mod protocol;
pub mod service;
