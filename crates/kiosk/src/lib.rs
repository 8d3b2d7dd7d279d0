//! Kiosk orchestrates containerized application instances.
//!
//! Each instance is one container exposing a remote-desktop port and a
//! console port drawn from bounded host ranges. The crate provides the HTTP
//! API served by `kioskd`, the instance lifecycle behind it, and the wire
//! types `kioskctl` shares with the server.

pub mod api;
pub mod cleanup;
pub mod instance;
pub mod payload;
pub mod ports;
pub mod runtime;
pub mod settings;
