//! BLE communication module.
//!
//! This module provides the btleplug-backed [`Transport`] implementation
//! used to talk to real flow meter hardware.
//!
//! [`Transport`]: crate::transport::Transport

pub mod transport;

pub use transport::BleTransport;
