// Allow holding locks across await points - we use parking_lot which is designed for this
#![allow(clippy::await_holding_lock)]
// Allow derivable impls for clarity
#![allow(clippy::derivable_impls)]
// Allow unusual byte groupings for UUIDs which have standard format
#![allow(clippy::unusual_byte_groupings)]

//! # fluxmon-ble
//!
//! A cross-platform Rust library for communicating with Fluxmon flow meter
//! peripherals via Bluetooth Low Energy.
//!
//! A [`Session`] owns the whole lifecycle of one meter link: scanning with
//! a name filter, connecting, service discovery, one-shot identification
//! reads, and live acquisition of volume totals, flow rates, and supply
//! voltage. Consumers observe the session through broadcast channels or
//! registered callbacks; they never touch GATT plumbing directly.
//!
//! ## Features
//!
//! - **Device Discovery**: Name-filtered scanning with ordered, deduplicated results
//! - **Session Lifecycle**: One state machine from idle to live data and back
//! - **Live Telemetry**: Dual-bank volume totals, flow rates, and supply voltage
//! - **Acquisition Modes**: Fixed-cadence polling or notification streaming
//! - **Totalizer Reset**: Zero either meter bank remotely
//! - **Endpoint Registries**: Swap GATT layouts without touching session logic
//! - **Mock Transport**: Scriptable in-memory transport for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fluxmon_ble::{BleTransport, Result, Session};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     // Create a session on the first Bluetooth adapter
//!     let transport = BleTransport::new().await?;
//!     let session = Session::new(transport);
//!
//!     // Scan for meters advertising the default name
//!     session.start_scan().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!
//!     // Connect to the first result and watch live data
//!     if let Some(advertisement) = session.scan_results().first() {
//!         session.connect(&advertisement.identity).await?;
//!
//!         let mut snapshots = session.subscribe_snapshots();
//!         while let Ok(snapshot) = snapshots.recv().await {
//!             println!(
//!                 "A: {:.3} L at {:.3} L/min (Vcc {:.3} V)",
//!                 snapshot.liters_a, snapshot.flow_a, snapshot.supply_voltage
//!             );
//!         }
//!     }
//!
//!     session.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Notes
//!
//! ### macOS
//! Requires Bluetooth permission. Add `NSBluetoothAlwaysUsageDescription`
//! to your Info.plist for bundled apps.
//!
//! ### Linux
//! Requires BlueZ. User may need to be in the `bluetooth` group.
//!
//! ### Windows
//! Requires Windows 10 or later with Bluetooth LE support.
//!
//! ## Feature Flags
//!
//! - `serde`: Enable serialization/deserialization for data types

// Public modules
pub mod ble;
pub mod codec;
pub mod config;
pub mod endpoint;
pub mod error;
mod poller;
pub mod scan;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod transport_mock;
pub mod utils;

// Re-exports for convenience
pub use config::{AcquisitionMode, SessionConfig};
pub use error::{Error, Result};
pub use session::{CallbackHandle, Session, SessionEvent, SessionState};
pub use utils::{format_reading, gallons_to_liters, liters_to_gallons, lpm_to_lph};

// Re-export commonly used types from submodules
pub use ble::BleTransport;
pub use endpoint::{CodecKind, Direction, EndpointDescriptor, EndpointRegistry, Signal};
pub use scan::ScanResults;
pub use telemetry::{Meter, StaticInfo, TelemetrySnapshot};
pub use transport::{
    Advertisement, GattService, LinkEvent, Notification, PeripheralIdentity, RadioState, Transport,
};
pub use transport_mock::MockTransport;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_exports() {
        // Verify that key types are exported
        let _ = std::any::TypeId::of::<Session<MockTransport>>();
        let _ = std::any::TypeId::of::<BleTransport>();
        let _ = std::any::TypeId::of::<MockTransport>();
        let _ = std::any::TypeId::of::<Error>();
        let _ = std::any::TypeId::of::<SessionState>();
        let _ = std::any::TypeId::of::<SessionConfig>();
        let _ = std::any::TypeId::of::<EndpointRegistry>();
        let _ = std::any::TypeId::of::<TelemetrySnapshot>();
        let _ = std::any::TypeId::of::<PeripheralIdentity>();
    }

    #[test]
    fn test_volume_conversion() {
        assert!((liters_to_gallons(3.785412) - 1.0).abs() < 0.001);
        assert!((gallons_to_liters(1.0) - 3.785412).abs() < 0.001);
    }
}
