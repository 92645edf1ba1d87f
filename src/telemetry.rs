//! Telemetry data structures.
//!
//! Contains the static identification record read once per connection and
//! the immutable snapshot published after each acquisition cycle.

use chrono::{DateTime, Utc};

use crate::endpoint::Signal;

/// Meter bank selector.
///
/// The canonical hardware carries two independent totalizer banks; the
/// legacy single-bank hardware only populates bank A.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Meter {
    /// Primary meter bank.
    A,
    /// Secondary meter bank.
    B,
}

impl Meter {
    /// The command signal that zeroes this bank's totalizer.
    pub fn reset_signal(&self) -> Signal {
        match self {
            Meter::A => Signal::ResetA,
            Meter::B => Signal::ResetB,
        }
    }
}

impl std::fmt::Display for Meter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Meter::A => write!(f, "A"),
            Meter::B => write!(f, "B"),
        }
    }
}

/// Identification fields read once after connecting.
///
/// Reads happen during the static phase; a failed read leaves the
/// affected fields empty and the session continues.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StaticInfo {
    /// Device serial number.
    pub serial_number: String,
    /// Production lot code.
    pub lot_code: String,
    /// Expiry date string as reported by the device.
    pub expiry: String,
}

impl StaticInfo {
    /// Check whether any identification field has been populated.
    pub fn is_populated(&self) -> bool {
        !self.serial_number.is_empty() || !self.lot_code.is_empty() || !self.expiry.is_empty()
    }
}

/// Immutable telemetry record published after each acquisition cycle.
///
/// Fields not served by the connected hardware layout keep their
/// last-known value (zero on a fresh session). `generation` identifies
/// the session that produced the snapshot; consumers comparing against a
/// newer session must discard it, though the publish path already drops
/// snapshots whose generation went stale mid-cycle.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TelemetrySnapshot {
    /// Device serial number.
    pub serial_number: String,
    /// Production lot code.
    pub lot_code: String,
    /// Expiry date string as reported by the device.
    pub expiry: String,
    /// Bank A cumulative volume in liters.
    pub liters_a: f32,
    /// Bank A instantaneous flow in L/min.
    pub flow_a: f32,
    /// Bank B cumulative volume in liters.
    pub liters_b: f32,
    /// Bank B instantaneous flow in L/min.
    pub flow_b: f32,
    /// Supply voltage in volts.
    pub supply_voltage: f32,
    /// Session generation that produced this snapshot.
    pub generation: u64,
    /// Publication timestamp.
    pub captured_at: DateTime<Utc>,
}

impl TelemetrySnapshot {
    /// Create an empty snapshot bound to a session generation.
    pub fn new(generation: u64) -> Self {
        Self {
            serial_number: String::new(),
            lot_code: String::new(),
            expiry: String::new(),
            liters_a: 0.0,
            flow_a: 0.0,
            liters_b: 0.0,
            flow_b: 0.0,
            supply_voltage: 0.0,
            generation,
            captured_at: Utc::now(),
        }
    }

    /// Merge the static identification fields into this snapshot.
    pub fn apply_static(&mut self, info: &StaticInfo) {
        self.serial_number = info.serial_number.clone();
        self.lot_code = info.lot_code.clone();
        self.expiry = info.expiry.clone();
    }

    /// Stage a decoded live value into the field carrying `signal`.
    ///
    /// Non-live signals are ignored.
    pub fn set_value(&mut self, signal: Signal, value: f32) {
        match signal {
            Signal::LitersA => self.liters_a = value,
            Signal::FlowA => self.flow_a = value,
            Signal::LitersB => self.liters_b = value,
            Signal::FlowB => self.flow_b = value,
            Signal::SupplyVoltage => self.supply_voltage = value,
            _ => {}
        }
    }

    /// Read back the field carrying a live signal.
    ///
    /// Returns `None` for signals with no snapshot field.
    pub fn value(&self, signal: Signal) -> Option<f32> {
        match signal {
            Signal::LitersA => Some(self.liters_a),
            Signal::FlowA => Some(self.flow_a),
            Signal::LitersB => Some(self.liters_b),
            Signal::FlowB => Some(self.flow_b),
            Signal::SupplyVoltage => Some(self.supply_voltage),
            _ => None,
        }
    }

    /// Cumulative volume for a meter bank in liters.
    pub fn liters(&self, meter: Meter) -> f32 {
        match meter {
            Meter::A => self.liters_a,
            Meter::B => self.liters_b,
        }
    }

    /// Instantaneous flow for a meter bank in L/min.
    pub fn flow(&self, meter: Meter) -> f32 {
        match meter {
            Meter::A => self.flow_a,
            Meter::B => self.flow_b,
        }
    }

    /// Zero the cumulative volume of one meter bank.
    ///
    /// Applied after a successful reset command so displays drop without
    /// waiting for the next cycle.
    pub fn zero_volume(&mut self, meter: Meter) {
        match meter {
            Meter::A => self.liters_a = 0.0,
            Meter::B => self.liters_b = 0.0,
        }
    }
}

impl Default for TelemetrySnapshot {
    fn default() -> Self {
        Self::new(0)
    }
}
