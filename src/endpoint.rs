//! Endpoint registry: logical signals and their GATT addresses.
//!
//! A Fluxmon meter exposes a fixed, known-in-advance characteristic map.
//! The registry names each endpoint by the signal it carries and records
//! where it lives (service + characteristic UUID), which direction it
//! supports, and how its payload is coded. Sessions resolve every
//! operation through the registry, so hardware revisions with a different
//! UUID layout are handled by swapping the registry value, not the code.

use std::fmt;

use uuid::Uuid;

// Canonical "Etiqueta v2" layout (four services).
/// Static identification service UUID.
pub const STATIC_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0000_b5a3_f393_e0a9_e50e24dcca9e);
/// Combined lot + expiry characteristic UUID (UTF-8, `_` separated).
pub const LOT_EXPIRY_UUID: Uuid = Uuid::from_u128(0x6e40_0001_b5a3_f393_e0a9_e50e24dcca9e);
/// Serial number characteristic UUID (UTF-8).
pub const SERIAL_NUMBER_UUID: Uuid = Uuid::from_u128(0x6e40_0002_b5a3_f393_e0a9_e50e24dcca9e);

/// Meter bank A service UUID.
pub const METER_A_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0010_b5a3_f393_e0a9_e50e24dcca9e);
/// Bank A cumulative volume characteristic UUID (float32 LE, liters).
pub const LITERS_A_UUID: Uuid = Uuid::from_u128(0x6e40_0011_b5a3_f393_e0a9_e50e24dcca9e);
/// Bank A instantaneous flow characteristic UUID (float32 LE, L/min).
pub const FLOW_A_UUID: Uuid = Uuid::from_u128(0x6e40_0012_b5a3_f393_e0a9_e50e24dcca9e);
/// Supply voltage characteristic UUID (float32 LE, volts).
pub const SUPPLY_VOLTAGE_UUID: Uuid = Uuid::from_u128(0x6e40_0013_b5a3_f393_e0a9_e50e24dcca9e);

/// Meter bank B service UUID.
pub const METER_B_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0020_b5a3_f393_e0a9_e50e24dcca9e);
/// Bank B cumulative volume characteristic UUID (float32 LE, liters).
pub const LITERS_B_UUID: Uuid = Uuid::from_u128(0x6e40_0021_b5a3_f393_e0a9_e50e24dcca9e);
/// Bank B instantaneous flow characteristic UUID (float32 LE, L/min).
pub const FLOW_B_UUID: Uuid = Uuid::from_u128(0x6e40_0022_b5a3_f393_e0a9_e50e24dcca9e);

/// Command service UUID.
pub const COMMAND_SERVICE_UUID: Uuid = Uuid::from_u128(0x6e40_0030_b5a3_f393_e0a9_e50e24dcca9e);
/// Bank A totalizer reset characteristic UUID (1-byte write).
pub const RESET_A_UUID: Uuid = Uuid::from_u128(0x6e40_0031_b5a3_f393_e0a9_e50e24dcca9e);
/// Bank B totalizer reset characteristic UUID (1-byte write).
pub const RESET_B_UUID: Uuid = Uuid::from_u128(0x6e40_0032_b5a3_f393_e0a9_e50e24dcca9e);

// Legacy single-bank layout: everything hangs off two services and there
// is no bank B and no reset endpoint.
/// Legacy serial number characteristic UUID.
pub const COMPACT_SERIAL_UUID: Uuid = Uuid::from_u128(0x6e40_0010_b5a3_f393_e0a9_e50e24dcca9e);
/// Legacy live-data service UUID.
pub const COMPACT_LIVE_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x6e40_0012_b5a3_f393_e0a9_e50e24dcca9e);
/// Legacy cumulative volume characteristic UUID.
pub const COMPACT_LITERS_UUID: Uuid = Uuid::from_u128(0x6e40_0013_b5a3_f393_e0a9_e50e24dcca9e);
/// Legacy instantaneous flow characteristic UUID.
pub const COMPACT_FLOW_UUID: Uuid = Uuid::from_u128(0x6e40_0014_b5a3_f393_e0a9_e50e24dcca9e);
/// Legacy supply voltage characteristic UUID.
pub const COMPACT_VCC_UUID: Uuid = Uuid::from_u128(0x6e40_0015_b5a3_f393_e0a9_e50e24dcca9e);

/// Logical signal carried by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Signal {
    /// Device serial number (static).
    Serial,
    /// Combined lot code and expiry date (static).
    LotExpiry,
    /// Bank A cumulative volume in liters.
    LitersA,
    /// Bank A instantaneous flow in L/min.
    FlowA,
    /// Bank B cumulative volume in liters.
    LitersB,
    /// Bank B instantaneous flow in L/min.
    FlowB,
    /// Supply voltage in volts.
    SupplyVoltage,
    /// Bank A totalizer reset command.
    ResetA,
    /// Bank B totalizer reset command.
    ResetB,
}

impl Signal {
    /// Check if this signal is read once per connection.
    pub fn is_static(&self) -> bool {
        matches!(self, Signal::Serial | Signal::LotExpiry)
    }

    /// Check if this signal is part of the live telemetry cycle.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Signal::LitersA
                | Signal::FlowA
                | Signal::LitersB
                | Signal::FlowB
                | Signal::SupplyVoltage
        )
    }

    /// Check if this signal is a command endpoint.
    pub fn is_command(&self) -> bool {
        matches!(self, Signal::ResetA | Signal::ResetB)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Serial => "serial number",
            Signal::LotExpiry => "lot/expiry",
            Signal::LitersA => "liters A",
            Signal::FlowA => "flow A",
            Signal::LitersB => "liters B",
            Signal::FlowB => "flow B",
            Signal::SupplyVoltage => "supply voltage",
            Signal::ResetA => "reset A",
            Signal::ResetB => "reset B",
        };
        write!(f, "{}", name)
    }
}

/// Access direction an endpoint supports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Direction {
    /// Readable on demand.
    Read,
    /// Writable (with response).
    Write,
    /// Readable and notification-capable.
    Notify,
}

/// Wire format of an endpoint's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CodecKind {
    /// Raw UTF-8 string.
    Utf8Text,
    /// UTF-8 string split once on `_`.
    DelimitedText,
    /// 4-byte little-endian IEEE-754 float.
    Float32Le,
    /// Single command byte.
    OneByteCommand,
}

/// One endpoint: a signal and where/how it lives on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    /// Logical signal this endpoint carries.
    pub signal: Signal,
    /// Owning GATT service UUID.
    pub service: Uuid,
    /// Characteristic UUID within the service.
    pub characteristic: Uuid,
    /// Supported access direction.
    pub direction: Direction,
    /// Payload wire format.
    pub codec: CodecKind,
}

/// Static table of every endpoint a meter layout exposes.
///
/// Iteration order is significant: static endpoints are read in table
/// order during the static phase, and live endpoints are read in table
/// order on every poll cycle.
#[derive(Debug, Clone)]
pub struct EndpointRegistry {
    endpoints: Vec<EndpointDescriptor>,
}

impl EndpointRegistry {
    /// The canonical "Etiqueta v2" layout: dual meter banks, supply
    /// voltage, and per-bank reset commands across four services.
    ///
    /// Live cycle order: liters A, flow A, supply voltage, liters B,
    /// flow B.
    pub fn fluxmon_v2() -> Self {
        Self {
            endpoints: vec![
                EndpointDescriptor {
                    signal: Signal::Serial,
                    service: STATIC_SERVICE_UUID,
                    characteristic: SERIAL_NUMBER_UUID,
                    direction: Direction::Read,
                    codec: CodecKind::Utf8Text,
                },
                EndpointDescriptor {
                    signal: Signal::LotExpiry,
                    service: STATIC_SERVICE_UUID,
                    characteristic: LOT_EXPIRY_UUID,
                    direction: Direction::Read,
                    codec: CodecKind::DelimitedText,
                },
                EndpointDescriptor {
                    signal: Signal::LitersA,
                    service: METER_A_SERVICE_UUID,
                    characteristic: LITERS_A_UUID,
                    direction: Direction::Notify,
                    codec: CodecKind::Float32Le,
                },
                EndpointDescriptor {
                    signal: Signal::FlowA,
                    service: METER_A_SERVICE_UUID,
                    characteristic: FLOW_A_UUID,
                    direction: Direction::Notify,
                    codec: CodecKind::Float32Le,
                },
                EndpointDescriptor {
                    signal: Signal::SupplyVoltage,
                    service: METER_A_SERVICE_UUID,
                    characteristic: SUPPLY_VOLTAGE_UUID,
                    direction: Direction::Notify,
                    codec: CodecKind::Float32Le,
                },
                EndpointDescriptor {
                    signal: Signal::LitersB,
                    service: METER_B_SERVICE_UUID,
                    characteristic: LITERS_B_UUID,
                    direction: Direction::Notify,
                    codec: CodecKind::Float32Le,
                },
                EndpointDescriptor {
                    signal: Signal::FlowB,
                    service: METER_B_SERVICE_UUID,
                    characteristic: FLOW_B_UUID,
                    direction: Direction::Notify,
                    codec: CodecKind::Float32Le,
                },
                EndpointDescriptor {
                    signal: Signal::ResetA,
                    service: COMMAND_SERVICE_UUID,
                    characteristic: RESET_A_UUID,
                    direction: Direction::Write,
                    codec: CodecKind::OneByteCommand,
                },
                EndpointDescriptor {
                    signal: Signal::ResetB,
                    service: COMMAND_SERVICE_UUID,
                    characteristic: RESET_B_UUID,
                    direction: Direction::Write,
                    codec: CodecKind::OneByteCommand,
                },
            ],
        }
    }

    /// The legacy single-bank layout: one meter, no lot characteristic,
    /// no reset commands.
    pub fn compact() -> Self {
        Self {
            endpoints: vec![
                EndpointDescriptor {
                    signal: Signal::Serial,
                    service: STATIC_SERVICE_UUID,
                    characteristic: COMPACT_SERIAL_UUID,
                    direction: Direction::Read,
                    codec: CodecKind::Utf8Text,
                },
                EndpointDescriptor {
                    signal: Signal::LitersA,
                    service: COMPACT_LIVE_SERVICE_UUID,
                    characteristic: COMPACT_LITERS_UUID,
                    direction: Direction::Notify,
                    codec: CodecKind::Float32Le,
                },
                EndpointDescriptor {
                    signal: Signal::FlowA,
                    service: COMPACT_LIVE_SERVICE_UUID,
                    characteristic: COMPACT_FLOW_UUID,
                    direction: Direction::Notify,
                    codec: CodecKind::Float32Le,
                },
                EndpointDescriptor {
                    signal: Signal::SupplyVoltage,
                    service: COMPACT_LIVE_SERVICE_UUID,
                    characteristic: COMPACT_VCC_UUID,
                    direction: Direction::Notify,
                    codec: CodecKind::Float32Le,
                },
            ],
        }
    }

    /// Build a registry from an explicit endpoint table.
    ///
    /// Intended for tests and for field units with rearranged UUID maps.
    pub fn custom(endpoints: Vec<EndpointDescriptor>) -> Self {
        Self { endpoints }
    }

    /// All endpoints in table order.
    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        &self.endpoints
    }

    /// Look up the endpoint carrying a signal.
    pub fn endpoint(&self, signal: Signal) -> Option<&EndpointDescriptor> {
        self.endpoints.iter().find(|e| e.signal == signal)
    }

    /// Look up an endpoint by its characteristic UUID.
    ///
    /// Notification events identify their source this way.
    pub fn by_characteristic(&self, characteristic: Uuid) -> Option<&EndpointDescriptor> {
        self.endpoints
            .iter()
            .find(|e| e.characteristic == characteristic)
    }

    /// Static identification endpoints in read order.
    pub fn static_endpoints(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.endpoints.iter().filter(|e| e.signal.is_static())
    }

    /// Live telemetry endpoints in cycle order.
    pub fn live_endpoints(&self) -> impl Iterator<Item = &EndpointDescriptor> {
        self.endpoints.iter().filter(|e| e.signal.is_live())
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::fluxmon_v2()
    }
}
