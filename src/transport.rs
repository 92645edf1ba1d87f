//! Transport seam between the session core and the radio.
//!
//! The session state machine never talks to a platform BLE stack
//! directly; it drives this trait. [`crate::ble::BleTransport`] implements
//! it over btleplug for real hardware and
//! [`crate::transport_mock::MockTransport`] implements it in memory for
//! tests. A transport owns at most one active link at a time, matching
//! the one-session model.

use async_trait::async_trait;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;

/// Radio power state as reported by the platform adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RadioState {
    /// Radio is on and ready to scan.
    PoweredOn,
    /// Radio is off.
    PoweredOff,
    /// The platform could not report a state.
    Unknown,
}

impl RadioState {
    /// Check if the radio can scan.
    pub fn is_powered_on(&self) -> bool {
        matches!(self, Self::PoweredOn)
    }
}

impl std::fmt::Display for RadioState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PoweredOn => write!(f, "PoweredOn"),
            Self::PoweredOff => write!(f, "PoweredOff"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Stable identity of a peripheral as seen over the air.
///
/// `id` is the platform's opaque link-layer identifier; it is the
/// dedupe key for scan results and the lookup key for `connect`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PeripheralIdentity {
    /// Opaque platform identifier.
    pub id: String,
    /// Advertised local name.
    pub name: String,
}

impl PeripheralIdentity {
    /// Create an identity from its parts.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for PeripheralIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// One advertisement observed while scanning.
#[derive(Debug, Clone)]
pub struct Advertisement {
    /// Who advertised.
    pub identity: PeripheralIdentity,
    /// Signal strength in dBm, when the platform reports it.
    pub rssi: Option<i16>,
}

/// One service in the connected peripheral's GATT topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    /// Service UUID.
    pub uuid: Uuid,
    /// Characteristic UUIDs the service contains.
    pub characteristics: Vec<Uuid>,
}

impl GattService {
    /// Check if the service contains a characteristic.
    pub fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.characteristics.contains(&characteristic)
    }
}

/// A value pushed by the peripheral on a subscribed characteristic.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Source characteristic UUID.
    pub characteristic: Uuid,
    /// Raw payload.
    pub data: Vec<u8>,
}

/// Out-of-band link lifecycle event.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The active link dropped without a local `disconnect` call.
    Disconnected(PeripheralIdentity),
}

/// Capabilities the session core requires from a radio.
///
/// Implementations use interior mutability; every method takes `&self`
/// so a transport can be shared behind an `Arc` between the session and
/// its background tasks.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Query the radio power state.
    async fn radio_state(&self) -> Result<RadioState>;

    /// Start advertising discovery. Observed peripherals arrive on
    /// [`Transport::advertisements`].
    async fn start_scan(&self) -> Result<()>;

    /// Stop advertising discovery. Must succeed when no scan is active.
    async fn stop_scan(&self) -> Result<()>;

    /// Subscribe to the advertisement stream.
    fn advertisements(&self) -> broadcast::Receiver<Advertisement>;

    /// Establish a link to a previously observed peripheral. No
    /// automatic reconnection.
    async fn connect(&self, identity: &PeripheralIdentity) -> Result<()>;

    /// Close the active link. Must succeed when the link is already
    /// gone.
    async fn disconnect(&self) -> Result<()>;

    /// Enumerate the active link's service topology.
    async fn discover_services(&self) -> Result<Vec<GattService>>;

    /// Read a characteristic value over the active link.
    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>>;

    /// Write a characteristic value over the active link, with response.
    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()>;

    /// Enable notifications for a characteristic on the active link.
    /// Values arrive on [`Transport::notifications`].
    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()>;

    /// Subscribe to the notification stream.
    fn notifications(&self) -> broadcast::Receiver<Notification>;

    /// Subscribe to out-of-band link lifecycle events.
    ///
    /// Only unrequested losses are reported here; a disconnect initiated
    /// through [`Transport::disconnect`] is not.
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}
