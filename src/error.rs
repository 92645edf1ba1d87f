//! Error types for the fluxmon-ble crate.

use std::sync::Arc;

use thiserror::Error;

use crate::endpoint::Signal;

/// The main error type for this crate.
///
/// Transport-layer failures are translated into the session-level variants
/// at the `Session` boundary; collaborators subscribed to session events
/// never receive a raw [`btleplug::Error`].
///
/// `Clone` lets session alert events carry the error by value; the
/// non-cloneable btleplug source is shared behind an `Arc`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Bluetooth-related error from the underlying BLE library.
    #[error("Bluetooth error: {0}")]
    Bluetooth(Arc<btleplug::Error>),

    /// The platform radio never reported a powered-on state.
    #[error("Bluetooth radio unavailable (last reported state: {state})")]
    RadioUnavailable {
        /// The last radio state observed while waiting for power-on.
        state: String,
    },

    /// The scan window closed without the caller selecting a result.
    ///
    /// Not fatal: the scan simply stops. Surfaced through the session's
    /// status events rather than as a fallible return.
    #[error("Scan timed out")]
    ScanTimeout,

    /// The specified peripheral was not found among scan results.
    #[error("Peripheral not found: {identifier}")]
    PeripheralNotFound {
        /// The identifier that was searched for.
        identifier: String,
    },

    /// Operation requires a live link but the session has none.
    #[error("Not connected")]
    NotConnected,

    /// Failed to establish a connection to the peripheral.
    #[error("Connection failed: {reason}")]
    ConnectFailed {
        /// Description of why the connection failed.
        reason: String,
    },

    /// Service/characteristic discovery failed or the endpoint registry
    /// did not resolve against the link's topology.
    #[error("Discovery failed: {reason}")]
    DiscoveryFailed {
        /// Description of what went wrong during discovery.
        reason: String,
    },

    /// A static-info read failed. Non-fatal: the session continues into
    /// live polling with whatever static fields were read.
    #[error("Static read failed: {reason}")]
    StaticReadFailed {
        /// Description of the failed read.
        reason: String,
    },

    /// A live telemetry read failed. Fatal to the session: a live link
    /// guarantees reads either succeed or report an explicit disconnect,
    /// so a failure here is conclusive evidence the link is dead.
    #[error("Poll read failed for {signal}: {reason}")]
    PollReadFailed {
        /// The signal whose read failed.
        signal: Signal,
        /// Description of the failed read.
        reason: String,
    },

    /// A command write failed. Non-fatal: surfaced to the caller as an
    /// alert without tearing the session down.
    #[error("Command write failed for {signal}: {reason}")]
    CommandWriteFailed {
        /// The signal whose write failed.
        signal: Signal,
        /// Description of the failed write.
        reason: String,
    },

    /// A characteristic payload was too short to decode.
    ///
    /// During polling this means "no value this cycle", not a session
    /// fault: the last-known reading is kept.
    #[error("Payload truncated: expected at least {expected} bytes, got {actual}")]
    DecodeTruncated {
        /// Minimum number of bytes the codec requires.
        expected: usize,
        /// Number of bytes actually received.
        actual: usize,
    },

    /// The named signal does not accept writes.
    #[error("Signal {signal} is not writable")]
    NotWritable {
        /// The signal a write was attempted against.
        signal: Signal,
    },
}

impl From<btleplug::Error> for Error {
    fn from(error: btleplug::Error) -> Self {
        Self::Bluetooth(Arc::new(error))
    }
}

/// A specialized Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
