//! Session tuning knobs.
//!
//! Defaults mirror the shipped Fluxmon companion app; most deployments
//! only ever override the device name or the acquisition mode.

use std::time::Duration;

/// How live telemetry is acquired once a session reaches the live phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AcquisitionMode {
    /// Read every live endpoint on a fixed period.
    #[default]
    Poll,
    /// Subscribe once per live endpoint and fold notifications as they
    /// arrive.
    Notify,
}

impl AcquisitionMode {
    /// Check if this is notification-based acquisition.
    pub fn is_notify(&self) -> bool {
        matches!(self, Self::Notify)
    }

    /// Get a human-readable name for this mode.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Poll => "Poll",
            Self::Notify => "Notify",
        }
    }
}

/// Tunable policy for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionConfig {
    /// Advertised name a peripheral must match exactly to be reported
    /// during a scan.
    pub device_name: String,
    /// Window after which an unattended scan stops on its own.
    pub scan_timeout: Duration,
    /// Radio power-on checks attempted before a scan gives up.
    pub radio_poll_attempts: u32,
    /// Delay between radio power-on checks.
    pub radio_poll_interval: Duration,
    /// Wait after service discovery before the first read. Some
    /// transports report characteristics before the link will accept
    /// I/O.
    pub settle_delay: Duration,
    /// Period of the live read cycle in [`AcquisitionMode::Poll`].
    pub poll_period: Duration,
    /// Live acquisition mode.
    pub acquisition: AcquisitionMode,
}

impl SessionConfig {
    /// Advertised name of current-production meters.
    pub const DEFAULT_DEVICE_NAME: &'static str = "FluxmonEtiquetav2";
    /// Default scan window.
    pub const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);
    /// Default radio power-on check count.
    pub const DEFAULT_RADIO_POLL_ATTEMPTS: u32 = 8;
    /// Default delay between radio power-on checks.
    pub const DEFAULT_RADIO_POLL_INTERVAL: Duration = Duration::from_millis(500);
    /// Default post-discovery settle delay.
    pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(150);
    /// Default live poll period.
    pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_millis(500);

    /// Create a config with the shipped defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the advertised name to scan for.
    pub fn with_device_name(mut self, name: impl Into<String>) -> Self {
        self.device_name = name.into();
        self
    }

    /// Set the scan window.
    pub fn with_scan_timeout(mut self, timeout: Duration) -> Self {
        self.scan_timeout = timeout;
        self
    }

    /// Set the live poll period.
    pub fn with_poll_period(mut self, period: Duration) -> Self {
        self.poll_period = period;
        self
    }

    /// Set the live acquisition mode.
    pub fn with_acquisition(mut self, mode: AcquisitionMode) -> Self {
        self.acquisition = mode;
        self
    }

    /// Set the post-discovery settle delay.
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the radio power-on polling policy.
    pub fn with_radio_poll(mut self, attempts: u32, interval: Duration) -> Self {
        self.radio_poll_attempts = attempts;
        self.radio_poll_interval = interval;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: Self::DEFAULT_DEVICE_NAME.to_string(),
            scan_timeout: Self::DEFAULT_SCAN_TIMEOUT,
            radio_poll_attempts: Self::DEFAULT_RADIO_POLL_ATTEMPTS,
            radio_poll_interval: Self::DEFAULT_RADIO_POLL_INTERVAL,
            settle_delay: Self::DEFAULT_SETTLE_DELAY,
            poll_period: Self::DEFAULT_POLL_PERIOD,
            acquisition: AcquisitionMode::default(),
        }
    }
}
