//! Session lifecycle management for a single flow meter link.
//!
//! A [`Session`] owns the full scan / connect / identify / poll cycle and
//! publishes everything it learns over broadcast channels. Every link
//! attempt is stamped with a generation number; once a teardown bumps the
//! generation, in-flight work for the old link can neither issue new
//! transport operations nor commit results.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::codec;
use crate::config::{AcquisitionMode, SessionConfig};
use crate::endpoint::{Direction, EndpointDescriptor, EndpointRegistry, Signal};
use crate::error::{Error, Result};
use crate::poller;
use crate::scan::ScanResults;
use crate::telemetry::{Meter, StaticInfo, TelemetrySnapshot};
use crate::transport::{Advertisement, LinkEvent, PeripheralIdentity, RadioState, Transport};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// No scan and no link.
    #[default]
    Idle,
    /// Scanning for matching peripherals.
    Scanning,
    /// A connect has been issued and is in flight.
    Connecting,
    /// Connected, enumerating GATT services.
    Discovering,
    /// Reading the one-shot identification characteristics.
    ReadingStatic,
    /// Live data acquisition is running.
    Polling,
    /// A user-requested disconnect is in progress.
    Disconnecting,
    /// A connection attempt failed. Transient; the session returns to
    /// [`SessionState::Idle`] immediately after.
    Error,
}

impl SessionState {
    /// Get the state name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Scanning => "Scanning",
            SessionState::Connecting => "Connecting",
            SessionState::Discovering => "Discovering",
            SessionState::ReadingStatic => "ReadingStatic",
            SessionState::Polling => "Polling",
            SessionState::Disconnecting => "Disconnecting",
            SessionState::Error => "Error",
        }
    }

    /// Whether the session is idle.
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        matches!(self, SessionState::Scanning)
    }

    /// Whether live acquisition is running.
    pub fn is_polling(&self) -> bool {
        matches!(self, SessionState::Polling)
    }

    /// Whether the session currently holds (or is establishing) a link.
    pub fn has_link(&self) -> bool {
        matches!(
            self,
            SessionState::Connecting
                | SessionState::Discovering
                | SessionState::ReadingStatic
                | SessionState::Polling
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Event emitted as a session moves through its lifecycle.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The session entered a new state.
    StateChanged(SessionState),
    /// The ordered scan result list changed.
    ScanResults(Vec<Advertisement>),
    /// Human-readable progress message.
    Status(String),
    /// A recoverable or fatal fault was observed.
    Alert(Error),
}

/// Why a teardown is running. Controls which cleanup steps apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TeardownCause {
    /// The caller asked to disconnect or replace the link.
    UserRequest,
    /// The transport reported the link gone.
    LinkLost,
    /// The acquisition task hit an unrecoverable read fault.
    PollFailure,
    /// A connection attempt failed before acquisition started.
    FailedAttempt,
}

impl TeardownCause {
    /// Whether the transport link should be closed explicitly.
    fn closes_link(&self) -> bool {
        !matches!(self, TeardownCause::LinkLost)
    }

    /// Whether the acquisition task should be aborted.
    ///
    /// A poll failure is reported from inside that task; it exits on its
    /// own once the generation moves past it.
    fn aborts_poller(&self) -> bool {
        !matches!(self, TeardownCause::PollFailure)
    }

    /// Whether the teardown announces itself as a disconnection.
    fn announces(&self) -> bool {
        !matches!(self, TeardownCause::FailedAttempt)
    }
}

/// Mutable session state, guarded by one mutex.
pub(crate) struct SessionInner {
    /// Current lifecycle state.
    pub(crate) state: SessionState,
    /// Link generation. Bumped on every claim and every teardown.
    pub(crate) generation: u64,
    /// Identity of the peripheral this session is bound to.
    pub(crate) identity: Option<PeripheralIdentity>,
    /// Identification read once after connecting.
    pub(crate) static_info: StaticInfo,
    /// Working snapshot the acquisition task writes into.
    pub(crate) staged: TelemetrySnapshot,
    /// Most recent snapshot handed to subscribers.
    pub(crate) last_published: Option<TelemetrySnapshot>,
    /// Ordered, deduplicated scan results.
    pub(crate) scan_results: ScanResults,
}

impl SessionInner {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
            generation: 0,
            identity: None,
            static_info: StaticInfo::default(),
            staged: TelemetrySnapshot::default(),
            last_published: None,
            scan_results: ScanResults::new(),
        }
    }
}

/// State shared between the session handle and its background tasks.
pub(crate) struct Shared<T: Transport> {
    /// The transport carrying all radio traffic.
    pub(crate) transport: Arc<T>,
    /// Endpoint layout of the target device.
    pub(crate) registry: EndpointRegistry,
    /// Session configuration.
    pub(crate) config: SessionConfig,
    /// Guarded mutable state.
    pub(crate) inner: Mutex<SessionInner>,
    /// Lifecycle event channel.
    pub(crate) event_tx: broadcast::Sender<SessionEvent>,
    /// Telemetry snapshot channel.
    pub(crate) snapshot_tx: broadcast::Sender<TelemetrySnapshot>,
    /// Handle to the scan task.
    scan_task: RwLock<Option<JoinHandle<()>>>,
    /// Handle to the acquisition task.
    poll_task: RwLock<Option<JoinHandle<()>>>,
    /// Handle to the link monitor task.
    monitor_task: RwLock<Option<JoinHandle<()>>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
}

impl<T: Transport> Shared<T> {
    pub(crate) fn publish_event(&self, event: SessionEvent) {
        let _ = self.event_tx.send(event);
    }

    pub(crate) fn publish_status(&self, message: impl Into<String>) {
        self.publish_event(SessionEvent::Status(message.into()));
    }

    pub(crate) fn publish_alert(&self, error: &Error) {
        self.publish_event(SessionEvent::Alert(error.clone()));
    }

    fn publish_scan_results(&self) {
        let entries = self.inner.lock().scan_results.entries().to_vec();
        self.publish_event(SessionEvent::ScanResults(entries));
    }

    /// Swap the state and publish the change if it differs.
    pub(crate) fn set_state(&self, state: SessionState) {
        let previous = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.state, state)
        };
        if previous != state {
            debug!("Session state: {} -> {}", previous, state);
            self.publish_event(SessionEvent::StateChanged(state));
        }
    }

    /// Whether `generation` still identifies the live link attempt.
    pub(crate) fn is_generation_live(&self, generation: u64) -> bool {
        self.inner.lock().generation == generation
    }

    /// Claim the teardown of the current link.
    ///
    /// Bumps the generation and clears the identity in one critical
    /// section, so at most one caller wins per link. `expected` guards
    /// against stale disconnect events killing a newer link.
    fn begin_teardown(&self, expected: Option<&PeripheralIdentity>) -> bool {
        let mut inner = self.inner.lock();
        match (&inner.identity, expected) {
            (None, _) => return false,
            (Some(current), Some(target)) if current != target => {
                debug!("Ignoring teardown for {}: current link is {}", target, current);
                return false;
            }
            _ => {}
        }
        inner.identity = None;
        inner.generation += 1;
        true
    }

    /// Run the cleanup half of a teardown. Call only after winning
    /// [`Shared::begin_teardown`].
    async fn finish_teardown(&self, cause: TeardownCause) {
        let poller = self.poll_task.write().take();
        if let Some(handle) = poller {
            if cause.aborts_poller() {
                handle.abort();
            }
        }
        if cause.closes_link() {
            if let Err(e) = self.transport.disconnect().await {
                warn!("Transport disconnect failed during teardown: {}", e);
            }
        }
        self.set_state(SessionState::Idle);
        if cause.announces() {
            self.publish_status("Device disconnected");
        }
    }

    /// Tear down the current link if `expected` still matches it.
    async fn teardown(&self, expected: Option<&PeripheralIdentity>, cause: TeardownCause) -> bool {
        if !self.begin_teardown(expected) {
            return false;
        }
        self.finish_teardown(cause).await;
        true
    }

    /// Teardown entry point for the acquisition task itself.
    ///
    /// The alert fires only when this call actually won the teardown, so
    /// a race with an external disconnect reports exactly one cause.
    pub(crate) async fn fail_from_poller(&self, error: Error) {
        if !self.begin_teardown(None) {
            debug!("Acquisition fault after teardown already ran: {}", error);
            return;
        }
        warn!("Tearing down session: {}", error);
        self.publish_alert(&error);
        self.finish_teardown(TeardownCause::PollFailure).await;
    }

    /// React to the transport reporting the link gone.
    async fn handle_external_disconnect(&self, identity: &PeripheralIdentity) {
        if self.begin_teardown(Some(identity)) {
            warn!("Link to {} lost", identity);
            self.finish_teardown(TeardownCause::LinkLost).await;
        }
    }

    /// Wind down a scan from inside the scan task itself.
    async fn finish_scan(&self) {
        if let Err(e) = self.transport.stop_scan().await {
            warn!("Failed to stop transport scan: {}", e);
        }
        self.set_state(SessionState::Idle);
        // The scan task cannot await its own handle; drop it so a later
        // stop or start finds the slot empty.
        self.scan_task.write().take();
    }
}

/// A session with one Fluxmon flow meter.
///
/// The session is a value: create one per target device, drive it with
/// [`Session::start_scan`] and [`Session::connect`], and observe it via
/// [`Session::subscribe_events`] and [`Session::subscribe_snapshots`].
/// Dropping the session aborts its background tasks.
pub struct Session<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> Session<T> {
    /// Create a session with the default endpoint layout and configuration.
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, EndpointRegistry::default(), SessionConfig::default())
    }

    /// Create a session with an explicit endpoint layout and configuration.
    pub fn with_config(transport: T, registry: EndpointRegistry, config: SessionConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let (snapshot_tx, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            transport: Arc::new(transport),
            registry,
            config,
            inner: Mutex::new(SessionInner::new()),
            event_tx,
            snapshot_tx,
            scan_task: RwLock::new(None),
            poll_task: RwLock::new(None),
            monitor_task: RwLock::new(None),
            callback_counter: AtomicU64::new(0),
        });

        // Watch for the transport dropping the link out from under us.
        let mut link_rx = shared.transport.link_events();
        let monitor_shared = Arc::clone(&shared);
        let handle = tokio::spawn(async move {
            loop {
                match link_rx.recv().await {
                    Ok(LinkEvent::Disconnected(identity)) => {
                        monitor_shared.handle_external_disconnect(&identity).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Link monitor lagged, {} events dropped", missed);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Link monitor ended");
        });
        *shared.monitor_task.write() = Some(handle);

        Self { shared }
    }

    // === Scanning ===

    /// Start scanning for peripherals advertising the configured name.
    ///
    /// Waits for the radio to power on first, retrying per the session
    /// configuration. The scan stops on its own after the configured
    /// timeout. Requests issued while a scan is already running, or while
    /// a link is up, are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the radio never powers on or the transport
    /// cannot start scanning.
    pub async fn start_scan(&self) -> Result<()> {
        {
            let inner = self.shared.inner.lock();
            match inner.state {
                SessionState::Idle => {}
                SessionState::Scanning => {
                    debug!("Already scanning, ignoring start request");
                    return Ok(());
                }
                other => {
                    warn!("Cannot start a scan while {}", other);
                    return Ok(());
                }
            }
        }

        self.wait_for_radio().await?;

        {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Idle {
                debug!("Scan pre-empted while waiting for the radio");
                return Ok(());
            }
            inner.scan_results.clear();
            inner.state = SessionState::Scanning;
        }
        self.shared.publish_event(SessionEvent::StateChanged(SessionState::Scanning));
        self.shared.publish_event(SessionEvent::ScanResults(Vec::new()));
        self.shared
            .publish_status(format!("Scanning for {}...", self.shared.config.device_name));

        // Take the receiver before starting so no advertisement can slip
        // between the two.
        let advertisements = self.shared.transport.advertisements();
        if let Err(error) = self.shared.transport.start_scan().await {
            warn!("Failed to start scan: {}", error);
            self.shared.set_state(SessionState::Idle);
            self.shared.publish_alert(&error);
            return Err(error);
        }
        info!("Scanning for {}", self.shared.config.device_name);

        let shared = Arc::clone(&self.shared);
        let deadline = tokio::time::Instant::now() + self.shared.config.scan_timeout;
        let handle = tokio::spawn(async move {
            scan_loop(shared, advertisements, deadline).await;
        });
        *self.shared.scan_task.write() = Some(handle);

        Ok(())
    }

    /// Stop a running scan. Does nothing if no scan is active.
    pub async fn stop_scan(&self) {
        let was_scanning = {
            let mut inner = self.shared.inner.lock();
            if inner.state == SessionState::Scanning {
                inner.state = SessionState::Idle;
                true
            } else {
                false
            }
        };
        if !was_scanning {
            debug!("Not scanning, ignoring stop request");
            return;
        }
        self.shared.publish_event(SessionEvent::StateChanged(SessionState::Idle));

        if let Err(e) = self.shared.transport.stop_scan().await {
            warn!("Failed to stop transport scan: {}", e);
        }

        // Wait for the scan task to notice the state change and exit.
        let handle = self.shared.scan_task.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Scan stopped");
    }

    /// Poll the radio until it reports powered-on.
    async fn wait_for_radio(&self) -> Result<()> {
        let attempts = self.shared.config.radio_poll_attempts.max(1);
        let mut last_state = RadioState::Unknown;
        for attempt in 1..=attempts {
            match self.shared.transport.radio_state().await {
                Ok(state) if state.is_powered_on() => {
                    debug!("Radio powered on (attempt {})", attempt);
                    return Ok(());
                }
                Ok(state) => {
                    debug!("Radio not ready (attempt {}): {}", attempt, state);
                    last_state = state;
                }
                Err(e) => {
                    warn!("Failed to query radio state (attempt {}): {}", attempt, e);
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.shared.config.radio_poll_interval).await;
            }
        }
        let error = Error::RadioUnavailable {
            state: last_state.to_string(),
        };
        self.shared.publish_status("Bluetooth radio unavailable");
        self.shared.publish_alert(&error);
        Err(error)
    }

    // === Connection ===

    /// Connect to a peripheral and bring the session up to live acquisition.
    ///
    /// Stops any running scan, replaces an established link, walks through
    /// service discovery and the one-shot identification reads, then starts
    /// the acquisition task. A failed attempt leaves the session idle.
    ///
    /// # Errors
    ///
    /// Returns an error if another attempt is already in flight, if any
    /// connection phase fails, or if the attempt is superseded by a
    /// concurrent teardown.
    pub async fn connect(&self, identity: &PeripheralIdentity) -> Result<()> {
        let (state, current) = {
            let inner = self.shared.inner.lock();
            (inner.state, inner.identity.clone())
        };
        match state {
            SessionState::Scanning => self.stop_scan().await,
            SessionState::Connecting
            | SessionState::Discovering
            | SessionState::ReadingStatic => {
                return Err(Error::ConnectFailed {
                    reason: "connection attempt already in progress".to_string(),
                });
            }
            SessionState::Polling | SessionState::Disconnecting => {
                if let Some(current) = current {
                    debug!("Replacing link to {}", current);
                    self.shared
                        .teardown(Some(&current), TeardownCause::UserRequest)
                        .await;
                }
            }
            SessionState::Idle | SessionState::Error => {}
        }

        // Claim the session for this attempt.
        let generation = {
            let mut inner = self.shared.inner.lock();
            if inner.state != SessionState::Idle {
                return Err(Error::ConnectFailed {
                    reason: "connection attempt already in progress".to_string(),
                });
            }
            inner.generation += 1;
            inner.identity = Some(identity.clone());
            inner.static_info = StaticInfo::default();
            inner.staged = TelemetrySnapshot::new(inner.generation);
            inner.last_published = None;
            inner.state = SessionState::Connecting;
            inner.generation
        };
        self.shared.publish_event(SessionEvent::StateChanged(SessionState::Connecting));
        info!("Connecting to {}", identity);

        if let Err(error) = self.shared.transport.connect(identity).await {
            return Err(self.connect_failure(generation, error).await);
        }
        self.ensure_current(generation, "connect").await?;

        self.shared.set_state(SessionState::Discovering);
        self.shared.publish_status("Connected, discovering services...");

        let services = match self.shared.transport.discover_services().await {
            Ok(services) => services,
            Err(error) => return Err(self.connect_failure(generation, error).await),
        };
        for descriptor in self.shared.registry.endpoints() {
            let present = services.iter().any(|service| {
                service.uuid == descriptor.service
                    && service.has_characteristic(descriptor.characteristic)
            });
            if !present {
                let error = Error::DiscoveryFailed {
                    reason: format!(
                        "endpoint {} not present (service {}, characteristic {})",
                        descriptor.signal, descriptor.service, descriptor.characteristic
                    ),
                };
                return Err(self.connect_failure(generation, error).await);
            }
        }
        debug!("All {} endpoints resolved", self.shared.registry.endpoints().len());

        // Some firmware revisions drop reads issued immediately after
        // discovery; give the peripheral a moment.
        tokio::time::sleep(self.shared.config.settle_delay).await;
        self.ensure_current(generation, "service discovery").await?;

        self.shared.set_state(SessionState::ReadingStatic);
        self.read_static(generation).await?;
        self.ensure_current(generation, "static reads").await?;

        self.shared.set_state(SessionState::Polling);
        match self.shared.config.acquisition {
            AcquisitionMode::Poll => self.shared.publish_status("Polling live data..."),
            AcquisitionMode::Notify => self.shared.publish_status("Streaming live data..."),
        }
        info!(
            "Session established with {} ({} mode)",
            identity,
            self.shared.config.acquisition.name()
        );

        let handle = poller::spawn(Arc::clone(&self.shared), generation);
        *self.shared.poll_task.write() = Some(handle);

        Ok(())
    }

    /// Disconnect from the current peripheral, or stop a running scan.
    ///
    /// Does nothing if the session is already idle.
    pub async fn disconnect(&self) {
        if self.shared.inner.lock().state == SessionState::Scanning {
            self.stop_scan().await;
            return;
        }
        let identity = {
            let mut inner = self.shared.inner.lock();
            let Some(identity) = inner.identity.take() else {
                debug!("No active link, ignoring disconnect request");
                return;
            };
            inner.generation += 1;
            inner.state = SessionState::Disconnecting;
            identity
        };
        info!("Disconnecting from {}", identity);
        self.shared.publish_event(SessionEvent::StateChanged(SessionState::Disconnecting));
        self.shared.finish_teardown(TeardownCause::UserRequest).await;
    }

    /// Fail a connection attempt: flag the error, tear down, return the
    /// error for the caller to propagate.
    async fn connect_failure(&self, generation: u64, error: Error) -> Error {
        warn!("Connection attempt failed: {}", error);
        if self.shared.is_generation_live(generation) {
            self.shared.set_state(SessionState::Error);
            self.shared.teardown(None, TeardownCause::FailedAttempt).await;
        }
        self.shared.publish_alert(&error);
        error
    }

    /// Bail out of a connection attempt that lost its generation.
    async fn ensure_current(&self, generation: u64, phase: &str) -> Result<()> {
        if self.shared.is_generation_live(generation) {
            return Ok(());
        }
        debug!("Connection attempt superseded after {}", phase);
        // The transport link may still be half-open; close it rather than
        // leak it.
        if let Err(e) = self.shared.transport.disconnect().await {
            debug!("Cleanup disconnect failed: {}", e);
        }
        Err(Error::ConnectFailed {
            reason: "superseded by a concurrent teardown".to_string(),
        })
    }

    /// Read the one-shot identification characteristics.
    ///
    /// A read fault here is reported but does not fail the connection;
    /// live acquisition starts without the identification fields.
    async fn read_static(&self, generation: u64) -> Result<()> {
        let endpoints: Vec<EndpointDescriptor> =
            self.shared.registry.static_endpoints().copied().collect();
        for descriptor in endpoints {
            self.ensure_current(generation, "static reads").await?;
            let data = match self
                .shared
                .transport
                .read(descriptor.service, descriptor.characteristic)
                .await
            {
                Ok(data) => data,
                Err(error) => {
                    warn!("Failed to read {}: {}", descriptor.signal, error);
                    self.shared.publish_status("Failed to read device identification");
                    self.shared.publish_alert(&Error::StaticReadFailed {
                        reason: format!("{}: {}", descriptor.signal, error),
                    });
                    break;
                }
            };
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                continue;
            }
            match descriptor.signal {
                Signal::Serial => {
                    inner.static_info.serial_number = codec::decode_utf8(&data);
                }
                Signal::LotExpiry => {
                    let (lot, expiry) = codec::decode_delimited_text(&data);
                    inner.static_info.lot_code = lot;
                    inner.static_info.expiry = expiry;
                }
                other => {
                    trace!("No identification decode rule for {}", other);
                }
            }
            let info = inner.static_info.clone();
            inner.staged.apply_static(&info);
        }

        let info = self.shared.inner.lock().static_info.clone();
        if info.is_populated() {
            info!(
                "Device identification: serial {}, lot {}, expires {}",
                info.serial_number, info.lot_code, info.expiry
            );
        }
        Ok(())
    }

    // === Commands ===

    /// Write a one-byte command to a writable signal.
    ///
    /// # Errors
    ///
    /// Returns an error if no link is up, the signal is not writable, or
    /// the transport write fails.
    pub async fn send_command(&self, signal: Signal, value: u8) -> Result<()> {
        {
            let inner = self.shared.inner.lock();
            if inner.identity.is_none() || !inner.state.has_link() {
                return Err(Error::NotConnected);
            }
        }
        let descriptor = self
            .shared
            .registry
            .endpoint(signal)
            .copied()
            .ok_or(Error::NotWritable { signal })?;
        if descriptor.direction != Direction::Write {
            return Err(Error::NotWritable { signal });
        }

        let payload = codec::encode_command_byte(value);
        if let Err(error) = self
            .shared
            .transport
            .write(descriptor.service, descriptor.characteristic, &payload)
            .await
        {
            let error = Error::CommandWriteFailed {
                signal,
                reason: error.to_string(),
            };
            warn!("{}", error);
            self.shared.publish_alert(&error);
            return Err(error);
        }
        debug!("Wrote command {:#04x} to {}", value, signal);
        Ok(())
    }

    /// Reset the cumulative volume of one meter bank.
    ///
    /// On success the local snapshot is zeroed and republished right away
    /// so displays drop without waiting for the next acquisition cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if no link is up or the command write fails.
    pub async fn reset_volume(&self, meter: Meter) -> Result<()> {
        let generation = {
            let inner = self.shared.inner.lock();
            if inner.identity.is_none() || !inner.state.has_link() {
                return Err(Error::NotConnected);
            }
            inner.generation
        };

        self.send_command(meter.reset_signal(), codec::RESET_COMMAND).await?;

        let snapshot = {
            let mut inner = self.shared.inner.lock();
            if inner.generation != generation {
                debug!("Link replaced before the reset could be recorded");
                return Ok(());
            }
            inner.staged.zero_volume(meter);
            inner.staged.captured_at = Utc::now();
            let snapshot = inner.staged.clone();
            inner.last_published = Some(snapshot.clone());
            snapshot
        };
        let _ = self.shared.snapshot_tx.send(snapshot);
        self.shared.publish_status("Reset command sent.");
        info!("Totalizer {} reset", meter);
        Ok(())
    }

    // === Accessors ===

    /// Get the current session state.
    pub fn state(&self) -> SessionState {
        self.shared.inner.lock().state
    }

    /// Get the current link generation.
    pub fn generation(&self) -> u64 {
        self.shared.inner.lock().generation
    }

    /// Whether a link is up or being established.
    pub fn is_connected(&self) -> bool {
        let inner = self.shared.inner.lock();
        inner.identity.is_some() && inner.state.has_link()
    }

    /// Get the identity of the connected peripheral, if any.
    pub fn peripheral(&self) -> Option<PeripheralIdentity> {
        self.shared.inner.lock().identity.clone()
    }

    /// Get the identification fields read after the last connect.
    pub fn static_info(&self) -> StaticInfo {
        self.shared.inner.lock().static_info.clone()
    }

    /// Get the most recently published telemetry snapshot.
    pub fn latest_snapshot(&self) -> Option<TelemetrySnapshot> {
        self.shared.inner.lock().last_published.clone()
    }

    /// Get the ordered scan results collected so far.
    pub fn scan_results(&self) -> Vec<Advertisement> {
        self.shared.inner.lock().scan_results.entries().to_vec()
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    /// Get the endpoint registry this session drives.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.shared.registry
    }

    /// Get the underlying transport.
    pub fn transport(&self) -> &T {
        &self.shared.transport
    }

    // === Subscriptions ===

    /// Subscribe to lifecycle events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Subscribe to telemetry snapshots.
    pub fn subscribe_snapshots(&self) -> broadcast::Receiver<TelemetrySnapshot> {
        self.shared.snapshot_tx.subscribe()
    }

    /// Register a callback for telemetry snapshots.
    pub fn on_snapshot<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&TelemetrySnapshot) + Send + Sync + 'static,
    {
        let callback_id = self.shared.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.snapshot_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(snapshot) = rx.recv().await {
                callback(&snapshot);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for state changes.
    pub fn on_state_change<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(SessionState) + Send + Sync + 'static,
    {
        let callback_id = self.shared.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.shared.event_tx.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let SessionEvent::StateChanged(state) = event {
                    callback(state);
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Disconnect, stop scanning, and stop the link monitor.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.stop_scan().await;
        if let Some(handle) = self.shared.monitor_task.write().take() {
            handle.abort();
        }
        info!("Session shut down");
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        for slot in [
            &self.shared.scan_task,
            &self.shared.poll_task,
            &self.shared.monitor_task,
        ] {
            if let Some(handle) = slot.write().take() {
                handle.abort();
            }
        }
    }
}

/// Scan task body: filter advertisements by name, keep the result list
/// ordered, stop on timeout or when the state leaves `Scanning`.
async fn scan_loop<T: Transport>(
    shared: Arc<Shared<T>>,
    mut advertisements: broadcast::Receiver<Advertisement>,
    deadline: tokio::time::Instant,
) {
    loop {
        if shared.inner.lock().state != SessionState::Scanning {
            break;
        }
        tokio::select! {
            received = advertisements.recv() => match received {
                Ok(advertisement) => {
                    if advertisement.identity.name != shared.config.device_name {
                        trace!("Ignoring advertisement from {}", advertisement.identity);
                        continue;
                    }
                    let is_new = {
                        let mut inner = shared.inner.lock();
                        if inner.state != SessionState::Scanning {
                            break;
                        }
                        inner.scan_results.insert(advertisement.clone())
                    };
                    if is_new {
                        info!("Discovered {}", advertisement.identity);
                        shared.publish_scan_results();
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Advertisement stream lagged, {} dropped", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::time::sleep_until(deadline) => {
                info!("Scan window elapsed");
                shared.publish_status("Scan timeout, stopping scan.");
                shared.finish_scan().await;
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {
                // Re-check the state flag at the top of the loop.
            }
        }
    }
    debug!("Scan loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport_mock::MockTransport;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_session_state_helpers() {
        assert!(SessionState::Idle.is_idle());
        assert!(SessionState::Scanning.is_scanning());
        assert!(SessionState::Polling.is_polling());
        assert!(SessionState::Connecting.has_link());
        assert!(SessionState::Discovering.has_link());
        assert!(SessionState::ReadingStatic.has_link());
        assert!(SessionState::Polling.has_link());
        assert!(!SessionState::Idle.has_link());
        assert!(!SessionState::Scanning.has_link());
        assert!(!SessionState::Disconnecting.has_link());
        assert!(!SessionState::Error.has_link());
    }

    #[test]
    fn test_session_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "Idle");
        assert_eq!(SessionState::ReadingStatic.to_string(), "ReadingStatic");
        assert_eq!(SessionState::default(), SessionState::Idle);
    }

    #[test]
    fn test_callback_handle_unregisters_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let handle = CallbackHandle::new(7, move || {
            flag.store(true, Ordering::SeqCst);
        });
        assert_eq!(handle.id(), 7);
        drop(handle);
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_teardown_cause_rules() {
        assert!(TeardownCause::UserRequest.closes_link());
        assert!(!TeardownCause::LinkLost.closes_link());
        assert!(!TeardownCause::PollFailure.aborts_poller());
        assert!(TeardownCause::LinkLost.aborts_poller());
        assert!(!TeardownCause::FailedAttempt.announces());
        assert!(TeardownCause::PollFailure.announces());
    }

    #[tokio::test]
    async fn test_new_session_is_idle() {
        let session = Session::new(MockTransport::with_fluxmon_defaults());
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.is_connected());
        assert!(session.peripheral().is_none());
        assert!(session.latest_snapshot().is_none());
        assert!(session.scan_results().is_empty());
        assert_eq!(session.generation(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_scan_requires_powered_radio() {
        let transport = MockTransport::with_fluxmon_defaults();
        transport.set_radio_state(crate::transport::RadioState::PoweredOff);
        let session = Session::with_config(
            transport,
            EndpointRegistry::default(),
            SessionConfig::new().with_radio_poll(2, Duration::from_millis(50)),
        );

        let result = session.start_scan().await;
        assert!(matches!(result, Err(Error::RadioUnavailable { .. })));
        assert_eq!(session.state(), SessionState::Idle);
        assert!(!session.transport().is_scanning());
    }

    #[tokio::test]
    async fn test_stop_scan_when_idle_is_noop() {
        let session = Session::new(MockTransport::with_fluxmon_defaults());
        session.stop_scan().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_send_command_requires_link() {
        let session = Session::new(MockTransport::with_fluxmon_defaults());
        let result = session.send_command(Signal::ResetA, codec::RESET_COMMAND).await;
        assert!(matches!(result, Err(Error::NotConnected)));
        let result = session.reset_volume(Meter::B).await;
        assert!(matches!(result, Err(Error::NotConnected)));
    }
}
