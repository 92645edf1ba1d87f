//! Scripted in-memory transport.
//!
//! Implements [`Transport`] without hardware so session behavior can be
//! exercised deterministically: seed advertisements and characteristic
//! values, inject failures at precise points, and drop the link on
//! command. Used by the integration tests and handy for demos on
//! machines without a radio.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::codec;
use crate::config::SessionConfig;
use crate::endpoint::{self, EndpointRegistry};
use crate::error::{Error, Result};
use crate::transport::{
    Advertisement, GattService, LinkEvent, Notification, PeripheralIdentity, RadioState, Transport,
};

#[derive(Debug, Default)]
struct MockInner {
    radio: Option<RadioState>,
    devices: Vec<Advertisement>,
    services: Vec<GattService>,
    values: HashMap<(Uuid, Uuid), Vec<u8>>,
    connected: Option<PeripheralIdentity>,
    scanning: bool,
    connect_failure: Option<String>,
    read_failures: HashMap<Uuid, u32>,
    read_counts: HashMap<Uuid, u32>,
    total_reads: u32,
    drop_link_after_reads: Option<u32>,
    fail_writes: bool,
    fail_subscribe: bool,
    writes: Vec<(Uuid, Uuid, Vec<u8>)>,
    subscriptions: Vec<(Uuid, Uuid)>,
}

/// In-memory [`Transport`] with scripted behavior.
pub struct MockTransport {
    inner: Mutex<MockInner>,
    advertisement_tx: broadcast::Sender<Advertisement>,
    notification_tx: broadcast::Sender<Notification>,
    link_tx: broadcast::Sender<LinkEvent>,
}

impl MockTransport {
    /// Create an empty transport with the radio powered on.
    pub fn new() -> Self {
        let (advertisement_tx, _) = broadcast::channel(100);
        let (notification_tx, _) = broadcast::channel(256);
        let (link_tx, _) = broadcast::channel(16);

        Self {
            inner: Mutex::new(MockInner::default()),
            advertisement_tx,
            notification_tx,
            link_tx,
        }
    }

    /// Create a transport preloaded with one canonical meter.
    ///
    /// The device advertises under the default name and serves the
    /// [`EndpointRegistry::fluxmon_v2`] topology with plausible bench
    /// values (serial `SN-001`, lot `B7_2027-05-01`, 12.34 L at
    /// 0.55 L/min on bank A, 3.301 V supply).
    pub fn with_fluxmon_defaults() -> Self {
        let transport = Self::new();

        transport.advertise(
            PeripheralIdentity::new("mock-meter-1", SessionConfig::DEFAULT_DEVICE_NAME),
            Some(-61),
        );
        transport.serve_registry(&EndpointRegistry::fluxmon_v2());

        transport.set_text(
            endpoint::STATIC_SERVICE_UUID,
            endpoint::SERIAL_NUMBER_UUID,
            "SN-001",
        );
        transport.set_text(
            endpoint::STATIC_SERVICE_UUID,
            endpoint::LOT_EXPIRY_UUID,
            "B7_2027-05-01",
        );
        transport.set_float(endpoint::METER_A_SERVICE_UUID, endpoint::LITERS_A_UUID, 12.34);
        transport.set_float(endpoint::METER_A_SERVICE_UUID, endpoint::FLOW_A_UUID, 0.55);
        transport.set_float(
            endpoint::METER_A_SERVICE_UUID,
            endpoint::SUPPLY_VOLTAGE_UUID,
            3.301,
        );
        transport.set_float(endpoint::METER_B_SERVICE_UUID, endpoint::LITERS_B_UUID, 0.0);
        transport.set_float(endpoint::METER_B_SERVICE_UUID, endpoint::FLOW_B_UUID, 0.0);

        transport
    }

    /// Set the reported radio state. Defaults to powered on.
    pub fn set_radio_state(&self, state: RadioState) {
        self.inner.lock().radio = Some(state);
    }

    /// Add a peripheral to the airwaves.
    ///
    /// Broadcast immediately when a scan is active, otherwise delivered
    /// when the next scan starts.
    pub fn advertise(&self, identity: PeripheralIdentity, rssi: Option<i16>) {
        let advertisement = Advertisement { identity, rssi };
        let scanning = {
            let mut inner = self.inner.lock();
            inner.devices.push(advertisement.clone());
            inner.scanning
        };
        if scanning {
            let _ = self.advertisement_tx.send(advertisement);
        }
    }

    /// Serve the GATT topology implied by a registry's endpoint table.
    pub fn serve_registry(&self, registry: &EndpointRegistry) {
        let mut services: Vec<GattService> = Vec::new();
        for descriptor in registry.endpoints() {
            match services.iter_mut().find(|s| s.uuid == descriptor.service) {
                Some(service) => service.characteristics.push(descriptor.characteristic),
                None => services.push(GattService {
                    uuid: descriptor.service,
                    characteristics: vec![descriptor.characteristic],
                }),
            }
        }
        self.inner.lock().services = services;
    }

    /// Serve an explicit GATT topology.
    pub fn serve_topology(&self, services: Vec<GattService>) {
        self.inner.lock().services = services;
    }

    /// Set the raw payload a characteristic read returns.
    ///
    /// Characteristics in the topology without a value read as empty.
    pub fn set_value(&self, service: Uuid, characteristic: Uuid, data: Vec<u8>) {
        self.inner.lock().values.insert((service, characteristic), data);
    }

    /// Set a float characteristic value.
    pub fn set_float(&self, service: Uuid, characteristic: Uuid, value: f32) {
        self.set_value(service, characteristic, value.to_le_bytes().to_vec());
    }

    /// Set a text characteristic value.
    pub fn set_text(&self, service: Uuid, characteristic: Uuid, text: &str) {
        self.set_value(service, characteristic, text.as_bytes().to_vec());
    }

    /// Make the next `connect` call fail.
    pub fn fail_connect(&self, reason: &str) {
        self.inner.lock().connect_failure = Some(reason.to_string());
    }

    /// Fail the `attempt`-th read (1-based) of one characteristic.
    pub fn fail_read_at(&self, characteristic: Uuid, attempt: u32) {
        self.inner.lock().read_failures.insert(characteristic, attempt);
    }

    /// Drop the link once `total` reads have completed, as a peripheral
    /// dying between two reads would.
    pub fn drop_link_after_reads(&self, total: u32) {
        self.inner.lock().drop_link_after_reads = Some(total);
    }

    /// Fail all writes.
    pub fn fail_writes(&self, fail: bool) {
        self.inner.lock().fail_writes = fail;
    }

    /// Fail all notification subscriptions.
    pub fn fail_subscribe(&self, fail: bool) {
        self.inner.lock().fail_subscribe = fail;
    }

    /// Sever the active link immediately and fire the link-loss event.
    pub fn drop_link(&self) {
        let identity = self.inner.lock().connected.take();
        if let Some(identity) = identity {
            let _ = self.link_tx.send(LinkEvent::Disconnected(identity));
        }
    }

    /// Push a notification to subscribers of the notification stream.
    pub fn push_notification(&self, characteristic: Uuid, data: Vec<u8>) {
        let _ = self.notification_tx.send(Notification {
            characteristic,
            data,
        });
    }

    /// Push a float notification.
    pub fn push_float_notification(&self, characteristic: Uuid, value: f32) {
        self.push_notification(characteristic, value.to_le_bytes().to_vec());
    }

    /// Identity of the currently linked peripheral, if any.
    pub fn connected_peripheral(&self) -> Option<PeripheralIdentity> {
        self.inner.lock().connected.clone()
    }

    /// Check whether a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scanning
    }

    /// Reads issued against one characteristic so far.
    pub fn read_count(&self, characteristic: Uuid) -> u32 {
        self.inner
            .lock()
            .read_counts
            .get(&characteristic)
            .copied()
            .unwrap_or(0)
    }

    /// Total reads issued across all characteristics.
    pub fn total_reads(&self) -> u32 {
        self.inner.lock().total_reads
    }

    /// Every write issued, in order.
    pub fn writes(&self) -> Vec<(Uuid, Uuid, Vec<u8>)> {
        self.inner.lock().writes.clone()
    }

    /// Every subscription issued, in order.
    pub fn subscriptions(&self) -> Vec<(Uuid, Uuid)> {
        self.inner.lock().subscriptions.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn radio_state(&self) -> Result<RadioState> {
        Ok(self.inner.lock().radio.unwrap_or(RadioState::PoweredOn))
    }

    async fn start_scan(&self) -> Result<()> {
        let devices = {
            let mut inner = self.inner.lock();
            inner.scanning = true;
            inner.devices.clone()
        };
        for advertisement in devices {
            let _ = self.advertisement_tx.send(advertisement);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.inner.lock().scanning = false;
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<Advertisement> {
        self.advertisement_tx.subscribe()
    }

    async fn connect(&self, identity: &PeripheralIdentity) -> Result<()> {
        let mut inner = self.inner.lock();

        if let Some(reason) = inner.connect_failure.take() {
            return Err(Error::ConnectFailed { reason });
        }

        let known = inner.devices.iter().any(|d| d.identity.id == identity.id);
        if !known {
            return Err(Error::PeripheralNotFound {
                identifier: identity.id.clone(),
            });
        }

        inner.connected = Some(identity.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        // Requested disconnects are silent; only drop_link reports a loss.
        self.inner.lock().connected.take();
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        let inner = self.inner.lock();
        if inner.connected.is_none() {
            return Err(Error::NotConnected);
        }
        Ok(inner.services.clone())
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let (data, drop_now) = {
            let mut inner = self.inner.lock();
            if inner.connected.is_none() {
                return Err(Error::NotConnected);
            }

            let attempt = inner.read_counts.entry(characteristic).or_insert(0);
            *attempt += 1;
            let attempt = *attempt;
            inner.total_reads += 1;

            if inner.read_failures.get(&characteristic) == Some(&attempt) {
                return Err(Error::NotConnected);
            }

            let data = inner
                .values
                .get(&(service, characteristic))
                .cloned()
                .unwrap_or_default();

            let drop_now = inner.drop_link_after_reads == Some(inner.total_reads);
            (data, drop_now)
        };

        if drop_now {
            self.drop_link();
        }

        Ok(data)
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.connected.is_none() {
            return Err(Error::NotConnected);
        }
        if inner.fail_writes {
            return Err(Error::NotConnected);
        }

        inner.writes.push((service, characteristic, data.to_vec()));

        // Mirror the firmware: a reset write zeroes the backing totalizer.
        if data == [codec::RESET_COMMAND] {
            let zeroed = match characteristic {
                c if c == endpoint::RESET_A_UUID => {
                    Some((endpoint::METER_A_SERVICE_UUID, endpoint::LITERS_A_UUID))
                }
                c if c == endpoint::RESET_B_UUID => {
                    Some((endpoint::METER_B_SERVICE_UUID, endpoint::LITERS_B_UUID))
                }
                _ => None,
            };
            if let Some(key) = zeroed {
                inner.values.insert(key, 0f32.to_le_bytes().to_vec());
            }
        }

        Ok(())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.connected.is_none() {
            return Err(Error::NotConnected);
        }
        if inner.fail_subscribe {
            return Err(Error::NotConnected);
        }

        inner.subscriptions.push((service, characteristic));
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notification_tx.subscribe()
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn meter_identity() -> PeripheralIdentity {
        PeripheralIdentity::new("mock-meter-1", SessionConfig::DEFAULT_DEVICE_NAME)
    }

    #[tokio::test]
    async fn test_scan_replays_seeded_devices() {
        let transport = MockTransport::with_fluxmon_defaults();
        let mut advertisements = transport.advertisements();

        transport.start_scan().await.unwrap();

        let advertisement = advertisements.recv().await.unwrap();
        assert_eq!(advertisement.identity, meter_identity());
        assert_eq!(advertisement.rssi, Some(-61));
    }

    #[tokio::test]
    async fn test_advertise_mid_scan_broadcasts() {
        let transport = MockTransport::new();
        let mut advertisements = transport.advertisements();

        transport.start_scan().await.unwrap();
        transport.advertise(PeripheralIdentity::new("late", "Other"), None);

        let advertisement = advertisements.recv().await.unwrap();
        assert_eq!(advertisement.identity.id, "late");
    }

    #[tokio::test]
    async fn test_connect_unknown_peripheral() {
        let transport = MockTransport::new();
        let result = transport
            .connect(&PeripheralIdentity::new("ghost", "Nothing"))
            .await;

        assert!(matches!(result, Err(Error::PeripheralNotFound { .. })));
    }

    #[tokio::test]
    async fn test_connect_failure_is_one_shot() {
        let transport = MockTransport::with_fluxmon_defaults();
        transport.fail_connect("interference");

        let first = transport.connect(&meter_identity()).await;
        assert!(matches!(first, Err(Error::ConnectFailed { .. })));

        transport.connect(&meter_identity()).await.unwrap();
        assert_eq!(transport.connected_peripheral(), Some(meter_identity()));
    }

    #[tokio::test]
    async fn test_read_requires_link() {
        let transport = MockTransport::with_fluxmon_defaults();
        let result = transport
            .read(endpoint::METER_A_SERVICE_UUID, endpoint::LITERS_A_UUID)
            .await;

        assert!(matches!(result, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_scripted_read_failure() {
        let transport = MockTransport::with_fluxmon_defaults();
        transport.connect(&meter_identity()).await.unwrap();
        transport.fail_read_at(endpoint::LITERS_A_UUID, 2);

        let first = transport
            .read(endpoint::METER_A_SERVICE_UUID, endpoint::LITERS_A_UUID)
            .await;
        assert!(first.is_ok());

        let second = transport
            .read(endpoint::METER_A_SERVICE_UUID, endpoint::LITERS_A_UUID)
            .await;
        assert!(second.is_err());

        assert_eq!(transport.read_count(endpoint::LITERS_A_UUID), 2);
    }

    #[tokio::test]
    async fn test_drop_link_after_reads_fires_event() {
        let transport = MockTransport::with_fluxmon_defaults();
        let mut link_events = transport.link_events();

        transport.connect(&meter_identity()).await.unwrap();
        transport.drop_link_after_reads(1);

        transport
            .read(endpoint::METER_A_SERVICE_UUID, endpoint::LITERS_A_UUID)
            .await
            .unwrap();

        let LinkEvent::Disconnected(identity) = link_events.recv().await.unwrap();
        assert_eq!(identity, meter_identity());
        assert_eq!(transport.connected_peripheral(), None);
    }

    #[tokio::test]
    async fn test_reset_write_zeroes_backing_value() {
        let transport = MockTransport::with_fluxmon_defaults();
        transport.connect(&meter_identity()).await.unwrap();

        transport
            .write(
                endpoint::COMMAND_SERVICE_UUID,
                endpoint::RESET_A_UUID,
                &[codec::RESET_COMMAND],
            )
            .await
            .unwrap();

        let data = transport
            .read(endpoint::METER_A_SERVICE_UUID, endpoint::LITERS_A_UUID)
            .await
            .unwrap();
        assert_eq!(codec::decode_float32_le(&data).unwrap(), 0.0);

        assert_eq!(transport.writes().len(), 1);
    }

    #[tokio::test]
    async fn test_discover_matches_registry_topology() {
        let transport = MockTransport::with_fluxmon_defaults();
        transport.connect(&meter_identity()).await.unwrap();

        let services = transport.discover_services().await.unwrap();
        assert_eq!(services.len(), 4);

        let registry = EndpointRegistry::fluxmon_v2();
        for descriptor in registry.endpoints() {
            let service = services.iter().find(|s| s.uuid == descriptor.service);
            assert!(service.unwrap().has_characteristic(descriptor.characteristic));
        }
    }
}
