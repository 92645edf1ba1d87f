//! btleplug-backed transport.
//!
//! One [`BleTransport`] wraps one platform adapter. A background task pumps
//! adapter events into the advertisement and link-event channels; a second
//! task, started per connection, pumps characteristic notifications.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::transport::{
    Advertisement, GattService, LinkEvent, Notification, PeripheralIdentity, RadioState, Transport,
};

/// The peripheral this transport currently holds a link to.
struct ActiveLink {
    /// Identity the link was opened with.
    identity: PeripheralIdentity,
    /// Platform peripheral handle.
    peripheral: Peripheral,
    /// Characteristics cached at discovery, keyed by (service, characteristic).
    characteristics: HashMap<(Uuid, Uuid), Characteristic>,
}

/// [`Transport`] implementation over a real Bluetooth adapter.
pub struct BleTransport {
    /// The BLE adapter all traffic goes through.
    adapter: Adapter,
    /// Peripherals seen while scanning, by platform identifier.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// The active link, if any.
    connected: Arc<RwLock<Option<ActiveLink>>>,
    /// Channel for advertisements.
    advertisement_tx: broadcast::Sender<Advertisement>,
    /// Channel for characteristic notifications.
    notification_tx: broadcast::Sender<Notification>,
    /// Channel for link loss events.
    link_tx: broadcast::Sender<LinkEvent>,
    /// Handle to the adapter event pump.
    event_task: RwLock<Option<JoinHandle<()>>>,
    /// Handle to the per-connection notification pump.
    notify_task: Arc<RwLock<Option<JoinHandle<()>>>>,
}

impl BleTransport {
    /// Create a transport on the first Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available or no adapter is
    /// present.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;
        let adapter = adapters.into_iter().next().ok_or(Error::RadioUnavailable {
            state: "no adapters present".to_string(),
        })?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a transport on a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (advertisement_tx, _) = broadcast::channel(100);
        let (notification_tx, _) = broadcast::channel(256);
        let (link_tx, _) = broadcast::channel(16);

        let transport = Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            connected: Arc::new(RwLock::new(None)),
            advertisement_tx,
            notification_tx,
            link_tx,
            event_task: RwLock::new(None),
            notify_task: Arc::new(RwLock::new(None)),
        };
        transport.start_event_pump();
        transport
    }

    /// Spawn the task that forwards adapter events onto the channels.
    fn start_event_pump(&self) {
        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);
        let connected = Arc::clone(&self.connected);
        let notify_task = Arc::clone(&self.notify_task);
        let advertisement_tx = self.advertisement_tx.clone();
        let link_tx = self.link_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        process_advertisement(&adapter, id, &peripherals, &advertisement_tx)
                            .await;
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let lost = {
                            let mut connected = connected.write();
                            match connected.as_ref() {
                                Some(link) if link.peripheral.id() == id => connected.take(),
                                _ => None,
                            }
                        };
                        if let Some(link) = lost {
                            warn!("Link to {} dropped by the platform", link.identity);
                            if let Some(handle) = notify_task.write().take() {
                                handle.abort();
                            }
                            let _ = link_tx.send(LinkEvent::Disconnected(link.identity));
                        } else {
                            trace!("Disconnect event for an unheld peripheral: {:?}", id);
                        }
                    }
                    _ => {}
                }
            }
            debug!("Adapter event stream ended");
        });

        *self.event_task.write() = Some(handle);
    }

    /// Spawn the task that forwards peripheral notifications. Replaces any
    /// pump left over from a previous link.
    fn start_notification_pump(&self, peripheral: Peripheral) {
        if let Some(handle) = self.notify_task.write().take() {
            handle.abort();
        }

        let notification_tx = self.notification_tx.clone();
        let handle = tokio::spawn(async move {
            let mut stream = match peripheral.notifications().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to open notification stream: {}", e);
                    return;
                }
            };
            while let Some(notification) = stream.next().await {
                trace!(
                    "Notification from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );
                let _ = notification_tx.send(Notification {
                    characteristic: notification.uuid,
                    data: notification.value,
                });
            }
            debug!("Notification stream ended");
        });

        *self.notify_task.write() = Some(handle);
    }

    /// Get the peripheral behind the active link.
    fn require_link(&self) -> Result<Peripheral> {
        self.connected
            .read()
            .as_ref()
            .map(|link| link.peripheral.clone())
            .ok_or(Error::NotConnected)
    }

    /// Get the peripheral and one cached characteristic of the active link.
    fn require_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
    ) -> Result<(Peripheral, Characteristic)> {
        let connected = self.connected.read();
        let link = connected.as_ref().ok_or(Error::NotConnected)?;
        let target = link
            .characteristics
            .get(&(service, characteristic))
            .cloned()
            .ok_or_else(|| Error::DiscoveryFailed {
                reason: format!(
                    "characteristic {} not cached for service {}",
                    characteristic, service
                ),
            })?;
        Ok((link.peripheral.clone(), target))
    }

    /// Get the underlying adapter.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn radio_state(&self) -> Result<RadioState> {
        let state = self.adapter.adapter_state().await?;
        Ok(match state {
            CentralState::PoweredOn => RadioState::PoweredOn,
            CentralState::PoweredOff => RadioState::PoweredOff,
            _ => RadioState::Unknown,
        })
    }

    async fn start_scan(&self) -> Result<()> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        debug!("Platform scan started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.adapter.stop_scan().await?;
        debug!("Platform scan stopped");
        Ok(())
    }

    fn advertisements(&self) -> broadcast::Receiver<Advertisement> {
        self.advertisement_tx.subscribe()
    }

    async fn connect(&self, identity: &PeripheralIdentity) -> Result<()> {
        let peripheral = self
            .peripherals
            .read()
            .get(&identity.id)
            .cloned()
            .ok_or_else(|| Error::PeripheralNotFound {
                identifier: identity.id.clone(),
            })?;

        if !peripheral.is_connected().await.unwrap_or(false) {
            peripheral.connect().await?;
        }
        info!("Connected to {}", identity);

        *self.connected.write() = Some(ActiveLink {
            identity: identity.clone(),
            peripheral: peripheral.clone(),
            characteristics: HashMap::new(),
        });
        self.start_notification_pump(peripheral);

        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let link = self.connected.write().take();
        let Some(link) = link else {
            return Ok(());
        };
        if let Some(handle) = self.notify_task.write().take() {
            handle.abort();
        }
        // The link is gone locally either way; a platform error here is
        // only worth a warning.
        match link.peripheral.disconnect().await {
            Ok(()) => debug!("Disconnected from {}", link.identity),
            Err(e) => warn!("Disconnect from {} failed: {}", link.identity, e),
        }
        Ok(())
    }

    async fn discover_services(&self) -> Result<Vec<GattService>> {
        let peripheral = self.require_link()?;
        peripheral.discover_services().await?;

        let services = peripheral.services();
        let mut cached = HashMap::new();
        let mut result = Vec::with_capacity(services.len());
        for service in &services {
            let mut characteristics = Vec::new();
            for ch in &service.characteristics {
                trace!("Found characteristic {} in service {}", ch.uuid, service.uuid);
                characteristics.push(ch.uuid);
                cached.insert((service.uuid, ch.uuid), ch.clone());
            }
            result.push(GattService {
                uuid: service.uuid,
                characteristics,
            });
        }

        if let Some(link) = self.connected.write().as_mut() {
            link.characteristics = cached;
        }
        debug!("Discovered {} services", result.len());
        Ok(result)
    }

    async fn read(&self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>> {
        let (peripheral, target) = self.require_characteristic(service, characteristic)?;
        let data = peripheral.read(&target).await?;
        trace!("Read {} bytes from {}", data.len(), characteristic);
        Ok(data)
    }

    async fn write(&self, service: Uuid, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let (peripheral, target) = self.require_characteristic(service, characteristic)?;
        peripheral
            .write(&target, data, WriteType::WithResponse)
            .await?;
        trace!("Wrote {} bytes to {}", data.len(), characteristic);
        Ok(())
    }

    async fn subscribe(&self, service: Uuid, characteristic: Uuid) -> Result<()> {
        let (peripheral, target) = self.require_characteristic(service, characteristic)?;
        peripheral.subscribe(&target).await?;
        debug!("Subscribed to {}", characteristic);
        Ok(())
    }

    fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.notification_tx.subscribe()
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.event_task.write().take() {
            handle.abort();
        }
        if let Some(handle) = self.notify_task.write().take() {
            handle.abort();
        }
    }
}

/// Resolve an adapter event into an advertisement and cache the peripheral.
async fn process_advertisement(
    adapter: &Adapter,
    id: PeripheralId,
    peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
    advertisement_tx: &broadcast::Sender<Advertisement>,
) {
    let peripheral = match adapter.peripheral(&id).await {
        Ok(p) => p,
        Err(e) => {
            trace!("Failed to get peripheral: {}", e);
            return;
        }
    };

    let properties = match peripheral.properties().await {
        Ok(Some(p)) => p,
        _ => return,
    };

    // Anonymous advertisers can never match a name filter; skip them.
    let Some(name) = properties.local_name else {
        return;
    };

    let identifier = id.to_string();
    peripherals.write().insert(identifier.clone(), peripheral);

    let advertisement = Advertisement {
        identity: PeripheralIdentity {
            id: identifier,
            name,
        },
        rssi: properties.rssi,
    };
    let _ = advertisement_tx.send(advertisement);
}
