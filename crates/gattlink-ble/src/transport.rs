//! btleplug implementation of the transport port

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Descriptor, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{self, BoxStream, StreamExt};
use gattlink_core::transport::{ConnectionStateStream, NotificationStream};
use gattlink_core::{CharacteristicUpdate, ConnectionState, TransportPort, TransportResult};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BleTransportConfig;
use crate::error::BleTransportError;

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const STATE_CHANNEL_CAPACITY: usize = 16;
const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

type BleResult<T> = Result<T, BleTransportError>;

// ----------------------------------------------------------------------------
// Adapter Selection
// ----------------------------------------------------------------------------

/// Open the local adapter at `index`
pub async fn get_adapter(index: usize) -> BleResult<Adapter> {
    let manager = Manager::new()
        .await
        .map_err(|e| BleTransportError::Adapter(format!("Failed to create BLE manager: {}", e)))?;

    let adapters = manager
        .adapters()
        .await
        .map_err(|e| BleTransportError::Adapter(format!("Failed to get BLE adapters: {}", e)))?;

    adapters
        .into_iter()
        .nth(index)
        .ok_or(BleTransportError::AdapterNotAvailable)
}

// ----------------------------------------------------------------------------
// BLE Transport
// ----------------------------------------------------------------------------

/// Transport port backed by a btleplug central
///
/// Serves a single peripheral at a time. Link state changes, including drops
/// reported by the adapter, are published on a broadcast channel that backs
/// [`TransportPort::connection_states`].
pub struct BtleplugTransport {
    config: BleTransportConfig,
    adapter: Adapter,
    /// Shared with the disconnect watcher, which clears it when the link drops
    peripheral: Arc<RwLock<Option<Peripheral>>>,
    states: broadcast::Sender<ConnectionState>,
    notifications: broadcast::Sender<CharacteristicUpdate>,
    link_tasks: LinkTasks,
}

impl BtleplugTransport {
    /// Open the configured adapter
    pub async fn new(config: BleTransportConfig) -> BleResult<Self> {
        let adapter = get_adapter(config.adapter_index).await?;
        info!("BLE adapter {} initialized", config.adapter_index);
        Ok(Self::with_adapter(adapter, config))
    }

    pub fn with_adapter(adapter: Adapter, config: BleTransportConfig) -> Self {
        let (states, _) = broadcast::channel(STATE_CHANNEL_CAPACITY);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self {
            config,
            adapter,
            peripheral: Arc::new(RwLock::new(None)),
            states,
            notifications,
            link_tasks: LinkTasks::default(),
        }
    }

    fn report(&self, state: ConnectionState) {
        debug!("Link state: {}", state);
        // No session listening is fine
        let _ = self.states.send(state);
    }

    /// Scan until a peripheral with `address` shows up or the scan times out
    async fn find_peripheral(&self, address: &str) -> BleResult<Peripheral> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleTransportError::Adapter(format!("Failed to start BLE scan: {}", e)))?;

        let deadline = Instant::now() + self.config.scan_timeout;
        let found = loop {
            let peripherals = self.adapter.peripherals().await.map_err(|e| {
                BleTransportError::Adapter(format!("Failed to list peripherals: {}", e))
            })?;

            if let Some(peripheral) = peripherals
                .into_iter()
                .find(|p| p.address().to_string().eq_ignore_ascii_case(address))
            {
                break Some(peripheral);
            }

            if Instant::now() >= deadline {
                break None;
            }
            sleep(SCAN_POLL_INTERVAL).await;
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop BLE scan: {}", e);
        }

        found.ok_or_else(|| BleTransportError::DeviceNotFound {
            address: address.to_string(),
            timeout_ms: self.config.scan_timeout.as_millis() as u64,
        })
    }

    async fn establish(&self, address: &str) -> BleResult<Peripheral> {
        let peripheral = self.find_peripheral(address).await?;

        match timeout(self.config.connection_timeout, peripheral.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(BleTransportError::ConnectionFailed(e.to_string())),
            Err(_) => {
                return Err(BleTransportError::ConnectionTimeout {
                    timeout_ms: self.config.connection_timeout.as_millis() as u64,
                })
            }
        }

        if let Err(e) = peripheral.discover_services().await {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Disconnect after failed discovery: {}", e);
            }
            return Err(BleTransportError::ServiceDiscoveryFailed(e.to_string()));
        }

        Ok(peripheral)
    }

    /// Forward notifications and adapter disconnects of `peripheral`
    async fn watch_link(&self, peripheral: &Peripheral) -> BleResult<()> {
        let mut values = peripheral
            .notifications()
            .await
            .map_err(|e| BleTransportError::EventStreamFailed(e.to_string()))?;
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| BleTransportError::EventStreamFailed(e.to_string()))?;

        let notifications = self.notifications.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(value) = values.next().await {
                let _ = notifications.send(CharacteristicUpdate {
                    uuid: value.uuid,
                    value: value.value,
                });
            }
            debug!("Notification stream ended");
        });

        let states = self.states.clone();
        let slot = Arc::clone(&self.peripheral);
        let id = peripheral.id();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        info!("Peripheral dropped the link");
                        release_link(&slot, |p| p.id() == id).await;
                        let _ = states.send(ConnectionState::Disconnected);
                        break;
                    }
                }
            }
        });

        self.link_tasks.replace(vec![forwarder, watcher]);
        Ok(())
    }

    async fn connected(&self) -> BleResult<Peripheral> {
        self.peripheral
            .read()
            .await
            .clone()
            .ok_or(BleTransportError::NotConnected)
    }

    async fn characteristic(&self, uuid: Uuid) -> BleResult<(Peripheral, Characteristic)> {
        let peripheral = self.connected().await?;
        let characteristic = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(BleTransportError::CharacteristicNotFound(uuid))?;
        Ok((peripheral, characteristic))
    }

    async fn descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> BleResult<(Peripheral, Descriptor)> {
        let (peripheral, found) = self.characteristic(characteristic).await?;
        let descriptor = found
            .descriptors
            .into_iter()
            .find(|d| d.uuid == descriptor)
            .ok_or(BleTransportError::DescriptorNotFound {
                characteristic,
                descriptor,
            })?;
        Ok((peripheral, descriptor))
    }
}

#[async_trait]
impl TransportPort for BtleplugTransport {
    async fn connect(&self, address: &str) -> TransportResult<()> {
        self.link_tasks.stop();
        let previous = self.peripheral.write().await.take();
        if let Some(previous) = previous {
            debug!("Releasing previous link to {}", previous.address());
            if let Err(e) = previous.disconnect().await {
                debug!("Previous link already gone: {}", e);
            }
        }

        self.report(ConnectionState::Connecting);

        let peripheral = match self.establish(address).await {
            Ok(peripheral) => peripheral,
            Err(e) => {
                error!("Failed to connect to {}: {}", address, e);
                self.report(ConnectionState::Disconnected);
                return Err(e.into());
            }
        };

        *self.peripheral.write().await = Some(peripheral.clone());
        if let Err(e) = self.watch_link(&peripheral).await {
            warn!("Link events unavailable for {}: {}", address, e);
        }

        info!("Connected to {}", address);
        self.report(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&self) {
        self.link_tasks.stop();

        let peripheral = self.peripheral.write().await.take();
        if let Some(peripheral) = peripheral {
            self.report(ConnectionState::Disconnecting);
            if let Err(e) = peripheral.disconnect().await {
                error!("Failed to disconnect: {}", e);
            }
            info!("Disconnected from {}", peripheral.address());
        }
        self.report(ConnectionState::Disconnected);
    }

    async fn read_characteristic(&self, uuid: Uuid) -> TransportResult<Vec<u8>> {
        let (peripheral, characteristic) = self.characteristic(uuid).await?;
        let value = peripheral
            .read(&characteristic)
            .await
            .map_err(|e| BleTransportError::ReadFailed(e.to_string()))?;
        debug!("Read {} bytes from {}", value.len(), uuid);
        Ok(value)
    }

    async fn write_characteristic(&self, uuid: Uuid, value: &[u8]) -> TransportResult<()> {
        let (peripheral, characteristic) = self.characteristic(uuid).await?;
        peripheral
            .write(&characteristic, value, WriteType::WithResponse)
            .await
            .map_err(|e| BleTransportError::WriteFailed(e.to_string()))?;
        debug!("Wrote {} bytes to {}", value.len(), uuid);
        Ok(())
    }

    async fn read_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
    ) -> TransportResult<Vec<u8>> {
        let (peripheral, found) = self.descriptor(characteristic, descriptor).await?;
        let value = peripheral
            .read_descriptor(&found)
            .await
            .map_err(|e| BleTransportError::ReadFailed(e.to_string()))?;
        Ok(value)
    }

    async fn write_descriptor(
        &self,
        characteristic: Uuid,
        descriptor: Uuid,
        value: &[u8],
    ) -> TransportResult<()> {
        let (peripheral, found) = self.descriptor(characteristic, descriptor).await?;
        peripheral
            .write_descriptor(&found, value)
            .await
            .map_err(|e| BleTransportError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn enable_notifications(&self, characteristic: Uuid) -> TransportResult<()> {
        let (peripheral, found) = self.characteristic(characteristic).await?;
        peripheral
            .subscribe(&found)
            .await
            .map_err(|e| BleTransportError::SubscriptionFailed(e.to_string()))?;
        info!("Subscribed to notifications on {}", characteristic);
        Ok(())
    }

    fn connection_states(&self) -> ConnectionStateStream {
        broadcast_stream(self.states.subscribe())
    }

    fn notifications(&self) -> NotificationStream {
        broadcast_stream(self.notifications.subscribe())
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.link_tasks.stop();
    }
}

// ----------------------------------------------------------------------------
// Link Bookkeeping
// ----------------------------------------------------------------------------

/// Notification forwarder and disconnect watcher of the current link
#[derive(Default)]
struct LinkTasks(Mutex<Vec<JoinHandle<()>>>);

impl LinkTasks {
    /// Abort the tasks of the previous link and track `tasks` instead
    fn replace(&self, tasks: Vec<JoinHandle<()>>) {
        let mut current = self.lock();
        for task in current.drain(..) {
            task.abort();
        }
        current.extend(tasks);
    }

    fn stop(&self) {
        self.replace(Vec::new());
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Take the link out of `slot` if it is still the one `is_link` matches
///
/// A newer link stored by a later connect is left alone.
async fn release_link<P>(slot: &RwLock<Option<P>>, is_link: impl Fn(&P) -> bool) -> Option<P> {
    let mut slot = slot.write().await;
    if slot.as_ref().is_some_and(is_link) {
        slot.take()
    } else {
        None
    }
}

/// Adapt a broadcast receiver into a stream, skipping over lag
fn broadcast_stream<T>(receiver: broadcast::Receiver<T>) -> BoxStream<'static, T>
where
    T: Clone + Send + 'static,
{
    stream::unfold(receiver, |mut receiver| async move {
        loop {
            match receiver.recv().await {
                Ok(item) => return Some((item, receiver)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} BLE events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .boxed()
}
