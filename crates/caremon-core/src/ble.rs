//! btleplug backend for [`Radio`] and [`RadioLink`].
//!
//! Link loss is detected from the adapter's `DeviceDisconnected` event, and
//! notifications are forwarded from the peripheral's notification stream.
//! Both run on tasks owned by the link and are aborted when it is closed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    CharPropFlags, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _,
    PeripheralProperties, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use caremon_types::uuids::CHARACTERISTIC_USER_DESCRIPTION;

use crate::error::{DeviceNotFoundReason, Error, Result};
use crate::events::{RadioEvent, RadioEventSender};
use crate::radio::{
    Advertisement, ChannelDescriptor, Radio, RadioLink, ServiceDescriptor, SubscriptionHandle,
};
use crate::state::DisconnectReason;
use crate::util::{create_identifier, format_peripheral_id, is_null_address};

/// How long to listen when a device is not among known peripherals.
const FIND_SCAN_WINDOW: Duration = Duration::from_secs(3);

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters
        .into_iter()
        .next()
        .ok_or(Error::DeviceNotFound(DeviceNotFoundReason::NoAdapter))
}

/// Radio backed by the host's Bluetooth adapter.
#[derive(Debug, Clone)]
pub struct BleRadio {
    adapter: Adapter,
}

impl BleRadio {
    /// Use the first available adapter.
    pub async fn new() -> Result<Self> {
        Ok(Self {
            adapter: get_adapter().await?,
        })
    }

    pub fn from_adapter(adapter: Adapter) -> Self {
        Self { adapter }
    }

    async fn find_peripheral(&self, identifier: &str, cancel: &CancellationToken) -> Result<Peripheral> {
        let identifier_lower = identifier.to_lowercase();
        if let Some(peripheral) = find_peripheral_by_identifier(&self.adapter, &identifier_lower).await? {
            return Ok(peripheral);
        }

        debug!(identifier, "Device not among known peripherals, scanning");
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::select! {
            _ = sleep(FIND_SCAN_WINDOW) => {}
            _ = cancel.cancelled() => {}
        }
        self.adapter.stop_scan().await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        find_peripheral_by_identifier(&self.adapter, &identifier_lower)
            .await?
            .ok_or_else(|| Error::device_not_found(identifier))
    }
}

#[async_trait]
impl Radio for BleRadio {
    #[tracing::instrument(level = "debug", skip(self, cancel))]
    async fn scan(&self, window: Duration, cancel: CancellationToken) -> Result<Vec<Advertisement>> {
        info!("Starting BLE scan for {} seconds...", window.as_secs());
        self.adapter.start_scan(ScanFilter::default()).await?;
        tokio::select! {
            _ = sleep(window) => {}
            _ = cancel.cancelled() => debug!("Scan cancelled"),
        }
        self.adapter.stop_scan().await?;

        let mut observed = Vec::new();
        for peripheral in self.adapter.peripherals().await? {
            match peripheral.properties().await {
                Ok(Some(properties)) => observed.push(advertisement_from(&peripheral, properties)),
                Ok(None) => {}
                Err(e) => debug!("Error reading peripheral properties: {}", e),
            }
        }
        Ok(observed)
    }

    #[tracing::instrument(level = "info", skip(self, events, cancel))]
    async fn connect(
        &self,
        device_id: &str,
        events: RadioEventSender,
        cancel: CancellationToken,
    ) -> Result<Box<dyn RadioLink>> {
        let peripheral = self.find_peripheral(device_id, &cancel).await?;

        info!("Connecting to device...");
        tokio::select! {
            result = peripheral.connect() => result?,
            _ = cancel.cancelled() => {
                let _ = peripheral.disconnect().await;
                return Err(Error::Cancelled);
            }
        }
        info!("Connected!");

        let mut tasks = Vec::with_capacity(2);
        tasks.push(spawn_disconnect_watcher(
            self.adapter.clone(),
            peripheral.clone(),
            device_id.to_string(),
            events.clone(),
        ));
        match peripheral.notifications().await {
            Ok(stream) => {
                let forward_to = events.clone();
                let id = device_id.to_string();
                tasks.push(tokio::spawn(async move {
                    let mut stream = stream;
                    while let Some(notification) = stream.next().await {
                        let event = RadioEvent::CharacteristicUpdate {
                            device_id: id.clone(),
                            channel: notification.uuid,
                            payload: Bytes::from(notification.value),
                        };
                        if forward_to.send(event).is_err() {
                            break;
                        }
                    }
                    debug!(device_id = %id, "Notification stream ended");
                }));
            }
            Err(e) => warn!("Could not open notification stream: {}", e),
        }

        let _ = events.send(RadioEvent::Connected {
            device_id: device_id.to_string(),
        });

        Ok(Box::new(BleLink {
            device_id: device_id.to_string(),
            peripheral,
            tasks: Mutex::new(tasks),
            next_token: AtomicU64::new(0),
        }))
    }
}

fn spawn_disconnect_watcher(
    adapter: Adapter,
    peripheral: Peripheral,
    device_id: String,
    events: RadioEventSender,
) -> JoinHandle<()> {
    let peripheral_id = peripheral.id();
    tokio::spawn(async move {
        match adapter.events().await {
            Ok(mut stream) => {
                while let Some(event) = stream.next().await {
                    if let CentralEvent::DeviceDisconnected(id) = event
                        && id == peripheral_id
                    {
                        info!(device_id = %device_id, "Link lost");
                        let _ = events.send(RadioEvent::Disconnected {
                            device_id,
                            reason: DisconnectReason::LinkLost,
                        });
                        break;
                    }
                }
            }
            Err(e) => warn!("Disconnect watcher: could not subscribe to adapter events: {}", e),
        }
    })
}

/// An open btleplug connection.
pub struct BleLink {
    device_id: String,
    peripheral: Peripheral,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_token: AtomicU64,
}

impl std::fmt::Debug for BleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleLink")
            .field("device_id", &self.device_id)
            .field("peripheral", &format_peripheral_id(&self.peripheral.id()))
            .finish()
    }
}

impl BleLink {
    fn find_characteristic(&self, service: Uuid, channel: Uuid) -> Option<Characteristic> {
        self.peripheral
            .services()
            .into_iter()
            .filter(|s| s.uuid == service)
            .flat_map(|s| s.characteristics)
            .find(|c| c.uuid == channel)
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }

    async fn read_description(&self, characteristic: &Characteristic) -> Option<String> {
        let descriptor = characteristic
            .descriptors
            .iter()
            .find(|d| d.uuid == CHARACTERISTIC_USER_DESCRIPTION)?;
        match self.peripheral.read_descriptor(descriptor).await {
            Ok(raw) => {
                let text = String::from_utf8_lossy(&raw).trim_end_matches('\0').trim().to_string();
                (!text.is_empty()).then_some(text)
            }
            Err(e) => {
                debug!(channel = %characteristic.uuid, "Could not read user description: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl RadioLink for BleLink {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn discover(&self, cancel: CancellationToken) -> Result<Vec<ServiceDescriptor>> {
        info!("Discovering services...");
        tokio::select! {
            result = self.peripheral.discover_services() => result?,
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        }

        let mut services = Vec::new();
        for service in self.peripheral.services() {
            debug!("  Service: {}", service.uuid);
            let mut channels = Vec::new();
            for characteristic in &service.characteristics {
                debug!("    Characteristic: {}", characteristic.uuid);
                channels.push(ChannelDescriptor {
                    uuid: characteristic.uuid,
                    description: self.read_description(characteristic).await,
                    notifiable: characteristic
                        .properties
                        .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE),
                });
            }
            services.push(ServiceDescriptor::new(service.uuid, channels));
        }
        debug!("Found {} services", services.len());
        Ok(services)
    }

    async fn subscribe(&self, service: Uuid, channel: Uuid) -> Result<SubscriptionHandle> {
        let characteristic = self
            .find_characteristic(service, channel)
            .ok_or_else(|| Error::subscription_failed(service, channel, "characteristic not found"))?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| Error::subscription_failed(service, channel, e))?;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        Ok(SubscriptionHandle::new(service, channel, token))
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        let Some(characteristic) = self.find_characteristic(handle.service, handle.channel) else {
            return Ok(());
        };
        self.peripheral.unsubscribe(&characteristic).await?;
        Ok(())
    }

    async fn rssi(&self) -> Option<i16> {
        self.peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.rssi)
    }

    async fn disconnect(&self) -> Result<()> {
        self.abort_tasks();
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

fn advertisement_from(peripheral: &Peripheral, properties: PeripheralProperties) -> Advertisement {
    Advertisement {
        id: create_identifier(&properties.address.to_string(), &peripheral.id()),
        name: properties.local_name,
        rssi: properties.rssi,
        manufacturer_data: properties.manufacturer_data,
        service_data: properties.service_data,
        services: properties.services,
    }
}

/// Search through known peripherals to find one matching the identifier.
async fn find_peripheral_by_identifier(adapter: &Adapter, identifier_lower: &str) -> Result<Option<Peripheral>> {
    for peripheral in adapter.peripherals().await? {
        let Ok(Some(props)) = peripheral.properties().await else {
            continue;
        };
        let address = props.address.to_string().to_lowercase();
        let peripheral_id = format_peripheral_id(&peripheral.id()).to_lowercase();

        if peripheral_id == identifier_lower {
            debug!("Matched by peripheral ID: {}", peripheral_id);
            return Ok(Some(peripheral));
        }

        if !is_null_address(&address)
            && (address == identifier_lower || address.replace(':', "") == identifier_lower.replace(':', ""))
        {
            debug!("Matched by address: {}", address);
            return Ok(Some(peripheral));
        }
    }

    Ok(None)
}
