//! Mock radio and sink for testing.
//!
//! [`MockRadio`] implements [`Radio`] without hardware. Tests script what a
//! scan sees and how each device behaves on connect, then push
//! notifications and link loss through it as the radio stack would.
//!
//! # Features
//!
//! - **Failure injection**: refuse connections, fail individual channels
//! - **Latency simulation**: slow connect, discovery or scan steps
//! - **Call recording**: connect, disconnect and subscription counts
//!
//! [`MockSink`] implements [`BatchSink`] with scripted outcomes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::{Uuid, uuid};

use caremon_types::TelemetryBatch;
use caremon_types::uuids::{
    BATTERY_LEVEL, BATTERY_SERVICE, HEALTH_BATTERY, HEALTH_HEART_RATE, HEALTH_OXYGEN_SATURATION,
    HEALTH_SERVICE, HEALTH_STEPS, HEALTH_TEMPERATURE, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE,
};

use crate::error::{Error, Result};
use crate::events::{RadioEvent, RadioEventSender};
use crate::radio::{
    Advertisement, ChannelDescriptor, Radio, RadioLink, ServiceDescriptor, SubscriptionHandle,
};
use crate::sink::{BatchSink, DeliveryOutcome};
use crate::state::DisconnectReason;

/// Motion characteristic exposed by [`MockDevice::health_wearable`].
pub const MOCK_MOTION_CHANNEL: Uuid = uuid!("a3c80106-7d2f-4c1e-9b6a-52e0f1d4c900");

/// Scripted behaviour of one mock device.
#[derive(Debug, Clone, Default)]
pub struct MockDevice {
    services: Vec<ServiceDescriptor>,
    rssi: Option<i16>,
    connect_latency: Duration,
    discover_latency: Duration,
    fail_connect: bool,
    failing_channels: HashSet<Uuid>,
}

impl MockDevice {
    /// A device exposing no services.
    pub fn new() -> Self {
        Self::default()
    }

    /// A wearable with the full health service and a motion channel.
    pub fn health_wearable() -> Self {
        let health = ServiceDescriptor::new(
            HEALTH_SERVICE,
            vec![
                ChannelDescriptor::new(HEALTH_HEART_RATE).described("Heart Rate"),
                ChannelDescriptor::new(HEALTH_BATTERY).described("Battery"),
                ChannelDescriptor::new(HEALTH_TEMPERATURE).described("Skin Temperature"),
                ChannelDescriptor::new(HEALTH_STEPS).described("Step Count"),
                ChannelDescriptor::new(HEALTH_OXYGEN_SATURATION).described("SpO2"),
                ChannelDescriptor::new(MOCK_MOTION_CHANNEL).described("Motion"),
            ],
        );
        let battery = ServiceDescriptor::new(BATTERY_SERVICE, vec![ChannelDescriptor::new(BATTERY_LEVEL)]);
        Self::new().services(vec![health, battery]).rssi(-60)
    }

    /// A generic heart rate strap without the health service.
    pub fn heart_rate_strap() -> Self {
        Self::new().services(vec![ServiceDescriptor::new(
            HEART_RATE_SERVICE,
            vec![ChannelDescriptor::new(HEART_RATE_MEASUREMENT)],
        )])
    }

    #[must_use]
    pub fn services(mut self, services: Vec<ServiceDescriptor>) -> Self {
        self.services = services;
        self
    }

    #[must_use]
    pub fn rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    #[must_use]
    pub fn connect_latency(mut self, latency: Duration) -> Self {
        self.connect_latency = latency;
        self
    }

    #[must_use]
    pub fn discover_latency(mut self, latency: Duration) -> Self {
        self.discover_latency = latency;
        self
    }

    /// Refuse every connection attempt.
    #[must_use]
    pub fn fail_connect(mut self) -> Self {
        self.fail_connect = true;
        self
    }

    /// Fail subscriptions to `channel`.
    #[must_use]
    pub fn failing_channel(mut self, channel: Uuid) -> Self {
        self.failing_channels.insert(channel);
        self
    }

    /// The services this device reports on discovery.
    pub fn services_list(&self) -> Vec<ServiceDescriptor> {
        self.services.clone()
    }
}

#[derive(Debug, Default)]
struct DeviceRecord {
    connects: u32,
    disconnects: u32,
    subscribes: u32,
    active: Vec<SubscriptionHandle>,
    sender: Option<RadioEventSender>,
}

#[derive(Debug, Default)]
struct MockState {
    advertisements: Vec<Advertisement>,
    devices: HashMap<String, MockDevice>,
    scan_latency: Duration,
    records: Mutex<HashMap<String, DeviceRecord>>,
    next_token: AtomicU64,
}

impl MockState {
    fn records(&self) -> MutexGuard<'_, HashMap<String, DeviceRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Builder for [`MockRadio`].
#[derive(Debug, Default)]
pub struct MockRadioBuilder {
    state: MockState,
}

impl MockRadioBuilder {
    /// Add an advertisement every scan will observe.
    #[must_use]
    pub fn advertisement(mut self, advertisement: Advertisement) -> Self {
        self.state.advertisements.push(advertisement);
        self
    }

    /// Make `id` connectable with the given behaviour.
    #[must_use]
    pub fn device(mut self, id: &str, device: MockDevice) -> Self {
        self.state.devices.insert(id.to_string(), device);
        self
    }

    #[must_use]
    pub fn scan_latency(mut self, latency: Duration) -> Self {
        self.state.scan_latency = latency;
        self
    }

    pub fn build(self) -> MockRadio {
        MockRadio {
            state: Arc::new(self.state),
        }
    }
}

/// A scripted radio for tests.
#[derive(Debug, Clone)]
pub struct MockRadio {
    state: Arc<MockState>,
}

impl MockRadio {
    pub fn builder() -> MockRadioBuilder {
        MockRadioBuilder::default()
    }

    /// Push a raw radio event as if the stack had produced it.
    ///
    /// Returns `false` if the device has no open link.
    pub fn emit(&self, event: RadioEvent) -> bool {
        let records = self.state.records();
        match records.get(event.device_id()).and_then(|r| r.sender.as_ref()) {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Deliver a notification on `channel`.
    pub fn notify(&self, device_id: &str, channel: Uuid, payload: impl Into<Bytes>) -> bool {
        self.emit(RadioEvent::CharacteristicUpdate {
            device_id: device_id.to_string(),
            channel,
            payload: payload.into(),
        })
    }

    /// Simulate the link dropping.
    pub fn drop_link(&self, device_id: &str) -> bool {
        let sent = self.emit(RadioEvent::Disconnected {
            device_id: device_id.to_string(),
            reason: DisconnectReason::LinkLost,
        });
        if let Some(record) = self.state.records().get_mut(device_id) {
            record.sender = None;
            record.active.clear();
        }
        sent
    }

    pub fn connect_count(&self, device_id: &str) -> u32 {
        self.state.records().get(device_id).map_or(0, |r| r.connects)
    }

    pub fn disconnect_count(&self, device_id: &str) -> u32 {
        self.state.records().get(device_id).map_or(0, |r| r.disconnects)
    }

    /// Total successful subscribe calls for `device_id`.
    pub fn subscribe_count(&self, device_id: &str) -> u32 {
        self.state.records().get(device_id).map_or(0, |r| r.subscribes)
    }

    /// Channels currently subscribed on `device_id`.
    pub fn active_subscriptions(&self, device_id: &str) -> Vec<Uuid> {
        self.state
            .records()
            .get(device_id)
            .map(|r| r.active.iter().map(|h| h.channel).collect())
            .unwrap_or_default()
    }
}

async fn sleep_or_cancel(latency: Duration, cancel: &CancellationToken) -> Result<()> {
    if latency.is_zero() {
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(latency) => Ok(()),
        _ = cancel.cancelled() => Err(Error::Cancelled),
    }
}

#[async_trait]
impl Radio for MockRadio {
    async fn scan(&self, window: Duration, cancel: CancellationToken) -> Result<Vec<Advertisement>> {
        // Cancellation ends a scan early but keeps what was seen.
        let _ = sleep_or_cancel(self.state.scan_latency.min(window), &cancel).await;
        Ok(self.state.advertisements.clone())
    }

    async fn connect(
        &self,
        device_id: &str,
        events: RadioEventSender,
        cancel: CancellationToken,
    ) -> Result<Box<dyn RadioLink>> {
        self.state.records().entry(device_id.to_string()).or_default().connects += 1;

        let device = self
            .state
            .devices
            .get(device_id)
            .ok_or_else(|| Error::device_not_found(device_id))?;
        sleep_or_cancel(device.connect_latency, &cancel).await?;
        if device.fail_connect {
            return Err(Error::Bluetooth(btleplug::Error::DeviceNotFound));
        }

        if let Some(record) = self.state.records().get_mut(device_id) {
            record.sender = Some(events.clone());
        }
        let _ = events.send(RadioEvent::Connected {
            device_id: device_id.to_string(),
        });

        Ok(Box::new(MockLink {
            device_id: device_id.to_string(),
            device: device.clone(),
            state: Arc::clone(&self.state),
        }))
    }
}

/// A link opened by [`MockRadio`].
#[derive(Debug)]
pub struct MockLink {
    device_id: String,
    device: MockDevice,
    state: Arc<MockState>,
}

#[async_trait]
impl RadioLink for MockLink {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    async fn discover(&self, cancel: CancellationToken) -> Result<Vec<ServiceDescriptor>> {
        sleep_or_cancel(self.device.discover_latency, &cancel).await?;
        Ok(self.device.services.clone())
    }

    async fn subscribe(&self, service: Uuid, channel: Uuid) -> Result<SubscriptionHandle> {
        if self.device.failing_channels.contains(&channel) {
            return Err(Error::subscription_failed(service, channel, "mock failure"));
        }
        let known = self
            .device
            .services
            .iter()
            .any(|s| s.uuid == service && s.channel(channel).is_some());
        if !known {
            return Err(Error::subscription_failed(service, channel, "characteristic not found"));
        }

        let token = self.state.next_token.fetch_add(1, Ordering::Relaxed);
        let handle = SubscriptionHandle::new(service, channel, token);
        let mut records = self.state.records();
        let record = records.entry(self.device_id.clone()).or_default();
        record.subscribes += 1;
        record.active.push(handle.clone());
        Ok(handle)
    }

    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()> {
        if let Some(record) = self.state.records().get_mut(&self.device_id) {
            record.active.retain(|h| h != handle);
        }
        Ok(())
    }

    async fn rssi(&self) -> Option<i16> {
        self.device.rssi
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(record) = self.state.records().get_mut(&self.device_id) {
            record.disconnects += 1;
            record.sender = None;
            record.active.clear();
        }
        Ok(())
    }
}

/// A [`BatchSink`] that records batches and replays scripted outcomes.
///
/// Once the script runs out every batch is `Delivered`.
#[derive(Debug)]
pub struct MockSink {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    delivered: mpsc::UnboundedSender<(TelemetryBatch, DeliveryOutcome)>,
    latency: Duration,
}

impl MockSink {
    /// Create a sink and the receiver that observes every delivery attempt.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(TelemetryBatch, DeliveryOutcome)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                script: Mutex::new(VecDeque::new()),
                delivered: tx,
                latency: Duration::ZERO,
            },
            rx,
        )
    }

    /// Outcomes to return for the next deliveries, in order.
    #[must_use]
    pub fn with_outcomes(self, outcomes: impl IntoIterator<Item = DeliveryOutcome>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(outcomes);
        self
    }

    /// Delay each delivery.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl BatchSink for MockSink {
    async fn deliver(&self, batch: TelemetryBatch) -> DeliveryOutcome {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let outcome = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or(DeliveryOutcome::Delivered);
        let _ = self.delivered.send((batch, outcome));
        outcome
    }
}
