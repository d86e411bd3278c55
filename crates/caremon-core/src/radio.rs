//! Trait abstractions over the short-range radio.
//!
//! [`Radio`] discovers devices and opens links; [`RadioLink`] is one open
//! connection. Both are object safe so the pipeline can hold
//! `Arc<dyn Radio>` and swap the btleplug backend for
//! [`MockRadio`](crate::mock::MockRadio) in tests.
//!
//! Links never call back into the pipeline directly. Notifications and
//! link loss are pushed as [`RadioEvent`](crate::events::RadioEvent)s into
//! the sender handed to [`Radio::connect`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Result;
use crate::events::RadioEventSender;

/// Advertisement data observed for one device during a scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Advertisement {
    /// Connection identifier (MAC address, or platform UUID on macOS).
    pub id: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
    /// Manufacturer-specific payloads keyed by company ID.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    /// Service data payloads keyed by service UUID.
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised service UUIDs.
    pub services: Vec<Uuid>,
}

/// A characteristic exposed by a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub uuid: Uuid,
    /// Value of the user description descriptor, when the device provides one.
    pub description: Option<String>,
    /// Whether the characteristic supports notify or indicate.
    pub notifiable: bool,
}

impl ChannelDescriptor {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            description: None,
            notifiable: true,
        }
    }

    #[must_use]
    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub uuid: Uuid,
    pub channels: Vec<ChannelDescriptor>,
}

impl ServiceDescriptor {
    pub fn new(uuid: Uuid, channels: Vec<ChannelDescriptor>) -> Self {
        Self { uuid, channels }
    }

    /// Find a characteristic of this service by UUID.
    pub fn channel(&self, uuid: Uuid) -> Option<&ChannelDescriptor> {
        self.channels.iter().find(|c| c.uuid == uuid)
    }
}

/// Opaque handle to an active notification subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub service: Uuid,
    pub channel: Uuid,
    pub(crate) token: u64,
}

impl SubscriptionHandle {
    pub fn new(service: Uuid, channel: Uuid, token: u64) -> Self {
        Self {
            service,
            channel,
            token,
        }
    }
}

/// A radio able to discover and connect to wearables.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Listen for advertisements for `window`, or until `cancel` fires.
    ///
    /// Returns every advertisement observed. The same device may appear
    /// more than once; callers de-duplicate.
    async fn scan(&self, window: Duration, cancel: CancellationToken) -> Result<Vec<Advertisement>>;

    /// Open a link to `device_id`.
    ///
    /// The link pushes notifications and link-loss events into `events`.
    /// Implementations must abandon the attempt and release any partial
    /// connection when `cancel` fires.
    async fn connect(
        &self,
        device_id: &str,
        events: RadioEventSender,
        cancel: CancellationToken,
    ) -> Result<Box<dyn RadioLink>>;
}

/// One open connection to a wearable.
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Identifier of the connected device.
    fn device_id(&self) -> &str;

    /// Enumerate services and their characteristics.
    async fn discover(&self, cancel: CancellationToken) -> Result<Vec<ServiceDescriptor>>;

    /// Enable notifications on a characteristic.
    async fn subscribe(&self, service: Uuid, channel: Uuid) -> Result<SubscriptionHandle>;

    /// Disable notifications for a previous subscription.
    async fn unsubscribe(&self, handle: &SubscriptionHandle) -> Result<()>;

    /// Current signal strength, if the stack exposes it.
    async fn rssi(&self) -> Option<i16>;

    /// Close the link.
    async fn disconnect(&self) -> Result<()>;
}
