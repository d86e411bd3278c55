//! Channel subscription registry.
//!
//! Decides which channels of a connected device to subscribe to and keeps
//! at most one subscription per `service:channel` key. Subscriptions belong
//! to a device; once [`SubscriptionRegistry::invalidate`] runs for it,
//! lookups fail and incoming payloads are dropped.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use uuid::Uuid;

use caremon_types::uuids::HEALTH_SERVICE;

use crate::channels::{
    ChannelSpec, FALLBACK_HEART_RATE, HEALTH_CHANNELS, looks_like_motion, motion_channel,
    subscription_key,
};
use crate::error::Result;
use crate::events::{EventDispatcher, LinkEvent};
use crate::radio::{RadioLink, ServiceDescriptor, SubscriptionHandle};

/// A live notification subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelSubscription {
    pub spec: ChannelSpec,
    pub handle: SubscriptionHandle,
}

/// The channels chosen for a device.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelPlan {
    pub channels: Vec<ChannelSpec>,
    /// True when the aggregate health service was absent and only the
    /// standard heart rate channel is attempted.
    pub degraded: bool,
}

/// Counts from one `subscribe_all` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscribeSummary {
    pub subscribed: usize,
    pub already_subscribed: usize,
    pub failed: usize,
    pub degraded: bool,
}

/// Choose the channels to subscribe to from a device's services.
///
/// With the health service present, every table channel the device exposes
/// is chosen plus the first characteristic whose description looks like a
/// motion channel. Without it, only the standard heart rate channel is.
pub fn plan_channels(services: &[ServiceDescriptor]) -> ChannelPlan {
    let Some(health) = services.iter().find(|s| s.uuid == HEALTH_SERVICE) else {
        return ChannelPlan {
            channels: vec![FALLBACK_HEART_RATE],
            degraded: true,
        };
    };

    let mut channels: Vec<ChannelSpec> = HEALTH_CHANNELS
        .iter()
        .filter(|spec| health.channel(spec.channel).is_some())
        .copied()
        .collect();

    let motion = services.iter().find_map(|service| {
        service
            .channels
            .iter()
            .filter(|c| c.notifiable)
            .filter(|c| !channels.iter().any(|spec| spec.channel == c.uuid))
            .find(|c| c.description.as_deref().is_some_and(looks_like_motion))
            .map(|c| motion_channel(service.uuid, c.uuid))
    });
    channels.extend(motion);

    ChannelPlan {
        channels,
        degraded: false,
    }
}

/// Registry of live channel subscriptions for the connected device.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    device_id: Option<String>,
    subscriptions: HashMap<String, ChannelSubscription>,
    events: Option<EventDispatcher>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report subscription failures through `events`.
    #[must_use]
    pub fn with_events(mut self, events: EventDispatcher) -> Self {
        self.events = Some(events);
        self
    }

    /// Device the registry currently holds subscriptions for.
    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    pub fn is_subscribed(&self, service: Uuid, channel: Uuid) -> bool {
        self.subscriptions.contains_key(&subscription_key(service, channel))
    }

    /// Subscribe to every planned channel of the device behind `link`.
    ///
    /// A failure on one channel is logged and reported, and the remaining
    /// channels continue.
    #[tracing::instrument(level = "info", skip_all, fields(device_id = link.device_id()))]
    pub async fn subscribe_all(&mut self, link: &dyn RadioLink, services: &[ServiceDescriptor]) -> SubscribeSummary {
        if self.device_id.as_deref() != Some(link.device_id()) {
            if let Some(previous) = self.device_id.clone() {
                self.invalidate(&previous);
            }
            self.device_id = Some(link.device_id().to_string());
        }

        let plan = plan_channels(services);
        if plan.degraded {
            warn!("Health service not found, falling back to heart rate only");
        }

        let mut summary = SubscribeSummary {
            degraded: plan.degraded,
            ..Default::default()
        };
        for spec in plan.channels {
            match self.subscribe(link, spec).await {
                Ok(true) => summary.subscribed += 1,
                Ok(false) => summary.already_subscribed += 1,
                Err(e) => {
                    warn!(channel = %spec.channel, metric = %spec.metric_type, error = %e, "Channel subscription failed");
                    if let Some(events) = &self.events {
                        events.send(LinkEvent::SubscriptionFailed {
                            device_id: link.device_id().to_string(),
                            channel: spec.channel,
                            error: e.to_string(),
                        });
                    }
                    summary.failed += 1;
                }
            }
        }

        info!(
            subscribed = summary.subscribed,
            failed = summary.failed,
            "Channel subscriptions ready"
        );
        summary
    }

    /// Subscribe to one channel. Returns `false` if it was already subscribed.
    pub async fn subscribe(&mut self, link: &dyn RadioLink, spec: ChannelSpec) -> Result<bool> {
        let key = spec.key();
        if self.subscriptions.contains_key(&key) {
            debug!(%key, "Already subscribed");
            return Ok(false);
        }

        let handle = link.subscribe(spec.service, spec.channel).await?;
        debug!(%key, metric = %spec.metric_type, "Subscribed");
        self.subscriptions.insert(key, ChannelSubscription { spec, handle });
        Ok(true)
    }

    /// Find the subscription a notification belongs to.
    ///
    /// Returns `None` for any device other than the one subscribed, which
    /// includes every device after invalidation.
    pub fn lookup(&self, device_id: &str, channel: Uuid) -> Option<&ChannelSubscription> {
        if self.device_id.as_deref() != Some(device_id) {
            return None;
        }
        self.subscriptions.values().find(|s| s.spec.channel == channel)
    }

    /// Forget every subscription for `device_id` without touching the radio.
    ///
    /// Used once the link is already gone. Returns how many were dropped.
    pub fn invalidate(&mut self, device_id: &str) -> usize {
        if self.device_id.as_deref() != Some(device_id) {
            return 0;
        }
        let dropped = self.subscriptions.len();
        self.subscriptions.clear();
        self.device_id = None;
        debug!(device_id, dropped, "Subscriptions invalidated");
        dropped
    }

    /// Disable notifications on every channel, then forget them.
    pub async fn unsubscribe_all(&mut self, link: &dyn RadioLink) {
        for (key, sub) in self.subscriptions.drain() {
            if let Err(e) = link.unsubscribe(&sub.handle).await {
                warn!(%key, error = %e, "Failed to unsubscribe");
            }
        }
        self.device_id = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::radio_channel;
    use crate::mock::{MockDevice, MockRadio};
    use crate::radio::{ChannelDescriptor, Radio};
    use caremon_types::MetricType;
    use caremon_types::uuids::{HEALTH_BATTERY, HEALTH_HEART_RATE, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE};
    use tokio_util::sync::CancellationToken;

    async fn connect(radio: &MockRadio, id: &str) -> Box<dyn RadioLink> {
        let (tx, _rx) = radio_channel();
        radio.connect(id, tx, CancellationToken::new()).await.unwrap()
    }

    #[test]
    fn test_plan_full_health_service() {
        let services = MockDevice::health_wearable().services_list();
        let plan = plan_channels(&services);
        assert!(!plan.degraded);
        assert_eq!(plan.channels.len(), 6);
        assert_eq!(plan.channels.last().unwrap().metric_type, MetricType::Motion);
    }

    #[test]
    fn test_plan_skips_absent_channels() {
        let services = vec![ServiceDescriptor::new(
            HEALTH_SERVICE,
            vec![ChannelDescriptor::new(HEALTH_HEART_RATE), ChannelDescriptor::new(HEALTH_BATTERY)],
        )];
        let plan = plan_channels(&services);
        let types: Vec<_> = plan.channels.iter().map(|c| c.metric_type).collect();
        assert_eq!(types, vec![MetricType::HeartRate, MetricType::Battery]);
    }

    #[test]
    fn test_plan_falls_back_to_heart_rate() {
        let services = vec![ServiceDescriptor::new(
            HEART_RATE_SERVICE,
            vec![ChannelDescriptor::new(HEART_RATE_MEASUREMENT)],
        )];
        let plan = plan_channels(&services);
        assert!(plan.degraded);
        assert_eq!(plan.channels, vec![FALLBACK_HEART_RATE]);
    }

    #[tokio::test]
    async fn test_subscribe_all_is_idempotent() {
        let radio = MockRadio::builder()
            .device("dev-1", MockDevice::health_wearable())
            .build();
        let link = connect(&radio, "dev-1").await;
        let services = link.discover(CancellationToken::new()).await.unwrap();

        let mut registry = SubscriptionRegistry::new();
        let first = registry.subscribe_all(link.as_ref(), &services).await;
        assert_eq!(first.subscribed, 6);
        let second = registry.subscribe_all(link.as_ref(), &services).await;
        assert_eq!(second.subscribed, 0);
        assert_eq!(second.already_subscribed, 6);

        assert_eq!(registry.len(), 6);
        assert_eq!(radio.subscribe_count("dev-1"), 6);
    }

    #[tokio::test]
    async fn test_failed_channel_does_not_stop_others() {
        let radio = MockRadio::builder()
            .device(
                "dev-1",
                MockDevice::health_wearable().failing_channel(HEALTH_BATTERY),
            )
            .build();
        let link = connect(&radio, "dev-1").await;
        let services = link.discover(CancellationToken::new()).await.unwrap();

        let events = EventDispatcher::default();
        let mut rx = events.subscribe();
        let mut registry = SubscriptionRegistry::new().with_events(events);
        let summary = registry.subscribe_all(link.as_ref(), &services).await;

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.subscribed, 5);
        assert!(!registry.is_subscribed(HEALTH_SERVICE, HEALTH_BATTERY));
        assert!(matches!(
            rx.try_recv().unwrap(),
            LinkEvent::SubscriptionFailed { channel, .. } if channel == HEALTH_BATTERY
        ));
    }

    #[tokio::test]
    async fn test_lookup_after_invalidate_is_none() {
        let radio = MockRadio::builder()
            .device("dev-1", MockDevice::health_wearable())
            .build();
        let link = connect(&radio, "dev-1").await;
        let services = link.discover(CancellationToken::new()).await.unwrap();

        let mut registry = SubscriptionRegistry::new();
        registry.subscribe_all(link.as_ref(), &services).await;
        assert!(registry.lookup("dev-1", HEALTH_HEART_RATE).is_some());
        assert!(registry.lookup("dev-2", HEALTH_HEART_RATE).is_none());

        assert_eq!(registry.invalidate("dev-1"), 6);
        assert!(registry.lookup("dev-1", HEALTH_HEART_RATE).is_none());
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_all() {
        let radio = MockRadio::builder()
            .device("dev-1", MockDevice::health_wearable())
            .build();
        let link = connect(&radio, "dev-1").await;
        let services = link.discover(CancellationToken::new()).await.unwrap();

        let mut registry = SubscriptionRegistry::new();
        registry.subscribe_all(link.as_ref(), &services).await;
        registry.unsubscribe_all(link.as_ref()).await;

        assert!(registry.is_empty());
        assert!(radio.active_subscriptions("dev-1").is_empty());
    }
}
