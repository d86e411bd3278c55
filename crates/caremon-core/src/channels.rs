//! Channel table for the caremon wearable.
//!
//! Maps each GATT characteristic the pipeline knows about to the metric it
//! carries and the unit samples default to.

use uuid::Uuid;

use caremon_types::MetricType;
use caremon_types::uuids::{
    HEALTH_BATTERY, HEALTH_HEART_RATE, HEALTH_OXYGEN_SATURATION, HEALTH_SERVICE, HEALTH_STEPS,
    HEALTH_TEMPERATURE, HEART_RATE_MEASUREMENT, HEART_RATE_SERVICE, MOTION_NAME_PATTERNS,
};

/// Binary encoding a channel may use instead of JSON or text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeScalar {
    /// No binary form; only JSON or numeric text decode.
    None,
    /// A single unsigned byte.
    U8,
    /// Heart Rate Measurement: flags byte, then a u8 or u16 LE value.
    HeartRateMeasurement,
}

/// One entry of the channel table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub service: Uuid,
    pub channel: Uuid,
    pub metric_type: MetricType,
    pub unit: &'static str,
    pub native: NativeScalar,
}

impl ChannelSpec {
    pub const fn new(service: Uuid, channel: Uuid, metric_type: MetricType, native: NativeScalar) -> Self {
        Self {
            service,
            channel,
            metric_type,
            unit: metric_type.default_unit(),
            native,
        }
    }

    /// Registry key, `service:channel`.
    pub fn key(&self) -> String {
        subscription_key(self.service, self.channel)
    }
}

/// Registry key for a (service, channel) pair.
pub fn subscription_key(service: Uuid, channel: Uuid) -> String {
    format!("{}:{}", service, channel)
}

/// Channels of the aggregate health service.
pub const HEALTH_CHANNELS: [ChannelSpec; 5] = [
    ChannelSpec::new(HEALTH_SERVICE, HEALTH_HEART_RATE, MetricType::HeartRate, NativeScalar::U8),
    ChannelSpec::new(HEALTH_SERVICE, HEALTH_BATTERY, MetricType::Battery, NativeScalar::U8),
    ChannelSpec::new(HEALTH_SERVICE, HEALTH_TEMPERATURE, MetricType::Temperature, NativeScalar::None),
    ChannelSpec::new(HEALTH_SERVICE, HEALTH_STEPS, MetricType::Steps, NativeScalar::None),
    ChannelSpec::new(
        HEALTH_SERVICE,
        HEALTH_OXYGEN_SATURATION,
        MetricType::OxygenSaturation,
        NativeScalar::U8,
    ),
];

/// Standard heart rate channel used when the health service is missing.
pub const FALLBACK_HEART_RATE: ChannelSpec = ChannelSpec::new(
    HEART_RATE_SERVICE,
    HEART_RATE_MEASUREMENT,
    MetricType::HeartRate,
    NativeScalar::HeartRateMeasurement,
);

/// Channel spec for a motion characteristic found by description.
pub fn motion_channel(service: Uuid, channel: Uuid) -> ChannelSpec {
    ChannelSpec::new(service, channel, MetricType::Motion, NativeScalar::None)
}

/// Whether a characteristic description names a motion channel.
pub fn looks_like_motion(description: &str) -> bool {
    let description = description.to_lowercase();
    MOTION_NAME_PATTERNS.iter().any(|p| description.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_channels_are_unique() {
        let mut keys: Vec<String> = HEALTH_CHANNELS.iter().map(ChannelSpec::key).collect();
        keys.sort();
        keys.dedup();
        assert_eq!(keys.len(), HEALTH_CHANNELS.len());
    }

    #[test]
    fn test_units_follow_metric_defaults() {
        for spec in HEALTH_CHANNELS {
            assert_eq!(spec.unit, spec.metric_type.default_unit());
        }
        assert_eq!(FALLBACK_HEART_RATE.unit, "bpm");
    }

    #[test]
    fn test_motion_patterns() {
        assert!(looks_like_motion("Motion sensor"));
        assert!(looks_like_motion("3-axis ACCELerometer"));
        assert!(!looks_like_motion("Battery Level"));
    }
}
