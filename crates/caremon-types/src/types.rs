//! Core types for wearable telemetry samples.

use core::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::ParseError;

/// Kind of physiological or device metric carried by a sample.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new metric types
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum MetricType {
    /// Heart rate in beats per minute.
    HeartRate,
    /// Wearable battery level in percent.
    Battery,
    /// Skin temperature in degrees Celsius.
    Temperature,
    /// Step count.
    Steps,
    /// Blood oxygen saturation in percent.
    OxygenSaturation,
    /// Motion / acceleration magnitude.
    Motion,
}

impl MetricType {
    /// All known metric types, in channel-table order.
    pub const ALL: [MetricType; 6] = [
        MetricType::HeartRate,
        MetricType::Battery,
        MetricType::Temperature,
        MetricType::Steps,
        MetricType::OxygenSaturation,
        MetricType::Motion,
    ];

    /// Wire name of the metric (`"heart_rate"`, `"battery"`, ...).
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::HeartRate => "heart_rate",
            MetricType::Battery => "battery",
            MetricType::Temperature => "temperature",
            MetricType::Steps => "steps",
            MetricType::OxygenSaturation => "oxygen_saturation",
            MetricType::Motion => "motion",
        }
    }

    /// Unit used when the payload does not carry one.
    ///
    /// # Examples
    ///
    /// ```
    /// use caremon_types::MetricType;
    ///
    /// assert_eq!(MetricType::HeartRate.default_unit(), "bpm");
    /// assert_eq!(MetricType::OxygenSaturation.default_unit(), "%");
    /// ```
    #[must_use]
    pub const fn default_unit(&self) -> &'static str {
        match self {
            MetricType::HeartRate => "bpm",
            MetricType::Battery => "%",
            MetricType::Temperature => "°C",
            MetricType::Steps => "steps",
            MetricType::OxygenSaturation => "%",
            MetricType::Motion => "g",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "heart_rate" | "heartrate" | "hr" => Ok(MetricType::HeartRate),
            "battery" | "battery_level" => Ok(MetricType::Battery),
            "temperature" | "temp" => Ok(MetricType::Temperature),
            "steps" | "step_count" => Ok(MetricType::Steps),
            "oxygen_saturation" | "spo2" => Ok(MetricType::OxygenSaturation),
            "motion" | "accelerometer" => Ok(MetricType::Motion),
            _ => Err(ParseError::UnknownMetricType(s.to_string())),
        }
    }
}

/// Normalized confidence of a sample, always within `[0.0, 1.0]`.
///
/// The only ways to build one are [`QualityScore::new`], which rejects
/// out-of-range values, and [`QualityScore::clamped`], which saturates them.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct QualityScore(f32);

impl QualityScore {
    /// Lowest possible score.
    pub const MIN: QualityScore = QualityScore(0.0);
    /// Highest possible score.
    pub const MAX: QualityScore = QualityScore(1.0);

    /// Create a score, rejecting NaN and values outside `[0, 1]`.
    pub fn new(value: f32) -> Result<Self, ParseError> {
        if value.is_nan() || !(0.0..=1.0).contains(&value) {
            return Err(ParseError::QualityOutOfRange(value));
        }
        Ok(Self(value))
    }

    /// Create a score, saturating out-of-range values. NaN maps to 0.
    #[must_use]
    pub fn clamped(value: f32) -> Self {
        if value.is_nan() {
            return Self::MIN;
        }
        Self(value.clamp(0.0, 1.0))
    }

    /// The raw score.
    #[must_use]
    pub fn value(&self) -> f32 {
        self.0
    }
}

impl TryFrom<f32> for QualityScore {
    type Error = ParseError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QualityScore> for f32 {
    fn from(score: QualityScore) -> Self {
        score.0
    }
}

/// A single decoded telemetry sample.
///
/// Samples are immutable once created; fields are exposed through accessors only.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricSample {
    metric_type: MetricType,
    value: f64,
    unit: String,
    quality: QualityScore,
    timestamp: OffsetDateTime,
}

impl MetricSample {
    /// Create a new sample.
    pub fn new(
        metric_type: MetricType,
        value: f64,
        unit: impl Into<String>,
        quality: QualityScore,
        timestamp: OffsetDateTime,
    ) -> Self {
        Self {
            metric_type,
            value,
            unit: unit.into(),
            quality,
            timestamp,
        }
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn quality(&self) -> QualityScore {
        self.quality
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        self.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_metric_type_roundtrip_names() {
        for metric in MetricType::ALL {
            assert_eq!(metric.as_str().parse::<MetricType>().unwrap(), metric);
        }
    }

    #[test]
    fn test_metric_type_aliases() {
        assert_eq!("SpO2".parse::<MetricType>().unwrap(), MetricType::OxygenSaturation);
        assert_eq!("heart-rate".parse::<MetricType>().unwrap(), MetricType::HeartRate);
        assert!("glucose".parse::<MetricType>().is_err());
    }

    #[test]
    fn test_metric_type_serde_name() {
        let json = serde_json::to_string(&MetricType::OxygenSaturation).unwrap();
        assert_eq!(json, "\"oxygen_saturation\"");
    }

    #[test]
    fn test_quality_rejects_out_of_range() {
        assert!(QualityScore::new(1.01).is_err());
        assert!(QualityScore::new(-0.1).is_err());
        assert!(QualityScore::new(f32::NAN).is_err());
        assert_eq!(QualityScore::new(0.5).unwrap().value(), 0.5);
    }

    #[test]
    fn test_quality_deserialize_validates() {
        assert!(serde_json::from_str::<QualityScore>("0.7").is_ok());
        assert!(serde_json::from_str::<QualityScore>("1.7").is_err());
    }

    proptest! {
        #[test]
        fn clamped_quality_always_in_unit_interval(v in proptest::num::f32::ANY) {
            let q = QualityScore::clamped(v).value();
            prop_assert!((0.0..=1.0).contains(&q));
        }
    }
}
