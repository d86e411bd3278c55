//! Telemetry batch wire format sent to the backend ingestion endpoint.
//!
//! ```json
//! {
//!   "deviceId": "AA:BB:CC:DD:EE:FF",
//!   "metrics": [
//!     { "type": "heart_rate", "value": 72, "unit": "bpm",
//!       "qualityScore": 0.9, "timestamp": "2026-01-01T10:00:00Z" }
//!   ],
//!   "location": { "latitude": 55.75, "longitude": 37.61,
//!                 "accuracy": 12.0, "source": "gps" }
//! }
//! ```

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::types::{MetricSample, MetricType};

/// Where a location fix came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum LocationSource {
    Gps,
    Network,
    Manual,
}

/// A geographic position attached to a telemetry batch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    pub source: LocationSource,
}

/// One metric entry of a [`TelemetryBatch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricRecord {
    #[serde(rename = "type")]
    pub metric_type: MetricType,
    pub value: f64,
    pub unit: String,
    pub quality_score: f32,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl From<&MetricSample> for MetricRecord {
    fn from(sample: &MetricSample) -> Self {
        Self {
            metric_type: sample.metric_type(),
            value: sample.value(),
            unit: sample.unit().to_string(),
            quality_score: sample.quality().value(),
            timestamp: sample.timestamp(),
        }
    }
}

/// Body of a telemetry ingestion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryBatch {
    pub device_id: String,
    pub metrics: Vec<MetricRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

impl TelemetryBatch {
    /// Build a batch from decoded samples, preserving their order.
    pub fn from_samples(device_id: impl Into<String>, samples: &[MetricSample]) -> Self {
        Self {
            device_id: device_id.into(),
            metrics: samples.iter().map(MetricRecord::from).collect(),
            location: None,
        }
    }

    /// Attach `location` unless the batch already carries one.
    #[must_use]
    pub fn with_location_if_absent(mut self, location: Option<Location>) -> Self {
        if self.location.is_none() {
            self.location = location;
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }
}
