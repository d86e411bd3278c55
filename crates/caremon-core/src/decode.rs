//! Telemetry decoding.
//!
//! Turns a raw channel payload into a [`MetricSample`]. Three forms are
//! tried in order:
//!
//! 1. A JSON object: `{"value": 72, "unit": "bpm", "qualityScore": 0.8,
//!    "rssi": -60, "timestamp": "2024-01-15T10:30:00Z"}`. Only `value` is
//!    required; `timestamp` may also be epoch milliseconds.
//! 2. A bare number: ASCII numeric text, or the channel's native GATT
//!    scalar (a single byte, or a Heart Rate Measurement record).
//! 3. Anything else is dropped and logged.
//!
//! Decoding never fails outward; a dropped sample is `None`.

use serde::Deserialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{trace, warn};

use caremon_types::{MetricSample, QualityScore};

use crate::channels::{ChannelSpec, NativeScalar};
use crate::error::{Error, Result};

/// Linear mapping from received signal strength onto a quality score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalRange {
    /// RSSI (dBm) at or below which quality is 0.
    pub floor: i16,
    /// RSSI (dBm) at or above which quality is 1.
    pub ceiling: i16,
    /// Quality when neither the payload nor the link reports a signal.
    pub default_quality: f32,
}

impl Default for SignalRange {
    fn default() -> Self {
        Self {
            floor: -100,
            ceiling: -50,
            default_quality: 0.9,
        }
    }
}

impl SignalRange {
    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.floor >= self.ceiling {
            return Err(Error::invalid_config("rssi floor must be below ceiling"));
        }
        if !(0.0..=1.0).contains(&self.default_quality) {
            return Err(Error::invalid_config("default_quality must be within [0, 1]"));
        }
        Ok(())
    }

    /// Quality score for an optional RSSI reading.
    pub fn quality(&self, rssi: Option<i16>) -> QualityScore {
        let Some(rssi) = rssi else {
            return QualityScore::clamped(self.default_quality);
        };
        let span = f32::from(self.ceiling) - f32::from(self.floor);
        QualityScore::clamped((f32::from(rssi) - f32::from(self.floor)) / span)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuredPayload {
    value: f64,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    quality_score: Option<f64>,
    #[serde(default)]
    rssi: Option<i16>,
    #[serde(default)]
    timestamp: Option<PayloadTimestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PayloadTimestamp {
    Millis(i64),
    FractionalMillis(f64),
    Text(String),
}

impl PayloadTimestamp {
    /// The timestamp, if it is valid and its year is one RFC 3339 can carry.
    fn resolve(&self) -> Option<OffsetDateTime> {
        let resolved = match self {
            PayloadTimestamp::Millis(ms) => {
                OffsetDateTime::from_unix_timestamp_nanos(i128::from(*ms) * 1_000_000).ok()
            }
            PayloadTimestamp::FractionalMillis(ms) if ms.is_finite() => {
                OffsetDateTime::from_unix_timestamp_nanos((*ms * 1_000_000.0) as i128).ok()
            }
            PayloadTimestamp::FractionalMillis(_) => None,
            PayloadTimestamp::Text(text) => OffsetDateTime::parse(text, &Rfc3339).ok(),
        };
        resolved.filter(|ts| (0..=9999).contains(&ts.year()))
    }
}

/// Decoder for channel payloads.
#[derive(Debug, Clone, Default)]
pub struct TelemetryDecoder {
    signal: SignalRange,
}

impl TelemetryDecoder {
    pub fn new(signal: SignalRange) -> Self {
        Self { signal }
    }

    pub fn signal(&self) -> &SignalRange {
        &self.signal
    }

    /// Decode one payload, or drop it.
    ///
    /// `link_rssi` is used for the quality score when the payload carries
    /// neither a score nor its own RSSI. `now` stamps samples without a
    /// usable timestamp.
    pub fn decode(
        &self,
        payload: &[u8],
        spec: &ChannelSpec,
        link_rssi: Option<i16>,
        now: OffsetDateTime,
    ) -> Option<MetricSample> {
        match self.try_decode(payload, spec, link_rssi, now) {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!(metric = %spec.metric_type, len = payload.len(), error = %e, "Dropping undecodable sample");
                None
            }
        }
    }

    fn try_decode(
        &self,
        payload: &[u8],
        spec: &ChannelSpec,
        link_rssi: Option<i16>,
        now: OffsetDateTime,
    ) -> Result<MetricSample> {
        if let Ok(structured) = serde_json::from_slice::<StructuredPayload>(payload) {
            trace!(metric = %spec.metric_type, "Structured payload");
            if !structured.value.is_finite() {
                return Err(Error::DecodeFailure("value is not finite".into()));
            }
            let quality = match structured.quality_score {
                Some(score) => QualityScore::clamped(score as f32),
                None => self.signal.quality(structured.rssi.or(link_rssi)),
            };
            let timestamp = structured
                .timestamp
                .as_ref()
                .and_then(PayloadTimestamp::resolve)
                .unwrap_or(now);
            let unit = structured.unit.unwrap_or_else(|| spec.unit.to_string());
            return Ok(MetricSample::new(spec.metric_type, structured.value, unit, quality, timestamp));
        }

        let value = parse_numeric(payload, spec.native)?;
        Ok(MetricSample::new(
            spec.metric_type,
            value,
            spec.unit,
            self.signal.quality(link_rssi),
            now,
        ))
    }
}

/// Parse a bare numeric payload: text first, then the native scalar.
pub fn parse_numeric(payload: &[u8], native: NativeScalar) -> Result<f64> {
    if let Some(value) = std::str::from_utf8(payload)
        .ok()
        .and_then(|text| text.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
    {
        return Ok(value);
    }

    match native {
        NativeScalar::U8 => match payload {
            [byte] => Ok(f64::from(*byte)),
            _ => Err(Error::DecodeFailure(format!(
                "expected 1 byte, got {}",
                payload.len()
            ))),
        },
        NativeScalar::HeartRateMeasurement => parse_heart_rate_measurement(payload),
        NativeScalar::None => Err(Error::DecodeFailure("payload is neither JSON nor numeric".into())),
    }
}

/// Parse a Heart Rate Measurement value: bit 0 of the flags byte selects a
/// u16 LE value over a u8.
fn parse_heart_rate_measurement(payload: &[u8]) -> Result<f64> {
    match payload {
        [flags, lo, hi, ..] if flags & 0x01 != 0 => Ok(f64::from(u16::from_le_bytes([*lo, *hi]))),
        [flags, value, ..] if flags & 0x01 == 0 => Ok(f64::from(*value)),
        _ => Err(Error::DecodeFailure(format!(
            "heart rate measurement too short: {} bytes",
            payload.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::{FALLBACK_HEART_RATE, HEALTH_CHANNELS};
    use caremon_types::MetricType;
    use proptest::prelude::*;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2024-01-15 10:30:00 UTC);

    fn heart_rate() -> ChannelSpec {
        HEALTH_CHANNELS[0]
    }

    fn temperature() -> ChannelSpec {
        HEALTH_CHANNELS[2]
    }

    #[test]
    fn test_structured_payload() {
        let decoder = TelemetryDecoder::default();
        let payload = br#"{"value": 36.6, "unit": "C", "qualityScore": 0.75, "timestamp": "2024-01-15T09:00:00Z"}"#;
        let sample = decoder.decode(payload, &temperature(), None, NOW).unwrap();

        assert_eq!(sample.metric_type(), MetricType::Temperature);
        assert_eq!(sample.value(), 36.6);
        assert_eq!(sample.unit(), "C");
        assert_eq!(sample.quality().value(), 0.75);
        assert_eq!(sample.timestamp(), datetime!(2024-01-15 09:00:00 UTC));
    }

    #[test]
    fn test_structured_defaults() {
        let decoder = TelemetryDecoder::default();
        let sample = decoder.decode(br#"{"value": 72}"#, &heart_rate(), None, NOW).unwrap();
        assert_eq!(sample.unit(), "bpm");
        assert_eq!(sample.quality().value(), 0.9);
        assert_eq!(sample.timestamp(), NOW);
    }

    #[test]
    fn test_epoch_millis_timestamp() {
        let decoder = TelemetryDecoder::default();
        let sample = decoder
            .decode(br#"{"value": 72, "timestamp": 1705312800000}"#, &heart_rate(), None, NOW)
            .unwrap();
        assert_eq!(sample.timestamp(), datetime!(2024-01-15 10:00:00 UTC));
    }

    #[test]
    fn test_unrepresentable_timestamp_falls_back_to_now() {
        let decoder = TelemetryDecoder::default();
        let sample = decoder
            .decode(br#"{"value": 72, "timestamp": -62200000000000}"#, &heart_rate(), None, NOW)
            .unwrap();
        assert_eq!(sample.timestamp(), NOW);
        assert!(sample.timestamp().format(&Rfc3339).is_ok());

        let far_future = decoder
            .decode(br#"{"value": 72, "timestamp": 253402300800000}"#, &heart_rate(), None, NOW)
            .unwrap();
        assert_eq!(far_future.timestamp(), NOW);
    }

    #[test]
    fn test_explicit_score_is_clamped() {
        let decoder = TelemetryDecoder::default();
        let sample = decoder
            .decode(br#"{"value": 72, "qualityScore": 4.2}"#, &heart_rate(), None, NOW)
            .unwrap();
        assert_eq!(sample.quality().value(), 1.0);
    }

    #[test]
    fn test_quality_from_payload_rssi_over_link() {
        let decoder = TelemetryDecoder::default();
        let sample = decoder
            .decode(br#"{"value": 72, "rssi": -75}"#, &heart_rate(), Some(-40), NOW)
            .unwrap();
        assert_eq!(sample.quality().value(), 0.5);
    }

    #[test]
    fn test_numeric_text_fallback() {
        let decoder = TelemetryDecoder::default();
        let sample = decoder.decode(b" 98 ", &temperature(), Some(-50), NOW).unwrap();
        assert_eq!(sample.value(), 98.0);
        assert_eq!(sample.quality().value(), 1.0);
        assert_eq!(sample.timestamp(), NOW);
    }

    #[test]
    fn test_native_scalars() {
        assert_eq!(parse_numeric(&[0x05], NativeScalar::U8).unwrap(), 5.0);
        assert_eq!(
            parse_numeric(&[0x00, 0x48], NativeScalar::HeartRateMeasurement).unwrap(),
            72.0
        );
        assert_eq!(
            parse_numeric(&[0x01, 0x2C, 0x01], NativeScalar::HeartRateMeasurement).unwrap(),
            300.0
        );
        assert!(parse_numeric(&[0x01, 0x2C], NativeScalar::HeartRateMeasurement).is_err());
    }

    #[test]
    fn test_heart_rate_fallback_channel() {
        let decoder = TelemetryDecoder::default();
        let sample = decoder.decode(&[0x00, 0x50], &FALLBACK_HEART_RATE, None, NOW).unwrap();
        assert_eq!(sample.value(), 80.0);
    }

    #[test]
    fn test_garbage_is_dropped() {
        let decoder = TelemetryDecoder::default();
        assert!(decoder.decode(b"not a number", &temperature(), None, NOW).is_none());
        assert!(decoder.decode(b"", &temperature(), None, NOW).is_none());
        assert!(decoder.decode(br#"{"unit": "bpm"}"#, &temperature(), None, NOW).is_none());
    }

    #[test]
    fn test_signal_mapping() {
        let range = SignalRange::default();
        assert_eq!(range.quality(Some(-120)).value(), 0.0);
        assert_eq!(range.quality(Some(-100)).value(), 0.0);
        assert_eq!(range.quality(Some(-75)).value(), 0.5);
        assert_eq!(range.quality(Some(-50)).value(), 1.0);
        assert_eq!(range.quality(Some(-20)).value(), 1.0);
        assert_eq!(range.quality(None).value(), 0.9);
    }

    #[test]
    fn test_signal_range_validate() {
        assert!(SignalRange::default().validate().is_ok());
        let inverted = SignalRange {
            floor: -40,
            ceiling: -90,
            ..Default::default()
        };
        assert!(inverted.validate().is_err());
    }

    proptest! {
        #[test]
        fn quality_always_in_unit_interval(
            payload in proptest::collection::vec(any::<u8>(), 0..32),
            rssi in proptest::option::of(any::<i16>()),
            score in any::<f64>(),
        ) {
            let decoder = TelemetryDecoder::default();
            if let Some(sample) = decoder.decode(&payload, &heart_rate(), rssi, NOW) {
                prop_assert!((0.0..=1.0).contains(&sample.quality().value()));
            }

            let json = format!(r#"{{"value": 1, "qualityScore": {}}}"#, score);
            if let Some(sample) = decoder.decode(json.as_bytes(), &heart_rate(), rssi, NOW) {
                prop_assert!((0.0..=1.0).contains(&sample.quality().value()));
            }
        }
    }
}
