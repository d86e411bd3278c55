//! Platform-agnostic data model for the caremon telemetry pipeline.
//!
//! This crate holds the types shared by the radio side (caremon-core), the
//! persistence layer (caremon-store) and the delivery service
//! (caremon-service).
//!
//! # Features
//!
//! - Metric samples with a validated quality score
//! - The telemetry batch wire format accepted by the ingestion endpoint
//! - Durable queue records
//! - UUID constants for the wearable's GATT channels
//!
//! # Example
//!
//! ```
//! use caremon_types::{MetricSample, MetricType, QualityScore, TelemetryBatch};
//! use time::OffsetDateTime;
//!
//! let sample = MetricSample::new(
//!     MetricType::HeartRate,
//!     72.0,
//!     MetricType::HeartRate.default_unit(),
//!     QualityScore::clamped(0.9),
//!     OffsetDateTime::now_utc(),
//! );
//! let batch = TelemetryBatch::from_samples("AA:BB:CC:DD:EE:FF", &[sample]);
//! assert_eq!(batch.len(), 1);
//! ```

pub mod error;
pub mod queue;
pub mod types;
pub mod uuid;
pub mod wire;

pub use error::{ParseError, ParseResult};
pub use queue::{HttpMethod, QueuedRequest};
pub use types::{MetricSample, MetricType, QualityScore};
pub use uuid as uuids;
pub use wire::{Location, LocationSource, MetricRecord, TelemetryBatch};
