//! BLE connectivity and telemetry pipeline for caremon wearables.
//!
//! This crate finds a wearable over Bluetooth Low Energy, keeps a link to it
//! alive, subscribes to its health channels, decodes notifications into
//! [`MetricSample`]s and hands them to a [`BatchSink`] in bounded batches.
//!
//! # Features
//!
//! - **Discovery**: Time-bounded scans with fingerprint matching
//! - **Lifecycle**: Validated state graph with connect and discovery timeouts
//! - **Reconnection**: Linear backoff with an attempt cap
//! - **Subscriptions**: Health channel table with a motion channel and a
//!   standard Heart Rate fallback
//! - **Batching**: Size threshold and periodic flush with retry-first ordering
//!
//! # Architecture
//!
//! A single driver task owns the [`ConnectionManager`], the
//! [`SubscriptionRegistry`] and the [`BatchBuffer`]. Radio callbacks,
//! reconnect timers and flush completions are all messages into that task,
//! so no state is shared between them.
//!
//! The radio is behind the [`Radio`] and [`RadioLink`] traits.
//! [`BleRadio`] talks to real hardware via btleplug and [`MockRadio`] is a
//! scripted stand-in for tests.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use caremon_core::{BleRadio, MockSink, PipelineOptions, TelemetryPipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let radio = Arc::new(BleRadio::new().await?);
//!     let (sink, _delivered) = MockSink::new();
//!
//!     let pipeline = TelemetryPipeline::spawn(radio, Arc::new(sink), PipelineOptions::default())?;
//!     let devices = pipeline.scan(Some("SN-123456")).await?;
//!     if let Some(device) = devices.first() {
//!         pipeline.connect(&device.id).await?;
//!     }
//!
//!     tokio::signal::ctrl_c().await?;
//!     pipeline.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod ble;
pub mod buffer;
pub mod channels;
pub mod connection;
pub mod decode;
pub mod error;
pub mod events;
pub mod mock;
pub mod pipeline;
pub mod radio;
pub mod reconnect;
pub mod registry;
pub mod scan;
pub mod sink;
pub mod state;
pub mod util;

pub use ble::BleRadio;
pub use buffer::{BatchBuffer, BufferOptions, FlushSettlement, PendingBatch};
pub use channels::{ChannelSpec, NativeScalar};
pub use connection::{ConnectionManager, ConnectionOptions};
pub use decode::{SignalRange, TelemetryDecoder};
pub use error::{DeviceNotFoundReason, Error, Result};
pub use events::{EventDispatcher, LinkEvent, LinkEventReceiver, RadioEvent};
pub use mock::{MockDevice, MockRadio, MockSink};
pub use pipeline::{PipelineHandle, PipelineOptions, PipelineStatsSnapshot, TelemetryPipeline};
pub use radio::{Advertisement, ChannelDescriptor, Radio, RadioLink, ServiceDescriptor, SubscriptionHandle};
pub use reconnect::{ReconnectOptions, ReconnectScheduler};
pub use registry::SubscriptionRegistry;
pub use scan::{DiscoveredDevice, ScanOptions};
pub use sink::{BatchSink, DeliveryOutcome};
pub use state::{DeviceHandle, DisconnectReason, LinkState};

// Re-export from caremon-types
pub use caremon_types::uuid as uuids;
pub use caremon_types::{MetricSample, MetricType, QualityScore, TelemetryBatch};
