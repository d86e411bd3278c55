//! Telemetry delivery agent for caremon wearables.
//!
//! This crate connects the radio pipeline from `caremon-core` to the
//! ingestion backend:
//! - Posts telemetry batches over HTTP ([`DeliveryClient`])
//! - Persists batches that could not reach the backend ([`OfflineQueue`])
//! - Tracks backend reachability and replays the queue when it returns
//!   ([`ReachabilityMonitor`])
//! - Attaches the last known location to outgoing batches ([`LocationTracker`])
//!
//! # Configuration
//!
//! The agent reads configuration from `~/.config/caremon/agent.toml`:
//!
//! ```toml
//! [backend]
//! base_url = "https://api.example.com"
//! ingest_path = "/api/v1/telemetry"
//! api_token = "..."
//!
//! [device]
//! fingerprint = "SN-123456"
//!
//! [queue]
//! max_retries = 3
//!
//! [reachability]
//! probe_path = "/api/health"
//! probe_interval_secs = 30
//! ```
//!
//! Every section is optional; omitted values use the defaults documented
//! on [`Config`].

pub mod config;
pub mod delivery;
pub mod error;
pub mod location;
pub mod queue;
pub mod reachability;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{
    BackendConfig, BufferConfig, Config, ConfigError, ConnectionConfig, DeviceConfig, LocationConfig,
    QueueConfig, ReachabilityConfig, SignalConfig, ValidationError,
};
pub use delivery::DeliveryClient;
pub use error::{DeliveryError, Result};
pub use location::LocationTracker;
pub use queue::{DrainReport, OfflineQueue};
pub use reachability::{HttpProbe, Probe, ReachabilityMonitor};
pub use transport::{HttpTransport, Transport};
