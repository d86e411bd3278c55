//! Error types for caremon-core.
//!
//! This module defines the errors that can occur while discovering,
//! connecting to and streaming from a wearable.
//!
//! # Propagation
//!
//! | Error Type | Handling |
//! |------------|----------|
//! | [`Error::ConnectionTimeout`] | Escalates to the reconnection state machine |
//! | [`Error::DiscoveryTimeout`] | Escalates to the reconnection state machine |
//! | [`Error::ChannelSubscriptionFailed`] | Logged; remaining channels continue |
//! | [`Error::DecodeFailure`] | Logged; the sample is dropped |
//! | [`Error::Bluetooth`] | Connection-level, escalates to reconnection |
//! | [`Error::InvalidTransition`] | Programming error in the caller, reported |
//! | [`Error::InvalidConfig`] | Fix configuration and restart |
//!
//! None of these reach the UI layer: the pipeline driver swallows and logs
//! every error at its boundary.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::state::LinkState;

/// Errors that can occur in the radio side of the pipeline.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new error variants
/// in future versions without breaking downstream code.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Bluetooth Low Energy error.
    #[error("Bluetooth error: {0}")]
    Bluetooth(#[from] btleplug::Error),

    /// Device not found during scan or connection.
    #[error("Device not found: {0}")]
    DeviceNotFound(DeviceNotFoundReason),

    /// The link could not be established within the connect timeout.
    #[error("Connection to '{device_id}' timed out after {duration:?}")]
    ConnectionTimeout {
        device_id: String,
        duration: Duration,
    },

    /// Service/channel discovery did not finish within the timeout.
    #[error("Service discovery on '{device_id}' timed out after {duration:?}")]
    DiscoveryTimeout {
        device_id: String,
        duration: Duration,
    },

    /// Subscribing to a single channel failed.
    #[error("Subscription to {service}:{channel} failed: {reason}")]
    ChannelSubscriptionFailed {
        service: Uuid,
        channel: Uuid,
        reason: String,
    },

    /// A channel payload could not be decoded.
    #[error("Decode failure: {0}")]
    DecodeFailure(String),

    /// Operation attempted while no device is connected.
    #[error("Not connected to a device")]
    NotConnected,

    /// The requested lifecycle transition is not part of the state graph.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: LinkState, to: LinkState },

    /// Operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Reason why a device was not found.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DeviceNotFoundReason {
    /// Device with specified identifier not seen by the radio.
    NotFound { identifier: String },
    /// No Bluetooth adapter available.
    NoAdapter,
}

impl std::fmt::Display for DeviceNotFoundReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { identifier } => write!(f, "device '{}' not found", identifier),
            Self::NoAdapter => write!(f, "no Bluetooth adapter available"),
        }
    }
}

impl Error {
    /// Create a device not found error for a specific identifier.
    pub fn device_not_found(identifier: impl Into<String>) -> Self {
        Self::DeviceNotFound(DeviceNotFoundReason::NotFound {
            identifier: identifier.into(),
        })
    }

    /// Create a configuration error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    /// Create a channel subscription failure.
    pub fn subscription_failed(service: Uuid, channel: Uuid, reason: impl ToString) -> Self {
        Self::ChannelSubscriptionFailed {
            service,
            channel,
            reason: reason.to_string(),
        }
    }

    /// Whether this error should hand the device to the reconnection policy.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout { .. }
                | Error::DiscoveryTimeout { .. }
                | Error::Bluetooth(_)
                | Error::DeviceNotFound(DeviceNotFoundReason::NotFound { .. })
        )
    }
}

impl From<caremon_types::ParseError> for Error {
    fn from(err: caremon_types::ParseError) -> Self {
        Error::DecodeFailure(err.to_string())
    }
}

/// Result type alias using caremon-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;
