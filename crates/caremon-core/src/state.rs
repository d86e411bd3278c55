//! Connection lifecycle state graph.
//!
//! ```text
//! Idle ─► Scanning ─► Connecting ─► ServiceDiscovery ─► Connected
//!  ▲          │           │                 │                │
//!  │          ▼           ▼                 ▼                ▼
//!  └────── (Idle)    Disconnected(reason) ◄─────────────────┘
//!                         │
//!                         ▼
//!                   Reconnecting ─► Connecting | Idle | GivenUp
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Reason for a disconnection.
///
/// This enum is marked `#[non_exhaustive]` to allow adding new reasons
/// in future versions without breaking downstream code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum DisconnectReason {
    /// Disconnection requested by the user or by teardown.
    UserRequested,
    /// The radio stack reported the link as lost.
    LinkLost,
    /// Connecting did not finish within the timeout.
    ConnectTimeout,
    /// Service discovery did not finish within the timeout.
    DiscoveryTimeout,
    /// Another device was selected, replacing this one.
    Replaced,
    /// BLE error occurred.
    BleError(String),
}

impl DisconnectReason {
    /// Whether the reconnection policy should run for this reason.
    pub fn should_reconnect(&self) -> bool {
        !matches!(self, DisconnectReason::UserRequested | DisconnectReason::Replaced)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserRequested => write!(f, "user requested"),
            Self::LinkLost => write!(f, "link lost"),
            Self::ConnectTimeout => write!(f, "connect timeout"),
            Self::DiscoveryTimeout => write!(f, "discovery timeout"),
            Self::Replaced => write!(f, "replaced by another device"),
            Self::BleError(msg) => write!(f, "BLE error: {}", msg),
        }
    }
}

/// Lifecycle state of the active device connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum LinkState {
    Idle,
    Scanning,
    Connecting,
    ServiceDiscovery,
    Connected,
    Disconnected(DisconnectReason),
    Reconnecting,
    GivenUp,
}

impl LinkState {
    /// Whether `next` is reachable from `self` in one step.
    pub fn can_transition_to(&self, next: &LinkState) -> bool {
        use LinkState::*;

        matches!(
            (self, next),
            (Idle, Scanning)
                | (Idle, Connecting)
                | (Scanning, Idle)
                | (Scanning, Connecting)
                | (Connecting, ServiceDiscovery)
                | (Connecting, Disconnected(_))
                | (ServiceDiscovery, Connected)
                | (ServiceDiscovery, Disconnected(_))
                | (Connected, Disconnected(_))
                | (Disconnected(_), Reconnecting)
                | (Disconnected(_), Idle)
                | (Disconnected(_), Scanning)
                | (Disconnected(_), Connecting)
                | (Reconnecting, Connecting)
                | (Reconnecting, Idle)
                | (Reconnecting, GivenUp)
                | (GivenUp, Scanning)
                | (GivenUp, Connecting)
                | (GivenUp, Idle)
        )
    }

    /// Whether a radio link is currently held (connected or being set up).
    pub fn holds_link(&self) -> bool {
        matches!(
            self,
            LinkState::Connecting | LinkState::ServiceDiscovery | LinkState::Connected
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Idle => write!(f, "idle"),
            LinkState::Scanning => write!(f, "scanning"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::ServiceDiscovery => write!(f, "service_discovery"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
            LinkState::Reconnecting => write!(f, "reconnecting"),
            LinkState::GivenUp => write!(f, "given_up"),
        }
    }
}

/// The single device the connection manager is working with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceHandle {
    /// Opaque connection identifier (MAC address or platform UUID).
    pub id: String,
    /// Human-readable advertised name.
    pub name: Option<String>,
    /// Serial number or hardware fingerprint, if known.
    pub fingerprint: Option<String>,
    /// Signal strength observed when the device was last seen.
    pub rssi: Option<i16>,
    /// Current lifecycle state.
    pub state: LinkState,
}

impl DeviceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            fingerprint: None,
            rssi: None,
            state: LinkState::Idle,
        }
    }
}
