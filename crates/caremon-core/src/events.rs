//! Radio and lifecycle events.
//!
//! Two kinds of events flow through the crate:
//!
//! - [`RadioEvent`]: typed messages the radio backend pushes into the
//!   pipeline driver's channel (link up, link lost, notification payload).
//! - [`LinkEvent`]: notifications the connection manager broadcasts to
//!   observers such as a UI.

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::state::{DisconnectReason, LinkState};

/// Events emitted by a radio link.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// The radio stack reports the link as established.
    Connected { device_id: String },
    /// The radio stack reports the link as gone.
    Disconnected {
        device_id: String,
        reason: DisconnectReason,
    },
    /// A notification arrived on a subscribed channel.
    CharacteristicUpdate {
        device_id: String,
        channel: Uuid,
        payload: Bytes,
    },
}

impl RadioEvent {
    pub fn device_id(&self) -> &str {
        match self {
            RadioEvent::Connected { device_id }
            | RadioEvent::Disconnected { device_id, .. }
            | RadioEvent::CharacteristicUpdate { device_id, .. } => device_id,
        }
    }
}

/// Sender half handed to radio links.
pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;

/// Receiver half owned by the pipeline driver.
pub type RadioEventReceiver = mpsc::UnboundedReceiver<RadioEvent>;

/// Create the radio event channel.
pub fn radio_channel() -> (RadioEventSender, RadioEventReceiver) {
    mpsc::unbounded_channel()
}

/// Lifecycle notifications broadcast by the connection manager.
///
/// All events are serializable for logging and IPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum LinkEvent {
    /// The lifecycle state changed.
    StateChanged {
        device_id: Option<String>,
        state: LinkState,
    },
    /// A device matched during a scan.
    Discovered {
        device_id: String,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// A reconnect attempt was scheduled.
    ReconnectScheduled {
        device_id: String,
        attempt: u32,
        delay: Duration,
    },
    /// Reconnection was abandoned after the attempt cap.
    ReconnectAbandoned { device_id: String, attempts: u32 },
    /// A single channel could not be subscribed.
    SubscriptionFailed {
        device_id: String,
        channel: Uuid,
        error: String,
    },
}

/// Sender for link events.
pub type LinkEventSender = broadcast::Sender<LinkEvent>;

/// Receiver for link events.
pub type LinkEventReceiver = broadcast::Receiver<LinkEvent>;

/// Event dispatcher for sending link events to multiple receivers.
#[derive(Debug, Clone)]
pub struct EventDispatcher {
    sender: LinkEventSender,
}

impl EventDispatcher {
    /// Create a new event dispatcher.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events.
    pub fn subscribe(&self) -> LinkEventReceiver {
        self.sender.subscribe()
    }

    /// Send an event.
    pub fn send(&self, event: LinkEvent) {
        // Ignore error if no receivers
        let _ = self.sender.send(event);
    }

    /// Get the number of active receivers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(100)
    }
}
