//! Connection lifecycle manager.
//!
//! [`ConnectionManager`] owns the single active device, drives it through
//! the [`LinkState`] graph and hands connection-level failures to the
//! [`ReconnectScheduler`]. It is owned by one driver task and mutated only
//! through `&mut self`, so no state is shared behind locks.
//!
//! Every blocking step (scan, connect, discovery) is bounded. On expiry the
//! step's cancellation token is fired so the radio backend abandons the
//! attempt, and the manager moves to `Disconnected` and schedules a
//! reconnect instead of leaving the attempt dangling.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::events::{EventDispatcher, LinkEvent, LinkEventReceiver, RadioEventSender};
use crate::radio::{Radio, RadioLink, ServiceDescriptor};
use crate::reconnect::{ReconnectDue, ReconnectOptions, ReconnectScheduler, ScheduleOutcome};
use crate::scan::{DiscoveredDevice, ScanOptions, scan_devices};
use crate::state::{DeviceHandle, DisconnectReason, LinkState};

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Bound for connecting, and separately for service discovery.
    pub connect_timeout: Duration,
    /// Scan behaviour.
    pub scan: ScanOptions,
    /// Reconnection policy.
    pub reconnect: ReconnectOptions,
    /// Link event channel capacity.
    pub event_capacity: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            scan: ScanOptions::default(),
            reconnect: ReconnectOptions::default(),
            event_capacity: 100,
        }
    }
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn scan(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }

    #[must_use]
    pub fn reconnect(mut self, reconnect: ReconnectOptions) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.connect_timeout.is_zero() {
            return Err(Error::invalid_config("connect_timeout must be > 0"));
        }
        if self.event_capacity == 0 {
            return Err(Error::invalid_config("event_capacity must be > 0"));
        }
        self.scan.validate()?;
        self.reconnect.validate()
    }
}

/// Owner of the single active device connection.
pub struct ConnectionManager {
    radio: Arc<dyn Radio>,
    options: ConnectionOptions,
    state: LinkState,
    active: Option<DeviceHandle>,
    /// Device the lifecycle is currently about; survives the active handle
    /// being cleared so reconnects know whom to dial.
    target: Option<String>,
    link: Option<Box<dyn RadioLink>>,
    services: Vec<ServiceDescriptor>,
    /// Devices from the most recent scans, with the fingerprint they matched.
    seen: HashMap<String, DeviceHandle>,
    scheduler: ReconnectScheduler,
    events: EventDispatcher,
    radio_tx: RadioEventSender,
    cancel: CancellationToken,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state)
            .field("active", &self.active)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager.
    ///
    /// Links push their events into `radio_tx`; backoff timers post into
    /// `due_tx`. Cancelling `cancel` abandons any in-progress scan or
    /// connection attempt.
    pub fn new(
        radio: Arc<dyn Radio>,
        options: ConnectionOptions,
        radio_tx: RadioEventSender,
        due_tx: mpsc::UnboundedSender<ReconnectDue>,
        cancel: CancellationToken,
    ) -> Self {
        let events = EventDispatcher::new(options.event_capacity);
        let scheduler = ReconnectScheduler::new(options.reconnect.clone(), due_tx);
        Self {
            radio,
            options,
            state: LinkState::Idle,
            active: None,
            target: None,
            link: None,
            services: Vec::new(),
            seen: HashMap::new(),
            scheduler,
            events,
            radio_tx,
            cancel,
        }
    }

    pub fn state(&self) -> &LinkState {
        &self.state
    }

    pub fn active_device(&self) -> Option<&DeviceHandle> {
        self.active.as_ref()
    }

    pub fn active_id(&self) -> Option<&str> {
        self.active.as_ref().map(|h| h.id.as_str())
    }

    /// The open link, while one is held.
    pub fn link(&self) -> Option<&dyn RadioLink> {
        self.link.as_deref()
    }

    /// Services discovered on the active device.
    pub fn services(&self) -> &[ServiceDescriptor] {
        &self.services
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> LinkEventReceiver {
        self.events.subscribe()
    }

    pub fn reconnect_attempts(&self, device_id: &str) -> u32 {
        self.scheduler.attempts(device_id)
    }

    pub fn has_pending_reconnect(&self, device_id: &str) -> bool {
        self.scheduler.has_pending(device_id)
    }

    /// Read the link's signal strength into the active handle.
    pub async fn refresh_rssi(&mut self) -> Option<i16> {
        let rssi = self.link.as_deref()?.rssi().await;
        if let (Some(handle), Some(value)) = (self.active.as_mut(), rssi) {
            handle.rssi = Some(value);
        }
        rssi
    }

    fn transition(&mut self, next: LinkState) -> Result<()> {
        if self.state == next {
            return Ok(());
        }
        if !self.state.can_transition_to(&next) {
            return Err(Error::InvalidTransition {
                from: self.state.clone(),
                to: next,
            });
        }

        debug!(from = %self.state, to = %next, "State transition");
        self.state = next.clone();
        if let Some(handle) = self.active.as_mut() {
            handle.state = next.clone();
        }
        let device_id = self.active_id().map(str::to_string).or_else(|| self.target.clone());
        self.events.send(LinkEvent::StateChanged {
            device_id,
            state: next,
        });
        Ok(())
    }

    /// Transition, logging instead of failing.
    fn transition_or_warn(&mut self, next: LinkState) {
        if let Err(e) = self.transition(next) {
            warn!(error = %e, "Lifecycle transition rejected");
        }
    }

    /// Scan for wearables.
    ///
    /// While a link is held the scan runs without touching the lifecycle
    /// state. Otherwise any pending reconnection is abandoned first.
    pub async fn scan(&mut self, fingerprint: Option<&str>) -> Result<Vec<DiscoveredDevice>> {
        let radio = Arc::clone(&self.radio);
        let token = self.cancel.child_token();

        let result = if self.state.holds_link() {
            scan_devices(radio.as_ref(), &self.options.scan, fingerprint, token).await
        } else {
            self.abandon_reconnect()?;
            self.transition(LinkState::Scanning)?;
            let result = scan_devices(radio.as_ref(), &self.options.scan, fingerprint, token).await;
            self.transition(LinkState::Idle)?;
            result
        };

        let devices = result?;
        for device in &devices {
            self.events.send(LinkEvent::Discovered {
                device_id: device.id.clone(),
                name: device.name.clone(),
                rssi: device.rssi,
            });
            let mut handle = DeviceHandle::new(device.id.clone());
            handle.name = device.name.clone();
            handle.rssi = device.rssi;
            handle.fingerprint = fingerprint.map(str::to_string);
            self.seen.insert(device.id.clone(), handle);
        }
        Ok(devices)
    }

    /// Connect to `device_id`, replacing any other active device.
    ///
    /// Returns the services discovered on the device. Timeouts fail with
    /// [`Error::ConnectionTimeout`] or [`Error::DiscoveryTimeout`] and leave
    /// a reconnect scheduled.
    #[tracing::instrument(level = "info", skip(self), fields(timeout = ?self.options.connect_timeout))]
    pub async fn connect(&mut self, device_id: &str) -> Result<Vec<ServiceDescriptor>> {
        match self.active_id().map(str::to_string) {
            Some(active) if active == device_id && self.state == LinkState::Connected => {
                debug!("Already connected");
                return Ok(self.services.clone());
            }
            Some(active) if active != device_id => {
                info!(replaced = %active, "Replacing active device");
                self.drop_link(DisconnectReason::Replaced).await;
            }
            _ => {}
        }

        // A user-initiated connect starts the reconnection budget over.
        if let Some(previous) = self.target.take() {
            self.scheduler.reset(&previous);
        }
        self.scheduler.reset(device_id);

        self.establish(device_id).await
    }

    /// Handle a backoff timer firing.
    ///
    /// Returns the discovered services when the reconnect succeeded, and
    /// `None` when the timer was stale or the lifecycle moved on.
    pub async fn on_reconnect_due(&mut self, due: ReconnectDue) -> Result<Option<Vec<ServiceDescriptor>>> {
        if !self.scheduler.accept(&due) {
            return Ok(None);
        }
        if self.state != LinkState::Reconnecting || self.target.as_deref() != Some(due.device_id.as_str()) {
            debug!(device_id = %due.device_id, state = %self.state, "Reconnect no longer wanted");
            return Ok(None);
        }

        info!(device_id = %due.device_id, attempt = due.attempt, "Reconnecting");
        self.establish(&due.device_id).await.map(Some)
    }

    /// Handle the radio reporting a link as gone.
    ///
    /// Events for devices other than the active one are stale and ignored.
    /// Otherwise the active handle is cleared and, unless the reason rules
    /// it out, a reconnect is scheduled.
    pub async fn handle_disconnect(&mut self, device_id: &str, reason: DisconnectReason) -> Option<ScheduleOutcome> {
        if self.active_id() != Some(device_id) {
            debug!(device_id, "Ignoring disconnect for inactive device");
            return None;
        }

        info!(device_id, %reason, "Device disconnected");
        self.release_link().await;
        self.transition_or_warn(LinkState::Disconnected(reason.clone()));
        self.active = None;
        self.services.clear();

        if reason.should_reconnect() {
            Some(self.schedule_reconnect(device_id))
        } else {
            self.target = None;
            self.transition_or_warn(LinkState::Idle);
            None
        }
    }

    /// Disconnect at the user's request. No reconnect follows.
    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(id) = self.active_id().map(str::to_string).or_else(|| self.target.clone()) {
            self.scheduler.reset(&id);
        }

        if self.link.is_some() || self.state.holds_link() {
            self.release_link().await;
            self.transition(LinkState::Disconnected(DisconnectReason::UserRequested))?;
            self.active = None;
            self.services.clear();
        }

        match self.state {
            LinkState::Idle | LinkState::Scanning => {}
            _ => self.transition(LinkState::Idle)?,
        }
        self.target = None;
        Ok(())
    }

    /// Cancel every pending backoff timer.
    pub fn cancel_all_reconnects(&mut self) {
        self.scheduler.cancel_all();
        if self.state == LinkState::Reconnecting {
            self.target = None;
            self.transition_or_warn(LinkState::Idle);
        }
    }

    fn abandon_reconnect(&mut self) -> Result<()> {
        if self.state == LinkState::Reconnecting {
            if let Some(target) = self.target.take() {
                self.scheduler.reset(&target);
            }
            self.transition(LinkState::Idle)?;
        }
        Ok(())
    }

    async fn establish(&mut self, device_id: &str) -> Result<Vec<ServiceDescriptor>> {
        let mut handle = self
            .seen
            .get(device_id)
            .cloned()
            .unwrap_or_else(|| DeviceHandle::new(device_id));
        handle.state = self.state.clone();
        self.active = Some(handle);
        self.target = Some(device_id.to_string());
        self.transition(LinkState::Connecting)?;

        let limit = self.options.connect_timeout;
        let radio = Arc::clone(&self.radio);
        let token = self.cancel.child_token();
        let attempt = timeout(limit, radio.connect(device_id, self.radio_tx.clone(), token.clone())).await;
        let link = match attempt {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                let reason = DisconnectReason::BleError(e.to_string());
                return Err(self.fail_attempt(device_id, reason, e).await);
            }
            Err(_) => {
                token.cancel();
                let err = Error::ConnectionTimeout {
                    device_id: device_id.to_string(),
                    duration: limit,
                };
                return Err(self.fail_attempt(device_id, DisconnectReason::ConnectTimeout, err).await);
            }
        };
        self.link = Some(link);
        self.transition(LinkState::ServiceDiscovery)?;

        let token = self.cancel.child_token();
        let discovered = match self.link.as_deref() {
            Some(link) => timeout(limit, link.discover(token.clone())).await,
            None => return Err(Error::NotConnected),
        };
        match discovered {
            Ok(Ok(services)) => {
                self.services = services.clone();
                self.transition(LinkState::Connected)?;
                self.scheduler.reset(device_id);
                info!(device_id, services = services.len(), "Connected");
                Ok(services)
            }
            Ok(Err(e)) => {
                let reason = DisconnectReason::BleError(e.to_string());
                Err(self.fail_attempt(device_id, reason, e).await)
            }
            Err(_) => {
                token.cancel();
                let err = Error::DiscoveryTimeout {
                    device_id: device_id.to_string(),
                    duration: limit,
                };
                Err(self.fail_attempt(device_id, DisconnectReason::DiscoveryTimeout, err).await)
            }
        }
    }

    /// Record a failed connect or discovery step and hand the device to the
    /// reconnection policy. Returns the error for the caller.
    async fn fail_attempt(&mut self, device_id: &str, reason: DisconnectReason, err: Error) -> Error {
        let reason = if self.cancel.is_cancelled() {
            DisconnectReason::UserRequested
        } else {
            reason
        };
        warn!(device_id, error = %err, "Connection attempt failed");

        self.release_link().await;
        self.transition_or_warn(LinkState::Disconnected(reason.clone()));
        self.active = None;
        self.services.clear();

        if reason.should_reconnect() {
            self.schedule_reconnect(device_id);
        } else {
            self.target = None;
            self.transition_or_warn(LinkState::Idle);
        }
        err
    }

    fn schedule_reconnect(&mut self, device_id: &str) -> ScheduleOutcome {
        self.target = Some(device_id.to_string());
        self.transition_or_warn(LinkState::Reconnecting);

        let outcome = self.scheduler.schedule(device_id);
        match outcome {
            ScheduleOutcome::Scheduled { attempt, delay } => {
                self.events.send(LinkEvent::ReconnectScheduled {
                    device_id: device_id.to_string(),
                    attempt,
                    delay,
                });
            }
            ScheduleOutcome::GivenUp { attempts } => {
                warn!(device_id, attempts, "Giving up on device until the next scan or connect");
                self.transition_or_warn(LinkState::GivenUp);
                self.events.send(LinkEvent::ReconnectAbandoned {
                    device_id: device_id.to_string(),
                    attempts,
                });
                self.target = None;
            }
        }
        outcome
    }

    async fn drop_link(&mut self, reason: DisconnectReason) {
        if let Some(id) = self.active_id().map(str::to_string) {
            self.scheduler.reset(&id);
        }
        self.release_link().await;
        self.transition_or_warn(LinkState::Disconnected(reason));
        self.active = None;
        self.services.clear();
        self.target = None;
    }

    async fn release_link(&mut self) {
        if let Some(link) = self.link.take() {
            if let Err(e) = link.disconnect().await {
                debug!(device_id = link.device_id(), error = %e, "Error while releasing link");
            }
        }
    }
}
