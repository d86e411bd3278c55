//! Telemetry pipeline driver.
//!
//! One task owns the [`ConnectionManager`], the [`SubscriptionRegistry`] and
//! the [`BatchBuffer`], and reacts to everything that can change them:
//!
//! - radio events (link up, link lost, notification payloads)
//! - backoff timers firing
//! - the periodic flush timer, which runs only while connected
//! - completion of the batch currently being delivered
//! - commands from [`PipelineHandle`]
//!
//! Each event runs to completion before the next is taken, so component
//! state never changes underneath a handler. Deliveries run on their own
//! tasks and report back through a channel; the driver is never blocked on
//! the network.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use caremon_types::TelemetryBatch;

use crate::buffer::{BatchBuffer, BufferOptions, FlushSettlement, PendingBatch};
use crate::connection::{ConnectionManager, ConnectionOptions};
use crate::decode::{SignalRange, TelemetryDecoder};
use crate::error::{Error, Result};
use crate::events::{
    EventDispatcher, LinkEventReceiver, RadioEvent, RadioEventReceiver, radio_channel,
};
use crate::radio::{Radio, ServiceDescriptor};
use crate::reconnect::ReconnectDue;
use crate::registry::SubscriptionRegistry;
use crate::scan::DiscoveredDevice;
use crate::sink::{BatchSink, DeliveryOutcome};
use crate::state::LinkState;

/// Configuration for the whole pipeline.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub connection: ConnectionOptions,
    pub buffer: BufferOptions,
    pub signal: SignalRange,
    /// Capacity of the command channel.
    pub command_capacity: usize,
    /// Bound on each delivery attempted during shutdown.
    pub shutdown_flush_timeout: Duration,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            connection: ConnectionOptions::default(),
            buffer: BufferOptions::default(),
            signal: SignalRange::default(),
            command_capacity: 32,
            shutdown_flush_timeout: Duration::from_secs(10),
        }
    }
}

impl PipelineOptions {
    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.command_capacity == 0 {
            return Err(Error::invalid_config("command_capacity must be > 0"));
        }
        self.connection.validate()?;
        self.buffer.validate()?;
        self.signal.validate()
    }
}

/// Counters maintained by the driver.
#[derive(Debug, Default)]
pub struct PipelineStats {
    samples_decoded: AtomicU64,
    samples_dropped: AtomicU64,
    batches_flushed: AtomicU64,
    batches_delivered: AtomicU64,
    batches_queued: AtomicU64,
    batches_rejected: AtomicU64,
    batches_retained: AtomicU64,
}

/// Point-in-time copy of [`PipelineStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStatsSnapshot {
    pub samples_decoded: u64,
    pub samples_dropped: u64,
    pub batches_flushed: u64,
    pub batches_delivered: u64,
    pub batches_queued: u64,
    pub batches_rejected: u64,
    /// Batches put back into the buffer after a transient failure.
    pub batches_retained: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            samples_decoded: self.samples_decoded.load(Ordering::Relaxed),
            samples_dropped: self.samples_dropped.load(Ordering::Relaxed),
            batches_flushed: self.batches_flushed.load(Ordering::Relaxed),
            batches_delivered: self.batches_delivered.load(Ordering::Relaxed),
            batches_queued: self.batches_queued.load(Ordering::Relaxed),
            batches_rejected: self.batches_rejected.load(Ordering::Relaxed),
            batches_retained: self.batches_retained.load(Ordering::Relaxed),
        }
    }

    fn record_outcome(&self, outcome: DeliveryOutcome) {
        let counter = match outcome {
            DeliveryOutcome::Delivered => &self.batches_delivered,
            DeliveryOutcome::Queued => &self.batches_queued,
            DeliveryOutcome::Rejected => &self.batches_rejected,
            DeliveryOutcome::Failed => &self.batches_retained,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

enum Command {
    Scan {
        fingerprint: Option<String>,
        reply: oneshot::Sender<Result<Vec<DiscoveredDevice>>>,
    },
    Connect {
        device_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        reply: oneshot::Sender<Result<()>>,
    },
    Flush,
    State {
        reply: oneshot::Sender<LinkState>,
    },
}

/// Handle to a running pipeline.
///
/// Dropping the handle without calling [`shutdown`](Self::shutdown) stops
/// the driver once its command channel closes; `shutdown` additionally
/// waits for the ordered teardown to finish.
pub struct PipelineHandle {
    commands: mpsc::Sender<Command>,
    events: EventDispatcher,
    stats: Arc<PipelineStats>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PipelineHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)
    }

    /// Scan for wearables, optionally filtered by fingerprint.
    pub async fn scan(&self, fingerprint: Option<&str>) -> Result<Vec<DiscoveredDevice>> {
        let fingerprint = fingerprint.map(str::to_string);
        self.request(|reply| Command::Scan { fingerprint, reply }).await?
    }

    /// Connect to a device and start streaming from it.
    pub async fn connect(&self, device_id: &str) -> Result<()> {
        let device_id = device_id.to_string();
        self.request(|reply| Command::Connect { device_id, reply }).await?
    }

    /// Flush, unsubscribe and disconnect the active device.
    pub async fn disconnect(&self) -> Result<()> {
        self.request(|reply| Command::Disconnect { reply }).await?
    }

    /// Ask for an immediate flush.
    pub async fn flush(&self) -> Result<()> {
        self.commands.send(Command::Flush).await.map_err(|_| Error::Cancelled)
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> Result<LinkState> {
        self.request(|reply| Command::State { reply }).await
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> LinkEventReceiver {
        self.events.subscribe()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop the driver and wait for teardown: flush, stop the flush timer,
    /// cancel reconnects, unsubscribe, disconnect.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Pipeline task ended abnormally");
        }
    }
}

/// Entry point for starting the pipeline.
pub struct TelemetryPipeline;

impl TelemetryPipeline {
    /// Spawn the driver on the current runtime.
    pub fn spawn(radio: Arc<dyn Radio>, sink: Arc<dyn BatchSink>, options: PipelineOptions) -> Result<PipelineHandle> {
        options.validate()?;

        let cancel = CancellationToken::new();
        let (radio_tx, radio_rx) = radio_channel();
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(options.command_capacity);
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();

        let manager = ConnectionManager::new(radio, options.connection, radio_tx, due_tx, cancel.clone());
        let events = manager.events().clone();
        let stats = Arc::new(PipelineStats::default());

        let driver = Driver {
            registry: SubscriptionRegistry::new().with_events(events.clone()),
            manager,
            decoder: TelemetryDecoder::new(options.signal),
            buffer: BatchBuffer::new(options.buffer),
            sink,
            stats: Arc::clone(&stats),
            radio_rx,
            due_rx,
            commands: command_rx,
            flush_tx,
            flush_rx,
            flush_timer: None,
            cancel: cancel.clone(),
            shutdown_flush_timeout: options.shutdown_flush_timeout,
        };
        let task = tokio::spawn(driver.run());

        Ok(PipelineHandle {
            commands: command_tx,
            events,
            stats,
            cancel,
            task,
        })
    }
}

struct Driver {
    manager: ConnectionManager,
    registry: SubscriptionRegistry,
    decoder: TelemetryDecoder,
    buffer: BatchBuffer,
    sink: Arc<dyn BatchSink>,
    stats: Arc<PipelineStats>,
    radio_rx: RadioEventReceiver,
    due_rx: mpsc::UnboundedReceiver<ReconnectDue>,
    commands: mpsc::Receiver<Command>,
    flush_tx: mpsc::UnboundedSender<DeliveryOutcome>,
    flush_rx: mpsc::UnboundedReceiver<DeliveryOutcome>,
    flush_timer: Option<Interval>,
    cancel: CancellationToken,
    shutdown_flush_timeout: Duration,
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        info!("Telemetry pipeline started");
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                Some(outcome) = self.flush_rx.recv() => self.on_flush_complete(outcome),
                Some(event) = self.radio_rx.recv() => self.on_radio_event(event).await,
                Some(due) = self.due_rx.recv() => self.on_reconnect_due(due).await,
                _ = next_tick(&mut self.flush_timer) => self.on_flush_tick().await,
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
            }
        }
        self.cleanup().await;
        info!("Telemetry pipeline stopped");
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Scan { fingerprint, reply } => {
                let result = self.manager.scan(fingerprint.as_deref()).await;
                if let Err(e) = &result {
                    warn!(error = %e, "Scan failed");
                }
                let _ = reply.send(result);
            }
            Command::Connect { device_id, reply } => {
                let result = match self.manager.connect(&device_id).await {
                    Ok(services) => {
                        self.on_connected(services).await;
                        Ok(())
                    }
                    Err(e) => {
                        warn!(device_id = %device_id, error = %e, "Connect failed");
                        self.release_stale_link();
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            Command::Disconnect { reply } => {
                self.start_flush();
                self.flush_timer = None;
                if let Some(link) = self.manager.link() {
                    self.registry.unsubscribe_all(link).await;
                }
                let _ = reply.send(self.manager.disconnect().await);
            }
            Command::Flush => self.start_flush(),
            Command::State { reply } => {
                let _ = reply.send(self.manager.state().clone());
            }
        }
    }

    /// After a failed connect, drop state that belonged to a link the
    /// manager no longer holds.
    fn release_stale_link(&mut self) {
        if self.manager.link().is_some() {
            return;
        }
        self.flush_timer = None;
        if let Some(previous) = self.registry.device_id().map(str::to_string) {
            self.start_flush();
            self.registry.invalidate(&previous);
        }
    }

    async fn on_connected(&mut self, services: Vec<ServiceDescriptor>) {
        let Some(device_id) = self.manager.active_id().map(str::to_string) else {
            return;
        };

        if let Some(leftover) = self.buffer.bind(&device_id) {
            self.deliver_detached(leftover);
        }
        if let Some(link) = self.manager.link() {
            self.registry.subscribe_all(link, &services).await;
        }
        self.manager.refresh_rssi().await;

        let period = self.buffer.options().flush_interval;
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.flush_timer = Some(interval);
    }

    async fn on_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::Connected { device_id } => {
                debug!(device_id = %device_id, "Radio reports link up");
            }
            RadioEvent::Disconnected { device_id, reason } => {
                if self.manager.active_id() != Some(device_id.as_str()) {
                    debug!(device_id = %device_id, "Disconnect for inactive device");
                    return;
                }
                self.start_flush();
                self.flush_timer = None;
                self.registry.invalidate(&device_id);
                self.manager.handle_disconnect(&device_id, reason).await;
            }
            RadioEvent::CharacteristicUpdate {
                device_id,
                channel,
                payload,
            } => {
                let Some(spec) = self.registry.lookup(&device_id, channel).map(|s| s.spec) else {
                    trace!(device_id = %device_id, %channel, "No subscription for payload, dropping");
                    self.stats.samples_dropped.fetch_add(1, Ordering::Relaxed);
                    return;
                };
                let rssi = self.manager.active_device().and_then(|d| d.rssi);
                match self.decoder.decode(&payload, &spec, rssi, OffsetDateTime::now_utc()) {
                    Some(sample) => {
                        self.stats.samples_decoded.fetch_add(1, Ordering::Relaxed);
                        if self.buffer.push(sample) {
                            self.start_flush();
                        }
                    }
                    None => {
                        self.stats.samples_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    async fn on_reconnect_due(&mut self, due: ReconnectDue) {
        match self.manager.on_reconnect_due(due).await {
            Ok(Some(services)) => self.on_connected(services).await,
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Reconnect attempt failed"),
        }
    }

    async fn on_flush_tick(&mut self) {
        self.manager.refresh_rssi().await;
        self.start_flush();
    }

    /// Swap the buffer out and deliver it on a separate task.
    fn start_flush(&mut self) {
        let Some(pending) = self.buffer.begin_flush() else {
            return;
        };
        self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);

        let sink = Arc::clone(&self.sink);
        let done = self.flush_tx.clone();
        let batch = TelemetryBatch::from_samples(pending.device_id, &pending.samples);
        tokio::spawn(async move {
            let outcome = sink.deliver(batch).await;
            let _ = done.send(outcome);
        });
    }

    fn settle_flush(&mut self, outcome: DeliveryOutcome) {
        self.stats.record_outcome(outcome);
        match self.buffer.complete_flush(outcome.retain_in_buffer()) {
            FlushSettlement::Dropped => {}
            FlushSettlement::Restored(restored) => {
                warn!(restored, "Batch delivery failed, samples kept for the next flush");
            }
            FlushSettlement::Orphaned(batch) => self.deliver_detached(batch),
        }
    }

    fn on_flush_complete(&mut self, outcome: DeliveryOutcome) {
        self.settle_flush(outcome);
        // A failed batch waits for the timer rather than retrying at once.
        if !outcome.retain_in_buffer() && self.buffer.is_full() {
            self.start_flush();
        }
    }

    /// Deliver samples that belong to a previous device without occupying
    /// the in-flight slot. One attempt only.
    fn deliver_detached(&self, pending: PendingBatch) {
        info!(
            device_id = %pending.device_id,
            samples = pending.samples.len(),
            "Delivering samples left from previous device"
        );
        let sink = Arc::clone(&self.sink);
        let stats = Arc::clone(&self.stats);
        let batch = TelemetryBatch::from_samples(pending.device_id, &pending.samples);
        tokio::spawn(async move {
            let outcome = sink.deliver(batch).await;
            stats.record_outcome(outcome);
            if outcome.retain_in_buffer() {
                warn!("Samples from previous device could not be delivered");
            }
        });
    }

    /// Deliver whatever is still buffered before teardown.
    async fn final_flush(&mut self) {
        let limit = self.shutdown_flush_timeout;

        if self.buffer.in_flight() {
            match timeout(limit, self.flush_rx.recv()).await {
                Ok(Some(outcome)) => self.settle_flush(outcome),
                _ => warn!("In-flight batch did not complete before shutdown"),
            }
        }

        let Some(pending) = self.buffer.begin_flush() else {
            return;
        };
        self.stats.batches_flushed.fetch_add(1, Ordering::Relaxed);
        let samples = pending.samples.len();
        let batch = TelemetryBatch::from_samples(pending.device_id, &pending.samples);
        match timeout(limit, self.sink.deliver(batch)).await {
            Ok(outcome) => {
                self.stats.record_outcome(outcome);
                if outcome.retain_in_buffer() {
                    warn!(samples, "Final flush failed, samples lost");
                }
            }
            Err(_) => warn!(samples, "Final flush timed out, samples lost"),
        }
        self.buffer.complete_flush(false);
    }

    async fn cleanup(&mut self) {
        info!("Tearing down telemetry pipeline");
        self.final_flush().await;
        self.flush_timer = None;
        self.manager.cancel_all_reconnects();
        if let Some(link) = self.manager.link() {
            self.registry.unsubscribe_all(link).await;
        }
        if let Err(e) = self.manager.disconnect().await {
            warn!(error = %e, "Disconnect during teardown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevice, MockRadio, MockSink};
    use caremon_types::uuids::{HEALTH_HEART_RATE, HEALTH_TEMPERATURE};

    struct Harness {
        radio: MockRadio,
        handle: PipelineHandle,
        batches: mpsc::UnboundedReceiver<(TelemetryBatch, DeliveryOutcome)>,
    }

    async fn connected(sink: MockSink, batches: mpsc::UnboundedReceiver<(TelemetryBatch, DeliveryOutcome)>) -> Harness {
        let radio = MockRadio::builder()
            .device("dev-1", MockDevice::health_wearable())
            .build();
        let handle = TelemetryPipeline::spawn(
            Arc::new(radio.clone()),
            Arc::new(sink),
            PipelineOptions::default(),
        )
        .unwrap();
        handle.connect("dev-1").await.unwrap();
        Harness {
            radio,
            handle,
            batches,
        }
    }

    fn values(batch: &TelemetryBatch) -> Vec<f64> {
        batch.metrics.iter().map(|m| m.value).collect()
    }

    /// Let the driver drain everything queued so far.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_threshold_then_timer() {
        let (sink, rx) = MockSink::new();
        let mut h = connected(sink, rx).await;

        for i in 0..12 {
            assert!(h.radio.notify("dev-1", HEALTH_HEART_RATE, format!("{}", 60 + i)));
        }

        let (first, _) = h.batches.recv().await.unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first.device_id, "dev-1");
        assert_eq!(h.handle.stats().batches_flushed, 1);

        let start = Instant::now();
        let (second, _) = h.batches.recv().await.unwrap();
        assert_eq!(values(&second), vec![70.0, 71.0]);
        assert!(start.elapsed() <= Duration::from_secs(15));

        let stats = h.handle.stats();
        assert_eq!(stats.samples_decoded, 12);
        assert_eq!(stats.batches_delivered, 2);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_timer_flush_sends_nothing() {
        let (sink, rx) = MockSink::new();
        let mut h = connected(sink, rx).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.batches.try_recv().is_err());
        assert_eq!(h.handle.stats().batches_flushed, 0);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_goes_out_first_next_time() {
        let (sink, rx) = MockSink::new();
        let sink = sink.with_outcomes([DeliveryOutcome::Failed]);
        let mut h = connected(sink, rx).await;

        for i in 0..10 {
            h.radio.notify("dev-1", HEALTH_HEART_RATE, format!("{}", i));
        }
        let (failed, outcome) = h.batches.recv().await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Failed);
        settle().await;

        h.radio.notify("dev-1", HEALTH_HEART_RATE, "10");
        let (retry, outcome) = h.batches.recv().await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);

        let mut expected = values(&failed);
        expected.push(10.0);
        assert_eq!(values(&retry), expected);
        assert_eq!(h.handle.stats().batches_retained, 1);
        h.handle.shutdown().await;
    }

    fn two_wearables(second: MockDevice) -> MockRadio {
        MockRadio::builder()
            .device("dev-1", MockDevice::health_wearable())
            .device("dev-2", second)
            .build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_keeps_its_device_after_switch() {
        let (sink, mut batches) = MockSink::new();
        let sink = sink
            .with_latency(Duration::from_secs(1))
            .with_outcomes([DeliveryOutcome::Failed]);
        let radio = two_wearables(MockDevice::health_wearable());
        let handle =
            TelemetryPipeline::spawn(Arc::new(radio.clone()), Arc::new(sink), PipelineOptions::default()).unwrap();
        handle.connect("dev-1").await.unwrap();

        for i in 0..10 {
            radio.notify("dev-1", HEALTH_HEART_RATE, format!("{}", i));
        }
        settle().await;
        handle.connect("dev-2").await.unwrap();

        let (failed, outcome) = batches.recv().await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Failed);
        assert_eq!(failed.device_id, "dev-1");

        let (resent, outcome) = batches.recv().await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered);
        assert_eq!(resent.device_id, "dev-1");
        assert_eq!(values(&resent), values(&failed));

        radio.notify("dev-2", HEALTH_HEART_RATE, "100");
        settle().await;
        handle.flush().await.unwrap();
        let (next, _) = batches.recv().await.unwrap();
        assert_eq!(next.device_id, "dev-2");
        assert_eq!(values(&next), vec![100.0]);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_replacement_releases_previous_device() {
        let (sink, mut batches) = MockSink::new();
        let radio = two_wearables(MockDevice::health_wearable().fail_connect());
        let handle =
            TelemetryPipeline::spawn(Arc::new(radio.clone()), Arc::new(sink), PipelineOptions::default()).unwrap();
        handle.connect("dev-1").await.unwrap();

        radio.notify("dev-1", HEALTH_HEART_RATE, "72");
        radio.notify("dev-1", HEALTH_HEART_RATE, "73");
        settle().await;

        let start = Instant::now();
        assert!(handle.connect("dev-2").await.is_err());

        // Buffered samples go out with their device instead of waiting for
        // a flush timer that belongs to a closed link.
        let (batch, _) = batches.recv().await.unwrap();
        assert_eq!(batch.device_id, "dev-1");
        assert_eq!(values(&batch), vec![72.0, 73.0]);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(radio.active_subscriptions("dev-1").is_empty());

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(batches.try_recv().is_err());
        assert_eq!(handle.stats().batches_flushed, 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_undecodable_payload_is_dropped() {
        let (sink, rx) = MockSink::new();
        let h = connected(sink, rx).await;

        h.radio.notify("dev-1", HEALTH_TEMPERATURE, "garbage");
        h.radio.notify("dev-1", HEALTH_TEMPERATURE, "36.5");
        settle().await;

        let stats = h.handle.stats();
        assert_eq!(stats.samples_dropped, 1);
        assert_eq!(stats.samples_decoded, 1);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_flushes_and_reconnects() {
        let (sink, rx) = MockSink::new();
        let mut h = connected(sink, rx).await;

        for i in 0..3 {
            h.radio.notify("dev-1", HEALTH_HEART_RATE, format!("{}", i));
        }
        settle().await;
        h.radio.drop_link("dev-1");

        let (final_batch, _) = h.batches.recv().await.unwrap();
        assert_eq!(final_batch.len(), 3);
        settle().await;
        assert_eq!(h.handle.state().await.unwrap(), LinkState::Reconnecting);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.handle.state().await.unwrap(), LinkState::Connected);
        assert_eq!(h.radio.connect_count("dev-1"), 2);
        assert_eq!(h.radio.active_subscriptions("dev-1").len(), 6);
        h.handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_then_tears_down() {
        let (sink, rx) = MockSink::new();
        let mut h = connected(sink, rx).await;

        h.radio.notify("dev-1", HEALTH_HEART_RATE, "72");
        h.radio.notify("dev-1", HEALTH_HEART_RATE, "73");
        settle().await;

        let radio = h.radio.clone();
        h.handle.shutdown().await;

        let (batch, _) = h.batches.recv().await.unwrap();
        assert_eq!(values(&batch), vec![72.0, 73.0]);
        assert!(radio.active_subscriptions("dev-1").is_empty());
        assert_eq!(radio.disconnect_count("dev-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_disconnect() {
        let (sink, rx) = MockSink::new();
        let h = connected(sink, rx).await;

        h.handle.disconnect().await.unwrap();
        assert_eq!(h.handle.state().await.unwrap(), LinkState::Idle);
        assert!(h.radio.active_subscriptions("dev-1").is_empty());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(h.radio.connect_count("dev-1"), 1);
        h.handle.shutdown().await;
    }
}
