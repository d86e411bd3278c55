//! Live batch delivery.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use caremon_core::{BatchSink, DeliveryOutcome};
use caremon_types::{HttpMethod, Location, QueuedRequest, TelemetryBatch};

use crate::error::{DeliveryError, Result};
use crate::queue::OfflineQueue;
use crate::reachability::ReachabilityMonitor;
use crate::transport::Transport;

/// Sends telemetry batches to the ingestion endpoint, falling back to the
/// offline queue when the backend cannot be reached.
///
/// A failed send is also reported to the [`ReachabilityMonitor`], so queued
/// requests are replayed once on reconnection rather than after every batch.
pub struct DeliveryClient {
    transport: Arc<dyn Transport>,
    queue: Arc<OfflineQueue>,
    reachability: Arc<ReachabilityMonitor>,
    location: watch::Receiver<Option<Location>>,
    ingest_url: String,
}

impl std::fmt::Debug for DeliveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryClient")
            .field("ingest_url", &self.ingest_url)
            .field("online", &self.reachability.is_online())
            .finish()
    }
}

impl DeliveryClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        queue: Arc<OfflineQueue>,
        reachability: Arc<ReachabilityMonitor>,
        location: watch::Receiver<Option<Location>>,
        ingest_url: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            queue,
            reachability,
            location,
            ingest_url: ingest_url.into(),
        }
    }

    pub fn ingest_url(&self) -> &str {
        &self.ingest_url
    }

    /// Send one batch.
    ///
    /// Returns [`DeliveryOutcome::Delivered`] on success and
    /// [`DeliveryOutcome::Queued`] when a connectivity failure (or an offline
    /// report) handed the batch to the durable queue. Server verdicts and
    /// queue write failures are returned as errors.
    #[tracing::instrument(level = "debug", skip_all, fields(device_id = %batch.device_id, samples = batch.len()))]
    pub async fn deliver_batch(&self, batch: TelemetryBatch) -> Result<DeliveryOutcome> {
        let location = *self.location.borrow();
        let batch = batch.with_location_if_absent(location);
        let body = serde_json::to_value(&batch)?;

        if !self.reachability.is_online() {
            debug!("Offline, queueing batch");
            return self.queue_batch(body).await;
        }

        match self
            .transport
            .send(HttpMethod::Post, &self.ingest_url, Some(&body))
            .await
        {
            Ok(()) => {
                debug!("Batch delivered");
                Ok(DeliveryOutcome::Delivered)
            }
            Err(e) if e.is_connectivity() => {
                info!(error = %e, "Backend unreachable, queueing batch");
                self.reachability.set_online(false);
                self.queue_batch(body).await
            }
            Err(e) => Err(e),
        }
    }

    async fn queue_batch(&self, body: serde_json::Value) -> Result<DeliveryOutcome> {
        let request = QueuedRequest::new(HttpMethod::Post, self.ingest_url.clone(), Some(body));
        self.queue.enqueue(request).await?;
        Ok(DeliveryOutcome::Queued)
    }
}

#[async_trait]
impl BatchSink for DeliveryClient {
    async fn deliver(&self, batch: TelemetryBatch) -> DeliveryOutcome {
        match self.deliver_batch(batch).await {
            Ok(outcome) => outcome,
            Err(e @ DeliveryError::RejectedByServer { .. }) => {
                warn!(error = %e, "Batch rejected, dropping it");
                DeliveryOutcome::Rejected
            }
            Err(e @ DeliveryError::Serialization(_)) => {
                warn!(error = %e, "Batch cannot be encoded, dropping it");
                DeliveryOutcome::Rejected
            }
            Err(e) => {
                warn!(error = %e, "Batch delivery failed, keeping samples for retry");
                DeliveryOutcome::Failed
            }
        }
    }
}
