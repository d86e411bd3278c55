//! Delivery seam between the pipeline and the network side.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use caremon_types::TelemetryBatch;

/// What happened to a batch handed to a [`BatchSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The backend accepted the batch.
    Delivered,
    /// The batch was persisted to the durable queue for later delivery.
    Queued,
    /// The backend refused the batch; it is dropped.
    Rejected,
    /// Transient failure; the samples should be retried from memory.
    Failed,
}

impl DeliveryOutcome {
    /// Whether the buffer should take the samples back.
    pub fn retain_in_buffer(&self) -> bool {
        matches!(self, DeliveryOutcome::Failed)
    }
}

/// Destination for flushed batches.
///
/// Implementations never return errors: every failure is classified into a
/// [`DeliveryOutcome`] and logged by the sink.
#[async_trait]
pub trait BatchSink: Send + Sync {
    async fn deliver(&self, batch: TelemetryBatch) -> DeliveryOutcome;
}
