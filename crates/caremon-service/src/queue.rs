//! Durable offline queue.
//!
//! Requests that could not reach the backend are persisted through
//! [`caremon_store::Store`] and replayed in FIFO order by [`OfflineQueue::drain`].
//! A connectivity failure while draining marks the [`ReachabilityMonitor`]
//! offline, so the next replay waits for the network to come back.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use caremon_store::Store;
use caremon_types::QueuedRequest;

use crate::error::{DeliveryError, Result};
use crate::reachability::ReachabilityMonitor;
use crate::transport::Transport;

/// Default retry cap for queued requests.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Summary of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub delivered: usize,
    /// Kept after a connectivity failure, with `retryCount` incremented.
    pub retried: usize,
    /// Dropped without sending because the retry cap was reached.
    pub abandoned: usize,
    /// Dropped because the server refused them.
    pub discarded: usize,
    /// Queue length after the pass.
    pub remaining: usize,
    /// Another drain was already running; nothing was done.
    pub coalesced: bool,
}

/// Resets the draining flag however the pass ends.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Persisted queue of requests awaiting delivery.
pub struct OfflineQueue {
    store: Arc<Mutex<Store>>,
    transport: Arc<dyn Transport>,
    reachability: Arc<ReachabilityMonitor>,
    max_retries: u32,
    draining: AtomicBool,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("max_retries", &self.max_retries)
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish()
    }
}

impl OfflineQueue {
    pub fn new(
        store: Arc<Mutex<Store>>,
        transport: Arc<dyn Transport>,
        reachability: Arc<ReachabilityMonitor>,
        max_retries: u32,
    ) -> Self {
        Self {
            store,
            transport,
            reachability,
            max_retries,
            draining: AtomicBool::new(false),
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Persist `request` at the tail of the queue.
    ///
    /// When the network is reported online a drain starts on its own task;
    /// the caller does not wait for it. Returns the queue length after the
    /// append.
    #[tracing::instrument(level = "debug", skip_all, fields(request_id = %request.id()))]
    pub async fn enqueue(self: &Arc<Self>, request: QueuedRequest) -> Result<usize> {
        let len = self.store.lock().await.append_request(&request)?;
        info!(request_id = %request.id(), len, "Request queued for later delivery");

        if self.reachability.is_online() {
            let queue = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = queue.drain().await {
                    warn!(error = %e, "Drain after enqueue failed");
                }
            });
        }
        Ok(len)
    }

    /// Replay the queue once, front to back.
    ///
    /// Per request: at the retry cap it is dropped unsent; a success removes
    /// it; a connectivity failure keeps it with one more retry recorded; any
    /// other failure drops it. The queue is written back once at the end.
    /// A call made while a drain is running returns immediately with
    /// [`DrainReport::coalesced`] set.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn drain(&self) -> Result<DrainReport> {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("Drain already in progress");
            return Ok(DrainReport {
                coalesced: true,
                ..DrainReport::default()
            });
        }
        let _guard = DrainGuard(&self.draining);

        let snapshot = self.store.lock().await.load_queue()?;
        if snapshot.is_empty() {
            return Ok(DrainReport::default());
        }
        info!("Draining {} queued request(s)", snapshot.len());

        let seen: HashSet<String> = snapshot.iter().map(|r| r.id().to_string()).collect();
        let mut report = DrainReport::default();
        let mut kept = Vec::new();

        for mut request in snapshot {
            if request.retry_count() >= self.max_retries {
                let abandoned = DeliveryError::RetryBudgetExhausted {
                    id: request.id().to_string(),
                    attempts: request.retry_count(),
                };
                warn!(request_id = %request.id(), "{}", abandoned);
                report.abandoned += 1;
                continue;
            }

            match self
                .transport
                .send(request.method(), request.url(), request.payload())
                .await
            {
                Ok(()) => {
                    debug!(request_id = %request.id(), "Queued request delivered");
                    report.delivered += 1;
                }
                Err(e) if e.is_connectivity() => {
                    self.reachability.set_online(false);
                    request.record_retry();
                    debug!(
                        request_id = %request.id(),
                        retry_count = request.retry_count(),
                        "Queued request still unreachable"
                    );
                    report.retried += 1;
                    kept.push(request);
                }
                Err(e) => {
                    warn!(request_id = %request.id(), error = %e, "Queued request discarded");
                    report.discarded += 1;
                }
            }
        }

        // The store may have changed while this pass was sending: requests
        // enqueued meanwhile are kept, removed or cleared ones stay gone.
        let store = self.store.lock().await;
        let current = store.load_queue()?;
        let present: HashSet<&str> = current.iter().map(QueuedRequest::id).collect();
        kept.retain(|r| present.contains(r.id()));
        kept.extend(current.iter().filter(|r| !seen.contains(r.id())).cloned());
        store.save_queue(&kept)?;
        report.remaining = kept.len();

        info!(
            delivered = report.delivered,
            retried = report.retried,
            abandoned = report.abandoned,
            discarded = report.discarded,
            remaining = report.remaining,
            "Drain complete"
        );
        Ok(report)
    }

    /// Current queue contents in FIFO order.
    pub async fn snapshot(&self) -> Result<Vec<QueuedRequest>> {
        Ok(self.store.lock().await.load_queue()?)
    }

    pub async fn len(&self) -> Result<usize> {
        Ok(self.snapshot().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove one request by id. Returns whether it was queued.
    pub async fn remove(&self, id: &str) -> Result<bool> {
        Ok(self.store.lock().await.remove_request(id)?)
    }

    /// Drop every queued request. Returns how many there were.
    pub async fn clear(&self) -> Result<usize> {
        let removed = self.store.lock().await.clear_queue()?;
        if removed > 0 {
            info!(removed, "Request queue cleared");
        }
        Ok(removed)
    }
}
