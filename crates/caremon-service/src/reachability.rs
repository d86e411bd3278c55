//! Online/offline tracking and the drain trigger.
//!
//! The monitor holds the current reachability as a `watch` value. Anything
//! that learns about connectivity (the periodic [`HttpProbe`], or an OS
//! hook) calls [`ReachabilityMonitor::set_online`]; observers call
//! [`ReachabilityMonitor::subscribe`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::queue::OfflineQueue;

/// Something that can tell whether the backend is reachable right now.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Probes a backend URL; any HTTP response counts as reachable.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                debug!(url = %self.url, status = response.status().as_u16(), "Probe answered");
                true
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "Probe failed");
                false
            }
        }
    }
}

/// Current reachability plus change notification.
#[derive(Debug)]
pub struct ReachabilityMonitor {
    tx: watch::Sender<bool>,
}

impl ReachabilityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self { tx }
    }

    pub fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    /// Record the latest reachability. Returns whether it changed.
    pub fn set_online(&self, online: bool) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(online, "Reachability changed");
        }
        changed
    }

    /// Receiver that is notified on every change.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Run one `drain()` on every offline to online transition until
    /// `cancel` fires.
    pub fn spawn_drain_trigger(&self, queue: Arc<OfflineQueue>, cancel: CancellationToken) -> JoinHandle<()> {
        let mut rx = self.subscribe();
        tokio::spawn(async move {
            let mut was_online = *rx.borrow_and_update();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let online = *rx.borrow_and_update();
                if online && !was_online {
                    info!("Back online, draining offline queue");
                    if let Err(e) = queue.drain().await {
                        warn!(error = %e, "Drain after reconnect failed");
                    }
                }
                was_online = online;
            }
        })
    }

    /// Poll `probe` every `interval` and feed the result into the monitor.
    pub fn spawn_probe<P>(self: &Arc<Self>, probe: P, interval: Duration, cancel: CancellationToken) -> JoinHandle<()>
    where
        P: Probe + 'static,
    {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let online = probe.check().await;
                        monitor.set_online(online);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Reply, ScriptedTransport};
    use caremon_store::Store;
    use caremon_types::{HttpMethod, QueuedRequest};
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex;

    fn queue_with(transport: Arc<ScriptedTransport>, monitor: &Arc<ReachabilityMonitor>) -> Arc<OfflineQueue> {
        let store = Store::open_in_memory().unwrap();
        Arc::new(OfflineQueue::new(
            Arc::new(Mutex::new(store)),
            transport,
            Arc::clone(monitor),
            3,
        ))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_set_online_reports_changes_only() {
        let monitor = ReachabilityMonitor::new(false);
        assert!(!monitor.set_online(false));
        assert!(monitor.set_online(true));
        assert!(!monitor.set_online(true));
        assert!(monitor.is_online());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let monitor = ReachabilityMonitor::new(true);
        let mut rx = monitor.subscribe();
        monitor.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_drain_per_offline_to_online_transition() {
        let monitor = Arc::new(ReachabilityMonitor::new(false));
        // The first pass finds the backend still unreachable; later sends succeed.
        let transport = Arc::new(ScriptedTransport::new([Reply::Offline, Reply::Offline, Reply::Offline]));
        let queue = queue_with(transport.clone(), &monitor);
        for n in 0..3 {
            queue
                .enqueue(QueuedRequest::new(
                    HttpMethod::Post,
                    "http://backend/ingest",
                    Some(serde_json::json!({ "n": n })),
                ))
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        let trigger = monitor.spawn_drain_trigger(Arc::clone(&queue), cancel.clone());

        // One pass covers every queued item: each was tried exactly once.
        monitor.set_online(true);
        settle().await;
        assert_eq!(transport.call_count(), 3);
        let retries: Vec<u32> = queue
            .snapshot()
            .await
            .unwrap()
            .iter()
            .map(QueuedRequest::retry_count)
            .collect();
        assert_eq!(retries, vec![1, 1, 1]);
        // The failed pass put the monitor back offline.
        assert!(!monitor.is_online());

        monitor.set_online(true);
        settle().await;
        assert_eq!(transport.call_count(), 6);
        assert!(queue.is_empty().await.unwrap());

        // Staying online does not drain again.
        assert!(!monitor.set_online(true));
        settle().await;
        assert_eq!(transport.call_count(), 6);

        cancel.cancel();
        trigger.await.unwrap();
    }

    struct ScriptedProbe(StdMutex<VecDeque<bool>>);

    #[async_trait]
    impl Probe for ScriptedProbe {
        async fn check(&self) -> bool {
            self.0.lock().unwrap().pop_front().unwrap_or(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_feeds_monitor() {
        let monitor = Arc::new(ReachabilityMonitor::new(true));
        let mut rx = monitor.subscribe();
        let probe = ScriptedProbe(StdMutex::new(VecDeque::from([false, true])));
        let cancel = CancellationToken::new();
        let task = monitor.spawn_probe(probe, Duration::from_secs(30), cancel.clone());

        rx.changed().await.unwrap();
        assert!(!*rx.borrow_and_update());
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        cancel.cancel();
        task.await.unwrap();
    }
}
