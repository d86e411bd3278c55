//! Reconnection policy and backoff timers.
//!
//! Attempt `n` (0-indexed) waits `base_delay * (n + 1)`. Once
//! `max_attempts` attempts have been scheduled for a device, the next
//! request gives up, clears that device's counter and schedules nothing.
//!
//! Timers do not call back into the connection manager. When one fires it
//! sends a [`ReconnectDue`] into the channel handed to
//! [`ReconnectScheduler::new`], and the driver decides what to do with it.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Options for automatic reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    /// Delay unit; attempt `n` waits `base_delay * (n + 1)`.
    pub base_delay: Duration,
    /// Number of attempts scheduled before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectOptions {
    /// Create new reconnect options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base delay.
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set maximum number of reconnection attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(Error::invalid_config("base_delay must be > 0"));
        }
        if self.max_attempts == 0 {
            return Err(Error::invalid_config("max_attempts must be > 0"));
        }
        Ok(())
    }
}

/// Result of asking the scheduler for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// A timer is pending for this attempt.
    Scheduled { attempt: u32, delay: Duration },
    /// The attempt cap was reached; the counter has been cleared.
    GivenUp { attempts: u32 },
}

/// Sent by a backoff timer when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectDue {
    pub device_id: String,
    pub attempt: u32,
}

/// Per-device attempt counters and pending backoff timers.
#[derive(Debug)]
pub struct ReconnectScheduler {
    options: ReconnectOptions,
    attempts: HashMap<String, u32>,
    timers: HashMap<String, JoinHandle<()>>,
    due_tx: mpsc::UnboundedSender<ReconnectDue>,
}

impl ReconnectScheduler {
    pub fn new(options: ReconnectOptions, due_tx: mpsc::UnboundedSender<ReconnectDue>) -> Self {
        Self {
            options,
            attempts: HashMap::new(),
            timers: HashMap::new(),
            due_tx,
        }
    }

    pub fn options(&self) -> &ReconnectOptions {
        &self.options
    }

    /// Schedule the next attempt for `device_id`.
    ///
    /// Any timer already pending for the device is cancelled first, so at
    /// most one timer per device exists at a time.
    pub fn schedule(&mut self, device_id: &str) -> ScheduleOutcome {
        self.cancel(device_id);

        let attempt = self.attempts.get(device_id).copied().unwrap_or(0);
        if attempt >= self.options.max_attempts {
            self.attempts.remove(device_id);
            info!(device_id, attempts = attempt, "Reconnection abandoned");
            return ScheduleOutcome::GivenUp { attempts: attempt };
        }

        let delay = self.options.delay_for_attempt(attempt);
        self.attempts.insert(device_id.to_string(), attempt + 1);

        let tx = self.due_tx.clone();
        let due = ReconnectDue {
            device_id: device_id.to_string(),
            attempt,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(due);
        });
        self.timers.insert(device_id.to_string(), handle);

        info!(device_id, attempt, ?delay, "Reconnect scheduled");
        ScheduleOutcome::Scheduled { attempt, delay }
    }

    /// Whether `due` is the most recent timer scheduled for its device.
    ///
    /// Stale messages (from a timer that fired just before being replaced or
    /// cancelled) are rejected. Accepting a message forgets its timer.
    pub fn accept(&mut self, due: &ReconnectDue) -> bool {
        let current = self
            .attempts
            .get(&due.device_id)
            .is_some_and(|next| *next == due.attempt + 1);
        if current && self.timers.remove(&due.device_id).is_some() {
            return true;
        }
        debug!(device_id = %due.device_id, attempt = due.attempt, "Ignoring stale reconnect timer");
        false
    }

    /// Cancel the pending timer for `device_id`, keeping its counter.
    pub fn cancel(&mut self, device_id: &str) {
        if let Some(handle) = self.timers.remove(device_id) {
            handle.abort();
        }
    }

    /// Clear the counter and cancel any timer after a successful connection.
    pub fn reset(&mut self, device_id: &str) {
        self.cancel(device_id);
        self.attempts.remove(device_id);
    }

    /// Cancel every pending timer and forget all counters.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        self.attempts.clear();
    }

    /// Attempts scheduled so far for `device_id`.
    pub fn attempts(&self, device_id: &str) -> u32 {
        self.attempts.get(device_id).copied().unwrap_or(0)
    }

    /// Whether a timer is pending for `device_id`.
    pub fn has_pending(&self, device_id: &str) -> bool {
        self.timers.get(device_id).is_some_and(|h| !h.is_finished())
    }

    /// Number of devices with a pending timer.
    pub fn pending_count(&self) -> usize {
        self.timers.values().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for ReconnectScheduler {
    fn drop(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tokio::time::Instant;

    fn scheduler() -> (ReconnectScheduler, mpsc::UnboundedReceiver<ReconnectDue>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ReconnectScheduler::new(ReconnectOptions::default(), tx), rx)
    }

    #[test]
    fn test_linear_delays() {
        let opts = ReconnectOptions::default();
        assert_eq!(opts.delay_for_attempt(0), Duration::from_secs(5));
        assert_eq!(opts.delay_for_attempt(1), Duration::from_secs(10));
        assert_eq!(opts.delay_for_attempt(4), Duration::from_secs(25));
    }

    #[test]
    fn test_validate() {
        assert!(ReconnectOptions::default().validate().is_ok());
        assert!(ReconnectOptions::new().max_attempts(0).validate().is_err());
        assert!(
            ReconnectOptions::new()
                .base_delay(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let (mut sched, mut rx) = scheduler();
        let start = Instant::now();

        let outcome = sched.schedule("dev");
        assert_eq!(
            outcome,
            ScheduleOutcome::Scheduled {
                attempt: 0,
                delay: Duration::from_secs(5)
            }
        );
        assert!(sched.has_pending("dev"));

        let due = rx.recv().await.unwrap();
        assert_eq!(due.attempt, 0);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
        assert!(sched.accept(&due));
        assert!(!sched.has_pending("dev"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_cancels_prior_timer() {
        let (mut sched, mut rx) = scheduler();

        sched.schedule("dev");
        sched.schedule("dev");
        assert_eq!(sched.pending_count(), 1);

        let due = rx.recv().await.unwrap();
        assert_eq!(due.attempt, 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_cap_and_clears_counter() {
        let (mut sched, _rx) = scheduler();

        for expected in 0..5 {
            match sched.schedule("dev") {
                ScheduleOutcome::Scheduled { attempt, .. } => assert_eq!(attempt, expected),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(sched.schedule("dev"), ScheduleOutcome::GivenUp { attempts: 5 });
        assert_eq!(sched.attempts("dev"), 0);
        assert!(!sched.has_pending("dev"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_timer() {
        let (mut sched, mut rx) = scheduler();
        sched.schedule("dev");
        sched.reset("dev");

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(sched.attempts("dev"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_due_rejected() {
        let (mut sched, _rx) = scheduler();
        sched.schedule("dev");
        sched.schedule("dev");

        let stale = ReconnectDue {
            device_id: "dev".into(),
            attempt: 0,
        };
        assert!(!sched.accept(&stale));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_all() {
        let (mut sched, mut rx) = scheduler();
        sched.schedule("a");
        sched.schedule("b");
        sched.cancel_all();
        assert_eq!(sched.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    proptest! {
        #[test]
        fn delay_is_non_decreasing_and_bounded(base_ms in 1u64..60_000, max in 1u32..20) {
            let opts = ReconnectOptions::new()
                .base_delay(Duration::from_millis(base_ms))
                .max_attempts(max);
            let mut previous = Duration::ZERO;
            for n in 0..max {
                let delay = opts.delay_for_attempt(n);
                prop_assert!(delay >= previous);
                prop_assert_eq!(delay, Duration::from_millis(base_ms) * (n + 1));
                previous = delay;
            }
        }
    }
}
