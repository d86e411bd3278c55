//! Batch buffer.
//!
//! Samples accumulate in an *active* buffer. A flush moves the whole active
//! buffer into the *in-flight* slot before anything is sent, so samples
//! arriving during the send land in a fresh active buffer. When the send
//! completes the in-flight batch is either dropped (delivered, queued
//! durably, rejected) or prepended back onto the active buffer so it goes
//! out again ahead of newer samples.

use std::mem;
use std::time::Duration;

use tracing::{debug, warn};

use caremon_types::MetricSample;

use crate::error::{Error, Result};

/// Options for the batch buffer.
#[derive(Debug, Clone)]
pub struct BufferOptions {
    /// Flush as soon as this many samples are buffered.
    pub max_buffer_size: usize,
    /// Flush whatever is buffered at this interval.
    pub flush_interval: Duration,
    /// Upper bound on retained samples; the oldest are dropped beyond it.
    pub max_pending: usize,
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            max_buffer_size: 10,
            flush_interval: Duration::from_secs(15),
            max_pending: 1000,
        }
    }
}

impl BufferOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    #[must_use]
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    #[must_use]
    pub fn max_pending(mut self, max: usize) -> Self {
        self.max_pending = max;
        self
    }

    /// Validate the options and return an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_size == 0 {
            return Err(Error::invalid_config("max_buffer_size must be > 0"));
        }
        if self.flush_interval.is_zero() {
            return Err(Error::invalid_config("flush_interval must be > 0"));
        }
        if self.max_pending < self.max_buffer_size {
            return Err(Error::invalid_config("max_pending must be >= max_buffer_size"));
        }
        Ok(())
    }
}

/// A batch taken out of the buffer for sending.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch {
    pub device_id: String,
    pub samples: Vec<MetricSample>,
}

/// What became of the in-flight batch.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushSettlement {
    /// Nothing was in flight, or the batch is done with.
    Dropped,
    /// This many samples went back to the front of the active buffer.
    Restored(usize),
    /// The batch must be retried but the buffer now belongs to another
    /// device; the caller sends it under its own identity.
    Orphaned(PendingBatch),
}

/// Two-buffer accumulator for decoded samples.
#[derive(Debug, Default)]
pub struct BatchBuffer {
    options: BufferOptions,
    device_id: Option<String>,
    active: Vec<MetricSample>,
    in_flight: Option<PendingBatch>,
}

impl BatchBuffer {
    pub fn new(options: BufferOptions) -> Self {
        Self {
            options,
            device_id: None,
            active: Vec::new(),
            in_flight: None,
        }
    }

    pub fn options(&self) -> &BufferOptions {
        &self.options
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Samples waiting in the active buffer.
    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Whether the active buffer has reached the flush threshold.
    pub fn is_full(&self) -> bool {
        self.active.len() >= self.options.max_buffer_size
    }

    /// Attribute subsequent samples to `device_id`.
    ///
    /// Samples still buffered for a different device are handed back so the
    /// caller can send them under the identity they were recorded with.
    pub fn bind(&mut self, device_id: &str) -> Option<PendingBatch> {
        if self.device_id.as_deref() == Some(device_id) {
            return None;
        }
        let previous = self.device_id.replace(device_id.to_string());
        match previous {
            Some(previous) if !self.active.is_empty() => Some(PendingBatch {
                device_id: previous,
                samples: mem::take(&mut self.active),
            }),
            _ => None,
        }
    }

    /// Append a sample. Returns `true` when a size-triggered flush is due.
    pub fn push(&mut self, sample: MetricSample) -> bool {
        self.active.push(sample);
        self.enforce_bound();
        self.is_full() && self.in_flight.is_none()
    }

    /// Swap the active buffer out for sending.
    ///
    /// Returns `None` when there is nothing to send, no device is bound, or
    /// a batch is already in flight.
    pub fn begin_flush(&mut self) -> Option<PendingBatch> {
        if self.in_flight.is_some() || self.active.is_empty() {
            return None;
        }
        let device_id = self.device_id.clone()?;
        let batch = PendingBatch {
            device_id,
            samples: mem::take(&mut self.active),
        };
        debug!(device_id = %batch.device_id, samples = batch.samples.len(), "Flushing batch");
        self.in_flight = Some(batch.clone());
        Some(batch)
    }

    /// Finish the in-flight send.
    ///
    /// With `retain` the in-flight samples are prepended to the active
    /// buffer, unless the buffer was rebound to another device meanwhile.
    pub fn complete_flush(&mut self, retain: bool) -> FlushSettlement {
        let Some(batch) = self.in_flight.take() else {
            return FlushSettlement::Dropped;
        };
        if !retain {
            return FlushSettlement::Dropped;
        }
        if self.device_id.as_deref() != Some(batch.device_id.as_str()) {
            return FlushSettlement::Orphaned(batch);
        }

        let mut samples = batch.samples;
        let restored = samples.len();
        samples.append(&mut self.active);
        self.active = samples;
        self.enforce_bound();
        FlushSettlement::Restored(restored)
    }

    /// Remove everything, including any in-flight batch.
    pub fn clear(&mut self) -> usize {
        let dropped = self.active.len() + self.in_flight.as_ref().map_or(0, |b| b.samples.len());
        self.active.clear();
        self.in_flight = None;
        dropped
    }

    fn enforce_bound(&mut self) {
        if self.active.len() > self.options.max_pending {
            let excess = self.active.len() - self.options.max_pending;
            self.active.drain(..excess);
            warn!(dropped = excess, "Buffer over capacity, dropped oldest samples");
        }
    }
}
