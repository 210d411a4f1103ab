//! Host side of the monotonic counters used to track queue progress.

use std::{cmp::Ordering, fmt, time::Duration};

use crate::{
    backend::{Device, Queue, Timeline},
    generic::{DeviceError, QueueKind},
};

/// Point on a queue's fence timeline.
///
/// Values are comparable only when they belong to the same queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FenceValue {
    queue: QueueKind,
    value: u64,
}

impl FenceValue {
    pub const fn new(queue: QueueKind, value: u64) -> Self {
        FenceValue { queue, value }
    }

    pub const fn queue(&self) -> QueueKind {
        self.queue
    }

    pub const fn value(&self) -> u64 {
        self.value
    }
}

impl PartialOrd for FenceValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.queue != other.queue {
            return None;
        }
        Some(self.value.cmp(&other.value))
    }
}

impl fmt::Display for FenceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.queue, self.value)
    }
}

/// Monotonic counter shared between host and one queue.
///
/// Timeline object is created on first use.
/// If it can't be created the fence fails open:
/// every value is reported as complete.
pub struct Fence {
    device: Device,
    queue: QueueKind,
    timeline: Option<Timeline>,
    failed: bool,

    /// Highest value reserved by `increment`.
    pending: u64,

    /// Highest value queue was asked to signal.
    last_signaled: u64,

    timeout: Duration,
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("queue", &self.queue)
            .field("pending", &self.pending)
            .field("last_signaled", &self.last_signaled)
            .field("completed", &self.completed())
            .finish()
    }
}

impl Fence {
    pub fn new(device: Device, queue: QueueKind, timeout: Duration) -> Self {
        Fence {
            device,
            queue,
            timeline: None,
            failed: false,
            pending: 0,
            last_signaled: 0,
            timeout,
        }
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    /// Returns `true` if timeline object could not be created
    /// and the fence treats everything as complete.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Returns timeline, creating it if necessary.
    fn timeline(&mut self) -> Option<&Timeline> {
        if self.timeline.is_none() && !self.failed {
            match self.device.new_timeline() {
                Ok(timeline) => self.timeline = Some(timeline),
                Err(err) => {
                    tracing::warn!(
                        "Failed to create fence for {} queue: {err}. Synchronization is disabled",
                        self.queue
                    );
                    self.failed = true;
                }
            }
        }
        self.timeline.as_ref()
    }

    /// Returns shared handle to the timeline if it exists.
    /// Used to make other queues wait on this fence.
    pub fn shared(&self) -> Option<&Timeline> {
        self.timeline.as_ref()
    }

    /// Reserves next value without touching the queue.
    pub fn increment(&mut self) -> FenceValue {
        // Make sure timeline exists before any value is handed out.
        self.timeline();
        self.pending += 1;
        FenceValue::new(self.queue, self.pending)
    }

    /// Highest reserved value.
    pub fn pending(&self) -> FenceValue {
        FenceValue::new(self.queue, self.pending)
    }

    /// Highest value the queue was asked to signal.
    pub fn last_signaled(&self) -> FenceValue {
        FenceValue::new(self.queue, self.last_signaled)
    }

    /// Asks `queue` to signal the highest reserved value
    /// after all previously submitted work completes.
    ///
    /// Does nothing if that value was already signaled.
    pub fn signal(&mut self, queue: &mut Queue) -> Result<FenceValue, DeviceError> {
        debug_assert_eq!(queue.kind(), self.queue, "fence signaled on foreign queue");

        if self.last_signaled >= self.pending {
            return Ok(self.last_signaled());
        }

        let pending = self.pending;
        if let Some(timeline) = self.timeline() {
            queue.signal(timeline, pending)?;
        }
        self.last_signaled = pending;
        Ok(self.last_signaled())
    }

    /// Records that queue was asked to signal `value` as part of a submission.
    pub(crate) fn mark_signaled(&mut self, value: FenceValue) {
        debug_assert_eq!(value.queue, self.queue);
        debug_assert!(value.value <= self.pending, "signaled value was never reserved");
        self.last_signaled = self.last_signaled.max(value.value);
    }

    /// Last value reached by the queue.
    pub fn completed(&self) -> u64 {
        match &self.timeline {
            Some(timeline) => timeline.value(),
            None => self.pending,
        }
    }

    /// Non-blocking check.
    pub fn is_complete(&self, value: FenceValue) -> bool {
        debug_assert_eq!(value.queue, self.queue, "fence value of foreign queue");

        match &self.timeline {
            Some(timeline) => timeline.value() >= value.value,
            None => true,
        }
    }

    /// Blocks until `value` is reached.
    ///
    /// Waits at most `timeout`, or the configured maximum if `None`.
    /// Returns `false` if wait timed out.
    pub fn wait(&self, value: FenceValue, timeout: Option<Duration>) -> bool {
        debug_assert_eq!(value.queue, self.queue, "fence value of foreign queue");

        let Some(timeline) = &self.timeline else {
            return true;
        };

        if value.value > self.last_signaled {
            tracing::warn!(
                "Waiting for {value} that was never signaled on {} queue",
                self.queue
            );
        }

        let timeout = timeout.unwrap_or(self.timeout).min(self.timeout);
        if timeline.wait(value.value, timeout) {
            return true;
        }

        tracing::warn!("Wait for {value} timed out after {timeout:?}");
        false
    }
}
