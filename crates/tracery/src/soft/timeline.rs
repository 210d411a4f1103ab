use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use super::device::WeakDevice;

struct Inner {
    owner: WeakDevice,
    id: u64,
    value: Mutex<u64>,
    cond: Condvar,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(device) = self.owner.upgrade() {
            device.release_timeline();
        }
    }
}

/// Monotonic counter shared between host and queues.
#[derive(Clone)]
pub struct Timeline {
    inner: Arc<Inner>,
}

impl fmt::Debug for Timeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timeline({} @ {})", self.inner.id, *self.inner.value.lock())
    }
}

impl PartialEq for Timeline {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Timeline {}

impl Timeline {
    pub(super) fn new(owner: WeakDevice, id: u64) -> Self {
        Timeline {
            inner: Arc::new(Inner {
                owner,
                id,
                value: Mutex::new(0),
                cond: Condvar::new(),
            }),
        }
    }

    /// Advances timeline to `value` and wakes up waiters.
    /// Values lower than current are ignored.
    pub fn signal(&self, value: u64) {
        let mut current = self.inner.value.lock();
        if *current < value {
            *current = value;
            self.inner.cond.notify_all();
        }
    }
}

#[hidden_trait::expose]
impl crate::traits::Timeline for Timeline {
    fn value(&self) -> u64 {
        *self.inner.value.lock()
    }

    fn wait(&self, value: u64, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut current = self.inner.value.lock();

        while *current < value {
            match deadline {
                Some(deadline) => {
                    if self
                        .inner
                        .cond
                        .wait_until(&mut current, deadline)
                        .timed_out()
                    {
                        return *current >= value;
                    }
                }
                None => self.inner.cond.wait(&mut current),
            }
        }
        true
    }
}
