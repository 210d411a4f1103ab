use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex};

use crate::generic::{
    align_up, AccelerationStructureSizes, BlasBuildDesc, BufferDesc, DeviceError, OutOfMemory,
    QueueKind, TlasBuildDesc,
};

use super::{Buffer, Queue, Timeline};

/// Parameters of the emulated device.
#[derive(Clone, Debug)]
pub struct DeviceDesc {
    /// Total bytes of buffer memory the device can allocate.
    pub memory_budget: usize,

    /// Maximum number of live timeline objects.
    /// `None` means unlimited.
    pub max_timelines: Option<usize>,

    /// Required alignment of scratch memory offsets.
    pub scratch_alignment: usize,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        DeviceDesc {
            memory_budget: 1 << 30,
            max_timelines: None,
            scratch_alignment: 256,
        }
    }
}

/// Holds queue workers while device is suspended.
pub(super) struct Gate {
    suspended: Mutex<bool>,
    cond: Condvar,
}

impl Gate {
    fn new() -> Self {
        Gate {
            suspended: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Blocks until device is resumed or `closing` is set.
    pub fn pass(&self, closing: &AtomicBool) {
        let mut suspended = self.suspended.lock();
        while *suspended && !closing.load(Ordering::Acquire) {
            self.cond
                .wait_for(&mut suspended, Duration::from_millis(10));
        }
    }

    fn set(&self, value: bool) {
        *self.suspended.lock() = value;
        self.cond.notify_all();
    }

    pub fn wake(&self) {
        self.cond.notify_all();
    }
}

pub(super) struct Inner {
    desc: DeviceDesc,
    allocated: AtomicUsize,
    timelines: AtomicUsize,
    next_address: AtomicU64,
    next_id: AtomicU64,
    gate: Arc<Gate>,
}

impl Inner {
    pub fn release_memory(&self, size: usize) {
        self.allocated.fetch_sub(size, Ordering::AcqRel);
    }

    pub fn release_timeline(&self) {
        self.timelines.fetch_sub(1, Ordering::AcqRel);
    }
}

pub(super) type WeakDevice = Weak<Inner>;

#[derive(Clone)]
pub struct Device {
    inner: Arc<Inner>,
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({:p})", Arc::as_ptr(&self.inner))
    }
}

/// Base of the emulated device address space.
/// Zero is reserved as "no address".
const ADDRESS_BASE: u64 = 0x1_0000;

const BLAS_NODE_SIZE: usize = 64;
const TLAS_NODE_SIZE: usize = 64;

impl Device {
    pub fn new(desc: DeviceDesc) -> Self {
        assert!(
            desc.scratch_alignment.is_power_of_two(),
            "scratch alignment must be a power of two"
        );

        Device {
            inner: Arc::new(Inner {
                desc,
                allocated: AtomicUsize::new(0),
                timelines: AtomicUsize::new(0),
                next_address: AtomicU64::new(ADDRESS_BASE),
                next_id: AtomicU64::new(1),
                gate: Arc::new(Gate::new()),
            }),
        }
    }

    /// Stops all queues of this device from executing further work
    /// until [`Device::resume`] is called.
    /// Work already executing is not interrupted.
    pub fn suspend(&self) {
        self.inner.gate.set(true);
    }

    /// Resumes execution on all queues.
    pub fn resume(&self) {
        self.inner.gate.set(false);
    }

    /// Returns number of bytes currently allocated.
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    pub(super) fn gate(&self) -> Arc<Gate> {
        self.inner.gate.clone()
    }

    pub(super) fn weak(&self) -> WeakDevice {
        Arc::downgrade(&self.inner)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn reserve_memory(&self, size: usize) -> Result<(), OutOfMemory> {
        let budget = self.inner.desc.memory_budget;
        self.inner
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |allocated| {
                allocated.checked_add(size).filter(|&total| total <= budget)
            })
            .map(|_| ())
            .map_err(|_| OutOfMemory)
    }

    fn reserve_timeline(&self) -> Result<(), OutOfMemory> {
        let limit = self.inner.desc.max_timelines.unwrap_or(usize::MAX);
        self.inner
            .timelines
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                (count < limit).then_some(count + 1)
            })
            .map(|_| ())
            .map_err(|_| OutOfMemory)
    }
}

#[hidden_trait::expose]
impl crate::traits::Device for Device {
    fn new_queue(&self, kind: QueueKind) -> Result<Queue, DeviceError> {
        Queue::new(self.clone(), kind)
    }

    fn new_buffer(&self, desc: BufferDesc) -> Result<Buffer, OutOfMemory> {
        if desc.size == 0 {
            tracing::warn!("Refusing to allocate zero-sized buffer '{}'", desc.name);
            return Err(OutOfMemory);
        }

        self.reserve_memory(desc.size)?;

        let address = self
            .inner
            .next_address
            .fetch_add(align_up(desc.size, 256) as u64, Ordering::Relaxed);

        tracing::trace!(
            "Allocated buffer '{}' of {} bytes at {:#x}",
            desc.name,
            desc.size,
            address
        );

        Ok(Buffer::new(
            self.weak(),
            self.next_id(),
            address,
            desc,
        ))
    }

    fn new_timeline(&self) -> Result<Timeline, OutOfMemory> {
        self.reserve_timeline()?;
        Ok(Timeline::new(self.weak(), self.next_id()))
    }

    fn blas_sizes(&self, desc: &BlasBuildDesc) -> AccelerationStructureSizes {
        let primitives = desc.primitive_count() as usize;
        let align = self.inner.desc.scratch_alignment;

        AccelerationStructureSizes {
            size: align_up(super::BuildHeader::SIZE + primitives * BLAS_NODE_SIZE, 256),
            scratch_size: align_up(128 + primitives * 32, align),
            update_scratch_size: align_up(64 + primitives * 8, align),
        }
    }

    fn tlas_sizes(&self, desc: &TlasBuildDesc) -> AccelerationStructureSizes {
        let instances = desc.count as usize;
        let align = self.inner.desc.scratch_alignment;

        AccelerationStructureSizes {
            size: align_up(super::BuildHeader::SIZE + instances * TLAS_NODE_SIZE, 256),
            scratch_size: align_up(128 + instances * 16, align),
            update_scratch_size: align_up(64 + instances * 8, align),
        }
    }

    fn scratch_alignment(&self) -> usize {
        self.inner.desc.scratch_alignment
    }
}
