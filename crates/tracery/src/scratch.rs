//! Ring allocator of transient build memory.

use std::fmt;

use crate::{
    backend::{Buffer, Device},
    command::CommandManager,
    fence::FenceValue,
    generic::{
        align_up, BufferDesc, BufferSlice, BufferUsage, DeviceError, Memory, OutOfMemory,
        PipelineStages, QueueKind,
    },
    resource::{Resource, ResourceState},
};

/// What to do when allocation wraps to the start of the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WaitPolicy {
    /// Wrap immediately.
    /// Every wrap records a build-to-build barrier, so consumers of the new lap
    /// are ordered after the previous lap on the same queue.
    Overlap,

    /// Fail until work that consumed the previous lap has completed.
    WaitForLap,
}

/// Byte range handed out by [`ScratchBuffer`].
/// Valid until the ring wraps past it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScratchAllocation {
    buffer: Buffer,
    offset: usize,
    size: usize,
}

impl ScratchAllocation {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slice(&self) -> BufferSlice<'_> {
        self.buffer.slice(self.offset..self.offset + self.size)
    }
}

/// Fixed-size ring of scratch memory shared by all builds recorded into one queue.
pub struct ScratchBuffer {
    name: String,
    resource: Resource<Buffer>,
    capacity: usize,
    alignment: usize,
    cursor: usize,

    // Queue of the first build that used the ring.
    queue: Option<QueueKind>,

    // Signal scheduled by a wrap that `WaitForLap` caller still waits for.
    wrap_pending: Option<FenceValue>,

    laps: u64,
}

impl fmt::Debug for ScratchBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScratchBuffer")
            .field("name", &self.name)
            .field("state", &self.resource.state())
            .field("capacity", &self.capacity)
            .field("cursor", &self.cursor)
            .field("laps", &self.laps)
            .finish()
    }
}

impl ScratchBuffer {
    /// Creates the ring without allocating memory.
    pub fn new(name: &str, capacity: usize) -> Self {
        ScratchBuffer {
            name: name.to_owned(),
            resource: Resource::new(),
            capacity,
            alignment: 1,
            cursor: 0,
            queue: None,
            wrap_pending: None,
            laps: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Queue the ring is bound to, once used.
    pub fn queue(&self) -> Option<QueueKind> {
        self.queue
    }

    /// Number of times the ring wrapped.
    pub fn laps(&self) -> u64 {
        self.laps
    }

    pub fn state(&self) -> ResourceState {
        self.resource.state()
    }

    /// Allocates ring memory unless it is already allocated.
    pub fn build(&mut self, device: &Device) -> Result<&Buffer, OutOfMemory> {
        let alignment = device.scratch_alignment();
        let capacity = self.capacity;
        let name = &self.name;

        let buffer = self.resource.ensure(|| {
            tracing::debug!("Allocating scratch ring '{name}' of {capacity} bytes");
            device.new_buffer(BufferDesc {
                size: capacity,
                usage: BufferUsage::SCRATCH | BufferUsage::STORAGE,
                memory: Memory::Device,
                name,
            })
        })?;
        self.alignment = alignment;
        Ok(buffer)
    }

    /// Reserves `size` bytes for a build recorded into `commands`.
    ///
    /// Returns `None` when no space is available right now.
    /// Callers retry on a later frame.
    /// The ring is bound to the queue of the first request,
    /// requests from other queues get `None`.
    pub fn request_space(
        &mut self,
        commands: &mut CommandManager,
        size: usize,
        policy: WaitPolicy,
    ) -> Result<Option<ScratchAllocation>, DeviceError> {
        if let Some(queue) = self.queue {
            if queue != commands.kind() {
                tracing::warn!(
                    "Scratch ring '{}' belongs to {queue} queue, refusing {} request",
                    self.name,
                    commands.kind()
                );
                return Ok(None);
            }
        }

        let built = self.build(commands.device()).map(|_| ());
        if let Err(err) = built {
            tracing::warn!("Scratch ring '{}' is unavailable: {err}", self.name);
            return Ok(None);
        }

        let size = align_up(size.max(1), self.alignment);
        if size > self.capacity {
            tracing::warn!(
                "Scratch request of {size} bytes exceeds ring '{}' capacity of {} bytes",
                self.name,
                self.capacity
            );
            return Ok(None);
        }

        if self.cursor + size > self.capacity && !self.wrap(commands, policy)? {
            return Ok(None);
        }

        let Some(buffer) = self.resource.get() else {
            return Ok(None);
        };

        let offset = self.cursor;
        self.cursor += size;
        self.queue = Some(commands.kind());
        tracing::trace!(
            "Scratch ring '{}' hands out {offset}..{}",
            self.name,
            self.cursor
        );

        Ok(Some(ScratchAllocation {
            buffer: buffer.clone(),
            offset,
            size,
        }))
    }

    /// Moves cursor to the start of the ring.
    /// Returns `false` if the wrap is not safe yet.
    fn wrap(
        &mut self,
        commands: &mut CommandManager,
        policy: WaitPolicy,
    ) -> Result<bool, DeviceError> {
        match policy {
            WaitPolicy::Overlap => {
                if self.wrap_pending.take().is_none() {
                    commands.insert_fence_signal()?;
                }

                // Lap that just ended is still in flight.
                commands.current_list()?.barrier(
                    PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                    PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                );
            }
            WaitPolicy::WaitForLap => {
                let value = match self.wrap_pending {
                    Some(value) => value,
                    None => {
                        let value = commands.insert_fence_signal()?;
                        self.wrap_pending = Some(value);
                        value
                    }
                };

                if !commands.fence().is_complete(value) {
                    tracing::trace!(
                        "Scratch ring '{}' waits for {value} before wrapping",
                        self.name
                    );
                    return Ok(false);
                }

                self.wrap_pending = None;
            }
        }

        tracing::debug!("Scratch ring '{}' wraps", self.name);
        self.cursor = 0;
        self.laps += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng};

    use crate::{
        backend::{Device, DeviceDesc},
        command::{Action, SubmitOp},
        config::Config,
        generic::QueueKind,
    };

    use super::*;

    fn manager(device: &Device) -> CommandManager {
        CommandManager::new(device, QueueKind::Compute, &Config::default()).unwrap()
    }

    #[test]
    fn built_lazily_on_first_request() {
        let device = Device::new(DeviceDesc::default());
        let mut commands = manager(&device);
        let mut scratch = ScratchBuffer::new("scratch", 4096);
        assert_eq!(scratch.state(), ResourceState::Unallocated);
        assert_eq!(device.allocated(), 0);

        let allocation = scratch
            .request_space(&mut commands, 100, WaitPolicy::Overlap)
            .unwrap()
            .unwrap();
        assert_eq!(scratch.state(), ResourceState::Ready);
        assert_eq!(allocation.offset(), 0);
        assert_eq!(allocation.size(), 256);
        assert_eq!(scratch.cursor(), 256);
        assert_eq!(device.allocated(), 4096);
    }

    #[test]
    fn wrap_schedules_signal_on_current_list() {
        let device = Device::new(DeviceDesc::default());
        let mut commands = manager(&device);
        let mut scratch = ScratchBuffer::new("scratch", 1024);

        scratch
            .request_space(&mut commands, 768, WaitPolicy::Overlap)
            .unwrap()
            .unwrap();

        // Larger than remaining space but fits the ring.
        let allocation = scratch
            .request_space(&mut commands, 512, WaitPolicy::Overlap)
            .unwrap()
            .unwrap();
        assert_eq!(allocation.offset(), 0);
        assert_eq!(scratch.laps(), 1);

        let pending = commands.fence().pending();
        assert_eq!(pending.value(), 1);
        let list = commands.current_list().unwrap();
        assert!(matches!(
            list.post_submit(),
            [SubmitOp::Signal(value)] if *value == pending
        ));
    }

    fn build_barriers(commands: &mut CommandManager) -> usize {
        commands
            .current_list()
            .unwrap()
            .actions()
            .iter()
            .filter(|action| {
                matches!(
                    action,
                    Action::Barrier { after, before }
                        if *after == PipelineStages::ACCELERATION_STRUCTURE_BUILD
                            && *before == PipelineStages::ACCELERATION_STRUCTURE_BUILD
                )
            })
            .count()
    }

    #[test]
    fn every_overlap_wrap_records_barrier() {
        let device = Device::new(DeviceDesc::default());
        let mut commands = manager(&device);
        let mut scratch = ScratchBuffer::new("scratch", 1024);

        scratch
            .request_space(&mut commands, 768, WaitPolicy::Overlap)
            .unwrap()
            .unwrap();
        assert_eq!(build_barriers(&mut commands), 0);

        let allocation = scratch
            .request_space(&mut commands, 512, WaitPolicy::Overlap)
            .unwrap()
            .unwrap();
        assert_eq!(allocation.offset(), 0);
        assert_eq!(build_barriers(&mut commands), 1);

        // Previous lap completes before the next wrap.
        let value = commands.submit_and_signal().unwrap();
        assert!(commands.fence().wait(value, None));

        scratch
            .request_space(&mut commands, 768, WaitPolicy::Overlap)
            .unwrap()
            .unwrap();
        assert_eq!(scratch.laps(), 2);
        assert_eq!(build_barriers(&mut commands), 1);
    }

    #[test]
    fn ring_refuses_foreign_queue() {
        let device = Device::new(DeviceDesc::default());
        let mut compute = manager(&device);
        let mut direct =
            CommandManager::new(&device, QueueKind::Direct, &Config::default()).unwrap();
        let mut scratch = ScratchBuffer::new("scratch", 1024);

        scratch
            .request_space(&mut compute, 16, WaitPolicy::Overlap)
            .unwrap()
            .unwrap();
        assert_eq!(scratch.queue(), Some(QueueKind::Compute));

        assert!(scratch
            .request_space(&mut direct, 16, WaitPolicy::Overlap)
            .unwrap()
            .is_none());
        assert_eq!(scratch.cursor(), 256);
    }

    #[test]
    fn wait_for_lap_fails_until_signaled() {
        let device = Device::new(DeviceDesc::default());
        let mut commands = manager(&device);
        let mut scratch = ScratchBuffer::new("staging", 1024);

        scratch
            .request_space(&mut commands, 768, WaitPolicy::WaitForLap)
            .unwrap()
            .unwrap();
        assert!(scratch
            .request_space(&mut commands, 512, WaitPolicy::WaitForLap)
            .unwrap()
            .is_none());

        // Retrying does not schedule another signal.
        assert!(scratch
            .request_space(&mut commands, 512, WaitPolicy::WaitForLap)
            .unwrap()
            .is_none());
        let pending = commands.fence().pending();
        assert_eq!(pending.value(), 1);

        commands.execute().unwrap();
        assert!(commands.fence().wait(pending, None));

        let allocation = scratch
            .request_space(&mut commands, 512, WaitPolicy::WaitForLap)
            .unwrap()
            .unwrap();
        assert_eq!(allocation.offset(), 0);
        assert_eq!(commands.fence().pending(), pending);
    }

    #[test]
    fn oversized_request_fails() {
        let device = Device::new(DeviceDesc::default());
        let mut commands = manager(&device);
        let mut scratch = ScratchBuffer::new("scratch", 1024);

        assert!(scratch
            .request_space(&mut commands, 1025, WaitPolicy::Overlap)
            .unwrap()
            .is_none());
        assert_eq!(scratch.cursor(), 0);
    }

    #[test]
    fn failed_allocation_is_retried() {
        let device = Device::new(DeviceDesc {
            memory_budget: 512,
            ..DeviceDesc::default()
        });
        let mut commands = manager(&device);
        let mut scratch = ScratchBuffer::new("scratch", 1024);

        assert!(scratch
            .request_space(&mut commands, 16, WaitPolicy::Overlap)
            .unwrap()
            .is_none());
        assert_eq!(scratch.state(), ResourceState::Unallocated);
    }

    #[test]
    fn random_requests_wrap_once_per_lap() {
        let device = Device::new(DeviceDesc::default());
        let mut commands = manager(&device);
        let capacity = 64 * 256;
        let mut scratch = ScratchBuffer::new("scratch", capacity);
        let mut rng = rand::rngs::StdRng::seed_from_u64(0x5c4a7c4);

        let mut lap: Vec<(usize, usize)> = Vec::new();
        let mut wraps = 0;

        for _ in 0..1000 {
            let size = rng.gen_range(1..capacity / 3);
            let allocation = scratch
                .request_space(&mut commands, size, WaitPolicy::Overlap)
                .unwrap()
                .unwrap();

            assert_eq!(allocation.offset() % 256, 0);
            assert!(allocation.size() >= size);
            assert!(allocation.offset() + allocation.size() <= capacity);

            if allocation.offset() == 0 && !lap.is_empty() {
                // Previous lap could not fit this request.
                let end = lap.last().map_or(0, |&(offset, size)| offset + size);
                assert!(end + allocation.size() > capacity);
                wraps += 1;
                lap.clear();
            }

            for &(offset, size) in &lap {
                let overlaps = allocation.offset() < offset + size
                    && offset < allocation.offset() + allocation.size();
                assert!(!overlaps);
            }
            lap.push((allocation.offset(), allocation.size()));

            if rng.gen_bool(0.1) {
                commands.execute().unwrap();
            }
        }

        assert_eq!(scratch.laps(), wraps);
        assert_eq!(commands.fence().pending().value(), wraps);
        assert!(wraps > 0);
    }
}
