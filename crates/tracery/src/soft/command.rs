use std::ops::Range;

use crate::generic::{
    AccelerationStructureBuildFlags, AsBufferSlice, BlasBuildDesc, BufferUsage, OutOfMemory,
    PipelineStages, QueueFlags, QueueKind, TlasBuildDesc, TlasInstanceDesc,
};

use super::{rejected, Buffer, BuildHeader, Device, BLAS_MAGIC, TLAS_MAGIC};

/// Command recorded by the encoder and replayed by the queue worker.
/// Holds buffers it references to keep them alive until executed.
pub(super) enum Command {
    Barrier {
        after: PipelineStages,
        before: PipelineStages,
    },
    Write {
        buffer: Buffer,
        offset: usize,
        data: Box<[u8]>,
    },
    BuildBlas {
        dst: Buffer,
        src: Option<Buffer>,
        primitives: u64,
        scratch: Buffer,
        scratch_range: Range<usize>,
    },
    BuildTlas {
        dst: Buffer,
        instances: Buffer,
        instances_offset: usize,
        count: u32,
        scratch: Buffer,
        scratch_range: Range<usize>,
    },
    BeginMarker(Box<str>),
    EndMarker,
}

impl Command {
    fn execute(self, queue: QueueKind) {
        match self {
            Command::Barrier { after, before } => {
                // Commands execute sequentially on the worker.
                tracing::trace!("[{queue}] barrier {after:?} -> {before:?}");
            }
            Command::Write {
                buffer,
                offset,
                data,
            } => buffer.write(offset, &data),
            Command::BuildBlas {
                dst,
                src,
                primitives,
                scratch,
                scratch_range,
            } => {
                let generation = match &src {
                    None => 0,
                    Some(src) => match src.build_header() {
                        Some(header) if header.magic == BLAS_MAGIC => header.generation + 1,
                        _ => {
                            tracing::error!(
                                "[{queue}] update build of '{}' from a source that was never built",
                                dst.name()
                            );
                            0
                        }
                    },
                };

                scratch.clear(scratch_range);

                let header = BuildHeader {
                    magic: BLAS_MAGIC,
                    generation,
                    primitives,
                    visible: 0,
                    reserved: 0,
                };
                dst.write(0, bytemuck::bytes_of(&header));
            }
            Command::BuildTlas {
                dst,
                instances,
                instances_offset,
                count,
                scratch,
                scratch_range,
            } => {
                let size = count as usize * TlasInstanceDesc::SIZE;
                let bytes = instances.read(instances_offset..instances_offset + size);

                let visible = bytes
                    .chunks_exact(TlasInstanceDesc::SIZE)
                    .map(bytemuck::pod_read_unaligned::<TlasInstanceDesc>)
                    .filter(TlasInstanceDesc::is_visible)
                    .count();

                scratch.clear(scratch_range);

                let header = BuildHeader {
                    magic: TLAS_MAGIC,
                    generation: 0,
                    primitives: u64::from(count),
                    visible: visible as u64,
                    reserved: 0,
                };
                dst.write(0, bytemuck::bytes_of(&header));
            }
            Command::BeginMarker(label) => tracing::trace!("[{queue}] begin '{label}'"),
            Command::EndMarker => tracing::trace!("[{queue}] end"),
        }
    }
}

pub struct CommandBuffer {
    pub(super) queue: QueueKind,
    commands: Vec<Command>,
}

impl CommandBuffer {
    /// Returns number of recorded commands.
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub(super) fn execute(self) {
        let queue = self.queue;
        for command in self.commands {
            command.execute(queue);
        }
    }
}

pub struct CommandEncoder {
    device: Device,
    queue: QueueKind,
    commands: Vec<Command>,
}

impl CommandEncoder {
    pub(super) fn new(device: Device, queue: QueueKind) -> Self {
        CommandEncoder {
            device,
            queue,
            commands: Vec::new(),
        }
    }

    fn check_supports(&self, flags: QueueFlags, what: &str) {
        if !self.queue.flags().contains(flags) {
            rejected(format_args!("{what} is not supported on {} queue", self.queue));
        }
    }

    fn check_scratch(&self, scratch: &crate::generic::BufferSlice, required: usize) {
        if !scratch.buffer().usage().contains(BufferUsage::SCRATCH) {
            rejected(format_args!(
                "buffer '{}' is not usable as scratch",
                scratch.buffer().name()
            ));
        }
        if scratch.offset() % self.device.scratch_alignment() != 0 {
            rejected(format_args!(
                "scratch offset {} is misaligned",
                scratch.offset()
            ));
        }
        if scratch.size() < required {
            rejected(format_args!(
                "scratch range of {} bytes is smaller than required {}",
                scratch.size(),
                required
            ));
        }
    }
}

#[hidden_trait::expose]
impl crate::traits::CommandEncoder for CommandEncoder {
    #[inline(never)]
    fn barrier(&mut self, after: PipelineStages, before: PipelineStages) {
        self.commands.push(Command::Barrier { after, before });
    }

    #[inline(never)]
    fn write_buffer_raw(&mut self, slice: impl AsBufferSlice, data: &[u8]) {
        let slice = slice.as_buffer_slice();
        if data.len() > slice.size() {
            rejected(format_args!(
                "write of {} bytes into {} byte range",
                data.len(),
                slice.size()
            ));
        }

        self.commands.push(Command::Write {
            buffer: slice.buffer().clone(),
            offset: slice.offset(),
            data: data.into(),
        });
    }

    #[inline(never)]
    fn build_blas(
        &mut self,
        dst: &Buffer,
        src: Option<&Buffer>,
        desc: BlasBuildDesc,
        scratch: impl AsBufferSlice,
    ) {
        self.check_supports(QueueFlags::COMPUTE, "acceleration structure build");

        let scratch = scratch.as_buffer_slice();
        let sizes = self.device.blas_sizes(&desc);
        let update = desc
            .flags
            .contains(AccelerationStructureBuildFlags::PERFORM_UPDATE);

        if update != src.is_some() {
            rejected(format_args!(
                "update build requires source structure and only update build accepts one"
            ));
        }

        let required = if update {
            sizes.update_scratch_size
        } else {
            sizes.scratch_size
        };
        self.check_scratch(&scratch, required);

        if dst.size() < sizes.size {
            rejected(format_args!(
                "destination '{}' of {} bytes is smaller than required {}",
                dst.name(),
                dst.size(),
                sizes.size
            ));
        }

        self.commands.push(Command::BuildBlas {
            dst: dst.clone(),
            src: src.cloned(),
            primitives: desc.primitive_count(),
            scratch: scratch.buffer().clone(),
            scratch_range: scratch.range(),
        });
    }

    #[inline(never)]
    fn build_tlas(&mut self, dst: &Buffer, desc: TlasBuildDesc, scratch: impl AsBufferSlice) {
        self.check_supports(QueueFlags::COMPUTE, "acceleration structure build");

        let scratch = scratch.as_buffer_slice();
        let sizes = self.device.tlas_sizes(&desc);
        self.check_scratch(&scratch, sizes.scratch_size);

        if dst.size() < sizes.size {
            rejected(format_args!(
                "destination '{}' of {} bytes is smaller than required {}",
                dst.name(),
                dst.size(),
                sizes.size
            ));
        }

        let required = desc.count as usize * TlasInstanceDesc::SIZE;
        if desc.instances.size() < required {
            rejected(format_args!(
                "instance range of {} bytes cannot hold {} records",
                desc.instances.size(),
                desc.count
            ));
        }

        self.commands.push(Command::BuildTlas {
            dst: dst.clone(),
            instances: desc.instances.buffer().clone(),
            instances_offset: desc.instances.offset(),
            count: desc.count,
            scratch: scratch.buffer().clone(),
            scratch_range: scratch.range(),
        });
    }

    // Markers form a per-queue stack and may span command buffers.
    fn begin_marker(&mut self, label: &str) {
        self.commands.push(Command::BeginMarker(label.into()));
    }

    fn end_marker(&mut self) {
        self.commands.push(Command::EndMarker);
    }

    #[inline(never)]
    fn finish(self) -> Result<CommandBuffer, OutOfMemory> {
        Ok(CommandBuffer {
            queue: self.queue,
            commands: self.commands,
        })
    }
}
