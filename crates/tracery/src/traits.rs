use std::{fmt::Debug, hash::Hash, time::Duration};

use crate::generic::{
    AccelerationStructureSizes, AsBufferSlice, BlasBuildDesc, BufferDesc, DeviceError,
    OutOfMemory, PipelineStages, QueueKind, TlasBuildDesc,
};

pub trait Device: Clone + Debug + Eq + Send + Sync + 'static {
    /// Create a new queue of the given kind.
    fn new_queue(&self, kind: QueueKind) -> Result<crate::backend::Queue, DeviceError>;

    /// Create a new buffer with zeroed contents.
    fn new_buffer(&self, desc: BufferDesc) -> Result<crate::backend::Buffer, OutOfMemory>;

    /// Create a new timeline object that queues and host can signal and wait on.
    fn new_timeline(&self) -> Result<crate::backend::Timeline, OutOfMemory>;

    /// Returns memory requirements for a bottom-level build.
    fn blas_sizes(&self, desc: &BlasBuildDesc) -> AccelerationStructureSizes;

    /// Returns memory requirements for a top-level build.
    fn tlas_sizes(&self, desc: &TlasBuildDesc) -> AccelerationStructureSizes;

    /// Required alignment of scratch memory offsets.
    fn scratch_alignment(&self) -> usize;
}

pub trait Queue: Debug + Send + Sync + 'static {
    /// Returns kind of this queue.
    fn kind(&self) -> QueueKind;

    /// Create a new command encoder associated with this queue.
    /// The encoder must be submitted to the queue it was created from.
    fn new_command_encoder(&mut self) -> Result<crate::backend::CommandEncoder, OutOfMemory>;

    /// Makes next submission wait until timeline reaches `value`.
    fn wait(&mut self, timeline: &crate::backend::Timeline, value: u64);

    /// Submit command buffers to the queue.
    fn submit<I>(&mut self, command_buffers: I) -> Result<(), DeviceError>
    where
        I: IntoIterator<Item = crate::backend::CommandBuffer>;

    /// Sets timeline to `value` after all previously submitted work completes.
    fn signal(&mut self, timeline: &crate::backend::Timeline, value: u64)
        -> Result<(), DeviceError>;
}

pub trait CommandEncoder {
    /// Synchronizes the access to the resources.
    /// Commands in `before` stages of subsequent commands will be
    /// executed only after commands in `after` stages of previous commands
    /// are finished.
    fn barrier(&mut self, after: PipelineStages, before: PipelineStages);

    /// Writes data to the buffer.
    fn write_buffer_raw(&mut self, slice: impl AsBufferSlice, data: &[u8]);

    /// Builds bottom-level structure into `dst`.
    /// If `src` is specified the build refits it.
    fn build_blas(
        &mut self,
        dst: &crate::backend::Buffer,
        src: Option<&crate::backend::Buffer>,
        desc: BlasBuildDesc,
        scratch: impl AsBufferSlice,
    );

    /// Builds top-level structure into `dst`.
    fn build_tlas(
        &mut self,
        dst: &crate::backend::Buffer,
        desc: TlasBuildDesc,
        scratch: impl AsBufferSlice,
    );

    /// Opens a labeled region for debugging tools.
    fn begin_marker(&mut self, label: &str);

    /// Closes the innermost labeled region.
    fn end_marker(&mut self);

    /// Finishes encoding and returns the command buffer.
    fn finish(self) -> Result<crate::backend::CommandBuffer, OutOfMemory>;
}

pub trait Buffer: Clone + Debug + Eq + Hash + Send + Sync + 'static {
    /// Returns the size of the buffer in bytes.
    fn size(&self) -> usize;

    /// Returns device address of the buffer.
    fn address(&self) -> u64;
}

pub trait Timeline: Clone + Debug + Send + Sync + 'static {
    /// Returns last value reached by the timeline.
    fn value(&self) -> u64;

    /// Blocks until timeline reaches `value` or `timeout` expires.
    /// Returns `true` if value was reached.
    fn wait(&self, value: u64, timeout: Duration) -> bool;
}
