mod acst;
mod buffer;
mod format;
mod queue;
mod stages;

pub use self::{
    acst::{
        AccelerationStructureBuildFlags, AccelerationStructurePerformance,
        AccelerationStructureSizes, BlasBuildDesc, BlasGeometryDesc, BlasTriangles,
        TlasBuildDesc, TlasInstanceDesc, TlasInstanceFlags, Transform,
    },
    buffer::{AsBufferSlice, BufferDesc, BufferIndex, BufferSlice, BufferUsage, Memory},
    format::{IndexFormat, VertexFormat},
    queue::{QueueFlags, QueueKind},
    stages::PipelineStages,
};

/// Error that can happen when device's memory is exhausted
/// or the requested allocation can never be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
#[error("out of memory")]
pub struct OutOfMemory;

/// Error returned by operations that talk to a device queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, thiserror::Error)]
pub enum DeviceError {
    #[error("out of memory")]
    OutOfMemory,

    #[error("device lost")]
    DeviceLost,
}

impl From<OutOfMemory> for DeviceError {
    #[inline(never)]
    fn from(_: OutOfMemory) -> Self {
        DeviceError::OutOfMemory
    }
}

/// Rounds `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_rounds_to_power_of_two() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(13, 8), 16);
    }

    #[test]
    fn device_error_from_oom() {
        assert_eq!(DeviceError::from(OutOfMemory), DeviceError::OutOfMemory);
        assert_eq!(DeviceError::DeviceLost.to_string(), "device lost");
    }
}
