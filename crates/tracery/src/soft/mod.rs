//! Software backend.
//!
//! Emulates a device with asynchronous queues.
//! Every queue runs submitted work on its own worker thread,
//! so host code observes completion only through timelines,
//! the same way it would with real hardware.

mod buffer;
mod command;
mod device;
mod queue;
mod timeline;

use std::fmt;

pub use self::{
    buffer::Buffer,
    command::{CommandBuffer, CommandEncoder},
    device::{Device, DeviceDesc},
    queue::Queue,
    timeline::Timeline,
};

/// Header written by emulated acceleration structure builds
/// at the start of the destination buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct BuildHeader {
    /// [`BLAS_MAGIC`] or [`TLAS_MAGIC`].
    pub magic: u32,

    /// Incremented by every update build of the same structure.
    pub generation: u32,

    /// Triangles for bottom-level structures, instances for top-level ones.
    pub primitives: u64,

    /// Instances that reference a built structure with non-zero mask.
    /// Always zero for bottom-level structures.
    pub visible: u64,

    pub reserved: u64,
}

impl BuildHeader {
    pub const SIZE: usize = std::mem::size_of::<BuildHeader>();
}

pub const BLAS_MAGIC: u32 = u32::from_le_bytes(*b"BLAS");
pub const TLAS_MAGIC: u32 = u32::from_le_bytes(*b"TLAS");

/// Emulates driver rejecting malformed command.
/// There is no way to continue with corrupted device state.
#[track_caller]
fn rejected(what: fmt::Arguments) -> ! {
    panic!("command rejected by device: {what}")
}
