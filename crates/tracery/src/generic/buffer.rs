use std::ops::{Range, RangeFrom, RangeFull, RangeTo};

use crate::backend::Buffer;

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 0x0000_0001;
        const TRANSFER_DST = 0x0000_0002;
        const UNIFORM = 0x0000_0004;
        const STORAGE = 0x0000_0008;
        const INDEX = 0x0000_0010;
        const VERTEX = 0x0000_0020;
        const INDIRECT = 0x0000_0040;

        /// Buffer stores a built acceleration structure.
        const ACCELERATION_STRUCTURE = 0x0000_0100;

        /// Buffer is used as transient memory by acceleration structure builds.
        const SCRATCH = 0x0000_0200;

        /// Buffer holds packed instance records read by top-level builds.
        const INSTANCES = 0x0000_0400;

        /// Buffer is read by acceleration structure builds as geometry input.
        const BUILD_INPUT = 0x0000_0800;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Memory {
    Device,
    Upload,
    Download,
}

/// Buffer description.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferDesc<'a> {
    /// Buffer size.
    pub size: usize,

    /// Buffer usage flags.
    pub usage: BufferUsage,

    /// Buffer memory type.
    pub memory: Memory,

    /// Buffer debug name.
    pub name: &'a str,
}

pub trait BufferIndex {
    fn range(self, size: usize) -> Range<usize>;
}

impl BufferIndex for Range<usize> {
    #[cfg_attr(inline_more, inline(always))]
    fn range(self, size: usize) -> Range<usize> {
        debug_assert!(self.end <= size, "buffer range out of bounds");
        let end = self.end.min(size);
        let start = self.start.min(end);
        start..end
    }
}

impl BufferIndex for RangeFrom<usize> {
    #[cfg_attr(inline_more, inline(always))]
    fn range(self, size: usize) -> Range<usize> {
        debug_assert!(self.start <= size, "buffer range out of bounds");
        let start = self.start.min(size);
        start..size
    }
}

impl BufferIndex for RangeTo<usize> {
    #[cfg_attr(inline_more, inline(always))]
    fn range(self, size: usize) -> Range<usize> {
        debug_assert!(self.end <= size, "buffer range out of bounds");
        let end = self.end.min(size);
        0..end
    }
}

impl BufferIndex for RangeFull {
    #[cfg_attr(inline_more, inline(always))]
    fn range(self, size: usize) -> Range<usize> {
        0..size
    }
}

/// Byte range of a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferSlice<'a> {
    pub(crate) buffer: &'a Buffer,
    pub(crate) offset: usize,
    pub(crate) size: usize,
}

impl BufferSlice<'_> {
    pub fn buffer(&self) -> &Buffer {
        self.buffer
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Device address of the first byte of the slice.
    pub fn address(&self) -> u64 {
        self.buffer.address() + self.offset as u64
    }

    /// Returns byte range covered by the slice.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.size
    }
}

impl Buffer {
    /// Returns range of the buffer.
    #[cfg_attr(inline_more, inline)]
    pub fn slice<R>(&self, range: R) -> BufferSlice<'_>
    where
        R: BufferIndex,
    {
        let range = range.range(self.size());
        BufferSlice {
            buffer: self,
            offset: range.start,
            size: range.end - range.start,
        }
    }
}

impl<'a> BufferSlice<'a> {
    /// Returns sub-range of the buffer range.
    #[cfg_attr(inline_more, inline)]
    pub fn slice<R>(self, range: R) -> BufferSlice<'a>
    where
        R: BufferIndex,
    {
        let range = range.range(self.size);
        BufferSlice {
            buffer: self.buffer,
            offset: self.offset + range.start,
            size: range.end - range.start,
        }
    }
}

impl<'a> From<&'a Buffer> for BufferSlice<'a> {
    #[cfg_attr(inline_more, inline(always))]
    fn from(buffer: &'a Buffer) -> Self {
        BufferSlice {
            offset: 0,
            size: buffer.size(),
            buffer,
        }
    }
}

/// Trait for taking slice from the buffer.
pub trait AsBufferSlice {
    fn as_buffer_slice(&self) -> BufferSlice<'_>;
}

impl AsBufferSlice for BufferSlice<'_> {
    #[cfg_attr(inline_more, inline(always))]
    fn as_buffer_slice(&self) -> BufferSlice<'_> {
        *self
    }
}

impl AsBufferSlice for Buffer {
    #[cfg_attr(inline_more, inline(always))]
    fn as_buffer_slice(&self) -> BufferSlice<'_> {
        BufferSlice {
            offset: 0,
            size: self.size(),
            buffer: self,
        }
    }
}

impl<B> AsBufferSlice for &B
where
    B: AsBufferSlice,
{
    #[cfg_attr(inline_more, inline(always))]
    fn as_buffer_slice(&self) -> BufferSlice<'_> {
        (*self).as_buffer_slice()
    }
}
