use std::{
    fmt,
    hash::{Hash, Hasher},
    ops::Range,
    sync::Arc,
};

use parking_lot::Mutex;

use crate::generic::{BufferDesc, BufferUsage, Memory};

use super::{device::WeakDevice, BuildHeader};

struct Inner {
    owner: WeakDevice,
    id: u64,
    size: usize,
    usage: BufferUsage,
    memory: Memory,
    address: u64,
    name: Box<str>,

    /// Grows on first write, unwritten bytes read as zero.
    data: Mutex<Vec<u8>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(device) = self.owner.upgrade() {
            device.release_memory(self.size);
        }
    }
}

#[derive(Clone)]
pub struct Buffer {
    inner: Arc<Inner>,
}

impl PartialEq for Buffer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Buffer {}

impl Hash for Buffer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Arc::as_ptr(&self.inner).hash(state);
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("name", &self.inner.name)
            .field("id", &self.inner.id)
            .field("size", &self.inner.size)
            .field("address", &format_args!("{:#x}", self.inner.address))
            .finish()
    }
}

impl Buffer {
    pub(super) fn new(owner: WeakDevice, id: u64, address: u64, desc: BufferDesc) -> Self {
        Buffer {
            inner: Arc::new(Inner {
                owner,
                id,
                size: desc.size,
                usage: desc.usage,
                memory: desc.memory,
                address,
                name: desc.name.into(),
                data: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn usage(&self) -> BufferUsage {
        self.inner.usage
    }

    pub fn memory(&self) -> Memory {
        self.inner.memory
    }

    /// Writes data to the buffer from host.
    ///
    /// Caller is responsible for making sure that device
    /// does not access the same range concurrently.
    pub fn write(&self, offset: usize, data: &[u8]) {
        let end = offset + data.len();
        assert!(
            end <= self.inner.size,
            "write of {}..{} is out of bounds of buffer '{}' ({} bytes)",
            offset,
            end,
            self.inner.name,
            self.inner.size
        );

        let mut bytes = self.inner.data.lock();
        if bytes.len() < end {
            bytes.resize(end, 0);
        }
        bytes[offset..end].copy_from_slice(data);
    }

    /// Fills range of the buffer with zeros.
    pub fn clear(&self, range: Range<usize>) {
        assert!(range.end <= self.inner.size, "clear is out of bounds");

        let mut bytes = self.inner.data.lock();
        let end = range.end.min(bytes.len());
        if range.start < end {
            bytes[range.start..end].fill(0);
        }
    }

    /// Reads range of the buffer back to host.
    pub fn read(&self, range: Range<usize>) -> Vec<u8> {
        assert!(range.end <= self.inner.size, "read is out of bounds");

        let bytes = self.inner.data.lock();
        let mut out = vec![0; range.len()];
        let end = range.end.min(bytes.len());
        if range.start < end {
            out[..end - range.start].copy_from_slice(&bytes[range.start..end]);
        }
        out
    }

    /// Reads header written by emulated acceleration structure build.
    /// Returns `None` if nothing was built into this buffer yet.
    pub fn build_header(&self) -> Option<BuildHeader> {
        if self.inner.size < BuildHeader::SIZE {
            return None;
        }

        let bytes = self.read(0..BuildHeader::SIZE);
        let header: BuildHeader = bytemuck::pod_read_unaligned(&bytes);
        match header.magic {
            super::BLAS_MAGIC | super::TLAS_MAGIC => Some(header),
            _ => None,
        }
    }
}

#[hidden_trait::expose]
impl crate::traits::Buffer for Buffer {
    #[cfg_attr(inline_more, inline(always))]
    fn size(&self) -> usize {
        self.inner.size
    }

    #[cfg_attr(inline_more, inline(always))]
    fn address(&self) -> u64 {
        self.inner.address
    }
}
