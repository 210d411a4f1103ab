use std::fmt;

use crate::{
    backend::{Buffer, Device},
    generic::{
        BufferDesc, BufferUsage, Memory, OutOfMemory, TlasInstanceDesc, TlasInstanceFlags,
        Transform,
    },
    resource::{Resource, ResourceState},
};

use super::{blas::Registry, BlasKey, BlasManager, GeometryKind};

/// Identifier of a placed object, stable across frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u64);

/// One placement of a bottom-level structure in the scene.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Instance {
    pub id: InstanceId,
    pub blas: BlasKey,
    pub transform: Transform,

    /// Offset into the hit group table.
    /// `None` until resolved, written as zero.
    pub hit_group: Option<u32>,

    pub mask: u8,
    pub kind: GeometryKind,
    pub flags: TlasInstanceFlags,
}

impl Instance {
    pub fn new(id: InstanceId, blas: BlasKey, transform: Transform) -> Self {
        Instance {
            id,
            blas,
            transform,
            hit_group: None,
            mask: 0xff,
            kind: GeometryKind::Static,
            flags: TlasInstanceFlags::empty(),
        }
    }

    /// Packs instance record.
    /// Instance without a ready structure is written invisible,
    /// as is one whose index or hit group does not fit the record.
    fn record(&self, custom_index: u32, blas_address: Option<u64>) -> TlasInstanceDesc {
        let hit_group = self.hit_group.unwrap_or(0);
        let fits = custom_index <= TlasInstanceDesc::MAX_INDEX
            && hit_group <= TlasInstanceDesc::MAX_INDEX;
        if !fits {
            tracing::warn!(
                "Instance {:?} with index {custom_index} and hit group {hit_group} can't be traced",
                self.id
            );
        }

        match blas_address.filter(|_| fits) {
            Some(address) => TlasInstanceDesc::new(
                self.transform,
                custom_index,
                self.mask,
                hit_group,
                self.flags,
                address,
            ),
            None => TlasInstanceDesc::new(
                self.transform,
                custom_index & TlasInstanceDesc::MAX_INDEX,
                0,
                hit_group & TlasInstanceDesc::MAX_INDEX,
                self.flags,
                0,
            ),
        }
    }
}

/// Packed array of instance records read by a top-level build.
pub struct InstanceDescriptor {
    name: String,
    buffer: Resource<Buffer>,
    count: usize,
}

impl fmt::Debug for InstanceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceDescriptor")
            .field("name", &self.name)
            .field("state", &self.buffer.state())
            .field("count", &self.count)
            .finish()
    }
}

impl InstanceDescriptor {
    pub fn new(name: &str) -> Self {
        InstanceDescriptor {
            name: name.to_owned(),
            buffer: Resource::new(),
            count: 0,
        }
    }

    pub fn state(&self) -> ResourceState {
        self.buffer.state()
    }

    pub fn buffer(&self) -> Option<&Buffer> {
        self.buffer.get()
    }

    /// Number of records written by the last fill.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Number of records current allocation can hold.
    pub fn capacity(&self) -> usize {
        self.buffer
            .get()
            .map_or(0, |buffer| buffer.size() / TlasInstanceDesc::SIZE)
    }

    /// Rewrites records for `instances`, growing the allocation if needed.
    ///
    /// Instance index is used as its custom index.
    pub fn fill(
        &mut self,
        device: &Device,
        blas: &BlasManager,
        instances: &[Instance],
    ) -> Result<(), OutOfMemory> {
        let buffer = self.stage(device, instances.len())?;
        self.write(buffer, &blas.read(), instances)
    }

    /// Returns buffer able to hold `count` records.
    ///
    /// That is the current allocation if it is large enough.
    /// Otherwise a new one is allocated and left uninstalled
    /// until [`write`](InstanceDescriptor::write) is called with it.
    pub(super) fn stage(&self, device: &Device, count: usize) -> Result<Buffer, OutOfMemory> {
        if let Some(buffer) = self.buffer.get() {
            if self.capacity() >= count {
                return Ok(buffer.clone());
            }
        }

        device.new_buffer(BufferDesc {
            size: count.max(1) * TlasInstanceDesc::SIZE,
            usage: BufferUsage::INSTANCES | BufferUsage::BUILD_INPUT,
            memory: Memory::Upload,
            name: &self.name,
        })
    }

    /// Installs `buffer` from [`stage`](InstanceDescriptor::stage)
    /// and writes records of `instances` into it.
    pub(super) fn write(
        &mut self,
        buffer: Buffer,
        registry: &Registry,
        instances: &[Instance],
    ) -> Result<(), OutOfMemory> {
        if self.buffer.get() == Some(&buffer) {
            if instances.len() < self.count {
                let stale = instances.len() * TlasInstanceDesc::SIZE
                    ..self.count * TlasInstanceDesc::SIZE;
                buffer.clear(stale);
            }
        } else {
            tracing::debug!(
                "Growing instance descriptor '{}' to {} records",
                self.name,
                instances.len()
            );
            self.count = 0;
            self.buffer.allocate(|| Ok(buffer.clone()))?;
        }

        let records: Vec<TlasInstanceDesc> = instances
            .iter()
            .enumerate()
            .map(|(idx, instance)| {
                let index = u32::try_from(idx).unwrap_or(u32::MAX);
                instance.record(index, registry.address(instance.blas))
            })
            .collect();

        buffer.write(0, bytemuck::cast_slice(&records));
        self.count = instances.len();
        Ok(())
    }

    /// Reads records back from host-visible memory.
    pub fn records(&self) -> Vec<TlasInstanceDesc> {
        let Some(buffer) = self.buffer.get() else {
            return Vec::new();
        };

        buffer
            .read(0..self.count * TlasInstanceDesc::SIZE)
            .chunks_exact(TlasInstanceDesc::SIZE)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        accel::GeometryBatch,
        backend::DeviceDesc,
        command::CommandManager,
        config::Config,
        generic::{QueueKind, VertexFormat},
    };

    use super::*;

    #[test]
    fn unresolved_instances_are_invisible() {
        let device = Device::new(DeviceDesc::default());
        let blas = BlasManager::new(&Config::default());
        let mut descriptor = InstanceDescriptor::new("instances");

        let instances = [
            Instance::new(InstanceId(1), BlasKey(1), Transform::IDENTITY),
            Instance::new(InstanceId(2), BlasKey(2), Transform::translation(1.0, 0.0, 0.0)),
        ];
        descriptor.fill(&device, &blas, &instances).unwrap();

        let records = descriptor.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|record| !record.is_visible()));
        assert_eq!(records[1].custom_index(), 1);
        assert_eq!(records[1].transform, Transform::translation(1.0, 0.0, 0.0));
    }

    #[test]
    fn resolves_ready_structures() {
        let device = Device::new(DeviceDesc::default());
        let config = Config::default();
        let mut commands = CommandManager::new(&device, QueueKind::Compute, &config).unwrap();
        let blas = BlasManager::new(&config);

        let vertices = device
            .new_buffer(BufferDesc {
                size: 36,
                usage: BufferUsage::VERTEX,
                memory: Memory::Upload,
                name: "vertices",
            })
            .unwrap();
        blas.add_geometry(
            BlasKey(7),
            GeometryBatch::triangles(&vertices, 3, VertexFormat::Float32x3),
        );
        blas.generate(&mut commands).unwrap();

        let mut instance = Instance::new(InstanceId(1), BlasKey(7), Transform::IDENTITY);
        instance.hit_group = Some(3);
        instance.mask = 0x0f;

        let mut descriptor = InstanceDescriptor::new("instances");
        descriptor.fill(&device, &blas, &[instance]).unwrap();

        let records = descriptor.records();
        assert_eq!(records[0].blas_address, blas.address(BlasKey(7)).unwrap());
        assert_eq!(records[0].mask(), 0x0f);
        assert_eq!(records[0].hit_group(), 3);
        assert!(records[0].is_visible());
    }

    #[test]
    fn oversized_hit_group_is_invisible() {
        let device = Device::new(DeviceDesc::default());
        let config = Config::default();
        let mut commands = CommandManager::new(&device, QueueKind::Compute, &config).unwrap();
        let blas = BlasManager::new(&config);

        let vertices = device
            .new_buffer(BufferDesc {
                size: 36,
                usage: BufferUsage::VERTEX,
                memory: Memory::Upload,
                name: "vertices",
            })
            .unwrap();
        blas.add_geometry(
            BlasKey(7),
            GeometryBatch::triangles(&vertices, 3, VertexFormat::Float32x3),
        );
        blas.generate(&mut commands).unwrap();

        let mut instance = Instance::new(InstanceId(1), BlasKey(7), Transform::IDENTITY);
        instance.hit_group = Some(1 << 24);

        let mut descriptor = InstanceDescriptor::new("instances");
        descriptor.fill(&device, &blas, &[instance]).unwrap();

        let records = descriptor.records();
        assert!(!records[0].is_visible());
        assert_eq!(records[0].hit_group(), 0);
    }

    #[test]
    fn shrinking_clears_stale_records() {
        let device = Device::new(DeviceDesc::default());
        let blas = BlasManager::new(&Config::default());
        let mut descriptor = InstanceDescriptor::new("instances");

        let instances: Vec<_> = (0..4)
            .map(|id| {
                let transform = Transform::translation(id as f32, 0.0, 0.0);
                Instance::new(InstanceId(id), BlasKey(id), transform)
            })
            .collect();
        descriptor.fill(&device, &blas, &instances).unwrap();
        assert_eq!(descriptor.capacity(), 4);
        let buffer = descriptor.buffer().cloned().unwrap();

        descriptor.fill(&device, &blas, &instances[..1]).unwrap();
        assert_eq!(descriptor.count(), 1);
        assert_eq!(descriptor.buffer(), Some(&buffer));

        let tail = buffer.read(TlasInstanceDesc::SIZE..4 * TlasInstanceDesc::SIZE);
        assert!(tail.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn grows_when_too_small() {
        let device = Device::new(DeviceDesc::default());
        let blas = BlasManager::new(&Config::default());
        let mut descriptor = InstanceDescriptor::new("instances");

        let instances: Vec<_> = (0..3)
            .map(|id| Instance::new(InstanceId(id), BlasKey(0), Transform::IDENTITY))
            .collect();
        descriptor.fill(&device, &blas, &instances[..1]).unwrap();
        assert_eq!(descriptor.capacity(), 1);

        descriptor.fill(&device, &blas, &instances).unwrap();
        assert_eq!(descriptor.capacity(), 3);
        assert_eq!(descriptor.records().len(), 3);
    }
}
