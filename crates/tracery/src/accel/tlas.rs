use std::fmt;

use hashbrown::HashMap;
use smallvec::SmallVec;

use crate::{
    backend::{Buffer, Timeline},
    command::{Action, CommandManager, SubmitOp, TlasBuild},
    config::Config,
    fence::FenceValue,
    generic::{
        AccelerationStructureBuildFlags, AccelerationStructurePerformance, BufferDesc,
        BufferUsage, DeviceError, Memory, PipelineStages, QueueKind, TlasBuildDesc,
        TlasInstanceDesc, Transform,
    },
    resource::{Resource, ResourceState},
    scratch::{ScratchBuffer, WaitPolicy},
};

use super::{BlasKey, BlasManager, Instance, InstanceDescriptor, InstanceId};

/// Top-level acceleration structure of one frame slot.
pub struct Tlas {
    slot: usize,
    descriptor: InstanceDescriptor,
    result: Resource<Buffer>,
    last_build: Option<FenceValue>,
    instance_count: u32,
    max_instances: usize,
}

impl fmt::Debug for Tlas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tlas")
            .field("slot", &self.slot)
            .field("state", &self.result.state())
            .field("instance_count", &self.instance_count)
            .field("last_build", &self.last_build)
            .finish()
    }
}

impl Tlas {
    pub fn new(slot: usize) -> Self {
        Tlas {
            slot,
            descriptor: InstanceDescriptor::new(&format!("tlas-instances-{slot}")),
            result: Resource::new(),
            last_build: None,
            instance_count: 0,
            max_instances: TlasInstanceDesc::MAX_INSTANCES,
        }
    }

    /// Lowers the number of instances a build accepts.
    pub fn with_instance_limit(mut self, limit: usize) -> Self {
        self.max_instances = limit.min(TlasInstanceDesc::MAX_INSTANCES);
        self
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn state(&self) -> ResourceState {
        self.result.state()
    }

    /// Returns `true` if the structure was built and can be traced
    /// once [`last_build`](Tlas::last_build) is reached.
    pub fn is_ready(&self) -> bool {
        self.result.is_ready() && self.instance_count > 0
    }

    pub fn result(&self) -> Option<&Buffer> {
        self.result.ready()
    }

    pub fn address(&self) -> Option<u64> {
        self.result().map(|buffer| buffer.address())
    }

    /// Number of instances in the last recorded build.
    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    /// Fence value ray dispatch must wait for before tracing.
    pub fn last_build(&self) -> Option<FenceValue> {
        self.last_build
    }

    /// Queue the last build was recorded into.
    pub fn queue(&self) -> Option<QueueKind> {
        self.last_build.map(|value| value.queue())
    }

    pub fn descriptor(&self) -> &InstanceDescriptor {
        &self.descriptor
    }

    /// Instance records as written for the last build.
    pub fn records(&self) -> Vec<TlasInstanceDesc> {
        self.descriptor.records()
    }

    /// Records a full rebuild over `instances`.
    ///
    /// Returns `false` without touching any resource if there are no instances
    /// or too many of them, the previous build of this slot is still running,
    /// `commands` belong to another queue than that build,
    /// or memory for the build can't be found this frame.
    ///
    /// Bottom-level structures built on other queues are waited for
    /// before the build executes.
    pub fn update_resources(
        &mut self,
        commands: &mut CommandManager,
        blas: &BlasManager,
        instances: &[Instance],
        scratch: &mut ScratchBuffer,
    ) -> Result<bool, DeviceError> {
        if instances.is_empty() {
            return Ok(false);
        }

        if let Some(last_build) = self.last_build {
            if last_build.queue() != commands.kind() {
                tracing::warn!(
                    "TLAS of slot {} was built on {} queue, refusing {} build",
                    self.slot,
                    last_build.queue(),
                    commands.kind()
                );
                return Ok(false);
            }
            if !commands.fence().is_complete(last_build) {
                tracing::trace!("TLAS of slot {} waits for {last_build}", self.slot);
                return Ok(false);
            }
        }

        if instances.len() > self.max_instances {
            tracing::warn!(
                "TLAS of slot {} can't hold {} instances, limit is {}",
                self.slot,
                instances.len(),
                self.max_instances
            );
            return Ok(false);
        }
        let count = instances.len() as u32;

        // Everything that can fail is acquired before the descriptor is rewritten.
        let staged = self.descriptor.stage(commands.device(), instances.len());
        let instance_buffer = match staged {
            Ok(buffer) => buffer,
            Err(err) => {
                tracing::warn!(
                    "Failed to allocate instances of TLAS slot {}: {err}",
                    self.slot
                );
                return Ok(false);
            }
        };

        let performance = AccelerationStructurePerformance::FastTrace;
        let flags = AccelerationStructureBuildFlags::empty();
        let sizes = commands.device().tlas_sizes(&TlasBuildDesc {
            performance,
            flags,
            instances: instance_buffer.slice(..),
            count,
        });

        // Never refitted. Every build gets a fresh result buffer.
        let allocated = commands.device().new_buffer(BufferDesc {
            size: sizes.size,
            usage: BufferUsage::ACCELERATION_STRUCTURE,
            memory: Memory::Device,
            name: &format!("tlas-{}", self.slot),
        });
        let dst = match allocated {
            Ok(buffer) => buffer,
            Err(err) => {
                tracing::warn!("Failed to allocate TLAS of slot {}: {err}", self.slot);
                return Ok(false);
            }
        };

        let Some(scratch) =
            scratch.request_space(commands, sizes.scratch_size, WaitPolicy::Overlap)?
        else {
            tracing::trace!("TLAS of slot {} waits for scratch space", self.slot);
            return Ok(false);
        };

        let mut dependencies: SmallVec<[(Timeline, FenceValue); 2]> = SmallVec::new();
        {
            let registry = blas.read();
            self.descriptor.write(instance_buffer.clone(), &registry, instances)?;

            let kind = commands.kind();
            for instance in instances {
                let Some(structure) = registry.get(instance.blas) else {
                    continue;
                };
                if !structure.is_ready() {
                    continue;
                }
                let Some((timeline, value)) = structure.build_dependency() else {
                    continue;
                };
                if value.queue() == kind {
                    continue;
                }

                // One wait per queue, for the latest build on it.
                let same_queue = dependencies
                    .iter_mut()
                    .find(|(_, dep)| dep.queue() == value.queue());
                match same_queue {
                    Some((_, dep)) if dep.value() < value.value() => *dep = value,
                    Some(_) => {}
                    None => dependencies.push((timeline, value)),
                }
            }
        }

        self.result.allocate(|| Ok(dst.clone()))?;

        let list = commands.current_list()?;
        for (timeline, value) in dependencies {
            tracing::trace!(
                "TLAS of slot {} waits for BLAS builds up to {value}",
                self.slot
            );
            list.add_pre_submit(SubmitOp::Wait { timeline, value });
        }
        list.record(Action::BuildTlas(TlasBuild {
            dst,
            instances: instance_buffer,
            count,
            performance,
            flags,
            scratch,
        }));
        list.barrier(
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
            PipelineStages::RAY_TRACING_SHADER,
        );

        let value = commands.insert_fence_signal()?;
        self.last_build = Some(value);
        self.instance_count = count;

        tracing::debug!(
            "TLAS of slot {} rebuilt with {count} instances, done at {value}",
            self.slot
        );
        Ok(true)
    }
}

fn hit_group_fits(hit_group: u32) -> bool {
    if hit_group > TlasInstanceDesc::MAX_INDEX {
        tracing::warn!("Hit group {hit_group} does not fit 24 bits");
        return false;
    }
    true
}

#[derive(Default)]
struct FrameInstances {
    list: Vec<Instance>,
    index: HashMap<InstanceId, usize>,
}

impl FrameInstances {
    fn clear(&mut self) {
        self.list.clear();
        self.index.clear();
    }

    fn get_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        let idx = *self.index.get(&id)?;
        Some(&mut self.list[idx])
    }

    fn insert(&mut self, instance: Instance) {
        match self.index.get(&instance.id) {
            Some(&idx) => self.list[idx] = instance,
            None => {
                self.index.insert(instance.id, self.list.len());
                self.list.push(instance);
            }
        }
    }
}

/// Collects the frame's instances and keeps one [`Tlas`] per frame in flight.
///
/// The structure of the current slot is rebuilt while the device
/// may still trace the structure of the previous one.
pub struct TlasManager {
    slots: Vec<Tlas>,
    frames: Vec<FrameInstances>,
    scratch: ScratchBuffer,
    current: usize,
}

impl fmt::Debug for TlasManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlasManager")
            .field("slots", &self.slots)
            .field("current", &self.current)
            .field("instances", &self.frames[self.current].list.len())
            .field("scratch", &self.scratch)
            .finish()
    }
}

impl TlasManager {
    pub fn new(config: &Config) -> Self {
        let frames = config.frames_in_flight.max(1);
        TlasManager {
            slots: (0..frames)
                .map(|slot| Tlas::new(slot).with_instance_limit(config.max_tlas_instances))
                .collect(),
            frames: (0..frames).map(|_| FrameInstances::default()).collect(),
            scratch: ScratchBuffer::new("tlas-scratch", config.tlas_scratch_size),
            current: 0,
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current_slot(&self) -> usize {
        self.current
    }

    /// Switches to frame slot and starts its instance list from scratch.
    pub fn begin_frame(&mut self, slot: usize) {
        self.current = slot % self.slots.len();
        self.frames[self.current].clear();
    }

    /// Places `blas` with `transform`.
    ///
    /// Instance already added this frame is moved instead of duplicated.
    pub fn add_instance(&mut self, id: InstanceId, blas: BlasKey, transform: Transform) {
        let frame = &mut self.frames[self.current];
        match frame.get_mut(id) {
            Some(instance) => {
                instance.blas = blas;
                instance.transform = transform;
            }
            None => frame.insert(Instance::new(id, blas, transform)),
        }
    }

    /// Adds or replaces instance with all of its properties.
    /// Returns `false` if its hit group does not fit an instance record.
    pub fn add_instance_desc(&mut self, instance: Instance) -> bool {
        if let Some(hit_group) = instance.hit_group {
            if !hit_group_fits(hit_group) {
                return false;
            }
        }
        self.frames[self.current].insert(instance);
        true
    }

    /// Resolves hit group of instance added this frame.
    ///
    /// Returns `false` if there is no such instance
    /// or the hit group does not fit an instance record.
    pub fn set_hit_group(&mut self, id: InstanceId, hit_group: u32) -> bool {
        if !hit_group_fits(hit_group) {
            return false;
        }
        match self.frames[self.current].get_mut(id) {
            Some(instance) => {
                instance.hit_group = Some(hit_group);
                true
            }
            None => false,
        }
    }

    /// Instances added to the current frame.
    pub fn instances(&self) -> &[Instance] {
        &self.frames[self.current].list
    }

    pub fn instance_count(&self) -> usize {
        self.instances().len()
    }

    /// Rebuilds the structure of the current slot.
    pub fn generate(
        &mut self,
        commands: &mut CommandManager,
        blas: &BlasManager,
    ) -> Result<bool, DeviceError> {
        let instances = &self.frames[self.current].list;
        self.slots[self.current].update_resources(commands, blas, instances, &mut self.scratch)
    }

    /// Structure of the current frame slot.
    pub fn current(&self) -> &Tlas {
        &self.slots[self.current]
    }

    pub fn slot(&self, slot: usize) -> Option<&Tlas> {
        self.slots.get(slot)
    }

    pub fn is_ready(&self) -> bool {
        self.current().is_ready()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        accel::GeometryBatch,
        backend::{Device, DeviceDesc},
        generic::{QueueKind, VertexFormat},
    };

    use super::*;

    struct Scene {
        device: Device,
        commands: CommandManager,
        blas: BlasManager,
        tlas: TlasManager,
    }

    fn scene() -> Scene {
        scene_on(Device::new(DeviceDesc::default()))
    }

    fn scene_on(device: Device) -> Scene {
        let config = Config::default();
        let commands = CommandManager::new(&device, QueueKind::Compute, &config).unwrap();
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
            BlasKey(1),
            GeometryBatch::triangles(&vertices, 3, VertexFormat::Float32x3),
        );

        Scene {
            device,
            commands,
            blas,
            tlas: TlasManager::new(&config),
        }
    }

    #[test]
    fn no_instances_no_build() {
        let mut scene = scene();
        let mut scratch = ScratchBuffer::new("scratch", 1 << 16);
        let mut tlas = Tlas::new(0);

        let recorded = scene.commands.outstanding();
        assert!(!tlas
            .update_resources(&mut scene.commands, &scene.blas, &[], &mut scratch)
            .unwrap());
        assert_eq!(tlas.state(), ResourceState::Unallocated);
        assert_eq!(tlas.descriptor().state(), ResourceState::Unallocated);
        assert_eq!(scratch.state(), ResourceState::Unallocated);
        assert_eq!(scene.commands.outstanding(), recorded);
        assert_eq!(scene.device.allocated(), 36);
    }

    #[test]
    fn readding_moves_instance() {
        let mut scene = scene();
        scene.tlas.begin_frame(0);
        scene.tlas.add_instance(InstanceId(5), BlasKey(1), Transform::translation(0.0, 0.0, 0.0));
        scene.tlas.add_instance(InstanceId(5), BlasKey(1), Transform::translation(0.0, 2.0, 0.0));
        assert_eq!(scene.tlas.instance_count(), 1);
        assert_eq!(
            scene.tlas.instances()[0].transform,
            Transform::translation(0.0, 2.0, 0.0)
        );
        assert_eq!(scene.tlas.instances()[0].hit_group, None);

        assert!(scene.tlas.set_hit_group(InstanceId(5), 2));
        assert!(!scene.tlas.set_hit_group(InstanceId(6), 2));
        assert_eq!(scene.tlas.instances()[0].hit_group, Some(2));
    }

    #[test]
    fn always_rebuilds_into_fresh_buffer() {
        let mut scene = scene();
        scene.blas.generate(&mut scene.commands).unwrap();

        scene.tlas.begin_frame(0);
        scene.tlas.add_instance(InstanceId(1), BlasKey(1), Transform::IDENTITY);
        assert!(scene.tlas.generate(&mut scene.commands, &scene.blas).unwrap());
        let first = scene.tlas.current().result().cloned().unwrap();
        let last = scene.tlas.current().last_build().unwrap();

        // Same slot again before the build finished.
        assert!(!scene.tlas.generate(&mut scene.commands, &scene.blas).unwrap());

        scene.commands.execute().unwrap();
        assert!(scene.commands.fence().wait(last, None));
        let header = first.build_header().unwrap();
        assert_eq!(header.primitives, 1);
        assert_eq!(header.visible, 1);

        assert!(scene.tlas.generate(&mut scene.commands, &scene.blas).unwrap());
        assert_ne!(scene.tlas.current().result(), Some(&first));
    }

    #[test]
    fn frame_slots_are_independent() {
        let mut scene = scene();
        scene.blas.generate(&mut scene.commands).unwrap();

        scene.tlas.begin_frame(0);
        scene.tlas.add_instance(InstanceId(1), BlasKey(1), Transform::IDENTITY);
        assert!(scene.tlas.generate(&mut scene.commands, &scene.blas).unwrap());

        // Previous slot's build is still pending.
        scene.tlas.begin_frame(1);
        assert_eq!(scene.tlas.instance_count(), 0);
        scene.tlas.add_instance(InstanceId(1), BlasKey(1), Transform::translation(1.0, 0.0, 0.0));
        assert!(scene.tlas.generate(&mut scene.commands, &scene.blas).unwrap());

        assert_eq!(scene.tlas.slot(0).unwrap().instance_count(), 1);
        assert_eq!(scene.tlas.slot(1).unwrap().instance_count(), 1);
        assert_ne!(
            scene.tlas.slot(0).unwrap().address(),
            scene.tlas.slot(1).unwrap().address()
        );
    }

    #[test]
    fn missing_blas_is_traced_as_empty() {
        let mut scene = scene();
        scene.tlas.begin_frame(0);
        scene.tlas.add_instance(InstanceId(1), BlasKey(404), Transform::IDENTITY);
        assert!(scene.tlas.generate(&mut scene.commands, &scene.blas).unwrap());

        let last = scene.tlas.current().last_build().unwrap();
        scene.commands.execute().unwrap();
        assert!(scene.commands.fence().wait(last, None));

        let records = scene.tlas.current().records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].blas_address, 0);
        assert_eq!(records[0].mask(), 0);

        let header = scene.tlas.current().result().unwrap().build_header().unwrap();
        assert_eq!(header.visible, 0);
    }

    #[test]
    fn waits_for_blas_built_on_another_queue() {
        let mut scene = scene();
        let mut direct =
            CommandManager::new(&scene.device, QueueKind::Direct, &Config::default()).unwrap();
        scene.blas.generate(&mut scene.commands).unwrap();

        scene.tlas.begin_frame(0);
        scene.tlas.add_instance(InstanceId(1), BlasKey(1), Transform::IDENTITY);
        assert!(scene.tlas.generate(&mut direct, &scene.blas).unwrap());
        assert!(matches!(
            direct.current_list().unwrap().pre_submit(),
            [SubmitOp::Wait { value, .. }] if value.queue() == QueueKind::Compute
        ));

        let last = scene.tlas.current().last_build().unwrap();
        direct.execute().unwrap();
        assert!(!direct.fence().wait(last, Some(Duration::from_millis(50))));

        scene.commands.execute().unwrap();
        assert!(direct.fence().wait(last, None));
        let header = scene.tlas.current().result().unwrap().build_header().unwrap();
        assert_eq!(header.visible, 1);
    }

    #[test]
    fn rebuild_on_foreign_queue_is_refused() {
        let mut scene = scene();
        let mut direct =
            CommandManager::new(&scene.device, QueueKind::Direct, &Config::default()).unwrap();
        let mut scratch = ScratchBuffer::new("scratch", 1 << 16);
        let mut tlas = Tlas::new(0);
        let instances = [Instance::new(InstanceId(1), BlasKey(1), Transform::IDENTITY)];

        assert!(tlas
            .update_resources(&mut scene.commands, &scene.blas, &instances, &mut scratch)
            .unwrap());
        assert_eq!(tlas.queue(), Some(QueueKind::Compute));
        let last = tlas.last_build().unwrap();
        scene.commands.execute().unwrap();
        assert!(scene.commands.fence().wait(last, None));

        assert!(!tlas
            .update_resources(&mut direct, &scene.blas, &instances, &mut scratch)
            .unwrap());
        assert_eq!(tlas.last_build(), Some(last));
        assert_eq!(direct.outstanding(), 0);
    }

    #[test]
    fn hit_group_must_fit_record() {
        let mut scene = scene();
        scene.tlas.begin_frame(0);
        scene.tlas.add_instance(InstanceId(1), BlasKey(1), Transform::IDENTITY);

        assert!(!scene.tlas.set_hit_group(InstanceId(1), 1 << 24));
        assert_eq!(scene.tlas.instances()[0].hit_group, None);
        assert!(scene.tlas.set_hit_group(InstanceId(1), TlasInstanceDesc::MAX_INDEX));

        let mut instance = Instance::new(InstanceId(2), BlasKey(1), Transform::IDENTITY);
        instance.hit_group = Some(u32::MAX);
        assert!(!scene.tlas.add_instance_desc(instance));
        assert_eq!(scene.tlas.instance_count(), 1);
    }

    #[test]
    fn too_many_instances_are_refused() {
        let mut scene = scene();
        let mut scratch = ScratchBuffer::new("scratch", 1 << 16);
        let mut tlas = Tlas::new(0).with_instance_limit(2);
        let instances: Vec<_> = (0..3)
            .map(|id| Instance::new(InstanceId(id), BlasKey(1), Transform::IDENTITY))
            .collect();

        assert!(!tlas
            .update_resources(&mut scene.commands, &scene.blas, &instances, &mut scratch)
            .unwrap());
        assert_eq!(tlas.state(), ResourceState::Unallocated);
        assert_eq!(tlas.descriptor().state(), ResourceState::Unallocated);
        assert_eq!(scene.commands.outstanding(), 0);
        assert_eq!(scene.device.allocated(), 36);

        assert!(tlas
            .update_resources(&mut scene.commands, &scene.blas, &instances[..2], &mut scratch)
            .unwrap());
    }

    #[test]
    fn allocation_failure_has_no_side_effects() {
        // Room for the vertices and one instance record, not for the structure.
        let device = Device::new(DeviceDesc {
            memory_budget: 36 + TlasInstanceDesc::SIZE + 64,
            ..DeviceDesc::default()
        });
        let mut scene = scene_on(device);
        let mut scratch = ScratchBuffer::new("scratch", 1 << 16);
        let mut tlas = Tlas::new(0);
        let instances = [Instance::new(InstanceId(1), BlasKey(1), Transform::IDENTITY)];

        assert!(!tlas
            .update_resources(&mut scene.commands, &scene.blas, &instances, &mut scratch)
            .unwrap());
        assert_eq!(tlas.state(), ResourceState::Unallocated);
        assert_eq!(tlas.descriptor().state(), ResourceState::Unallocated);
        assert_eq!(tlas.descriptor().count(), 0);
        assert_eq!(scratch.state(), ResourceState::Unallocated);
        assert_eq!(scratch.cursor(), 0);
        assert_eq!(scene.commands.outstanding(), 0);
        assert_eq!(scene.commands.fence().pending().value(), 0);
        assert_eq!(scene.device.allocated(), 36);
    }
}
