use std::fmt;

use hashbrown::HashMap;
use parking_lot::{RwLock, RwLockReadGuard};
use slab::Slab;
use smallvec::SmallVec;

use crate::{
    backend::{Buffer, Timeline},
    command::{Action, BlasBuild, CommandManager},
    config::Config,
    fence::FenceValue,
    generic::{
        AccelerationStructureBuildFlags, AccelerationStructurePerformance, BlasBuildDesc,
        BlasGeometryDesc, BlasTriangles, BufferDesc, BufferUsage, DeviceError, IndexFormat,
        Memory, PipelineStages, QueueKind, VertexFormat,
    },
    resource::{Resource, ResourceState},
    scratch::{ScratchBuffer, WaitPolicy},
};

/// Stable identifier of a bottom-level structure,
/// usually derived from the surface or entity it is built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlasKey(pub u64);

impl fmt::Display for BlasKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum GeometryKind {
    /// Built once and traced many times.
    Static,

    /// Skinned or otherwise deforming geometry, refitted in place.
    Dynamic,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IndexData {
    pub buffer: Buffer,
    pub offset: usize,
    pub count: u32,
    pub format: IndexFormat,
}

/// Triangle geometry appended to a bottom-level structure.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct GeometryBatch {
    pub vertices: Buffer,
    pub vertex_offset: usize,
    pub vertex_count: u32,
    pub vertex_stride: usize,
    pub vertex_format: VertexFormat,
    pub indices: Option<IndexData>,
    pub opaque: bool,
}

impl GeometryBatch {
    /// Non-indexed opaque triangles tightly packed from the start of `vertices`.
    pub fn triangles(vertices: &Buffer, vertex_count: u32, vertex_format: VertexFormat) -> Self {
        GeometryBatch {
            vertices: vertices.clone(),
            vertex_offset: 0,
            vertex_count,
            vertex_stride: vertex_format.size(),
            vertex_format,
            indices: None,
            opaque: true,
        }
    }

    pub fn with_indices(
        mut self,
        buffer: &Buffer,
        offset: usize,
        count: u32,
        format: IndexFormat,
    ) -> Self {
        self.indices = Some(IndexData {
            buffer: buffer.clone(),
            offset,
            count,
            format,
        });
        self
    }

    pub fn desc(&self) -> BlasGeometryDesc<'_> {
        let vertex_bytes = self.vertex_count as usize * self.vertex_stride;

        BlasGeometryDesc::Triangles(BlasTriangles {
            opaque: self.opaque,
            vertices: self
                .vertices
                .slice(self.vertex_offset..self.vertex_offset + vertex_bytes),
            vertex_count: self.vertex_count,
            vertex_stride: self.vertex_stride,
            vertex_format: self.vertex_format,
            indices: self.indices.as_ref().map(|indices| {
                let bytes = indices.count as usize * indices.format.size();
                (
                    indices.buffer.slice(indices.offset..indices.offset + bytes),
                    indices.format,
                )
            }),
            index_count: self.indices.as_ref().map_or(0, |indices| indices.count),
        })
    }

    pub fn primitive_count(&self) -> u32 {
        self.desc().primitive_count()
    }
}

enum Target {
    Refit(Buffer),
    Build(Buffer),
}

/// Bottom-level acceleration structure over an ordered list of geometry batches.
pub struct Blas {
    key: BlasKey,
    kind: GeometryKind,
    geometry: Vec<GeometryBatch>,
    result: Resource<Buffer>,

    // Whether `result` holds a structure usable as an update source.
    built: bool,

    last_build: Option<FenceValue>,

    // Timeline of the queue `last_build` belongs to.
    build_timeline: Option<Timeline>,
}

impl fmt::Debug for Blas {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blas")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("state", &self.result.state())
            .field("geometry", &self.geometry.len())
            .field("last_build", &self.last_build)
            .finish()
    }
}

impl Blas {
    pub fn new(key: BlasKey, kind: GeometryKind) -> Self {
        Blas {
            key,
            kind,
            geometry: Vec::new(),
            result: Resource::new(),
            built: false,
            last_build: None,
            build_timeline: None,
        }
    }

    pub fn key(&self) -> BlasKey {
        self.key
    }

    pub fn kind(&self) -> GeometryKind {
        self.kind
    }

    pub fn state(&self) -> ResourceState {
        self.result.state()
    }

    pub fn is_ready(&self) -> bool {
        self.result.is_ready()
    }

    pub fn geometry(&self) -> &[GeometryBatch] {
        &self.geometry
    }

    /// Buffer holding the built structure.
    pub fn result(&self) -> Option<&Buffer> {
        self.result.get()
    }

    /// Device address of the structure if it is ready to be traced.
    pub fn address(&self) -> Option<u64> {
        self.result.ready().map(|buffer| buffer.address())
    }

    /// Fence value signaled when the last recorded build completes.
    pub fn last_build(&self) -> Option<FenceValue> {
        self.last_build
    }

    pub fn primitive_count(&self) -> u64 {
        self.geometry
            .iter()
            .map(|batch| u64::from(batch.primitive_count()))
            .sum()
    }

    /// Appends geometry.
    /// Structure that was built becomes dirty.
    pub fn add_geometry(&mut self, batch: GeometryBatch) {
        self.geometry.push(batch);
        self.result.mark_dirty();
    }

    /// Marks built structure as requiring a rebuild,
    /// e.g. after skinning moved its vertices.
    pub fn invalidate(&mut self) {
        self.result.mark_dirty();
    }

    pub fn release(&mut self) -> Option<Buffer> {
        self.built = false;
        self.result.release()
    }

    /// Timeline and value another queue waits on before using the structure.
    /// `None` if it was never built or its fence has no timeline.
    pub fn build_dependency(&self) -> Option<(Timeline, FenceValue)> {
        Some((self.build_timeline.clone()?, self.last_build?))
    }

    /// Queue the last build was recorded into.
    pub fn queue(&self) -> Option<QueueKind> {
        self.last_build.map(|value| value.queue())
    }

    /// Records a build of this structure unless it is already current.
    ///
    /// Returns `false` if the build can't be recorded right now:
    /// previous build is still running, scratch ring is full,
    /// there is no geometry or memory allocation failed.
    /// Nothing is recorded or reserved in that case.
    ///
    /// Structure stays bound to the queue of its first build,
    /// `commands` of another queue are refused.
    pub fn generate(
        &mut self,
        commands: &mut CommandManager,
        scratch: &mut ScratchBuffer,
    ) -> Result<bool, DeviceError> {
        if self.result.is_ready() {
            return Ok(true);
        }

        if let Some(last_build) = self.last_build {
            if last_build.queue() != commands.kind() {
                tracing::warn!(
                    "BLAS {} was built on {} queue, refusing {} build",
                    self.key,
                    last_build.queue(),
                    commands.kind()
                );
                return Ok(false);
            }
            if !commands.fence().is_complete(last_build) {
                tracing::trace!("BLAS {} waits for {last_build}", self.key);
                return Ok(false);
            }
        }

        if self.geometry.is_empty() {
            return Ok(false);
        }

        let (performance, mut flags) = match self.kind {
            GeometryKind::Static => (
                AccelerationStructurePerformance::FastTrace,
                AccelerationStructureBuildFlags::empty(),
            ),
            GeometryKind::Dynamic => (
                AccelerationStructurePerformance::FastBuild,
                AccelerationStructureBuildFlags::ALLOW_UPDATE,
            ),
        };

        let geometry: SmallVec<[BlasGeometryDesc; 4]> =
            self.geometry.iter().map(GeometryBatch::desc).collect();
        let sizes = commands.device().blas_sizes(&BlasBuildDesc {
            performance,
            flags,
            geometry: &geometry,
        });
        drop(geometry);

        // Refit in place when the existing structure can hold the new one.
        // Otherwise a new result is allocated before scratch is reserved,
        // so a failed allocation leaves the ring untouched.
        let refit = match self.result.get() {
            Some(buffer)
                if self.kind == GeometryKind::Dynamic
                    && self.built
                    && buffer.size() >= sizes.size =>
            {
                Some(buffer.clone())
            }
            _ => None,
        };

        let target = match refit {
            Some(buffer) => Target::Refit(buffer),
            None => {
                let allocated = commands.device().new_buffer(BufferDesc {
                    size: sizes.size,
                    usage: BufferUsage::ACCELERATION_STRUCTURE,
                    memory: Memory::Device,
                    name: &format!("blas-{}", self.key),
                });

                match allocated {
                    Ok(buffer) => Target::Build(buffer),
                    Err(err) => {
                        tracing::warn!("Failed to allocate BLAS {}: {err}", self.key);
                        self.result = Resource::new();
                        self.built = false;
                        return Ok(false);
                    }
                }
            }
        };
        let update = matches!(target, Target::Refit(_));

        let scratch_size = if update {
            flags |= AccelerationStructureBuildFlags::PERFORM_UPDATE;
            sizes.update_scratch_size
        } else {
            sizes.scratch_size
        };

        let Some(scratch) = scratch.request_space(commands, scratch_size, WaitPolicy::Overlap)?
        else {
            tracing::trace!("BLAS {} waits for scratch space", self.key);
            return Ok(false);
        };

        let (dst, src) = match target {
            Target::Refit(buffer) => {
                commands.current_list()?.barrier(
                    PipelineStages::ACCELERATION_STRUCTURE_BUILD
                        | PipelineStages::RAY_TRACING_SHADER,
                    PipelineStages::ACCELERATION_STRUCTURE_BUILD,
                );
                (buffer.clone(), Some(buffer))
            }
            Target::Build(buffer) => {
                self.result.allocate(|| Ok(buffer.clone()))?;
                (buffer, None)
            }
        };

        let list = commands.current_list()?;
        list.record(Action::BuildBlas(BlasBuild {
            dst,
            src,
            geometry: self.geometry.clone(),
            performance,
            flags,
            scratch,
        }));
        list.barrier(
            PipelineStages::ACCELERATION_STRUCTURE_BUILD,
            PipelineStages::ACCELERATION_STRUCTURE_BUILD | PipelineStages::RAY_TRACING_SHADER,
        );

        let value = commands.insert_fence_signal()?;
        self.last_build = Some(value);
        self.build_timeline = commands.fence().shared().cloned();
        self.built = true;
        self.result.mark_ready();

        tracing::debug!(
            "BLAS {} {} with {} primitives, done at {value}",
            self.key,
            if update { "refitted" } else { "built" },
            self.primitive_count()
        );
        Ok(true)
    }
}

pub(super) struct Registry {
    slots: Slab<Blas>,
    index: HashMap<BlasKey, usize>,
    scratch: ScratchBuffer,
}

impl Registry {
    pub fn get(&self, key: BlasKey) -> Option<&Blas> {
        self.index.get(&key).map(|&idx| &self.slots[idx])
    }

    pub fn address(&self, key: BlasKey) -> Option<u64> {
        self.get(key).and_then(Blas::address)
    }

    fn get_or_insert(&mut self, key: BlasKey, kind: GeometryKind) -> &mut Blas {
        let idx = match self.index.get(&key) {
            Some(&idx) => idx,
            None => {
                tracing::trace!("Registering {kind:?} BLAS {key}");
                let idx = self.slots.insert(Blas::new(key, kind));
                self.index.insert(key, idx);
                idx
            }
        };
        &mut self.slots[idx]
    }
}

/// Registry of bottom-level structures keyed by [`BlasKey`].
///
/// Queries take a shared lock and may run on other threads
/// while the render thread records builds.
pub struct BlasManager {
    registry: RwLock<Registry>,
    builds_per_frame: usize,
}

impl fmt::Debug for BlasManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.read();
        f.debug_struct("BlasManager")
            .field("len", &registry.slots.len())
            .field("scratch", &registry.scratch)
            .field("builds_per_frame", &self.builds_per_frame)
            .finish()
    }
}

impl BlasManager {
    pub fn new(config: &Config) -> Self {
        BlasManager {
            registry: RwLock::new(Registry {
                slots: Slab::new(),
                index: HashMap::new(),
                scratch: ScratchBuffer::new("blas-scratch", config.blas_scratch_size),
            }),
            builds_per_frame: config.blas_builds_per_frame,
        }
    }

    pub(super) fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.registry.read()
    }

    /// Registers structure for `key` unless it exists.
    /// Returns state of the entry.
    pub fn create_or_get(&self, key: BlasKey, kind: GeometryKind) -> ResourceState {
        let mut registry = self.registry.write();
        let blas = registry.get_or_insert(key, kind);
        if blas.kind != kind {
            tracing::debug!("BLAS {key} is {:?}, requested as {kind:?}", blas.kind);
        }
        blas.state()
    }

    /// Appends geometry to the structure, registering a static one if missing.
    pub fn add_geometry(&self, key: BlasKey, batch: GeometryBatch) {
        self.registry
            .write()
            .get_or_insert(key, GeometryKind::Static)
            .add_geometry(batch);
    }

    /// Marks structure for rebuild.
    /// Returns `false` if there is no structure for `key`.
    pub fn invalidate(&self, key: BlasKey) -> bool {
        let mut registry = self.registry.write();
        match registry.index.get(&key) {
            Some(&idx) => {
                registry.slots[idx].invalidate();
                true
            }
            None => false,
        }
    }

    /// Removes structure. Does nothing if there is none.
    pub fn remove(&self, key: BlasKey) -> bool {
        let mut registry = self.registry.write();
        match registry.index.remove(&key) {
            Some(idx) => {
                let mut blas = registry.slots.remove(idx);
                blas.release();
                tracing::trace!("BLAS {key} removed");
                true
            }
            None => false,
        }
    }

    /// Records builds of structures that are not ready,
    /// at most the configured number per call.
    ///
    /// Returns number of structures processed.
    pub fn generate(&self, commands: &mut CommandManager) -> Result<usize, DeviceError> {
        let mut registry = self.registry.write();
        let Registry { slots, scratch, .. } = &mut *registry;

        let mut processed = 0;
        let mut built = 0;
        for (_, blas) in slots.iter_mut() {
            if processed >= self.builds_per_frame {
                break;
            }
            if blas.is_ready() || blas.geometry.is_empty() {
                continue;
            }

            processed += 1;
            if blas.generate(commands, scratch)? {
                built += 1;
            }
        }

        if processed > 0 {
            tracing::debug!("Processed {processed} BLAS, {built} recorded");
        }
        Ok(processed)
    }

    pub fn contains(&self, key: BlasKey) -> bool {
        self.registry.read().index.contains_key(&key)
    }

    pub fn state(&self, key: BlasKey) -> Option<ResourceState> {
        self.registry.read().get(key).map(Blas::state)
    }

    /// Device address of a ready structure.
    pub fn address(&self, key: BlasKey) -> Option<u64> {
        self.registry.read().address(key)
    }

    pub fn last_build(&self, key: BlasKey) -> Option<FenceValue> {
        self.registry.read().get(key).and_then(Blas::last_build)
    }

    /// Buffer holding the built structure.
    pub fn result(&self, key: BlasKey) -> Option<Buffer> {
        self.registry.read().get(key).and_then(|blas| blas.result().cloned())
    }

    /// Number of structures with geometry that are not ready.
    pub fn pending(&self) -> usize {
        self.registry
            .read()
            .slots
            .iter()
            .filter(|(_, blas)| !blas.is_ready() && !blas.geometry.is_empty())
            .count()
    }

    pub fn len(&self) -> usize {
        self.registry.read().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
