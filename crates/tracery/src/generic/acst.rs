use super::{BufferSlice, IndexFormat, VertexFormat};

/// Memory requirements of an acceleration structure build
/// as reported by the device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AccelerationStructureSizes {
    /// Worst-case size of the built structure.
    pub size: usize,

    /// Scratch memory required for a full build.
    pub scratch_size: usize,

    /// Scratch memory required for an update build.
    pub update_scratch_size: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccelerationStructurePerformance {
    Default,
    FastTrace,
    FastBuild,
}

bitflags::bitflags! {
    /// These flags are used to specify the build properties of an acceleration structure.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct AccelerationStructureBuildFlags: u32 {
        /// Specifies that built acceleration structure could be used as a source
        /// for build with update operation.
        const ALLOW_UPDATE = 0x1;

        /// Specifies that built acceleration structure could be used as a source
        /// for copy operation with `Compact` mode.
        const ALLOW_COMPACTION = 0x2;

        /// Build refits previously built structure in place
        /// instead of building it from scratch.
        /// Source structure must have been built with `ALLOW_UPDATE`.
        const PERFORM_UPDATE = 0x4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasTriangles<'a> {
    pub opaque: bool,
    pub vertices: BufferSlice<'a>,
    pub vertex_count: u32,
    pub vertex_stride: usize,
    pub vertex_format: VertexFormat,
    pub indices: Option<(BufferSlice<'a>, IndexFormat)>,
    pub index_count: u32,
}

impl BlasTriangles<'_> {
    /// Number of triangles described by this geometry.
    pub fn primitive_count(&self) -> u32 {
        match self.indices {
            Some(_) => self.index_count / 3,
            None => self.vertex_count / 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlasGeometryDesc<'a> {
    Triangles(BlasTriangles<'a>),
}

impl BlasGeometryDesc<'_> {
    pub fn primitive_count(&self) -> u32 {
        match self {
            BlasGeometryDesc::Triangles(triangles) => triangles.primitive_count(),
        }
    }
}

/// Description of a bottom-level acceleration structure build.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlasBuildDesc<'a> {
    pub performance: AccelerationStructurePerformance,
    pub flags: AccelerationStructureBuildFlags,
    pub geometry: &'a [BlasGeometryDesc<'a>],
}

impl BlasBuildDesc<'_> {
    pub fn primitive_count(&self) -> u64 {
        self.geometry
            .iter()
            .map(|g| u64::from(g.primitive_count()))
            .sum()
    }
}

/// Description of a top-level acceleration structure build.
/// Instances are read from a buffer of packed [`TlasInstanceDesc`] records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TlasBuildDesc<'a> {
    pub performance: AccelerationStructurePerformance,
    pub flags: AccelerationStructureBuildFlags,
    pub instances: BufferSlice<'a>,
    pub count: u32,
}

/// Row-major 3x4 affine transform.
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(transparent)]
pub struct Transform(pub [[f32; 4]; 3]);

impl Transform {
    pub const IDENTITY: Self = Transform([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
    ]);

    pub const fn translation(x: f32, y: f32, z: f32) -> Self {
        Transform([[1.0, 0.0, 0.0, x], [0.0, 1.0, 0.0, y], [0.0, 0.0, 1.0, z]])
    }
}

impl Default for Transform {
    fn default() -> Self {
        Transform::IDENTITY
    }
}

impl From<na::Matrix4<f32>> for Transform {
    fn from(m: na::Matrix4<f32>) -> Self {
        let mut rows = [[0.0; 4]; 3];
        for (r, row) in rows.iter_mut().enumerate() {
            for (c, v) in row.iter_mut().enumerate() {
                *v = m[(r, c)];
            }
        }
        Transform(rows)
    }
}

impl From<na::Affine3<f32>> for Transform {
    fn from(affine: na::Affine3<f32>) -> Self {
        Transform::from(affine.to_homogeneous())
    }
}

impl From<na::Isometry3<f32>> for Transform {
    fn from(iso: na::Isometry3<f32>) -> Self {
        Transform::from(iso.to_homogeneous())
    }
}

bitflags::bitflags! {
    /// Per-instance flags stored in the upper byte of the hit-group word.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct TlasInstanceFlags: u8 {
        const TRIANGLE_CULL_DISABLE = 0x1;
        const TRIANGLE_FRONT_COUNTERCLOCKWISE = 0x2;
        const FORCE_OPAQUE = 0x4;
        const FORCE_NO_OPAQUE = 0x8;
    }
}

/// Packed instance record read by top-level builds.
/// Layout matches what hardware expects: 64 bytes per instance.
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
#[repr(C)]
pub struct TlasInstanceDesc {
    pub transform: Transform,

    /// Low 24 bits - custom index, high 8 bits - visibility mask.
    pub custom_index_and_mask: u32,

    /// Low 24 bits - hit group offset, high 8 bits - [`TlasInstanceFlags`].
    pub hit_group_and_flags: u32,

    /// Device address of the bottom-level structure, zero if none.
    pub blas_address: u64,
}

const _: () = assert!(std::mem::size_of::<TlasInstanceDesc>() == 64);

impl TlasInstanceDesc {
    pub const SIZE: usize = std::mem::size_of::<TlasInstanceDesc>();

    /// Largest custom index or hit group offset a record can hold.
    pub const MAX_INDEX: u32 = 0xff_ffff;

    /// Largest number of instances a top-level build can index.
    pub const MAX_INSTANCES: usize = Self::MAX_INDEX as usize + 1;

    pub fn new(
        transform: Transform,
        custom_index: u32,
        mask: u8,
        hit_group: u32,
        flags: TlasInstanceFlags,
        blas_address: u64,
    ) -> Self {
        debug_assert!(custom_index <= Self::MAX_INDEX, "custom index must fit 24 bits");
        debug_assert!(hit_group <= Self::MAX_INDEX, "hit group must fit 24 bits");

        TlasInstanceDesc {
            transform,
            custom_index_and_mask: (custom_index & Self::MAX_INDEX) | (u32::from(mask) << 24),
            hit_group_and_flags: (hit_group & Self::MAX_INDEX) | (u32::from(flags.bits()) << 24),
            blas_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & Self::MAX_INDEX
    }

    pub fn mask(&self) -> u8 {
        (self.custom_index_and_mask >> 24) as u8
    }

    pub fn hit_group(&self) -> u32 {
        self.hit_group_and_flags & Self::MAX_INDEX
    }

    pub fn flags(&self) -> TlasInstanceFlags {
        TlasInstanceFlags::from_bits_truncate((self.hit_group_and_flags >> 24) as u8)
    }

    /// Returns `true` if rays can hit this instance.
    pub fn is_visible(&self) -> bool {
        self.blas_address != 0 && self.mask() != 0
    }
}
