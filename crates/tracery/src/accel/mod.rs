//! Two-level ray-tracing acceleration structures.
//!
//! [`BlasManager`] keeps one bottom-level structure per geometry key
//! and rebuilds dirty ones a limited number per frame.
//! [`TlasManager`] collects the frame's instances and rebuilds
//! the top-level structure of the current frame slot.

mod blas;
mod instance;
mod tlas;

pub use self::{
    blas::{Blas, BlasKey, BlasManager, GeometryBatch, GeometryKind, IndexData},
    instance::{Instance, InstanceDescriptor, InstanceId},
    tlas::{Tlas, TlasManager},
};
