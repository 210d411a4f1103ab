//! GPU work scheduling and ray-tracing acceleration structure lifecycle.
//!
//! Host code records work onto independent queues through [`CommandManager`]s
//! and learns about completion through [`Fence`]s.
//! [`BlasManager`] and [`TlasManager`] keep the two-level acceleration structure
//! current, throttling builds and sharing [`ScratchBuffer`] rings.
#![deny(unsafe_op_in_unsafe_fn)]

pub mod accel;
pub mod command;
pub mod config;
pub mod context;
pub mod fence;
pub mod generic;
pub mod resource;
pub mod scratch;
mod traits;

#[path = "soft/mod.rs"]
pub mod backend;

pub use self::{
    accel::{
        Blas, BlasKey, BlasManager, GeometryBatch, GeometryKind, IndexData, Instance,
        InstanceDescriptor, InstanceId, Tlas, TlasManager,
    },
    backend::*,
    command::{
        Action, BlasBuild, CommandList, CommandListState, CommandManager, CycleBlock, SubmitOp,
        TlasBuild,
    },
    config::{Config, ConfigError},
    context::{ContextError, RenderContext},
    fence::{Fence, FenceValue},
    generic::*,
    resource::{Resource, ResourceState},
    scratch::{ScratchAllocation, ScratchBuffer, WaitPolicy},
};
