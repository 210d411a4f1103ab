use std::fmt;

use smallvec::SmallVec;

use crate::{
    accel::GeometryBatch,
    backend::{Buffer, CommandEncoder, Timeline},
    fence::FenceValue,
    generic::{
        AccelerationStructureBuildFlags, AccelerationStructurePerformance, BlasBuildDesc,
        BlasGeometryDesc, PipelineStages, TlasBuildDesc,
    },
    scratch::ScratchAllocation,
};

/// Bottom-level build recorded into a command list.
pub struct BlasBuild {
    pub dst: Buffer,

    /// Structure to refit. Set only for update builds.
    pub src: Option<Buffer>,
    pub geometry: Vec<GeometryBatch>,
    pub performance: AccelerationStructurePerformance,
    pub flags: AccelerationStructureBuildFlags,
    pub scratch: ScratchAllocation,
}

/// Top-level build recorded into a command list.
pub struct TlasBuild {
    pub dst: Buffer,
    pub instances: Buffer,
    pub count: u32,
    pub performance: AccelerationStructurePerformance,
    pub flags: AccelerationStructureBuildFlags,
    pub scratch: ScratchAllocation,
}

/// Deferred command.
/// Owns everything it references and is encoded at submission time.
pub enum Action {
    Barrier {
        after: PipelineStages,
        before: PipelineStages,
    },
    WriteBuffer {
        buffer: Buffer,
        offset: usize,
        data: Box<[u8]>,
    },
    BuildBlas(BlasBuild),
    BuildTlas(TlasBuild),
    BeginMarker(Box<str>),
    EndMarker,
    Custom(Box<dyn FnOnce(&mut CommandEncoder) + Send>),
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Barrier { after, before } => f
                .debug_struct("Barrier")
                .field("after", after)
                .field("before", before)
                .finish(),
            Action::WriteBuffer { buffer, offset, data } => f
                .debug_struct("WriteBuffer")
                .field("buffer", buffer)
                .field("offset", offset)
                .field("len", &data.len())
                .finish(),
            Action::BuildBlas(build) => f
                .debug_struct("BuildBlas")
                .field("dst", &build.dst)
                .field("update", &build.src.is_some())
                .field("geometry", &build.geometry.len())
                .finish(),
            Action::BuildTlas(build) => f
                .debug_struct("BuildTlas")
                .field("dst", &build.dst)
                .field("count", &build.count)
                .finish(),
            Action::BeginMarker(label) => f.debug_tuple("BeginMarker").field(label).finish(),
            Action::EndMarker => f.write_str("EndMarker"),
            Action::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl Action {
    pub(super) fn encode(self, encoder: &mut CommandEncoder) {
        match self {
            Action::Barrier { after, before } => encoder.barrier(after, before),
            Action::WriteBuffer {
                buffer,
                offset,
                data,
            } => encoder.write_buffer_raw(buffer.slice(offset..offset + data.len()), &data),
            Action::BuildBlas(build) => {
                let geometry: SmallVec<[BlasGeometryDesc; 4]> =
                    build.geometry.iter().map(GeometryBatch::desc).collect();

                encoder.build_blas(
                    &build.dst,
                    build.src.as_ref(),
                    BlasBuildDesc {
                        performance: build.performance,
                        flags: build.flags,
                        geometry: &geometry,
                    },
                    build.scratch.slice(),
                );
            }
            Action::BuildTlas(build) => {
                encoder.build_tlas(
                    &build.dst,
                    TlasBuildDesc {
                        performance: build.performance,
                        flags: build.flags,
                        instances: build.instances.slice(..),
                        count: build.count,
                    },
                    build.scratch.slice(),
                );
            }
            Action::BeginMarker(label) => encoder.begin_marker(&label),
            Action::EndMarker => encoder.end_marker(),
            Action::Custom(f) => f(encoder),
        }
    }
}

/// Operation resolved around the list's commands at submission time.
#[derive(Clone, Debug)]
pub enum SubmitOp {
    Barrier {
        after: PipelineStages,
        before: PipelineStages,
    },

    /// Queue waits until timeline reaches the value.
    Wait {
        timeline: Timeline,
        value: FenceValue,
    },

    /// Queue signals owning manager's fence.
    Signal(FenceValue),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandListState {
    /// Submitted or never used. Can be reopened by the manager.
    Closed,

    /// Accepts actions.
    Open,

    /// Accepts actions inside a labeled chunk.
    InChunk,
}

/// Everything recorded into a list, taken when the list is closed.
pub(super) struct Recorded {
    pub pre: SmallVec<[SubmitOp; 4]>,
    pub actions: Vec<Action>,
    pub post: SmallVec<[SubmitOp; 4]>,
}

impl Recorded {
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty() && self.actions.is_empty() && self.post.is_empty()
    }
}

/// Recorder of deferred queue work.
pub struct CommandList {
    id: usize,
    state: CommandListState,
    actions: Vec<Action>,
    pre_submit: SmallVec<[SubmitOp; 4]>,
    post_submit: SmallVec<[SubmitOp; 4]>,
}

impl fmt::Debug for CommandList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandList")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("actions", &self.actions.len())
            .finish()
    }
}

impl CommandList {
    pub(super) fn new(id: usize) -> Self {
        CommandList {
            id,
            state: CommandListState::Closed,
            actions: Vec::new(),
            pre_submit: SmallVec::new(),
            post_submit: SmallVec::new(),
        }
    }

    pub(super) fn open(&mut self) {
        debug_assert_eq!(self.state, CommandListState::Closed);
        debug_assert!(self.actions.is_empty());
        self.state = CommandListState::Open;
    }

    /// Closes the list and takes recorded work.
    /// Chunk left open is closed implicitly.
    pub(super) fn close(&mut self) -> Recorded {
        if self.state == CommandListState::InChunk {
            tracing::warn!("Command list {} closed inside a chunk", self.id);
            self.actions.push(Action::EndMarker);
        }
        self.state = CommandListState::Closed;

        Recorded {
            pre: std::mem::take(&mut self.pre_submit),
            actions: std::mem::take(&mut self.actions),
            post: std::mem::take(&mut self.post_submit),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> CommandListState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != CommandListState::Closed
    }

    /// Number of recorded actions.
    pub fn command_count(&self) -> usize {
        self.actions.len()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn pre_submit(&self) -> &[SubmitOp] {
        &self.pre_submit
    }

    pub fn post_submit(&self) -> &[SubmitOp] {
        &self.post_submit
    }

    #[track_caller]
    fn check_open(&self) {
        assert!(
            self.is_open(),
            "command list {} is closed and can't record",
            self.id
        );
    }

    /// Records an action.
    #[track_caller]
    pub fn record(&mut self, action: Action) {
        self.check_open();
        tracing::trace!("Command list {} records {action:?}", self.id);
        self.actions.push(action);
    }

    /// Records a closure that encodes commands at submission time.
    #[track_caller]
    pub fn add_action(&mut self, f: impl FnOnce(&mut CommandEncoder) + Send + 'static) {
        self.record(Action::Custom(Box::new(f)));
    }

    #[track_caller]
    pub fn barrier(&mut self, after: PipelineStages, before: PipelineStages) {
        self.record(Action::Barrier { after, before });
    }

    #[track_caller]
    pub fn write_buffer(&mut self, buffer: &Buffer, offset: usize, data: &[u8]) {
        self.record(Action::WriteBuffer {
            buffer: buffer.clone(),
            offset,
            data: data.into(),
        });
    }

    /// Starts a labeled burst of actions.
    #[track_caller]
    pub fn begin_chunk(&mut self, label: &str) {
        assert_eq!(
            self.state,
            CommandListState::Open,
            "chunks can't be nested"
        );
        self.actions.push(Action::BeginMarker(label.into()));
        self.state = CommandListState::InChunk;
    }

    #[track_caller]
    pub fn end_chunk(&mut self) {
        assert_eq!(self.state, CommandListState::InChunk, "no chunk to end");
        self.actions.push(Action::EndMarker);
        self.state = CommandListState::Open;
    }

    /// Adds operation resolved right before the list's commands.
    #[track_caller]
    pub fn add_pre_submit(&mut self, op: SubmitOp) {
        self.check_open();
        self.pre_submit.push(op);
    }

    /// Adds operation resolved right after the list's commands.
    #[track_caller]
    pub fn add_post_submit(&mut self, op: SubmitOp) {
        self.check_open();
        self.post_submit.push(op);
    }
}
