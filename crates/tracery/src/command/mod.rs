//! Recording and submission of queue work.

mod list;
mod manager;

pub use self::{
    list::{Action, BlasBuild, CommandList, CommandListState, SubmitOp, TlasBuild},
    manager::{CommandManager, CycleBlock},
};
