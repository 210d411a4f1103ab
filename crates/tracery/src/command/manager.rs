use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
};

use smallvec::SmallVec;

use crate::{
    backend::{CommandEncoder, Device, Queue, Timeline},
    config::Config,
    fence::{Fence, FenceValue},
    generic::{DeviceError, QueueKind},
};

use super::list::{Action, CommandList, CommandListState, SubmitOp};

/// Owns one queue, its fence and a pool of command lists.
///
/// Lists are handed out open and submitted in the order they were acquired.
pub struct CommandManager {
    device: Device,
    queue: Queue,
    fence: Fence,
    lists: Vec<CommandList>,

    // Indices of open lists in acquisition order.
    outstanding: VecDeque<usize>,

    max_lists: usize,
    cycle_threshold: usize,

    // Value every newly requested list waits on.
    break_value: Option<FenceValue>,
}

impl fmt::Debug for CommandManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandManager")
            .field("queue", &self.queue)
            .field("fence", &self.fence)
            .field("lists", &self.lists.len())
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

impl Drop for CommandManager {
    fn drop(&mut self) {
        if self.outstanding.is_empty() {
            return;
        }

        tracing::debug!(
            "{} command manager dropped with {} outstanding lists",
            self.kind(),
            self.outstanding.len()
        );
        if let Err(err) = self.execute() {
            tracing::error!("Failed to flush {} command lists: {err}", self.kind());
        }
    }
}

impl CommandManager {
    pub fn new(device: &Device, kind: QueueKind, config: &Config) -> Result<Self, DeviceError> {
        let queue = device.new_queue(kind)?;
        let fence = Fence::new(device.clone(), kind, config.fence_timeout());

        Ok(CommandManager {
            device: device.clone(),
            queue,
            fence,
            lists: Vec::new(),
            outstanding: VecDeque::new(),
            max_lists: config.max_command_lists.max(1),
            cycle_threshold: config.command_cycle_threshold,
            break_value: None,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn kind(&self) -> QueueKind {
        self.fence.queue()
    }

    pub fn fence(&self) -> &Fence {
        &self.fence
    }

    pub fn fence_mut(&mut self) -> &mut Fence {
        &mut self.fence
    }

    /// Number of open lists waiting for submission.
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// Returns a fresh open list.
    ///
    /// When the pool is exhausted the oldest outstanding list
    /// is submitted and reused, so this never blocks.
    pub fn request_list(&mut self) -> Result<&mut CommandList, DeviceError> {
        self.cycle_oversized()?;

        let idx = self.acquire()?;
        let list = &mut self.lists[idx];
        list.open();

        if let Some(value) = self.break_value {
            if let Some(timeline) = self.fence.shared() {
                list.add_pre_submit(SubmitOp::Wait {
                    timeline: timeline.clone(),
                    value,
                });
            }
        }

        self.outstanding.push_back(idx);
        Ok(list)
    }

    /// Returns the newest open list, requesting one if there is none.
    pub fn current_list(&mut self) -> Result<&mut CommandList, DeviceError> {
        self.cycle_oversized()?;

        match self.outstanding.back().copied() {
            Some(idx) => Ok(&mut self.lists[idx]),
            None => self.request_list(),
        }
    }

    /// Records a closure into the current list.
    pub fn add_command_action(
        &mut self,
        f: impl FnOnce(&mut CommandEncoder) + Send + 'static,
    ) -> Result<(), DeviceError> {
        self.current_list()?.add_action(f);
        Ok(())
    }

    /// Submits every outstanding list in acquisition order.
    /// Returns number of lists submitted.
    pub fn execute(&mut self) -> Result<usize, DeviceError> {
        let mut count = 0;
        while let Some(idx) = self.outstanding.pop_front() {
            self.submit_list(idx)?;
            count += 1;
        }
        Ok(count)
    }

    /// Reserves next fence value and schedules its signal
    /// after the current list's commands.
    pub fn insert_fence_signal(&mut self) -> Result<FenceValue, DeviceError> {
        let value = self.fence.increment();
        self.current_list()?.add_post_submit(SubmitOp::Signal(value));
        Ok(value)
    }

    /// Makes the current list wait for `value` of `fence` before executing.
    /// `fence` may belong to another queue.
    pub fn insert_fence_wait(
        &mut self,
        fence: &Fence,
        value: FenceValue,
    ) -> Result<(), DeviceError> {
        match fence.shared() {
            Some(timeline) => self.insert_timeline_wait(timeline.clone(), value),
            None => {
                tracing::debug!("Skipping wait for {value}, fence has no timeline");
                Ok(())
            }
        }
    }

    pub fn insert_timeline_wait(
        &mut self,
        timeline: Timeline,
        value: FenceValue,
    ) -> Result<(), DeviceError> {
        self.current_list()?.add_pre_submit(SubmitOp::Wait { timeline, value });
        Ok(())
    }

    /// Submits every outstanding list and signals a new fence value after them.
    pub fn submit_and_signal(&mut self) -> Result<FenceValue, DeviceError> {
        self.execute()?;
        self.fence.increment();
        self.fence.signal(&mut self.queue)
    }

    /// Submits recorded work, signals the fence and makes
    /// every list requested afterwards wait for that signal.
    pub fn insert_execution_break(&mut self) -> Result<FenceValue, DeviceError> {
        let value = self.submit_and_signal()?;
        tracing::trace!("Execution break at {value}");
        self.break_value = Some(value);
        Ok(value)
    }

    /// Starts a scoped unit of work that is flushed when the guard drops.
    pub fn cycle_block(&mut self, label: Option<&str>) -> Result<CycleBlock<'_>, DeviceError> {
        let marked = match label {
            Some(label) => {
                self.current_list()?.record(Action::BeginMarker(label.into()));
                true
            }
            None => false,
        };

        Ok(CycleBlock {
            manager: self,
            marked,
        })
    }

    fn acquire(&mut self) -> Result<usize, DeviceError> {
        if let Some(idx) = self.lists.iter().position(|list| !list.is_open()) {
            return Ok(idx);
        }

        if self.lists.len() < self.max_lists {
            let idx = self.lists.len();
            self.lists.push(CommandList::new(idx));
            return Ok(idx);
        }

        match self.outstanding.pop_front() {
            Some(idx) => {
                tracing::trace!(
                    "{} command list pool is exhausted, cycling list {idx}",
                    self.kind()
                );
                self.submit_list(idx)?;
                Ok(idx)
            }
            None => {
                let idx = self.lists.len();
                self.lists.push(CommandList::new(idx));
                Ok(idx)
            }
        }
    }

    /// Submits the current list if it grew past the threshold.
    /// Lists inside a chunk are left alone until the chunk ends.
    fn cycle_oversized(&mut self) -> Result<(), DeviceError> {
        let Some(&idx) = self.outstanding.back() else {
            return Ok(());
        };

        let list = &self.lists[idx];
        if list.state() == CommandListState::Open && list.command_count() > self.cycle_threshold {
            tracing::debug!(
                "{} command list {idx} holds {} commands, cycling",
                self.kind(),
                list.command_count()
            );
            self.execute()?;
        }
        Ok(())
    }

    fn submit_list(&mut self, idx: usize) -> Result<(), DeviceError> {
        let recorded = self.lists[idx].close();
        if recorded.is_empty() {
            return Ok(());
        }

        let mut encoder = self.queue.new_command_encoder()?;

        for op in recorded.pre {
            match op {
                SubmitOp::Barrier { after, before } => encoder.barrier(after, before),
                SubmitOp::Wait { timeline, value } => self.queue.wait(&timeline, value.value()),
                SubmitOp::Signal(value) => self.signal(value)?,
            }
        }

        let count = recorded.actions.len();
        for action in recorded.actions {
            action.encode(&mut encoder);
        }

        // Waits and signals keep their recorded order after the commands.
        let mut post: SmallVec<[SubmitOp; 4]> = SmallVec::new();
        for op in recorded.post {
            match op {
                SubmitOp::Barrier { after, before } => encoder.barrier(after, before),
                op => post.push(op),
            }
        }

        let cbuf = encoder.finish()?;
        self.queue.submit([cbuf])?;
        tracing::trace!("{} command list {idx} submitted with {count} actions", self.kind());

        for op in post {
            match op {
                SubmitOp::Wait { timeline, value } => self.queue.wait(&timeline, value.value()),
                SubmitOp::Signal(value) => self.signal(value)?,
                // Encoded with the commands.
                SubmitOp::Barrier { .. } => {}
            }
        }
        Ok(())
    }

    fn signal(&mut self, value: FenceValue) -> Result<(), DeviceError> {
        if let Some(timeline) = self.fence.shared() {
            self.queue.signal(timeline, value.value())?;
        }
        self.fence.mark_signaled(value);
        Ok(())
    }
}

/// Scoped unit of queue work.
///
/// Dropping the guard inserts an execution break and submits,
/// so commands recorded through it are flushed even on early return.
pub struct CycleBlock<'a> {
    manager: &'a mut CommandManager,
    marked: bool,
}

impl Deref for CycleBlock<'_> {
    type Target = CommandManager;

    fn deref(&self) -> &CommandManager {
        self.manager
    }
}

impl DerefMut for CycleBlock<'_> {
    fn deref_mut(&mut self) -> &mut CommandManager {
        self.manager
    }
}

impl Drop for CycleBlock<'_> {
    fn drop(&mut self) {
        let result = (|| -> Result<usize, DeviceError> {
            self.manager.insert_execution_break()?;
            if self.marked {
                self.manager.current_list()?.record(Action::EndMarker);
            }
            self.manager.execute()
        })();

        if let Err(err) = result {
            tracing::error!("Failed to flush {} cycle block: {err}", self.manager.kind());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        backend::{Buffer, Device, DeviceDesc},
        config::Config,
        generic::{BufferDesc, BufferUsage, Memory, PipelineStages, QueueKind},
    };

    use super::*;

    fn new_manager(device: &Device, kind: QueueKind) -> CommandManager {
        CommandManager::new(device, kind, &Config::default()).unwrap()
    }

    fn buffer(device: &Device) -> Buffer {
        device
            .new_buffer(BufferDesc {
                size: 16,
                usage: BufferUsage::TRANSFER_DST,
                memory: Memory::Download,
                name: "target",
            })
            .unwrap()
    }

    #[test]
    fn execute_preserves_acquisition_order() {
        let device = Device::new(DeviceDesc::default());
        let mut manager = new_manager(&device, QueueKind::Copy);
        let target = buffer(&device);

        manager.request_list().unwrap().write_buffer(&target, 0, &[1]);
        manager.request_list().unwrap().write_buffer(&target, 0, &[2]);
        let value = manager.insert_fence_signal().unwrap();

        assert_eq!(manager.outstanding(), 2);
        assert_eq!(manager.execute().unwrap(), 2);
        assert_eq!(manager.outstanding(), 0);

        assert!(manager.fence().wait(value, None));
        assert_eq!(target.read(0..1), vec![2]);
    }

    #[test]
    fn exhausted_pool_cycles_oldest_list() {
        let device = Device::new(DeviceDesc::default());
        let config = Config {
            max_command_lists: 2,
            ..Config::default()
        };
        let mut manager = CommandManager::new(&device, QueueKind::Direct, &config).unwrap();
        let target = buffer(&device);

        manager.request_list().unwrap().write_buffer(&target, 0, &[7]);
        manager.request_list().unwrap();
        manager.request_list().unwrap();
        assert_eq!(manager.outstanding(), 2);

        // First list was submitted to make room.
        let value = manager.insert_fence_signal().unwrap();
        manager.execute().unwrap();
        assert!(manager.fence().wait(value, None));
        assert_eq!(target.read(0..1), vec![7]);
    }

    #[test]
    fn oversized_list_is_cycled() {
        let device = Device::new(DeviceDesc::default());
        let config = Config {
            command_cycle_threshold: 4,
            ..Config::default()
        };
        let mut manager = CommandManager::new(&device, QueueKind::Compute, &config).unwrap();

        for _ in 0..5 {
            manager
                .current_list()
                .unwrap()
                .barrier(PipelineStages::TRANSFER, PipelineStages::COMPUTE_SHADER);
        }
        assert_eq!(manager.current_list().unwrap().command_count(), 0);
        assert_eq!(manager.outstanding(), 1);
    }

    #[test]
    fn chunk_defers_cycling() {
        let device = Device::new(DeviceDesc::default());
        let config = Config {
            command_cycle_threshold: 2,
            ..Config::default()
        };
        let mut manager = CommandManager::new(&device, QueueKind::Compute, &config).unwrap();

        manager.current_list().unwrap().begin_chunk("burst");
        for _ in 0..4 {
            manager
                .current_list()
                .unwrap()
                .barrier(PipelineStages::TRANSFER, PipelineStages::COMPUTE_SHADER);
        }
        assert_eq!(manager.current_list().unwrap().command_count(), 5);
        manager.current_list().unwrap().end_chunk();
        assert_eq!(manager.current_list().unwrap().command_count(), 0);
    }

    #[test]
    fn execution_break_is_waited_by_new_lists() {
        let device = Device::new(DeviceDesc::default());
        let mut manager = new_manager(&device, QueueKind::Direct);

        manager
            .current_list()
            .unwrap()
            .barrier(PipelineStages::HOST, PipelineStages::TRANSFER);
        let value = manager.insert_execution_break().unwrap();
        assert_eq!(manager.outstanding(), 0);
        assert_eq!(manager.fence().last_signaled(), value);

        let list = manager.request_list().unwrap();
        assert!(matches!(
            list.pre_submit(),
            [SubmitOp::Wait { value: waited, .. }] if *waited == value
        ));
    }

    #[test]
    fn cycle_block_flushes_on_drop() {
        let device = Device::new(DeviceDesc::default());
        let mut manager = new_manager(&device, QueueKind::Copy);
        let target = buffer(&device);

        {
            let mut block = manager.cycle_block(Some("upload")).unwrap();
            block
                .current_list()
                .unwrap()
                .write_buffer(&target, 4, &[1, 2, 3, 4]);
        }

        assert_eq!(manager.outstanding(), 0);
        let value = manager.fence().last_signaled();
        assert!(value.value() >= 1);
        assert!(manager.fence().wait(value, None));
        assert_eq!(target.read(4..8), vec![1, 2, 3, 4]);
    }

    #[test]
    fn cross_queue_fence_wait() {
        let device = Device::new(DeviceDesc::default());
        let config = Config::default();
        let mut compute = CommandManager::new(&device, QueueKind::Compute, &config).unwrap();
        let mut copy = CommandManager::new(&device, QueueKind::Copy, &config).unwrap();

        let produced = compute.insert_fence_signal().unwrap();
        copy.insert_fence_wait(compute.fence(), produced).unwrap();
        let consumed = copy.insert_fence_signal().unwrap();
        copy.execute().unwrap();

        assert!(!copy.fence().wait(consumed, Some(Duration::from_millis(30))));

        compute.execute().unwrap();
        assert!(copy.fence().wait(consumed, None));
        assert!(compute.fence().is_complete(produced));
    }

    #[test]
    fn pre_submit_signal_follows_pre_submit_wait() {
        let device = Device::new(DeviceDesc::default());
        let mut manager = new_manager(&device, QueueKind::Direct);
        let blocker = device.new_timeline().unwrap();

        let value = manager.fence_mut().increment();
        let list = manager.current_list().unwrap();
        list.add_pre_submit(SubmitOp::Wait {
            timeline: blocker.clone(),
            value: FenceValue::new(QueueKind::Compute, 1),
        });
        list.add_pre_submit(SubmitOp::Signal(value));
        manager.execute().unwrap();

        assert!(!manager.fence().wait(value, Some(Duration::from_millis(50))));

        blocker.signal(1);
        assert!(manager.fence().wait(value, None));
    }

    #[test]
    fn post_submit_wait_holds_later_signal() {
        let device = Device::new(DeviceDesc::default());
        let mut manager = new_manager(&device, QueueKind::Copy);
        let blocker = device.new_timeline().unwrap();

        manager
            .current_list()
            .unwrap()
            .add_post_submit(SubmitOp::Wait {
                timeline: blocker.clone(),
                value: FenceValue::new(QueueKind::Compute, 1),
            });
        manager.execute().unwrap();

        // No submission between the wait and this signal.
        let value = manager.submit_and_signal().unwrap();
        assert!(!manager.fence().wait(value, Some(Duration::from_millis(50))));

        blocker.signal(1);
        assert!(manager.fence().wait(value, None));
    }

    #[test]
    fn custom_actions_run_at_submission() {
        let device = Device::new(DeviceDesc::default());
        let mut manager = new_manager(&device, QueueKind::Copy);
        let target = buffer(&device);

        let captured = target.clone();
        manager
            .add_command_action(move |encoder| encoder.write_buffer_raw(&captured, &[5; 16]))
            .unwrap();
        let value = manager.insert_fence_signal().unwrap();
        manager.execute().unwrap();

        assert!(manager.fence().wait(value, None));
        assert_eq!(target.read(0..16), vec![5; 16]);
    }
}
