//! Explicit per-renderer state threaded through frame code.

use crate::{
    backend::Device,
    command::CommandManager,
    config::{Config, ConfigError},
    fence::FenceValue,
    generic::{DeviceError, QueueKind},
};

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Owns the device, one [`CommandManager`] per queue kind and the frame counter.
pub struct RenderContext {
    device: Device,
    config: Config,
    managers: [CommandManager; 3],
    frame: u64,

    // Per frame slot values signaled on every queue when the slot was left.
    frame_fences: Vec<[Option<FenceValue>; 3]>,
}

impl RenderContext {
    pub fn new(device: Device, config: Config) -> Result<Self, ContextError> {
        config.validate()?;

        let managers = [
            CommandManager::new(&device, QueueKind::Direct, &config)?,
            CommandManager::new(&device, QueueKind::Copy, &config)?,
            CommandManager::new(&device, QueueKind::Compute, &config)?,
        ];
        debug_assert!(QueueKind::ALL
            .iter()
            .all(|&kind| managers[kind.index()].kind() == kind));

        tracing::debug!(
            "Render context with {} frames in flight created on {device:?}",
            config.frames_in_flight
        );

        Ok(RenderContext {
            frame_fences: vec![[None; 3]; config.frames_in_flight],
            device,
            config,
            managers,
            frame: 0,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Number of frames started so far.
    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn frames_in_flight(&self) -> usize {
        self.config.frames_in_flight
    }

    pub fn frame_slot(&self) -> usize {
        (self.frame % self.config.frames_in_flight as u64) as usize
    }

    pub fn previous_frame_slot(&self) -> usize {
        let frames = self.config.frames_in_flight;
        (self.frame_slot() + frames - 1) % frames
    }

    pub fn commands(&self, kind: QueueKind) -> &CommandManager {
        &self.managers[kind.index()]
    }

    pub fn commands_mut(&mut self, kind: QueueKind) -> &mut CommandManager {
        &mut self.managers[kind.index()]
    }

    /// Makes the next submission of `waiter` queue wait until `value`
    /// is reached on its own queue.
    pub fn insert_queue_wait(
        &mut self,
        waiter: QueueKind,
        value: FenceValue,
    ) -> Result<(), DeviceError> {
        let timeline = self.managers[value.queue().index()].fence().shared().cloned();

        match timeline {
            Some(timeline) => self.managers[waiter.index()].insert_timeline_wait(timeline, value),
            None => Ok(()),
        }
    }

    /// Submits outstanding lists of every queue.
    pub fn execute_all(&mut self) -> Result<usize, DeviceError> {
        let mut count = 0;
        for manager in &mut self.managers {
            count += manager.execute()?;
        }
        Ok(count)
    }

    /// Finishes current frame and starts the next one.
    ///
    /// Blocks, up to the configured timeout, until work of the frame
    /// that last used the new slot has completed. Returns the new slot.
    pub fn advance_frame(&mut self) -> Result<usize, DeviceError> {
        let slot = self.frame_slot();
        let mut values = [None; 3];
        for manager in &mut self.managers {
            values[manager.kind().index()] = Some(manager.submit_and_signal()?);
        }
        self.frame_fences[slot] = values;

        self.frame += 1;
        let next = self.frame_slot();

        for (manager, value) in self.managers.iter().zip(self.frame_fences[next]) {
            if let Some(value) = value {
                if !manager.fence().wait(value, None) {
                    tracing::warn!("Frame slot {next} is reused before its work completed");
                }
            }
        }

        tracing::trace!("Frame {} starts in slot {next}", self.frame);
        Ok(next)
    }

    /// Submits everything and waits for all queues to drain.
    /// Returns `false` if any wait timed out.
    pub fn wait_idle(&mut self) -> Result<bool, DeviceError> {
        let mut idle = true;
        for manager in &mut self.managers {
            let value = manager.submit_and_signal()?;
            idle &= manager.fence().wait(value, None);
        }
        Ok(idle)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        backend::DeviceDesc,
        generic::{BufferDesc, BufferUsage, Memory},
    };

    use super::*;

    #[test]
    fn frame_slots_rotate() {
        let device = Device::new(DeviceDesc::default());
        let mut context = RenderContext::new(device, Config::default()).unwrap();
        assert_eq!(context.frame_slot(), 0);
        assert_eq!(context.previous_frame_slot(), 1);

        assert_eq!(context.advance_frame().unwrap(), 1);
        assert_eq!(context.previous_frame_slot(), 0);
        assert_eq!(context.advance_frame().unwrap(), 0);
        assert_eq!(context.frame(), 2);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let device = Device::new(DeviceDesc::default());
        let config = Config {
            frames_in_flight: 0,
            ..Config::default()
        };
        assert!(matches!(
            RenderContext::new(device, config),
            Err(ContextError::Config(_))
        ));
    }

    #[test]
    fn queue_wait_orders_copy_after_compute() {
        let device = Device::new(DeviceDesc::default());
        let mut context = RenderContext::new(device.clone(), Config::default()).unwrap();
        let target = device
            .new_buffer(BufferDesc {
                size: 4,
                usage: BufferUsage::TRANSFER_DST,
                memory: Memory::Download,
                name: "target",
            })
            .unwrap();

        let compute = context.commands_mut(QueueKind::Compute);
        compute
            .current_list()
            .unwrap()
            .write_buffer(&target, 0, &[1, 1, 1, 1]);
        let produced = compute.insert_fence_signal().unwrap();

        context.insert_queue_wait(QueueKind::Copy, produced).unwrap();
        let copy = context.commands_mut(QueueKind::Copy);
        copy.current_list()
            .unwrap()
            .write_buffer(&target, 0, &[2, 2, 2, 2]);
        let consumed = copy.insert_fence_signal().unwrap();
        copy.execute().unwrap();

        assert!(!context
            .commands(QueueKind::Copy)
            .fence()
            .wait(consumed, Some(Duration::from_millis(30))));

        context.execute_all().unwrap();
        assert!(context.commands(QueueKind::Copy).fence().wait(consumed, None));
        assert_eq!(target.read(0..4), vec![2, 2, 2, 2]);
        assert!(context.wait_idle().unwrap());
    }
}
