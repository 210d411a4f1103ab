use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
    time::Duration,
};

use smallvec::SmallVec;

use crate::generic::{DeviceError, OutOfMemory, QueueKind};

use super::{device::Gate, CommandBuffer, CommandEncoder, Device, Timeline};

/// How often blocked worker re-checks whether queue is closing.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

enum Op {
    Wait(Timeline, u64),
    Execute(CommandBuffer),
    Signal(Timeline, u64),
}

pub struct Queue {
    device: Device,
    kind: QueueKind,

    // Waits to add into next submission
    waits: SmallVec<[(Timeline, u64); 4]>,

    sender: Option<flume::Sender<Op>>,
    worker: Option<JoinHandle<()>>,
    closing: Arc<AtomicBool>,
}

impl Drop for Queue {
    fn drop(&mut self) {
        self.closing.store(true, Ordering::Release);
        self.device.gate().wake();

        // Worker drains remaining operations and exits once channel is closed.
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("{} queue worker panicked", self.kind);
            }
        }
    }
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Queue({}@{:?})", self.kind, self.device)
    }
}

impl Queue {
    pub(super) fn new(device: Device, kind: QueueKind) -> Result<Self, DeviceError> {
        let (sender, receiver) = flume::unbounded();
        let closing = Arc::new(AtomicBool::new(false));

        let worker = std::thread::Builder::new()
            .name(format!("tracery-{kind}-queue"))
            .spawn({
                let gate = device.gate();
                let closing = closing.clone();
                move || run(kind, receiver, &gate, &closing)
            })
            .map_err(|err| {
                tracing::error!("Failed to spawn {kind} queue worker: {err}");
                DeviceError::OutOfMemory
            })?;

        Ok(Queue {
            device,
            kind,
            waits: SmallVec::new(),
            sender: Some(sender),
            worker: Some(worker),
            closing,
        })
    }

    fn send(&self, op: Op) -> Result<(), DeviceError> {
        match &self.sender {
            Some(sender) => sender.send(op).map_err(|_| DeviceError::DeviceLost),
            None => Err(DeviceError::DeviceLost),
        }
    }

    /// Pushes buffered waits ahead of whatever is sent next.
    fn flush_waits(&mut self) -> Result<(), DeviceError> {
        let sender = self.sender.as_ref().ok_or(DeviceError::DeviceLost)?;
        for (timeline, value) in self.waits.drain(..) {
            sender
                .send(Op::Wait(timeline, value))
                .map_err(|_| DeviceError::DeviceLost)?;
        }
        Ok(())
    }
}

fn run(kind: QueueKind, receiver: flume::Receiver<Op>, gate: &Gate, closing: &AtomicBool) {
    while let Ok(op) = receiver.recv() {
        gate.pass(closing);

        match op {
            Op::Wait(timeline, value) => loop {
                if timeline.wait(value, POLL_INTERVAL) {
                    break;
                }
                if closing.load(Ordering::Acquire) {
                    tracing::warn!(
                        "{kind} queue is closing while waiting for {timeline:?} to reach {value}"
                    );
                    break;
                }
            },
            Op::Execute(cbuf) => cbuf.execute(),
            Op::Signal(timeline, value) => timeline.signal(value),
        }
    }
}

#[hidden_trait::expose]
impl crate::traits::Queue for Queue {
    fn kind(&self) -> QueueKind {
        self.kind
    }

    fn new_command_encoder(&mut self) -> Result<CommandEncoder, OutOfMemory> {
        Ok(CommandEncoder::new(self.device.clone(), self.kind))
    }

    fn wait(&mut self, timeline: &Timeline, value: u64) {
        self.waits.push((timeline.clone(), value));
    }

    fn submit<I>(&mut self, command_buffers: I) -> Result<(), DeviceError>
    where
        I: IntoIterator<Item = CommandBuffer>,
    {
        self.flush_waits()?;

        for cbuf in command_buffers {
            debug_assert_eq!(
                cbuf.queue, self.kind,
                "command buffer submitted to a foreign queue"
            );
            self.send(Op::Execute(cbuf))?;
        }
        Ok(())
    }

    fn signal(&mut self, timeline: &Timeline, value: u64) -> Result<(), DeviceError> {
        self.flush_waits()?;
        self.send(Op::Signal(timeline.clone(), value))
    }
}
