use std::fmt;

bitflags::bitflags! {
    /// Flags that describe the capabilities of a queue.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct QueueFlags: u32 {
        /// The queue supports compute operations.
        const COMPUTE = 0x2;

        /// The queue supports transfer operations.
        const TRANSFER = 0x4;
    }
}

/// Identifies one of the hardware queues.
///
/// Queues execute independently of each other.
/// Work on different queues is ordered only by explicit fence waits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum QueueKind {
    /// General purpose queue. Accepts compute and transfer work.
    Direct,

    /// Transfer only queue.
    Copy,

    /// Asynchronous compute queue.
    Compute,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Direct, QueueKind::Copy, QueueKind::Compute];

    pub const fn flags(self) -> QueueFlags {
        match self {
            QueueKind::Direct => QueueFlags::all(),
            QueueKind::Copy => QueueFlags::TRANSFER,
            QueueKind::Compute => QueueFlags::COMPUTE.union(QueueFlags::TRANSFER),
        }
    }

    pub const fn index(self) -> usize {
        match self {
            QueueKind::Direct => 0,
            QueueKind::Copy => 1,
            QueueKind::Compute => 2,
        }
    }
}

impl fmt::Display for QueueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueKind::Direct => f.write_str("direct"),
            QueueKind::Copy => f.write_str("copy"),
            QueueKind::Compute => f.write_str("compute"),
        }
    }
}
