//! Lifecycle of device allocations.

use std::fmt;

use crate::generic::OutOfMemory;

/// State of a [`Resource`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Never allocated, or last allocation attempt failed.
    Unallocated,

    /// Allocated and its contents are current.
    Ready,

    /// Allocated but data derived from it must be regenerated.
    Dirty,

    /// Explicitly released. Must be reallocated before reuse.
    Removed,
}

/// Device allocation with an explicit lifecycle.
///
/// Device commands may reference the value only while it is
/// [`Ready`](ResourceState::Ready) or [`Dirty`](ResourceState::Dirty).
pub struct Resource<T> {
    state: ResourceState,
    value: Option<T>,
}

impl<T> Default for Resource<T> {
    fn default() -> Self {
        Resource::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for Resource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("state", &self.state)
            .field("value", &self.value)
            .finish()
    }
}

impl<T> Resource<T> {
    pub const fn new() -> Self {
        Resource {
            state: ResourceState::Unallocated,
            value: None,
        }
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == ResourceState::Ready
    }

    /// Returns allocated value unless resource is unallocated or removed.
    pub fn get(&self) -> Option<&T> {
        match self.state {
            ResourceState::Ready | ResourceState::Dirty => self.value.as_ref(),
            ResourceState::Unallocated | ResourceState::Removed => None,
        }
    }

    /// Returns value only if it is current.
    pub fn ready(&self) -> Option<&T> {
        match self.state {
            ResourceState::Ready => self.value.as_ref(),
            _ => None,
        }
    }

    /// Replaces current allocation with a new one.
    ///
    /// Old value is dropped before `allocate` is called, so its memory
    /// can be reused. On failure resource becomes unallocated.
    pub fn allocate(
        &mut self,
        allocate: impl FnOnce() -> Result<T, OutOfMemory>,
    ) -> Result<&T, OutOfMemory> {
        self.value = None;

        match allocate() {
            Ok(value) => {
                self.state = ResourceState::Ready;
                Ok(self.value.insert(value))
            }
            Err(err) => {
                self.state = ResourceState::Unallocated;
                Err(err)
            }
        }
    }

    /// Allocates resource on demand.
    /// Returns existing value if there is one.
    pub fn ensure(
        &mut self,
        allocate: impl FnOnce() -> Result<T, OutOfMemory>,
    ) -> Result<&T, OutOfMemory> {
        if self.get().is_none() {
            self.allocate(allocate)?;
        }

        match &self.value {
            Some(value) => Ok(value),
            None => unreachable!("allocated resource has no value"),
        }
    }

    /// Marks derived data as stale.
    /// Only ready resource can become dirty.
    pub fn mark_dirty(&mut self) {
        if self.state == ResourceState::Ready {
            self.state = ResourceState::Dirty;
        }
    }

    /// Marks derived data as regenerated.
    pub fn mark_ready(&mut self) {
        debug_assert!(self.value.is_some(), "resource without value can't be ready");
        if self.state == ResourceState::Dirty && self.value.is_some() {
            self.state = ResourceState::Ready;
        }
    }

    /// Releases the allocation.
    pub fn release(&mut self) -> Option<T> {
        self.state = ResourceState::Removed;
        self.value.take()
    }
}
