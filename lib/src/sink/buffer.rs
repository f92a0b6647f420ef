use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Weak;
use std::time::Duration;

use crate::device::DisplayDevice;
use crate::memory::Backing;

use super::{Release, SinkInner};

/// Lifecycle state of a display buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// Not backed by valid memory.
    Illegal,
    /// In one of the pools, ready to be handed out.
    Idle,
    /// Held by the producer.
    Allocated,
    /// Queued to the device, waiting to be displayed.
    Showing,
    /// Displayed and returned by the device, or never submitted. Waiting to be
    /// recycled.
    Showed,
    /// Its pool has been torn down. Its memory is released at the next
    /// recycle.
    Free,
}

/// A frame buffer handed to the producer by [`super::SinkController::acquire`].
///
/// The producer fills it through `DerefMut`, then either passes it to
/// [`super::SinkController::show`] or drops it. Dropping a buffer that has not
/// been shown counts as a dropped frame and returns the buffer to its pool.
pub struct DisplayBuffer<D: DisplayDevice> {
    pub(super) backing: Option<Backing<D::Mapping>>,
    pub(super) state: BufferState,
    pub(super) session: u64,
    pub(super) timestamp: Duration,
    pub(super) bytes_used: usize,
    pub(super) owner: Weak<SinkInner<D>>,
}

impl<D: DisplayDevice> DisplayBuffer<D> {
    pub(super) fn new(
        backing: Backing<D::Mapping>,
        session: u64,
        bytes_used: usize,
        owner: Weak<SinkInner<D>>,
    ) -> Self {
        let bytes_used = bytes_used.min(backing.len());
        DisplayBuffer {
            backing: Some(backing),
            state: BufferState::Allocated,
            session,
            timestamp: Duration::ZERO,
            bytes_used,
            owner,
        }
    }

    /// Device index of the buffer, or `None` for a software buffer.
    pub fn index(&self) -> Option<usize> {
        self.backing.as_ref().and_then(|b| b.index())
    }

    pub fn is_hardware(&self) -> bool {
        self.backing.as_ref().map_or(false, |b| b.is_hardware())
    }

    pub fn state(&self) -> BufferState {
        self.state
    }

    /// Physical address of the buffer memory, for hardware buffers.
    pub fn physical_address(&self) -> Option<u64> {
        match self.backing.as_ref()? {
            Backing::Hardware { memory, .. } => Some(memory.phys_addr),
            Backing::Software { .. } => None,
        }
    }

    pub fn timestamp(&self) -> Duration {
        self.timestamp
    }

    /// Presentation timestamp passed to the device along with the frame.
    pub fn set_timestamp(&mut self, timestamp: Duration) {
        self.timestamp = timestamp;
    }

    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Amount of valid data in the buffer. Clamped to the buffer size.
    pub fn set_bytes_used(&mut self, bytes_used: usize) {
        self.bytes_used = bytes_used.min(self.len());
    }

    /// Takes the memory out of the handle, so that dropping it does not
    /// trigger a recycle.
    pub(super) fn take_backing(&mut self) -> Option<Backing<D::Mapping>> {
        self.backing.take()
    }
}

impl<D: DisplayDevice> Deref for DisplayBuffer<D> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.backing {
            Some(backing) => backing.as_slice(),
            None => &[],
        }
    }
}

impl<D: DisplayDevice> DerefMut for DisplayBuffer<D> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.backing {
            Some(backing) => backing.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl<D: DisplayDevice> fmt::Debug for DisplayBuffer<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplayBuffer")
            .field("index", &self.index())
            .field("state", &self.state)
            .field("session", &self.session)
            .field("len", &self.len())
            .finish()
    }
}

impl<D: DisplayDevice> Drop for DisplayBuffer<D> {
    fn drop(&mut self) {
        let Some(backing) = self.backing.take() else {
            return;
        };

        // If the sink is gone, the memory is simply freed along with `backing`.
        if let Some(owner) = self.owner.upgrade() {
            owner.recycle(Release::Handle {
                backing,
                state: self.state,
                session: self.session,
            });
        }
    }
}
