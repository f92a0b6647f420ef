//! Abstracts the two kinds of memory a frame can live in before reaching the
//! display.
//!
//! Hardware memory is a buffer owned by the device driver and mapped into our
//! address space (V4L2 `MMAP` memory). It is addressed by the stable index the
//! driver assigned to it and is the only kind of memory the display queue
//! accepts. Software memory is plain heap memory, allocated when no hardware
//! buffer can be obtained in time; its content has to be copied into a
//! hardware buffer before it can be displayed.
//!
//! The distinction is carried by the [`Backing`] enum so that the code
//! recycling a buffer always knows which policy applies to it.
use crate::bindings;
use enumn::N;

/// All the V4L2 memory types. Only `Mmap` is used by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum MemoryType {
    Mmap = bindings::V4L2_MEMORY_MMAP,
    UserPtr = bindings::V4L2_MEMORY_USERPTR,
    Overlay = bindings::V4L2_MEMORY_OVERLAY,
    DmaBuf = bindings::V4L2_MEMORY_DMABUF,
}

/// A device buffer mapped into the process' address space.
#[derive(Debug)]
pub struct HardwareMemory<M> {
    /// CPU mapping of the buffer.
    pub mapping: M,
    /// Physical (bus) address of the buffer, as reported by the driver.
    pub phys_addr: u64,
    /// Length of the buffer in bytes.
    pub length: usize,
}

/// Memory backing a display buffer.
#[derive(Debug)]
pub enum Backing<M> {
    /// Device memory, identified by its index in the device's buffer array.
    Hardware {
        index: usize,
        memory: HardwareMemory<M>,
    },
    /// Heap memory, never registered with the device.
    Software { data: Vec<u8> },
}

impl<M: AsRef<[u8]> + AsMut<[u8]>> Backing<M> {
    /// Returns the device index of the buffer, if it is backed by hardware.
    pub fn index(&self) -> Option<usize> {
        match self {
            Backing::Hardware { index, .. } => Some(*index),
            Backing::Software { .. } => None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        matches!(self, Backing::Hardware { .. })
    }

    /// Size of the usable memory area in bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            Backing::Hardware { memory, .. } => {
                let data = memory.mapping.as_ref();
                &data[..memory.length.min(data.len())]
            }
            Backing::Software { data } => data.as_slice(),
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self {
            Backing::Hardware { memory, .. } => {
                let length = memory.length;
                let data = memory.mapping.as_mut();
                let end = length.min(data.len());
                &mut data[..end]
            }
            Backing::Software { data } => data.as_mut_slice(),
        }
    }
}
