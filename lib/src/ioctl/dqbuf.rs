//! Safe wrapper for the `VIDIOC_DQBUF` ioctl.
use crate::bindings;
use crate::ioctl::BufferFlags;
use crate::memory::MemoryType;

use nix::errno::Errno;
use std::fmt::Debug;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

/// Information for a dequeued buffer. Safe variant of `struct v4l2_buffer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DqBuffer {
    pub index: usize,
    pub flags: BufferFlags,
    pub sequence: u32,
}

impl DqBuffer {
    /// Returns whether the driver flagged the buffer as not displayed properly.
    pub fn has_error(&self) -> bool {
        self.flags.contains(BufferFlags::ERROR)
    }
}

impl From<bindings::v4l2_buffer> for DqBuffer {
    fn from(v4l2_buf: bindings::v4l2_buffer) -> Self {
        DqBuffer {
            index: v4l2_buf.index as usize,
            flags: BufferFlags::from_bits_truncate(v4l2_buf.flags),
            sequence: v4l2_buf.sequence,
        }
    }
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_buffer;
    nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
}

#[derive(Debug, Error)]
pub enum DqBufError {
    #[error("no buffer ready for dequeue")]
    NotReady,
    #[error("queue is not streaming")]
    NotStreaming,
    #[error("unexpected ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<Errno> for DqBufError {
    fn from(error: Errno) -> Self {
        match error {
            Errno::EAGAIN => Self::NotReady,
            Errno::EINVAL => Self::NotStreaming,
            error => Self::IoctlError(error),
        }
    }
}

impl From<DqBufError> for Errno {
    fn from(err: DqBufError) -> Self {
        match err {
            DqBufError::NotReady => Errno::EAGAIN,
            DqBufError::NotStreaming => Errno::EINVAL,
            DqBufError::IoctlError(e) => e,
        }
    }
}

pub type DqBufResult<T> = Result<T, DqBufError>;

/// Safe wrapper around the `VIDIOC_DQBUF` ioctl on the video output queue.
///
/// The device must have been opened in non-blocking mode for this call to
/// return `NotReady` instead of sleeping when no buffer is done.
pub fn dqbuf(fd: &impl AsRawFd) -> DqBufResult<DqBuffer> {
    let mut v4l2_buf = bindings::v4l2_buffer {
        type_: bindings::V4L2_BUF_TYPE_VIDEO_OUTPUT,
        memory: MemoryType::Mmap as u32,
        ..Default::default()
    };

    unsafe { ioctl::vidioc_dqbuf(fd.as_raw_fd(), &mut v4l2_buf) }?;

    Ok(DqBuffer::from(v4l2_buf))
}
