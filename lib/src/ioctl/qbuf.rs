//! Safe wrapper for the `VIDIOC_QBUF` ioctl.
use nix::errno::Errno;
use nix::sys::time::{TimeVal, TimeValLike};
use std::os::unix::io::AsRawFd;
use std::time::Duration;
use thiserror::Error;

use crate::bindings;
use crate::bindings::v4l2_buffer;
use crate::ioctl::BufferFlags;
use crate::memory::MemoryType;

#[derive(Debug, Error)]
pub enum QBufError {
    #[error("buffer {0} is invalid or already queued")]
    InvalidBuffer(usize),
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<QBufError> for Errno {
    fn from(err: QBufError) -> Self {
        match err {
            QBufError::InvalidBuffer(_) => Errno::EINVAL,
            QBufError::IoctlError(e) => e,
        }
    }
}

/// Contains all the information that can be passed to the `qbuf` ioctl for a
/// single-planar MMAP buffer.
#[derive(Debug, Clone)]
pub struct QBuffer {
    pub flags: BufferFlags,
    pub field: u32,
    pub timestamp: TimeVal,
    pub bytes_used: usize,
}

impl Default for QBuffer {
    fn default() -> Self {
        QBuffer {
            flags: Default::default(),
            field: bindings::V4L2_FIELD_NONE,
            timestamp: TimeVal::zero(),
            bytes_used: 0,
        }
    }
}

impl QBuffer {
    pub fn new(bytes_used: usize) -> Self {
        QBuffer {
            bytes_used,
            ..Default::default()
        }
    }

    pub fn set_timestamp(mut self, timestamp: Duration) -> Self {
        self.timestamp = TimeVal::microseconds(timestamp.as_micros() as i64);
        self.flags |= BufferFlags::TIMESTAMP_COPY;
        self
    }

    fn fill_v4l2_buffer(&self, v4l2_buf: &mut v4l2_buffer) {
        v4l2_buf.memory = MemoryType::Mmap as u32;
        v4l2_buf.flags = self.flags.bits();
        v4l2_buf.field = self.field;
        v4l2_buf.bytesused = self.bytes_used as u32;
        v4l2_buf.timestamp.tv_sec = self.timestamp.tv_sec();
        v4l2_buf.timestamp.tv_usec = self.timestamp.tv_usec();
    }
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_buffer;
    nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
}

/// Safe wrapper around the `VIDIOC_QBUF` ioctl on the video output queue.
///
/// For MMAP buffers, the caller must not access the buffer's mapping until it
/// has been returned by either `dqbuf` or `streamoff`.
pub fn qbuf(fd: &impl AsRawFd, index: usize, buf_data: &QBuffer) -> Result<(), QBufError> {
    let mut v4l2_buf = v4l2_buffer {
        index: index as u32,
        type_: bindings::V4L2_BUF_TYPE_VIDEO_OUTPUT,
        ..Default::default()
    };
    buf_data.fill_v4l2_buffer(&mut v4l2_buf);

    match unsafe { ioctl::vidioc_qbuf(fd.as_raw_fd(), &mut v4l2_buf) } {
        Ok(_) => Ok(()),
        Err(Errno::EINVAL) => Err(QBufError::InvalidBuffer(index)),
        Err(e) => Err(QBufError::IoctlError(e)),
    }
}
