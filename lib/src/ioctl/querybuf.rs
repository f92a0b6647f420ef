//! Safe wrapper for the `VIDIOC_QUERYBUF` ioctl.
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;
use thiserror::Error;

use crate::bindings;
use crate::bindings::v4l2_buffer;
use crate::ioctl::BufferFlags;
use crate::memory::MemoryType;

/// Contains all the information that makes sense when using `querybuf` on a
/// single-planar MMAP buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryBuffer {
    pub index: usize,
    pub flags: BufferFlags,
    pub memory: MemoryType,
    /// Offset to pass to `mmap()` in order to obtain a mapping for this buffer.
    /// Display drivers exposing contiguous memory report the physical
    /// address of the buffer here.
    pub mem_offset: u32,
    /// Length of the buffer.
    pub length: u32,
}

#[derive(Debug, Error)]
pub enum QueryBufError {
    #[error("unknown memory type {0}")]
    UnknownMemoryType(u32),
    #[error("invalid buffer index {0}")]
    InvalidIndex(usize),
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<QueryBufError> for Errno {
    fn from(err: QueryBufError) -> Self {
        match err {
            QueryBufError::UnknownMemoryType(_) => Errno::EINVAL,
            QueryBufError::InvalidIndex(_) => Errno::EINVAL,
            QueryBufError::IoctlError(e) => e,
        }
    }
}

impl TryFrom<v4l2_buffer> for QueryBuffer {
    type Error = QueryBufError;

    fn try_from(v4l2_buf: v4l2_buffer) -> Result<Self, Self::Error> {
        let memory = MemoryType::n(v4l2_buf.memory)
            .ok_or(QueryBufError::UnknownMemoryType(v4l2_buf.memory))?;

        Ok(QueryBuffer {
            index: v4l2_buf.index as usize,
            flags: BufferFlags::from_bits_truncate(v4l2_buf.flags),
            memory,
            // Safe because `offset` is the member filled for MMAP buffers, and
            // reading any member of this union is sound anyway.
            mem_offset: unsafe { v4l2_buf.m.offset },
            length: v4l2_buf.length,
        })
    }
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_buffer;
    nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
}

/// Safe wrapper around the `VIDIOC_QUERYBUF` ioctl on the video output queue.
pub fn querybuf(fd: &impl AsRawFd, index: usize) -> Result<QueryBuffer, QueryBufError> {
    let mut v4l2_buf = v4l2_buffer {
        index: index as u32,
        type_: bindings::V4L2_BUF_TYPE_VIDEO_OUTPUT,
        memory: MemoryType::Mmap as u32,
        ..Default::default()
    };

    match unsafe { ioctl::vidioc_querybuf(fd.as_raw_fd(), &mut v4l2_buf) } {
        Ok(_) => QueryBuffer::try_from(v4l2_buf),
        Err(Errno::EINVAL) => Err(QueryBufError::InvalidIndex(index)),
        Err(e) => Err(QueryBufError::IoctlError(e)),
    }
}
