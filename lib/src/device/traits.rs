use std::time::Duration;

use thiserror::Error;

use crate::ioctl::{
    DqBufError, GFmtError, GSelectionError, MmapError, QBufError, QueryBufError,
    ReqbufsError, SFmtError, SSelectionError, StreamOffError, StreamOnError,
};
use crate::{Format, Rect};

/// Errors that can be returned by a display device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("error while getting format: {0}")]
    GFmt(#[from] GFmtError),
    #[error("error while setting format: {0}")]
    SFmt(#[from] SFmtError),
    #[error("error while requesting buffers: {0}")]
    Reqbufs(#[from] ReqbufsError),
    #[error("error while querying buffer: {0}")]
    QueryBuf(#[from] QueryBufError),
    #[error("error while mapping buffer: {0}")]
    Mmap(#[from] MmapError),
    #[error("error while queueing buffer: {0}")]
    QBuf(#[from] QBufError),
    #[error("error while dequeueing buffer: {0}")]
    DqBuf(#[from] DqBufError),
    #[error("error while starting stream: {0}")]
    StreamOn(#[from] StreamOnError),
    #[error("error while stopping stream: {0}")]
    StreamOff(#[from] StreamOffError),
    #[error("error while getting target rectangle: {0}")]
    GSelection(#[from] GSelectionError),
    #[error("error while setting target rectangle: {0}")]
    SSelection(#[from] SSelectionError),
    #[error("device does not support this operation")]
    NotSupported,
}

/// Location and size of a device buffer, as returned by `query_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    pub index: usize,
    /// Offset to use when mapping the buffer.
    pub mem_offset: u32,
    /// Length of the buffer in bytes.
    pub length: usize,
    /// Physical address of the buffer, for hardware consumers that need it.
    pub phys_addr: u64,
}

/// Index-addressed request/response contract of a display queue.
///
/// Buffers are identified by the index the device assigned to them when they
/// were requested. Implementations only need to be callable through a shared
/// reference: callers serialize the state-changing requests themselves.
pub trait DisplayDevice: Send + Sync + 'static {
    /// CPU mapping of a device buffer. Dropping it unmaps the buffer.
    type Mapping: AsRef<[u8]> + AsMut<[u8]> + Send + 'static;

    /// Apply `format` to the display queue and return the format actually set.
    fn set_format(&self, format: &Format) -> Result<Format, DeviceError>;

    /// Request `count` buffers and return how many were actually allocated.
    fn request_buffers(&self, count: usize) -> Result<usize, DeviceError>;

    fn query_buffer(&self, index: usize) -> Result<BufferInfo, DeviceError>;

    fn map_buffer(&self, info: &BufferInfo) -> Result<Self::Mapping, DeviceError>;

    /// Release all the buffers allocated by `request_buffers`. All the mappings
    /// must have been dropped before this is called.
    fn release_buffers(&self) -> Result<(), DeviceError>;

    /// Submit buffer `index` for display.
    fn enqueue(&self, index: usize, timestamp: Duration, bytes_used: usize)
        -> Result<(), DeviceError>;

    /// Poll the completion queue without blocking. Returns `Ok(None)` if no
    /// buffer has finished being displayed yet.
    fn dequeue(&self) -> Result<Option<usize>, DeviceError>;

    fn stream_on(&self) -> Result<(), DeviceError>;

    /// Stop streaming. All the queued buffers are returned to user-space.
    fn stream_off(&self) -> Result<(), DeviceError>;

    /// Set the area of the display frames are shown into.
    fn set_target(&self, rect: Rect) -> Result<(), DeviceError>;

    /// Set the colorkey of the overlay. Devices without overlay support
    /// ignore it.
    fn set_colorkey(&self, _key: u32) -> Result<(), DeviceError> {
        Ok(())
    }

    /// Whether the target rectangle can be changed while streaming.
    fn supports_hot_reconfig(&self) -> bool {
        false
    }
}

impl From<DeviceError> for nix::errno::Errno {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::GFmt(e) => e.into(),
            DeviceError::SFmt(e) => e.into(),
            DeviceError::Reqbufs(e) => e.into(),
            DeviceError::QueryBuf(e) => e.into(),
            DeviceError::Mmap(e) => e.into(),
            DeviceError::QBuf(e) => e.into(),
            DeviceError::DqBuf(e) => e.into(),
            DeviceError::StreamOn(e) => e.into(),
            DeviceError::StreamOff(e) => e.into(),
            DeviceError::GSelection(e) => e.into(),
            DeviceError::SSelection(e) => e.into(),
            DeviceError::NotSupported => nix::errno::Errno::ENOTTY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ioctl::IntoErrno;
    use nix::errno::Errno;

    #[test]
    fn test_device_error_into_errno() {
        let err = DeviceError::from(ReqbufsError::Busy);
        assert_eq!(err.into_errno(), Errno::EBUSY as i32);

        let err = DeviceError::from(DqBufError::NotReady);
        assert_eq!(err.into_errno(), Errno::EAGAIN as i32);

        assert_eq!(DeviceError::NotSupported.into_errno(), Errno::ENOTTY as i32);
    }
}
