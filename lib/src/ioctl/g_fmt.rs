//! Safe wrapper for the `VIDIOC_(G|S)_FMT` ioctls.
use crate::bindings;
use crate::{Format, FormatConversionError};
use nix::errno::Errno;
use std::os::unix::io::AsRawFd;
use thiserror::Error;

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_format;
    nix::ioctl_readwrite!(vidioc_g_fmt, b'V', 4, v4l2_format);
    nix::ioctl_readwrite!(vidioc_s_fmt, b'V', 5, v4l2_format);
}

#[derive(Debug, Error)]
pub enum GFmtError {
    #[error("error while converting from v4l2_format: {0}")]
    FromV4L2FormatConversionError(#[from] FormatConversionError),
    #[error("invalid buffer type requested")]
    InvalidBufferType,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<GFmtError> for Errno {
    fn from(err: GFmtError) -> Self {
        match err {
            GFmtError::FromV4L2FormatConversionError(_) => Errno::EINVAL,
            GFmtError::InvalidBufferType => Errno::EINVAL,
            GFmtError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_G_FMT` ioctl for the video output queue.
pub fn g_fmt(fd: &impl AsRawFd) -> Result<Format, GFmtError> {
    let mut fmt = bindings::v4l2_format {
        type_: bindings::V4L2_BUF_TYPE_VIDEO_OUTPUT,
        ..Default::default()
    };

    match unsafe { ioctl::vidioc_g_fmt(fd.as_raw_fd(), &mut fmt) } {
        Ok(_) => Ok(Format::try_from(fmt)?),
        Err(Errno::EINVAL) => Err(GFmtError::InvalidBufferType),
        Err(e) => Err(GFmtError::IoctlError(e)),
    }
}

#[derive(Debug, Error)]
pub enum SFmtError {
    #[error("error while converting from v4l2_format: {0}")]
    FromV4L2FormatConversionError(#[from] FormatConversionError),
    #[error("invalid buffer type requested")]
    InvalidBufferType,
    #[error("device currently busy")]
    DeviceBusy,
    #[error("ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<SFmtError> for Errno {
    fn from(err: SFmtError) -> Self {
        match err {
            SFmtError::FromV4L2FormatConversionError(_) => Errno::EINVAL,
            SFmtError::InvalidBufferType => Errno::EINVAL,
            SFmtError::DeviceBusy => Errno::EBUSY,
            SFmtError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_S_FMT` ioctl for the video output queue.
///
/// Returns the format actually applied by the driver, which may differ from
/// the requested one (typically `bytesperline` and `sizeimage` get filled).
pub fn s_fmt(fd: &impl AsRawFd, format: &Format) -> Result<Format, SFmtError> {
    let mut fmt = bindings::v4l2_format::from(format);

    match unsafe { ioctl::vidioc_s_fmt(fd.as_raw_fd(), &mut fmt) } {
        Ok(_) => Ok(Format::try_from(fmt)?),
        Err(Errno::EINVAL) => Err(SFmtError::InvalidBufferType),
        Err(Errno::EBUSY) => Err(SFmtError::DeviceBusy),
        Err(e) => Err(SFmtError::IoctlError(e)),
    }
}
