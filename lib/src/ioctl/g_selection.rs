//! Safe wrapper for the `VIDIOC_(G|S)_SELECTION` ioctls.
use std::os::unix::io::AsRawFd;

use nix::errno::Errno;
use thiserror::Error;

use crate::{bindings, Rect};

/// Selection targets meaningful on an output queue. `Compose` is the area of
/// the display the frames are shown in; `Crop` is the part of the frame that
/// gets displayed.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTarget {
    Crop = bindings::V4L2_SEL_TGT_CROP,
    Compose = bindings::V4L2_SEL_TGT_COMPOSE,
}

#[doc(hidden)]
mod ioctl {
    use crate::bindings::v4l2_selection;
    nix::ioctl_readwrite!(vidioc_g_selection, b'V', 94, v4l2_selection);
    nix::ioctl_readwrite!(vidioc_s_selection, b'V', 95, v4l2_selection);
}

#[derive(Debug, Error)]
pub enum GSelectionError {
    #[error("invalid type or target requested")]
    Invalid,
    #[error("unexpected ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<GSelectionError> for Errno {
    fn from(err: GSelectionError) -> Self {
        match err {
            GSelectionError::Invalid => Errno::EINVAL,
            GSelectionError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_G_SELECTION` ioctl on the video output queue.
pub fn g_selection(fd: &impl AsRawFd, target: SelectionTarget) -> Result<Rect, GSelectionError> {
    let mut sel = bindings::v4l2_selection {
        type_: bindings::V4L2_BUF_TYPE_VIDEO_OUTPUT,
        target: target as u32,
        ..Default::default()
    };

    match unsafe { ioctl::vidioc_g_selection(fd.as_raw_fd(), &mut sel) } {
        Ok(_) => Ok(Rect::from(sel.r)),
        Err(Errno::EINVAL) => Err(GSelectionError::Invalid),
        Err(e) => Err(GSelectionError::IoctlError(e)),
    }
}

#[derive(Debug, Error)]
pub enum SSelectionError {
    #[error("invalid type, target or rectangle requested")]
    Invalid,
    #[error("rectangle does not fit the constraints of the device")]
    OutOfRange,
    #[error("selection cannot be changed while streaming")]
    Busy,
    #[error("unexpected ioctl error: {0}")]
    IoctlError(Errno),
}

impl From<SSelectionError> for Errno {
    fn from(err: SSelectionError) -> Self {
        match err {
            SSelectionError::Invalid => Errno::EINVAL,
            SSelectionError::OutOfRange => Errno::ERANGE,
            SSelectionError::Busy => Errno::EBUSY,
            SSelectionError::IoctlError(e) => e,
        }
    }
}

/// Safe wrapper around the `VIDIOC_S_SELECTION` ioctl on the video output queue.
///
/// Returns the rectangle actually applied by the driver.
pub fn s_selection(
    fd: &impl AsRawFd,
    target: SelectionTarget,
    rect: Rect,
) -> Result<Rect, SSelectionError> {
    let mut sel = bindings::v4l2_selection {
        type_: bindings::V4L2_BUF_TYPE_VIDEO_OUTPUT,
        target: target as u32,
        r: rect.into(),
        ..Default::default()
    };

    match unsafe { ioctl::vidioc_s_selection(fd.as_raw_fd(), &mut sel) } {
        Ok(_) => Ok(Rect::from(sel.r)),
        Err(Errno::EINVAL) => Err(SSelectionError::Invalid),
        Err(Errno::ERANGE) => Err(SSelectionError::OutOfRange),
        Err(Errno::EBUSY) => Err(SSelectionError::Busy),
        Err(e) => Err(SSelectionError::IoctlError(e)),
    }
}
