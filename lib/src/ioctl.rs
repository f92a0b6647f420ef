//! This module provides safer versions of the V4L2 ioctls used by an output
//! sink, through simple functions working on a `RawFd`. The `device` module
//! builds on it and is very likely a better fit for application code.
//!
//! V4L2 ioctls are usually called with a single structure as argument, which
//! serves to store both the input and output of the ioctl. Each proxy
//! function here takes the relevant input as parameters and takes care of
//! managing the structure passed to the kernel, then converts the filled
//! structure into a safer type.
//!
//! Every ioctl also has its own error type: this helps discern scenarios where
//! the ioctl returned non-zero, but the situation is not necessarily an error.
//! For instance, `VIDIOC_DQBUF` returns `EAGAIN` if no buffer is available to
//! dequeue, which is represented by its own variant. Actual errors are
//! captured by the `IoctlError` variants, and all error types can be
//! converted to their original error code using their `Into<Errno>`
//! implementation.

mod dqbuf;
mod g_fmt;
mod g_selection;
mod mmap;
mod qbuf;
mod querybuf;
mod querycap;
mod reqbufs;
mod streamon;

pub use dqbuf::*;
pub use g_fmt::*;
pub use g_selection::*;
pub use mmap::*;
pub use qbuf::*;
pub use querybuf::*;
pub use querycap::*;
pub use reqbufs::*;
pub use streamon::*;

use std::ffi::CStr;
use std::ffi::FromBytesWithNulError;

use bitflags::bitflags;
use nix::errno::Errno;

use crate::bindings;

/// Utility function for sub-modules.
/// Constructs an owned String instance from a slice containing a nul-terminated
/// C string, after checking that the passed slice indeed contains a nul
/// character.
fn string_from_cstr(c_str: &[u8]) -> Result<String, FromBytesWithNulError> {
    // Make sure that our string contains a nul character.
    let slice = match c_str.iter().position(|x| *x == b'\0') {
        // Pass the full slice, `from_bytes_with_nul` will return an error.
        None => c_str,
        Some(pos) => &c_str[..pos + 1],
    };

    Ok(CStr::from_bytes_with_nul(slice)?
        .to_string_lossy()
        .into_owned())
}

/// Extension trait for allowing easy conversion of ioctl errors into their originating error code.
pub trait IntoErrno {
    fn into_errno(self) -> i32;
}

impl<T> IntoErrno for T
where
    T: Into<Errno>,
{
    fn into_errno(self) -> i32 {
        self.into() as i32
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// `flags` member of `struct v4l2_buffer`.
    pub struct BufferFlags: u32 {
        const MAPPED = bindings::V4L2_BUF_FLAG_MAPPED;
        const QUEUED = bindings::V4L2_BUF_FLAG_QUEUED;
        const DONE = bindings::V4L2_BUF_FLAG_DONE;
        const ERROR = bindings::V4L2_BUF_FLAG_ERROR;
        const TIMESTAMP_COPY = bindings::V4L2_BUF_FLAG_TIMESTAMP_COPY;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_from_cstr() {
        // Nul-terminated slice.
        assert_eq!(string_from_cstr(b"mxc_v4l2\0"), Ok(String::from("mxc_v4l2")));

        // Slice with nul in the middle and not nul-terminated.
        assert_eq!(string_from_cstr(b"abc\0def"), Ok(String::from("abc")));

        // Slice without nul.
        match string_from_cstr(b"output") {
            Err(_) => {}
            Ok(_) => panic!(),
        };
    }

    #[test]
    fn test_into_errno() {
        let err = DqBufError::IoctlError(Errno::EIO);
        assert_eq!(err.into_errno(), Errno::EIO as i32);
        assert_eq!(DqBufError::NotReady.into_errno(), Errno::EAGAIN as i32);
    }
}
