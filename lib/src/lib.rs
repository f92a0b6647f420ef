//! This library implements the buffer side of a V4L2 video output sink: it
//! hands frames produced by a decoder or any other producer to a
//! memory-mapped display queue, and absorbs the speed difference between the
//! producer and the display hardware.
//!
//! It is organized in three layers:
//!
//! * The `ioctl` module provides thin, memory-safe wrappers over the subset of
//!   V4L2 ioctls a video output sink needs (format, buffer allocation, queue
//!   and dequeue, streaming and selection).
//!
//! * The `device` module defines the [`device::DisplayDevice`] trait, i.e. the
//!   index-addressed request/response contract the sink engine depends on,
//!   and implements it for a real V4L2 output device.
//!
//! * The `sink` module contains the buffer pool and pacing engine: reserved
//!   and free pools of hardware buffers, a software fallback path, the
//!   buffer state machine and the acquire/show/dequeue/recycle protocol.
//!
#[doc(hidden)]
pub mod bindings;
pub mod device;
pub mod ioctl;
pub mod memory;
pub mod sink;

use std::fmt;
use std::fmt::{Debug, Display};

use thiserror::Error;

/// A Fourcc pixel format, used to pass formats to V4L2. It can be converted
/// back and forth from a 32-bit integer, or a 4-bytes string.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    pub const fn from_fourcc(n: &[u8; 4]) -> Self {
        Self(n[0] as u32 | (n[1] as u32) << 8 | (n[2] as u32) << 16 | (n[3] as u32) << 24)
    }

    pub const fn to_fourcc(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

/// Converts a Fourcc in 32-bit integer format into the matching pixel format.
///
/// # Examples
///
/// ```
/// # use v4l2sink::PixelFormat;
/// // Fourcc representation of UYVY.
/// let uyvy = u32::from_le(0x59565955);
/// let f = PixelFormat::from(uyvy);
/// assert_eq!(u32::from(f), uyvy);
/// ```
impl From<u32> for PixelFormat {
    fn from(i: u32) -> Self {
        Self::from_u32(i)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

/// Simple way to convert a string litteral (e.g. b"I420") into a pixel
/// format that can be passed to V4L2.
///
/// # Examples
///
/// ```
/// # use v4l2sink::PixelFormat;
/// let i420 = b"YU12";
/// let f = PixelFormat::from(i420);
/// assert_eq!(&<[u8; 4]>::from(f), i420);
/// ```
impl From<&[u8; 4]> for PixelFormat {
    fn from(n: &[u8; 4]) -> Self {
        Self::from_fourcc(n)
    }
}

impl From<PixelFormat> for [u8; 4] {
    fn from(format: PixelFormat) -> Self {
        format.to_fourcc()
    }
}

/// Produces a debug string for this PixelFormat, including its hexadecimal
/// and string representation.
///
/// # Examples
///
/// ```
/// # use v4l2sink::PixelFormat;
/// let f = PixelFormat::from(b"UYVY");
/// assert_eq!(format!("{:?}", f), "0x59565955 (UYVY)");
/// ```
impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x} ({})", self.0, self))
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let fourcc = self
            .0
            .to_le_bytes()
            .iter()
            .map(|&x| x as char)
            .collect::<String>();
        f.write_str(fourcc.as_str())
    }
}

/// Single-planar format of the frames submitted to the display queue.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct Format {
    /// Width of the image in pixels.
    pub width: u32,
    /// Height of the image in pixels.
    pub height: u32,
    /// Format each pixel is encoded in.
    pub pixelformat: PixelFormat,
    /// Bytes per line of data.
    pub bytesperline: u32,
    /// Size of a whole frame in bytes; the backing memory must be at least
    /// that large.
    pub sizeimage: u32,
}

impl Format {
    /// Size in bytes of a frame of this format, as a `usize`.
    pub fn frame_size(&self) -> usize {
        self.sizeimage as usize
    }
}

/// Quickly build a usable `Format` from a pixel format and resolution. The
/// line and frame sizes are left for the driver to fill.
///
/// # Examples
///
/// ```
/// # use v4l2sink::Format;
/// let f = Format::from((b"UYVY", (720, 576)));
/// assert_eq!(f.width, 720);
/// assert_eq!(f.height, 576);
/// assert_eq!(f.pixelformat.to_string(), "UYVY");
/// assert_eq!(f.sizeimage, 0);
/// ```
impl<T: Into<PixelFormat>> From<(T, (usize, usize))> for Format {
    fn from((pixel_format, (width, height)): (T, (usize, usize))) -> Self {
        Format {
            width: width as u32,
            height: height as u32,
            pixelformat: pixel_format.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatConversionError {
    #[error("invalid buffer type {0} for a single-planar output format")]
    InvalidBufferType(u32),
}

impl TryFrom<bindings::v4l2_format> for Format {
    type Error = FormatConversionError;

    fn try_from(fmt: bindings::v4l2_format) -> Result<Self, Self::Error> {
        match fmt.type_ {
            bindings::V4L2_BUF_TYPE_VIDEO_OUTPUT => {
                // Safe because the type tells us `pix` is the active member.
                let pix = unsafe { &fmt.fmt.pix };
                Ok(Format {
                    width: pix.width,
                    height: pix.height,
                    pixelformat: PixelFormat::from(pix.pixelformat),
                    bytesperline: pix.bytesperline,
                    sizeimage: pix.sizeimage,
                })
            }
            t => Err(FormatConversionError::InvalidBufferType(t)),
        }
    }
}

impl From<&Format> for bindings::v4l2_format {
    fn from(format: &Format) -> Self {
        let mut v4l2_fmt = bindings::v4l2_format {
            type_: bindings::V4L2_BUF_TYPE_VIDEO_OUTPUT,
            ..Default::default()
        };
        v4l2_fmt.fmt.pix = bindings::v4l2_pix_format {
            width: format.width,
            height: format.height,
            pixelformat: format.pixelformat.into(),
            field: bindings::V4L2_FIELD_ANY,
            bytesperline: format.bytesperline,
            sizeimage: format.sizeimage,
            ..Default::default()
        };

        v4l2_fmt
    }
}

/// A more elegant representation for `v4l2_rect`. This is the target
/// rectangle of the display window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Rect {
        Rect {
            left,
            top,
            width,
            height,
        }
    }

    /// Returns whether the rectangle covers no pixel at all.
    ///
    /// # Examples
    ///
    /// ```
    /// # use v4l2sink::Rect;
    /// assert!(Rect::new(10, 10, 0, 240).is_empty());
    /// assert!(!Rect::new(0, 0, 320, 240).is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl From<bindings::v4l2_rect> for Rect {
    fn from(rect: bindings::v4l2_rect) -> Self {
        Rect {
            left: rect.left,
            top: rect.top,
            width: rect.width,
            height: rect.height,
        }
    }
}

impl From<Rect> for bindings::v4l2_rect {
    fn from(rect: Rect) -> Self {
        bindings::v4l2_rect {
            left: rect.left,
            top: rect.top,
            width: rect.width,
            height: rect.height,
        }
    }
}

impl Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}), {}x{}",
            self.left, self.top, self.width, self.height
        )
    }
}
