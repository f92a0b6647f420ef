//! A V4L2 video output device, implementing the [`DisplayDevice`] contract
//! the sink engine relies on.
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use nix::libc;
use thiserror::Error;

use crate::ioctl::{
    self, BufferCapabilities, BufferMapping, Capabilities, Capability, DqBufError, QBuffer,
    RequestBuffers,
};
use crate::memory::MemoryType;
use crate::{Format, Rect};

mod traits;
pub use traits::*;

#[derive(Default)]
pub struct DeviceConfig {
    non_blocking_dqbuf: bool,
    hot_reconfig: bool,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Default::default()
    }

    /// Open the device in non-blocking mode, so polling the completion queue
    /// never sleeps.
    pub fn non_blocking_dqbuf(self) -> Self {
        DeviceConfig {
            non_blocking_dqbuf: true,
            ..self
        }
    }

    /// Declare that the driver accepts target rectangle changes while
    /// streaming.
    pub fn hot_reconfig(self) -> Self {
        DeviceConfig {
            hot_reconfig: true,
            ..self
        }
    }
}

#[derive(Debug, Error)]
pub enum DeviceOpenError {
    #[error("error while opening device: {0}")]
    Open(#[from] std::io::Error),
    #[error("error while querying capabilities: {0}")]
    QueryCap(#[from] ioctl::QueryCapError),
    #[error("device is not a streaming video output device")]
    NotAnOutputDevice,
}

pub struct Device {
    pub capability: Capability,
    file: File,
    hot_reconfig: bool,
}

impl Device {
    pub fn open(path: &Path, config: DeviceConfig) -> Result<Self, DeviceOpenError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(match config.non_blocking_dqbuf {
                true => libc::O_NONBLOCK,
                false => 0,
            })
            .open(path)?;

        let capability: Capability = ioctl::querycap(&file)?;
        let required = Capabilities::VIDEO_OUTPUT | Capabilities::STREAMING;
        if !capability.device_caps().contains(required) {
            return Err(DeviceOpenError::NotAnOutputDevice);
        }
        info!(
            "Opened {} ({}, driver {})",
            path.display(),
            capability.card,
            capability.driver
        );

        Ok(Device {
            capability,
            file,
            hot_reconfig: config.hot_reconfig,
        })
    }

    /// Returns the format currently set on the output queue.
    pub fn format(&self) -> Result<Format, DeviceError> {
        Ok(ioctl::g_fmt(self)?)
    }

    /// Returns the current target rectangle.
    pub fn target(&self) -> Result<Rect, DeviceError> {
        Ok(ioctl::g_selection(self, ioctl::SelectionTarget::Compose)?)
    }
}

impl AsRawFd for Device {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl DisplayDevice for Device {
    type Mapping = BufferMapping;

    fn set_format(&self, format: &Format) -> Result<Format, DeviceError> {
        let format = ioctl::s_fmt(self, format)?;
        debug!(
            "Output format set to {} {}x{}, {} bytes per frame",
            format.pixelformat, format.width, format.height, format.sizeimage
        );
        Ok(format)
    }

    fn request_buffers(&self, count: usize) -> Result<usize, DeviceError> {
        let reqbufs: RequestBuffers = ioctl::reqbufs(self, MemoryType::Mmap, count as u32)?;
        // Older kernels do not report capabilities at all.
        if !reqbufs.capabilities.is_empty()
            && !reqbufs
                .capabilities
                .contains(BufferCapabilities::SUPPORTS_MMAP)
        {
            warn!("Driver does not advertise MMAP buffers support");
        }
        debug!(
            "Requested {} buffers, got {} ({:?})",
            count, reqbufs.count, reqbufs.capabilities
        );
        Ok(reqbufs.count as usize)
    }

    fn query_buffer(&self, index: usize) -> Result<BufferInfo, DeviceError> {
        let querybuf = ioctl::querybuf(self, index)?;
        Ok(BufferInfo {
            index: querybuf.index,
            mem_offset: querybuf.mem_offset,
            length: querybuf.length as usize,
            // Contiguous-memory display drivers report the physical address
            // of the buffer as its mapping offset.
            phys_addr: querybuf.mem_offset as u64,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> Result<Self::Mapping, DeviceError> {
        Ok(ioctl::mmap(self, info.mem_offset, info.length as u32)?)
    }

    fn release_buffers(&self) -> Result<(), DeviceError> {
        ioctl::reqbufs::<()>(self, MemoryType::Mmap, 0)?;
        Ok(())
    }

    fn enqueue(
        &self,
        index: usize,
        timestamp: Duration,
        bytes_used: usize,
    ) -> Result<(), DeviceError> {
        let qbuf = QBuffer::new(bytes_used).set_timestamp(timestamp);
        Ok(ioctl::qbuf(self, index, &qbuf)?)
    }

    fn dequeue(&self) -> Result<Option<usize>, DeviceError> {
        match ioctl::dqbuf(self) {
            Ok(dqbuf) => {
                if dqbuf.has_error() {
                    debug!("Buffer {} was not displayed properly", dqbuf.index);
                }
                Ok(Some(dqbuf.index))
            }
            Err(DqBufError::NotReady) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn stream_on(&self) -> Result<(), DeviceError> {
        Ok(ioctl::streamon(self)?)
    }

    fn stream_off(&self) -> Result<(), DeviceError> {
        Ok(ioctl::streamoff(self)?)
    }

    fn set_target(&self, rect: Rect) -> Result<(), DeviceError> {
        let applied = ioctl::s_selection(self, ioctl::SelectionTarget::Compose, rect)?;
        if applied != rect {
            debug!("Target {} adjusted by driver to {}", rect, applied);
        }
        Ok(())
    }

    fn supports_hot_reconfig(&self) -> bool {
        self.hot_reconfig
    }
}
