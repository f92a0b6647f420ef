use std::num::NonZeroUsize;
use std::ops::{Deref, DerefMut};
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::slice;

use log::error;
use nix::errno::Errno;
use nix::libc::{self, c_void, off_t};
use thiserror::Error;

/// A mapping of a device buffer into the address space of the process. The
/// mapping remains valid until it is dropped.
#[derive(Debug)]
pub struct BufferMapping {
    data: NonNull<u8>,
    len: NonZeroUsize,
}

// The mapping is plain shared memory, it can be accessed from any thread as
// long as Rust's aliasing rules are respected, which `&`/`&mut` take care of.
unsafe impl Send for BufferMapping {}
unsafe impl Sync for BufferMapping {}

impl BufferMapping {
    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    /// Address of the mapping in the process' address space.
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr()
    }
}

impl Deref for BufferMapping {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        // Safe because the pointer and length were constructed in mmap() and
        // are always valid.
        unsafe { slice::from_raw_parts(self.data.as_ptr(), self.len.get()) }
    }
}

impl DerefMut for BufferMapping {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // Safe because the pointer and length were constructed in mmap() and
        // are always valid, and we hold the only reference to the mapping.
        unsafe { slice::from_raw_parts_mut(self.data.as_ptr(), self.len.get()) }
    }
}

impl AsRef<[u8]> for BufferMapping {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for BufferMapping {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl Drop for BufferMapping {
    fn drop(&mut self) {
        // Safe because the pointer and length were constructed in mmap() and
        // are always valid.
        let ret = unsafe { libc::munmap(self.data.as_ptr() as *mut c_void, self.len.get()) };
        if ret < 0 {
            error!("Error while unmapping buffer: {}", Errno::last());
        }
    }
}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("cannot map a zero-sized buffer")]
    ZeroLength,
    #[error("mmap error: {0}")]
    IoctlError(#[from] Errno),
}

impl From<MmapError> for Errno {
    fn from(err: MmapError) -> Self {
        match err {
            MmapError::ZeroLength => Errno::EINVAL,
            MmapError::IoctlError(e) => e,
        }
    }
}

/// Map the device buffer found at `mem_offset` (as returned by `querybuf`)
/// for reading and writing.
pub fn mmap(fd: &impl AsRawFd, mem_offset: u32, length: u32) -> Result<BufferMapping, MmapError> {
    let len = NonZeroUsize::new(length as usize).ok_or(MmapError::ZeroLength)?;

    // Safe because we are requesting a new mapping, not touching existing memory.
    let data = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len.get(),
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd.as_raw_fd(),
            mem_offset as off_t,
        )
    };
    if data == libc::MAP_FAILED {
        return Err(MmapError::IoctlError(Errno::last()));
    }

    Ok(BufferMapping {
        data: NonNull::new(data as *mut u8).ok_or(MmapError::IoctlError(Errno::EFAULT))?,
        len,
    })
}
