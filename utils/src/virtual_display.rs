//! A display device backed by heap memory, that consumes the frames queued to
//! it at a fixed refresh rate. Useful to run a sink without video output
//! hardware.
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use log::debug;

use v4l2sink::device::{BufferInfo, DeviceError, DisplayDevice};
use v4l2sink::ioctl::{DqBufError, QBufError, QueryBufError, ReqbufsError, StreamOnError};
use v4l2sink::{Format, Rect};

/// Maximum number of buffers the virtual display allocates.
const MAX_BUFFERS: usize = 32;
/// Base of the fake physical addresses reported for buffers.
const PHYS_BASE: u64 = 0x4000_0000;

struct QueuedFrame {
    index: usize,
    /// When the frame will be done displaying.
    done_at: Instant,
}

#[derive(Default)]
struct DisplayState {
    format: Format,
    num_buffers: usize,
    streaming: bool,
    queued: VecDeque<QueuedFrame>,
    /// End of the display period of the last queued frame.
    last_done_at: Option<Instant>,
    target: Option<Rect>,
    colorkey: Option<u32>,
    frames_displayed: u64,
}

/// Virtual display device.
///
/// Each queued frame is displayed for one refresh period, after the frames
/// queued before it, and can be dequeued once its period is over.
pub struct VirtualDisplay {
    refresh: Duration,
    state: Mutex<DisplayState>,
}

impl VirtualDisplay {
    pub fn new(refresh: Duration) -> Self {
        VirtualDisplay {
            refresh,
            state: Default::default(),
        }
    }

    /// Create a display refreshing `rate` times per second.
    pub fn with_rate(rate: u32) -> Self {
        Self::new(Duration::from_secs(1) / rate.max(1))
    }

    fn state(&self) -> MutexGuard<'_, DisplayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn refresh(&self) -> Duration {
        self.refresh
    }

    /// Number of frames that have completed their display period.
    pub fn frames_displayed(&self) -> u64 {
        self.state().frames_displayed
    }

    pub fn target(&self) -> Option<Rect> {
        self.state().target
    }

    pub fn colorkey(&self) -> Option<u32> {
        self.state().colorkey
    }
}

impl DisplayDevice for VirtualDisplay {
    type Mapping = Vec<u8>;

    fn set_format(&self, format: &Format) -> Result<Format, DeviceError> {
        let mut format = format.clone();
        // Assume 16 bits per pixel if the caller did not say otherwise.
        if format.bytesperline == 0 {
            format.bytesperline = format.width * 2;
        }
        format.sizeimage = format
            .sizeimage
            .max(format.bytesperline * format.height);

        self.state().format = format.clone();
        Ok(format)
    }

    fn request_buffers(&self, count: usize) -> Result<usize, DeviceError> {
        let mut state = self.state();
        if state.streaming {
            return Err(ReqbufsError::Busy.into());
        }
        state.num_buffers = count.min(MAX_BUFFERS);
        debug!("Virtual display allocated {} buffers", state.num_buffers);
        Ok(state.num_buffers)
    }

    fn query_buffer(&self, index: usize) -> Result<BufferInfo, DeviceError> {
        let state = self.state();
        if index >= state.num_buffers {
            return Err(QueryBufError::InvalidIndex(index).into());
        }
        let length = state.format.frame_size();
        Ok(BufferInfo {
            index,
            mem_offset: (index * length) as u32,
            length,
            phys_addr: PHYS_BASE + (index * length) as u64,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> Result<Self::Mapping, DeviceError> {
        Ok(vec![0u8; info.length])
    }

    fn release_buffers(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.streaming {
            return Err(ReqbufsError::Busy.into());
        }
        state.num_buffers = 0;
        Ok(())
    }

    fn enqueue(
        &self,
        index: usize,
        _timestamp: Duration,
        _bytes_used: usize,
    ) -> Result<(), DeviceError> {
        let mut state = self.state();
        if index >= state.num_buffers || state.queued.iter().any(|f| f.index == index) {
            return Err(QBufError::InvalidBuffer(index).into());
        }

        let now = Instant::now();
        let start = match state.last_done_at {
            Some(last) if last > now => last,
            _ => now,
        };
        let done_at = start + self.refresh;
        state.last_done_at = Some(done_at);
        state.queued.push_back(QueuedFrame { index, done_at });
        Ok(())
    }

    fn dequeue(&self) -> Result<Option<usize>, DeviceError> {
        let mut state = self.state();
        if !state.streaming {
            return Err(DqBufError::NotStreaming.into());
        }
        match state.queued.front() {
            Some(frame) if frame.done_at <= Instant::now() => {
                let index = frame.index;
                state.queued.pop_front();
                state.frames_displayed += 1;
                Ok(Some(index))
            }
            _ => Ok(None),
        }
    }

    fn stream_on(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        if state.num_buffers == 0 {
            return Err(StreamOnError::InvalidQueue.into());
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.streaming = false;
        state.queued.clear();
        state.last_done_at = None;
        Ok(())
    }

    fn set_target(&self, rect: Rect) -> Result<(), DeviceError> {
        debug!("Virtual display target set to {}", rect);
        self.state().target = Some(rect);
        Ok(())
    }

    fn set_colorkey(&self, key: u32) -> Result<(), DeviceError> {
        self.state().colorkey = Some(key);
        Ok(())
    }

    fn supports_hot_reconfig(&self) -> bool {
        true
    }
}
