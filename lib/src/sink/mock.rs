//! Deterministic display device used to exercise the sink engine.
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use crate::device::{BufferInfo, DeviceError, DisplayDevice};
use crate::ioctl::{QBufError, StreamOnError};
use crate::{Format, Rect};

#[derive(Default)]
struct MockState {
    /// Buffers queued to the display, oldest first.
    queued: VecDeque<usize>,
    /// Buffers done displaying, ready to be dequeued.
    completed: VecDeque<usize>,
    auto_complete: bool,
    streaming: bool,
    fail_next_enqueue: bool,
    fail_stream_on: bool,
    enqueue_calls: usize,
    dequeue_calls: usize,
    stream_on_calls: usize,
    stream_off_calls: usize,
    release_calls: usize,
    bytes_used: Vec<usize>,
    targets: Vec<Rect>,
    colorkeys: Vec<u32>,
    buffer_len: usize,
}

pub(super) struct MockDevice {
    state: Mutex<MockState>,
    max_buffers: usize,
    hot_reconfig: bool,
}

impl MockDevice {
    pub(super) fn new() -> Self {
        MockDevice {
            state: Default::default(),
            max_buffers: 32,
            hot_reconfig: false,
        }
    }

    /// Grant at most `max_buffers` buffers on request.
    pub(super) fn max_buffers(self, max_buffers: usize) -> Self {
        MockDevice {
            max_buffers,
            ..self
        }
    }

    pub(super) fn hot_reconfig(self) -> Self {
        MockDevice {
            hot_reconfig: true,
            ..self
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Make dequeue return the oldest queued buffer as soon as it is called.
    pub(super) fn set_auto_complete(&self, auto_complete: bool) {
        self.state().auto_complete = auto_complete;
    }

    /// Mark the `count` oldest queued buffers as displayed.
    pub(super) fn complete(&self, count: usize) {
        let mut state = self.state();
        for _ in 0..count {
            match state.queued.pop_front() {
                Some(index) => state.completed.push_back(index),
                None => break,
            }
        }
    }

    /// Make the next dequeue return `index`, whether it has been queued or not.
    pub(super) fn inject_completion(&self, index: usize) {
        self.state().completed.push_back(index);
    }

    pub(super) fn fail_next_enqueue(&self) {
        self.state().fail_next_enqueue = true;
    }

    pub(super) fn fail_stream_on(&self) {
        self.state().fail_stream_on = true;
    }

    pub(super) fn queued(&self) -> Vec<usize> {
        self.state().queued.iter().copied().collect()
    }

    pub(super) fn enqueue_calls(&self) -> usize {
        self.state().enqueue_calls
    }

    pub(super) fn dequeue_calls(&self) -> usize {
        self.state().dequeue_calls
    }

    pub(super) fn stream_on_calls(&self) -> usize {
        self.state().stream_on_calls
    }

    pub(super) fn stream_off_calls(&self) -> usize {
        self.state().stream_off_calls
    }

    pub(super) fn release_calls(&self) -> usize {
        self.state().release_calls
    }

    pub(super) fn is_streaming(&self) -> bool {
        self.state().streaming
    }

    pub(super) fn bytes_used(&self) -> Vec<usize> {
        self.state().bytes_used.clone()
    }

    pub(super) fn targets(&self) -> Vec<Rect> {
        self.state().targets.clone()
    }

    pub(super) fn colorkeys(&self) -> Vec<u32> {
        self.state().colorkeys.clone()
    }
}

impl DisplayDevice for MockDevice {
    type Mapping = Vec<u8>;

    fn set_format(&self, format: &Format) -> Result<Format, DeviceError> {
        let mut format = format.clone();
        if format.bytesperline == 0 {
            format.bytesperline = format.width * 2;
        }
        if format.sizeimage == 0 {
            format.sizeimage = format.bytesperline * format.height;
        }
        self.state().buffer_len = format.sizeimage as usize;
        Ok(format)
    }

    fn request_buffers(&self, count: usize) -> Result<usize, DeviceError> {
        Ok(count.min(self.max_buffers))
    }

    fn query_buffer(&self, index: usize) -> Result<BufferInfo, DeviceError> {
        let length = self.state().buffer_len;
        Ok(BufferInfo {
            index,
            mem_offset: (index * length) as u32,
            length,
            phys_addr: 0x1000_0000 + (index * length) as u64,
        })
    }

    fn map_buffer(&self, info: &BufferInfo) -> Result<Self::Mapping, DeviceError> {
        Ok(vec![0u8; info.length])
    }

    fn release_buffers(&self) -> Result<(), DeviceError> {
        self.state().release_calls += 1;
        Ok(())
    }

    fn enqueue(
        &self,
        index: usize,
        _timestamp: Duration,
        bytes_used: usize,
    ) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.enqueue_calls += 1;
        if state.fail_next_enqueue {
            state.fail_next_enqueue = false;
            return Err(QBufError::InvalidBuffer(index).into());
        }
        state.queued.push_back(index);
        state.bytes_used.push(bytes_used);
        Ok(())
    }

    fn dequeue(&self) -> Result<Option<usize>, DeviceError> {
        let mut state = self.state();
        state.dequeue_calls += 1;
        if let Some(index) = state.completed.pop_front() {
            return Ok(Some(index));
        }
        if state.auto_complete && state.streaming {
            return Ok(state.queued.pop_front());
        }
        Ok(None)
    }

    fn stream_on(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.stream_on_calls += 1;
        if state.fail_stream_on {
            return Err(StreamOnError::InvalidQueue.into());
        }
        state.streaming = true;
        Ok(())
    }

    fn stream_off(&self) -> Result<(), DeviceError> {
        let mut state = self.state();
        state.stream_off_calls += 1;
        state.streaming = false;
        state.queued.clear();
        state.completed.clear();
        Ok(())
    }

    fn set_target(&self, rect: Rect) -> Result<(), DeviceError> {
        self.state().targets.push(rect);
        Ok(())
    }

    fn set_colorkey(&self, key: u32) -> Result<(), DeviceError> {
        self.state().colorkeys.push(key);
        Ok(())
    }

    fn supports_hot_reconfig(&self) -> bool {
        self.hot_reconfig
    }
}
