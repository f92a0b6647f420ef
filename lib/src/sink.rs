//! Buffer pool and display-queue pacing engine.
//!
//! A [`SinkController`] owns the hardware buffers of a [`DisplayDevice`] and
//! hands them to a producer through [`SinkController::acquire`]. The producer
//! fills the returned [`DisplayBuffer`] and passes it back to
//! [`SinkController::show`], which submits it to the display queue. Buffers
//! come back from the device through [`SinkController::dequeue`], and return
//! to their pool once their last owner lets go of them.
//!
//! When no hardware buffer becomes available in time, `acquire` hands out a
//! buffer allocated on the heap instead. Such a frame is copied into a buffer
//! of the reserved pool when shown, which is why a few hardware buffers are
//! always kept aside.
//!
//! Two locks protect the state of the sink: the pool lock, covering the pools,
//! the slot table and the queue accounting; and the configuration lock,
//! covering the display geometry. The configuration lock may be held while
//! taking the pool lock, never the reverse. Neither is held while a buffer is
//! recycled.
mod buffer;
mod config;
#[cfg(test)]
mod mock;
mod monitor;
mod pool;
mod stats;

pub use buffer::*;
pub use config::*;
pub use monitor::*;
pub use pool::{FreePool, InFlightQueue, ReservedPool};
pub use stats::*;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use bitflags::bitflags;
use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::device::{DeviceError, DisplayDevice};
use crate::memory::{Backing, HardwareMemory};
use crate::{Format, Rect};

use pool::SlotTable;
use stats::Counters;

bitflags! {
    /// Display settings that need to be applied to the device before the next
    /// frame is shown.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ReconfigFlags: u32 {
        const GEOMETRY = 1 << 0;
        const COLORKEY = 1 << 1;
    }
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error("sink is already started")]
    AlreadyStarted,
    #[error("buffers of the previous session are still in use")]
    BuffersInUse,
    #[error("device did not allocate any buffer")]
    NoBuffers,
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("sink is not started")]
    NotStarted,
    #[error("cannot allocate a software buffer of {0} bytes")]
    OutOfMemory(usize),
}

#[derive(Debug, Error)]
pub enum ShowError {
    #[error("sink is not started")]
    NotStarted,
    #[error("error while queueing buffer: {0}")]
    Enqueue(DeviceError),
    #[error("error while starting stream: {0}")]
    StreamOn(DeviceError),
    #[error("error while reconfiguring display: {0}")]
    Reconfigure(DeviceError),
}

/// A request to give a buffer back to its pool.
pub(crate) enum Release<M> {
    /// A buffer handed to the producer has been dropped.
    Handle {
        backing: Backing<M>,
        state: BufferState,
        session: u64,
    },
    /// A buffer under device or pool custody has reached `Showed`.
    Slot { index: usize, session: u64 },
}

/// Memory of a buffer found in an unexpected state.
struct Parked<M> {
    session: u64,
    backing: Backing<M>,
}

/// State protected by the pool lock.
struct PoolState<M> {
    current: Option<SlotTable<M>>,
    /// Table of a stopped session whose buffers are not all freed yet.
    retired: Option<SlotTable<M>>,
    reserved: ReservedPool,
    free: FreePool,
    in_flight: InFlightQueue,
    /// Buffers taken back from the device by `suspend`, recycled on `resume`.
    pending_recycle: Vec<usize>,
    /// Memory of buffers found in an unexpected state. Never reused.
    quarantine: Vec<Parked<M>>,
    format: Format,
    buffers_required: usize,
    queued_count: usize,
    streaming: bool,
    suspended: bool,
    shows_in_cycle: usize,
    next_session: u64,
}

/// State protected by the configuration lock.
#[derive(Default)]
struct ConfigState {
    pending: ReconfigFlags,
    target: Option<Rect>,
    colorkey: Option<u32>,
    geometry: Option<Box<dyn GeometryProvider + Send>>,
}

pub(crate) struct SinkInner<D: DisplayDevice> {
    device: Arc<D>,
    config: SinkConfig,
    pool: Mutex<PoolState<D::Mapping>>,
    display: Mutex<ConfigState>,
    counters: Counters,
}

impl<D: DisplayDevice> SinkInner<D> {
    fn lock_pool(&self) -> MutexGuard<'_, PoolState<D::Mapping>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_config(&self) -> MutexGuard<'_, ConfigState> {
        self.display.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give a buffer back to its pool, or free it. Must not be called with
    /// the pool lock held.
    pub(crate) fn recycle(&self, release: Release<D::Mapping>) {
        let (index, session, memory) = match release {
            Release::Handle {
                backing: Backing::Software { data },
                state,
                session,
            } => {
                self.finalize_software(data, state, session);
                return;
            }
            Release::Handle {
                backing: Backing::Hardware { index, memory },
                state,
                session,
            } => {
                trace!("Buffer {} released by producer in state {:?}", index, state);
                (index, session, Some(memory))
            }
            Release::Slot { index, session } => (index, session, None),
        };

        let emptied = {
            let mut pool = self.lock_pool();
            self.finalize_hardware(&mut pool, index, session, memory)
        };

        if let Some(table) = emptied {
            self.release_table(table);
        }
    }

    fn finalize_software(&self, data: Vec<u8>, state: BufferState, session: u64) {
        match state {
            BufferState::Allocated => {
                trace!("Software buffer dropped without being shown");
                self.counters.frame_dropped();
            }
            BufferState::Showed => (),
            state => {
                error!(
                    "Software buffer released in unexpected state {:?}, parking it",
                    state
                );
                self.counters.buffer_parked();
                self.lock_pool().quarantine.push(Parked {
                    session,
                    backing: Backing::Software { data },
                });
            }
        }
    }

    /// Applies the recycle policy to hardware buffer `index`. Returns the slot
    /// table if its last buffer has just been freed.
    fn finalize_hardware(
        &self,
        pool: &mut PoolState<D::Mapping>,
        index: usize,
        session: u64,
        memory: Option<HardwareMemory<D::Mapping>>,
    ) -> Option<SlotTable<D::Mapping>> {
        let PoolState {
            current,
            retired,
            reserved,
            free,
            quarantine,
            ..
        } = pool;

        let in_current = current.as_ref().map_or(false, |t| t.session == session);
        let table = if in_current {
            current.as_mut()
        } else {
            retired.as_mut().filter(|t| t.session == session)
        };
        let Some(table) = table else {
            debug!("Freeing buffer {} of finished session {}", index, session);
            return None;
        };
        let Some(slot) = table.get_mut(index) else {
            error!("Buffer index {} out of range, ignoring release", index);
            return None;
        };

        if let Some(memory) = memory {
            if slot.memory.is_some() || slot.state == BufferState::Illegal {
                error!("Buffer {} released twice, parking it", index);
                self.counters.buffer_parked();
                quarantine.push(Parked {
                    session,
                    backing: Backing::Hardware { index, memory },
                });
                return None;
            }
            slot.memory = Some(memory);
        }

        if slot.state == BufferState::Allocated {
            self.counters.frame_dropped();
            slot.state = BufferState::Showed;
        }

        let state = slot.state;
        match state {
            BufferState::Showed => {
                slot.state = BufferState::Idle;
                slot.show_count = 0;
                if let Err(index) = reserved.push(index) {
                    free.push(index);
                }
                trace!("Buffer {} back to pool", index);
                None
            }
            BufferState::Free => {
                table.free_slot(index);
                debug!(
                    "Buffer {} freed, {} buffers of session {} left",
                    index, table.live, session
                );
                if table.live > 0 {
                    None
                } else if in_current {
                    current.take()
                } else {
                    retired.take()
                }
            }
            BufferState::Illegal => None,
            state => {
                error!(
                    "Buffer {} recycled in unexpected state {:?}, parking it",
                    index, state
                );
                self.counters.buffer_parked();
                None
            }
        }
    }

    /// Releases the device buffers of a table whose slots have all been freed.
    fn release_table(&self, table: SlotTable<D::Mapping>) {
        debug!("Releasing device buffers of session {}", table.session);
        drop(table);
        if let Err(e) = self.device.release_buffers() {
            warn!("Cannot release device buffers: {}", e);
        }
    }
}

/// Handle to the buffer pool and pacing engine of a display device.
///
/// The handle can be cloned and shared between the streaming thread, a
/// monitor thread and a teardown thread.
pub struct SinkController<D: DisplayDevice> {
    inner: Arc<SinkInner<D>>,
}

impl<D: DisplayDevice> Clone for SinkController<D> {
    fn clone(&self) -> Self {
        SinkController {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: DisplayDevice> SinkController<D> {
    pub fn new(device: D, config: SinkConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(SinkController {
            inner: Arc::new(SinkInner {
                device: Arc::new(device),
                counters: Counters::new(config.drop_log_interval),
                pool: Mutex::new(PoolState {
                    current: None,
                    retired: None,
                    reserved: ReservedPool::new(config.reserved_depth),
                    free: Default::default(),
                    in_flight: Default::default(),
                    pending_recycle: Vec::new(),
                    quarantine: Vec::new(),
                    format: Default::default(),
                    buffers_required: 0,
                    queued_count: 0,
                    streaming: false,
                    suspended: false,
                    shows_in_cycle: 0,
                    next_session: 1,
                }),
                display: Default::default(),
                config,
            }),
        })
    }

    pub fn device(&self) -> &D {
        &self.inner.device
    }

    pub fn config(&self) -> &SinkConfig {
        &self.inner.config
    }

    /// Set the format of the display queue and allocate its buffers.
    ///
    /// Returns the format actually applied by the device. The number of
    /// buffers in use is the number the device granted, which can differ from
    /// the configured one.
    pub fn start(&self, format: &Format) -> Result<Format, StartError> {
        {
            let pool = self.inner.lock_pool();
            if pool.current.is_some() {
                return Err(StartError::AlreadyStarted);
            }
            if pool.retired.is_some() {
                return Err(StartError::BuffersInUse);
            }
        }

        let device = &self.inner.device;
        let format = device.set_format(format)?;
        let granted = device.request_buffers(self.inner.config.buffers)?;
        if granted == 0 {
            return Err(StartError::NoBuffers);
        }

        let memories = match self.map_buffers(granted) {
            Ok(memories) => memories,
            Err(e) => {
                if let Err(e) = device.release_buffers() {
                    warn!("Cannot release device buffers: {}", e);
                }
                return Err(e.into());
            }
        };

        let mut pool = self.inner.lock_pool();
        let session = pool.next_session;
        pool.next_session += 1;
        pool.current = Some(SlotTable::new(session, memories));
        pool.reserved = ReservedPool::new(self.inner.config.reserved_depth);
        pool.free = Default::default();
        pool.in_flight = Default::default();
        pool.pending_recycle.clear();
        for index in 0..granted {
            if let Err(index) = pool.reserved.push(index) {
                pool.free.push(index);
            }
        }
        pool.format = format.clone();
        pool.buffers_required = granted;
        pool.queued_count = 0;
        pool.streaming = false;
        pool.shows_in_cycle = 0;
        info!(
            "Session {} started with {} buffers ({} reserved), format {} {}x{}",
            session,
            granted,
            pool.reserved.len(),
            format.pixelformat,
            format.width,
            format.height
        );
        drop(pool);

        // Buffers are new, so the display settings must be applied again.
        let mut config = self.inner.lock_config();
        if config.target.is_some() {
            config.pending |= ReconfigFlags::GEOMETRY;
        }
        if config.colorkey.is_some() {
            config.pending |= ReconfigFlags::COLORKEY;
        }

        Ok(format)
    }

    fn map_buffers(&self, count: usize) -> Result<Vec<HardwareMemory<D::Mapping>>, DeviceError> {
        let device = &self.inner.device;
        (0..count)
            .map(|index| {
                let info = device.query_buffer(index)?;
                let mapping = device.map_buffer(&info)?;
                trace!(
                    "Mapped buffer {}: {} bytes at physical address {:#x}",
                    index,
                    info.length,
                    info.phys_addr
                );
                Ok(HardwareMemory {
                    mapping,
                    phys_addr: info.phys_addr,
                    length: info.length,
                })
            })
            .collect()
    }

    /// Stop streaming and tear the pools down.
    ///
    /// Buffers under pool or device custody are freed immediately. Buffers
    /// held by the producer are freed when dropped; the device buffers are
    /// released once all of them are.
    pub fn stop(&self) -> Result<(), DeviceError> {
        let (result, emptied) = {
            let mut pool = self.inner.lock_pool();
            let Some(mut table) = pool.current.take() else {
                return Ok(());
            };

            let result = if pool.streaming {
                self.inner.device.stream_off()
            } else {
                Ok(())
            };
            if let Err(e) = &result {
                error!("Cannot stop stream: {}", e);
            }

            pool.streaming = false;
            pool.queued_count = 0;
            pool.shows_in_cycle = 0;
            pool.buffers_required = 0;
            pool.reserved.drain().for_each(drop);
            pool.free.drain().for_each(drop);
            pool.in_flight.drain().for_each(drop);
            pool.pending_recycle.clear();
            // Parked buffers are not held by the producer, free their slots
            // with the rest.
            for parked in pool.quarantine.drain(..) {
                if parked.session != table.session {
                    continue;
                }
                if let Some(index) = parked.backing.index() {
                    table.free_slot(index);
                }
            }

            let mut held = 0;
            for index in 0..table.slots.len() {
                let slot = &mut table.slots[index];
                if slot.memory.is_some() {
                    table.free_slot(index);
                } else if slot.state != BufferState::Illegal {
                    slot.state = BufferState::Free;
                    held += 1;
                }
            }
            info!(
                "Session {} stopped, {} buffers still held by the producer",
                table.session, held
            );

            if table.live == 0 {
                (result, Some(table))
            } else {
                pool.retired = Some(table);
                (result, None)
            }
        };

        if let Some(table) = emptied {
            self.inner.release_table(table);
        }

        result
    }

    /// Obtain a buffer to fill with a frame.
    ///
    /// Returns a hardware buffer if one can be obtained within the retry
    /// budget, or a software buffer otherwise. Never blocks longer than
    /// `max_acquire_retries` times `acquire_backoff`.
    pub fn acquire(&self) -> Result<DisplayBuffer<D>, AcquireError> {
        let config = &self.inner.config;

        while self.queued_count() > config.low_watermark {
            if self.dequeue().is_none() {
                break;
            }
        }

        for attempt in 0..=config.max_acquire_retries {
            let queued_count = {
                let mut pool = self.inner.lock_pool();
                if pool.current.is_none() {
                    return Err(AcquireError::NotStarted);
                }
                while pool.reserved.is_full() {
                    let Some(index) = pool.free.pop() else {
                        break;
                    };
                    if let Some(buffer) = self.take_buffer(&mut pool, index) {
                        return Ok(buffer);
                    }
                }
                pool.queued_count
            };

            if attempt == config.max_acquire_retries {
                break;
            }
            let dequeued = queued_count > 1 && self.dequeue().is_some();
            if !dequeued {
                thread::sleep(config.acquire_backoff);
            }
        }

        self.allocate_software()
    }

    fn allocate_software(&self) -> Result<DisplayBuffer<D>, AcquireError> {
        let (size, session) = {
            let pool = self.inner.lock_pool();
            match &pool.current {
                Some(table) => (pool.format.frame_size(), table.session),
                None => return Err(AcquireError::NotStarted),
            }
        };

        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| AcquireError::OutOfMemory(size))?;
        data.resize(size, 0);

        self.inner.counters.software_fallback();
        debug!("No hardware buffer available, using a software buffer");

        Ok(DisplayBuffer::new(
            Backing::Software { data },
            session,
            size,
            Arc::downgrade(&self.inner),
        ))
    }

    /// Moves the memory of idle buffer `index` into a new handle.
    fn take_buffer(
        &self,
        pool: &mut PoolState<D::Mapping>,
        index: usize,
    ) -> Option<DisplayBuffer<D>> {
        let frame_size = pool.format.frame_size();
        let table = pool.current.as_mut()?;
        let session = table.session;
        let slot = table.get_mut(index)?;

        match (slot.state, slot.memory.take()) {
            (BufferState::Idle, Some(memory)) => {
                slot.state = BufferState::Allocated;
                Some(DisplayBuffer::new(
                    Backing::Hardware { index, memory },
                    session,
                    frame_size,
                    Arc::downgrade(&self.inner),
                ))
            }
            (state, memory) => {
                error!(
                    "Pooled buffer {} is in state {:?} and has{} memory, parking it",
                    index,
                    state,
                    if memory.is_some() { "" } else { " no" }
                );
                slot.memory = memory;
                self.inner.counters.buffer_parked();
                None
            }
        }
    }

    fn pop_reserved(&self) -> Result<Option<DisplayBuffer<D>>, ShowError> {
        let mut pool = self.inner.lock_pool();
        if pool.current.is_none() {
            return Err(ShowError::NotStarted);
        }
        while let Some(index) = pool.reserved.pop() {
            if let Some(buffer) = self.take_buffer(&mut pool, index) {
                return Ok(Some(buffer));
            }
        }
        Ok(None)
    }

    /// Display a frame.
    ///
    /// Software frames are copied into a reserved hardware buffer first; if
    /// none is available the frame is dropped. Frames shown while the sink is
    /// suspended are dropped as well.
    pub fn show(&self, buffer: DisplayBuffer<D>) -> Result<(), ShowError> {
        self.refresh_geometry();

        if self.is_suspended() {
            trace!("Sink suspended, dropping frame");
            return Ok(());
        }

        let buffer = if buffer.is_hardware() {
            buffer
        } else {
            match self.back_software_frame(buffer)? {
                Some(buffer) => buffer,
                None => return Ok(()),
            }
        };

        if !self.inner.lock_config().pending.is_empty() {
            self.reconfigure()?;
        }

        self.enqueue(buffer)
    }

    /// Copies a software frame into a reserved hardware buffer.
    fn back_software_frame(
        &self,
        mut frame: DisplayBuffer<D>,
    ) -> Result<Option<DisplayBuffer<D>>, ShowError> {
        let mut buffer = self.pop_reserved()?;
        if buffer.is_none() {
            self.dequeue();
            buffer = self.pop_reserved()?;
        }
        let Some(mut buffer) = buffer else {
            warn!("No reserved buffer to display software frame, dropping it");
            return Ok(None);
        };

        let len = frame.bytes_used().min(buffer.len());
        if len < frame.bytes_used() {
            warn!(
                "Software frame of {} bytes truncated to {} bytes",
                frame.bytes_used(),
                len
            );
        }
        buffer[..len].copy_from_slice(&frame[..len]);
        buffer.set_timestamp(frame.timestamp());
        buffer.set_bytes_used(len);
        frame.state = BufferState::Showed;

        Ok(Some(buffer))
    }

    fn enqueue(&self, mut buffer: DisplayBuffer<D>) -> Result<(), ShowError> {
        let session = buffer.session;
        let timestamp = buffer.timestamp();
        let bytes_used = buffer.bytes_used();
        let (index, memory) = match buffer.take_backing() {
            Some(Backing::Hardware { index, memory }) => (index, memory),
            Some(backing) => {
                // Only hardware buffers reach this point. Let the handle drop.
                buffer.backing = Some(backing);
                return Ok(());
            }
            None => return Ok(()),
        };

        let mut release = None;
        let mut pace = false;
        let result = {
            let mut pool = self.inner.lock_pool();
            let PoolState {
                current,
                in_flight,
                quarantine,
                queued_count,
                streaming,
                suspended,
                shows_in_cycle,
                ..
            } = &mut *pool;

            match current.as_mut().filter(|t| t.session == session) {
                None => {
                    release = Some(Release::Handle {
                        backing: Backing::Hardware { index, memory },
                        state: BufferState::Allocated,
                        session,
                    });
                    match current {
                        None => Err(ShowError::NotStarted),
                        Some(_) => {
                            warn!("Dropping frame of previous session {}", session);
                            Ok(())
                        }
                    }
                }
                // The sink got suspended after `show` checked it.
                Some(_) if *suspended => {
                    trace!("Sink suspended, dropping frame");
                    release = Some(Release::Handle {
                        backing: Backing::Hardware { index, memory },
                        state: BufferState::Allocated,
                        session,
                    });
                    Ok(())
                }
                Some(_) if in_flight.contains(index) => {
                    error!("Buffer {} is already queued, not submitting it twice", index);
                    self.inner.counters.buffer_parked();
                    quarantine.push(Parked {
                        session,
                        backing: Backing::Hardware { index, memory },
                    });
                    Ok(())
                }
                Some(table) => match table.get_mut(index) {
                    None => {
                        error!("Buffer index {} out of range, parking it", index);
                        self.inner.counters.buffer_parked();
                        quarantine.push(Parked {
                            session,
                            backing: Backing::Hardware { index, memory },
                        });
                        Ok(())
                    }
                    Some(slot) => {
                        slot.memory = Some(memory);
                        // Cannot fail, we just checked the index is not in flight.
                        let _ = in_flight.push(index);
                        match self.inner.device.enqueue(index, timestamp, bytes_used) {
                            Err(e) => {
                                error!("Cannot queue buffer {}: {}", index, e);
                                in_flight.remove(index);
                                slot.state = BufferState::Showed;
                                release = Some(Release::Slot { index, session });
                                Err(ShowError::Enqueue(e))
                            }
                            Ok(()) => {
                                slot.show_count += 1;
                                slot.state = BufferState::Showing;
                                *queued_count += 1;
                                self.inner.counters.frame_shown();
                                trace!("Buffer {} queued, {} in flight", index, queued_count);

                                *shows_in_cycle += 1;
                                if *shows_in_cycle >= self.inner.config.cycle_length {
                                    *shows_in_cycle = 0;
                                    pace = true;
                                }

                                if !*streaming
                                    && *queued_count >= self.inner.config.stream_on_threshold
                                {
                                    match self.inner.device.stream_on() {
                                        Ok(()) => {
                                            debug!("Stream started");
                                            *streaming = true;
                                            Ok(())
                                        }
                                        Err(e) => {
                                            error!("Cannot start stream: {}", e);
                                            Err(ShowError::StreamOn(e))
                                        }
                                    }
                                } else {
                                    Ok(())
                                }
                            }
                        }
                    }
                },
            }
        };

        if let Some(release) = release {
            self.inner.recycle(release);
        }
        if pace && result.is_ok() {
            self.pace();
        }

        result
    }

    /// Dequeue completed buffers until at most `high_watermark` are queued.
    fn pace(&self) {
        let config = &self.inner.config;
        if self.drain_to(config.high_watermark) {
            return;
        }

        warn!(
            "Display queue still holds {} buffers after {} dequeue attempts, running a recovery pass",
            self.queued_count(),
            config.pacing_attempts
        );
        self.inner.counters.recovery_pass();
        if !self.drain_to(config.high_watermark) {
            warn!("Recovery pass could not drain the display queue");
        }
    }

    fn drain_to(&self, level: usize) -> bool {
        let config = &self.inner.config;
        for _ in 0..config.pacing_attempts {
            if self.queued_count() <= level {
                return true;
            }
            if self.dequeue().is_none() {
                thread::sleep(config.acquire_backoff);
            }
        }

        self.queued_count() <= level
    }

    /// Try to take back one buffer the device is done with, without blocking.
    ///
    /// Returns the index of the dequeued buffer, or `None` if no buffer was
    /// ready. Device errors are considered transient and also result in
    /// `None`.
    pub fn dequeue(&self) -> Option<usize> {
        let (index, release) = {
            let mut pool = self.inner.lock_pool();
            if pool.queued_count == 0 {
                return None;
            }

            let index = match self.inner.device.dequeue() {
                Ok(Some(index)) => index,
                Ok(None) => return None,
                Err(e) => {
                    debug!("Cannot dequeue buffer: {}", e);
                    return None;
                }
            };

            let PoolState {
                current,
                in_flight,
                queued_count,
                ..
            } = &mut *pool;

            if !in_flight.remove(index) {
                error!("Device returned buffer {} which is not in flight", index);
                return None;
            }
            *queued_count = queued_count.saturating_sub(1);

            let Some(table) = current.as_mut() else {
                error!("Buffer {} dequeued while no session is active", index);
                return None;
            };
            let session = table.session;
            let Some(slot) = table.get_mut(index) else {
                error!("Dequeued buffer index {} out of range", index);
                return None;
            };

            slot.show_count = slot.show_count.saturating_sub(1);
            if slot.show_count == 0 {
                slot.state = BufferState::Showed;
                (index, Some(Release::Slot { index, session }))
            } else {
                (index, None)
            }
        };

        trace!("Buffer {} dequeued", index);
        if let Some(release) = release {
            self.inner.recycle(release);
        }

        Some(index)
    }

    /// Marks every in-flight buffer as `Showed` and resets the queue
    /// accounting. Returns the released indices.
    fn cancel_in_flight(pool: &mut PoolState<D::Mapping>) -> Vec<usize> {
        let PoolState {
            current,
            in_flight,
            queued_count,
            ..
        } = pool;

        let cancelled: Vec<usize> = in_flight.drain().collect();
        if let Some(table) = current.as_mut() {
            for &index in &cancelled {
                if let Some(slot) = table.get_mut(index) {
                    slot.state = BufferState::Showed;
                    slot.show_count = 0;
                }
            }
        }
        *queued_count = 0;

        cancelled
    }

    /// Apply the pending display settings to the device.
    ///
    /// Unless the device supports hot reconfiguration, streaming is stopped
    /// first and all queued buffers are returned to their pool. It restarts
    /// with the next shown frame.
    pub fn reconfigure(&self) -> Result<(), ShowError> {
        let mut cancelled = (0, Vec::new());
        let result = {
            let mut config = self.inner.lock_config();
            if config.pending.is_empty() {
                return Ok(());
            }

            let mut pool = self.inner.lock_pool();
            let device = &self.inner.device;
            if pool.streaming && !device.supports_hot_reconfig() {
                debug!("Stopping stream to reconfigure display");
                device.stream_off().map_err(ShowError::Reconfigure)?;
                pool.streaming = false;
                let session = pool.current.as_ref().map_or(0, |t| t.session);
                cancelled = (session, Self::cancel_in_flight(&mut pool));
            }

            let result = Self::apply_config(device, &config);
            drop(pool);
            match result {
                Ok(()) => {
                    info!(
                        "Display reconfigured (target {:?}, colorkey {:?})",
                        config.target, config.colorkey
                    );
                    config.pending = ReconfigFlags::empty();
                    Ok(())
                }
                Err(e) => {
                    error!("Cannot reconfigure display: {}", e);
                    Err(ShowError::Reconfigure(e))
                }
            }
        };

        let (session, indices) = cancelled;
        for index in indices {
            self.inner.recycle(Release::Slot { index, session });
        }

        result
    }

    fn apply_config(device: &D, config: &ConfigState) -> Result<(), DeviceError> {
        if config.pending.contains(ReconfigFlags::GEOMETRY) {
            if let Some(rect) = config.target {
                device.set_target(rect)?;
            }
        }
        if config.pending.contains(ReconfigFlags::COLORKEY) {
            if let Some(key) = config.colorkey {
                device.set_colorkey(key)?;
            }
        }

        Ok(())
    }

    /// Stop displaying frames, e.g. because the display has been switched
    /// off.
    ///
    /// All in-flight buffers are marked `Showed` and the queue accounting is
    /// reset without dequeueing from the device. They are returned to their
    /// pool by [`SinkController::resume`]. Returns their indices.
    pub fn suspend(&self) -> Vec<usize> {
        let mut pool = self.inner.lock_pool();
        if pool.suspended {
            return Vec::new();
        }
        pool.suspended = true;

        let released = Self::cancel_in_flight(&mut pool);
        pool.pending_recycle.extend_from_slice(&released);
        info!(
            "Sink suspended, {} buffers taken back from the display",
            released.len()
        );

        released
    }

    /// Display frames again after a [`SinkController::suspend`]. The display
    /// is reconfigured and streaming restarted with the next shown frame.
    pub fn resume(&self) {
        let (session, pending) = {
            let mut pool = self.inner.lock_pool();
            if !pool.suspended {
                return;
            }
            pool.suspended = false;

            // The device still holds the buffers we took back, whether it was
            // streaming or not.
            let device_holds_buffers =
                !pool.pending_recycle.is_empty() || !pool.in_flight.is_empty();
            let session = pool.current.as_ref().map_or(0, |t| t.session);
            if pool.streaming || device_holds_buffers {
                match self.inner.device.stream_off() {
                    Ok(()) => {
                        pool.streaming = false;
                        let cancelled = Self::cancel_in_flight(&mut pool);
                        pool.pending_recycle.extend(cancelled);
                        (session, std::mem::take(&mut pool.pending_recycle))
                    }
                    Err(e) => {
                        // Buffers stay parked until `stop` frees them.
                        error!("Cannot stop stream on resume: {}", e);
                        (session, Vec::new())
                    }
                }
            } else {
                (session, Vec::new())
            }
        };

        for index in pending {
            self.inner.recycle(Release::Slot { index, session });
        }

        self.inner.lock_config().pending |= ReconfigFlags::GEOMETRY;
        info!("Sink resumed");
    }

    /// Request frames to be displayed into `rect` from the next shown frame.
    pub fn set_target(&self, rect: Rect) {
        let mut config = self.inner.lock_config();
        if config.target != Some(rect) {
            debug!("New display target {}", rect);
            config.target = Some(rect);
            config.pending |= ReconfigFlags::GEOMETRY;
        }
    }

    pub fn target(&self) -> Option<Rect> {
        self.inner.lock_config().target
    }

    /// Request a new overlay colorkey from the next shown frame.
    pub fn set_colorkey(&self, key: u32) {
        let mut config = self.inner.lock_config();
        if config.colorkey != Some(key) {
            config.colorkey = Some(key);
            config.pending |= ReconfigFlags::COLORKEY;
        }
    }

    pub fn pending_reconfig(&self) -> ReconfigFlags {
        self.inner.lock_config().pending
    }

    /// Install the provider polled for the target rectangle before each
    /// shown frame.
    pub fn set_geometry_provider(&self, provider: Box<dyn GeometryProvider + Send>) {
        self.inner.lock_config().geometry = Some(provider);
    }

    /// Poll the geometry provider, if any, and schedule a reconfiguration if
    /// the target rectangle changed.
    pub fn refresh_geometry(&self) {
        let mut config = self.inner.lock_config();
        let polled = match config.geometry.as_mut() {
            Some(provider) => provider.target_rect(),
            None => return,
        };

        match polled {
            Ok(Some(rect)) if !rect.is_empty() && config.target != Some(rect) => {
                debug!("Display target changed to {}", rect);
                config.target = Some(rect);
                config.pending |= ReconfigFlags::GEOMETRY;
            }
            Ok(_) => (),
            Err(e) => debug!("Cannot get display geometry: {:#}", e),
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.lock_pool().suspended
    }

    pub fn is_streaming(&self) -> bool {
        self.inner.lock_pool().streaming
    }

    /// Number of buffers currently queued to the device.
    pub fn queued_count(&self) -> usize {
        self.inner.lock_pool().queued_count
    }

    /// Number of hardware buffers of the current session.
    pub fn buffers_required(&self) -> usize {
        self.inner.lock_pool().buffers_required
    }

    /// Format of the current session, if started.
    pub fn format(&self) -> Option<Format> {
        let pool = self.inner.lock_pool();
        pool.current.as_ref().map(|_| pool.format.clone())
    }

    /// State of hardware buffer `index` in the current session.
    pub fn buffer_state(&self, index: usize) -> Option<BufferState> {
        let pool = self.inner.lock_pool();
        pool.current.as_ref()?.get(index).map(|slot| slot.state)
    }

    pub fn stats(&self) -> SinkStats {
        self.inner.counters.snapshot()
    }

    pub fn pool_snapshot(&self) -> PoolSnapshot {
        let pool = self.inner.lock_pool();
        PoolSnapshot {
            buffers_required: pool.buffers_required,
            reserved: pool.reserved.len(),
            free: pool.free.len(),
            in_flight: pool.in_flight.len(),
            allocated: pool
                .current
                .as_ref()
                .map_or(0, |t| t.count_in_state(BufferState::Allocated)),
            pending_recycle: pool.pending_recycle.len(),
            queued_count: pool.queued_count,
            streaming: pool.streaming,
            suspended: pool.suspended,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDevice;
    use super::*;
    use crate::PixelFormat;
    use std::time::Duration;

    const FRAME_SIZE: usize = 256;

    fn test_format() -> Format {
        Format {
            width: 16,
            height: 8,
            pixelformat: PixelFormat::from(b"UYVY"),
            bytesperline: 32,
            sizeimage: FRAME_SIZE as u32,
        }
    }

    fn test_config() -> SinkConfig {
        SinkConfig::new().acquire_backoff(Duration::ZERO)
    }

    fn started_sink(device: MockDevice, config: SinkConfig) -> SinkController<MockDevice> {
        let sink = SinkController::new(device, config).unwrap();
        sink.start(&test_format()).unwrap();
        sink
    }

    fn default_sink() -> SinkController<MockDevice> {
        started_sink(MockDevice::new(), test_config())
    }

    /// Checks the pool conservation and show count invariants.
    fn check_invariants(sink: &SinkController<MockDevice>) {
        let snapshot = sink.pool_snapshot();
        assert!(snapshot.is_conserved(), "{:?}", snapshot);
        assert_eq!(snapshot.in_flight, snapshot.queued_count);

        let pool = sink.inner.lock_pool();
        let table = pool.current.as_ref().unwrap();
        for (index, slot) in table.slots.iter().enumerate() {
            match slot.state {
                BufferState::Showing => assert!(slot.show_count > 0, "buffer {}", index),
                _ => assert_eq!(slot.show_count, 0, "buffer {}", index),
            }
            assert_eq!(
                pool.in_flight.contains(index),
                slot.state == BufferState::Showing
            );
        }
        let mut in_flight: Vec<_> = pool.in_flight.iter().copied().collect();
        in_flight.sort_unstable();
        in_flight.dedup();
        assert_eq!(in_flight.len(), pool.in_flight.len());
    }

    #[test]
    fn test_start_fills_reserved_pool_first() {
        let sink = started_sink(MockDevice::new().max_buffers(4), test_config());
        assert_eq!(sink.buffers_required(), 4);
        let snapshot = sink.pool_snapshot();
        assert_eq!(snapshot.reserved, 2);
        assert_eq!(snapshot.free, 2);
        assert_eq!(sink.format(), Some(test_format()));
        for index in 0..4 {
            assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        }
        assert!(matches!(
            sink.start(&test_format()),
            Err(StartError::AlreadyStarted)
        ));
        check_invariants(&sink);
    }

    #[test]
    fn test_acquire_before_start() {
        let sink = SinkController::new(MockDevice::new(), test_config()).unwrap();
        assert!(matches!(sink.acquire(), Err(AcquireError::NotStarted)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(SinkController::new(MockDevice::new(), SinkConfig::new().buffers(0)).is_err());
    }

    #[test]
    fn test_scenario_a_software_fallback_after_exhaustion() {
        let sink = default_sink();
        let required = sink.buffers_required();

        let buffers: Vec<_> = (0..required + 1).map(|_| sink.acquire().unwrap()).collect();

        // The reserve is never handed out directly.
        let hardware = buffers.iter().filter(|b| b.is_hardware()).count();
        assert_eq!(hardware, required - sink.config().reserved_depth);
        let last = buffers.last().unwrap();
        assert!(!last.is_hardware());
        assert_eq!(last.index(), None);
        assert_eq!(last.len(), FRAME_SIZE);
        assert_eq!(last.physical_address(), None);

        assert_eq!(sink.device().dequeue_calls(), 0);
        assert_eq!(sink.stats().software_fallbacks, 3);
        assert_eq!(sink.pool_snapshot().allocated, hardware);
        check_invariants(&sink);
    }

    #[test]
    fn test_hardware_buffer_properties() {
        let sink = default_sink();
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();

        assert!(buffer.is_hardware());
        assert_eq!(buffer.state(), BufferState::Allocated);
        assert_eq!(buffer.len(), FRAME_SIZE);
        assert_eq!(buffer.bytes_used(), FRAME_SIZE);
        assert_eq!(
            buffer.physical_address(),
            Some(0x1000_0000 + (index * FRAME_SIZE) as u64)
        );
        assert_eq!(sink.buffer_state(index), Some(BufferState::Allocated));
    }

    #[test]
    fn test_scenario_b_stream_on_once() {
        let sink = default_sink();

        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();
        sink.show(buffer).unwrap();

        assert_eq!(sink.device().stream_on_calls(), 1);
        assert!(sink.is_streaming());
        assert!(sink.device().is_streaming());
        assert_eq!(sink.queued_count(), 1);
        assert_eq!(sink.buffer_state(index), Some(BufferState::Showing));
        assert_eq!(sink.device().queued(), vec![index]);

        let buffer = sink.acquire().unwrap();
        sink.show(buffer).unwrap();
        assert_eq!(sink.device().stream_on_calls(), 1);
        assert_eq!(sink.queued_count(), 2);
        assert_eq!(sink.stats().shown, 2);
        check_invariants(&sink);
    }

    #[test]
    fn test_stream_on_threshold() {
        let sink = started_sink(MockDevice::new(), test_config().stream_on_threshold(2));

        sink.show(sink.acquire().unwrap()).unwrap();
        assert_eq!(sink.device().stream_on_calls(), 0);
        assert!(!sink.is_streaming());

        sink.show(sink.acquire().unwrap()).unwrap();
        assert_eq!(sink.device().stream_on_calls(), 1);
        assert!(sink.is_streaming());
    }

    #[test]
    fn test_stream_on_failure() {
        let sink = default_sink();
        sink.device().fail_stream_on();

        assert!(matches!(
            sink.show(sink.acquire().unwrap()),
            Err(ShowError::StreamOn(_))
        ));
        assert!(!sink.is_streaming());
        // The buffer stays queued until the stream is stopped.
        assert_eq!(sink.queued_count(), 1);
        check_invariants(&sink);
    }

    #[test]
    fn test_scenario_c_dequeue_empty() {
        let sink = default_sink();

        // Nothing queued: the device is not even asked.
        assert_eq!(sink.dequeue(), None);
        assert_eq!(sink.device().dequeue_calls(), 0);

        sink.show(sink.acquire().unwrap()).unwrap();
        assert_eq!(sink.dequeue(), None);
        assert_eq!(sink.device().dequeue_calls(), 1);
        assert_eq!(sink.queued_count(), 1);
        check_invariants(&sink);
    }

    #[test]
    fn test_dequeue_recycles_buffer() {
        let sink = default_sink();
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();
        sink.show(buffer).unwrap();

        sink.device().complete(1);
        assert_eq!(sink.dequeue(), Some(index));
        assert_eq!(sink.queued_count(), 0);
        assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        // The reserve was full, so the buffer went back to the free pool.
        assert_eq!(sink.pool_snapshot().free, 4);
        assert_eq!(sink.stats().dropped, 0);
        check_invariants(&sink);
    }

    #[test]
    fn test_dequeue_unknown_buffer() {
        let sink = default_sink();
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();
        sink.show(buffer).unwrap();

        sink.device().inject_completion(5);
        assert_eq!(sink.dequeue(), None);
        assert_eq!(sink.queued_count(), 1);
        assert_eq!(sink.buffer_state(index), Some(BufferState::Showing));
        assert_eq!(sink.buffer_state(5), Some(BufferState::Idle));
        check_invariants(&sink);
    }

    #[test]
    fn test_scenario_d_suspend_with_showing_buffers() {
        let sink = default_sink();
        let mut indices = Vec::new();
        for _ in 0..3 {
            let buffer = sink.acquire().unwrap();
            indices.push(buffer.index().unwrap());
            sink.show(buffer).unwrap();
        }
        assert_eq!(sink.queued_count(), 3);

        let released = sink.suspend();
        assert_eq!(released, indices);
        assert_eq!(sink.queued_count(), 0);
        for &index in &indices {
            assert_eq!(sink.buffer_state(index), Some(BufferState::Showed));
        }
        assert_eq!(sink.device().dequeue_calls(), 0);
        assert!(sink.is_suspended());
        assert!(sink.pool_snapshot().is_conserved());

        // Suspending twice is a no-op.
        assert!(sink.suspend().is_empty());

        sink.resume();
        assert!(!sink.is_suspended());
        for &index in &indices {
            assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        }
        assert_eq!(sink.device().stream_off_calls(), 1);
        assert!(sink.pending_reconfig().contains(ReconfigFlags::GEOMETRY));
        check_invariants(&sink);

        // Streaming is re-armed by the next frame.
        sink.show(sink.acquire().unwrap()).unwrap();
        assert_eq!(sink.device().stream_on_calls(), 2);
        assert!(sink.pending_reconfig().is_empty());
        check_invariants(&sink);
    }

    #[test]
    fn test_show_while_suspended_drops_frame() {
        let sink = default_sink();
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();
        sink.suspend();

        sink.show(buffer).unwrap();
        assert_eq!(sink.device().enqueue_calls(), 0);
        assert_eq!(sink.stats().dropped, 1);
        assert_eq!(sink.stats().shown, 0);
        assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        check_invariants(&sink);
    }

    #[test]
    fn test_resume_reclaims_buffers_queued_before_stream_on() {
        let sink = started_sink(MockDevice::new(), test_config().stream_on_threshold(2));
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();
        sink.show(buffer).unwrap();
        assert!(!sink.is_streaming());
        assert_eq!(sink.device().queued(), vec![index]);

        assert_eq!(sink.suspend(), vec![index]);
        sink.resume();

        // The device must give the buffer back before it is reused.
        assert_eq!(sink.device().stream_off_calls(), 1);
        assert!(sink.device().queued().is_empty());
        assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        check_invariants(&sink);
    }

    #[test]
    fn test_frame_enqueued_while_suspending_is_dropped() {
        let sink = default_sink();
        sink.show(sink.acquire().unwrap()).unwrap();
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();

        // The sink gets suspended between the check in `show` and the
        // submission of the frame.
        sink.suspend();
        sink.enqueue(buffer).unwrap();
        assert_eq!(sink.device().enqueue_calls(), 1);
        assert_eq!(sink.stats().dropped, 1);
        assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        assert!(sink.pool_snapshot().is_conserved());

        sink.resume();
        assert_eq!(sink.queued_count(), 0);
        assert!(sink.device().queued().is_empty());
        check_invariants(&sink);
    }

    #[test]
    fn test_resume_cancels_buffers_queued_while_suspended() {
        let sink = default_sink();
        let mut buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();
        sink.suspend();

        // Simulate a frame that reached the device after the suspension.
        let Some(Backing::Hardware { memory, .. }) = buffer.take_backing() else {
            panic!("expected a hardware buffer");
        };
        drop(buffer);
        {
            let mut pool = sink.inner.lock_pool();
            let PoolState {
                current,
                in_flight,
                queued_count,
                ..
            } = &mut *pool;
            let slot = current.as_mut().unwrap().get_mut(index).unwrap();
            slot.memory = Some(memory);
            slot.state = BufferState::Showing;
            slot.show_count = 1;
            in_flight.push(index).unwrap();
            *queued_count += 1;
        }

        sink.resume();
        assert_eq!(sink.device().stream_off_calls(), 1);
        assert_eq!(sink.queued_count(), 0);
        assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        check_invariants(&sink);
    }

    #[test]
    fn test_buffer_queued_twice_is_parked_and_freed_on_stop() {
        let sink = default_sink();
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();

        // Accounting says the buffer is already owned by the device.
        sink.inner.lock_pool().in_flight.push(index).unwrap();
        sink.show(buffer).unwrap();
        assert_eq!(sink.device().enqueue_calls(), 0);
        assert_eq!(sink.stats().parked, 1);

        // The parked buffer does not keep the session alive.
        sink.stop().unwrap();
        assert_eq!(sink.device().release_calls(), 1);
        sink.start(&test_format()).unwrap();
        assert_eq!(sink.pool_snapshot().free + sink.pool_snapshot().reserved, 6);
        check_invariants(&sink);
    }

    #[test]
    fn test_scenario_e_drop_unshown_buffer() {
        let sink = default_sink();
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();
        assert_eq!(sink.pool_snapshot().free, 3);

        drop(buffer);
        assert_eq!(sink.stats().dropped, 1);
        assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        assert_eq!(sink.pool_snapshot().free, 4);
        check_invariants(&sink);

        // Same for a software buffer, which is simply freed.
        let held: Vec<_> = (0..4).map(|_| sink.acquire().unwrap()).collect();
        let software = sink.acquire().unwrap();
        assert!(!software.is_hardware());
        drop(software);
        assert_eq!(sink.stats().dropped, 2);
        check_invariants(&sink);
        drop(held);
        assert_eq!(sink.stats().dropped, 6);
    }

    #[test]
    fn test_unshown_buffer_refills_reserve() {
        let sink = started_sink(MockDevice::new().max_buffers(3), test_config());
        let held: Vec<_> = (0..1).map(|_| sink.acquire().unwrap()).collect();
        let software = sink.acquire().unwrap();

        // The software frame consumes a reserved buffer.
        sink.show(software).unwrap();
        assert_eq!(sink.pool_snapshot().reserved, 1);

        // Which is refilled first when a buffer is recycled.
        drop(held);
        let snapshot = sink.pool_snapshot();
        assert_eq!(snapshot.reserved, 2);
        assert_eq!(snapshot.free, 0);
        check_invariants(&sink);
    }

    #[test]
    fn test_software_frame_copied_to_reserved_buffer() {
        let sink = default_sink();
        let held: Vec<_> = (0..4).map(|_| sink.acquire().unwrap()).collect();

        let mut frame = sink.acquire().unwrap();
        assert!(!frame.is_hardware());
        frame.fill(0x5a);
        frame.set_timestamp(Duration::from_millis(40));
        frame.set_bytes_used(200);
        sink.show(frame).unwrap();

        // The last buffer pushed to the reserve is used first.
        assert_eq!(sink.device().queued(), vec![1]);
        assert_eq!(sink.device().bytes_used(), vec![200]);
        assert_eq!(sink.buffer_state(1), Some(BufferState::Showing));
        assert_eq!(sink.stats().dropped, 0);
        assert_eq!(sink.stats().shown, 1);
        {
            let pool = sink.inner.lock_pool();
            let slot = pool.current.as_ref().unwrap().get(1).unwrap();
            let memory = slot.memory.as_ref().unwrap();
            assert!(memory.mapping[..200].iter().all(|&b| b == 0x5a));
            assert!(memory.mapping[200..].iter().all(|&b| b == 0));
        }
        check_invariants(&sink);
        drop(held);
    }

    #[test]
    fn test_software_frame_dropped_without_reserve() {
        let sink = started_sink(
            MockDevice::new().max_buffers(2),
            test_config().reserved_depth(1),
        );
        let held = sink.acquire().unwrap();
        assert!(held.is_hardware());

        sink.show(sink.acquire().unwrap()).unwrap();
        assert_eq!(sink.stats().shown, 1);
        assert_eq!(sink.pool_snapshot().reserved, 0);

        // No reserve left and nothing completes: the frame is dropped.
        let dequeues = sink.device().dequeue_calls();
        sink.show(sink.acquire().unwrap()).unwrap();
        assert_eq!(sink.device().dequeue_calls(), dequeues + 1);
        assert_eq!(sink.stats().shown, 1);
        assert_eq!(sink.stats().dropped, 1);
        check_invariants(&sink);
        drop(held);
    }

    #[test]
    fn test_enqueue_failure_recycles_buffer() {
        let sink = default_sink();
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();

        sink.device().fail_next_enqueue();
        assert!(matches!(sink.show(buffer), Err(ShowError::Enqueue(_))));
        assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        assert_eq!(sink.queued_count(), 0);
        assert!(!sink.is_streaming());
        assert_eq!(sink.stats().dropped, 0);
        check_invariants(&sink);
    }

    #[test]
    fn test_acquire_drains_completed_buffers() {
        let sink = default_sink();
        for _ in 0..3 {
            sink.show(sink.acquire().unwrap()).unwrap();
        }
        sink.device().complete(3);

        // Above the low watermark: one buffer is dequeued before acquiring.
        let _buffer = sink.acquire().unwrap();
        assert_eq!(sink.queued_count(), 2);
        check_invariants(&sink);
    }

    #[test]
    fn test_acquire_retries_dequeue() {
        let sink = default_sink();
        let mut held = Vec::new();
        for _ in 0..2 {
            held.push(sink.acquire().unwrap());
        }
        for _ in 0..2 {
            sink.show(sink.acquire().unwrap()).unwrap();
        }
        assert_eq!(sink.pool_snapshot().free, 0);

        // The free pool is empty, but a queued buffer completes.
        sink.device().complete(1);
        let buffer = sink.acquire().unwrap();
        assert!(buffer.is_hardware());
        assert_eq!(sink.stats().software_fallbacks, 0);
        assert_eq!(sink.queued_count(), 1);
        drop(held);
    }

    #[test]
    fn test_pacing_bounds_queue_depth() {
        let sink = started_sink(MockDevice::new(), test_config().watermarks(1, 1));
        sink.device().set_auto_complete(true);

        for _ in 0..10 {
            sink.show(sink.acquire().unwrap()).unwrap();
            assert!(sink.queued_count() <= 1);
            check_invariants(&sink);
        }
        assert_eq!(sink.stats().shown, 10);
        assert_eq!(sink.stats().recovery_passes, 0);
        assert_eq!(sink.stats().software_fallbacks, 0);
    }

    #[test]
    fn test_pacing_recovery_pass() {
        let sink = started_sink(
            MockDevice::new(),
            test_config().watermarks(0, 0).pacing_attempts(2),
        );

        sink.show(sink.acquire().unwrap()).unwrap();
        assert_eq!(sink.stats().recovery_passes, 1);
        assert_eq!(sink.device().dequeue_calls(), 4);
        assert_eq!(sink.queued_count(), 1);
    }

    #[test]
    fn test_pacing_once_per_cycle() {
        let sink = started_sink(
            MockDevice::new(),
            test_config().watermarks(0, 0).pacing_attempts(1).cycle_length(2),
        );

        sink.show(sink.acquire().unwrap()).unwrap();
        assert_eq!(sink.device().dequeue_calls(), 0);
        assert_eq!(sink.stats().recovery_passes, 0);

        let buffer = sink.acquire().unwrap();
        let dequeues = sink.device().dequeue_calls();
        sink.show(buffer).unwrap();
        // One pacing pass and one recovery pass of a single attempt each.
        assert_eq!(sink.device().dequeue_calls(), dequeues + 2);
        assert_eq!(sink.stats().recovery_passes, 1);
    }

    #[test]
    fn test_reconfigure_stops_stream() {
        let sink = default_sink();
        let mut indices = Vec::new();
        for _ in 0..2 {
            let buffer = sink.acquire().unwrap();
            indices.push(buffer.index().unwrap());
            sink.show(buffer).unwrap();
        }

        let rect = Rect::new(10, 20, 320, 240);
        sink.set_target(rect);
        assert_eq!(sink.pending_reconfig(), ReconfigFlags::GEOMETRY);

        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();
        sink.show(buffer).unwrap();

        assert_eq!(sink.device().stream_off_calls(), 1);
        assert_eq!(sink.device().targets(), vec![rect]);
        assert_eq!(sink.device().stream_on_calls(), 2);
        assert_eq!(sink.device().queued(), vec![index]);
        assert_eq!(sink.queued_count(), 1);
        for index in indices {
            assert_eq!(sink.buffer_state(index), Some(BufferState::Idle));
        }
        assert!(sink.pending_reconfig().is_empty());
        check_invariants(&sink);
    }

    #[test]
    fn test_hot_reconfigure_keeps_streaming() {
        let sink = started_sink(MockDevice::new().hot_reconfig(), test_config());
        sink.show(sink.acquire().unwrap()).unwrap();

        let rect = Rect::new(0, 0, 640, 480);
        sink.set_target(rect);
        sink.show(sink.acquire().unwrap()).unwrap();

        assert_eq!(sink.device().stream_off_calls(), 0);
        assert_eq!(sink.device().stream_on_calls(), 1);
        assert_eq!(sink.device().targets(), vec![rect]);
        assert_eq!(sink.queued_count(), 2);
        check_invariants(&sink);
    }

    #[test]
    fn test_colorkey_applied_on_next_show() {
        let sink = default_sink();
        sink.set_colorkey(0x00ff00);
        assert_eq!(sink.pending_reconfig(), ReconfigFlags::COLORKEY);
        assert!(sink.device().colorkeys().is_empty());

        sink.show(sink.acquire().unwrap()).unwrap();
        assert_eq!(sink.device().colorkeys(), vec![0x00ff00]);
        assert!(sink.device().targets().is_empty());

        // Setting the same key again does not trigger a reconfiguration.
        sink.set_colorkey(0x00ff00);
        assert!(sink.pending_reconfig().is_empty());
    }

    struct CountingGeometry {
        rect: Rect,
        polls: Arc<Mutex<usize>>,
    }

    impl GeometryProvider for CountingGeometry {
        fn target_rect(&mut self) -> anyhow::Result<Option<Rect>> {
            *self.polls.lock().unwrap() += 1;
            Ok(Some(self.rect))
        }
    }

    #[test]
    fn test_geometry_polled_on_show() {
        let sink = started_sink(MockDevice::new().hot_reconfig(), test_config());
        let polls = Arc::new(Mutex::new(0));
        let rect = Rect::new(100, 50, 720, 576);
        sink.set_geometry_provider(Box::new(CountingGeometry {
            rect,
            polls: Arc::clone(&polls),
        }));

        sink.show(sink.acquire().unwrap()).unwrap();
        sink.show(sink.acquire().unwrap()).unwrap();

        assert_eq!(*polls.lock().unwrap(), 2);
        assert_eq!(sink.target(), Some(rect));
        assert_eq!(sink.device().targets(), vec![rect]);
    }

    #[test]
    fn test_stop_frees_pooled_buffers() {
        let sink = default_sink();
        sink.show(sink.acquire().unwrap()).unwrap();

        sink.stop().unwrap();
        assert_eq!(sink.device().stream_off_calls(), 1);
        assert_eq!(sink.device().release_calls(), 1);
        assert_eq!(sink.buffers_required(), 0);
        assert_eq!(sink.format(), None);
        assert!(matches!(sink.acquire(), Err(AcquireError::NotStarted)));

        // Stopping twice is a no-op.
        sink.stop().unwrap();
        assert_eq!(sink.device().release_calls(), 1);

        sink.start(&test_format()).unwrap();
        assert_eq!(sink.pool_snapshot().reserved, 2);
        check_invariants(&sink);
    }

    #[test]
    fn test_stop_with_buffers_held_by_producer() {
        let sink = default_sink();
        let first = sink.acquire().unwrap();
        let second = sink.acquire().unwrap();

        sink.stop().unwrap();
        assert_eq!(sink.device().release_calls(), 0);
        assert!(matches!(
            sink.start(&test_format()),
            Err(StartError::BuffersInUse)
        ));

        drop(first);
        assert_eq!(sink.device().release_calls(), 0);
        drop(second);
        assert_eq!(sink.device().release_calls(), 1);
        // Buffers of a stopped session are not counted as dropped frames.
        assert_eq!(sink.stats().dropped, 0);

        sink.start(&test_format()).unwrap();
        check_invariants(&sink);
    }

    #[test]
    fn test_free_finalize_is_idempotent() {
        let sink = default_sink();
        let first = sink.acquire().unwrap();
        let second = sink.acquire().unwrap();
        let index = first.index().unwrap();
        let session = first.session;

        sink.stop().unwrap();
        drop(first);
        let live = |sink: &SinkController<MockDevice>| {
            sink.inner.lock_pool().retired.as_ref().map(|t| t.live)
        };
        assert_eq!(live(&sink), Some(1));

        // A second release of the freed buffer changes nothing.
        sink.inner.recycle(Release::Slot { index, session });
        assert_eq!(live(&sink), Some(1));
        assert_eq!(sink.stats().parked, 0);

        drop(second);
        assert_eq!(live(&sink), None);
        assert_eq!(sink.device().release_calls(), 1);

        // Once the table is gone, releases are ignored.
        sink.inner.recycle(Release::Slot { index, session });
        assert_eq!(sink.device().release_calls(), 1);
    }

    #[test]
    fn test_stale_buffer_shown_after_restart() {
        let sink = default_sink();
        let stale = sink.acquire().unwrap();
        let first_session = stale.session;
        sink.stop().unwrap();
        assert!(matches!(sink.show(stale), Err(ShowError::NotStarted)));
        assert_eq!(sink.device().release_calls(), 1);

        sink.start(&test_format()).unwrap();
        assert_ne!(sink.acquire().unwrap().session, first_session);
        assert_eq!(sink.device().enqueue_calls(), 0);
    }

    #[test]
    fn test_unexpected_state_parks_buffer() {
        let sink = default_sink();
        let buffer = sink.acquire().unwrap();
        let index = buffer.index().unwrap();
        let session = buffer.session;
        sink.show(buffer).unwrap();

        // A release for a buffer still owned by the device is a protocol
        // violation: it is neither freed nor reused.
        sink.inner.recycle(Release::Slot { index, session });
        assert_eq!(sink.stats().parked, 1);
        assert_eq!(sink.buffer_state(index), Some(BufferState::Showing));
        check_invariants(&sink);
    }

    #[test]
    fn test_buffers_dropped_on_other_thread() {
        let sink = default_sink();
        let buffers: Vec<_> = (0..4).map(|_| sink.acquire().unwrap()).collect();

        std::thread::spawn(move || drop(buffers)).join().unwrap();
        assert_eq!(sink.pool_snapshot().free, 4);
        assert_eq!(sink.stats().dropped, 4);
        check_invariants(&sink);
    }

    #[test]
    fn test_buffer_outlives_sink() {
        let sink = default_sink();
        let buffer = sink.acquire().unwrap();
        drop(sink);
        // Memory is simply freed.
        drop(buffer);
    }

    #[test]
    fn test_conservation_under_mixed_operations() {
        let sink = started_sink(MockDevice::new(), test_config().watermarks(1, 2));
        let mut held = Vec::new();
        let mut seed = 0x2545_f491_u32;

        for _ in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            match seed % 6 {
                0 | 1 => {
                    if held.len() < 8 {
                        held.push(sink.acquire().unwrap());
                    }
                }
                2 => {
                    if let Some(buffer) = held.pop() {
                        sink.show(buffer).unwrap();
                    }
                }
                3 => {
                    if !held.is_empty() {
                        drop(held.remove(0));
                    }
                }
                4 => sink.device().complete(1 + ((seed >> 8) % 2) as usize),
                _ => {
                    sink.dequeue();
                }
            }
            check_invariants(&sink);
        }

        drop(held);
        check_invariants(&sink);
        let stats = sink.stats();
        assert!(stats.shown > 0);
        assert_eq!(stats.parked, 0);
    }
}
