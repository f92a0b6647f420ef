//! Containers tracking where each hardware buffer currently is.
//!
//! Every hardware buffer is identified by its device index and is, at any
//! time, in exactly one of the reserved pool, the free pool, the in-flight
//! queue, or held by the producer. The containers here only store indices;
//! the memory of buffers under pool custody lives in the [`SlotTable`].
use std::collections::VecDeque;

use crate::memory::HardwareMemory;

use super::BufferState;

/// Fixed-depth LIFO reserve of hardware buffers, used to back frames produced
/// in software memory.
#[derive(Debug)]
pub struct ReservedPool {
    indices: Vec<usize>,
    depth: usize,
}

impl ReservedPool {
    pub fn new(depth: usize) -> Self {
        ReservedPool {
            indices: Vec::with_capacity(depth),
            depth,
        }
    }

    /// Adds `index` to the reserve. If the reserve is already full, `index` is
    /// given back as the error.
    pub fn push(&mut self, index: usize) -> Result<(), usize> {
        if self.is_full() {
            return Err(index);
        }
        self.indices.push(index);
        Ok(())
    }

    /// Takes the most recently pushed buffer.
    pub fn pop(&mut self) -> Option<usize> {
        self.indices.pop()
    }

    pub fn is_full(&self) -> bool {
        self.indices.len() >= self.depth
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub(super) fn drain(&mut self) -> impl Iterator<Item = usize> + '_ {
        self.indices.drain(..)
    }
}

/// Idle hardware buffers beyond the reserve, handed out in FIFO order.
#[derive(Debug, Default)]
pub struct FreePool(VecDeque<usize>);

impl FreePool {
    pub fn push(&mut self, index: usize) {
        self.0.push_back(index);
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.0.pop_front()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(super) fn drain(&mut self) -> impl Iterator<Item = usize> + '_ {
        self.0.drain(..)
    }
}

/// Indices of the buffers currently owned by the device, in submission order.
#[derive(Debug, Default)]
pub struct InFlightQueue(VecDeque<usize>);

impl InFlightQueue {
    /// Records `index` as submitted. Fails if it is already in flight.
    pub fn push(&mut self, index: usize) -> Result<(), usize> {
        if self.contains(index) {
            return Err(index);
        }
        self.0.push_back(index);
        Ok(())
    }

    /// Removes `index`, returning whether it was in flight.
    pub fn remove(&mut self, index: usize) -> bool {
        match self.0.iter().position(|&i| i == index) {
            Some(pos) => {
                self.0.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.0.contains(&index)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &usize> {
        self.0.iter()
    }

    pub(super) fn drain(&mut self) -> impl Iterator<Item = usize> + '_ {
        self.0.drain(..)
    }
}

/// Per-index bookkeeping of a hardware buffer.
pub(super) struct Slot<M> {
    pub(super) state: BufferState,
    pub(super) show_count: usize,
    /// Present while the buffer is under pool or device custody, absent while
    /// the producer holds it.
    pub(super) memory: Option<HardwareMemory<M>>,
}

/// The hardware buffers of one streaming session, addressed by device index.
pub(super) struct SlotTable<M> {
    pub(super) slots: Vec<Slot<M>>,
    /// Number of slots whose memory has not been freed yet. The device buffers
    /// can be released once it drops to 0.
    pub(super) live: usize,
    pub(super) session: u64,
}

impl<M> SlotTable<M> {
    pub(super) fn new(session: u64, memories: Vec<HardwareMemory<M>>) -> Self {
        let slots: Vec<_> = memories
            .into_iter()
            .map(|memory| Slot {
                state: BufferState::Idle,
                show_count: 0,
                memory: Some(memory),
            })
            .collect();

        SlotTable {
            live: slots.len(),
            slots,
            session,
        }
    }

    pub(super) fn get(&self, index: usize) -> Option<&Slot<M>> {
        self.slots.get(index)
    }

    pub(super) fn get_mut(&mut self, index: usize) -> Option<&mut Slot<M>> {
        self.slots.get_mut(index)
    }

    /// Frees the memory of slot `index`, unless it was already freed. Returns
    /// whether the slot was freed by this call.
    pub(super) fn free_slot(&mut self, index: usize) -> bool {
        let Some(slot) = self.slots.get_mut(index) else {
            return false;
        };
        if slot.state == BufferState::Illegal {
            return false;
        }
        slot.state = BufferState::Illegal;
        slot.show_count = 0;
        // Unmaps the buffer.
        slot.memory = None;
        self.live = self.live.saturating_sub(1);
        true
    }

    pub(super) fn count_in_state(&self, state: BufferState) -> usize {
        self.slots.iter().filter(|s| s.state == state).count()
    }
}
