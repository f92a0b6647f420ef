use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;

/// Counters of notable sink events since its creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    /// Frames successfully submitted to the device.
    pub shown: u64,
    /// Frames released without ever being submitted.
    pub dropped: u64,
    /// Software buffers handed out because no hardware buffer was available.
    pub software_fallbacks: u64,
    /// Pacing passes that failed to bring the queue below the high watermark.
    pub recovery_passes: u64,
    /// Buffers found in an unexpected state and kept aside.
    pub parked: u64,
}

#[derive(Debug)]
pub(super) struct Counters {
    shown: AtomicU64,
    dropped: AtomicU64,
    software_fallbacks: AtomicU64,
    recovery_passes: AtomicU64,
    parked: AtomicU64,
    drop_log_interval: u64,
}

impl Counters {
    pub(super) fn new(drop_log_interval: u64) -> Self {
        Counters {
            shown: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            software_fallbacks: AtomicU64::new(0),
            recovery_passes: AtomicU64::new(0),
            parked: AtomicU64::new(0),
            drop_log_interval: drop_log_interval.max(1),
        }
    }

    pub(super) fn frame_shown(&self) {
        self.shown.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn frame_dropped(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if self.reports_drop(dropped) {
            warn!("{} frames dropped so far", dropped);
        }
    }

    /// Whether the `dropped`-th dropped frame is worth a warning.
    fn reports_drop(&self, dropped: u64) -> bool {
        dropped % self.drop_log_interval == 0
    }

    pub(super) fn software_fallback(&self) {
        self.software_fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn recovery_pass(&self) {
        self.recovery_passes.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn buffer_parked(&self) {
        self.parked.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn snapshot(&self) -> SinkStats {
        SinkStats {
            shown: self.shown.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            software_fallbacks: self.software_fallbacks.load(Ordering::Relaxed),
            recovery_passes: self.recovery_passes.load(Ordering::Relaxed),
            parked: self.parked.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of where the hardware buffers are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSnapshot {
    pub buffers_required: usize,
    pub reserved: usize,
    pub free: usize,
    pub in_flight: usize,
    /// Buffers held by the producer.
    pub allocated: usize,
    /// Buffers forcibly taken back from the device by `suspend`, waiting to be
    /// recycled by `resume`.
    pub pending_recycle: usize,
    pub queued_count: usize,
    pub streaming: bool,
    pub suspended: bool,
}

impl PoolSnapshot {
    /// Whether every hardware buffer is accounted for exactly once.
    pub fn is_conserved(&self) -> bool {
        self.reserved + self.free + self.in_flight + self.allocated + self.pending_recycle
            == self.buffers_required
    }
}
