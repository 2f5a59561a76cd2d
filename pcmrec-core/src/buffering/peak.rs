//! Peak meter shared between the worker and UI pollers.

use std::sync::atomic::{AtomicU16, Ordering};

use super::chunk::ChannelPeaks;

/// Left/right running maxima. Written by the normalize pass, read-and-reset by
/// any thread. Lost updates between `record` and `take` only affect the meter.
#[derive(Debug, Default)]
pub struct PeakMeter {
    left: AtomicU16,
    right: AtomicU16,
}

impl PeakMeter {
    pub fn record(&self, peaks: ChannelPeaks) {
        self.left.fetch_max(peaks.left, Ordering::Relaxed);
        self.right.fetch_max(peaks.right, Ordering::Relaxed);
    }

    /// Return the peaks accumulated since the previous call and reset them.
    pub fn take(&self) -> ChannelPeaks {
        ChannelPeaks {
            left: self.left.swap(0, Ordering::Relaxed),
            right: self.right.swap(0, Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.left.store(0, Ordering::Relaxed);
        self.right.store(0, Ordering::Relaxed);
    }
}
