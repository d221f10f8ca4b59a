//! Four-band priority queue with starvation mitigation.
//!
//! One [`MpscRing`] per priority band. Producers enqueue at their band;
//! the consumer drains with a weighted policy: URGENT always wins, and every
//! `low_service_interval`-th drain of the two upper bands forces a LOW (then
//! NORMAL) attempt so background traffic keeps moving under sustained
//! high-priority load. With the interval at 1 the queue degenerates to plain
//! FIFO across bands; very large intervals delay LOW arbitrarily. The
//! default of 16 is the tested contract.

use std::sync::atomic::{AtomicU64, Ordering};

use imc_common::Priority;

use crate::ring::MpscRing;

/// Default number of HIGH/URGENT drains between forced LOW services.
pub const DEFAULT_LOW_SERVICE_INTERVAL: u64 = 16;

/// Per-subscription priority queue.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    bands: [MpscRing<T>; Priority::COUNT],
    drains: [AtomicU64; Priority::COUNT],
    low_service_interval: u64,
}

impl<T> PriorityQueue<T> {
    /// Creates a queue with `capacity_per_band` slots in each band.
    pub fn new(capacity_per_band: usize, low_service_interval: u64) -> Self {
        Self {
            bands: std::array::from_fn(|_| MpscRing::with_capacity(capacity_per_band)),
            drains: std::array::from_fn(|_| AtomicU64::new(0)),
            low_service_interval: low_service_interval.max(1),
        }
    }

    /// Enqueues at `priority`, handing the value back when that band is full.
    pub fn enqueue(&self, value: T, priority: Priority) -> Result<(), T> {
        self.bands[priority.index()].enqueue(value)
    }

    /// Evicts the oldest element of `priority`'s band.
    ///
    /// Used by the DROP_OLDEST backpressure policy; the caller must hold the
    /// subscription's consumer lock, since this is a consumer-side operation.
    pub fn evict_oldest(&self, priority: Priority) -> Option<T> {
        self.bands[priority.index()].dequeue()
    }

    /// Dequeues the next element under the fairness policy. Single consumer
    /// only.
    pub fn dequeue(&self) -> Option<T> {
        // Urgent traffic is never deferred.
        if let Some(value) = self.bands[Priority::Urgent.index()].dequeue() {
            self.count_drain(Priority::Urgent);
            return Some(value);
        }

        // Forced low-band service every `low_service_interval` upper drains.
        let total_high = self.drains[Priority::High.index()].load(Ordering::Relaxed)
            + self.drains[Priority::Urgent.index()].load(Ordering::Relaxed);
        if total_high > 0 && total_high % self.low_service_interval == 0 {
            for band in [Priority::Low, Priority::Normal] {
                if let Some(value) = self.bands[band.index()].dequeue() {
                    self.count_drain(band);
                    return Some(value);
                }
            }
        }

        for band in [Priority::High, Priority::Normal, Priority::Low] {
            if let Some(value) = self.bands[band.index()].dequeue() {
                self.count_drain(band);
                return Some(value);
            }
        }
        None
    }

    /// Whether all bands look empty.
    pub fn is_empty(&self) -> bool {
        self.bands.iter().all(MpscRing::is_empty)
    }

    /// Best-effort total element count.
    pub fn approximate_len(&self) -> usize {
        self.bands.iter().map(MpscRing::approximate_len).sum()
    }

    /// Best-effort element count of one band.
    pub fn band_len(&self, priority: Priority) -> usize {
        self.bands[priority.index()].approximate_len()
    }

    /// Slot count of one band.
    pub fn band_capacity(&self) -> usize {
        self.bands[0].capacity()
    }

    fn count_drain(&self, band: Priority) {
        self.drains[band.index()].fetch_add(1, Ordering::Relaxed);
    }
}
