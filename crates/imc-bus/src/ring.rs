//! Bounded lock-free multi-producer single-consumer ring.
//!
//! Dmitry Vyukov's bounded queue algorithm, specialised for one consumer.
//! Every slot carries a sequence counter; a producer reserves a slot by
//! observing `sequence == head` and bumping the head cursor, then publishes
//! the value by storing `sequence = head + 1`. The consumer accepts a slot at
//! `sequence == tail + 1` and recycles it with `sequence = tail + capacity`.
//! Producers never block each other; a full ring is reported immediately.
//!
//! Ordering: acquire on every sequence load, release on every sequence store,
//! relaxed on the cursor compare-exchanges — the sequences carry all
//! inter-thread happens-before edges.

// The slot cells are the one place in this crate that needs raw storage.
#![allow(unsafe_code)]

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};

struct Slot<T> {
    sequence: AtomicUsize,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded MPSC ring buffer.
///
/// `enqueue` may be called from any number of threads concurrently;
/// `dequeue` must only ever run on one thread at a time. The bus enforces the
/// consumer side with the subscription's consumer lock.
pub struct MpscRing<T> {
    mask: usize,
    slots: Box<[Slot<T>]>,
    /// Producer cursor.
    head: AtomicUsize,
    /// Consumer cursor.
    tail: AtomicUsize,
}

// SAFETY: values move through the ring at most once: a slot's value is
// written by exactly one producer (the one that won the head CAS for that
// sequence) and read by the single consumer, with the slot sequence's
// release/acquire pair ordering the two. No reference to a value ever
// escapes the ring.
unsafe impl<T: Send> Send for MpscRing<T> {}
unsafe impl<T: Send> Sync for MpscRing<T> {}

impl<T> MpscRing<T> {
    /// Creates a ring with at least `capacity` slots, rounded up to a power
    /// of two, minimum 2.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|i| Slot {
                sequence: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();
        Self {
            mask: capacity - 1,
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Enqueues `value`, returning it back to the caller when the ring is
    /// full.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        let mut pos = self.head.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos as isize;
            if diff == 0 {
                match self.head.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the CAS above granted this producer
                        // exclusive ownership of the slot for sequence
                        // `pos`; nobody else touches it until the release
                        // store below republishes it.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.sequence.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return Err(value);
            } else {
                // Another producer reserved this slot; re-read the cursor.
                pos = self.head.load(Ordering::Relaxed);
            }
        }
    }

    /// Dequeues the oldest value. Single consumer only.
    pub fn dequeue(&self) -> Option<T> {
        let mut pos = self.tail.load(Ordering::Relaxed);
        loop {
            let slot = &self.slots[pos & self.mask];
            let seq = slot.sequence.load(Ordering::Acquire);
            let diff = seq as isize - pos.wrapping_add(1) as isize;
            if diff == 0 {
                match self.tail.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: the producer's release store of
                        // `sequence == pos + 1` happens-before our acquire
                        // load, so the slot holds an initialised value and
                        // we are the only reader of it.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        slot.sequence
                            .store(pos.wrapping_add(self.capacity()), Ordering::Release);
                        return Some(value);
                    }
                    Err(current) => pos = current,
                }
            } else if diff < 0 {
                return None;
            } else {
                pos = self.tail.load(Ordering::Relaxed);
            }
        }
    }

    /// Whether the ring currently looks empty.
    pub fn is_empty(&self) -> bool {
        self.tail.load(Ordering::Acquire) == self.head.load(Ordering::Acquire)
    }

    /// Best-effort element count; not linearisable against concurrent
    /// producers.
    pub fn approximate_len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail)
    }

    /// Slot count.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }
}

impl<T> Drop for MpscRing<T> {
    fn drop(&mut self) {
        // Drain leftovers so their drop glue (payload cleanups!) still runs.
        while self.dequeue().is_some() {}
    }
}

impl<T> std::fmt::Debug for MpscRing<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MpscRing")
            .field("capacity", &self.capacity())
            .field("approximate_len", &self.approximate_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(MpscRing::<u32>::with_capacity(0).capacity(), 2);
        assert_eq!(MpscRing::<u32>::with_capacity(1).capacity(), 2);
        assert_eq!(MpscRing::<u32>::with_capacity(3).capacity(), 4);
        assert_eq!(MpscRing::<u32>::with_capacity(8).capacity(), 8);
        assert_eq!(MpscRing::<u32>::with_capacity(1000).capacity(), 1024);
    }

    #[test]
    fn fifo_single_thread() {
        let ring = MpscRing::with_capacity(8);
        for i in 0..8 {
            ring.enqueue(i).expect("space");
        }
        assert_eq!(ring.enqueue(99), Err(99));
        for i in 0..8 {
            assert_eq!(ring.dequeue(), Some(i));
        }
        assert_eq!(ring.dequeue(), None);
        assert!(ring.is_empty());
    }

    #[test]
    fn slots_are_reusable_after_wraparound() {
        let ring = MpscRing::with_capacity(4);
        for round in 0..10 {
            for i in 0..4 {
                ring.enqueue(round * 10 + i).expect("space");
            }
            for i in 0..4 {
                assert_eq!(ring.dequeue(), Some(round * 10 + i));
            }
        }
    }

    #[test]
    fn no_loss_no_duplicates_under_contention() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let ring = Arc::new(MpscRing::with_capacity(128));
        let rejected = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ring = ring.clone();
                let rejected = rejected.clone();
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        let value = p * PER_PRODUCER + i;
                        if ring.enqueue(value).is_err() {
                            rejected.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();

        let mut seen = vec![false; PRODUCERS * PER_PRODUCER];
        let mut received = 0usize;
        loop {
            match ring.dequeue() {
                Some(value) => {
                    assert!(!seen[value], "value {value} delivered twice");
                    seen[value] = true;
                    received += 1;
                }
                None => {
                    if handles.iter().all(|h| h.is_finished()) && ring.is_empty() {
                        break;
                    }
                    std::hint::spin_loop();
                }
            }
        }
        for handle in handles {
            handle.join().expect("producer");
        }
        while let Some(value) = ring.dequeue() {
            assert!(!seen[value]);
            seen[value] = true;
            received += 1;
        }

        assert_eq!(received + rejected.load(Ordering::Relaxed), PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn drop_runs_leftover_destructors() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        let ring = MpscRing::with_capacity(8);
        for _ in 0..5 {
            ring.enqueue(Tracked(drops.clone())).map_err(drop).expect("space");
        }
        drop(ring);
        assert_eq!(drops.load(Ordering::SeqCst), 5);
    }
}
