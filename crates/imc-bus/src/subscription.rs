//! Subscriptions and backpressure.
//!
//! A subscription binds a handler to a topic and owns a private priority
//! queue the publish path feeds. What happens when that queue is full is the
//! subscription's own choice: drop the new message, evict the oldest, make
//! the publisher wait, or fail the publish outright.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use imc_common::{Envelope, EnvelopeHeader, Error, Priority, TopicId};
use parking_lot::Mutex;
use serde::Serialize;

use crate::bus::Bus;
use crate::priority::PriorityQueue;

/// Subscription handler. Runs on the pump's controller thread; captured
/// state replaces the C-style `user_data` pointer and is dropped with the
/// subscription.
pub type SubscriberFn = Arc<dyn Fn(&Bus, TopicId, &Envelope) + Send + Sync>;

/// Publish-side filter over envelope metadata. A rejecting filter skips the
/// subscription without counting a drop.
pub type FilterFn = Arc<dyn Fn(&EnvelopeHeader) -> bool + Send + Sync>;

/// Policy applied when a subscription's queue band is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Backpressure {
    /// Discard the incoming message for this subscription.
    #[default]
    DropNewest,
    /// Evict the oldest message of the same band, then enqueue.
    DropOldest,
    /// Park the publisher until space frees up or the timeout elapses.
    Block {
        /// How long the publisher is willing to wait.
        timeout: Duration,
    },
    /// Fail the publish immediately with a queue-full error.
    Fail,
}

/// Options of one subscription.
#[derive(Clone, Default)]
#[non_exhaustive]
pub struct SubscribeOptions {
    /// Lowest priority band the subscription accepts; lower-priority
    /// messages are skipped like a rejecting filter.
    pub min_priority: Priority,
    /// Requested per-band queue depth; 0 means the bus default, values above
    /// the configured maximum are clamped.
    pub queue_depth: usize,
    /// Full-queue policy.
    pub backpressure: Backpressure,
    /// Metadata filter, if any.
    pub filter: Option<FilterFn>,
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("min_priority", &self.min_priority)
            .field("queue_depth", &self.queue_depth)
            .field("backpressure", &self.backpressure)
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

/// Opaque, copyable reference to a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// Per-subscription delivery counters.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionStats {
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub last_latency_ns: AtomicU64,
}

/// Point-in-time copy of a subscription's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStatsSnapshot {
    /// Messages dispatched to the handler.
    pub delivered: u64,
    /// Messages rejected by backpressure.
    pub dropped: u64,
    /// Publish-to-dispatch latency of the most recent delivery, nanoseconds.
    pub last_latency_ns: u64,
}

/// What the publish path did with one envelope for one subscription.
#[derive(Debug)]
pub(crate) enum Offer {
    /// Queued for dispatch.
    Enqueued,
    /// Skipped by filter or priority floor; not a drop.
    Skipped,
    /// Discarded under a DROP_* policy.
    Dropped,
    /// The publish itself fails with this error.
    Rejected(Error),
}

pub(crate) struct Subscription {
    pub topic: TopicId,
    pub handler: SubscriberFn,
    pub options: SubscribeOptions,
    pub queue: PriorityQueue<Arc<Envelope>>,
    pub active: AtomicBool,
    /// Serialises the queue's consumer side between the pump and
    /// DROP_OLDEST eviction.
    pub consumer_lock: Mutex<()>,
    pub stats: SubscriptionStats,
    block_retry: Duration,
}

impl Subscription {
    pub fn new(
        topic: TopicId,
        handler: SubscriberFn,
        options: SubscribeOptions,
        queue_depth: usize,
        low_service_interval: u64,
        block_retry: Duration,
    ) -> Self {
        Self {
            topic,
            handler,
            options,
            queue: PriorityQueue::new(queue_depth, low_service_interval),
            active: AtomicBool::new(true),
            consumer_lock: Mutex::new(()),
            stats: SubscriptionStats::default(),
            block_retry,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Applies filter, priority floor, and backpressure for one envelope.
    pub fn offer(&self, envelope: Arc<Envelope>) -> Offer {
        if !self.is_active() {
            return Offer::Skipped;
        }
        if envelope.header.priority < self.options.min_priority {
            return Offer::Skipped;
        }
        if let Some(filter) = &self.options.filter {
            if !filter(&envelope.header) {
                return Offer::Skipped;
            }
        }

        let band = envelope.header.priority;
        match self.queue.enqueue(envelope, band) {
            Ok(()) => Offer::Enqueued,
            Err(rejected) => self.handle_full(rejected, band),
        }
    }

    fn handle_full(&self, envelope: Arc<Envelope>, band: Priority) -> Offer {
        match self.options.backpressure {
            Backpressure::DropNewest => {
                self.count_drop();
                Offer::Dropped
            }
            Backpressure::DropOldest => self.evict_and_enqueue(envelope, band),
            Backpressure::Block { timeout } => self.block_until_space(envelope, band, timeout),
            Backpressure::Fail => {
                self.count_drop();
                Offer::Rejected(Error::QueueFull)
            }
        }
    }

    fn evict_and_enqueue(&self, envelope: Arc<Envelope>, band: Priority) -> Offer {
        // Eviction dequeues, so it must hold the consumer lock the pump uses.
        let _consumer = self.consumer_lock.lock();
        let mut envelope = envelope;
        // Bounded retries: producers racing for the freed slot can starve a
        // single attempt, but not capacity-many of them.
        for _ in 0..self.queue.band_capacity().max(2) * 2 {
            if let Some(evicted) = self.queue.evict_oldest(band) {
                drop(evicted);
                self.count_drop();
            }
            match self.queue.enqueue(envelope, band) {
                Ok(()) => return Offer::Enqueued,
                Err(back) => envelope = back,
            }
        }
        self.count_drop();
        Offer::Dropped
    }

    fn block_until_space(
        &self,
        envelope: Arc<Envelope>,
        band: Priority,
        timeout: Duration,
    ) -> Offer {
        let deadline = Instant::now() + timeout;
        let mut envelope = envelope;
        loop {
            match self.queue.enqueue(envelope, band) {
                Ok(()) => return Offer::Enqueued,
                Err(back) => envelope = back,
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    topic = self.topic.get(),
                    timeout_ms = timeout.as_millis() as u64,
                    "publisher timed out blocking on a full subscription queue"
                );
                self.count_drop();
                return Offer::Rejected(Error::QueueFull);
            }
            std::thread::sleep(self.block_retry);
        }
    }

    pub fn stats_snapshot(&self) -> SubscriptionStatsSnapshot {
        SubscriptionStatsSnapshot {
            delivered: self.stats.delivered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            last_latency_ns: self.stats.last_latency_ns.load(Ordering::Relaxed),
        }
    }

    fn count_drop(&self) {
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .field("queued", &self.queue.approximate_len())
            .finish()
    }
}
