//! The bus facade.
//!
//! One [`Bus`] owns the topic and RPC name registries, the subscription
//! table, the future store, and the RPC table. Publish, subscribe, and every
//! future operation are safe from any thread; [`Bus::pump`] is expected to
//! run on a single controller thread and is where subscription handlers
//! execute. RPC handlers run on the calling thread.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use imc_common::{
    ApiVersion, Capabilities, Envelope, EnvelopeHeader, Error, ExternalBuffer, MessageOptions,
    Payload, Priority, Result, RpcId, TopicId, INLINE_CAPACITY, RUNTIME_API_VERSION,
};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use slab::Slab;

use crate::config::BusConfig;
use crate::future::{self, FutureHandle, FutureResult, FutureState, FutureStore};
use crate::names::NameRegistry;
use crate::rpc::{RpcHandlerFn, RpcTable};
use crate::stats::{BusStats, BusStatsSnapshot};
use crate::subscription::{
    Offer, SubscribeOptions, Subscription, SubscriptionHandle, SubscriptionStatsSnapshot,
};

/// Capability descriptor of the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BusCaps {
    /// Version of the runtime API surface.
    pub api_version: ApiVersion,
    /// Feature flags, including the fan-out sharing advertisement.
    pub capabilities: Capabilities,
    /// Upper bound on one subscription's total queue depth, all bands.
    pub max_queue_depth: usize,
    /// Largest payload stored without a heap allocation.
    pub inline_payload_max: usize,
}

/// Diagnostic view of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    /// The topic id.
    pub id: TopicId,
    /// The registered name.
    pub name: String,
    /// Number of active subscriptions.
    pub subscribers: usize,
    /// Messages successfully published to the topic so far.
    pub message_count: u64,
}

#[derive(Default)]
struct Topic {
    /// Insertion-ordered subscription list.
    subs: RwLock<Vec<(SubscriptionHandle, Arc<Subscription>)>>,
}

/// Process-local message bus.
pub struct Bus {
    config: BusConfig,
    topics: NameRegistry<TopicId>,
    rpc_names: NameRegistry<RpcId>,
    topic_table: RwLock<HashMap<TopicId, Arc<Topic>>>,
    subscriptions: RwLock<Slab<(u64, Arc<Subscription>)>>,
    next_generation: AtomicU64,
    next_msg_id: AtomicU64,
    futures: FutureStore,
    rpcs: RpcTable,
    stats: BusStats,
    epoch: Instant,
}

static GLOBAL_BUS: Mutex<Option<Arc<Bus>>> = Mutex::new(None);

impl Bus {
    /// Creates a bus with the given configuration.
    pub fn new(config: BusConfig) -> Self {
        Self {
            config,
            topics: NameRegistry::new(),
            rpc_names: NameRegistry::new(),
            topic_table: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(Slab::new()),
            next_generation: AtomicU64::new(1),
            next_msg_id: AtomicU64::new(1),
            futures: FutureStore::new(),
            rpcs: RpcTable::new(),
            stats: BusStats::default(),
            epoch: Instant::now(),
        }
    }

    /// The process-wide bus, created lazily on first use.
    pub fn global() -> Arc<Bus> {
        let mut slot = GLOBAL_BUS.lock();
        slot.get_or_insert_with(|| Arc::new(Bus::new(BusConfig::default())))
            .clone()
    }

    /// Shuts down and forgets the process-wide bus. The next
    /// [`Bus::global`] call re-initialises it; safe from a host detach path.
    pub fn shutdown_global() {
        let bus = GLOBAL_BUS.lock().take();
        if let Some(bus) = bus {
            bus.shutdown();
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // Id resolution
    // ------------------------------------------------------------------

    /// Resolves a topic name to its id, allocating one on first use.
    pub fn topic_id(&self, name: &str) -> Result<TopicId> {
        self.topics.get_or_create(name)
    }

    /// Resolves an RPC name to its id, allocating one on first use.
    pub fn rpc_id(&self, name: &str) -> Result<RpcId> {
        self.rpc_names.get_or_create(name)
    }

    // ------------------------------------------------------------------
    // Publish
    // ------------------------------------------------------------------

    /// Publishes `data` to `topic` at normal priority. Returns the number of
    /// subscriptions the message was queued for; zero subscribers is not an
    /// error.
    pub fn publish(&self, topic: TopicId, data: &[u8]) -> Result<usize> {
        self.publish_with(topic, data, &MessageOptions::default())
    }

    /// Publishes with explicit message metadata.
    pub fn publish_with(
        &self,
        topic: TopicId,
        data: &[u8],
        options: &MessageOptions,
    ) -> Result<usize> {
        self.publish_envelope(topic, Payload::copy_from(data), options)
    }

    /// Publishes a caller-provided buffer. A buffer carrying a cleanup is
    /// adopted zero-copy and the cleanup runs exactly once, when the last
    /// subscriber is done with the message; a buffer without one is copied.
    pub fn publish_buffer(&self, topic: TopicId, buffer: ExternalBuffer) -> Result<usize> {
        self.publish_envelope(topic, Payload::from_buffer(buffer), &MessageOptions::default())
    }

    /// Publishes the same bytes to several topics, one envelope per topic.
    /// Returns the total number of queued deliveries.
    pub fn publish_multi(
        &self,
        topics: &[TopicId],
        data: &[u8],
        options: &MessageOptions,
    ) -> Result<usize> {
        if topics.is_empty() {
            return Err(Error::InvalidArgument("topic list must not be empty"));
        }
        let mut delivered = 0;
        for &topic in topics {
            delivered += self.publish_envelope(topic, Payload::copy_from(data), options)?;
        }
        Ok(delivered)
    }

    fn publish_envelope(
        &self,
        topic: TopicId,
        payload: Payload,
        options: &MessageOptions,
    ) -> Result<usize> {
        let header = self.make_header(options);
        let envelope = Arc::new(Envelope::new(header, payload));

        // Snapshot the subscription list so enqueueing (which may block under
        // the BLOCK policy) runs without any table lock held.
        let subs: Vec<Arc<Subscription>> = {
            let table = self.topic_table.read();
            match table.get(&topic) {
                Some(entry) => entry.subs.read().iter().map(|(_, s)| s.clone()).collect(),
                None => Vec::new(),
            }
        };

        let mut accepted = 0usize;
        let mut rejection: Option<Error> = None;
        for sub in &subs {
            match sub.offer(envelope.clone()) {
                Offer::Enqueued => accepted += 1,
                Offer::Skipped => {}
                Offer::Dropped => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
                Offer::Rejected(error) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    rejection.get_or_insert(error);
                }
            }
        }

        if let Some(error) = rejection {
            return Err(error);
        }
        self.topics.increment_count(topic);
        self.stats.published.fetch_add(1, Ordering::Relaxed);
        Ok(accepted)
    }

    fn make_header(&self, options: &MessageOptions) -> EnvelopeHeader {
        EnvelopeHeader {
            sender: options.sender,
            msg_id: self.next_msg_id.fetch_add(1, Ordering::Relaxed),
            flags: options.flags,
            priority: options.priority,
            timestamp_ns: self.now_ns(),
            reply_topic: options.reply_topic,
        }
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    // ------------------------------------------------------------------
    // Subscribe
    // ------------------------------------------------------------------

    /// Subscribes `handler` to `topic` with default options.
    pub fn subscribe(
        &self,
        topic: TopicId,
        handler: impl Fn(&Bus, TopicId, &Envelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        self.subscribe_with(topic, SubscribeOptions::default(), handler)
    }

    /// Subscribes with explicit options. Subscribing to a topic nobody has
    /// published to yet simply creates its table entry.
    pub fn subscribe_with(
        &self,
        topic: TopicId,
        options: SubscribeOptions,
        handler: impl Fn(&Bus, TopicId, &Envelope) + Send + Sync + 'static,
    ) -> Result<SubscriptionHandle> {
        let depth = self.config.clamp_queue_depth(options.queue_depth);
        let subscription = Arc::new(Subscription::new(
            topic,
            Arc::new(handler),
            options,
            depth,
            self.config.low_service_interval,
            self.config.block_retry_interval(),
        ));

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let index = self
            .subscriptions
            .write()
            .insert((generation, subscription.clone()));
        let handle = SubscriptionHandle { index, generation };

        let entry = {
            let mut table = self.topic_table.write();
            table.entry(topic).or_default().clone()
        };
        entry.subs.write().push((handle, subscription));
        Ok(handle)
    }

    /// Deactivates and removes a subscription. The handle stays queryable:
    /// [`Bus::subscription_is_active`] reports `false` afterwards.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
        let subscription = {
            let mut slab = self.subscriptions.write();
            match slab.get(handle.index) {
                Some((generation, _)) if *generation == handle.generation => {
                    slab.remove(handle.index).1
                }
                _ => return Err(Error::InvalidHandle),
            }
        };
        // No new enqueues from publishers past this point.
        subscription.deactivate();

        let entry = self.topic_table.read().get(&subscription.topic).cloned();
        if let Some(entry) = entry {
            entry.subs.write().retain(|(h, _)| *h != handle);
        }
        Ok(())
    }

    /// Whether the subscription behind `handle` is still active. Stale
    /// handles read as inactive rather than erroring.
    pub fn subscription_is_active(&self, handle: SubscriptionHandle) -> bool {
        self.resolve_subscription(handle)
            .map(|s| s.is_active())
            .unwrap_or(false)
    }

    /// Delivery counters of a live subscription.
    pub fn subscription_stats(&self, handle: SubscriptionHandle) -> Result<SubscriptionStatsSnapshot> {
        Ok(self.resolve_subscription(handle)?.stats_snapshot())
    }

    fn resolve_subscription(&self, handle: SubscriptionHandle) -> Result<Arc<Subscription>> {
        let slab = self.subscriptions.read();
        match slab.get(handle.index) {
            Some((generation, subscription)) if *generation == handle.generation => {
                Ok(subscription.clone())
            }
            _ => Err(Error::InvalidHandle),
        }
    }

    // ------------------------------------------------------------------
    // RPC
    // ------------------------------------------------------------------

    /// Registers an RPC handler under `id`.
    pub fn register_rpc(
        &self,
        id: RpcId,
        handler: impl Fn(&Bus, RpcId, &Envelope) -> Result<Payload> + Send + Sync + 'static,
    ) -> Result<()> {
        self.rpcs.register(id, Arc::new(handler) as RpcHandlerFn)
    }

    /// Removes the handler of `id`.
    pub fn unregister_rpc(&self, id: RpcId) -> Result<()> {
        self.rpcs.unregister(id)
    }

    /// Invokes the handler of `id` synchronously on the calling thread and
    /// returns the future carrying its result. With the default synchronous
    /// contract the future is already terminal when this returns. No future
    /// is created when the id has no handler.
    pub fn call_rpc(&self, id: RpcId, request: Payload) -> Result<FutureHandle> {
        let Some(handler) = self.rpcs.get(id) else {
            return Err(Error::RpcNotRegistered);
        };
        self.stats.rpc_calls.fetch_add(1, Ordering::Relaxed);
        self.rpc_names.increment_count(id);

        let (handle, cell) = self.futures.create();
        self.stats.futures_created.fetch_add(1, Ordering::Relaxed);

        let envelope = Envelope::new(self.make_header(&MessageOptions::default()), request);
        match catch_unwind(AssertUnwindSafe(|| handler(self, id, &envelope))) {
            Ok(Ok(payload)) => {
                cell.complete_ready(payload);
                self.stats.futures_completed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Err(error)) => {
                self.stats.rpc_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.futures_completed.fetch_add(1, Ordering::Relaxed);
                cell.complete_failed(error);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(rpc = id.get(), message, "rpc handler panicked");
                self.stats.rpc_failures.fetch_add(1, Ordering::Relaxed);
                self.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                self.stats.futures_completed.fetch_add(1, Ordering::Relaxed);
                cell.complete_failed(Error::HandlerPanic(message.to_owned()));
            }
        }
        Ok(handle)
    }

    // ------------------------------------------------------------------
    // Futures
    // ------------------------------------------------------------------

    /// Blocks until the future is terminal or `timeout` elapses; `None`
    /// waits indefinitely.
    pub fn future_wait(
        &self,
        handle: FutureHandle,
        timeout: Option<Duration>,
    ) -> Result<FutureState> {
        self.futures.resolve(handle)?.wait(timeout)
    }

    /// Current state of the future.
    pub fn future_state(&self, handle: FutureHandle) -> Result<FutureState> {
        Ok(self.futures.resolve(handle)?.state())
    }

    /// The READY payload. Fails with the future's error when it is not
    /// READY.
    pub fn future_result(&self, handle: FutureHandle) -> Result<FutureResult> {
        future::result_of(&self.futures, handle)
    }

    /// PENDING → CANCELLED. A handler already in progress is not
    /// interrupted; cancelling a terminal future is refused.
    pub fn future_cancel(&self, handle: FutureHandle) -> Result<()> {
        let cell = self.futures.resolve(handle)?;
        cell.cancel()?;
        self.stats.futures_cancelled.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Registers a completion callback; fires immediately when the future is
    /// already terminal. Registering does not retain the future.
    pub fn future_on_complete(
        &self,
        handle: FutureHandle,
        callback: impl FnOnce(FutureState) + Send + 'static,
    ) -> Result<()> {
        self.futures.resolve(handle)?.on_complete(Box::new(callback));
        Ok(())
    }

    /// Drops the caller's reference; the future is freed at zero. A second
    /// release of the same handle is an error, not a crash.
    pub fn future_release(&self, handle: FutureHandle) -> Result<()> {
        self.futures.release(handle)
    }

    // ------------------------------------------------------------------
    // Pump
    // ------------------------------------------------------------------

    /// Drains every subscription's queue, dispatching at most
    /// `max_per_subscription` messages each (0 = unlimited), and returns the
    /// number of messages dispatched. Expected to run on one controller
    /// thread; a subscription currently being pumped elsewhere is skipped,
    /// not double-drained.
    pub fn pump(&self, max_per_subscription: usize) -> usize {
        let subs: Vec<Arc<Subscription>> = self
            .subscriptions
            .read()
            .iter()
            .map(|(_, (_, s))| s.clone())
            .collect();

        let mut total = 0usize;
        for sub in subs {
            let Some(_consumer) = sub.consumer_lock.try_lock() else {
                continue;
            };
            let mut dispatched = 0usize;
            while max_per_subscription == 0 || dispatched < max_per_subscription {
                let Some(envelope) = sub.queue.dequeue() else {
                    break;
                };
                let latency = self.now_ns().saturating_sub(envelope.header.timestamp_ns);
                let run = catch_unwind(AssertUnwindSafe(|| {
                    (sub.handler)(self, sub.topic, &envelope)
                }));
                match run {
                    Ok(()) => {
                        sub.stats.delivered.fetch_add(1, Ordering::Relaxed);
                        sub.stats.last_latency_ns.store(latency, Ordering::Relaxed);
                        self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                        dispatched += 1;
                    }
                    Err(panic) => {
                        let message = panic_message(panic.as_ref());
                        tracing::error!(
                            topic = sub.topic.get(),
                            message,
                            "subscription handler panicked"
                        );
                        self.stats.handler_panics.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            total += dispatched;
        }
        total
    }

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Snapshot of the bus counters.
    pub fn stats(&self) -> BusStatsSnapshot {
        self.stats.snapshot()
    }

    /// Zeroes the bus counters. Subscription counters are untouched.
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Diagnostic view of a registered topic.
    pub fn topic_info(&self, topic: TopicId) -> Result<TopicInfo> {
        let name = self.topics.name_of(topic).ok_or(Error::NotFound)?;
        let subscribers = self
            .topic_table
            .read()
            .get(&topic)
            .map(|entry| entry.subs.read().len())
            .unwrap_or(0);
        Ok(TopicInfo {
            id: topic,
            name,
            subscribers,
            message_count: self.topics.count(topic),
        })
    }

    /// The registered name of `topic`.
    pub fn topic_name(&self, topic: TopicId) -> Option<String> {
        self.topics.name_of(topic)
    }

    /// Number of registered topics.
    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    /// The bus capability descriptor.
    pub fn caps(&self) -> BusCaps {
        BusCaps {
            api_version: RUNTIME_API_VERSION,
            capabilities: Capabilities::IMC_BASIC
                | Capabilities::IMC_BUFFER
                | Capabilities::IMC_RPC
                | Capabilities::IMC_FUTURE
                | Capabilities::IMC_ID_BASED
                | Capabilities::IMC_DISPATCH
                | Capabilities::IMC_SHARED_FANOUT
                | Capabilities::IMC_PRIORITY
                | Capabilities::STATISTICS
                | Capabilities::DIAGNOSTICS,
            max_queue_depth: self.config.max_queue_depth * Priority::COUNT,
            inline_payload_max: INLINE_CAPACITY,
        }
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Drains all queues, cancels pending futures, and clears every
    /// subscription and RPC registration. Name registries survive — ids are
    /// permanent. The bus remains usable afterwards.
    pub fn shutdown(&self) {
        self.topic_table.write().clear();
        let subs = std::mem::take(&mut *self.subscriptions.write());
        for (_, (_, sub)) in subs {
            sub.deactivate();
            // Dropping the subscription drains its queue; leftover envelopes
            // run their payload cleanups here.
        }
        self.futures.clear();
        self.rpcs.clear();
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("topics", &self.topics.len())
            .field("subscriptions", &self.subscriptions.read().len())
            .field("rpcs", &self.rpcs.len())
            .field("futures", &self.futures.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = Bus::new(BusConfig::default());
        let topic = bus.topic_id("lonely.topic").expect("id");
        assert_eq!(bus.publish(topic, b"anyone?"), Ok(0));
        assert_eq!(bus.stats().published, 1);
        assert_eq!(bus.stats().delivered, 0);
    }

    #[test]
    fn publish_to_unknown_id_reaches_nobody() {
        let bus = Bus::new(BusConfig::default());
        let topic = TopicId::new(0xBADC_0DE).expect("non-zero");
        assert_eq!(bus.publish(topic, b"void"), Ok(0));
    }

    #[test]
    fn subscribe_publish_pump_round_trip() {
        let bus = Bus::new(BusConfig::default());
        let topic = bus.topic_id("round.trip").expect("id");
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let sub = bus
            .subscribe(topic, move |_, t, envelope| {
                assert_eq!(t, topic);
                assert_eq!(envelope.data(), b"ping");
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .expect("subscribe");

        assert_eq!(bus.publish(topic, b"ping"), Ok(1));
        assert_eq!(bus.pump(0), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        bus.unsubscribe(sub).expect("unsubscribe");
        assert!(!bus.subscription_is_active(sub));
        assert_eq!(bus.publish(topic, b"ping"), Ok(0));
    }

    #[test]
    fn handler_panic_does_not_abort_pump() {
        let bus = Bus::new(BusConfig::default());
        let topic = bus.topic_id("panic.topic").expect("id");
        bus.subscribe(topic, |_, _, _| panic!("boom")).expect("subscribe");

        let delivered = Arc::new(AtomicUsize::new(0));
        let seen = delivered.clone();
        bus.subscribe(topic, move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe");

        assert_eq!(bus.publish(topic, b"x"), Ok(2));
        // The panicking delivery is not counted; the healthy one is.
        assert_eq!(bus.pump(0), 1);
        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert_eq!(bus.stats().handler_panics, 1);
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = Bus::new(BusConfig::default());
        let first = bus.topic_id("chain.first").expect("id");
        let second = bus.topic_id("chain.second").expect("id");

        bus.subscribe(first, move |bus, _, envelope| {
            bus.publish(second, envelope.data()).expect("re-entrant publish");
        })
        .expect("subscribe");

        let relayed = Arc::new(AtomicUsize::new(0));
        let seen = relayed.clone();
        bus.subscribe(second, move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .expect("subscribe");

        bus.publish(first, b"hop").expect("publish");
        // A second pump covers either visit order of the two subscriptions.
        bus.pump(0);
        bus.pump(0);
        assert_eq!(relayed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unsubscribe_twice_is_an_error() {
        let bus = Bus::new(BusConfig::default());
        let topic = bus.topic_id("once").expect("id");
        let sub = bus.subscribe(topic, |_, _, _| {}).expect("subscribe");
        bus.unsubscribe(sub).expect("first");
        assert_eq!(bus.unsubscribe(sub), Err(Error::InvalidHandle));
    }

    #[test]
    fn shutdown_keeps_name_registry_and_allows_reuse() {
        let bus = Bus::new(BusConfig::default());
        let topic = bus.topic_id("survivor").expect("id");
        bus.subscribe(topic, |_, _, _| {}).expect("subscribe");
        bus.shutdown();

        assert_eq!(bus.topic_id("survivor"), Ok(topic));
        assert_eq!(bus.publish(topic, b"still works"), Ok(0));
    }

    #[test]
    fn global_bus_reinitialises_after_shutdown() {
        let first = Bus::global();
        Bus::shutdown_global();
        let second = Bus::global();
        assert!(!Arc::ptr_eq(&first, &second));
        Bus::shutdown_global();
    }

    #[test]
    fn caps_advertise_shared_fanout() {
        let bus = Bus::new(BusConfig::default());
        let caps = bus.caps();
        assert!(caps.capabilities.contains(Capabilities::IMC_SHARED_FANOUT));
        assert_eq!(caps.inline_payload_max, INLINE_CAPACITY);
        assert_eq!(caps.max_queue_depth, 16_384 * 4);
    }
}
