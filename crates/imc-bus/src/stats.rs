//! Bus-wide statistics.
//!
//! Plain relaxed counters: they inform diagnostics, never semantics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counter block owned by the bus.
#[derive(Debug, Default)]
pub(crate) struct BusStats {
    pub published: AtomicU64,
    pub delivered: AtomicU64,
    pub dropped: AtomicU64,
    pub rpc_calls: AtomicU64,
    pub rpc_failures: AtomicU64,
    pub futures_created: AtomicU64,
    pub futures_completed: AtomicU64,
    pub futures_cancelled: AtomicU64,
    pub handler_panics: AtomicU64,
}

impl BusStats {
    pub fn snapshot(&self) -> BusStatsSnapshot {
        BusStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rpc_calls: self.rpc_calls.load(Ordering::Relaxed),
            rpc_failures: self.rpc_failures.load(Ordering::Relaxed),
            futures_created: self.futures_created.load(Ordering::Relaxed),
            futures_completed: self.futures_completed.load(Ordering::Relaxed),
            futures_cancelled: self.futures_cancelled.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.published.store(0, Ordering::Relaxed);
        self.delivered.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.rpc_calls.store(0, Ordering::Relaxed);
        self.rpc_failures.store(0, Ordering::Relaxed);
        self.futures_created.store(0, Ordering::Relaxed);
        self.futures_completed.store(0, Ordering::Relaxed);
        self.futures_cancelled.store(0, Ordering::Relaxed);
        self.handler_panics.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of the bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStatsSnapshot {
    /// Publish calls that returned success.
    pub published: u64,
    /// Envelopes enqueued to a subscription.
    pub delivered: u64,
    /// Envelopes rejected by backpressure.
    pub dropped: u64,
    /// RPC invocations attempted against a registered handler.
    pub rpc_calls: u64,
    /// RPC invocations whose handler returned an error or panicked.
    pub rpc_failures: u64,
    /// Futures created.
    pub futures_created: u64,
    /// Futures that reached READY or FAILED.
    pub futures_completed: u64,
    /// Futures that were cancelled.
    pub futures_cancelled: u64,
    /// Handler panics contained by the dispatch boundary.
    pub handler_panics: u64,
}
