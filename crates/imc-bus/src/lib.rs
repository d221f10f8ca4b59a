//! Process-local inter-module message bus.
//!
//! Independently loaded modules talk through one shared [`Bus`]: broadcast
//! topics with per-subscription priority queues and backpressure, RPC
//! endpoints whose calls drive ref-counted futures, and a consumer-side
//! [`Bus::pump`] that dispatches queued messages on a controller thread.
//!
//! The design in one paragraph: publishers resolve topic names to permanent
//! ids, materialise the payload into a single shared envelope, and enqueue it
//! onto every active subscription's lock-free priority queue. The pump drains
//! those queues with a weighted policy that keeps low-priority traffic moving
//! and invokes handlers with panics contained. RPC calls run synchronously on
//! the caller and hand back an already-terminal future; the future cells
//! themselves support blocking waits, completion callbacks, and cooperative
//! cancellation from any thread.

#![deny(unsafe_code)]

pub mod bus;
pub mod config;
pub mod future;
pub mod names;
pub mod priority;
pub mod ring;
pub mod rpc;
mod stats;
pub mod subscription;

pub use imc_common::{
    Capabilities, Envelope, EnvelopeHeader, Error, ExternalBuffer, MessageOptions, ModuleId,
    Payload, Priority, Result, RpcId, TopicId, INLINE_CAPACITY,
};

pub use self::bus::{Bus, BusCaps, TopicInfo};
pub use self::config::BusConfig;
pub use self::future::{FutureHandle, FutureResult, FutureState};
pub use self::priority::DEFAULT_LOW_SERVICE_INTERVAL;
pub use self::rpc::RpcHandlerFn;
pub use self::stats::BusStatsSnapshot;
pub use self::subscription::{
    Backpressure, FilterFn, SubscribeOptions, SubscriberFn, SubscriptionHandle,
    SubscriptionStatsSnapshot,
};
