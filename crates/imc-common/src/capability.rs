//! Capability flags.
//!
//! Every registered API publishes a 64-bit capability mask; the dispatch
//! layer aggregates them process-wide so clients can probe for optional
//! features before using them. Bit bands are reserved per subsystem and,
//! like API ids, are frozen once published:
//!
//! - bits 0–15: messaging (IMC)
//! - bits 16–23: synchronization
//! - bits 24–31: extension system
//! - bits 32–47: resource / memory
//! - bits 48–55: profiling / diagnostics
//! - bits 56–63: configuration / logging

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

bitflags! {
    /// Runtime feature flags, aggregated across all registered APIs.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
    pub struct Capabilities: u64 {
        /// Basic publish/subscribe messaging.
        const IMC_BASIC = 1 << 0;
        /// Zero-copy external buffer payloads.
        const IMC_BUFFER = 1 << 1;
        /// RPC endpoints.
        const IMC_RPC = 1 << 2;
        /// Futures for asynchronous results.
        const IMC_FUTURE = 1 << 3;
        /// Id-based fast-path resolution.
        const IMC_ID_BASED = 1 << 4;
        /// Queued message dispatch via the pump.
        const IMC_DISPATCH = 1 << 5;
        /// Multi-subscriber publishes share one payload; external cleanups
        /// run when the last subscriber finishes, not per delivery.
        const IMC_SHARED_FANOUT = 1 << 6;
        /// Per-message priority bands with starvation mitigation.
        const IMC_PRIORITY = 1 << 7;

        /// Extension tables can be registered at runtime.
        const EXTENSION_BASIC = 1 << 24;
        /// Extension lookup honours version requirements.
        const EXTENSION_VERSIONED = 1 << 25;

        /// Delivery and drop statistics are collected.
        const STATISTICS = 1 << 49;
        /// Per-thread last-error records are maintained.
        const DIAGNOSTICS = 1 << 51;
        /// The capability query APIs themselves.
        const CAPABILITY_QUERY = 1 << 52;
    }
}

// Wire format is the raw 64-bit mask; unknown bits survive a round trip so
// newer peers can hand masks through older code.
impl Serialize for Capabilities {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.bits())
    }
}

impl<'de> Deserialize<'de> for Capabilities {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u64::deserialize(deserializer).map(Capabilities::from_bits_retain)
    }
}
