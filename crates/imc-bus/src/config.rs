//! Bus configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::priority::DEFAULT_LOW_SERVICE_INTERVAL;

/// Tunables of one bus instance.
///
/// All fields have working defaults; deserializing an empty document yields
/// the same configuration as [`BusConfig::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-band queue depth used when a subscription does not ask for one.
    pub default_queue_depth: usize,
    /// Hard cap on the per-band queue depth a subscription may request.
    pub max_queue_depth: usize,
    /// HIGH/URGENT drains between forced LOW services; 1 disables the
    /// priority weighting, large values delay LOW arbitrarily.
    pub low_service_interval: u64,
    /// How long a BLOCK-policy publisher sleeps between enqueue retries,
    /// microseconds.
    pub block_retry_interval_us: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_queue_depth: 256,
            max_queue_depth: 16_384,
            low_service_interval: DEFAULT_LOW_SERVICE_INTERVAL,
            block_retry_interval_us: 50,
        }
    }
}

impl BusConfig {
    /// Resolves a requested per-band depth: zero means the default, anything
    /// above the cap is clamped down to it.
    pub fn clamp_queue_depth(&self, requested: usize) -> usize {
        if requested == 0 {
            self.default_queue_depth
        } else {
            requested.min(self.max_queue_depth)
        }
    }

    /// Sleep interval of the BLOCK backpressure retry loop.
    pub fn block_retry_interval(&self) -> Duration {
        Duration::from_micros(self.block_retry_interval_us)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let parsed: BusConfig = serde_json::from_str("{}").expect("parse");
        assert_eq!(parsed, BusConfig::default());
    }

    #[test]
    fn partial_document_overrides_one_field() {
        let parsed: BusConfig =
            serde_json::from_str(r#"{"low_service_interval": 4}"#).expect("parse");
        assert_eq!(parsed.low_service_interval, 4);
        assert_eq!(parsed.default_queue_depth, 256);
    }

    #[test]
    fn depth_clamping() {
        let config = BusConfig::default();
        assert_eq!(config.clamp_queue_depth(0), 256);
        assert_eq!(config.clamp_queue_depth(64), 64);
        assert_eq!(config.clamp_queue_depth(1 << 20), 16_384);
    }
}
