//! Core-API bootstrap.
//!
//! The runtime's API sets are declared statically and registered in
//! dependency order: each set names the feature bits it provides and the
//! bits it depends on, and the bootstrap schedules a set only once
//! everything it depends on is available. A cycle aborts the bootstrap.

use imc_common::{Error, Result};

use crate::bus_api;
use crate::registry::ApiRegistry;

/// Feature bits used to order the core API sets.
pub mod provides {
    /// Lifecycle, resolution, and error APIs.
    pub const LIFECYCLE: u32 = 1 << 0;
    /// Capability query APIs.
    pub const CAPABILITY: u32 = 1 << 1;
    /// Messaging APIs.
    pub const IMC: u32 = 1 << 2;
}

/// One statically-declared API set.
#[derive(Debug, Clone, Copy)]
pub struct CoreApiSet {
    /// Set name, for diagnostics.
    pub name: &'static str,
    /// Registers the set's entries.
    pub register: fn(&ApiRegistry),
    /// Feature bits available once this set is registered.
    pub provides: u32,
    /// Feature bits that must be available first.
    pub depends: u32,
}

/// The runtime's core API sets. Declaration order is not significant; the
/// bootstrap orders by dependency.
pub fn core_api_sets() -> [CoreApiSet; 3] {
    [
        CoreApiSet {
            name: "imc",
            register: bus_api::register_imc_apis,
            provides: provides::IMC,
            depends: provides::LIFECYCLE,
        },
        CoreApiSet {
            name: "lifecycle",
            register: bus_api::register_lifecycle_apis,
            provides: provides::LIFECYCLE,
            depends: 0,
        },
        CoreApiSet {
            name: "capability",
            register: bus_api::register_capability_apis,
            provides: provides::CAPABILITY,
            depends: provides::LIFECYCLE,
        },
    ]
}

/// Registers `sets` in dependency order. Returns the order used, or an error
/// naming the sets stuck in a dependency cycle.
pub fn bootstrap(registry: &ApiRegistry, sets: &[CoreApiSet]) -> Result<Vec<&'static str>> {
    let mut order = Vec::with_capacity(sets.len());
    let mut scheduled = vec![false; sets.len()];
    let mut available: u32 = 0;

    while order.len() < sets.len() {
        let mut progressed = false;
        for (i, set) in sets.iter().enumerate() {
            if scheduled[i] || set.depends & !available != 0 {
                continue;
            }
            (set.register)(registry);
            available |= set.provides;
            scheduled[i] = true;
            order.push(set.name);
            progressed = true;
        }
        if !progressed {
            let stuck: Vec<&str> = sets
                .iter()
                .enumerate()
                .filter(|(i, _)| !scheduled[*i])
                .map(|(_, s)| s.name)
                .collect();
            tracing::error!(
                stuck = stuck.join(", "),
                "core api bootstrap aborted: dependency cycle"
            );
            return Err(Error::InvalidState("core api bootstrap dependency cycle"));
        }
    }
    Ok(order)
}

/// Bootstraps the runtime's own API sets into `registry`.
pub fn bootstrap_core(registry: &ApiRegistry) -> Result<Vec<&'static str>> {
    bootstrap(registry, &core_api_sets())
}
