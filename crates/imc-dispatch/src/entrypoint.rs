//! Plug-in entrypoint contract.
//!
//! Every module exports a single entrypoint the host calls on attach and
//! detach. On attach the host hands over the module's own id and the three
//! resolvers; the module may cache anything it resolves through them —
//! cached handles stay valid until the host tears the registry down.

use imc_common::{ApiId, ModuleId, Result};

use crate::registry::{ApiHandle, ApiRegistry};

/// Operation the host is performing on the module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleOp {
    /// The module is being brought up.
    Attach,
    /// The module is being torn down.
    Detach,
}

/// Arguments of one entrypoint invocation.
#[derive(Debug, Clone, Copy)]
pub struct EntryArgs {
    /// The module's own id.
    pub module: ModuleId,
    /// Name-based resolver.
    pub get_proc: fn(&str) -> Option<ApiHandle>,
    /// Id-based fast-path resolver.
    pub get_proc_by_id: fn(ApiId) -> Option<ApiHandle>,
    /// Name → id lookup, for caching ids up front.
    pub get_api_id: fn(&str) -> Option<ApiId>,
}

/// The symbol every module exports.
pub type ModEntrypoint = fn(ModuleOp, &EntryArgs) -> Result<()>;

/// Builds the attach/detach arguments for `module`, with the resolvers bound
/// to the process-wide registry.
pub fn entry_args(module: ModuleId) -> EntryArgs {
    EntryArgs {
        module,
        get_proc: resolve_proc,
        get_proc_by_id: resolve_proc_by_id,
        get_api_id: resolve_api_id,
    }
}

fn resolve_proc(name: &str) -> Option<ApiHandle> {
    ApiRegistry::global().get(name)
}

fn resolve_proc_by_id(id: ApiId) -> Option<ApiHandle> {
    ApiRegistry::global().get_by_id_cached(id)
}

fn resolve_api_id(name: &str) -> Option<ApiId> {
    ApiRegistry::global().api_id_of(name)
}

/// Invokes a module entrypoint for `op`, logging failures.
pub fn invoke(entry: ModEntrypoint, op: ModuleOp, module: ModuleId) -> Result<()> {
    let args = entry_args(module);
    let result = entry(op, &args);
    if let Err(error) = &result {
        tracing::warn!(module = module.get(), ?op, %error, "module entrypoint failed");
    }
    result
}
