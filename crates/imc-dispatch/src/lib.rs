//! Stable API dispatch layer.
//!
//! Modules never link against the runtime's internals; they resolve
//! everything through the [`ApiRegistry`], a process-wide table of
//! type-erased function pointers keyed by frozen 32-bit ids. Resolution is
//! three-tiered — per-thread cache, wait-free direct index, shared hash map —
//! and stays binary-compatible across host versions because ids, once
//! published, never change.
//!
//! The crate also carries the extension system (runtime-registered API
//! tables with version negotiation), the core-API bootstrap (dependency-
//! ordered registration of the runtime's own sets), and the plug-in
//! entrypoint contract.

#![deny(unsafe_code)]

pub mod bootstrap;
pub mod bus_api;
pub mod entrypoint;
pub mod ids;
pub mod registry;

pub use imc_common::{ApiId, ApiVersion, Capabilities, Error, LastError, Result};

pub use self::bootstrap::{bootstrap, bootstrap_core, CoreApiSet};
pub use self::entrypoint::{EntryArgs, ModEntrypoint, ModuleOp};
pub use self::registry::{ApiHandle, ApiKind, ApiMetadata, ApiRegistry, ThreadingModel};
