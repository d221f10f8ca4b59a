//! The API registry.
//!
//! A process-wide table mapping stable 32-bit ids to type-erased API values
//! (function pointers or whole extension tables) plus their metadata. Three
//! lookup levels, fastest first:
//!
//! 1. a per-thread 16-entry cache, tagged with a global version counter and
//!    invalidated lazily after any unregistration;
//! 2. a direct-index array of atomic pointers for ids below
//!    [`MAX_DIRECT_ID`](crate::ids::MAX_DIRECT_ID) — one wait-free load;
//! 3. the id hash map under a shared lock for everything else.
//!
//! Entries are leaked on registration and never freed: published ids are
//! reserved forever, so an entry's address stays valid for any reader that
//! raced an unregistration. Unregistering unlinks the entry and bumps the
//! cache version; the memory itself is the price of the wait-free read path
//! and is bounded by the number of registrations ever made.

use std::any::Any;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use imc_common::{ApiId, ApiVersion, Capabilities, Error, Result};
use parking_lot::{Mutex, RwLock};

use crate::ids::{EXTENSION_ID_START, MAX_DIRECT_ID};

/// Entries a thread caches between version bumps.
const TLS_CACHE_SIZE: usize = 16;

/// Type-erased API value. Concrete function-pointer types for core entries,
/// extension table structs for plug-in APIs; retrieve with
/// [`ApiRegistry::get_as`].
pub type ApiHandle = Arc<dyn Any + Send + Sync>;

/// Classification of a registered API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ApiKind {
    /// Shipped with the runtime.
    #[default]
    Core,
    /// Registered through the extension system.
    Extension,
    /// Registered by a third-party module.
    ThirdParty,
}

/// Thread-safety contract of a registered API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ThreadingModel {
    /// Callable from any thread.
    #[default]
    Free,
    /// Callable only from the controller thread.
    Controller,
    /// Caller must serialise externally.
    Serialized,
}

/// Metadata of one registered API.
#[derive(Debug, Clone)]
pub struct ApiMetadata {
    /// Binding name, e.g. `imcPublish`.
    pub name: String,
    /// Frozen id.
    pub id: ApiId,
    /// Version the API was introduced at.
    pub version: ApiVersion,
    /// Capability bits this API provides.
    pub capabilities: Capabilities,
    /// Core / extension / third-party.
    pub kind: ApiKind,
    /// Thread-safety contract.
    pub threading: ThreadingModel,
    /// Providing module; `"core"` for runtime APIs.
    pub provider: String,
    /// Declared table size for extension tables; zero for plain entries.
    pub table_size: usize,
}

impl ApiMetadata {
    /// Metadata of a core runtime API.
    pub fn core(name: impl Into<String>, id: ApiId, capabilities: Capabilities) -> Self {
        Self {
            name: name.into(),
            id,
            version: imc_common::RUNTIME_API_VERSION,
            capabilities,
            kind: ApiKind::Core,
            threading: ThreadingModel::Free,
            provider: "core".to_owned(),
            table_size: 0,
        }
    }
}

struct Entry {
    meta: ApiMetadata,
    handle: ApiHandle,
    calls: AtomicU64,
}

struct Inner {
    by_id: HashMap<ApiId, &'static Entry>,
    by_name: HashMap<String, ApiId>,
}

/// Id → function-pointer registry with a wait-free fast path.
pub struct ApiRegistry {
    /// Distinguishes instances in the thread-local caches.
    registry_id: u64,
    inner: RwLock<Inner>,
    direct: Box<[AtomicPtr<Entry>]>,
    /// Bumped on every unregistration; readers compare and invalidate.
    cache_version: AtomicU64,
    next_extension_id: AtomicU32,
    total_capabilities: AtomicU64,
}

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);
static GLOBAL_REGISTRY: Mutex<Option<Arc<ApiRegistry>>> = Mutex::new(None);

#[derive(Clone, Copy)]
struct CacheEntry {
    id: ApiId,
    entry: &'static Entry,
}

struct TlsCache {
    registry_id: u64,
    version: u64,
    next: usize,
    entries: [Option<CacheEntry>; TLS_CACHE_SIZE],
}

thread_local! {
    static TLS_CACHE: RefCell<TlsCache> = const {
        RefCell::new(TlsCache {
            registry_id: 0,
            version: 0,
            next: 0,
            entries: [None; TLS_CACHE_SIZE],
        })
    };
}

impl ApiRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            registry_id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            inner: RwLock::new(Inner {
                by_id: HashMap::new(),
                by_name: HashMap::new(),
            }),
            direct: (0..MAX_DIRECT_ID)
                .map(|_| AtomicPtr::new(std::ptr::null_mut()))
                .collect(),
            cache_version: AtomicU64::new(0),
            next_extension_id: AtomicU32::new(EXTENSION_ID_START),
            total_capabilities: AtomicU64::new(0),
        }
    }

    /// The process-wide registry, created lazily on first use.
    pub fn global() -> Arc<ApiRegistry> {
        let mut slot = GLOBAL_REGISTRY.lock();
        slot.get_or_insert_with(|| Arc::new(ApiRegistry::new())).clone()
    }

    /// Clears and forgets the process-wide registry; the next
    /// [`ApiRegistry::global`] call re-initialises it.
    pub fn shutdown_global() {
        let registry = GLOBAL_REGISTRY.lock().take();
        if let Some(registry) = registry {
            registry.clear();
        }
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Registers `handle` under `metadata`.
    ///
    /// Duplicate ids or names fail silently (logged): the first registration
    /// stands. Returns whether this call installed the entry.
    pub fn register(&self, metadata: ApiMetadata, handle: ApiHandle) -> bool {
        if metadata.name.is_empty() {
            tracing::warn!("rejecting api registration with empty name");
            return false;
        }

        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&metadata.id) || inner.by_name.contains_key(&metadata.name) {
            tracing::warn!(
                api = %metadata.name,
                id = metadata.id.get(),
                "duplicate api registration ignored; first registration stands"
            );
            return false;
        }

        let capabilities = metadata.capabilities;
        let id = metadata.id;
        // Leaked on purpose: published ids are reserved forever, and a live
        // reader of the direct table must never observe a freed entry.
        let entry: &'static Entry = Box::leak(Box::new(Entry {
            meta: metadata,
            handle,
            calls: AtomicU64::new(0),
        }));
        inner.by_name.insert(entry.meta.name.clone(), id);
        inner.by_id.insert(id, entry);
        if id.get() < MAX_DIRECT_ID {
            self.direct[id.get() as usize]
                .store(entry as *const Entry as *mut Entry, Ordering::Release);
        }
        self.total_capabilities
            .fetch_or(capabilities.bits(), Ordering::Relaxed);
        true
    }

    /// Unlinks the entry registered under `name` and invalidates every
    /// thread's cache. The id stays reserved.
    pub fn unregister(&self, name: &str) -> bool {
        let mut inner = self.inner.write();
        let Some(id) = inner.by_name.remove(name) else {
            return false;
        };
        inner.by_id.remove(&id);
        if id.get() < MAX_DIRECT_ID {
            self.direct[id.get() as usize].store(std::ptr::null_mut(), Ordering::Release);
        }

        let remaining = inner
            .by_id
            .values()
            .fold(Capabilities::empty(), |acc, e| acc | e.meta.capabilities);
        self.total_capabilities
            .store(remaining.bits(), Ordering::Relaxed);

        self.cache_version.fetch_add(1, Ordering::Release);
        true
    }

    /// Unlinks every entry. Shutdown path; ids stay reserved, extension id
    /// allocation restarts.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.by_id.clear();
        inner.by_name.clear();
        for slot in self.direct.iter() {
            slot.store(std::ptr::null_mut(), Ordering::Release);
        }
        self.next_extension_id
            .store(EXTENSION_ID_START, Ordering::Relaxed);
        self.total_capabilities.store(0, Ordering::Relaxed);
        self.cache_version.fetch_add(1, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    #[allow(unsafe_code)]
    fn entry_by_id(&self, id: ApiId) -> Option<&'static Entry> {
        let raw = id.get();
        if raw < MAX_DIRECT_ID {
            let ptr = self.direct[raw as usize].load(Ordering::Acquire);
            if ptr.is_null() {
                None
            } else {
                // SAFETY: the pointer was created from a Box::leak'ed entry
                // that is never freed (see `register`); a concurrent
                // unregistration only nulls the slot.
                Some(unsafe { &*ptr })
            }
        } else {
            self.inner.read().by_id.get(&id).copied()
        }
    }

    fn counted(entry: &'static Entry) -> ApiHandle {
        entry.calls.fetch_add(1, Ordering::Relaxed);
        entry.handle.clone()
    }

    /// Looks up by name, counting the call.
    pub fn get(&self, name: &str) -> Option<ApiHandle> {
        let id = self.api_id_of(name)?;
        self.entry_by_id(id).map(Self::counted)
    }

    /// Looks up by id, counting the call.
    pub fn get_by_id(&self, id: ApiId) -> Option<ApiHandle> {
        self.entry_by_id(id).map(Self::counted)
    }

    /// Looks up by id without touching the call counter.
    pub fn get_by_id_uncounted(&self, id: ApiId) -> Option<ApiHandle> {
        self.entry_by_id(id).map(|e| e.handle.clone())
    }

    /// Looks up by id through the calling thread's cache.
    ///
    /// A hit costs one atomic load (the version check); misses and
    /// version-invalidated caches fall through to the shared tables and
    /// install the result round-robin.
    pub fn get_by_id_cached(&self, id: ApiId) -> Option<ApiHandle> {
        TLS_CACHE.with(|cell| {
            let mut cache = cell.borrow_mut();
            let version = self.cache_version.load(Ordering::Acquire);
            if cache.registry_id != self.registry_id || cache.version != version {
                cache.entries = [None; TLS_CACHE_SIZE];
                cache.registry_id = self.registry_id;
                cache.version = version;
                cache.next = 0;
            }

            let hit = cache.entries.iter().flatten().find(|e| e.id == id).copied();
            if let Some(hit) = hit {
                return Some(Self::counted(hit.entry));
            }

            let entry = self.entry_by_id(id)?;
            let slot = cache.next;
            cache.entries[slot] = Some(CacheEntry { id, entry });
            cache.next = (slot + 1) % TLS_CACHE_SIZE;
            Some(Self::counted(entry))
        })
    }

    /// Typed lookup: resolves `id` and downcasts to `T`.
    pub fn get_as<T: Any + Send + Sync>(&self, id: ApiId) -> Option<Arc<T>> {
        self.get_by_id(id).and_then(|handle| handle.downcast::<T>().ok())
    }

    /// Resolves a binding name to its id.
    pub fn api_id_of(&self, name: &str) -> Option<ApiId> {
        self.inner.read().by_name.get(name).copied()
    }

    /// Metadata of a registered API.
    pub fn query(&self, id: ApiId) -> Option<ApiMetadata> {
        self.entry_by_id(id).map(|e| e.meta.clone())
    }

    /// Times the entry was resolved through a counted lookup.
    pub fn call_count(&self, name: &str) -> u64 {
        self.api_id_of(name)
            .and_then(|id| self.entry_by_id(id))
            .map(|e| e.calls.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Number of registered APIs.
    pub fn api_count(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Number of registered extension tables.
    pub fn extension_count(&self) -> usize {
        self.inner
            .read()
            .by_id
            .values()
            .filter(|e| e.meta.kind == ApiKind::Extension)
            .count()
    }

    // ------------------------------------------------------------------
    // Capabilities
    // ------------------------------------------------------------------

    /// Union of the capability bits of every registered API.
    pub fn total_capabilities(&self) -> Capabilities {
        Capabilities::from_bits_retain(self.total_capabilities.load(Ordering::Relaxed))
    }

    /// Whether every bit of `required` is provided by some registered API.
    pub fn has_capability(&self, required: Capabilities) -> bool {
        self.total_capabilities().contains(required)
    }

    // ------------------------------------------------------------------
    // Extensions
    // ------------------------------------------------------------------

    /// Registers a plug-in API table and allocates its id (50 000+).
    pub fn register_extension(
        &self,
        name: &str,
        version: ApiVersion,
        table: ApiHandle,
        table_size: usize,
        provider: &str,
    ) -> Result<ApiId> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("extension name must not be empty"));
        }
        if table_size == 0 {
            return Err(Error::InvalidSize {
                expected: 1,
                actual: 0,
            });
        }
        if self.api_id_of(name).is_some() {
            return Err(Error::AlreadyExists);
        }

        let raw = self.next_extension_id.fetch_add(1, Ordering::Relaxed);
        let id = ApiId::new(raw).ok_or(Error::InvalidState("extension id space exhausted"))?;
        let metadata = ApiMetadata {
            name: name.to_owned(),
            id,
            version,
            capabilities: Capabilities::EXTENSION_BASIC,
            kind: ApiKind::Extension,
            threading: ThreadingModel::Free,
            provider: provider.to_owned(),
            table_size,
        };
        if self.register(metadata, table) {
            Ok(id)
        } else {
            Err(Error::AlreadyExists)
        }
    }

    /// Looks up an extension table, enforcing the version contract: the
    /// major version must match exactly and the minor version must be at
    /// least `required.minor`.
    pub fn load_extension(
        &self,
        name: &str,
        required: ApiVersion,
    ) -> Result<(ApiHandle, ApiVersion)> {
        let id = self.api_id_of(name).ok_or(Error::NotFound)?;
        let entry = self.entry_by_id(id).ok_or(Error::NotFound)?;
        if entry.meta.kind != ApiKind::Extension {
            return Err(Error::NotSupported);
        }
        if !entry.meta.version.is_compatible_with(required) {
            return Err(Error::VersionMismatch {
                required_major: u32::from(required.major),
                required_minor: u32::from(required.minor),
                actual_major: u32::from(entry.meta.version.major),
                actual_minor: u32::from(entry.meta.version.minor),
            });
        }
        Ok((entry.handle.clone(), entry.meta.version))
    }
}

impl Default for ApiRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRegistry")
            .field("apis", &self.api_count())
            .field("extensions", &self.extension_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids;

    type ProbeFn = fn() -> u32;

    fn forty_two() -> u32 {
        42
    }

    fn seven() -> u32 {
        7
    }

    fn register_probe(registry: &ApiRegistry, name: &str, id: ApiId, f: ProbeFn) -> bool {
        registry.register(
            ApiMetadata::core(name, id, Capabilities::CAPABILITY_QUERY),
            Arc::new(f),
        )
    }

    #[test]
    fn typed_round_trip() {
        let registry = ApiRegistry::new();
        assert!(register_probe(&registry, "probe", ids::HAS_CAPABILITY, forty_two));

        let f = registry.get_as::<ProbeFn>(ids::HAS_CAPABILITY).expect("typed");
        assert_eq!(f(), 42);
        assert_eq!(registry.api_id_of("probe"), Some(ids::HAS_CAPABILITY));
        assert_eq!(registry.call_count("probe"), 1);
    }

    #[test]
    fn duplicate_registration_first_wins() {
        let registry = ApiRegistry::new();
        assert!(register_probe(&registry, "dup", ids::HAS_CAPABILITY, forty_two));
        assert!(!register_probe(&registry, "dup", ids::GET_TOTAL_CAPABILITIES, seven));
        assert!(!register_probe(&registry, "other", ids::HAS_CAPABILITY, seven));

        let f = registry.get_as::<ProbeFn>(ids::HAS_CAPABILITY).expect("entry");
        assert_eq!(f(), 42);
        assert_eq!(registry.api_count(), 1);
    }

    #[test]
    fn direct_and_map_paths_agree() {
        let registry = ApiRegistry::new();
        let low = ids::IMC_PUBLISH;
        let high = ApiId::new(60_000).expect("non-zero");
        assert!(register_probe(&registry, "low", low, forty_two));
        assert!(registry.register(
            ApiMetadata::core("high", high, Capabilities::empty()),
            Arc::new(seven as ProbeFn),
        ));

        assert!(registry.get_by_id(low).is_some());
        assert!(registry.get_by_id(high).is_some());
        assert!(registry.get_by_id(ApiId::new(123).expect("non-zero")).is_none());
    }

    #[test]
    fn unregister_reserves_the_id_for_reuse() {
        let registry = ApiRegistry::new();
        assert!(register_probe(&registry, "stable", ids::IMC_PUBLISH, forty_two));
        assert!(registry.unregister("stable"));
        assert!(registry.get_by_id(ids::IMC_PUBLISH).is_none());
        assert!(!registry.unregister("stable"));

        // Re-registration reuses the frozen id.
        assert!(register_probe(&registry, "stable", ids::IMC_PUBLISH, seven));
        assert_eq!(registry.api_id_of("stable"), Some(ids::IMC_PUBLISH));
    }

    #[test]
    fn cached_lookup_never_returns_a_stale_pointer() {
        let registry = ApiRegistry::new();
        assert!(register_probe(&registry, "hot", ids::IMC_PUBLISH, forty_two));

        // Warm this thread's cache.
        let first = registry
            .get_by_id_cached(ids::IMC_PUBLISH)
            .and_then(|h| h.downcast::<ProbeFn>().ok())
            .expect("warm");
        assert_eq!(first(), 42);

        assert!(registry.unregister("hot"));
        assert!(registry.get_by_id_cached(ids::IMC_PUBLISH).is_none());

        // After re-registration the cache must serve the new pointer.
        assert!(register_probe(&registry, "hot", ids::IMC_PUBLISH, seven));
        let second = registry
            .get_by_id_cached(ids::IMC_PUBLISH)
            .and_then(|h| h.downcast::<ProbeFn>().ok())
            .expect("fresh");
        assert_eq!(second(), 7);
    }

    #[test]
    fn cached_lookup_invalidates_across_threads() {
        let registry = Arc::new(ApiRegistry::new());
        assert!(register_probe(&registry, "shared", ids::IMC_PUBLISH, forty_two));

        let warm = registry.clone();
        std::thread::spawn(move || {
            assert!(warm.get_by_id_cached(ids::IMC_PUBLISH).is_some());
        })
        .join()
        .expect("warm thread");

        assert!(registry.unregister("shared"));

        let check = registry.clone();
        std::thread::spawn(move || {
            assert!(check.get_by_id_cached(ids::IMC_PUBLISH).is_none());
        })
        .join()
        .expect("check thread");
    }

    #[test]
    fn cache_evicts_round_robin_beyond_capacity() {
        let registry = ApiRegistry::new();
        let ids: Vec<ApiId> = (100..100 + TLS_CACHE_SIZE as u32 + 4)
            .map(|raw| ApiId::new(raw).expect("non-zero"))
            .collect();
        for (i, id) in ids.iter().enumerate() {
            assert!(register_probe(&registry, &format!("api{i}"), *id, forty_two));
        }
        // More distinct ids than slots: every lookup still resolves.
        for _ in 0..3 {
            for id in &ids {
                assert!(registry.get_by_id_cached(*id).is_some());
            }
        }
    }

    #[test]
    fn capabilities_aggregate_and_recompute() {
        let registry = ApiRegistry::new();
        registry.register(
            ApiMetadata::core("a", ids::IMC_PUBLISH, Capabilities::IMC_BASIC),
            Arc::new(forty_two as ProbeFn),
        );
        registry.register(
            ApiMetadata::core("b", ids::IMC_CALL_RPC, Capabilities::IMC_RPC),
            Arc::new(seven as ProbeFn),
        );
        assert!(registry.has_capability(Capabilities::IMC_BASIC | Capabilities::IMC_RPC));

        registry.unregister("b");
        assert!(registry.has_capability(Capabilities::IMC_BASIC));
        assert!(!registry.has_capability(Capabilities::IMC_RPC));
    }

    #[test]
    fn extension_registration_and_versioning() {
        #[derive(Debug, PartialEq)]
        struct RenderApiV2 {
            magic: u32,
        }

        let registry = ApiRegistry::new();
        let id = registry
            .register_extension(
                "render",
                ApiVersion::new(2, 3, 0),
                Arc::new(RenderApiV2 { magic: 0xBEEF }),
                std::mem::size_of::<RenderApiV2>(),
                "mod.render",
            )
            .expect("register");
        assert!(id.get() >= EXTENSION_ID_START);
        assert_eq!(registry.extension_count(), 1);

        let (table, version) = registry
            .load_extension("render", ApiVersion::new(2, 1, 0))
            .expect("compatible");
        assert_eq!(version, ApiVersion::new(2, 3, 0));
        assert_eq!(
            table.downcast::<RenderApiV2>().expect("type").magic,
            0xBEEF
        );

        assert!(matches!(
            registry.load_extension("render", ApiVersion::new(3, 0, 0)),
            Err(Error::VersionMismatch { .. })
        ));
        assert!(matches!(
            registry.load_extension("render", ApiVersion::new(2, 4, 0)),
            Err(Error::VersionMismatch { .. })
        ));
        assert_eq!(
            registry.load_extension("absent", ApiVersion::new(1, 0, 0)).err(),
            Some(Error::NotFound)
        );

        assert_eq!(
            registry
                .register_extension(
                    "render",
                    ApiVersion::new(2, 0, 0),
                    Arc::new(RenderApiV2 { magic: 0 }),
                    4,
                    "mod.render"
                )
                .err(),
            Some(Error::AlreadyExists)
        );
        assert_eq!(
            registry
                .register_extension("sized", ApiVersion::new(1, 0, 0), Arc::new(()), 0, "m")
                .err(),
            Some(Error::InvalidSize { expected: 1, actual: 0 })
        );
    }

    #[test]
    fn extension_ids_are_monotonic() {
        let registry = ApiRegistry::new();
        let a = registry
            .register_extension("ext.a", ApiVersion::new(1, 0, 0), Arc::new(1u32), 4, "m")
            .expect("a");
        let b = registry
            .register_extension("ext.b", ApiVersion::new(1, 0, 0), Arc::new(2u32), 4, "m")
            .expect("b");
        assert_eq!(b.get(), a.get() + 1);
    }

    #[test]
    fn clear_resets_everything_but_keeps_working() {
        let registry = ApiRegistry::new();
        register_probe(&registry, "x", ids::IMC_PUBLISH, forty_two);
        registry
            .register_extension("ext", ApiVersion::new(1, 0, 0), Arc::new(0u8), 1, "m")
            .expect("ext");
        registry.clear();

        assert_eq!(registry.api_count(), 0);
        assert!(registry.get_by_id_cached(ids::IMC_PUBLISH).is_none());
        assert_eq!(registry.total_capabilities(), Capabilities::empty());

        // Extension allocation restarts from the base of the range.
        let id = registry
            .register_extension("ext", ApiVersion::new(1, 0, 0), Arc::new(0u8), 1, "m")
            .expect("ext again");
        assert_eq!(id.get(), EXTENSION_ID_START);
    }
}
