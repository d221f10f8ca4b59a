//! Name registries.
//!
//! Stable string→id mapping for topics and RPC endpoints, with reverse
//! lookup and a per-id publish counter. Ids are derived from the UTF-8 name
//! with an xxHash-flavoured fold so the same name maps to the same id in
//! every process; hash collisions are resolved by re-mixing the id until an
//! unused value is found. Entries are created on first lookup and never
//! removed. The topic and RPC registries are separate instances and do not
//! share id space.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use imc_common::{Error, Result, RpcId, TopicId};
use parking_lot::RwLock;

const PRIME1: u32 = 0x9E37_79B1;
const PRIME3: u32 = 0xC2B2_AE3D;
const SEED: u32 = 0x1656_67B1;

/// Final avalanche step; also the re-mix applied on collisions.
fn mix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85EB_CA6B);
    h ^= h >> 13;
    h = h.wrapping_mul(0xC2B2_AE35);
    h ^= h >> 16;
    h
}

/// Derives the initial id candidate for `name`. Never returns zero.
fn derive_id(name: &str) -> u32 {
    let bytes = name.as_bytes();
    let mut hash = SEED;
    for &b in bytes {
        hash = hash.wrapping_add(u32::from(b).wrapping_mul(PRIME3));
        hash = hash.rotate_left(17).wrapping_mul(PRIME1);
    }
    hash ^= bytes.len() as u32;
    hash = mix(hash);
    if hash == 0 {
        1
    } else {
        hash
    }
}

/// Id types a [`NameRegistry`] can hand out.
pub trait RegistryId: Copy + Eq + Hash {
    /// Wraps a raw non-zero id.
    fn from_raw(raw: u32) -> Option<Self>;
    /// Unwraps to the raw id.
    fn raw(self) -> u32;
}

impl RegistryId for TopicId {
    fn from_raw(raw: u32) -> Option<Self> {
        TopicId::new(raw)
    }
    fn raw(self) -> u32 {
        self.get()
    }
}

impl RegistryId for RpcId {
    fn from_raw(raw: u32) -> Option<Self> {
        RpcId::new(raw)
    }
    fn raw(self) -> u32 {
        self.get()
    }
}

#[derive(Debug, Default)]
struct Inner<I> {
    name_to_id: HashMap<String, I>,
    id_to_name: HashMap<I, String>,
    counters: HashMap<I, Arc<AtomicU64>>,
}

/// Bidirectional name↔id registry with per-id message counters.
#[derive(Debug)]
pub struct NameRegistry<I> {
    inner: RwLock<Inner<I>>,
}

impl<I: RegistryId> NameRegistry<I> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                name_to_id: HashMap::new(),
                id_to_name: HashMap::new(),
                counters: HashMap::new(),
            }),
        }
    }

    /// Returns the id of `name`, allocating one on first use.
    ///
    /// Idempotent: identical names always yield the same id. Empty names are
    /// rejected.
    pub fn get_or_create(&self, name: &str) -> Result<I> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("name must not be empty"));
        }

        if let Some(id) = self.inner.read().name_to_id.get(name) {
            return Ok(*id);
        }

        let mut inner = self.inner.write();
        // Another thread may have allocated between the two locks.
        if let Some(id) = inner.name_to_id.get(name) {
            return Ok(*id);
        }

        let mut raw = derive_id(name);
        let id = loop {
            match I::from_raw(raw) {
                Some(id) if !inner.id_to_name.contains_key(&id) => break id,
                // Occupied or the reserved zero: re-mix until free.
                _ => {
                    raw = mix(raw);
                    if raw == 0 {
                        raw = 1;
                    }
                }
            }
        };

        inner.name_to_id.insert(name.to_owned(), id);
        inner.id_to_name.insert(id, name.to_owned());
        inner.counters.insert(id, Arc::new(AtomicU64::new(0)));
        Ok(id)
    }

    /// Looks up an already-allocated id without creating one.
    pub fn lookup(&self, name: &str) -> Option<I> {
        self.inner.read().name_to_id.get(name).copied()
    }

    /// Reverse lookup.
    pub fn name_of(&self, id: I) -> Option<String> {
        self.inner.read().id_to_name.get(&id).cloned()
    }

    /// Bumps the message counter of `id`. Unknown ids are ignored.
    pub fn increment_count(&self, id: I) {
        if let Some(counter) = self.inner.read().counters.get(&id) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Message counter of `id`; zero when unknown.
    pub fn count(&self, id: I) -> u64 {
        self.inner
            .read()
            .counters
            .get(&id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Whether `id` has been allocated.
    pub fn contains(&self, id: I) -> bool {
        self.inner.read().id_to_name.contains_key(&id)
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.inner.read().id_to_name.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<I: RegistryId> Default for NameRegistry<I> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_same_id() {
        let registry = NameRegistry::<TopicId>::new();
        let a = registry.get_or_create("bench.pubsub").expect("id");
        let b = registry.get_or_create("bench.pubsub").expect("id");
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn distinct_names_distinct_ids() {
        let registry = NameRegistry::<TopicId>::new();
        let mut seen = std::collections::HashSet::new();
        for i in 0..2000 {
            let id = registry.get_or_create(&format!("topic.{i}")).expect("id");
            assert!(seen.insert(id), "id collision for topic.{i}");
        }
        assert_eq!(registry.len(), 2000);
    }

    #[test]
    fn empty_name_is_invalid() {
        let registry = NameRegistry::<RpcId>::new();
        assert_eq!(
            registry.get_or_create(""),
            Err(Error::InvalidArgument("name must not be empty"))
        );
    }

    #[test]
    fn derivation_is_deterministic() {
        // Two independent registries agree on the id of a name.
        let a = NameRegistry::<TopicId>::new();
        let b = NameRegistry::<TopicId>::new();
        assert_eq!(
            a.get_or_create("game.tick").expect("id"),
            b.get_or_create("game.tick").expect("id"),
        );
    }

    #[test]
    fn reverse_lookup_and_counters() {
        let registry = NameRegistry::<TopicId>::new();
        let id = registry.get_or_create("svc.events").expect("id");
        assert_eq!(registry.name_of(id).as_deref(), Some("svc.events"));
        assert_eq!(registry.count(id), 0);
        registry.increment_count(id);
        registry.increment_count(id);
        assert_eq!(registry.count(id), 2);

        let unknown = TopicId::new(0xDEAD_BEEF).expect("non-zero");
        assert!(registry.name_of(unknown).is_none());
        registry.increment_count(unknown);
        assert_eq!(registry.count(unknown), 0);
    }

    #[test]
    fn lookup_does_not_allocate() {
        let registry = NameRegistry::<TopicId>::new();
        assert!(registry.lookup("not.yet").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn concurrent_get_or_create_agrees() {
        let registry = std::sync::Arc::new(NameRegistry::<TopicId>::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .map(|i| registry.get_or_create(&format!("t.{i}")).expect("id"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread"))
            .collect();
        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
        assert_eq!(registry.len(), 100);
    }
}
