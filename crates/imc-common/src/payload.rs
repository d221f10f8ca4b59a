//! Message payload storage.
//!
//! A [`Payload`] owns the bytes of one message in one of three forms: a
//! fixed in-object buffer for small copies, an owned heap allocation, or a
//! caller-provided external buffer carrying a cleanup obligation. The type is
//! move-only — there is exactly one owner at any instant, and external
//! cleanups run exactly once, from the drop glue of that single owner.

use std::fmt;

/// Payloads up to this many bytes are stored in place, without a heap
/// allocation.
pub const INLINE_CAPACITY: usize = 256;

/// Cleanup callback of an external buffer. Receives the buffer contents it is
/// releasing.
pub type CleanupFn = Box<dyn FnOnce(&[u8]) + Send + Sync>;

/// A caller-owned buffer lent to the bus.
///
/// With a cleanup attached the bus takes ownership of invoking it exactly
/// once when the payload is dropped; without one the bus copies the bytes and
/// the descriptor is inert.
pub struct ExternalBuffer {
    data: Box<dyn AsRef<[u8]> + Send + Sync>,
    cleanup: Option<CleanupFn>,
}

impl ExternalBuffer {
    /// Wraps `data` together with the cleanup the bus must run when the
    /// payload is dropped.
    pub fn with_cleanup(
        data: impl AsRef<[u8]> + Send + Sync + 'static,
        cleanup: impl FnOnce(&[u8]) + Send + Sync + 'static,
    ) -> Self {
        Self {
            data: Box::new(data),
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Wraps `data` with no cleanup. The bus copies such buffers instead of
    /// taking ownership.
    pub fn borrowed(data: impl AsRef<[u8]> + Send + Sync + 'static) -> Self {
        Self {
            data: Box::new(data),
            cleanup: None,
        }
    }

    /// Whether a cleanup obligation is attached.
    pub fn has_cleanup(&self) -> bool {
        self.cleanup.is_some()
    }

    /// The buffer contents.
    pub fn as_slice(&self) -> &[u8] {
        (*self.data).as_ref()
    }
}

impl fmt::Debug for ExternalBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalBuffer")
            .field("len", &self.as_slice().len())
            .field("has_cleanup", &self.has_cleanup())
            .finish()
    }
}

impl Drop for ExternalBuffer {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup((*self.data).as_ref());
        }
    }
}

/// Owned bytes of one message.
// The inline variant is deliberately as large as INLINE_CAPACITY: keeping
// small payloads in place is the point of the variant.
#[allow(clippy::large_enum_variant)]
#[derive(Debug)]
pub enum Payload {
    /// No bytes.
    Empty,
    /// Small copy held in place.
    Inline {
        /// Number of valid bytes in `bytes`.
        len: usize,
        /// Fixed in-object buffer; only `bytes[..len]` is meaningful.
        bytes: [u8; INLINE_CAPACITY],
    },
    /// Owned heap allocation, released on drop.
    Heap(Box<[u8]>),
    /// External buffer whose cleanup the payload now owns.
    External(ExternalBuffer),
}

impl Payload {
    /// The empty payload.
    pub const fn empty() -> Self {
        Payload::Empty
    }

    /// Copies `data`, inline when it fits and onto the heap otherwise.
    pub fn copy_from(data: &[u8]) -> Self {
        if data.is_empty() {
            return Payload::Empty;
        }
        if data.len() <= INLINE_CAPACITY {
            let mut bytes = [0u8; INLINE_CAPACITY];
            bytes[..data.len()].copy_from_slice(data);
            Payload::Inline {
                len: data.len(),
                bytes,
            }
        } else {
            Payload::Heap(data.to_vec().into_boxed_slice())
        }
    }

    /// Takes ownership of an already-allocated buffer without copying.
    pub fn from_vec(data: Vec<u8>) -> Self {
        if data.is_empty() {
            Payload::Empty
        } else {
            Payload::Heap(data.into_boxed_slice())
        }
    }

    /// Materialises a buffer descriptor: buffers with a cleanup are adopted
    /// zero-copy, buffers without one are copied.
    pub fn from_buffer(buffer: ExternalBuffer) -> Self {
        if buffer.as_slice().is_empty() {
            return Payload::Empty;
        }
        if buffer.has_cleanup() {
            Payload::External(buffer)
        } else {
            Payload::copy_from(buffer.as_slice())
        }
    }

    /// The payload bytes.
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Empty => &[],
            Payload::Inline { len, bytes } => &bytes[..*len],
            Payload::Heap(data) => data,
            Payload::External(buffer) => buffer.as_slice(),
        }
    }

    /// Number of payload bytes.
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    /// Whether the payload has no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::Empty
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn small_copies_stay_inline() {
        let payload = Payload::copy_from(b"hello");
        assert!(matches!(payload, Payload::Inline { len: 5, .. }));
        assert_eq!(payload.as_slice(), b"hello");
    }

    #[test]
    fn large_copies_go_to_heap() {
        let data = vec![0xAB; INLINE_CAPACITY + 1];
        let payload = Payload::copy_from(&data);
        assert!(matches!(payload, Payload::Heap(_)));
        assert_eq!(payload.as_slice(), &data[..]);
    }

    #[test]
    fn boundary_copy_is_inline() {
        let data = vec![7u8; INLINE_CAPACITY];
        assert!(matches!(
            Payload::copy_from(&data),
            Payload::Inline { len: INLINE_CAPACITY, .. }
        ));
    }

    #[test]
    fn empty_inputs_collapse_to_empty() {
        assert!(Payload::copy_from(&[]).is_empty());
        assert!(Payload::from_vec(Vec::new()).is_empty());
        assert!(matches!(
            Payload::from_buffer(ExternalBuffer::borrowed([0u8; 0])),
            Payload::Empty
        ));
    }

    #[test]
    fn buffer_without_cleanup_is_copied() {
        let payload = Payload::from_buffer(ExternalBuffer::borrowed(*b"zero-copy? no"));
        assert!(matches!(payload, Payload::Inline { .. }));
    }

    #[test]
    fn cleanup_runs_exactly_once_on_drop() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();
        let payload = Payload::from_buffer(ExternalBuffer::with_cleanup(
            *b"external",
            move |bytes| {
                assert_eq!(bytes, b"external");
                seen.fetch_add(1, Ordering::SeqCst);
            },
        ));
        assert_eq!(payload.as_slice(), b"external");
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Moving the payload must not trigger the cleanup.
        let moved = payload;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        drop(moved);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
