//! Ref-counted async result cells.
//!
//! A future is born PENDING and moves to exactly one of READY, FAILED, or
//! CANCELLED. The terminal outcome lives in a `OnceLock`, which makes the
//! transition a natural compare-and-set: the first writer wins, later
//! attempts fail silently. Completion callbacks registered before the
//! transition are drained at the transition instant; callbacks registered
//! after it fire immediately on the registering thread. Blocking waiters sit
//! on a condvar.
//!
//! Callers hold futures through generation-tagged handles backed by a slab;
//! the explicit ref count makes a double release detectable instead of
//! undefined.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use imc_common::{Error, Payload, Result};
use parking_lot::{Condvar, Mutex};
use slab::Slab;

/// Lifecycle state of a future.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FutureState {
    /// No result yet.
    Pending,
    /// Completed with a payload.
    Ready,
    /// Completed with an error.
    Failed,
    /// Cancelled before completion.
    Cancelled,
}

impl FutureState {
    /// Whether the state is final.
    pub fn is_terminal(self) -> bool {
        !matches!(self, FutureState::Pending)
    }
}

/// Completion callback; receives the terminal state.
pub type CompletionFn = Box<dyn FnOnce(FutureState) + Send>;

#[derive(Debug)]
struct Outcome {
    state: FutureState,
    payload: Option<Payload>,
    error: Option<Error>,
}

/// Shared interior of one future.
pub(crate) struct FutureCell {
    /// Pre-transition state: the callback list. Frozen (drained) at the
    /// transition; the lock also serves as the condvar mutex.
    pending: Mutex<Vec<CompletionFn>>,
    outcome: OnceLock<Outcome>,
    cond: Condvar,
}

impl FutureCell {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            outcome: OnceLock::new(),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> FutureState {
        self.outcome
            .get()
            .map(|o| o.state)
            .unwrap_or(FutureState::Pending)
    }

    /// Attempts the terminal transition. Returns whether this call won;
    /// losing is silent, per the exactly-once contract.
    fn try_complete(&self, outcome: Outcome) -> bool {
        let state = outcome.state;
        let callbacks = {
            let mut pending = self.pending.lock();
            if self.outcome.set(outcome).is_err() {
                return false;
            }
            std::mem::take(&mut *pending)
        };
        // Outside the lock: callbacks may re-enter the bus or this future.
        for callback in callbacks {
            callback(state);
        }
        self.cond.notify_all();
        true
    }

    pub fn complete_ready(&self, payload: Payload) -> bool {
        self.try_complete(Outcome {
            state: FutureState::Ready,
            payload: Some(payload),
            error: None,
        })
    }

    pub fn complete_failed(&self, error: Error) -> bool {
        self.try_complete(Outcome {
            state: FutureState::Failed,
            payload: None,
            error: Some(error),
        })
    }

    /// PENDING → CANCELLED; from a terminal state the cancel is refused.
    pub fn cancel(&self) -> Result<()> {
        if self.try_complete(Outcome {
            state: FutureState::Cancelled,
            payload: None,
            error: None,
        }) {
            Ok(())
        } else {
            Err(Error::InvalidState("future already terminal"))
        }
    }

    /// Registers a completion callback. After the terminal transition the
    /// callback fires immediately on the calling thread.
    pub fn on_complete(&self, callback: CompletionFn) {
        let fire_now = {
            let mut pending = self.pending.lock();
            match self.outcome.get() {
                Some(outcome) => Some(outcome.state),
                None => {
                    pending.push(callback);
                    return;
                }
            }
        };
        if let Some(state) = fire_now {
            callback(state);
        }
    }

    /// Blocks until the future is terminal or `timeout` elapses. `None`
    /// waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<FutureState> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut pending = self.pending.lock();
        loop {
            if let Some(outcome) = self.outcome.get() {
                return Ok(outcome.state);
            }
            match deadline {
                None => self.cond.wait(&mut pending),
                Some(deadline) => {
                    let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                        return Err(Error::Timeout);
                    };
                    if self.cond.wait_for(&mut pending, remaining).timed_out()
                        && self.outcome.get().is_none()
                    {
                        return Err(Error::Timeout);
                    }
                }
            }
        }
    }

    /// The READY payload, or the error describing why there is none.
    fn result_payload(self: &Arc<Self>) -> Result<FutureResult> {
        match self.outcome.get() {
            None => Err(Error::InvalidState("future still pending")),
            Some(outcome) => match outcome.state {
                FutureState::Ready => Ok(FutureResult { cell: self.clone() }),
                FutureState::Cancelled => Err(Error::FutureCancelled),
                FutureState::Failed => Err(Error::FutureFailed(Box::new(
                    outcome.error.clone().unwrap_or(Error::NotSupported),
                ))),
                FutureState::Pending => unreachable!("outcome is always terminal"),
            },
        }
    }
}

impl std::fmt::Debug for FutureCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureCell").field("state", &self.state()).finish()
    }
}

/// Borrow of a READY future's payload; keeps the cell alive while held.
#[derive(Debug)]
pub struct FutureResult {
    cell: Arc<FutureCell>,
}

impl FutureResult {
    /// The result bytes.
    pub fn as_slice(&self) -> &[u8] {
        self.cell
            .outcome
            .get()
            .and_then(|o| o.payload.as_ref())
            .map(Payload::as_slice)
            .unwrap_or(&[])
    }
}

impl std::ops::Deref for FutureResult {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// Opaque, copyable reference to a stored future.
///
/// Handles stay well-formed after release: operations on a stale handle
/// return [`Error::InvalidHandle`] (or [`Error::InvalidState`] for a double
/// release) instead of touching freed memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FutureHandle {
    index: usize,
    generation: u64,
}

struct FutureSlot {
    generation: u64,
    refs: u32,
    cell: Arc<FutureCell>,
}

/// Slab of live futures, keyed by generation-tagged handles.
pub(crate) struct FutureStore {
    slots: Mutex<Slab<FutureSlot>>,
    next_generation: AtomicU64,
}

impl FutureStore {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slab::new()),
            next_generation: AtomicU64::new(1),
        }
    }

    /// Creates a PENDING future with one reference held by the caller.
    pub fn create(&self) -> (FutureHandle, Arc<FutureCell>) {
        let cell = Arc::new(FutureCell::new());
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let index = self.slots.lock().insert(FutureSlot {
            generation,
            refs: 1,
            cell: cell.clone(),
        });
        (FutureHandle { index, generation }, cell)
    }

    /// Resolves a handle to its cell.
    pub fn resolve(&self, handle: FutureHandle) -> Result<Arc<FutureCell>> {
        let slots = self.slots.lock();
        match slots.get(handle.index) {
            Some(slot) if slot.generation == handle.generation => Ok(slot.cell.clone()),
            _ => Err(Error::InvalidHandle),
        }
    }

    /// Drops one reference; the slot is freed when the count reaches zero.
    /// Releasing an already-freed handle is an error, not a crash.
    pub fn release(&self, handle: FutureHandle) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = match slots.get_mut(handle.index) {
            Some(slot) if slot.generation == handle.generation => slot,
            _ => return Err(Error::InvalidState("future already released")),
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            slots.remove(handle.index);
        }
        Ok(())
    }

    /// Cancels every pending future and forgets all slots. Shutdown path.
    pub fn clear(&self) {
        let slots = std::mem::take(&mut *self.slots.lock());
        for (_, slot) in slots {
            let _ = slot.cell.cancel();
        }
    }

    /// Number of live futures.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

impl std::fmt::Debug for FutureStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FutureStore").field("len", &self.len()).finish()
    }
}

/// Resolves a handle and reads the READY payload; shared by the bus facade.
pub(crate) fn result_of(store: &FutureStore, handle: FutureHandle) -> Result<FutureResult> {
    store.resolve(handle)?.result_payload()
}
