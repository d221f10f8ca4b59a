//! Error taxonomy and the per-thread last-error record.
//!
//! Every externally callable runtime operation returns [`Result`]. The
//! variants fall into three kinds: programmer errors (invalid argument,
//! state, handle), resource errors (queue full, timeout), and domain errors
//! (unregistered RPC, cancelled future, version mismatch). Panics escaping
//! user handlers are caught at the dispatch boundary and surface as
//! [`Error::HandlerPanic`].

use std::cell::RefCell;
use std::panic::Location;

use thiserror::Error;

/// IMC runtime error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// A required argument was missing, empty, or malformed
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),
    /// A declared structure or table size is below the supported minimum
    #[error("Invalid size: expected at least {expected}, got {actual}")]
    InvalidSize {
        /// Minimum the callee requires
        expected: usize,
        /// Size the caller declared
        actual: usize,
    },
    /// Operation applied to an object in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),
    /// Handle is unknown, stale, or already released
    #[error("Invalid handle")]
    InvalidHandle,
    /// An entry with the same key already exists
    #[error("Already exists")]
    AlreadyExists,
    /// No entry with the given key
    #[error("Not found")]
    NotFound,
    /// Allocation failed
    #[error("Out of memory")]
    OutOfMemory,
    /// A subscription queue is full and the backpressure policy rejected the
    /// message
    #[error("Queue full")]
    QueueFull,
    /// A bounded wait elapsed before the condition was met
    #[error("Timed out")]
    Timeout,
    /// The operation would block and the caller asked not to
    #[error("Would block")]
    WouldBlock,
    /// `call_rpc` on an id with no registered handler
    #[error("RPC not registered")]
    RpcNotRegistered,
    /// `register_rpc` on an id that already has a live handler
    #[error("RPC already registered")]
    RpcAlreadyRegistered,
    /// The future was cancelled before it produced a result
    #[error("Future cancelled")]
    FutureCancelled,
    /// The future completed with the contained handler error
    #[error("Future failed: {0}")]
    FutureFailed(Box<Error>),
    /// Version requirements could not be satisfied
    #[error("Version mismatch: required {required_major}.{required_minor}, found {actual_major}.{actual_minor}")]
    VersionMismatch {
        /// Major version the caller requires (must match exactly)
        required_major: u32,
        /// Minimum minor version the caller requires
        required_minor: u32,
        /// Major version actually registered
        actual_major: u32,
        /// Minor version actually registered
        actual_minor: u32,
    },
    /// The runtime does not provide the requested feature
    #[error("Not supported")]
    NotSupported,
    /// The caller lacks the capability required for the operation
    #[error("Permission denied")]
    PermissionDenied,
    /// A user handler panicked; the panic was contained at the dispatch
    /// boundary
    #[error("Handler panicked: {0}")]
    HandlerPanic(String),
}

/// IMC result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Detailed record of the most recent error on the current thread.
///
/// Set by the runtime next to the `Err` return; cleared when the caller takes
/// it. Diagnostic only — result codes, not this record, drive control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    /// The error that was returned
    pub error: Error,
    /// Name of the API that failed
    pub api_name: &'static str,
    /// Source file of the recording call site
    pub source_file: &'static str,
    /// Source line of the recording call site
    pub source_line: u32,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<LastError>> = const { RefCell::new(None) };
}

impl LastError {
    /// Records `error` as the current thread's last error, capturing the
    /// caller's source location.
    #[track_caller]
    pub fn record(api_name: &'static str, error: &Error) {
        let location = Location::caller();
        tracing::debug!(api = api_name, %error, "recording last error");
        LAST_ERROR.with(|slot| {
            *slot.borrow_mut() = Some(LastError {
                error: error.clone(),
                api_name,
                source_file: location.file(),
                source_line: location.line(),
            });
        });
    }

    /// Reads the current thread's last error without clearing it.
    pub fn current() -> Option<LastError> {
        LAST_ERROR.with(|slot| slot.borrow().clone())
    }

    /// Takes the current thread's last error, clearing the record.
    pub fn take() -> Option<LastError> {
        LAST_ERROR.with(|slot| slot.borrow_mut().take())
    }

    /// Clears the record without reading it.
    pub fn clear() {
        LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
    }
}

/// Records `err` against `api_name` and passes the error through, so call
/// sites can annotate a `Result` in tail position.
#[track_caller]
pub fn record_err<T>(api_name: &'static str, result: Result<T>) -> Result<T> {
    if let Err(err) = &result {
        LastError::record(api_name, err);
    }
    result
}
