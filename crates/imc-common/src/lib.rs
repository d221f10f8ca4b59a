//! Shared leaf types for the IMC runtime.
//!
//! Everything in this crate is a plain data type with no global state:
//! identifiers, the error taxonomy, payload storage, message envelopes,
//! capability flags, and the API version triple. The bus (`imc-bus`) and the
//! dispatch layer (`imc-dispatch`) both build on these.

#![forbid(unsafe_code)]

pub mod capability;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod payload;
pub mod version;

pub use self::capability::Capabilities;
pub use self::envelope::{Envelope, EnvelopeHeader, MessageOptions, Priority};
pub use self::error::{Error, LastError, Result};
pub use self::ids::{ApiId, ModuleId, RpcId, TopicId};
pub use self::payload::{ExternalBuffer, Payload, INLINE_CAPACITY};
pub use self::version::ApiVersion;

/// Version of the runtime API surface, reported in capability descriptors.
pub const RUNTIME_API_VERSION: ApiVersion = ApiVersion::new(0, 3, 0);
