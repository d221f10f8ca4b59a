//! Stable runtime identifiers.
//!
//! Topic and RPC ids are derived from their UTF-8 names by the name
//! registries in `imc-bus`; API ids are assigned at compile time from the
//! documented range partition in `imc-dispatch`. All three are non-zero
//! 32-bit values; zero is the reserved "invalid" encoding and is
//! unrepresentable here.

use std::fmt;
use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(NonZeroU32);

        impl $name {
            /// Wraps a raw id, rejecting the reserved zero encoding.
            pub const fn new(raw: u32) -> Option<Self> {
                match NonZeroU32::new(raw) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            /// Returns the raw 32-bit value.
            pub const fn get(self) -> u32 {
                self.0.get()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$name> for u32 {
            fn from(id: $name) -> u32 {
                id.get()
            }
        }
    };
}

id_newtype! {
    /// Identifier of a broadcast topic.
    ///
    /// Permanent for the process lifetime of a given name; see the name
    /// registry for the derivation.
    TopicId
}

id_newtype! {
    /// Identifier of an RPC endpoint. Shares the derivation scheme with
    /// [`TopicId`] but lives in a separate id space.
    RpcId
}

id_newtype! {
    /// Stable identifier of a dispatchable API entry.
    ///
    /// Unlike topic and RPC ids these are assigned by hand and frozen
    /// forever; the range partition is documented in `imc-dispatch`.
    ApiId
}

id_newtype! {
    /// Opaque identifier of a loaded module, carried as the optional sender
    /// of an envelope.
    ModuleId
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_rejected() {
        assert!(TopicId::new(0).is_none());
        assert!(RpcId::new(0).is_none());
        assert!(ApiId::new(0).is_none());
    }

    #[test]
    fn round_trips_raw_value() {
        let id = TopicId::new(0x9E37_79B1).expect("non-zero");
        assert_eq!(id.get(), 0x9E37_79B1);
        assert_eq!(u32::from(id), 0x9E37_79B1);
    }

    #[test]
    fn option_is_word_sized() {
        // `reply_topic: Option<TopicId>` must stay a bare u32 on the wire.
        assert_eq!(
            std::mem::size_of::<Option<TopicId>>(),
            std::mem::size_of::<u32>()
        );
    }
}
