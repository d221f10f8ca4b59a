//! Message envelopes.
//!
//! An [`Envelope`] is the queued record the bus moves around: a header with
//! routing metadata and the payload. Once built, an envelope is owned by
//! exactly one queue slot at a time; multi-subscription fan-out shares one
//! envelope behind an `Arc` rather than copying the payload per subscriber.

use serde::{Deserialize, Serialize};

use crate::ids::{ModuleId, TopicId};
use crate::payload::Payload;

/// Delivery priority band of a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background traffic; serviced opportunistically.
    Low = 0,
    /// Default band.
    #[default]
    Normal = 1,
    /// Preferred over normal traffic.
    High = 2,
    /// Always drained first.
    Urgent = 3,
}

impl Priority {
    /// Number of priority bands.
    pub const COUNT: usize = 4;

    /// All bands, lowest first.
    pub const ALL: [Priority; Priority::COUNT] =
        [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent];

    /// Maps a raw value onto a band, saturating at [`Priority::Urgent`].
    pub fn from_u32(raw: u32) -> Self {
        match raw {
            0 => Priority::Low,
            1 => Priority::Normal,
            2 => Priority::High,
            _ => Priority::Urgent,
        }
    }

    /// Band index, 0 = lowest.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Optional metadata a publisher can attach to a message.
///
/// Non-exhaustive so new fields can be added without breaking callers; build
/// with `MessageOptions::default()` and set what you need.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct MessageOptions {
    /// Module publishing the message, if known.
    pub sender: Option<ModuleId>,
    /// Application-defined flag bits, passed through untouched.
    pub flags: u32,
    /// Priority band the message is queued at.
    pub priority: Priority,
    /// Topic a consumer should reply on, if any.
    pub reply_topic: Option<TopicId>,
}

/// Routing metadata of a queued message.
///
/// The topic is not part of the header: handlers receive it as a separate
/// argument, and RPC requests are not topic-addressed at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeHeader {
    /// Publishing module, if known.
    pub sender: Option<ModuleId>,
    /// Process-unique monotonic message id.
    pub msg_id: u64,
    /// Application-defined flag bits.
    pub flags: u32,
    /// Priority band.
    pub priority: Priority,
    /// Publish-time monotonic timestamp, nanoseconds.
    pub timestamp_ns: u64,
    /// Topic a consumer should reply on, if any.
    pub reply_topic: Option<TopicId>,
}

/// One queued message: header plus payload.
#[derive(Debug)]
pub struct Envelope {
    /// Routing metadata.
    pub header: EnvelopeHeader,
    payload: Payload,
}

impl Envelope {
    /// Builds an envelope from its parts.
    pub fn new(header: EnvelopeHeader, payload: Payload) -> Self {
        Self { header, payload }
    }

    /// The message payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The payload bytes; shorthand for `payload().as_slice()`.
    pub fn data(&self) -> &[u8] {
        self.payload.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_saturates() {
        assert_eq!(Priority::from_u32(0), Priority::Low);
        assert_eq!(Priority::from_u32(3), Priority::Urgent);
        assert_eq!(Priority::from_u32(250), Priority::Urgent);
    }

    #[test]
    fn band_indices_are_dense() {
        for (i, p) in Priority::ALL.iter().enumerate() {
            assert_eq!(p.index(), i);
        }
    }

    #[test]
    fn default_options_are_normal_priority() {
        let opts = MessageOptions::default();
        assert_eq!(opts.priority, Priority::Normal);
        assert_eq!(opts.flags, 0);
        assert!(opts.sender.is_none());
        assert!(opts.reply_topic.is_none());
    }
}
