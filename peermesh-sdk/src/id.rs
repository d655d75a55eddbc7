//! Identifier newtypes for peers, rooms, and pair channels.
//!
//! All three are plain value objects: equality and ordering by content
//! (codepoint order, which is what initiator election relies on), transparent
//! serde so they appear as bare strings on the wire.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id! {
    /// Identity of one peer. Caller-supplied or generated; compared by
    /// codepoint order when electing the channel initiator.
    PeerId
}

string_id! {
    /// Name of a room: the key of the presence log.
    RoomId
}

string_id! {
    /// Derived identity of a pair channel: `"{roomId}:{lo}-{hi}"`.
    /// Constructed through [`crate::channel::ChannelPair`], never stored.
    ChannelId
}

impl PeerId {
    /// Generate a random peer identity for callers that don't bring one.
    pub fn generate() -> Self {
        let n: u64 = rand::thread_rng().r#gen();
        Self(format!("peer-{n:016x}"))
    }
}
