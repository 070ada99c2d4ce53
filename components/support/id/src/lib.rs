/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "serde_support")]
mod serde_support;

#[cfg(feature = "rusqlite_support")]
mod rusqlite_support;

use std::{fmt, ops, str};

/// The identifier of a synced conversation. Using a dedicated type rather
/// than a `String` means the validity rules are enforced once, at the edge:
/// anything holding a `ConversationId` is known to be URL-safe and within
/// the length limit, so it can go straight into a path segment or a
/// database key.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ConversationId(String);

/// The longest id we accept. Anything longer is rejected rather than
/// truncated, because truncation would silently alias two distinct keys.
pub const MAX_CONVERSATION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid conversation id")]
pub struct InvalidConversationId;

impl ConversationId {
    /// Parse and validate `s`. Ids are 1..=128 bytes of `[A-Za-z0-9_-]`.
    pub fn parse(s: impl AsRef<str>) -> Result<Self, InvalidConversationId> {
        let s = s.as_ref();
        if Self::is_valid(s) {
            Ok(ConversationId(s.to_owned()))
        } else {
            Err(InvalidConversationId)
        }
    }

    /// Create an id from a string the caller has already validated, e.g.
    /// one read back from our own database.
    pub fn from_trusted(s: String) -> Self {
        debug_assert!(
            Self::is_valid(&s),
            "Bug: caller passed an invalid id: {:?}",
            s
        );
        ConversationId(s)
    }

    /// Create a random id, as done when minting a conflict copy. 9 random
    /// bytes gives us 12 base64url characters, which matches the size of
    /// ids minted elsewhere in the system and is comfortably unguessable.
    #[cfg(feature = "random")]
    pub fn random() -> Self {
        use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
        use rand::prelude::*;
        let mut bytes = [0u8; 9];
        rand::thread_rng().fill_bytes(&mut bytes);
        ConversationId(URL_SAFE_NO_PAD.encode(bytes))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True for 1..=128 bytes of the URL-safe alphabet.
    pub fn is_valid(s: &str) -> bool {
        !s.is_empty()
            && s.len() <= MAX_CONVERSATION_ID_LEN
            && s.bytes().all(Self::is_valid_byte)
    }

    #[inline]
    fn is_valid_byte(b: u8) -> bool {
        b.is_ascii_alphanumeric() || b == b'_' || b == b'-'
    }
}

impl str::FromStr for ConversationId {
    type Err = InvalidConversationId;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ConversationId::parse(s)
    }
}

impl TryFrom<String> for ConversationId {
    type Error = InvalidConversationId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        if ConversationId::is_valid(&s) {
            Ok(ConversationId(s))
        } else {
            Err(InvalidConversationId)
        }
    }
}

impl TryFrom<&str> for ConversationId {
    type Error = InvalidConversationId;
    fn try_from(s: &str) -> Result<Self, Self::Error> {
        ConversationId::parse(s)
    }
}

impl From<ConversationId> for String {
    fn from(id: ConversationId) -> Self {
        id.0
    }
}

impl AsRef<str> for ConversationId {
    #[inline]
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl ops::Deref for ConversationId {
    type Target = str;
    #[inline]
    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<str> for ConversationId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&'_ str> for ConversationId {
    fn eq(&self, other: &&'_ str) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl fmt::Debug for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConversationId({:?})", self.as_str())
    }
}
