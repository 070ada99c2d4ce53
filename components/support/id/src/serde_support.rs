/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::fmt;

use serde::{
    de::{self, Deserialize, Deserializer, Visitor},
    ser::{Serialize, Serializer},
};

use crate::ConversationId;

struct ConversationIdVisitor;

impl<'de> Visitor<'de> for ConversationIdVisitor {
    type Value = ConversationId;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("a URL-safe conversation id")
    }

    fn visit_str<E: de::Error>(self, value: &str) -> Result<ConversationId, E> {
        ConversationId::parse(value)
            .map_err(|_| E::invalid_value(de::Unexpected::Str(value), &self))
    }
}

impl<'de> Deserialize<'de> for ConversationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<ConversationId, D::Error> {
        deserializer.deserialize_str(ConversationIdVisitor)
    }
}

impl Serialize for ConversationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let id = ConversationId::parse("C1").unwrap();
        let s = serde_json::to_string(&id).unwrap();
        assert_eq!(s, "\"C1\"");
        let back: ConversationId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(serde_json::from_str::<ConversationId>("\"not ok\"").is_err());
        assert!(serde_json::from_str::<ConversationId>("\"\"").is_err());
        assert!(serde_json::from_str::<ConversationId>("3").is_err());
    }
}
