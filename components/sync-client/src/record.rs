/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The local conversation model and its wire codec.
//!
//! The server only ever sees sanitized blobs: transient fields (an
//! in-flight response marker) and locally-computed caches (per-message
//! token counts) never leave the device. Both are `#[serde(skip)]`, so
//! sanitizing is serializing and inflating re-attaches the defaults.

use conversation_id::ConversationId;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sync_types::Timestamp;

use crate::error::*;

pub const CONFLICT_COPY_SUFFIX: &str = " (conflict copy)";
const UNTITLED: &str = "Untitled";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Incognito conversations never leave the device.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incognito: bool,
    #[serde(default)]
    pub messages: Vec<Message>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub role: String,
    pub text: String,
    /// Set while a response is still streaming in; such a message is
    /// finished or gone by the time anyone else needs it.
    #[serde(skip)]
    pub pending: bool,
    /// Computed lazily on this device; other devices recompute.
    #[serde(skip)]
    pub token_count: Option<u32>,
}

impl Message {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            text: text.into(),
            pending: false,
            token_count: None,
        }
    }
}

impl Conversation {
    pub fn new(id: ConversationId) -> Self {
        let now = Timestamp::now();
        Self {
            id,
            title: None,
            incognito: false,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Whether a conversation may be sent to the server: not incognito, and
/// not a placeholder (it has at least one message or a title).
pub fn is_sync_eligible(conversation: &Conversation) -> bool {
    !conversation.incognito
        && (!conversation.messages.is_empty()
            || conversation
                .title
                .as_deref()
                .map(|t| !t.is_empty())
                .unwrap_or(false))
}

/// Produce the wire blob for a conversation.
pub fn sanitize(conversation: &Conversation) -> Result<JsonValue> {
    Ok(serde_json::to_value(conversation)?)
}

/// The inverse of [`sanitize`]: parse a pulled blob back into a local
/// conversation, re-attaching defaults for the skipped fields. The blob's
/// `id` must match the conversation it was fetched for.
pub fn inflate(expected_id: &ConversationId, data: JsonValue) -> Result<Conversation> {
    let conversation: Conversation = serde_json::from_value(data)?;
    if conversation.id != *expected_id {
        return Err(SyncClientError::IdMismatch);
    }
    Ok(conversation)
}

/// Build the conflict-copy payload for an attempted (sanitized) upsert that
/// lost a race: a fresh id, fresh timestamps, and a title that tells the
/// user what happened. Returns the minted id along with the payload.
pub fn conflict_copy(attempted: &JsonValue) -> (ConversationId, JsonValue) {
    let copy_id = ConversationId::random();
    let now = Timestamp::now();
    let mut copy = attempted.clone();
    if let Some(obj) = copy.as_object_mut() {
        obj.insert("id".into(), JsonValue::String(copy_id.to_string()));
        obj.insert("createdAt".into(), JsonValue::from(now.as_millis()));
        obj.insert("updatedAt".into(), JsonValue::from(now.as_millis()));
        let title = match obj.get("title").and_then(|t| t.as_str()) {
            Some(title) if !title.is_empty() => format!("{}{}", title, CONFLICT_COPY_SUFFIX),
            _ => format!("{}{}", UNTITLED, CONFLICT_COPY_SUFFIX),
        };
        obj.insert("title".into(), JsonValue::String(title));
    }
    (copy_id, copy)
}
