/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The wire contract shared by the sync server and the client engine:
//! the JSON payload shapes, the stable error-code tokens, the server-sent
//! event names, and the millisecond `Timestamp` both sides stamp records
//! with. Nothing here performs I/O.

#![allow(unknown_lints)]
#![warn(rust_2018_idioms)]

mod timestamp;

pub use crate::timestamp::Timestamp;

use conversation_id::ConversationId;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Stable lowercase error tokens, exactly as they appear in `{"error": …}`
/// response bodies. Unexpected server internals never leak through these.
pub mod error_codes {
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    pub const RATE_LIMITED: &str = "rate_limited";
    pub const SERVER_ERROR: &str = "server_error";
}

/// Event names on the `/sync/events` stream.
pub mod event_names {
    pub const READY: &str = "ready";
    pub const CONVERSATION_CHANGED: &str = "conversation_changed";
    pub const PING: &str = "ping";
    pub const CLOSE: &str = "close";
}

/// One row of `GET /sync/conversations`. Tombstones are included so other
/// clients observe deletes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMeta {
    pub conversation_id: ConversationId,
    pub revision: u64,
    pub deleted: bool,
    pub updated_at: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationList {
    pub items: Vec<ConversationMeta>,
}

/// The body of `GET /sync/conversations/{id}`. `data` is `null` whenever
/// `deleted` is true.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationEnvelope {
    pub conversation_id: ConversationId,
    pub revision: u64,
    pub deleted: bool,
    pub data: Option<JsonValue>,
}

/// The request body of PUT and (optionally) DELETE. A missing body on
/// DELETE is treated as `base_revision: None`.
///
/// `base_revision: None` covers both an absent and an explicit-null
/// `baseRevision` - both mean "I believe the row does not exist yet".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    #[serde(default)]
    pub base_revision: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
}

/// The 200 body of an accepted PUT or DELETE.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteAck {
    pub conversation_id: ConversationId,
    pub revision: u64,
}

/// The stable 409 body. `error` is always `"conflict"`; it is carried in
/// the struct so that serializing one of these produces the full wire shape.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictBody {
    pub error: String,
    pub conversation_id: ConversationId,
    pub revision: u64,
    pub deleted: bool,
}

impl ConflictBody {
    pub fn new(conversation_id: ConversationId, revision: u64, deleted: bool) -> Self {
        Self {
            error: error_codes::CONFLICT.to_string(),
            conversation_id,
            revision,
            deleted,
        }
    }
}

/// The payload of a `conversation_changed` event. Deliberately metadata
/// only - interested clients refetch the blob, which keeps events small and
/// makes missed events harmless.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub conversation_id: ConversationId,
    pub revision: u64,
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}
