/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum SyncClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Error parsing JSON data: {0}")]
    JsonError(#[from] serde_json::Error),

    /// A dirty upsert with no rebuildable payload. The intent is dropped,
    /// never converted into a delete.
    #[error("missing upsert payload")]
    MissingPayload,

    /// A GET failed during initial pull or conflict resolution. The
    /// resolution is re-attempted on the next trigger.
    #[error("remote fetch failed: {0}")]
    RemoteFetchFailed(String),

    /// A pulled blob carried an `id` that doesn't match the conversation
    /// it was fetched for.
    #[error("conversation data does not match its id")]
    IdMismatch,

    #[error("failed to persist sync state: {0}")]
    StatePersist(String),
}

pub type Result<T> = std::result::Result<T, SyncClientError>;
