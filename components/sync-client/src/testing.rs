/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! A single-user in-memory server double implementing the same
//! optimistic-concurrency semantics as the real revision store, with
//! counters and failure switches for exercising the engine's edge paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conversation_id::ConversationId;
use serde_json::Value as JsonValue;
use sync_types::{ConversationEnvelope, ConversationMeta, Timestamp, WriteAck};

use crate::transport::{SyncTransport, TransportError, TransportResult};

#[derive(Clone, Debug)]
pub(crate) struct MockRow {
    pub revision: u64,
    pub deleted: bool,
    pub data: Option<JsonValue>,
    pub updated_at: Timestamp,
}

#[derive(Default)]
pub(crate) struct MockTransport {
    rows: Mutex<HashMap<ConversationId, MockRow>>,
    pub gets: AtomicUsize,
    pub upserts: AtomicUsize,
    pub deletes: AtomicUsize,
    pub lists: AtomicUsize,
    pub fail_gets: AtomicBool,
    pub fail_writes: AtomicBool,
    pub fail_lists: AtomicBool,
    /// While > 0, each GET decrements this and reports `revision - 1`,
    /// simulating a lagging read replica.
    pub stale_gets: AtomicUsize,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, id: &ConversationId, revision: u64, data: JsonValue) {
        self.rows.lock().unwrap().insert(
            id.clone(),
            MockRow {
                revision,
                deleted: false,
                data: Some(data),
                updated_at: Timestamp::now(),
            },
        );
    }

    pub fn seed_tombstone(&self, id: &ConversationId, revision: u64) {
        self.rows.lock().unwrap().insert(
            id.clone(),
            MockRow {
                revision,
                deleted: true,
                data: None,
                updated_at: Timestamp::now(),
            },
        );
    }

    pub fn row(&self, id: &ConversationId) -> Option<MockRow> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().unwrap().len()
    }

    fn conflict(id: &ConversationId, row: &MockRow) -> TransportError {
        TransportError::Conflict {
            conversation_id: id.clone(),
            revision: row.revision,
            deleted: row.deleted,
        }
    }
}

#[async_trait]
impl SyncTransport for MockTransport {
    async fn list_conversations(&self) -> TransportResult<Vec<ConversationMeta>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(TransportError::Network("list unavailable".into()));
        }
        let rows = self.rows.lock().unwrap();
        let mut items: Vec<ConversationMeta> = rows
            .iter()
            .map(|(id, row)| ConversationMeta {
                conversation_id: id.clone(),
                revision: row.revision,
                deleted: row.deleted,
                updated_at: row.updated_at,
            })
            .collect();
        items.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(items)
    }

    async fn get_conversation(
        &self,
        id: &ConversationId,
    ) -> TransportResult<ConversationEnvelope> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(TransportError::Network("get unavailable".into()));
        }
        let rows = self.rows.lock().unwrap();
        let row = rows.get(id).ok_or(TransportError::NotFound)?;
        let mut revision = row.revision;
        if self
            .stale_gets
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            revision = revision.saturating_sub(1);
        }
        Ok(ConversationEnvelope {
            conversation_id: id.clone(),
            revision,
            deleted: row.deleted,
            data: if row.deleted { None } else { row.data.clone() },
        })
    }

    async fn upsert_conversation(
        &self,
        id: &ConversationId,
        base_revision: Option<u64>,
        data: &JsonValue,
    ) -> TransportResult<WriteAck> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                status: 500,
                code: "server_error".into(),
            });
        }
        let mut rows = self.rows.lock().unwrap();
        let revision = match (base_revision, rows.get(id)) {
            (None, None) => 1,
            (None, Some(row)) => return Err(Self::conflict(id, row)),
            (Some(_), None) => return Err(TransportError::NotFound),
            (Some(base), Some(row)) => {
                if row.revision != base {
                    return Err(Self::conflict(id, row));
                }
                row.revision + 1
            }
        };
        rows.insert(
            id.clone(),
            MockRow {
                revision,
                deleted: false,
                data: Some(data.clone()),
                updated_at: Timestamp::now(),
            },
        );
        Ok(WriteAck {
            conversation_id: id.clone(),
            revision,
        })
    }

    async fn delete_conversation(
        &self,
        id: &ConversationId,
        base_revision: Option<u64>,
    ) -> TransportResult<WriteAck> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Status {
                status: 500,
                code: "server_error".into(),
            });
        }
        let mut rows = self.rows.lock().unwrap();
        let revision = match (base_revision, rows.get(id)) {
            (None, None) => 1,
            (None, Some(row)) => return Err(Self::conflict(id, row)),
            (Some(_), None) => return Err(TransportError::NotFound),
            (Some(base), Some(row)) => {
                if row.revision != base {
                    return Err(Self::conflict(id, row));
                }
                row.revision + 1
            }
        };
        rows.insert(
            id.clone(),
            MockRow {
                revision,
                deleted: true,
                data: None,
                updated_at: Timestamp::now(),
            },
        );
        Ok(WriteAck {
            conversation_id: id.clone(),
            revision,
        })
    }
}
