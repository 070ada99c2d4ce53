/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Durable per-conversation sync bookkeeping: the revision the local copy
//! is believed to be based on, the pending intent, and diagnostics. The
//! blob is persisted through the [`StateStore`] seam after every mutation;
//! upsert payloads are deliberately not part of it (they're rebuilt from
//! the conversation store on restart).

use std::collections::HashMap;

use conversation_id::ConversationId;
use serde_derive::{Deserialize, Serialize};
use sync_types::Timestamp;

pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Where the engine persists its state blob. The embedding app owns the
/// actual storage (a KV store, a file, …); the engine only ever hands it
/// opaque strings.
pub trait StateStore: Send + Sync {
    fn load(&self) -> Option<String>;
    fn save(&self, blob: &str) -> std::io::Result<()>;
}

/// An in-memory state store, for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStateStore {
    blob: std::sync::Mutex<Option<String>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn load(&self) -> Option<String> {
        self.blob.lock().unwrap().clone()
    }

    fn save(&self, blob: &str) -> std::io::Result<()> {
        *self.blob.lock().unwrap() = Some(blob.to_string());
        Ok(())
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirtyOp {
    Upsert,
    Delete,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSyncState {
    pub remote_revision: Option<u64>,
    pub dirty: Option<DirtyOp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncState {
    conversations: HashMap<ConversationId, ConversationSyncState>,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_dirty(&mut self, id: &ConversationId, op: DirtyOp) {
        self.entry(id).dirty = Some(op);
    }

    pub fn clear_dirty(&mut self, id: &ConversationId) {
        self.entry(id).dirty = None;
    }

    pub fn set_remote_revision(&mut self, id: &ConversationId, revision: u64) {
        self.entry(id).remote_revision = Some(revision);
    }

    pub fn set_attempt(&mut self, id: &ConversationId, at: Timestamp) {
        self.entry(id).last_attempt_at = Some(at);
    }

    pub fn set_error(&mut self, id: &ConversationId, error: Option<String>) {
        self.entry(id).last_error = error;
    }

    pub fn forget(&mut self, id: &ConversationId) {
        self.conversations.remove(id);
    }

    pub fn get(&self, id: &ConversationId) -> Option<&ConversationSyncState> {
        self.conversations.get(id)
    }

    pub fn dirty_op(&self, id: &ConversationId) -> Option<DirtyOp> {
        self.get(id).and_then(|s| s.dirty)
    }

    pub fn remote_revision(&self, id: &ConversationId) -> Option<u64> {
        self.get(id).and_then(|s| s.remote_revision)
    }

    pub fn dirty_ids(&self) -> Vec<(ConversationId, DirtyOp)> {
        self.conversations
            .iter()
            .filter_map(|(id, s)| s.dirty.map(|op| (id.clone(), op)))
            .collect()
    }

    fn entry(&mut self, id: &ConversationId) -> &mut ConversationSyncState {
        self.conversations.entry(id.clone()).or_default()
    }

    pub fn to_blob(&self) -> String {
        serde_json::to_string(&PersistedState {
            version: STATE_SCHEMA_VERSION,
            conversations: &self.conversations,
        })
        .expect("sync state doesn't fail to serialize")
    }

    /// Parse a persisted blob. An unknown schema version or a corrupt blob
    /// means starting fresh - dropping old bookkeeping is always safe, it
    /// just costs a full reconcile.
    pub fn from_blob(blob: &str) -> Self {
        match serde_json::from_str::<OwnedPersistedState>(blob) {
            Ok(parsed) if parsed.version == STATE_SCHEMA_VERSION => Self {
                conversations: parsed.conversations,
            },
            Ok(parsed) => {
                log::warn!(
                    "sync state schema {} is unknown; starting fresh",
                    parsed.version
                );
                Self::default()
            }
            Err(e) => {
                log::warn!("discarding unparseable sync state: {}", e);
                Self::default()
            }
        }
    }
}

#[derive(Serialize)]
struct PersistedState<'a> {
    version: u32,
    conversations: &'a HashMap<ConversationId, ConversationSyncState>,
}

#[derive(Deserialize)]
struct OwnedPersistedState {
    version: u32,
    #[serde(default)]
    conversations: HashMap<ConversationId, ConversationSyncState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ConversationId {
        ConversationId::parse(s).unwrap()
    }

    #[test]
    fn test_dirty_lifecycle() {
        let mut state = SyncState::new();
        state.mark_dirty(&id("C1"), DirtyOp::Upsert);
        assert_eq!(state.dirty_op(&id("C1")), Some(DirtyOp::Upsert));

        // Last intent wins.
        state.mark_dirty(&id("C1"), DirtyOp::Delete);
        assert_eq!(state.dirty_op(&id("C1")), Some(DirtyOp::Delete));

        state.clear_dirty(&id("C1"));
        assert_eq!(state.dirty_op(&id("C1")), None);
        // Clearing the intent does not lose the revision bookkeeping.
        state.set_remote_revision(&id("C1"), 4);
        state.clear_dirty(&id("C1"));
        assert_eq!(state.remote_revision(&id("C1")), Some(4));
    }

    #[test]
    fn test_roundtrip_through_blob() {
        let mut state = SyncState::new();
        state.set_remote_revision(&id("C1"), 7);
        state.mark_dirty(&id("C2"), DirtyOp::Upsert);
        state.set_error(&id("C2"), Some("conflict".into()));
        state.set_attempt(&id("C2"), Timestamp(123));

        let restored = SyncState::from_blob(&state.to_blob());
        assert_eq!(restored.remote_revision(&id("C1")), Some(7));
        assert_eq!(restored.dirty_op(&id("C2")), Some(DirtyOp::Upsert));
        assert_eq!(
            restored.get(&id("C2")).unwrap().last_error.as_deref(),
            Some("conflict")
        );
    }

    #[test]
    fn test_unknown_version_starts_fresh() {
        let blob = r#"{"version": 99, "conversations": {"C1": {"remote_revision": 1, "dirty": null}}}"#;
        let state = SyncState::from_blob(blob);
        assert!(state.get(&id("C1")).is_none());
    }

    #[test]
    fn test_corrupt_blob_starts_fresh() {
        let state = SyncState::from_blob("not json at all");
        assert!(state.dirty_ids().is_empty());
    }

    #[test]
    fn test_forget() {
        let mut state = SyncState::new();
        state.set_remote_revision(&id("C1"), 3);
        state.forget(&id("C1"));
        assert!(state.get(&id("C1")).is_none());
    }
}
