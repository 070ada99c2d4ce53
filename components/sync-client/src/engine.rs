/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The shared heart of the client engine. `SyncCore` owns the sync state,
//! the payload buffer, the transport holder, and the mute registry; the
//! watcher, uploader, resolver and realtime channel are all views over it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use conversation_id::ConversationId;
use serde_json::Value as JsonValue;
use sync_types::ConversationEnvelope;

use crate::mute::MuteRegistry;
use crate::record;
use crate::state::{StateStore, SyncState};
use crate::store::ConversationStore;
use crate::transport::SwappableTransport;

/// A buffered upsert payload. The generation lets the uploader tell
/// whether the payload it pushed is still the latest one when the ACK
/// comes back.
#[derive(Clone, Debug)]
pub(crate) struct BufferedPayload {
    pub generation: u64,
    pub data: JsonValue,
}

pub(crate) struct SyncCore {
    state: Mutex<SyncState>,
    state_store: Box<dyn StateStore>,
    payloads: Mutex<HashMap<ConversationId, BufferedPayload>>,
    payload_generation: AtomicU64,
    pub(crate) in_flight: Mutex<HashSet<ConversationId>>,
    pub(crate) transport: SwappableTransport,
    pub(crate) mutes: MuteRegistry,
    pub(crate) store: Arc<dyn ConversationStore>,
    pub(crate) stopped: AtomicBool,
}

impl SyncCore {
    pub(crate) fn new(
        store: Arc<dyn ConversationStore>,
        state_store: Box<dyn StateStore>,
    ) -> Arc<Self> {
        let state = match state_store.load() {
            Some(blob) => SyncState::from_blob(&blob),
            None => SyncState::new(),
        };
        Arc::new(Self {
            state: Mutex::new(state),
            state_store,
            payloads: Mutex::new(HashMap::new()),
            payload_generation: AtomicU64::new(0),
            in_flight: Mutex::new(HashSet::new()),
            transport: SwappableTransport::disabled(),
            mutes: MuteRegistry::new(),
            store,
            stopped: AtomicBool::new(false),
        })
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    /// Read-only access to the sync state.
    pub(crate) fn read_state<R>(&self, f: impl FnOnce(&SyncState) -> R) -> R {
        f(&self.lock_state())
    }

    /// Mutate the sync state and persist the new snapshot. Persistence
    /// failures are logged, not propagated - the in-memory state is still
    /// authoritative for this session, and the worst case on the next
    /// launch is a stale snapshot and an extra reconcile.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut SyncState) -> R) -> R {
        let mut state = self.lock_state();
        let result = f(&mut state);
        if let Err(e) = self.state_store.save(&state.to_blob()) {
            log::warn!("failed to persist sync state: {}", e);
        }
        result
    }

    pub(crate) fn buffer_payload(&self, id: &ConversationId, data: JsonValue) -> u64 {
        let generation = self.payload_generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.lock_payloads()
            .insert(id.clone(), BufferedPayload { generation, data });
        generation
    }

    pub(crate) fn payload(&self, id: &ConversationId) -> Option<BufferedPayload> {
        self.lock_payloads().get(id).cloned()
    }

    pub(crate) fn payload_generation_of(&self, id: &ConversationId) -> Option<u64> {
        self.lock_payloads().get(id).map(|p| p.generation)
    }

    pub(crate) fn drop_payload(&self, id: &ConversationId) {
        self.lock_payloads().remove(id);
    }

    /// Apply server truth for `id` to the local conversation store, under
    /// mute so the watcher doesn't echo it back as a new intent, then
    /// update the bookkeeping: the remote revision, and no dirty intent or
    /// error left behind.
    pub(crate) fn accept_remote(&self, id: &ConversationId, remote: &ConversationEnvelope) {
        {
            let _guard = self.mutes.mute(id);
            if remote.deleted {
                self.store.delete(id);
            } else if let Some(data) = &remote.data {
                match record::inflate(id, data.clone()) {
                    Ok(conversation) => self.store.upsert(conversation),
                    Err(e) => {
                        // A blob we can't parse still advances the revision
                        // below; re-importing it forever wouldn't help.
                        log::warn!("couldn't apply remote conversation {}: {}", id, e);
                    }
                }
            }
        }
        self.drop_payload(id);
        self.with_state(|state| {
            state.set_remote_revision(id, remote.revision);
            state.clear_dirty(id);
            state.set_error(id, None);
        });
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_payloads(&self) -> MutexGuard<'_, HashMap<ConversationId, BufferedPayload>> {
        match self.payloads.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
