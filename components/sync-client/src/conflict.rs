/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Conflict resolution. Merging is deliberately unsupported: the remote
//! version always wins the original id, and an attempted local upsert is
//! preserved under a freshly minted id with a " (conflict copy)" title so
//! the user keeps what they wrote.

use std::sync::Arc;

use conversation_id::ConversationId;

use crate::engine::SyncCore;
use crate::record;
use crate::state::DirtyOp;

impl SyncCore {
    pub(crate) async fn resolve_conflict(self: &Arc<Self>, id: ConversationId, op: DirtyOp) {
        match op {
            DirtyOp::Upsert => self.resolve_upsert_conflict(id).await,
            DirtyOp::Delete => self.resolve_delete_conflict(id).await,
        }
    }

    async fn resolve_upsert_conflict(self: &Arc<Self>, id: ConversationId) {
        // Everything hinges on reading the remote row first. If that read
        // fails we record the error and bail *without* minting a copy -
        // the intent stays dirty and is retried on the next trigger, and
        // gating copy creation on a successful read is what stops retries
        // from piling up duplicate copies.
        let transport = self.transport.current();
        let remote = match transport.get_conversation(&id).await {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("conflict on {} is unresolvable right now: {}", id, e);
                self.with_state(|s| s.set_error(&id, Some(format!("remote fetch failed: {}", e))));
                return;
            }
        };

        let attempted = self.payload(&id).map(|buffered| buffered.data);
        match attempted {
            Some(attempted) => {
                let (copy_id, copy_payload) = record::conflict_copy(&attempted);
                log::info!("preserving local attempt for {} as {}", id, copy_id);
                {
                    let _guard = self.mutes.mute(&copy_id);
                    match record::inflate(&copy_id, copy_payload.clone()) {
                        Ok(conversation) => self.store.upsert(conversation),
                        Err(e) => log::warn!("couldn't import conflict copy: {}", e),
                    }
                }
                // The original takes the remote version; this also clears
                // the dirty intent and the buffered payload.
                self.accept_remote(&id, &remote);
                // The copy went into the store under mute, so the watcher
                // said nothing about it; queue its upload explicitly. Its
                // id is brand new, so the push is a create.
                self.enqueue_upsert(copy_id, copy_payload);
            }
            None => {
                // No payload to preserve (it evaporated since the push);
                // just take the remote version.
                self.accept_remote(&id, &remote);
            }
        }
    }

    async fn resolve_delete_conflict(self: &Arc<Self>, id: ConversationId) {
        let transport = self.transport.current();
        let remote = match transport.get_conversation(&id).await {
            Ok(remote) => remote,
            Err(e) => {
                log::warn!("delete conflict on {} is unresolvable right now: {}", id, e);
                self.with_state(|s| s.set_error(&id, Some(format!("remote fetch failed: {}", e))));
                return;
            }
        };
        // If the remote row is itself deleted we just make sure no stray
        // local record remains; otherwise the remote blob comes back and
        // the local delete intent is cancelled.
        self.accept_remote(&id, &remote);
    }
}
