/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The dirty-queue uploader: per conversation, at most one request in
//! flight at a time, with retries driven strictly by events (the next
//! watcher change, the next realtime event, the next startup) - never a
//! timer loop. A 409 is not retried at all; it goes to the resolver.

use std::sync::Arc;

use conversation_id::ConversationId;
use serde_json::Value as JsonValue;
use sync_types::Timestamp;

use crate::engine::SyncCore;
use crate::state::DirtyOp;
use crate::transport::TransportError;

impl SyncCore {
    /// Record an upsert intent with its wire payload and kick off a flush.
    pub(crate) fn enqueue_upsert(self: &Arc<Self>, id: ConversationId, payload: JsonValue) {
        self.buffer_payload(&id, payload);
        self.with_state(|state| state.mark_dirty(&id, DirtyOp::Upsert));
        self.spawn_flush(id);
    }

    /// Record a delete intent. Replaces any pending upsert and drops its
    /// buffered payload - the last intent wins.
    pub(crate) fn enqueue_delete(self: &Arc<Self>, id: ConversationId) {
        self.drop_payload(&id);
        self.with_state(|state| state.mark_dirty(&id, DirtyOp::Delete));
        self.spawn_flush(id);
    }

    pub(crate) fn spawn_flush(self: &Arc<Self>, id: ConversationId) {
        let core = Arc::clone(self);
        tokio::spawn(async move { core.try_flush(id).await });
    }

    pub(crate) async fn try_flush(self: Arc<Self>, id: ConversationId) {
        loop {
            if self.is_stopped() {
                return;
            }
            // One in-flight request per key; a concurrent flush for the
            // same key just bows out and the winner's tail check picks up
            // whatever state it leaves behind.
            if !self.lock_in_flight().insert(id.clone()) {
                return;
            }
            let op_at_start = match self.read_state(|s| s.dirty_op(&id)) {
                Some(op) => op,
                None => {
                    self.release_in_flight(&id);
                    return;
                }
            };
            if !self.transport.is_live() {
                // Queued intents wait for the initial pull to finish; the
                // disabled transport logs this once per process.
                self.release_in_flight(&id);
                return;
            }

            self.with_state(|s| s.set_attempt(&id, Timestamp::now()));
            let base_revision = self.read_state(|s| s.remote_revision(&id));
            let transport = self.transport.current();

            let mut sent_generation = None;
            let result = match op_at_start {
                DirtyOp::Upsert => match self.payload(&id) {
                    Some(buffered) => {
                        sent_generation = Some(buffered.generation);
                        transport
                            .upsert_conversation(&id, base_revision, &buffered.data)
                            .await
                    }
                    None => {
                        // Should have been rebuilt by reconcile; without a
                        // payload there is nothing safe to send.
                        log::warn!("dirty upsert for {} has no payload", id);
                        let message = crate::error::SyncClientError::MissingPayload.to_string();
                        self.with_state(|s| s.set_error(&id, Some(message)));
                        self.release_in_flight(&id);
                        return;
                    }
                },
                DirtyOp::Delete => transport.delete_conversation(&id, base_revision).await,
            };

            let succeeded = match result {
                Ok(ack) => {
                    self.with_state(|state| {
                        state.set_remote_revision(&id, ack.revision);
                        // Only retire the intent if nothing new arrived
                        // while the request was in flight.
                        let unchanged = state.dirty_op(&id) == Some(op_at_start)
                            && (op_at_start == DirtyOp::Delete
                                || self.payload_generation_of(&id) == sent_generation);
                        if unchanged {
                            state.clear_dirty(&id);
                            state.set_error(&id, None);
                        }
                        if unchanged && op_at_start == DirtyOp::Upsert {
                            self.drop_payload(&id);
                        }
                    });
                    log::debug!("flushed {:?} for {}", op_at_start, id);
                    true
                }
                Err(TransportError::Conflict {
                    revision, deleted, ..
                }) => {
                    log::info!(
                        "conflict pushing {} (server at revision {}, deleted={})",
                        id,
                        revision,
                        deleted
                    );
                    self.release_in_flight(&id);
                    self.resolve_conflict(id, op_at_start).await;
                    return;
                }
                Err(TransportError::Disabled) => {
                    // The transport was swapped back out mid-flight; keep
                    // the intent, say nothing to the user.
                    false
                }
                Err(e) => {
                    self.with_state(|s| s.set_error(&id, Some(e.to_string())));
                    false
                }
            };

            self.release_in_flight(&id);

            // Step out unless there is follow-up work this flush itself is
            // responsible for: a successful push with a fresh intent queued
            // behind it, or an intent whose kind flipped mid-flight. Plain
            // failures wait for the next external trigger.
            let current = self.read_state(|s| s.dirty_op(&id));
            let flipped = current.is_some() && current != Some(op_at_start);
            let again = if succeeded {
                current.is_some()
            } else {
                flipped
            };
            if !again {
                return;
            }
        }
    }

    fn lock_in_flight(
        &self,
    ) -> std::sync::MutexGuard<'_, std::collections::HashSet<ConversationId>> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn release_in_flight(&self, id: &ConversationId) {
        self.lock_in_flight().remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStateStore;
    use crate::store::MemoryConversationStore;
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn id(s: &str) -> ConversationId {
        ConversationId::parse(s).unwrap()
    }

    fn live_core(mock: &Arc<MockTransport>) -> Arc<SyncCore> {
        let core = SyncCore::new(
            Arc::new(MemoryConversationStore::new()),
            Box::new(MemoryStateStore::new()),
        );
        core.transport.swap(Arc::clone(mock) as Arc<dyn crate::transport::SyncTransport>);
        core
    }

    #[tokio::test]
    async fn test_flush_upsert_acks_and_clears() {
        let mock = MockTransport::new();
        let core = live_core(&mock);
        let c1 = id("C1");

        core.buffer_payload(&c1, json!({"id": "C1"}));
        core.with_state(|s| s.mark_dirty(&c1, DirtyOp::Upsert));
        Arc::clone(&core).try_flush(c1.clone()).await;

        assert_eq!(core.read_state(|s| s.remote_revision(&c1)), Some(1));
        assert_eq!(core.read_state(|s| s.dirty_op(&c1)), None);
        assert!(core.payload(&c1).is_none());
        assert_eq!(mock.row(&c1).unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_flush_without_transport_keeps_intent() {
        let core = SyncCore::new(
            Arc::new(MemoryConversationStore::new()),
            Box::new(MemoryStateStore::new()),
        );
        let c1 = id("C1");
        core.buffer_payload(&c1, json!({"id": "C1"}));
        core.with_state(|s| s.mark_dirty(&c1, DirtyOp::Upsert));
        Arc::clone(&core).try_flush(c1.clone()).await;

        // Still dirty, no error surfaced: the transport is just disabled.
        assert_eq!(core.read_state(|s| s.dirty_op(&c1)), Some(DirtyOp::Upsert));
        assert!(core.read_state(|s| s.get(&c1).unwrap().last_error.is_none()));
    }

    #[tokio::test]
    async fn test_flush_upsert_missing_payload_records_error() {
        let mock = MockTransport::new();
        let core = live_core(&mock);
        let c1 = id("C1");
        core.with_state(|s| s.mark_dirty(&c1, DirtyOp::Upsert));
        Arc::clone(&core).try_flush(c1.clone()).await;

        assert_eq!(
            core.read_state(|s| s.get(&c1).unwrap().last_error.clone()),
            Some("missing upsert payload".to_string())
        );
        // The intent is untouched; reconcile or the next edit sorts it out.
        assert_eq!(core.read_state(|s| s.dirty_op(&c1)), Some(DirtyOp::Upsert));
        assert_eq!(mock.upserts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_flush_failure_leaves_dirty_and_records_error() {
        let mock = MockTransport::new();
        mock.fail_writes.store(true, Ordering::SeqCst);
        let core = live_core(&mock);
        let c1 = id("C1");
        core.buffer_payload(&c1, json!({"id": "C1"}));
        core.with_state(|s| s.mark_dirty(&c1, DirtyOp::Upsert));
        Arc::clone(&core).try_flush(c1.clone()).await;

        assert_eq!(core.read_state(|s| s.dirty_op(&c1)), Some(DirtyOp::Upsert));
        assert!(core.read_state(|s| s.get(&c1).unwrap().last_error.is_some()));
        // One attempt, no tight retry loop.
        assert_eq!(mock.upserts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_delete_uses_base_revision() {
        let mock = MockTransport::new();
        mock.seed(&id("C1"), 3, json!({"id": "C1"}));
        let core = live_core(&mock);
        let c1 = id("C1");
        core.with_state(|s| {
            s.set_remote_revision(&c1, 3);
            s.mark_dirty(&c1, DirtyOp::Delete);
        });
        Arc::clone(&core).try_flush(c1.clone()).await;

        assert_eq!(core.read_state(|s| s.dirty_op(&c1)), None);
        assert_eq!(core.read_state(|s| s.remote_revision(&c1)), Some(4));
        let row = mock.row(&c1).unwrap();
        assert!(row.deleted);
        assert_eq!(row.revision, 4);
    }

    #[tokio::test]
    async fn test_new_payload_mid_flight_is_not_lost() {
        let mock = MockTransport::new();
        let core = live_core(&mock);
        let c1 = id("C1");

        // Simulate the watcher replacing the payload between the send and
        // the ACK: the first flush must not retire the newer intent.
        core.buffer_payload(&c1, json!({"id": "C1", "v": 1}));
        core.with_state(|s| s.mark_dirty(&c1, DirtyOp::Upsert));
        // A fresher payload sneaks in before the flush runs its ACK path.
        // (Easiest deterministic approximation: replace after seeding the
        // generation check's snapshot by running the flush and re-queueing
        // concurrently.)
        let flusher = {
            let core = Arc::clone(&core);
            let c1 = c1.clone();
            tokio::spawn(async move { core.try_flush(c1).await })
        };
        core.buffer_payload(&c1, json!({"id": "C1", "v": 2}));
        core.with_state(|s| s.mark_dirty(&c1, DirtyOp::Upsert));
        flusher.await.unwrap();
        // Whichever interleaving happened, the latest payload ends up on
        // the server once the queue drains.
        Arc::clone(&core).try_flush(c1.clone()).await;
        let row = mock.row(&c1).unwrap();
        assert_eq!(row.data.as_ref().unwrap()["v"], 2);
        assert_eq!(core.read_state(|s| s.dirty_op(&c1)), None);
    }
}
