/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The bootstrap/lifecycle layer: wire the watcher, pull the server's
//! state, hot-swap the transport live, reconcile persisted intents, flush,
//! then start the realtime channel. One agent per process; a second
//! `start` returns the handle of the first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use conversation_id::ConversationId;
use sync_types::ConversationEnvelope;
use url::Url;

use crate::engine::SyncCore;
use crate::realtime::{EventSource, HttpEventSource, RealtimeChannel, RealtimeConfig};
use crate::record;
use crate::state::{DirtyOp, StateStore};
use crate::store::ConversationStore;
use crate::transport::{HttpTransport, SyncTransport, TransportError};
use crate::watcher::{ChangeWatcher, WatcherConfig};

#[derive(Clone, Debug, Default)]
pub struct SyncAgentConfig {
    pub watcher: WatcherConfig,
    pub realtime: RealtimeConfig,
}

lazy_static::lazy_static! {
    static ref AGENT: Mutex<Option<SyncAgentHandle>> = Mutex::new(None);
}

pub struct SyncAgent;

impl SyncAgent {
    /// Start the agent against a live HTTP deployment. Waits for the
    /// conversation store to hydrate before doing anything else.
    pub async fn start(
        base_url: Url,
        user: impl Into<String>,
        store: Arc<dyn ConversationStore>,
        state_store: Box<dyn StateStore>,
    ) -> SyncAgentHandle {
        let user = user.into();
        let transport: Arc<dyn SyncTransport> =
            Arc::new(HttpTransport::new(base_url.clone(), user.clone()));
        let events: Option<Box<dyn EventSource>> = match HttpEventSource::new(&base_url, user) {
            Ok(source) => Some(Box::new(source)),
            Err(e) => {
                log::warn!("no realtime channel: {}", e);
                None
            }
        };
        Self::start_with(
            SyncAgentConfig::default(),
            store,
            state_store,
            transport,
            events,
        )
        .await
    }

    /// Start with explicit parts. The agent is a process-wide singleton:
    /// if one is already running, its handle is returned and the given
    /// parts are dropped.
    pub async fn start_with(
        config: SyncAgentConfig,
        store: Arc<dyn ConversationStore>,
        state_store: Box<dyn StateStore>,
        transport: Arc<dyn SyncTransport>,
        events: Option<Box<dyn EventSource>>,
    ) -> SyncAgentHandle {
        {
            let registered = AGENT.lock().unwrap();
            if let Some(existing) = registered.as_ref() {
                if !existing.is_stopped() {
                    log::info!("sync agent already running; returning existing handle");
                    return existing.clone();
                }
            }
        }
        let handle = Self::start_detached(config, store, state_store, transport, events).await;
        *AGENT.lock().unwrap() = Some(handle.clone());
        handle
    }

    /// The actual bootstrap, without singleton registration. Embedders
    /// should use [`SyncAgent::start`]; this exists so lifecycles can be
    /// tested in isolation.
    pub(crate) async fn start_detached(
        config: SyncAgentConfig,
        store: Arc<dyn ConversationStore>,
        state_store: Box<dyn StateStore>,
        transport: Arc<dyn SyncTransport>,
        events: Option<Box<dyn EventSource>>,
    ) -> SyncAgentHandle {
        store.await_hydration().await;
        let core = SyncCore::new(store, state_store);

        // The watcher starts before anything touches the network so local
        // edits queue up from the first moment; the disabled transport
        // keeps them on the device.
        let watcher = ChangeWatcher::new(Arc::clone(&core), config.watcher);
        watcher.attach();

        let mut realtime_task = None;
        match initial_pull(&core, transport.as_ref()).await {
            Ok(()) => {
                // Writes are allowed from here on.
                core.transport.swap(transport);
                reconcile_dirty_upserts(&core);
                for (id, _) in core.read_state(|s| s.dirty_ids()) {
                    core.spawn_flush(id);
                }
                if let Some(source) = events {
                    let channel =
                        RealtimeChannel::new(Arc::clone(&core), source, config.realtime);
                    realtime_task = Some(tokio::spawn(channel.run()));
                }
            }
            Err(e) => {
                // Offline start: the transport stays disabled, dirty ops
                // stay queued, and the next start gets another chance.
                log::warn!("initial pull failed, sync stays disabled: {}", e);
            }
        }

        SyncAgentHandle {
            inner: Arc::new(AgentInner {
                core,
                watcher,
                realtime_task: Mutex::new(realtime_task),
            }),
        }
    }
}

/// Sync the server's view down into the local store, without disturbing
/// anything the user has touched locally (dirty ids keep both their base
/// revision - preserving 409-on-push - and their local content).
async fn initial_pull(
    core: &Arc<SyncCore>,
    transport: &dyn SyncTransport,
) -> Result<(), TransportError> {
    // Snapshot what we believed before this pull; only ids whose listed
    // revision differs (or that we don't hold locally) are worth a GET.
    let known: HashMap<ConversationId, u64> = core.read_state(|s| {
        core.store
            .snapshot()
            .keys()
            .filter_map(|id| s.remote_revision(id).map(|rev| (id.clone(), rev)))
            .collect()
    });

    let items = transport.list_conversations().await?;
    log::debug!("initial pull: {} listed conversations", items.len());

    for item in &items {
        let id = &item.conversation_id;
        if core.read_state(|s| s.dirty_op(id).is_some()) {
            // The local edit hasn't been acknowledged; adopting the listed
            // revision here would silently erase the conflict.
            log::debug!("initial pull: {} is dirty, leaving base revision", id);
            continue;
        }
        core.with_state(|s| s.set_remote_revision(id, item.revision));
    }

    for item in items {
        let id = item.conversation_id.clone();
        if core.read_state(|s| s.dirty_op(&id).is_some()) {
            continue;
        }
        if item.deleted {
            core.accept_remote(
                &id,
                &ConversationEnvelope {
                    conversation_id: id.clone(),
                    revision: item.revision,
                    deleted: true,
                    data: None,
                },
            );
            continue;
        }
        let have_local = core.store.get(&id).is_some();
        if have_local && known.get(&id) == Some(&item.revision) {
            continue;
        }
        match transport.get_conversation(&id).await {
            Ok(envelope) => core.accept_remote(&id, &envelope),
            Err(e) => {
                log::warn!("initial pull: fetch of {} failed: {}", id, e);
                core.with_state(|s| s.set_error(&id, Some(format!("remote fetch failed: {}", e))));
            }
        }
    }
    Ok(())
}

/// Persisted dirty upserts survive restarts, but their payloads don't.
/// Rebuild them from the conversation store; an upsert whose conversation
/// is gone or no longer eligible is dropped - never turned into a delete.
fn reconcile_dirty_upserts(core: &Arc<SyncCore>) {
    for (id, op) in core.read_state(|s| s.dirty_ids()) {
        if op != DirtyOp::Upsert {
            continue;
        }
        let rebuilt = core
            .store
            .get(&id)
            .filter(|conversation| record::is_sync_eligible(conversation))
            .and_then(|conversation| match record::sanitize(&conversation) {
                Ok(payload) => Some(payload),
                Err(e) => {
                    log::warn!("couldn't rebuild payload for {}: {}", id, e);
                    None
                }
            });
        match rebuilt {
            Some(payload) => {
                core.buffer_payload(&id, payload);
            }
            None => {
                log::info!("dropping unrebuildable upsert intent for {}", id);
                core.with_state(|s| {
                    s.clear_dirty(&id);
                    s.set_error(&id, None);
                });
            }
        }
    }
}

struct AgentInner {
    core: Arc<SyncCore>,
    watcher: Arc<ChangeWatcher>,
    realtime_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SyncAgentHandle {
    inner: Arc<AgentInner>,
}

impl SyncAgentHandle {
    /// Tear the engine down: unsubscribe from the store, cancel pending
    /// debounce timers, close the realtime connection, and make any
    /// in-flight callbacks no-ops. Idempotent.
    pub fn stop(&self) {
        if self.inner.core.is_stopped() {
            return;
        }
        log::info!("stopping sync agent");
        self.inner.core.mark_stopped();
        self.inner.watcher.detach();
        if let Some(task) = self.inner.realtime_task.lock().unwrap().take() {
            task.abort();
        }
        let mut registered = AGENT.lock().unwrap();
        if let Some(existing) = registered.as_ref() {
            if Arc::ptr_eq(&existing.inner, &self.inner) {
                *registered = None;
            }
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.core.is_stopped()
    }
}

impl Drop for AgentInner {
    fn drop(&mut self) {
        if let Some(task) = self.realtime_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Conversation, Message, CONFLICT_COPY_SUFFIX};
    use crate::state::{MemoryStateStore, SyncState};
    use crate::store::MemoryConversationStore;
    use crate::testing::MockTransport;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn id(s: &str) -> ConversationId {
        ConversationId::parse(s).unwrap()
    }

    fn fast_config() -> SyncAgentConfig {
        SyncAgentConfig {
            watcher: WatcherConfig {
                debounce: Duration::from_millis(20),
                max_wait: Duration::from_millis(200),
            },
            realtime: RealtimeConfig::default(),
        }
    }

    fn eligible(conversation_id: &str, text: &str) -> Conversation {
        let mut conversation = Conversation::new(id(conversation_id));
        conversation.title = Some("Synced".into());
        conversation.messages.push(Message::new("user", text));
        conversation
    }

    /// Build a persisted state blob the way a previous session would have
    /// left it.
    fn persisted_state(entries: &[(&str, Option<u64>, Option<DirtyOp>)]) -> Box<MemoryStateStore> {
        let mut state = SyncState::new();
        for (conversation_id, revision, dirty) in entries {
            if let Some(revision) = revision {
                state.set_remote_revision(&id(conversation_id), *revision);
            }
            if let Some(op) = dirty {
                state.mark_dirty(&id(conversation_id), *op);
            }
        }
        let store = MemoryStateStore::new();
        use crate::state::StateStore;
        store.save(&state.to_blob()).unwrap();
        Box::new(store)
    }

    async fn settle(core_check: impl Fn() -> bool) {
        for _ in 0..100 {
            if core_check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_initial_pull_populates_empty_client() {
        let mock = MockTransport::new();
        mock.seed(&id("C1"), 3, json!({"id": "C1", "title": "First", "messages": [{"role": "user", "text": "hi"}], "createdAt": 1, "updatedAt": 3}));
        mock.seed_tombstone(&id("C2"), 2);

        let store = Arc::new(MemoryConversationStore::new());
        let handle = SyncAgent::start_detached(
            fast_config(),
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Box::new(MemoryStateStore::new()),
            Arc::clone(&mock) as Arc<dyn SyncTransport>,
            None,
        )
        .await;

        // The live conversation came down, the tombstone did not.
        assert_eq!(store.get(&id("C1")).unwrap().title.as_deref(), Some("First"));
        assert!(store.get(&id("C2")).is_none());
        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failed_pull_leaves_transport_disabled() {
        let mock = MockTransport::new();
        mock.fail_lists.store(true, Ordering::SeqCst);

        let store = Arc::new(MemoryConversationStore::new());
        let handle = SyncAgent::start_detached(
            fast_config(),
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Box::new(MemoryStateStore::new()),
            Arc::clone(&mock) as Arc<dyn SyncTransport>,
            None,
        )
        .await;

        // A local edit queues but never leaves the device.
        store.upsert(eligible("C1", "offline edit"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(mock.upserts.load(Ordering::SeqCst), 0);
        // The intent is waiting for a future session's pull.
        assert!(handle
            .inner
            .core
            .read_state(|s| s.dirty_op(&id("C1")).is_some()));
        handle.stop();
    }

    /// Restart reconciliation (scenario 6) flowing into the conflict copy
    /// path (scenario 4): a dirty upsert survives the restart, the list
    /// must not clobber its base revision, the push 409s, the resolver
    /// keeps both versions.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_with_dirty_upsert_resolves_conflict() {
        env_logger::try_init().ok();
        let mock = MockTransport::new();
        // Another client moved C5 to revision 4 while we were offline.
        mock.seed(&id("C5"), 4, json!({"id": "C5", "title": "Synced", "messages": [{"role": "user", "text": "theirs"}], "createdAt": 1, "updatedAt": 4}));

        // Our restart state: base revision 3, a dirty upsert, and the local
        // store still holding our unpushed edit.
        let store = Arc::new(MemoryConversationStore::new());
        store.upsert(eligible("C5", "ours"));
        let state_store = persisted_state(&[("C5", Some(3), Some(DirtyOp::Upsert))]);

        let handle = SyncAgent::start_detached(
            fast_config(),
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            state_store,
            Arc::clone(&mock) as Arc<dyn SyncTransport>,
            None,
        )
        .await;

        let core = Arc::clone(&handle.inner.core);
        settle(move || core.read_state(|s| s.dirty_ids().is_empty())).await;

        // The original id took the remote content at revision 4.
        assert_eq!(store.get(&id("C5")).unwrap().messages[0].text, "theirs");
        assert_eq!(
            handle
                .inner
                .core
                .read_state(|s| s.remote_revision(&id("C5"))),
            Some(4)
        );
        // Our edit survived under a fresh id and went up as a create.
        let snapshot = store.snapshot();
        assert_eq!(snapshot.len(), 2);
        let copy = snapshot.values().find(|c| c.id != id("C5")).unwrap();
        assert!(copy
            .title
            .as_deref()
            .unwrap()
            .ends_with(CONFLICT_COPY_SUFFIX));
        assert_eq!(mock.row(&copy.id).unwrap().revision, 1);
        assert_eq!(mock.row_count(), 2);
        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reconcile_drops_unrebuildable_upsert() {
        let mock = MockTransport::new();
        // Dirty upsert persisted, but the conversation is gone locally.
        let state_store = persisted_state(&[("ghost", None, Some(DirtyOp::Upsert))]);
        let store = Arc::new(MemoryConversationStore::new());

        let handle = SyncAgent::start_detached(
            fast_config(),
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            state_store,
            Arc::clone(&mock) as Arc<dyn SyncTransport>,
            None,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Dropped, not turned into a delete.
        assert_eq!(
            handle.inner.core.read_state(|s| s.dirty_op(&id("ghost"))),
            None
        );
        assert_eq!(mock.deletes.load(Ordering::SeqCst), 0);
        assert_eq!(mock.upserts.load(Ordering::SeqCst), 0);
        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_persisted_dirty_delete_is_flushed() {
        let mock = MockTransport::new();
        mock.seed(&id("C1"), 2, json!({"id": "C1", "messages": []}));
        let state_store = persisted_state(&[("C1", Some(2), Some(DirtyOp::Delete))]);
        let store = Arc::new(MemoryConversationStore::new());

        let handle = SyncAgent::start_detached(
            fast_config(),
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            state_store,
            Arc::clone(&mock) as Arc<dyn SyncTransport>,
            None,
        )
        .await;
        let core = Arc::clone(&handle.inner.core);
        settle(move || core.read_state(|s| s.dirty_ids().is_empty())).await;

        let row = mock.row(&id("C1")).unwrap();
        assert!(row.deleted);
        assert_eq!(row.revision, 3);
        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pull_skips_unchanged_conversations() {
        let mock = MockTransport::new();
        mock.seed(&id("C1"), 5, json!({"id": "C1", "title": "Synced", "messages": [], "createdAt": 1, "updatedAt": 5}));

        // We already hold C1 at revision 5 locally.
        let store = Arc::new(MemoryConversationStore::new());
        store.upsert(eligible("C1", "cached"));
        let state_store = persisted_state(&[("C1", Some(5), None)]);

        let handle = SyncAgent::start_detached(
            fast_config(),
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            state_store,
            Arc::clone(&mock) as Arc<dyn SyncTransport>,
            None,
        )
        .await;

        // No GET was needed, and the local (identical-revision) copy was
        // left alone.
        assert_eq!(mock.gets.load(Ordering::SeqCst), 0);
        assert_eq!(store.get(&id("C1")).unwrap().messages[0].text, "cached");
        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_singleton_returns_existing_handle() {
        let mock = MockTransport::new();
        let store = Arc::new(MemoryConversationStore::new());
        let first = SyncAgent::start_with(
            fast_config(),
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Box::new(MemoryStateStore::new()),
            Arc::clone(&mock) as Arc<dyn SyncTransport>,
            None,
        )
        .await;
        let second = SyncAgent::start_with(
            fast_config(),
            Arc::new(MemoryConversationStore::new()) as Arc<dyn ConversationStore>,
            Box::new(MemoryStateStore::new()),
            MockTransport::new() as Arc<dyn SyncTransport>,
            None,
        )
        .await;
        assert!(Arc::ptr_eq(&first.inner, &second.inner));

        first.stop();
        assert!(second.is_stopped());

        // After a stop, a fresh start builds a new agent.
        let third = SyncAgent::start_with(
            fast_config(),
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Box::new(MemoryStateStore::new()),
            Arc::clone(&mock) as Arc<dyn SyncTransport>,
            None,
        )
        .await;
        assert!(!Arc::ptr_eq(&first.inner, &third.inner));
        third.stop();
    }
}
