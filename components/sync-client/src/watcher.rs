/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The change watcher: turns local conversation-store mutations into
//! debounced upload intents. It observes the store synchronously (so the
//! mute registry can veto remote-originated mutations while they happen)
//! and defers the actual enqueue through a per-id debounce with a hard
//! max-wait, so a streaming response doesn't upload on every token but
//! also doesn't stall forever.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use conversation_id::ConversationId;
use serde_json::Value as JsonValue;

use crate::engine::SyncCore;
use crate::record;
use crate::state::DirtyOp;
use crate::store::{StoreObserver, StoreSnapshot};

#[derive(Clone, Debug)]
pub struct WatcherConfig {
    /// Quiet time after the last mutation before an intent is enqueued.
    pub debounce: Duration,
    /// Upper bound on how long an intent may keep getting deferred.
    pub max_wait: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(900),
            max_wait: Duration::from_secs(5),
        }
    }
}

struct PendingIntent {
    kind: DirtyOp,
    payload: Option<JsonValue>,
    /// When an intent of this kind was first queued; the max-wait clock.
    /// Resets when the kind flips.
    first_queued_at: Instant,
    /// Bumped on every re-queue; a timer only fires for the generation it
    /// was armed with, so re-queues implicitly cancel older timers.
    generation: u64,
}

pub(crate) struct ChangeWatcher {
    core: Arc<SyncCore>,
    config: WatcherConfig,
    runtime: tokio::runtime::Handle,
    prev: Mutex<StoreSnapshot>,
    pending: Mutex<HashMap<ConversationId, PendingIntent>>,
    next_generation: AtomicU64,
}

impl ChangeWatcher {
    /// Must be called from within a tokio runtime (the debounce timers are
    /// spawned onto it, even when mutations come from other threads).
    pub(crate) fn new(core: Arc<SyncCore>, config: WatcherConfig) -> Arc<Self> {
        let prev = core.store.snapshot();
        Arc::new(Self {
            core,
            config,
            runtime: tokio::runtime::Handle::current(),
            prev: Mutex::new(prev),
            pending: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
        })
    }

    pub(crate) fn attach(self: &Arc<Self>) {
        let watcher = Arc::clone(self);
        let observer: StoreObserver = Arc::new(move |snapshot| watcher.on_store_changed(snapshot));
        self.core.store.set_observer(Some(observer));
    }

    /// Unsubscribe and cancel all pending debounce timers.
    pub(crate) fn detach(&self) {
        self.core.store.set_observer(None);
        self.pending.lock().unwrap().clear();
    }

    fn on_store_changed(self: &Arc<Self>, next: &StoreSnapshot) {
        if self.core.is_stopped() {
            return;
        }
        let prev = {
            let mut prev = self.prev.lock().unwrap();
            std::mem::replace(&mut *prev, next.clone())
        };

        // Disappeared ids: only sync the delete if the conversation was
        // ever eligible - a placeholder that never went up mustn't push a
        // tombstone down onto other devices.
        for (id, prev_conversation) in &prev {
            if !next.contains_key(id) && record::is_sync_eligible(prev_conversation) {
                self.queue(id, DirtyOp::Delete, None);
            }
        }

        for (id, conversation) in next {
            match prev.get(id) {
                None => {
                    if record::is_sync_eligible(conversation) {
                        self.queue_upsert(id, conversation);
                    }
                }
                Some(previous) if !Arc::ptr_eq(previous, conversation) => {
                    let was_eligible = record::is_sync_eligible(previous);
                    let is_eligible = record::is_sync_eligible(conversation);
                    if was_eligible && !is_eligible {
                        // It became a placeholder (or incognito); take it
                        // off the server.
                        self.queue(id, DirtyOp::Delete, None);
                    } else if is_eligible {
                        self.queue_upsert(id, conversation);
                    }
                }
                Some(_) => {}
            }
        }
    }

    fn queue_upsert(self: &Arc<Self>, id: &ConversationId, conversation: &record::Conversation) {
        match record::sanitize(conversation) {
            Ok(payload) => self.queue(id, DirtyOp::Upsert, Some(payload)),
            Err(e) => log::warn!("couldn't build wire payload for {}: {}", id, e),
        }
    }

    fn queue(self: &Arc<Self>, id: &ConversationId, kind: DirtyOp, payload: Option<JsonValue>) {
        // The mute check happens here, synchronously inside the mutating
        // call, which is exactly when remote applies hold their guard.
        if self.core.mutes.is_muted(id) {
            log::trace!("watcher: {} is muted, ignoring {:?}", id, kind);
            return;
        }

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Instant::now();
        let delay = {
            let mut pending = self.pending.lock().unwrap();
            let entry = match pending.entry(id.clone()) {
                Entry::Occupied(occupied) => {
                    let entry = occupied.into_mut();
                    if entry.kind != kind {
                        // Last intent wins, and the max-wait clock tracks
                        // the age of the current intent kind.
                        entry.kind = kind;
                        entry.first_queued_at = now;
                    }
                    entry.payload = payload;
                    entry.generation = generation;
                    entry
                }
                Entry::Vacant(vacant) => vacant.insert(PendingIntent {
                    kind,
                    payload,
                    first_queued_at: now,
                    generation,
                }),
            };
            let elapsed = now.saturating_duration_since(entry.first_queued_at);
            self.config
                .debounce
                .min(self.config.max_wait.saturating_sub(elapsed))
        };

        let watcher = Arc::clone(self);
        let id = id.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            watcher.fire(&id, generation);
        });
    }

    fn fire(self: &Arc<Self>, id: &ConversationId, generation: u64) {
        if self.core.is_stopped() {
            return;
        }
        let intent = {
            let mut pending = self.pending.lock().unwrap();
            match pending.get(id) {
                Some(entry) if entry.generation == generation => pending.remove(id),
                // A newer mutation re-armed the timer; this firing is stale.
                _ => None,
            }
        };
        let Some(intent) = intent else { return };
        match intent.kind {
            DirtyOp::Upsert => match intent.payload {
                Some(payload) => self.core.enqueue_upsert(id.clone(), payload),
                None => log::warn!("pending upsert for {} lost its payload", id),
            },
            DirtyOp::Delete => self.core.enqueue_delete(id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Conversation, Message};
    use crate::state::MemoryStateStore;
    use crate::store::{ConversationStore, MemoryConversationStore};
    use crate::testing::MockTransport;
    use crate::transport::SyncTransport;

    fn id(s: &str) -> ConversationId {
        ConversationId::parse(s).unwrap()
    }

    fn fast_config() -> WatcherConfig {
        WatcherConfig {
            debounce: Duration::from_millis(20),
            max_wait: Duration::from_millis(200),
        }
    }

    struct Fixture {
        mock: Arc<MockTransport>,
        store: Arc<MemoryConversationStore>,
        core: Arc<SyncCore>,
        watcher: Arc<ChangeWatcher>,
    }

    fn setup() -> Fixture {
        let mock = MockTransport::new();
        let store = Arc::new(MemoryConversationStore::new());
        let core = SyncCore::new(
            Arc::clone(&store) as Arc<dyn ConversationStore>,
            Box::new(MemoryStateStore::new()),
        );
        core.transport
            .swap(Arc::clone(&mock) as Arc<dyn SyncTransport>);
        let watcher = ChangeWatcher::new(Arc::clone(&core), fast_config());
        watcher.attach();
        Fixture {
            mock,
            store,
            core,
            watcher,
        }
    }

    fn eligible(conversation_id: &str, text: &str) -> Conversation {
        let mut conversation = Conversation::new(id(conversation_id));
        conversation.messages.push(Message::new("user", text));
        conversation
    }

    async fn settle(core: &Arc<SyncCore>) {
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if core.read_state(|s| s.dirty_ids().is_empty()) {
                return;
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_conversation_is_uploaded() {
        let f = setup();
        f.store.upsert(eligible("C1", "hello"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        settle(&f.core).await;

        let row = f.mock.row(&id("C1")).expect("uploaded");
        assert_eq!(row.revision, 1);
        assert_eq!(f.core.read_state(|s| s.remote_revision(&id("C1"))), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_placeholder_is_never_uploaded() {
        let f = setup();
        f.store.upsert(Conversation::new(id("C1")));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(f.mock.row(&id("C1")).is_none());
        assert_eq!(f.core.read_state(|s| s.dirty_op(&id("C1"))), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_burst_of_edits_coalesces() {
        let f = setup();
        for i in 0..5 {
            let mut conversation = eligible("C1", &format!("token {}", i));
            conversation.updated_at = sync_types::Timestamp(1000 + i);
            f.store.upsert(conversation);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        settle(&f.core).await;

        // One upload carrying the final content, not five.
        assert_eq!(f.mock.upserts.load(Ordering::SeqCst), 1);
        let row = f.mock.row(&id("C1")).unwrap();
        assert_eq!(row.data.as_ref().unwrap()["messages"][0]["text"], "token 4");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_max_wait_guarantees_progress() {
        let f = setup();
        // Keep mutating more often than the debounce for longer than the
        // max wait: the upload must still happen.
        let start = Instant::now();
        let mut uploaded_early = false;
        for i in 0..40 {
            let mut conversation = eligible("C1", &format!("streaming {}", i));
            conversation.updated_at = sync_types::Timestamp(1000 + i);
            f.store.upsert(conversation);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if f.mock.upserts.load(Ordering::SeqCst) > 0 {
                uploaded_early = true;
                break;
            }
        }
        assert!(
            uploaded_early,
            "max wait should have forced an upload while edits kept coming (waited {:?})",
            start.elapsed()
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_delete_after_upsert_wins() {
        let f = setup();
        f.store.upsert(eligible("C1", "short-lived"));
        // Delete before the debounce fires: the single resulting intent is
        // the delete, pushed as "I believe the row is absent".
        tokio::time::sleep(Duration::from_millis(2)).await;
        f.store.delete(&id("C1"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        settle(&f.core).await;

        assert_eq!(f.mock.upserts.load(Ordering::SeqCst), 0);
        let row = f.mock.row(&id("C1")).expect("tombstone created");
        assert!(row.deleted);
        assert_eq!(row.revision, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_never_synced_placeholder_delete_is_skipped() {
        let f = setup();
        f.store.upsert(Conversation::new(id("C1")));
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.store.delete(&id("C1"));
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Nothing ever went up, so nothing comes down either.
        assert!(f.mock.row(&id("C1")).is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_becoming_ineligible_queues_delete() {
        let f = setup();
        f.store.upsert(eligible("C1", "real"));
        tokio::time::sleep(Duration::from_millis(60)).await;
        settle(&f.core).await;
        assert!(!f.mock.row(&id("C1")).unwrap().deleted);

        // The conversation turns incognito: it must come off the server.
        let mut hidden = eligible("C1", "real");
        hidden.incognito = true;
        f.store.upsert(hidden);
        tokio::time::sleep(Duration::from_millis(60)).await;
        settle(&f.core).await;
        assert!(f.mock.row(&id("C1")).unwrap().deleted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_muted_mutations_emit_nothing() {
        let f = setup();
        {
            let _guard = f.core.mutes.mute(&id("C1"));
            f.store.upsert(eligible("C1", "from remote"));
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(f.mock.row(&id("C1")).is_none());
        assert_eq!(f.core.read_state(|s| s.dirty_op(&id("C1"))), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_detach_cancels_pending_intents() {
        let f = setup();
        f.store.upsert(eligible("C1", "never sent"));
        f.watcher.detach();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(f.mock.row(&id("C1")).is_none());
    }
}
