/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The seam to the local conversation layer. The engine never owns
//! conversation persistence - it observes mutations (synchronously, so the
//! mute registry can be consulted while a remote apply is still in
//! progress) and applies remote state back through the same interface.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use conversation_id::ConversationId;

use crate::record::Conversation;

pub type StoreSnapshot = HashMap<ConversationId, Arc<Conversation>>;

/// Called synchronously after every mutation with the new snapshot.
pub type StoreObserver = Arc<dyn Fn(&StoreSnapshot) + Send + Sync>;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Resolves once the store has loaded its conversations from
    /// persistence. The engine does nothing before this. The default is
    /// for stores that are ready the moment they're constructed.
    async fn await_hydration(&self) {}

    fn snapshot(&self) -> StoreSnapshot;

    fn get(&self, id: &ConversationId) -> Option<Arc<Conversation>>;

    /// Insert or replace a conversation. Used both by the embedding app
    /// for local edits and by the engine for remote applies - the engine's
    /// applies run under mute, which is how the watcher tells them apart.
    fn upsert(&self, conversation: Conversation);

    /// Remove a conversation. A no-op when the id is absent.
    fn delete(&self, id: &ConversationId);

    /// Install (or clear) the mutation observer. At most one observer is
    /// active; it MUST be invoked synchronously from the mutating call, on
    /// the mutating task, or the mute registry cannot suppress feedback.
    fn set_observer(&self, observer: Option<StoreObserver>);
}

/// An in-memory store: the default for embedders that keep conversations
/// in their own state layer, and the store the engine tests run against.
#[derive(Default)]
pub struct MemoryConversationStore {
    conversations: Mutex<StoreSnapshot>,
    observer: Mutex<Option<StoreObserver>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, snapshot: StoreSnapshot) {
        // Clone the observer out so the mutating call doesn't hold the
        // observer lock while the watcher runs.
        let observer = self.observer.lock().unwrap().clone();
        if let Some(observer) = observer {
            observer(&snapshot);
        }
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    fn snapshot(&self) -> StoreSnapshot {
        self.conversations.lock().unwrap().clone()
    }

    fn get(&self, id: &ConversationId) -> Option<Arc<Conversation>> {
        self.conversations.lock().unwrap().get(id).cloned()
    }

    fn upsert(&self, conversation: Conversation) {
        let snapshot = {
            let mut conversations = self.conversations.lock().unwrap();
            conversations.insert(conversation.id.clone(), Arc::new(conversation));
            conversations.clone()
        };
        self.notify(snapshot);
    }

    fn delete(&self, id: &ConversationId) {
        let snapshot = {
            let mut conversations = self.conversations.lock().unwrap();
            if conversations.remove(id).is_none() {
                return;
            }
            conversations.clone()
        };
        self.notify(snapshot);
    }

    fn set_observer(&self, observer: Option<StoreObserver>) {
        *self.observer.lock().unwrap() = observer;
    }
}
