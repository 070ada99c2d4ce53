/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The feedback-loop breaker. Every remote-originated mutation of the
//! local conversation store runs while holding a [`MuteGuard`] for the id;
//! the change watcher checks [`MuteRegistry::is_muted`] before turning a
//! store mutation into an upload intent.
//!
//! The registry is reference-counted rather than a plain set because
//! conflict resolution holds two mutes at once (the conflict copy and the
//! original id), and they don't end at the same time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use conversation_id::ConversationId;

#[derive(Clone, Default)]
pub struct MuteRegistry {
    counts: Arc<Mutex<HashMap<ConversationId, usize>>>,
}

impl MuteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mute `id` until the returned guard is dropped. Nests.
    pub fn mute(&self, id: &ConversationId) -> MuteGuard {
        let mut counts = self.lock();
        *counts.entry(id.clone()).or_insert(0) += 1;
        MuteGuard {
            registry: self.clone(),
            id: id.clone(),
        }
    }

    pub fn is_muted(&self, id: &ConversationId) -> bool {
        self.lock().contains_key(id)
    }

    fn unmute(&self, id: &ConversationId) {
        let mut counts = self.lock();
        if let Some(count) = counts.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                counts.remove(id);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConversationId, usize>> {
        match self.counts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[must_use = "dropping the guard unmutes immediately"]
pub struct MuteGuard {
    registry: MuteRegistry,
    id: ConversationId,
}

impl Drop for MuteGuard {
    fn drop(&mut self) {
        self.registry.unmute(&self.id);
    }
}
