/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! In-process change notification, scoped per user. Every accepted write
//! publishes a `ChangeEvent`; each open event stream holds a subscription.
//! This is the single-process implementation of the pub/sub seam - a
//! clustered deployment swaps in a broker behind the same three methods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use sync_types::ChangeEvent;
use tokio::sync::broadcast;

// Enough headroom that a subscriber servicing a normal event stream never
// lags; a subscriber that does lag only loses its own events.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Default)]
pub struct ChangeNotifier {
    senders: Arc<Mutex<HashMap<String, broadcast::Sender<ChangeEvent>>>>,
}

/// A live subscription. Dropping it releases the per-user channel entry
/// once the last subscriber for that user is gone.
pub struct Subscription {
    // Field order matters: the receiver must drop before the guard runs its
    // cleanup, so that `receiver_count` is already decremented.
    pub(crate) rx: broadcast::Receiver<ChangeEvent>,
    pub(crate) _guard: SubscriberGuard,
}

pub(crate) struct SubscriberGuard {
    notifier: ChangeNotifier,
    user: String,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        self.notifier.release(&self.user);
    }
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, user: &str) -> Subscription {
        let mut senders = self.lock();
        let tx = senders
            .entry(user.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let rx = tx.subscribe();
        log::debug!(
            "events: subscriber added ({} receivers)",
            tx.receiver_count()
        );
        Subscription {
            rx,
            _guard: SubscriberGuard {
                notifier: self.clone(),
                user: user.to_string(),
            },
        }
    }

    /// Publish to a user's subscribers. No subscribers is a no-op. Each
    /// subscriber has its own buffered channel, so one slow or failed
    /// subscriber cannot prevent delivery to the others.
    pub fn publish(&self, user: &str, event: ChangeEvent) {
        let mut senders = self.lock();
        if let Some(tx) = senders.get(user) {
            match tx.send(event) {
                Ok(n) => log::trace!("events: delivered to {} subscribers", n),
                Err(_) => {
                    // Every receiver has gone away since the last cleanup.
                    senders.remove(user);
                }
            }
        }
    }

    /// How many users currently have at least one subscriber. Used by
    /// tests to check the registry shrinks.
    pub fn user_count(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, user: &str) {
        let mut senders = self.lock();
        if let Some(tx) = senders.get(user) {
            if tx.receiver_count() == 0 {
                senders.remove(user);
                log::debug!("events: last subscriber gone, dropping channel");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<ChangeEvent>>> {
        match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
